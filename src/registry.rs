//! The registration list and its mutation protocol.
//!
//! A [`Registry`] owns the code entries and keeps the debugger-visible
//! descriptor in step with them. Every mutation follows the same order: relink
//! the list, update the descriptor, notify, and only then free anything.

use std::process;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, trace, warn};

use crate::abi::{
    JitAction, JitCodeEntry, JitDescriptor, __jit_debug_descriptor, __jit_debug_register_code,
};
use crate::arena::{Arena, EntryHandle, Lookup, RawEntry};
use crate::error::{Corruption, RegisterError, UnregisterError};

/// Where a registry publishes its descriptor and how it announces changes.
///
/// # Safety
///
/// `descriptor` must return the same pointer for as long as the implementor
/// lives. It must point to an initialised [`JitDescriptor`] that nothing but
/// the owning registry writes to.
pub unsafe trait DebuggerInterface {
    fn descriptor(&self) -> NonNull<JitDescriptor>;

    /// Called exactly once per register/unregister, after the descriptor
    /// describes that transition.
    fn notify(&mut self);
}

/// The exported `__jit_debug_descriptor` / `__jit_debug_register_code` pair.
///
/// Only the process-wide registry holds one.
#[derive(Debug)]
pub struct GdbJitInterface {
    _private: (),
}

// SAFETY: the static lives for the whole process and is only written by the
// global registry, under its lock.
unsafe impl DebuggerInterface for GdbJitInterface {
    fn descriptor(&self) -> NonNull<JitDescriptor> {
        // SAFETY: the address of a static is never null.
        unsafe { NonNull::new_unchecked(ptr::addr_of_mut!(__jit_debug_descriptor)) }
    }

    fn notify(&mut self) {
        __jit_debug_register_code();
    }
}

const GLOBAL_ID: u32 = 0;
static NEXT_REGISTRY_ID: AtomicU32 = AtomicU32::new(GLOBAL_ID + 1);

/// Created with the process, never torn down.
static GLOBAL: Mutex<Registry<GdbJitInterface>> = Mutex::new(Registry {
    arena: Arena::new(GLOBAL_ID),
    interface: GdbJitInterface { _private: () },
    verify: cfg!(debug_assertions),
});

/// Locks the registry behind the exported debugger symbols.
///
/// Holding the guard serialises every register and unregister in the process,
/// including the notification itself.
pub fn lock_global() -> MutexGuard<'static, Registry<GdbJitInterface>> {
    // A panic while holding the lock cannot leave the list half-linked: the
    // only panics in the mutation paths are unreachable index checks.
    GLOBAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registers a symbol file with the process-wide registry.
///
/// # Safety
///
/// `symfile_size` bytes at `symfile_addr` must stay valid and unchanged until
/// the returned handle is passed to [`unregister`].
pub unsafe fn register(
    symfile_addr: *const u8,
    symfile_size: u64,
) -> Result<EntryHandle, RegisterError> {
    unsafe { lock_global().register(symfile_addr, symfile_size) }
}

/// Unregisters an entry from the process-wide registry.
pub fn unregister(handle: EntryHandle) -> Result<(), UnregisterError> {
    lock_global().unregister(handle)
}

/// A registered entry as seen from the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub handle: EntryHandle,
    pub symfile_addr: *const u8,
    pub symfile_size: u64,
}

pub struct Registry<I: DebuggerInterface> {
    arena: Arena,
    interface: I,
    verify: bool,
}

impl<I: DebuggerInterface> Registry<I> {
    /// Builds a registry publishing through `interface`, whose descriptor must
    /// start out empty.
    pub fn with_interface(interface: I) -> Self {
        Self {
            arena: Arena::new(NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed)),
            interface,
            verify: cfg!(debug_assertions),
        }
    }

    /// Whether the list is walked and checked before every notification.
    pub fn verifies(&self) -> bool {
        self.verify
    }

    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn interface(&self) -> &I {
        &self.interface
    }

    pub fn descriptor(&self) -> &JitDescriptor {
        // SAFETY: guaranteed valid by the DebuggerInterface contract.
        unsafe { self.interface.descriptor().as_ref() }
    }

    fn descriptor_mut(&mut self) -> &mut JitDescriptor {
        // SAFETY: as above, and this registry is the only writer.
        unsafe { self.interface.descriptor().as_mut() }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }

    pub fn contains(&self, handle: EntryHandle) -> bool {
        matches!(self.arena.lookup(handle), Lookup::Found(_))
    }

    /// Registered entries, most recent first.
    pub fn iter(&self) -> impl Iterator<Item = EntryInfo> + '_ {
        self.arena.iter().map(|(handle, entry)| {
            let (symfile_addr, symfile_size) = entry.symfile();
            EntryInfo {
                handle,
                symfile_addr,
                symfile_size,
            }
        })
    }

    /// Adds a code entry for the symbol file at the head of the list and
    /// notifies the debugger.
    ///
    /// On error nothing is linked and the debugger is not notified.
    ///
    /// # Safety
    ///
    /// `symfile_size` bytes at `symfile_addr` must stay valid and unchanged
    /// until the returned handle is unregistered.
    pub unsafe fn register(
        &mut self,
        symfile_addr: *const u8,
        symfile_size: u64,
    ) -> Result<EntryHandle, RegisterError> {
        self.arena.reserve()?;
        let raw = RawEntry::try_new(symfile_addr, symfile_size)?;
        let handle = self.arena.push_front(raw);

        let entry = self.arena.head_ptr();
        let desc = self.descriptor_mut();
        desc.first_entry = entry;
        desc.relevant_entry = entry;
        desc.action_flag = JitAction::Register as u32;

        self.verify_or_abort();
        trace!(%handle, ?entry, "notifying debugger of registration");
        self.interface.notify();

        debug!(
            %handle,
            ?symfile_addr,
            symfile_size,
            len = self.arena.len(),
            "registered code entry"
        );
        Ok(handle)
    }

    /// Safe variant of [`Registry::register`] for buffers that are never freed.
    pub fn register_static(
        &mut self,
        symfile: &'static [u8],
    ) -> Result<EntryHandle, RegisterError> {
        // SAFETY: the buffer lives forever and cannot be mutated.
        unsafe { self.register(symfile.as_ptr(), symfile.len() as u64) }
    }

    /// Removes an entry and notifies the debugger, then frees the entry.
    ///
    /// Handles not issued by this registry, or already unregistered, are
    /// rejected before anything changes. If the list itself turns out to be
    /// inconsistent the process is aborted, since a debugger may be reading it.
    pub fn unregister(&mut self, handle: EntryHandle) -> Result<(), UnregisterError> {
        let index = match self.arena.lookup(handle) {
            Lookup::Found(index) => index,
            Lookup::Foreign => {
                warn!(%handle, "refusing to unregister foreign handle");
                return Err(UnregisterError::ForeignHandle(handle));
            }
            Lookup::Stale => {
                warn!(%handle, "refusing to unregister stale handle");
                return Err(UnregisterError::StaleHandle(handle));
            }
        };

        let entry = self.arena.entry_ptr(index);
        if self.arena.is_unlinked_head(index) {
            let head = self.descriptor().first_entry;
            if head != entry || self.arena.head() != Some(index) {
                fatal(Corruption::HeadMismatch {
                    entry: entry as usize,
                    head: head as usize,
                });
            }
        }

        self.arena.unlink(index);
        let head = self.arena.head_ptr();
        let desc = self.descriptor_mut();
        desc.first_entry = head;
        desc.relevant_entry = entry;
        desc.action_flag = JitAction::Unregister as u32;

        self.verify_or_abort();
        trace!(%handle, ?entry, "notifying debugger of unregistration");
        self.interface.notify();

        drop(self.arena.remove(index));
        debug!(%handle, len = self.arena.len(), "unregistered code entry");
        Ok(())
    }

    /// Walks the debugger-visible list and checks it against the entries this
    /// registry owns. Returns the list length.
    pub fn check_consistency(&self) -> Result<usize, Corruption> {
        let mut cursor = self.descriptor().first_entry();
        let mut prev: *const JitCodeEntry = ptr::null();
        let mut found = 0;

        for (_, entry) in self.arena.iter() {
            let expected: *const JitCodeEntry = entry;
            if cursor.is_null() {
                return Err(Corruption::LengthMismatch {
                    found,
                    expected: self.arena.len(),
                });
            }
            if cursor != expected {
                return Err(Corruption::UnknownEntry {
                    entry: cursor as usize,
                });
            }
            if entry.prev() != prev {
                return Err(Corruption::BrokenBackLink {
                    entry: expected as usize,
                    found: entry.prev() as usize,
                    expected: prev as usize,
                });
            }
            prev = expected;
            cursor = entry.next();
            found += 1;
        }

        if !cursor.is_null() {
            return Err(Corruption::UnknownEntry {
                entry: cursor as usize,
            });
        }
        if found != self.arena.len() {
            return Err(Corruption::LengthMismatch {
                found,
                expected: self.arena.len(),
            });
        }
        Ok(found)
    }

    fn verify_or_abort(&self) {
        if self.verify {
            if let Err(corruption) = self.check_consistency() {
                fatal(corruption);
            }
        }
    }
}

fn fatal(corruption: Corruption) -> ! {
    error!(%corruption, "JIT code entry list is corrupted, aborting");
    process::abort();
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::process::{Command, Stdio};

    use proptest::prelude::*;

    use super::*;

    /// Snapshot of what a debugger stopped at the hook would see.
    #[derive(Debug, Clone, PartialEq)]
    struct Event {
        action: Option<JitAction>,
        relevant: *const JitCodeEntry,
        relevant_size: u64,
        list: Vec<*const JitCodeEntry>,
    }

    struct Recording {
        descriptor: NonNull<JitDescriptor>,
        events: Vec<Event>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                descriptor: NonNull::from(Box::leak(Box::<JitDescriptor>::default())),
                events: Vec::new(),
            }
        }
    }

    impl Drop for Recording {
        fn drop(&mut self) {
            drop(unsafe { Box::from_raw(self.descriptor.as_ptr()) });
        }
    }

    unsafe impl DebuggerInterface for Recording {
        fn descriptor(&self) -> NonNull<JitDescriptor> {
            self.descriptor
        }

        fn notify(&mut self) {
            let desc = unsafe { self.descriptor.as_ref() };
            let mut list = Vec::new();
            let mut prev: *const JitCodeEntry = ptr::null();
            let mut cursor = desc.first_entry();
            while !cursor.is_null() {
                assert!(list.len() < 10_000, "cycle in entry list");
                let entry = unsafe { &*cursor };
                assert_eq!(entry.prev(), prev, "broken back link");
                list.push(cursor);
                prev = cursor;
                cursor = entry.next();
            }
            let relevant = desc.relevant_entry();
            let relevant_size = unsafe { (*relevant).symfile().1 };
            self.events.push(Event {
                action: desc.action(),
                relevant,
                relevant_size,
                list,
            });
        }
    }

    fn registry() -> Registry<Recording> {
        let mut registry = Registry::with_interface(Recording::new());
        registry.set_verify(true);
        registry
    }

    fn sizes<I: DebuggerInterface>(registry: &Registry<I>) -> Vec<u64> {
        registry.iter().map(|e| e.symfile_size).collect()
    }

    fn last(registry: &Registry<Recording>) -> &Event {
        registry.interface().events.last().unwrap()
    }

    static BUF1: [u8; 64] = [1; 64];
    static BUF2: [u8; 128] = [2; 128];
    static BUF3: [u8; 32] = [3; 32];

    #[test]
    fn register_and_unregister_walkthrough() {
        let mut registry = registry();

        let e1 = registry.register_static(&BUF1).unwrap();
        let e1_ptr = registry.descriptor().first_entry();
        assert_eq!(sizes(&registry), [64]);
        assert_eq!(registry.descriptor().action(), Some(JitAction::Register));
        assert_eq!(registry.descriptor().relevant_entry(), e1_ptr);
        assert_eq!(unsafe { (*e1_ptr).symfile() }, (BUF1.as_ptr(), 64));

        let e2 = registry.register_static(&BUF2).unwrap();
        let e2_ptr = registry.descriptor().first_entry();
        assert_eq!(sizes(&registry), [128, 64]);
        assert_ne!(e1_ptr, e2_ptr);

        registry.unregister(e1).unwrap();
        assert_eq!(sizes(&registry), [128]);
        assert_eq!(registry.descriptor().first_entry(), e2_ptr);
        assert!(unsafe { (*e2_ptr).prev() }.is_null());
        assert!(unsafe { (*e2_ptr).next() }.is_null());
        assert_eq!(registry.descriptor().action(), Some(JitAction::Unregister));
        assert_eq!(registry.descriptor().relevant_entry(), e1_ptr);
        assert_eq!(last(&registry).relevant_size, 64);

        registry.unregister(e2).unwrap();
        assert!(registry.is_empty());
        assert!(registry.descriptor().first_entry().is_null());
        assert!(last(&registry).list.is_empty());
        assert_eq!(last(&registry).relevant_size, 128);
    }

    #[test]
    fn hook_fires_once_per_transition() {
        let mut registry = registry();
        let a = registry.register_static(&BUF1).unwrap();
        let b = registry.register_static(&BUF2).unwrap();
        registry.unregister(a).unwrap();
        registry.unregister(b).unwrap();

        let actions: Vec<_> = registry
            .interface()
            .events
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            [
                Some(JitAction::Register),
                Some(JitAction::Register),
                Some(JitAction::Unregister),
                Some(JitAction::Unregister),
            ]
        );

        let events = &registry.interface().events;
        // The registered entry is the head it was linked in as.
        assert_eq!(events[0].relevant, events[0].list[0]);
        assert_eq!(events[1].relevant, events[1].list[0]);
        // The unregistered entry is no longer reachable when the hook fires.
        assert_eq!(events[2].relevant, events[0].relevant);
        assert!(!events[2].list.contains(&events[2].relevant));
        assert_eq!(events[2].list, [events[1].relevant]);
    }

    #[test]
    fn register_unregister_pair_restores_shape() {
        let mut registry = registry();
        registry.register_static(&BUF1).unwrap();
        registry.register_static(&BUF2).unwrap();
        let head = registry.descriptor().first_entry();
        let before = sizes(&registry);

        let extra = registry.register_static(&BUF3).unwrap();
        registry.unregister(extra).unwrap();

        assert_eq!(registry.descriptor().first_entry(), head);
        assert_eq!(sizes(&registry), before);
        assert!(unsafe { (*head).prev() }.is_null());
    }

    #[test]
    fn out_of_order_unregistration() {
        let mut registry = registry();
        let a = registry.register_static(&BUF1).unwrap();
        let b = registry.register_static(&BUF2).unwrap();
        let c = registry.register_static(&BUF3).unwrap();
        assert_eq!(sizes(&registry), [32, 128, 64]);

        registry.unregister(b).unwrap();
        assert_eq!(sizes(&registry), [32, 64]);
        assert_eq!(registry.check_consistency(), Ok(2));

        registry.unregister(a).unwrap();
        assert_eq!(sizes(&registry), [32]);
        assert_eq!(registry.check_consistency(), Ok(1));

        registry.unregister(c).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.check_consistency(), Ok(0));
        assert_eq!(registry.interface().events.len(), 6);
    }

    #[test]
    fn double_unregister_is_rejected_without_side_effects() {
        let mut registry = registry();
        let keep = registry.register_static(&BUF1).unwrap();
        let gone = registry.register_static(&BUF2).unwrap();
        registry.unregister(gone).unwrap();

        let events = registry.interface().events.len();
        assert_eq!(registry.unregister(gone), Err(UnregisterError::StaleHandle(gone)));
        assert_eq!(registry.interface().events.len(), events);
        assert_eq!(sizes(&registry), [64]);
        assert!(registry.contains(keep));
        assert!(!registry.contains(gone));
    }

    #[test]
    fn stale_handle_stays_stale_after_slot_reuse() {
        let mut registry = registry();
        let old = registry.register_static(&BUF1).unwrap();
        registry.unregister(old).unwrap();
        let new = registry.register_static(&BUF2).unwrap();

        assert_eq!(registry.unregister(old), Err(UnregisterError::StaleHandle(old)));
        assert!(registry.contains(new));
        assert_eq!(sizes(&registry), [128]);
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut one = registry();
        let mut two = registry();
        let handle = one.register_static(&BUF1).unwrap();

        assert_eq!(two.unregister(handle), Err(UnregisterError::ForeignHandle(handle)));
        assert!(two.interface().events.is_empty());
        assert!(one.contains(handle));
    }

    #[test]
    fn empty_symbol_file_registers() {
        let mut registry = registry();
        let handle = registry.register_static(&[]).unwrap();
        assert_eq!(sizes(&registry), [0]);
        registry.unregister(handle).unwrap();
        assert_eq!(last(&registry).relevant_size, 0);
    }

    #[test]
    fn descriptor_keeps_last_action_until_next_call() {
        let mut registry = registry();
        let a = registry.register_static(&BUF1).unwrap();
        let relevant = registry.descriptor().relevant_entry();
        let _ = registry.unregister(a);
        let _ = registry.unregister(a);
        assert_eq!(registry.descriptor().action(), Some(JitAction::Unregister));
        assert_eq!(registry.descriptor().relevant_entry(), relevant);
        assert_eq!(registry.descriptor().version(), 1);
    }

    #[test]
    fn consistency_check_spots_tampered_links() {
        let mut registry = registry();
        registry.register_static(&BUF1).unwrap();
        registry.register_static(&BUF2).unwrap();
        let head = registry.descriptor().first_entry().cast_mut();
        let second = unsafe { (*head).next_entry };

        unsafe { (*second).prev_entry = second };
        assert_eq!(
            registry.check_consistency(),
            Err(Corruption::BrokenBackLink {
                entry: second as usize,
                found: second as usize,
                expected: head as usize,
            })
        );
        unsafe { (*second).prev_entry = head };

        registry.descriptor_mut().first_entry = second;
        assert_eq!(
            registry.check_consistency(),
            Err(Corruption::UnknownEntry {
                entry: second as usize
            })
        );
        registry.descriptor_mut().first_entry = head;
        assert_eq!(registry.check_consistency(), Ok(2));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(usize),
        Unregister(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            2 => (0..64usize).prop_map(Op::Register),
            1 => any::<usize>().prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn random_sequences_keep_list_consistent(ops in prop::collection::vec(op(), 0..256)) {
            let mut registry = registry();
            let mut live: Vec<EntryHandle> = Vec::new();
            let mut notifications = 0;

            for step in ops {
                match step {
                    Op::Register(len) => {
                        live.push(registry.register_static(&BUF1[..len]).unwrap());
                    }
                    Op::Unregister(_) if live.is_empty() => continue,
                    Op::Unregister(pick) => {
                        let handle = live.swap_remove(pick % live.len());
                        registry.unregister(handle).unwrap();
                    }
                }
                notifications += 1;

                prop_assert_eq!(registry.check_consistency(), Ok(live.len()));
                prop_assert_eq!(last(&registry).list.len(), live.len());
                prop_assert_eq!(registry.interface().events.len(), notifications);
            }

            for handle in live.drain(..) {
                registry.unregister(handle).unwrap();
                notifications += 1;
            }
            prop_assert!(registry.descriptor().first_entry().is_null());
            prop_assert_eq!(registry.interface().events.len(), notifications);
        }
    }

    const HEAD_MISMATCH_CHILD: &str = "JITREG_HEAD_MISMATCH_CHILD";

    #[test]
    fn head_mismatch_aborts() {
        if env::var_os(HEAD_MISMATCH_CHILD).is_some() {
            let mut registry = registry();
            registry.register_static(&BUF1).unwrap();
            let head = registry.register_static(&BUF2).unwrap();
            let head_ptr = registry.descriptor().first_entry().cast_mut();
            registry.descriptor_mut().first_entry = unsafe { (*head_ptr).next_entry };
            // Must not return: the descriptor no longer names the real head.
            let _ = registry.unregister(head);
            return;
        }

        let status = Command::new(env::current_exe().unwrap())
            .args(["--exact", "registry::tests::head_mismatch_aborts"])
            .env(HEAD_MISMATCH_CHILD, "1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(6));
        }
    }
}
