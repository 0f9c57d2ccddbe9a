//! Slot arena backing the entry list.
//!
//! Each occupied slot owns one heap-allocated [`JitCodeEntry`] whose address
//! never changes while it is registered. The list order lives in the slots as
//! plain indices; the raw `next_entry`/`prev_entry` pointers a debugger walks
//! are rewritten from those indices whenever a slot's neighbours change.

use std::alloc::{self, Layout};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

use crate::abi::JitCodeEntry;
use crate::error::RegisterError;

/// Opaque reference to a registered code entry.
///
/// Handles are plain values: copying one does not keep the entry alive, and a
/// handle outliving its entry is detected through the slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    registry: u32,
    index: u32,
    generation: u32,
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entry #{}.{} of registry {}",
            self.index, self.generation, self.registry
        )
    }
}

/// Owning pointer to a [`JitCodeEntry`] allocated outside the arena vector,
/// so growing the vector never moves an entry a debugger may be looking at.
pub(crate) struct RawEntry(NonNull<JitCodeEntry>);

// SAFETY: the entry is only mutated through its owning slot, and the registry
// holding it is only reachable behind a lock.
unsafe impl Send for RawEntry {}

impl RawEntry {
    /// Allocates an unlinked entry, reporting allocation failure instead of
    /// aborting.
    pub(crate) fn try_new(
        symfile_addr: *const u8,
        symfile_size: u64,
    ) -> Result<Self, RegisterError> {
        let layout = Layout::new::<JitCodeEntry>();
        // SAFETY: JitCodeEntry is not zero-sized.
        let ptr = unsafe { alloc::alloc(layout) }.cast::<JitCodeEntry>();
        let ptr = NonNull::new(ptr).ok_or(RegisterError::OutOfMemory {
            bytes: layout.size(),
        })?;
        // SAFETY: freshly allocated with the layout of JitCodeEntry.
        unsafe {
            ptr.as_ptr().write(JitCodeEntry {
                next_entry: ptr::null_mut(),
                prev_entry: ptr::null_mut(),
                symfile_addr,
                symfile_size,
            })
        };
        Ok(Self(ptr))
    }

    pub(crate) fn as_ptr(&self) -> *mut JitCodeEntry {
        self.0.as_ptr()
    }

    pub(crate) fn get(&self) -> &JitCodeEntry {
        // SAFETY: owned, initialised, and only written through `&mut self`.
        unsafe { self.0.as_ref() }
    }

    fn set_links(&mut self, prev: *mut JitCodeEntry, next: *mut JitCodeEntry) {
        // SAFETY: as in `get`.
        let entry = unsafe { self.0.as_mut() };
        entry.prev_entry = prev;
        entry.next_entry = next;
    }
}

impl Drop for RawEntry {
    fn drop(&mut self) {
        // SAFETY: allocated in `try_new` with this layout; JitCodeEntry has no
        // drop glue.
        unsafe { alloc::dealloc(self.0.as_ptr().cast(), Layout::new::<JitCodeEntry>()) };
    }
}

struct Node {
    raw: RawEntry,
    prev: Option<u32>,
    next: Option<u32>,
}

enum Slot {
    Occupied { generation: u32, node: Node },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub(crate) enum Lookup {
    Found(u32),
    Foreign,
    Stale,
}

pub(crate) struct Arena {
    id: u32,
    slots: Vec<Slot>,
    free_head: Option<u32>,
    head: Option<u32>,
    len: usize,
}

impl Arena {
    pub(crate) const fn new(id: u32) -> Self {
        Self {
            id,
            slots: Vec::new(),
            free_head: None,
            head: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Makes sure the next [`Arena::push_front`] cannot allocate.
    pub(crate) fn reserve(&mut self) -> Result<(), RegisterError> {
        if self.free_head.is_some() {
            return Ok(());
        }
        if self.slots.len() >= u32::MAX as usize {
            return Err(RegisterError::CapacityExhausted);
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| RegisterError::OutOfMemory {
                bytes: mem::size_of::<Slot>(),
            })
    }

    /// Links `raw` in as the new list head. Call [`Arena::reserve`] first.
    pub(crate) fn push_front(&mut self, raw: RawEntry) -> EntryHandle {
        let node = Node {
            raw,
            prev: None,
            next: self.head,
        };
        let (index, generation) = match self.free_head {
            Some(index) => {
                let Slot::Vacant {
                    generation,
                    next_free,
                } = self.slots[index as usize]
                else {
                    unreachable!("free list points at occupied slot {index}");
                };
                self.free_head = next_free;
                self.slots[index as usize] = Slot::Occupied { generation, node };
                (index, generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    node,
                });
                (index, 0)
            }
        };

        if let Some(old_head) = self.head {
            self.node_mut(old_head).prev = Some(index);
            self.sync_links(old_head);
        }
        self.head = Some(index);
        self.sync_links(index);
        self.len += 1;

        EntryHandle {
            registry: self.id,
            index,
            generation,
        }
    }

    pub(crate) fn lookup(&self, handle: EntryHandle) -> Lookup {
        if handle.registry != self.id {
            return Lookup::Foreign;
        }
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, .. }) if *generation == handle.generation => {
                Lookup::Found(handle.index)
            }
            _ => Lookup::Stale,
        }
    }

    pub(crate) fn is_unlinked_head(&self, index: u32) -> bool {
        self.node(index).prev.is_none()
    }

    pub(crate) fn head(&self) -> Option<u32> {
        self.head
    }

    pub(crate) fn head_ptr(&self) -> *mut JitCodeEntry {
        self.ptr(self.head)
    }

    pub(crate) fn entry_ptr(&self, index: u32) -> *mut JitCodeEntry {
        self.node(index).raw.as_ptr()
    }

    /// Closes the gap around `index` and clears its own links. The entry stays
    /// allocated until [`Arena::remove`].
    pub(crate) fn unlink(&mut self, index: u32) {
        let node = self.node_mut(index);
        let (prev, next) = (node.prev.take(), node.next.take());

        match prev {
            Some(prev) => {
                self.node_mut(prev).next = next;
                self.sync_links(prev);
            }
            None => self.head = next,
        }
        if let Some(next) = next {
            self.node_mut(next).prev = prev;
            self.sync_links(next);
        }
        self.sync_links(index);
        self.len -= 1;
    }

    /// Frees the slot of an unlinked entry and hands back its allocation.
    pub(crate) fn remove(&mut self, index: u32) -> RawEntry {
        let generation = match &self.slots[index as usize] {
            Slot::Occupied { generation, .. } => generation.wrapping_add(1),
            Slot::Vacant { .. } => unreachable!("removing vacant slot {index}"),
        };
        let vacant = Slot::Vacant {
            generation,
            next_free: self.free_head,
        };
        self.free_head = Some(index);
        match mem::replace(&mut self.slots[index as usize], vacant) {
            Slot::Occupied { node, .. } => node.raw,
            Slot::Vacant { .. } => unreachable!(),
        }
    }

    /// Walks the list in order, head first.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            arena: self,
            cursor: self.head,
        }
    }

    fn handle(&self, index: u32) -> EntryHandle {
        let generation = match &self.slots[index as usize] {
            Slot::Occupied { generation, .. } => *generation,
            Slot::Vacant { .. } => unreachable!("handle for vacant slot {index}"),
        };
        EntryHandle {
            registry: self.id,
            index,
            generation,
        }
    }

    fn ptr(&self, index: Option<u32>) -> *mut JitCodeEntry {
        index.map_or(ptr::null_mut(), |index| self.entry_ptr(index))
    }

    /// Rewrites the raw links of `index` from its slot links.
    fn sync_links(&mut self, index: u32) {
        let node = self.node(index);
        let (prev, next) = (self.ptr(node.prev), self.ptr(node.next));
        self.node_mut(index).raw.set_links(prev, next);
    }

    fn node(&self, index: u32) -> &Node {
        match &self.slots[index as usize] {
            Slot::Occupied { node, .. } => node,
            Slot::Vacant { .. } => unreachable!("link to vacant slot {index}"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node {
        match &mut self.slots[index as usize] {
            Slot::Occupied { node, .. } => node,
            Slot::Vacant { .. } => unreachable!("link to vacant slot {index}"),
        }
    }
}

pub(crate) struct Iter<'a> {
    arena: &'a Arena,
    cursor: Option<u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (EntryHandle, &'a JitCodeEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.arena.node(index);
        self.cursor = node.next;
        Some((self.arena.handle(index), node.raw.get()))
    }
}
