//! Debugger-visible structures of the JIT compilation interface.
//!
//! GDB and LLDB look up `__jit_debug_descriptor` by name, read the entry list
//! hanging off it, and set a breakpoint on `__jit_debug_register_code`. Every
//! type here mirrors the C declarations field for field.

use std::arch::asm;
use std::mem::{offset_of, size_of};
use std::ptr;

/// Descriptor version understood by debuggers.
pub const JIT_DESCRIPTOR_VERSION: u32 = 1;

/// Action codes stored in [`JitDescriptor::action_flag`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitAction {
    NoAction = 0,
    Register = 1,
    Unregister = 2,
}

impl JitAction {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::NoAction,
            1 => Self::Register,
            2 => Self::Unregister,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct JitCodeEntry {
    pub(crate) next_entry: *mut JitCodeEntry,
    pub(crate) prev_entry: *mut JitCodeEntry,
    pub(crate) symfile_addr: *const u8,
    pub(crate) symfile_size: u64,
}

impl JitCodeEntry {
    pub fn next(&self) -> *const JitCodeEntry {
        self.next_entry
    }
    pub fn prev(&self) -> *const JitCodeEntry {
        self.prev_entry
    }
    /// Address and length of the symbol file this entry describes.
    pub fn symfile(&self) -> (*const u8, u64) {
        (self.symfile_addr, self.symfile_size)
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct JitDescriptor {
    pub(crate) version: u32,
    // Kept as a raw u32 so the field width is explicit.
    pub(crate) action_flag: u32,
    pub(crate) relevant_entry: *mut JitCodeEntry,
    pub(crate) first_entry: *mut JitCodeEntry,
}

impl JitDescriptor {
    pub const fn new() -> Self {
        Self {
            version: JIT_DESCRIPTOR_VERSION,
            action_flag: JitAction::NoAction as u32,
            relevant_entry: ptr::null_mut(),
            first_entry: ptr::null_mut(),
        }
    }
    pub fn version(&self) -> u32 {
        self.version
    }
    /// `None` if the flag holds a code outside the protocol.
    pub fn action(&self) -> Option<JitAction> {
        JitAction::from_raw(self.action_flag)
    }
    pub fn relevant_entry(&self) -> *const JitCodeEntry {
        self.relevant_entry
    }
    pub fn first_entry(&self) -> *const JitCodeEntry {
        self.first_entry
    }
}

impl Default for JitDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

const PTR: usize = size_of::<usize>();
const _: () = {
    assert!(offset_of!(JitCodeEntry, next_entry) == 0);
    assert!(offset_of!(JitCodeEntry, prev_entry) == PTR);
    assert!(offset_of!(JitCodeEntry, symfile_addr) == 2 * PTR);
    assert!(offset_of!(JitCodeEntry, symfile_size) == 3 * PTR);
    assert!(size_of::<JitCodeEntry>() == 3 * PTR + 8);

    assert!(offset_of!(JitDescriptor, version) == 0);
    assert!(offset_of!(JitDescriptor, action_flag) == 4);
    assert!(offset_of!(JitDescriptor, relevant_entry) == 8);
    assert!(offset_of!(JitDescriptor, first_entry) == 8 + PTR);
    assert!(size_of::<JitDescriptor>() == 8 + 2 * PTR);
};

// The version is filled in statically: a debugger may read it before main runs.
// Only `GdbJitInterface` touches this, always under the global registry lock.
#[no_mangle]
#[used]
pub(crate) static mut __jit_debug_descriptor: JitDescriptor = JitDescriptor::new();

/// Breakpoint target for attached debuggers.
#[no_mangle]
#[inline(never)]
pub extern "C" fn __jit_debug_register_code() {
    // An asm block with side effects keeps both the body and every call site.
    unsafe { asm!("", options(nostack, preserves_flags)) };
}
