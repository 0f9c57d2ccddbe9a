//! Registration of JIT-compiled code with native debuggers.
//!
//! Implements the process side of the GDB JIT compilation interface, which
//! LLDB understands as well: the exported `__jit_debug_descriptor` holds a
//! doubly linked list of symbol files, and `__jit_debug_register_code` is
//! called after every change so a debugger breakpointed there can pick the
//! change up.
//!
//! Producing the symbol files (usually small in-memory ELF objects) is up to
//! the code emitter. It registers one per compiled unit once the code is
//! executable and unregisters it right before the code is unmapped:
//!
//! ```no_run
//! use jitreg::{Config, DebugInfoInstaller};
//!
//! # fn emit_object() -> Vec<u8> { Vec::new() }
//! let installer = DebugInfoInstaller::new(Config::default());
//! if let Some(mut registration) = installer.install(emit_object()) {
//!     registration.activate()?;
//!     // ... run the code ...
//!     registration.release()?;
//! }
//! # Ok::<(), jitreg::InstallError>(())
//! ```

pub mod abi;
mod arena;
pub mod config;
pub mod error;
pub mod installer;
pub mod registry;
pub mod symfile;

pub use self::abi::{JitAction, JitCodeEntry, JitDescriptor, JIT_DESCRIPTOR_VERSION};
pub use self::arena::EntryHandle;
pub use self::config::Config;
pub use self::error::{Corruption, InstallError, RegisterError, UnregisterError};
pub use self::installer::{DebugInfoInstaller, Registration, State};
pub use self::registry::{
    lock_global, register, unregister, DebuggerInterface, EntryInfo, GdbJitInterface, Registry,
};
pub use self::symfile::SymbolFile;
