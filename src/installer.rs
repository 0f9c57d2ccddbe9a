//! Registration of symbol files on behalf of code emitters.
//!
//! An emitter asks the [`DebugInfoInstaller`] for a [`Registration`] once the
//! symbol file for a compiled unit exists, activates it as soon as the code is
//! executable, and releases it (or drops it) right before the code goes away.

use std::fmt;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::InstallError;
use crate::registry::{self, lock_global};
use crate::symfile::SymbolFile;
use crate::EntryHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initialized,
    Activated,
    Released,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initialized => "initialized",
            Self::Activated => "activated",
            Self::Released => "released",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DebugInfoInstaller {
    config: Config,
}

impl DebugInfoInstaller {
    /// Applies the verification setting to the process-wide registry, unless
    /// registration is disabled.
    pub fn new(config: Config) -> Self {
        if config.enabled {
            lock_global().set_verify(config.verify);
        }
        debug!(?config, "debug info installer configured");
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Wraps a symbol file in an inactive registration, or `None` when
    /// registration is disabled.
    pub fn install(&self, symfile: impl Into<SymbolFile>) -> Option<Registration> {
        if !self.config.enabled {
            return None;
        }
        let registration = Registration {
            symfile: symfile.into(),
            handle: None,
            entry: 0,
            state: State::Initialized,
        };
        debug!(%registration, "installed");
        Some(registration)
    }
}

/// A symbol file and its entry in the process-wide registry.
///
/// The symbol file is owned here, so it cannot be freed while the debugger
/// may still read it. Dropping an activated registration unregisters it.
pub struct Registration {
    symfile: SymbolFile,
    handle: Option<EntryHandle>,
    // Address of the debugger-visible entry, zero until activated.
    entry: usize,
    state: State,
}

impl Registration {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn handle(&self) -> Option<EntryHandle> {
        self.handle
    }

    pub fn symfile(&self) -> &SymbolFile {
        &self.symfile
    }

    fn expect_state(&self, expected: State) -> Result<(), InstallError> {
        if self.state != expected {
            return Err(InstallError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Makes the symbol file visible to debuggers.
    pub fn activate(&mut self) -> Result<(), InstallError> {
        self.expect_state(State::Initialized)?;
        let bytes = self.symfile.as_bytes();
        let mut registry = lock_global();
        // SAFETY: the bytes are owned by `self`, which unregisters in `release`
        // or `drop` before they can be freed.
        let handle = unsafe { registry.register(bytes.as_ptr(), bytes.len() as u64) }?;
        self.entry = registry.descriptor().relevant_entry() as usize;
        drop(registry);
        self.handle = Some(handle);
        self.state = State::Activated;
        info!(%handle, size = bytes.len(), "registered symbol file with debugger");
        Ok(())
    }

    /// Withdraws the symbol file from debuggers.
    pub fn release(&mut self) -> Result<(), InstallError> {
        self.expect_state(State::Activated)?;
        if let Some(handle) = self.handle {
            registry::unregister(handle)?;
            self.handle = None;
            info!(%handle, "unregistered symbol file from debugger");
        }
        self.state = State::Released;
        Ok(())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.state == State::Activated {
            if let Err(e) = self.release() {
                error!("failed to release {self}: {e}");
            }
        }
    }
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DebugInfoHandle(entry = {:#x}, address = {:p}, size = {}, state = {})",
            self.entry,
            self.symfile.as_bytes().as_ptr(),
            self.symfile.len(),
            self.state
        )
    }
}
