//! Error types for the JIT registration interface.

use std::path::PathBuf;

use thiserror::Error;

use crate::arena::EntryHandle;
use crate::installer::State;

/// Failure to register a symbol file. The list and descriptor are unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("out of memory allocating {bytes} bytes for a code entry")]
    OutOfMemory { bytes: usize },

    #[error("code entry slots exhausted")]
    CapacityExhausted,
}

/// Rejected unregistration. Detected before anything is mutated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnregisterError {
    #[error("{0} was issued by a different registry")]
    ForeignHandle(EntryHandle),

    #[error("{0} is not registered (stale or already unregistered)")]
    StaleHandle(EntryHandle),
}

/// Inconsistency found in the debugger-visible list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Corruption {
    #[error("entry {entry:#x} has no previous neighbour but the list head is {head:#x}")]
    HeadMismatch { entry: usize, head: usize },

    #[error("entry {entry:#x} has prev {found:#x}, expected {expected:#x}")]
    BrokenBackLink {
        entry: usize,
        found: usize,
        expected: usize,
    },

    #[error("list reachable from the descriptor has {found} entries, {expected} are registered")]
    LengthMismatch { found: usize, expected: usize },

    #[error("entry {entry:#x} in the list is not owned by this registry")]
    UnknownEntry { entry: usize },
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("registration is {actual}, expected {expected}")]
    InvalidState { expected: State, actual: State },

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Unregister(#[from] UnregisterError),

    #[error("failed to map symbol file {path:?}")]
    Map {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
