//! Owned symbol-file bytes handed to the debugger.

use std::fmt;
use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::error::InstallError;

/// Backing storage of one symbol file. The bytes never move or change for as
/// long as the value lives.
pub enum SymbolFile {
    Owned(Box<[u8]>),
    Mapped(Mmap),
    Static(&'static [u8]),
}

impl SymbolFile {
    /// Maps `path` read-only.
    pub fn map(path: impl AsRef<Path>) -> Result<Self, InstallError> {
        let path = path.as_ref();
        let map_err = |source| InstallError::Map {
            path: path.to_owned(),
            source,
        };
        let file = File::open(path).map_err(map_err)?;
        if file.metadata().map_err(map_err)?.len() == 0 {
            // Zero-length mappings are rejected by mmap.
            return Ok(Self::Owned(Box::default()));
        }
        // SAFETY: the mapping is private and read-only; a concurrent truncate of
        // the file is the caller's problem, as with any mapped input.
        let map = unsafe { MmapOptions::new().map_copy_read_only(&file) }.map_err(map_err)?;
        Ok(Self::Mapped(map))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => &bytes[..],
            Self::Mapped(map) => &map[..],
            Self::Static(bytes) => *bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<Vec<u8>> for SymbolFile {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes.into_boxed_slice())
    }
}

impl From<Box<[u8]>> for SymbolFile {
    fn from(bytes: Box<[u8]>) -> Self {
        Self::Owned(bytes)
    }
}

impl From<&'static [u8]> for SymbolFile {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Static(bytes)
    }
}

impl fmt::Debug for SymbolFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Owned(_) => "Owned",
            Self::Mapped(_) => "Mapped",
            Self::Static(_) => "Static",
        };
        f.debug_struct("SymbolFile")
            .field("kind", &kind)
            .field("addr", &self.as_bytes().as_ptr())
            .field("len", &self.len())
            .finish()
    }
}
