//! Error type shared by the dump and load paths.
//!
//! Ineligibility is never an error: fields and classes that cannot be
//! archived are flagged and skipped. Errors are reserved for failed walks,
//! malformed archives and misuse of the region state machine.

use std::io;

use crate::region::RegionKind;

/// Errors produced while building, persisting or loading a heap archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// An OS or file operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Archive or table bytes are malformed.
    #[error("malformed archive: {0}")]
    Format(String),

    /// The walk reached an object whose class may not be archived.
    #[error("object of class `{class}` cannot be archived")]
    Unarchivable {
        /// Name of the offending class.
        class: String,
    },

    /// A closed-region walk reached an object already archived in the open region.
    #[error("closed region object would reference open region object of class `{class}`")]
    ClosedReferencesOpen {
        /// Class of the open-region object.
        class: String,
    },

    /// A region ran out of its configured capacity.
    #[error("{kind} region exceeded its capacity of {capacity} bytes")]
    RegionOverflow {
        /// Region that overflowed.
        kind: RegionKind,
        /// Configured capacity in bytes.
        capacity: usize,
    },

    /// The mapping collaborator could not provide memory for a region.
    #[error("failed to map {kind} region: {source}")]
    MapFailed {
        /// Region that failed to map.
        kind: RegionKind,
        /// Underlying OS error.
        source: io::Error,
    },

    /// An operation required a mapped region that is not mapped.
    #[error("{0} region is not mapped")]
    RegionNotMapped(RegionKind),

    /// Fixup was requested for a region that has already been fixed up.
    #[error("{0} region has already been fixed up")]
    AlreadyFixedUp(RegionKind),

    /// A reference word decodes outside every archived region.
    #[error("reference {narrow:#x} at word {word} of {kind} region points outside the archive")]
    DanglingReference {
        /// Region holding the bad word.
        kind: RegionKind,
        /// Word index inside the region.
        word: usize,
        /// The narrow value found there.
        narrow: u32,
    },

    /// A class named by the archive is unknown to the loading process.
    #[error("class `{0}` cannot be resolved")]
    UnresolvedClass(String),

    /// The archived copy of a subgraph diverges from the live graph.
    #[error("archived subgraph diverges from live graph: {0}")]
    VerificationFailed(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}
