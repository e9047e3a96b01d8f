//! Error types for the Totem VM.
//!
//! Script-level failures are *faults*: they are recorded in the FR
//! register and stop execution until the host clears them (see
//! [`FaultKind`]). `VmError` is reserved for embedder-level misuse —
//! malformed images, I/O problems, registry misconfiguration — and is
//! never produced by running script code.

use thiserror::Error;

/// Runtime fault codes stored in the FR register.
///
/// The numeric values and message strings are part of the on-the-wire
/// contract with existing tooling; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FaultKind {
    /// Division or modulo by zero.
    Math = 1,
    /// The stack pointer crossed the heap high-water mark.
    StackHeapCollision = 2,
    /// Out-of-range memory access or function/library index.
    BoundsCheck = 3,
    /// Heap allocation exceeded its limit or a cell header is corrupt.
    HeapError = 4,
    /// Unrecognized version marker in the image header.
    VersionMismatch = 5,
    /// A library call referenced a missing asset.
    MissingInventory = 6,
    /// Sandbox-limit violation (host-asserted).
    Sandbox = 7,
    /// Output-rate limit tripped (host-asserted).
    ChatOverrun = 8,
    /// Listen-channel cap tripped.
    TooManyListens = 9,
    /// Attempted to construct a list containing a list.
    NestingLists = 10,
}

impl FaultKind {
    /// Decodes a fault register value. Zero and unknown codes map to `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Math),
            2 => Some(Self::StackHeapCollision),
            3 => Some(Self::BoundsCheck),
            4 => Some(Self::HeapError),
            5 => Some(Self::VersionMismatch),
            6 => Some(Self::MissingInventory),
            7 => Some(Self::Sandbox),
            8 => Some(Self::ChatOverrun),
            9 => Some(Self::TooManyListens),
            10 => Some(Self::NestingLists),
            _ => None,
        }
    }

    /// The value written into the FR register.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The human-readable fault string surfaced to the host.
    pub fn message(self) -> &'static str {
        match self {
            Self::Math => "Math Error",
            Self::StackHeapCollision => "Stack-Heap Collision",
            Self::BoundsCheck => "Bounds Check Error",
            Self::HeapError => "Heap Error",
            Self::VersionMismatch => "Version Mismatch",
            Self::MissingInventory => "Missing Inventory",
            Self::Sandbox => "Hit Sandbox Limit",
            Self::ChatOverrun => "Chat Overrun",
            Self::TooManyListens => "Too Many Listens",
            Self::NestingLists => "Lists may not contain lists",
        }
    }
}

/// Embedder-facing errors.
#[derive(Error, Debug)]
pub enum VmError {
    /// The image is smaller than the fixed header.
    #[error("image too small: {size} bytes, header needs {required}")]
    ImageTooSmall { size: usize, required: usize },

    /// The size field in the header disagrees with the buffer length.
    #[error("image size mismatch: header says {declared}, buffer is {actual}")]
    ImageSizeMismatch { declared: i32, actual: usize },

    /// A snapshot being restored does not fit this image.
    #[error("snapshot size mismatch: expected {expected}, got {actual}")]
    SnapshotSizeMismatch { expected: usize, actual: usize },

    /// A library descriptor is malformed.
    #[error("invalid library descriptor for slot {slot}: {reason}")]
    InvalidLibraryFunction { slot: usize, reason: String },

    /// Underlying file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for embedder-facing VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;
