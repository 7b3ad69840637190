//! Error types.
//!
//! Hardware and instrument I/O is reported with [`anyhow::Error`], as returned
//! by the [`Registers`](crate::device::Registers) and
//! [`Generator`](crate::device::Generator) implementations. This module
//! contains the errors that the data handling and the synchronization loop
//! produce on their own.

/// Data shape error.
///
/// These errors indicate that the data given to an operation does not have the
/// shape that the operation needs. They are caused by configuration mistakes
/// (for instance, a wrong BRAM width) and are never silently worked around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataShapeError {
    /// The lanes given to interleave do not have the same length.
    UnequalLanes {
        /// Index of the first lane whose length differs from lane 0.
        lane: usize,
        /// Length of lane 0.
        expected: usize,
        /// Length of the offending lane.
        found: usize,
    },
    /// The sequence length is not divisible by the deinterleave factor.
    Indivisible {
        /// Sequence length.
        len: usize,
        /// Deinterleave factor.
        factor: usize,
    },
    /// A deinterleave factor of zero was requested.
    ZeroFactor,
    /// A BRAM read returned a different number of bytes than requested.
    ByteCount {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes received.
        found: usize,
    },
    /// The BRAM data width is not usable with the element format.
    DataWidth {
        /// BRAM data width in bits.
        bits: u32,
        /// Element width in bytes.
        element_bytes: usize,
    },
    /// The BRAM address width gives a size that does not fit in memory.
    AddressWidth {
        /// BRAM address width in bits.
        bits: u32,
    },
    /// Too few distinct frequencies to fit a phase slope.
    InsufficientData {
        /// Number of distinct frequencies available.
        points: usize,
    },
    /// Two sequences that must be paired have different lengths.
    LengthMismatch {
        /// Length of the first sequence.
        left: usize,
        /// Length of the second sequence.
        right: usize,
    },
}

impl std::fmt::Display for DataShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            DataShapeError::UnequalLanes {
                lane,
                expected,
                found,
            } => write!(
                f,
                "lane {lane} has {found} elements but lane 0 has {expected}"
            ),
            DataShapeError::Indivisible { len, factor } => write!(
                f,
                "cannot deinterleave {len} elements by a factor of {factor}"
            ),
            DataShapeError::ZeroFactor => write!(f, "deinterleave factor is zero"),
            DataShapeError::ByteCount { expected, found } => {
                write!(f, "expected {expected} bytes but read {found}")
            }
            DataShapeError::DataWidth {
                bits,
                element_bytes,
            } => write!(
                f,
                "data width of {bits} bits does not hold a whole number of \
                 {element_bytes}-byte elements"
            ),
            DataShapeError::AddressWidth { bits } => {
                write!(f, "address width of {bits} bits is too large")
            }
            DataShapeError::InsufficientData { points } => write!(
                f,
                "at least 2 distinct frequencies are needed to fit a phase slope, got {points}"
            ),
            DataShapeError::LengthMismatch { left, right } => {
                write!(f, "sequence lengths differ ({left} != {right})")
            }
        }
    }
}

impl std::error::Error for DataShapeError {}

/// Synchronization error.
///
/// Errors that abort a run of the synchronization loop. Not converging is not
/// an error; it is reported through
/// [`SyncOutcome`](crate::sync::SyncOutcome).
#[derive(Debug)]
pub enum SyncError {
    /// Communication with the board or the generator failed.
    Hardware(anyhow::Error),
    /// Acquired data did not have the expected shape.
    DataShape(DataShapeError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            SyncError::Hardware(err) => write!(f, "hardware I/O error: {err:#}"),
            SyncError::DataShape(err) => write!(f, "data shape error: {err}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Hardware(err) => Some(err.as_ref()),
            SyncError::DataShape(err) => Some(err),
        }
    }
}

impl From<DataShapeError> for SyncError {
    fn from(value: DataShapeError) -> SyncError {
        SyncError::DataShape(value)
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(value: anyhow::Error) -> SyncError {
        // Lane reads report shape problems through anyhow so that they compose
        // with I/O errors. Recover the typed error here.
        match value.downcast::<DataShapeError>() {
            Ok(err) => SyncError::DataShape(err),
            Err(err) => SyncError::Hardware(err),
        }
    }
}
