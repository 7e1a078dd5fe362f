use thiserror::Error;

/// Failure of a storage request.
///
/// Every request reports a definite amount processed: zero for everything
/// caught by validation, the committed prefix for an I/O failure in the middle
/// of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The device never became ready. Permanent for the life of the handle.
    #[error("device is not initialized")]
    InvalidState,
    #[error("size {size} exceeds buffer capacity {capacity}")]
    InvalidParameter { size: usize, capacity: usize },
    #[error("range is outside of the device")]
    OutOfBounds,
    #[error("flash I/O failed after {processed} bytes")]
    Io { processed: usize },
}

impl Error {
    /// Bytes durably processed before the request failed.
    pub fn processed(&self) -> usize {
        match *self {
            Error::Io { processed } => processed,
            _ => 0,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Error::InvalidState => Status::InvalidState,
            Error::InvalidParameter { .. } => Status::InvalidParameter,
            Error::OutOfBounds => Status::OutOfBounds,
            Error::Io { .. } => Status::Generic,
        }
    }
}

/// Numeric result code of a request, for callers that speak status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    Generic = -1,
    InvalidParameter = -3,
    InvalidState = -7,
    OutOfBounds = -8,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
}
