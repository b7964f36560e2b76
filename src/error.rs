/// Error types surfaced by segment acquisition.
///
/// Per-key operations (`set`, `get`, `unset`) keep the bool/int return
/// contracts of the original design (see `shm::hashtable`) — only
/// construction and attach can fail with a `ShmError`.
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("corrupt segment: {reason}")]
    CorruptSegment { reason: String },
}

impl From<ShmError> for io::Error {
    fn from(err: ShmError) -> Self {
        match err {
            ShmError::Io(e) => e,
            ShmError::InvalidConfig { reason } => io::Error::new(io::ErrorKind::InvalidInput, reason),
            ShmError::CorruptSegment { reason } => io::Error::new(io::ErrorKind::InvalidData, reason),
        }
    }
}
