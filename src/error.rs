//! Error taxonomy for the capture pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the tracker, writer, reader, and resolver.
///
/// Allocator intercepts never return these to the traced program; they log
/// and drop the event instead. Everything else propagates with `?`.
#[derive(Debug, Error)]
pub enum Error {
    /// Sink or source I/O failure.
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The capture does not start with the expected magic bytes.
    #[error("not a capture file (bad magic)")]
    BadMagic,

    /// The capture was written by an incompatible format version.
    #[error("unsupported capture version {0}")]
    UnsupportedVersion(u16),

    /// A record tag outside the known set.
    #[error("unknown record tag {0:#04x}")]
    UnknownRecordTag(u8),

    /// The stream ended inside a record payload.
    #[error("truncated record (tag {0:#04x})")]
    TruncatedRecord(u8),

    /// A variable-length record declared an implausible payload size.
    #[error("record payload of {got} bytes exceeds the {limit} byte limit")]
    OversizedRecord { got: u32, limit: u32 },

    /// An embedded string was not valid UTF-8.
    #[error("capture contains a non-UTF-8 string")]
    InvalidString,

    /// A second tracker was started while one is active.
    #[error("a tracker is already active in this process")]
    AlreadyActive,

    /// The output file for a capture already exists.
    #[error("output file already exists: {0}")]
    OutputExists(PathBuf),

    /// Waiting for a reader connection was cancelled.
    #[error("socket accept was cancelled")]
    AcceptCancelled,

    /// The reader was asked about a stack id it never produced.
    #[error("unknown stack id {0}")]
    UnknownStackId(u32),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_stable() {
        let err = Error::UnknownRecordTag(0xAB);
        assert_eq!(err.to_string(), "unknown record tag 0xab");

        let err = Error::OversizedRecord { got: 9000, limit: 4096 };
        assert!(err.to_string().contains("9000"));
    }

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }
}
