use std::fmt;

/// Everything that can go wrong while driving the block-processing pipeline.
#[derive(Debug)]
pub enum IndexError {
    /// The daemon's current tip no longer descends from our last-applied
    /// block. Non-fatal: the caller is expected to roll back and retry.
    ChainReorg { height: i32, prev_hash: [u8; 32] },
    /// The daemon's genesis hash does not match the coin profile's. Fatal.
    WrongChain,
    /// An on-disk invariant was violated (a record had the wrong length, a
    /// flush counter regressed, a lookup that must succeed did not).
    CorruptIndex(String),
    /// The daemon collaborator failed. Transient; the Prefetcher retries.
    Daemon(String),
    Io(std::io::Error),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::ChainReorg { height, prev_hash } => {
                write!(f, "chain reorg detected at height {height}, prev_hash {}", hex::encode(prev_hash))
            }
            IndexError::WrongChain => write!(f, "daemon genesis hash does not match coin profile"),
            IndexError::CorruptIndex(msg) => write!(f, "corrupt index: {msg}"),
            IndexError::Daemon(msg) => write!(f, "daemon error: {msg}"),
            IndexError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IndexError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Io(err)
    }
}

impl From<rocksdb::Error> for IndexError {
    fn from(err: rocksdb::Error) -> Self {
        IndexError::CorruptIndex(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_message_includes_height() {
        let err = IndexError::ChainReorg { height: 42, prev_hash: [0u8; 32] };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: IndexError = io_err.into();
        assert!(matches!(err, IndexError::Io(_)));
    }
}
