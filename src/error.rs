use thiserror::Error;

/// Error kinds reported by the file system.
///
/// Every mutating operation performs all of its checks before the first
/// block write, so an error return means the image was not modified unless
/// the variant documentation says otherwise.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("device i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Non-absolute path, empty or over-long name, name containing '/',
    /// empty buffer for read/write, invalid truncate range.
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such file or directory")]
    NotFound,
    /// Expected a directory and found a file, or vice versa.
    #[error("wrong entry type")]
    WrongType,
    #[error("entry already exists")]
    AlreadyExists,
    /// The log has no free slots left for the blocks this operation could
    /// touch in the worst case.
    #[error("file system is full")]
    OutOfSpace,
    /// Directory-children, link-counter, file-size or list limit reached.
    #[error("capacity limit reached")]
    CapacityExceeded,
    #[error("file system corruption: {0}")]
    Corruption(&'static str),
}

pub type Result<T> = core::result::Result<T, FsError>;
