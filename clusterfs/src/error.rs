//! Error types shared by the store and the filesystem layer.
//!
//! `StoreError` is what the persistence layer reports; `FsError` is the
//! POSIX-flavoured status every filesystem call returns. The FUSE adapter turns
//! an `FsError` into an errno with [`FsError::errno`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    /// A conditional write or delete was rejected. Never retried.
    #[error("conditional write rejected")]
    Conflict,
    #[error("cluster unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },
    #[error("corrupt row {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("row codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("backend error: {0}")]
    Backend(String),
    /// Startup cannot proceed (unreachable cluster, missing schema).
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("i/o error: {0}")]
    Io(String),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::PermissionDenied => libc::EACCES,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => FsError::NotFound,
            StoreError::Conflict => FsError::AlreadyExists,
            other => FsError::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        assert_eq!(FsError::from(StoreError::NotFound), FsError::NotFound);
        assert_eq!(FsError::from(StoreError::Conflict), FsError::AlreadyExists);
        let unavailable = StoreError::Unavailable {
            attempts: 4,
            message: "deadline exceeded".into(),
        };
        assert!(matches!(FsError::from(unavailable), FsError::Io(_)));
    }

    #[test]
    fn test_errno() {
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::Io("x".into()).errno(), libc::EIO);
        assert_eq!(FsError::InvalidArgument("..".into()).errno(), libc::EINVAL);
    }
}
