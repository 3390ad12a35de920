//! Error taxonomy surfaced to the VFS adapter and the control socket.

use std::io;

use thiserror::Error;

use crate::api::{ApiError, ApiErrorCode};

/// Every failure mode an engine operation can report. The VFS adapter maps
/// each variant onto an errno with [`FsError::errno`].
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("permission denied")]
    PermissionDenied,

    #[error("file exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation not supported")]
    NotSupported,

    #[error("local i/o error: {0}")]
    Io(#[from] io::Error),

    /// An API error whose code has no errno mapping. The adapter logs it
    /// and reports a generic I/O failure.
    #[error(transparent)]
    Api(ApiError),
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::PermissionDenied => libc::EPERM,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::Io(_) | FsError::Api(_) => libc::EIO,
        }
    }
}

impl From<ApiError> for FsError {
    fn from(err: ApiError) -> Self {
        match err.code {
            ApiErrorCode::ObjectIdNotFound => FsError::NotFound,
            ApiErrorCode::IncorrectPermission => FsError::PermissionDenied,
            _ => FsError::Api(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: ApiErrorCode) -> ApiError {
        ApiError {
            status: 403,
            code,
            message: "nope".into(),
            description: "not allowed".into(),
        }
    }

    #[test]
    fn object_id_not_found_maps_to_enoent() {
        let err = FsError::from(api_error(ApiErrorCode::ObjectIdNotFound));
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn incorrect_permission_maps_to_eperm() {
        let err = FsError::from(api_error(ApiErrorCode::IncorrectPermission));
        assert_eq!(err.errno(), libc::EPERM);
    }

    #[test]
    fn unmapped_codes_stay_api_errors() {
        let err = FsError::from(api_error(ApiErrorCode::InvalidParam));
        assert!(matches!(err, FsError::Api(_)));
        assert_eq!(err.errno(), libc::EIO);
    }
}
