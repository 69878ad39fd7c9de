//! Error taxonomy (spec §7).
//!
//! Two layers: [`Status`] is the protocol-level code carried in every wire
//! response and changelog result tag; [`CoreError`] distinguishes the
//! internal failure kinds that decide retry policy before a [`Status`] is
//! ever produced for a remote peer.

use thiserror::Error;

/// Protocol-level status code (spec §7, "Protocol-level status").
///
/// These are the only values that may cross the wire in a response header's
/// status field, or appear as the `<result>` tag of a changelog record
/// (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    #[error("OK")]
    Ok,
    #[error("EPERM")]
    EPerm,
    #[error("ENOTDIR")]
    ENotDir,
    #[error("ENOENT")]
    ENoEnt,
    #[error("EACCES")]
    EAccess,
    #[error("EEXIST")]
    EExist,
    #[error("EINVAL")]
    EInval,
    #[error("ENOTEMPTY")]
    ENotEmpty,
    #[error("EROFS")]
    ERoFs,
    #[error("EIO")]
    EIo,
    #[error("QUOTA")]
    Quota,
    #[error("INDEXTOOBIG")]
    IndexTooBig,
    #[error("NOCHUNK")]
    NoChunk,
    #[error("MISMATCH")]
    Mismatch,
    #[error("BADMETADATACHECKSUM")]
    BadMetadataChecksum,
    #[error("DELAYED")]
    Delayed,
    #[error("WAITING")]
    Waiting,
}

impl Status {
    /// Short ASCII mnemonic, as it appears on the wire and in changelog
    /// result tags (spec §4.8, §6).
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::EPerm => "EPERM",
            Status::ENotDir => "ENOTDIR",
            Status::ENoEnt => "ENOENT",
            Status::EAccess => "EACCES",
            Status::EExist => "EEXIST",
            Status::EInval => "EINVAL",
            Status::ENotEmpty => "ENOTEMPTY",
            Status::ERoFs => "EROFS",
            Status::EIo => "EIO",
            Status::Quota => "QUOTA",
            Status::IndexTooBig => "INDEXTOOBIG",
            Status::NoChunk => "NOCHUNK",
            Status::Mismatch => "MISMATCH",
            Status::BadMetadataChecksum => "BADMETADATACHECKSUM",
            Status::Delayed => "DELAYED",
            Status::Waiting => "WAITING",
        }
    }

    pub fn from_str(s: &str) -> Option<Status> {
        Some(match s {
            "OK" => Status::Ok,
            "EPERM" => Status::EPerm,
            "ENOTDIR" => Status::ENotDir,
            "ENOENT" => Status::ENoEnt,
            "EACCES" => Status::EAccess,
            "EEXIST" => Status::EExist,
            "EINVAL" => Status::EInval,
            "ENOTEMPTY" => Status::ENotEmpty,
            "EROFS" => Status::ERoFs,
            "EIO" => Status::EIo,
            "QUOTA" => Status::Quota,
            "INDEXTOOBIG" => Status::IndexTooBig,
            "NOCHUNK" => Status::NoChunk,
            "MISMATCH" => Status::Mismatch,
            "BADMETADATACHECKSUM" => Status::BadMetadataChecksum,
            "DELAYED" => Status::Delayed,
            "WAITING" => Status::Waiting,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Core-internal failure kinds (spec §7, "Core-internal failure kinds").
///
/// Unlike [`Status`], this type carries enough context for a caller to
/// decide whether to retry. Precondition failures bubble up as a `Status`
/// with no changelog entry; recoverable I/O is retried with backoff up to
/// `ioretries` before becoming `Status::EIo`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("precondition failed: {0}")]
    Precondition(Status),

    #[error("recoverable I/O error after {attempts} attempt(s): {source}")]
    RecoverableIo {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("connection to {address} lost: {source}")]
    ConnectionLost {
        address: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("replay mismatch at metaversion {metaversion}: {detail}")]
    ReplayMismatch { metaversion: u64, detail: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl CoreError {
    /// Whether the failure taxonomy in spec §7 calls for a retry.
    /// "Retries: only for I/O and transient connection failures. Permission,
    /// quota, and semantic errors are never retried."
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RecoverableIo { .. } | CoreError::ConnectionLost { .. }
        )
    }

    /// Collapse to the wire-level status a remote peer would observe.
    pub fn to_status(&self) -> Status {
        match self {
            CoreError::Precondition(status) => *status,
            CoreError::RecoverableIo { .. } => Status::EIo,
            CoreError::ConnectionLost { .. } => Status::EIo,
            CoreError::ReplayMismatch { .. } => Status::Mismatch,
            CoreError::InvariantViolation(_) => Status::EIo,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_its_mnemonic() {
        for status in [
            Status::Ok,
            Status::EPerm,
            Status::ENotDir,
            Status::ENoEnt,
            Status::EAccess,
            Status::EExist,
            Status::EInval,
            Status::ENotEmpty,
            Status::ERoFs,
            Status::EIo,
            Status::Quota,
            Status::IndexTooBig,
            Status::NoChunk,
            Status::Mismatch,
            Status::BadMetadataChecksum,
            Status::Delayed,
            Status::Waiting,
        ] {
            assert_eq!(Status::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn only_io_and_connection_errors_are_retryable() {
        assert!(!CoreError::Precondition(Status::EPerm).is_retryable());
        assert!(CoreError::RecoverableIo {
            attempts: 1,
            source: anyhow::anyhow!("boom"),
        }
        .is_retryable());
        assert!(CoreError::ConnectionLost {
            address: "10.0.0.1:9422".into(),
            source: anyhow::anyhow!("reset"),
        }
        .is_retryable());
        assert!(!CoreError::ReplayMismatch {
            metaversion: 4,
            detail: "inode id differs".into(),
        }
        .is_retryable());
    }
}
