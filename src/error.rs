use thiserror::Error;

/// Crate-wide error type.
///
/// Integrity failures abort the current transaction and mark the subspace
/// unusable until reopened; handshake errors are terminal for the
/// connection. Everything else is local to the failing call.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Malformed input: wrong-length key, unknown version byte, bad argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// MAC mismatch, checksum mismatch, unrecoverable backup line.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// Missing asset, wallet header or file. Not fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Passphrase failure, peer rejection, handshake state violation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Second writer on a locked subspace, policy mismatch, duplicate id.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Repair found multiple candidates, KDF memory request over cap.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unknown on-disk version. Never silently upgraded.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend B-tree error.
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, WalletError>;

impl WalletError {
    /// True for errors that poison their container (subspace or session).
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalletError::IntegrityFailure(_))
    }
}

impl From<redb::Error> for WalletError {
    fn from(err: redb::Error) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for WalletError {
    fn from(err: redb::DatabaseError) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for WalletError {
    fn from(err: redb::TransactionError) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<redb::TableError> for WalletError {
    fn from(err: redb::TableError) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for WalletError {
    fn from(err: redb::StorageError) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for WalletError {
    fn from(err: redb::CommitError) -> Self {
        WalletError::Storage(err.to_string())
    }
}

impl From<secp256k1::Error> for WalletError {
    fn from(err: secp256k1::Error) -> Self {
        WalletError::InvalidArgument(format!("secp256k1: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_failures_are_fatal() {
        assert!(WalletError::IntegrityFailure("mac mismatch".into()).is_fatal());
        assert!(!WalletError::NotFound("missing".into()).is_fatal());
    }

    #[test]
    fn display_includes_kind() {
        let err = WalletError::PermissionDenied("bad passphrase".into());
        assert_eq!(err.to_string(), "permission denied: bad passphrase");
    }
}
