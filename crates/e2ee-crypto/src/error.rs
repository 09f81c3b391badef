//! Error taxonomy for the encryption core.
//!
//! `CryptoError` is the single error type returned by every component below
//! the Session Manager. The Session Manager is the only layer that
//! translates these into user-facing behavior (retry, reset, placeholder).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signed prekey signature")]
    InvalidSignedPrekey,

    #[error("unknown signed prekey id {0}")]
    UnknownSignedPrekey(u32),

    #[error("unknown or already-consumed one-time prekey id {0}")]
    UnknownOneTimePrekey(u32),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("skip overflow: message number {0} is beyond the skipped-key window")]
    SkipOverflow(u32),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("decryption timed out")]
    DecryptionTimeout,

    #[error("local store I/O error: {0}")]
    StoreIoError(String),

    #[error("local store corrupted: {0}")]
    StoreCorrupted(String),

    #[error("no prekey bundle uploaded for this peer")]
    PrekeysUnavailable,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("rate limited, retry after backoff")]
    RateLimited,

    #[error("not authorized")]
    AuthorizationError,

    #[error("no session exists for this peer")]
    NoSession,

    #[error("signing error: {0}")]
    SigningError(String),
}

impl CryptoError {
    /// Whether a caller should retry this error with backoff, per the error
    /// handling design (`NetworkError`/`RateLimited` are RETRIED, everything
    /// else has its own recovery path).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::RateLimited)
    }

    /// Whether this error is unconditionally fatal to a session on its own,
    /// per §4.5/§7. `DecryptionFailed` is deliberately excluded here: a
    /// single bad ciphertext must not trip `error`, only a run of them — the
    /// Session Manager tracks that consecutive count itself and folds it
    /// into the fatal decision alongside this check.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::InvalidPublicKey | Self::StoreCorrupted(_))
    }
}
