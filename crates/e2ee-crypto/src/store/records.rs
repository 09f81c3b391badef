//! Plain-old-data records persisted by a [`super::Store`]. Public key
//! material is stored in the clear (it is public by definition); every
//! field suffixed `_sealed` holds `nonce || ciphertext || tag` produced by
//! the store's master key, per §4.3's master-key policy.

#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub seed_sealed: Vec<u8>,
    pub uploaded: bool,
}

#[derive(Debug, Clone)]
pub struct SignedPrekeyRecord {
    pub key_id: u32,
    pub public_key: [u8; 32],
    pub secret_sealed: Vec<u8>,
    pub signature: [u8; 64],
    pub created_at_unix_ms: i64,
    pub uploaded: bool,
}

#[derive(Debug, Clone)]
pub struct OneTimePrekeyRecord {
    pub key_id: u32,
    pub public_key: [u8; 32],
    pub secret_sealed: Vec<u8>,
    pub created_at_unix_ms: i64,
    pub uploaded: bool,
    pub consumed: bool,
}

/// A session's full ratchet state, serialized and sealed as one opaque
/// blob. Sealing the whole structure (rather than field-by-field) is what
/// makes `save_session` a single atomic write per §4.3.
#[derive(Debug, Clone)]
pub struct SessionRecordRow {
    pub peer_id: String,
    pub peer_identity_public: [u8; 32],
    pub status: SessionStatus,
    pub state_sealed: Vec<u8>,
    /// Sealed `X3dhInit`, present only until the session's first outbound
    /// message is sent (§3 "pending X3DH init payload"). Needed so the
    /// payload survives a process restart between `ensure_session` and the
    /// first `encrypt`.
    pub pending_x3dh_sealed: Option<Vec<u8>>,
    pub updated_at_unix_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Establishing,
    Ready,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Establishing => "establishing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "establishing" => Some(Self::Establishing),
            "ready" => Some(Self::Ready),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}
