pub mod config;
pub mod error;
pub mod identity;
pub mod keymanager;
pub mod primitives;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod wire;
pub mod x3dh;

pub use config::ClientConfig;
pub use error::CryptoError;
pub use identity::Identity;
pub use keymanager::KeyManager;
pub use ratchet::RatchetState;
pub use session::{PrekeyBundleSource, SessionManager};
pub use store::{MasterKey, MemoryStore, SqliteStore, Store};
