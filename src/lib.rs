//! Aegis Protocol — a post-quantum, end-to-end encrypted messaging
//! session core.
//!
//! The crate maintains per-peer cryptographic sessions with a hybrid
//! Double Ratchet (X25519 combined with ML-KEM-1024), signs and verifies
//! every message, keeps all persisted state AEAD-sealed, and drives every
//! inbound and outbound operation through a persistent, ordered job queue.
//! Network I/O and storage are ports: implement [`session::SessionTransport`]
//! and [`session::SessionCache`] and hand them to
//! [`session::SessionCore::create`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod model;
pub mod protocol;
pub mod session;

pub use config::SessionOptions;
pub use error::{CacheError, SessionError, TransportError};
pub use model::{CryptoMessage, MessageRecipient};
pub use session::{ReceiverDelegate, SessionCache, SessionCore, SessionDelegate, SessionTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
