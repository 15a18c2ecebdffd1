//! The session orchestrator and the ports it consumes.

pub mod cache;
pub mod delegate;
pub mod executor;
pub mod orchestrator;
pub mod queue;
pub mod transport;

pub use cache::SessionCache;
pub use delegate::{DefaultSessionDelegate, ReceiverDelegate, SessionDelegate};
pub use executor::SerialExecutor;
pub use orchestrator::{SessionCore, METADATA_CHANNEL_INFO, METADATA_FRIENDSHIP_STATE};
pub use queue::{JobQueue, TaskRunner};
pub use transport::{OneTimeKeyKind, OneTimeKeysUpdate, SessionTransport};
