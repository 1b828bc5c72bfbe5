//! Messaging engine: encrypted DMs and relay-managed groups over a relay
//! pool.
//!
//! The engine layers on `nostr-client`: the [`dm::DmController`] drives the
//! DM send/receive pipelines, [`groups::GroupDirectory`] tracks group
//! membership from relay-signed events, [`store::MessageStore`] persists
//! messages encrypted at rest, and [`retry::RetryManager`] owns per-relay
//! circuit breakers and the offline queue's timers.

pub mod cache;
pub mod dm;
pub mod error;
pub mod groups;
pub mod message;
pub mod retry;
pub mod store;
pub mod traits;

pub use cache::{CacheConfig, ConversationCache, RecentIds};
pub use dm::{ControllerStatus, DmController, EngineConfig, EngineEvent};
pub use error::{EngineError, Result, StoreError};
pub use groups::{GroupDirectory, GroupMetadata, GroupRole, GroupView, MembershipStatus};
pub use message::{
    Attachment, Message, MessageDirection, MessageStatus, OutgoingMessage, Reaction,
};
pub use retry::{RetryConfig, RetryDecision, RetryManager};
pub use store::{MessageQuery, MessageStore, StorageUsage, StoreConfig};
pub use traits::{IdentityProvider, RelayTransport, RequestsInbox, TrustProvider};
