//! # gubae-chat
//!
//! The realtime messaging core for gubae communities and direct threads.
//!
//! ```text
//! join ──> ConversationRegistry ──┐
//!                                 ├── SharedDatabase (SQLite)
//! send ──> PresenceGate ──> MessageStore ──> DeliveryBroker ──> subscribers
//!                                 │
//!                                 └──> EventBus ──> application / UI
//! ```
//!
//! [`ChatService`] is the single entry point for inbound commands; the
//! components behind it are exposed for callers that need finer control.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gate;
pub mod message_store;
pub mod registry;
pub mod service;

pub use broker::{BrokerStats, DeliveryBroker, Subscription};
pub use config::ChatConfig;
pub use db::SharedDatabase;
pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, EventBus};
pub use gate::{Presence, PresenceGate};
pub use message_store::{MessageStore, OutgoingMessage, OverlayOp};
pub use registry::{CommunityUpdate, ConversationRegistry, NewCommunity};
pub use service::ChatService;
