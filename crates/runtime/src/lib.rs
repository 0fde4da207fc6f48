//! Agent Runtime: the actor model, should-respond decision, Subscription
//! Manager, Chat Manager, and Message Mutation described in `spec.md` §4.2,
//! §4.5, and §4.6, wired together behind the [`api::Engine`] facade.

mod agent;
pub mod api;
pub mod chat;
mod error;
pub mod mention;
pub mod message;
pub mod mutation;
pub mod respond;
pub mod subscription;
pub mod world;

pub use api::{Engine, NewAgent, NewWorld};
pub use chat::ChatSummary;
pub use error::RuntimeError;
pub use mutation::{FailedAgent, RemovalResult};
pub use subscription::{ClientHooks, Subscription, SubscriptionManager};
pub use world::{WorldHandle, WorldRegistry};
