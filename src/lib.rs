//! Sync core of the CRM mobile client: an entity cache kept live by socket
//! push events, optimistic mutations, and REST/WebSocket transports.

pub mod api;
pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod optimistic;
pub mod reconciler;
pub mod store;
pub mod transport;

pub use api::CrmApi;
pub use cache::{EntityCache, QueryKey, Subscription, Tag};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use manager::Manager;
