//! # parley-core
//!
//! The Parley message hub.
//!
//! - **Hub** - Owns the active backend adapter and fans every message,
//!   update and presence change out to handlers and sessions
//! - **Registry** - Connected session channels keyed by session id
//! - **Store** - JSON-file store used when no backend is active
//! - **Config** - Durable record of the active backend and its credentials
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│     Hub     │────▶│   Adapter   │──▶ backend
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//!  ┌─────────────┐    ┌─────────────┐
//!  │  Registry   │◀───│ Local store │
//!  └─────────────┘    └─────────────┘
//! ```

pub mod config;
pub mod hub;
pub mod registry;
pub mod store;

pub use config::{BackendConfig, ConfigError, ConfigStore};
pub use hub::{Hub, HubError, HubSettings, HubStatus};
pub use registry::{RegistryStats, SessionRegistry};
pub use store::{LocalStore, RecordCollection, StoreError, UserRecord};
