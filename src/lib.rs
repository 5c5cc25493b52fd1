//! # fieldgw
//!
//! Industrial data-acquisition gateway. Polls field devices over
//! pluggable protocols (Modbus/TCP as the reference implementation),
//! caches the latest sample and a bounded history per variable, and
//! serves the cached data to TCP clients through a compact line-command
//! API, a JSON request form, and push-style subscriptions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   read_batch    ┌───────────┐
//! │  Poller(s) ├────────────────►│  Adapter  │  modbus_tcp, …
//! └─────┬──────┘                 └─────┬─────┘
//!       │ shutdown/rebind              │ publish(id, name, value, q)
//! ┌─────┴──────────┐          ┌────────┴────────┐
//! │ ConfigController│          │ DataCache + Hub │
//! └─────┬──────────┘          └────────┬────────┘
//!       │ watch/save                   │ snapshots, history, pushes
//!       │                     ┌────────┴────────┐
//!       └────────────────────►│    TcpServer    │  :8080
//!                             └─────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use fieldgw::gateway::{Server, DEFAULT_PORT};
//!
//! let server = Server::new(DEFAULT_PORT);
//! server.load_config(std::path::Path::new("config.json")).await?;
//! let listener = server.bind().await?;
//! server.serve(listener, shutdown_rx).await;
//! ```

pub mod core;
pub mod gateway;
pub mod protocols;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        data::{Sample, Value, VarId, VarType},
        error::{GatewayError, Result},
        ident::IdAllocator,
        quality::Quality,
    };
    pub use crate::gateway::{ConfigController, Server, SubscriptionHub, TcpServer};
    pub use crate::store::DataCache;
}

// Re-export core types at crate root for convenience
pub use crate::core::data::{Sample, Value, VarId, VarType};
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::quality::Quality;
pub use crate::store::DataCache;
