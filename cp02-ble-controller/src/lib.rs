//! CP02 BLE Controller
//!
//! Host-side BLE transport for CP02 chargers.
//!
//! # Example
//!
//! ```ignore
//! use cp02_ble_controller::ble::BtleLink;
//! use cp02_node::{Config, Engine, JsonTokenFile, TokenStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let tokens = TokenStore::new(JsonTokenFile::new(Config::tokens_path()), config.token).shared();
//!     let (link, events) = BtleLink::new().await?;
//!     let engine = Engine::spawn(link, events, config, tokens);
//!
//!     engine.connect(None).await?;
//!     engine.send(cp02_proto::ble::commands::TURN_ON_PORT, vec![1]).await?;
//!     Ok(())
//! }
//! ```

pub mod ble;

pub use ble::{BtleLink, get_adapter};
