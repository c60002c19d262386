//! CP02 MCU Library
//!
//! Runs the CP02 gateway on a microcontroller: one charger on BLE, one MQTT
//! broker on WiFi, everything driven from the firmware's main loop.
//!
//! This crate provides:
//! - traits the board support implements: [`BleCentral`], [`Wifi`], [`Mqtt`],
//!   [`Ota`] and [`Storage`]
//! - the [`Gateway`] that ties them together in a cooperative `tick`
//!
//! ```ignore
//! let mut gateway = Gateway::new(ble, wifi, ota, mqtt, nvs, GatewayConfig::new("gw01"));
//! gateway.start(Instant::now());
//! loop {
//!     if gateway.tick(Instant::now(), reset_pin.is_low()) == Control::Restart {
//!         restart();
//!     }
//!     FreeRtos::delay_ms(10);
//! }
//! ```
//!
//! Uses `cp02-node` without its `async` feature: no tokio on the MCU.

pub mod ble;
pub mod button;
pub mod gateway;
pub mod mqtt;
pub mod ota;
pub mod storage;
pub mod wifi;

pub use ble::BleCentral;
pub use button::ResetButton;
pub use gateway::{Control, GATEWAY_VERSION, Gateway, GatewayConfig};
pub use mqtt::{Mqtt, Topics};
pub use ota::Ota;
pub use storage::{MemoryStorage, MqttSettings, Storage, StorageTokens, token_key};
pub use wifi::{IpInfo, Wifi, WifiStatus};
