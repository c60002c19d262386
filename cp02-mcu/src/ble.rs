//! BLE central role, as the gateway drives it
//!
//! Calls block until the stack answers, which is fine inside the cooperative
//! tick. Notifications arrive from the stack's callback and are queued by the
//! implementation; the gateway drains the queue each tick.

pub use cp02_node::{Advertisement, Peer};
pub use cp02_proto::ble::{DEVICE_PREFIX, RX_CHAR_UUID, SERVICE_UUID, TX_CHAR_UUID, commands};

/// MCU-specific crates implement this with their BLE stack (NimBLE on ESP32)
pub trait BleCentral {
    type Error: std::fmt::Display;

    fn scan(&mut self, duration_ms: u64) -> Result<Vec<Advertisement>, Self::Error>;

    fn connect(&mut self, peer: &Peer, timeout_ms: u64) -> Result<(), Self::Error>;

    /// Look up the charger service with its TX and RX characteristics
    fn discover(&mut self) -> Result<bool, Self::Error>;

    fn subscribe(&mut self) -> Result<(), Self::Error>;

    fn write(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// False once the stack reports the link gone
    fn is_connected(&self) -> bool;

    /// Next queued TX notification (non-blocking)
    fn poll_notification(&mut self) -> Option<Vec<u8>>;
}
