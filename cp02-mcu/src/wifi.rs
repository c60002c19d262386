//! WiFi abstraction traits

pub use cp02_node::WifiNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Station address, reported in the heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub netmask: [u8; 4],
}

impl IpInfo {
    pub fn ip_str(&self) -> String {
        let [a, b, c, d] = self.ip;
        format!("{a}.{b}.{c}.{d}")
    }
}

/// MCU-specific crates implement this with their WiFi stack
pub trait Wifi {
    type Error: std::fmt::Display;

    fn scan(&mut self) -> Result<Vec<WifiNetwork>, Self::Error>;

    /// Join `ssid`; the association may complete on a later tick
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error>;

    fn status(&self) -> WifiStatus;

    /// Signal of the joined network
    fn rssi(&self) -> Option<i8>;

    fn ip_info(&self) -> Option<IpInfo>;

    fn is_connected(&self) -> bool {
        self.status() == WifiStatus::Connected
    }
}
