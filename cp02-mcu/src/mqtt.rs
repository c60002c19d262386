//! MQTT publishing and the gateway's topic layout
//!
//! Everything lives under `cp02/{gateway_id}/`: telemetry goes out on
//! `status`, `ports`, `device_info` and `heartbeat`, bridge requests come in
//! on `cmd` and their answers go out on `cmd_response`.

pub const TOPIC_BASE: &str = "cp02";

pub const QOS_TELEMETRY: u8 = 0;
pub const QOS_COMMAND: u8 = 1;
pub const QOS_STATUS: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(gateway_id: &str) -> Self {
        Self { prefix: format!("{TOPIC_BASE}/{gateway_id}") }
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{leaf}", self.prefix)
    }

    pub fn status(&self) -> String {
        self.topic("status")
    }

    pub fn ports(&self) -> String {
        self.topic("ports")
    }

    pub fn device_info(&self) -> String {
        self.topic("device_info")
    }

    pub fn heartbeat(&self) -> String {
        self.topic("heartbeat")
    }

    pub fn cmd(&self) -> String {
        self.topic("cmd")
    }

    pub fn cmd_response(&self) -> String {
        self.topic("cmd_response")
    }

    /// Command topic, or a subtopic of it
    pub fn is_cmd(&self, topic: &str) -> bool {
        topic.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix("/cmd"))
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

/// MCU-specific crates implement this with their MQTT client
pub trait Mqtt {
    type Error: std::fmt::Display;

    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<(), Self::Error>;

    fn subscribe(&mut self, topic: &str, qos: u8) -> Result<(), Self::Error>;

    /// Next message received on a subscribed topic (non-blocking)
    fn poll_message(&mut self) -> Option<(String, Vec<u8>)>;
}
