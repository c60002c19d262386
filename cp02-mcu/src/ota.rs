//! Firmware update hook

pub use cp02_node::OtaProgress;

/// While an update runs the gateway suspends polling and reconnects
pub trait Ota {
    type Error: std::fmt::Display;

    /// Begin downloading and flashing the image at `url`
    fn start(&mut self, url: &str) -> Result<(), Self::Error>;

    fn progress(&self) -> OtaProgress;

    fn in_progress(&self) -> bool {
        self.progress().in_progress
    }
}
