//! Periodic telemetry reads while the session is connected

use std::time::{Duration, Instant};

use cp02_proto::ble::commands;
use cp02_proto::telemetry::{self, PortTelemetry};
use serde::Serialize;

use crate::session::{Peer, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollJob {
    Ports,
    DeviceInfo,
}

impl PollJob {
    /// Read commands issued, in order, for one run of the job
    pub fn commands(self) -> &'static [u8] {
        match self {
            PollJob::Ports => &[commands::GET_ALL_POWER_STATISTICS],
            PollJob::DeviceInfo => &[
                commands::GET_DEVICE_MODEL,
                commands::GET_DEVICE_SERIAL_NO,
                commands::GET_AP_VERSION,
                commands::GET_DEVICE_UPTIME,
            ],
        }
    }
}

/// When each job is next due. Both fire immediately on [`PollSchedule::start`].
#[derive(Debug, Clone)]
pub struct PollSchedule {
    ports_every: Duration,
    info_every: Duration,
    next_ports: Option<Instant>,
    next_info: Option<Instant>,
}

impl PollSchedule {
    pub fn new(ports_every: Duration, info_every: Duration) -> Self {
        Self { ports_every, info_every, next_ports: None, next_info: None }
    }

    pub fn start(&mut self, now: Instant) {
        self.next_ports = Some(now);
        self.next_info = Some(now);
    }

    pub fn stop(&mut self) {
        self.next_ports = None;
        self.next_info = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_ports.is_some()
    }

    /// The job due at `now`, if any; port statistics win a tie
    pub fn poll(&mut self, now: Instant) -> Option<PollJob> {
        if let Some(due) = self.next_ports.filter(|due| *due <= now) {
            self.next_ports = Some(next_after(due, self.ports_every, now));
            return Some(PollJob::Ports);
        }
        if let Some(due) = self.next_info.filter(|due| *due <= now) {
            self.next_info = Some(next_after(due, self.info_every, now));
            return Some(PollJob::DeviceInfo);
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_ports, self.next_info) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Next slot on the period grid, skipping slots missed while busy
fn next_after(due: Instant, every: Duration, now: Instant) -> Instant {
    let next = due + every;
    if next > now { next } else { now + every }
}

/// Identity and firmware details, filled in by the device-info job
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub uptime_secs: Option<u64>,
    pub address: Option<String>,
    pub name: Option<String>,
}

impl DeviceInfo {
    pub fn for_peer(peer: Option<&Peer>) -> Self {
        Self {
            address: peer.map(|p| p.address.clone()),
            name: peer.map(|p| p.name.clone()),
            ..Self::default()
        }
    }

    /// Record the answer to one of [`PollJob::DeviceInfo`]'s commands
    pub fn apply(&mut self, service: u8, payload: &[u8]) {
        match service {
            commands::GET_DEVICE_MODEL => self.model = Some(telemetry::parse_text(payload)),
            commands::GET_DEVICE_SERIAL_NO => self.serial = Some(telemetry::parse_text(payload)),
            commands::GET_AP_VERSION => self.firmware = Some(telemetry::parse_text(payload)),
            commands::GET_DEVICE_UPTIME => self.uptime_secs = telemetry::parse_uptime_secs(payload),
            _ => {}
        }
    }
}

/// Session summary carried by status and heartbeat events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub state: SessionState,
    pub connected: bool,
    pub device: Option<Peer>,
    pub token_known: bool,
    pub searching_token: bool,
    pub retries: u32,
    pub link_lost: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Published fire-and-forget to whoever listens
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Telemetry {
    Ports { ports: Vec<PortTelemetry>, total_power_w: f32 },
    DeviceInfo(DeviceInfo),
    Status(StatusReport),
}

impl Telemetry {
    pub fn ports(payload: &[u8]) -> Self {
        let ports = telemetry::parse_port_statistics(payload);
        let total_power_w = telemetry::total_power(&ports);
        Telemetry::Ports { ports, total_power_w }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_jobs_fire_on_start_then_on_their_own_period() {
        let t0 = Instant::now();
        let mut schedule = PollSchedule::new(Duration::from_secs(3), Duration::from_secs(30));
        assert_eq!(schedule.poll(t0), None);

        schedule.start(t0);
        assert_eq!(schedule.poll(t0), Some(PollJob::Ports));
        assert_eq!(schedule.poll(t0), Some(PollJob::DeviceInfo));
        assert_eq!(schedule.poll(t0), None);
        assert_eq!(schedule.next_deadline(), Some(t0 + Duration::from_secs(3)));

        let mut ports = 0;
        let mut info = 0;
        for s in 1..=30 {
            while let Some(job) = schedule.poll(t0 + Duration::from_secs(s)) {
                match job {
                    PollJob::Ports => ports += 1,
                    PollJob::DeviceInfo => info += 1,
                }
            }
        }
        assert_eq!(ports, 10);
        assert_eq!(info, 1);
    }

    #[test]
    fn stop_clears_the_schedule() {
        let t0 = Instant::now();
        let mut schedule = PollSchedule::new(Duration::from_secs(3), Duration::from_secs(30));
        schedule.start(t0);
        schedule.stop();
        assert!(!schedule.is_running());
        assert_eq!(schedule.poll(t0 + Duration::from_secs(60)), None);
        assert_eq!(schedule.next_deadline(), None);
    }

    #[test]
    fn missed_slots_are_not_replayed() {
        let t0 = Instant::now();
        let mut schedule = PollSchedule::new(Duration::from_secs(3), Duration::from_secs(30));
        schedule.start(t0);
        schedule.poll(t0);
        schedule.poll(t0);
        let late = t0 + Duration::from_secs(20);
        assert_eq!(schedule.poll(late), Some(PollJob::Ports));
        assert_eq!(schedule.poll(late), None);
    }

    #[test]
    fn device_info_collects_answers() {
        let peer = Peer { address: "AA".into(), name: "CP02-1".into() };
        let mut info = DeviceInfo::for_peer(Some(&peer));
        info.apply(commands::GET_DEVICE_MODEL, b"CP02\0");
        info.apply(commands::GET_DEVICE_SERIAL_NO, b"SN123");
        info.apply(commands::GET_AP_VERSION, b"1.2.3");
        info.apply(commands::GET_DEVICE_UPTIME, &3_600_000_000u64.to_le_bytes());
        assert_eq!(info.model.as_deref(), Some("CP02"));
        assert_eq!(info.serial.as_deref(), Some("SN123"));
        assert_eq!(info.firmware.as_deref(), Some("1.2.3"));
        assert_eq!(info.uptime_secs, Some(3600));
        assert_eq!(info.name.as_deref(), Some("CP02-1"));
    }

    #[test]
    fn ports_event_serializes_with_type_tag() {
        let event = Telemetry::ports(&[0x02, 80, 72, 0x1E]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ports");
        assert_eq!(json["total_power_w"], 22.5);
        assert_eq!(json["ports"][0]["temperature_c"], 30);
    }
}
