//! Payload parsers for the read commands the poller issues

use serde::{Deserialize, Serialize};

/// Bytes per port in a `GET_ALL_POWER_STATISTICS` response
pub const PORT_CHUNK_LEN: usize = 8;

/// Shortest chunk that still carries protocol, current, voltage and temperature
pub const PORT_CHUNK_MIN_LEN: usize = 4;

/// Protocol byte reported by an idle port
pub const PROTOCOL_NOT_CHARGING: u8 = 0xFF;

const PROTOCOL_NAMES: [&str; 21] = [
    "None", "QC2.0", "QC3.0", "QC3+", "SFCP", "AFC", "FCP", "SCP", "VOOC1.0", "VOOC4.0",
    "SuperVOOC2.0", "TFCP", "UFCS", "PE1.0", "PE2.0", "PD 5V", "PD HV", "PD SPR AVS", "PD PPS",
    "PD EPR HV", "PD AVS",
];

/// Fast-charging protocol name for the protocol byte of a port chunk
pub fn protocol_name(protocol: u8) -> &'static str {
    if protocol == PROTOCOL_NOT_CHARGING {
        return "Not charging";
    }
    PROTOCOL_NAMES.get(protocol as usize).copied().unwrap_or("Unknown")
}

/// Two's-complement reading of a byte: `0x61 -> 97`, `0xE0 -> -32`
pub fn signed(b: u8) -> i8 {
    b as i8
}

/// Live readings of one physical port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortTelemetry {
    pub port_id: u8,
    pub protocol: u8,
    pub protocol_name: String,
    pub voltage_v: f32,
    pub current_a: f32,
    pub power_w: f32,
    pub temperature_c: i8,
    pub charging: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_full_capacity: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_present_capacity: Option<u16>,
}

impl PortTelemetry {
    /// Decode one port chunk.
    ///
    /// `b0` protocol, `b1` current in 1/32 A, `b2` voltage in 1/8 V, `b3` signed
    /// temperature, then (8-byte chunks only) two little-endian battery capacities.
    /// Returns `None` for chunks shorter than [`PORT_CHUNK_MIN_LEN`].
    pub fn from_chunk(port_id: u8, chunk: &[u8]) -> Option<Self> {
        if chunk.len() < PORT_CHUNK_MIN_LEN {
            return None;
        }

        let protocol = chunk[0];
        let current_a = chunk[1] as f32 / 32.0;
        let voltage_v = chunk[2] as f32 / 8.0;
        let (battery_full_capacity, battery_present_capacity) = if chunk.len() >= PORT_CHUNK_LEN {
            (
                Some(u16::from_le_bytes([chunk[4], chunk[5]])),
                Some(u16::from_le_bytes([chunk[6], chunk[7]])),
            )
        } else {
            (None, None)
        };

        Some(Self {
            port_id,
            protocol,
            protocol_name: protocol_name(protocol).to_string(),
            voltage_v,
            current_a,
            power_w: voltage_v * current_a,
            temperature_c: signed(chunk[3]),
            charging: current_a > 0.01,
            enabled: protocol != PROTOCOL_NOT_CHARGING || voltage_v > 0.0 || current_a > 0.0,
            battery_full_capacity,
            battery_present_capacity,
        })
    }
}

/// Decode a `GET_ALL_POWER_STATISTICS` payload into one entry per port.
///
/// Some firmware prefixes the chunks with a `0x00` status byte; it is skipped
/// when the payload length is `8n + 1`. A trailing chunk of 4..8 bytes still
/// yields a port without battery capacities.
pub fn parse_port_statistics(payload: &[u8]) -> Vec<PortTelemetry> {
    let data = match payload.split_first() {
        Some((0x00, rest)) if payload.len() % PORT_CHUNK_LEN == 1 => rest,
        _ => payload,
    };

    data.chunks(PORT_CHUNK_LEN)
        .enumerate()
        .filter_map(|(i, chunk)| PortTelemetry::from_chunk(i as u8, chunk))
        .collect()
}

/// Sum of the power drawn on every port
pub fn total_power(ports: &[PortTelemetry]) -> f32 {
    ports.iter().map(|p| p.power_w).sum()
}

/// Text payloads (model, serial, firmware version): NUL-terminated, with
/// non-printable bytes replaced by spaces.
pub fn parse_text(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    payload[..end]
        .iter()
        .map(|b| if (32..=126).contains(b) { *b as char } else { ' ' })
        .collect::<String>()
        .trim()
        .to_string()
}

/// `GET_DEVICE_UPTIME`: little-endian microseconds as `u64` on current firmware,
/// big-endian seconds as `u32` on older builds.
pub fn parse_uptime_secs(payload: &[u8]) -> Option<u64> {
    if payload.len() >= 8 {
        let mut micros = [0u8; 8];
        micros.copy_from_slice(&payload[..8]);
        Some(u64::from_le_bytes(micros) / 1_000_000)
    } else if payload.len() >= 4 {
        Some(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_is_twos_complement() {
        assert_eq!(signed(0x61), 97);
        assert_eq!(signed(0xE0), -32);
        assert_eq!(signed(0x80), -128);
        assert_eq!(signed(0x7F), 127);
    }

    #[test]
    fn reference_port_chunk() {
        let port = PortTelemetry::from_chunk(0, &[0x02, 80, 72, 0x1E]).unwrap();
        assert_eq!(port.protocol, 2);
        assert_eq!(port.protocol_name, "QC3.0");
        assert_eq!(port.current_a, 2.5);
        assert_eq!(port.voltage_v, 9.0);
        assert_eq!(port.power_w, 22.5);
        assert_eq!(port.temperature_c, 30);
        assert!(port.charging);
        assert_eq!(port.battery_full_capacity, None);

        assert_eq!(parse_port_statistics(&[0x02, 80, 72, 0x1E]), vec![port]);
    }

    #[test]
    fn hot_port_does_not_wrap_to_huge_temperature() {
        let port = PortTelemetry::from_chunk(1, &[0x12, 0, 40, 0x61, 0, 0, 0, 0]).unwrap();
        assert_eq!(port.temperature_c, 97);
        let cold = PortTelemetry::from_chunk(1, &[0x12, 0, 40, 0xE0, 0, 0, 0, 0]).unwrap();
        assert_eq!(cold.temperature_c, -32);
        assert!(!cold.charging);
    }

    #[test]
    fn walks_eight_byte_chunks_after_status_byte() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&[0x12, 96, 160, 35, 0x10, 0x27, 0x88, 0x13]);
        payload.extend_from_slice(&[0xFF, 0, 0, 25, 0, 0, 0, 0]);

        let ports = parse_port_statistics(&payload);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port_id, 0);
        assert_eq!(ports[0].protocol_name, "PD PPS");
        assert_eq!(ports[0].voltage_v, 20.0);
        assert_eq!(ports[0].current_a, 3.0);
        assert_eq!(ports[0].power_w, 60.0);
        assert_eq!(ports[0].battery_full_capacity, Some(10000));
        assert_eq!(ports[0].battery_present_capacity, Some(5000));
        assert_eq!(ports[1].port_id, 1);
        assert!(!ports[1].enabled);
        assert!(!ports[1].charging);
        assert_eq!(total_power(&ports), 60.0);
    }

    #[test]
    fn leading_zero_protocol_is_kept_on_aligned_payloads() {
        let ports = parse_port_statistics(&[0x00, 32, 40, 20, 0, 0, 0, 0]);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].protocol, 0);
        assert_eq!(ports[0].current_a, 1.0);
    }

    #[test]
    fn short_tail_is_ignored() {
        assert!(parse_port_statistics(&[0x02, 80, 72]).is_empty());
    }

    #[test]
    fn text_and_uptime() {
        assert_eq!(parse_text(b"CP02\x01Pro\0garbage"), "CP02 Pro");
        assert_eq!(parse_uptime_secs(&90_000_000u64.to_le_bytes()), Some(90));
        assert_eq!(parse_uptime_secs(&[0, 0, 1, 0]), Some(256));
        assert_eq!(parse_uptime_secs(&[1, 2]), None);
    }
}
