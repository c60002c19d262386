//! Bridge adapter: external command names to device calls and back
//!
//! The outside world (MQTT, WebSocket, the CLI) speaks JSON:
//!
//! ```json
//! {"command": "turn_on_port", "params": {"port_id": 1}, "cmd_id": "42"}
//! {"success": true, "data": {...}, "cmd_id": "42"}
//! ```
//!
//! `action` is accepted in place of `command`. A name that is not in the table
//! parses to [`BridgeCommand::Unknown`] and is answered with `UnknownCommand`
//! without touching the dispatcher.

use cp02_proto::ble::commands;
use cp02_proto::{Message, telemetry};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::poller::Telemetry;
use crate::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    #[serde(alias = "action")]
    pub command: String,
    #[serde(default)]
    pub params: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<String>,
}

impl BridgeRequest {
    pub fn new(command: &str, params: JsonValue) -> Self {
        Self { command: command.to_string(), params, cmd_id: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<String>,
}

impl BridgeResponse {
    pub fn ok(data: JsonValue) -> Self {
        let data = if data.is_null() { None } else { Some(data) };
        Self { success: true, data, error: None, error_kind: None, cmd_id: None }
    }

    pub fn err(error: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            cmd_id: None,
        }
    }

    pub fn from_result(result: Result<JsonValue>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }

    pub fn with_cmd_id(mut self, cmd_id: Option<String>) -> Self {
        self.cmd_id = cmd_id;
        self
    }
}

/// A frame-level call the dispatcher can send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCall {
    pub service: u8,
    pub body: Vec<u8>,
}

/// WiFi network as reported to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    pub rssi: i8,
    pub auth_required: bool,
}

/// OTA state as reported to the bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaProgress {
    pub in_progress: bool,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    // Ports
    TurnOnPort { port: u8 },
    TurnOffPort { port: u8 },
    GetPortStatus,
    GetPortPdStatus { port: u8 },
    SetPortPriority { port: u8, priority: u8 },
    GetPortConfig { port: u8 },
    SetPortConfig { port: u8, protocol: u8 },

    // Device
    Reboot,
    FactoryReset,
    GetDeviceModel,
    GetDeviceSerial,
    GetApVersion,
    GetBleAddr,
    GetUptime,
    /// Port statistics plus every device-info read
    Refresh,
    SetDeviceWifi { ssid: String, password: String },

    // Display
    SetBrightness(u8),
    SetDisplayMode(u8),
    FlipDisplay,

    // Strategy
    SetPowerMode(u8),
    GetChargingStrategy,
    SetTempMode(bool),
    GetPowerCurve,

    // Debug
    BleEchoTest(String),
    GetDebugLog,
    /// Any service code with a hex payload; the token rule still applies
    Raw { service: u8, data: Vec<u8> },

    // Handled by the gateway itself
    Status,
    GetToken,
    SetToken(u8),
    ClearToken,
    BruteforceToken,
    ConnectTo(String),
    ScanBle,
    DisconnectBle,
    ScanWifi,
    SetWifi { ssid: String, password: String },
    StartOta(String),
    GetOtaProgress,

    Unknown(String),
}

impl BridgeCommand {
    pub fn parse(request: &BridgeRequest) -> Result<Self> {
        let name = request.command.as_str();
        let p = Params { command: name, params: &request.params };

        let command = match name {
            "turn_on_port" => BridgeCommand::TurnOnPort { port: p.port()? },
            "turn_off_port" => BridgeCommand::TurnOffPort { port: p.port()? },
            "get_port_status" | "get_all_power_statistics" => BridgeCommand::GetPortStatus,
            "get_port_pd_status" => BridgeCommand::GetPortPdStatus { port: p.port()? },
            "set_port_priority" => BridgeCommand::SetPortPriority {
                port: p.port()?,
                priority: p.u8(&["priority"])?,
            },
            "get_port_config" => BridgeCommand::GetPortConfig { port: p.port()? },
            "set_port_config" => BridgeCommand::SetPortConfig {
                port: p.port()?,
                protocol: p.u8(&["protocol"])?,
            },

            "reboot" | "reboot_device" => BridgeCommand::Reboot,
            "factory_reset" | "reset_device" => BridgeCommand::FactoryReset,
            "get_device_model" => BridgeCommand::GetDeviceModel,
            "get_device_serial" => BridgeCommand::GetDeviceSerial,
            "get_ap_version" => BridgeCommand::GetApVersion,
            "get_ble_addr" => BridgeCommand::GetBleAddr,
            "get_device_uptime" => BridgeCommand::GetUptime,
            "refresh" | "get_device_info" => BridgeCommand::Refresh,
            "set_device_wifi" => BridgeCommand::SetDeviceWifi {
                ssid: p.string("ssid")?,
                password: p.optional_string("password").unwrap_or_default(),
            },

            "set_brightness" | "set_display_brightness" => {
                BridgeCommand::SetBrightness(p.optional_u8(&["brightness"])?.unwrap_or(50))
            }
            "set_display_mode" => BridgeCommand::SetDisplayMode(p.u8(&["mode"])?),
            "flip_display" => BridgeCommand::FlipDisplay,

            "set_power_mode" | "set_charging_strategy" => {
                BridgeCommand::SetPowerMode(p.u8(&["mode", "strategy"])?)
            }
            "get_charging_strategy" => BridgeCommand::GetChargingStrategy,
            "set_temp_mode" | "set_temperature_mode" => {
                BridgeCommand::SetTempMode(p.flag(&["enabled", "mode"])?)
            }
            "get_power_curve" | "get_power_stats" => BridgeCommand::GetPowerCurve,

            "ble_echo_test" => {
                BridgeCommand::BleEchoTest(p.optional_string("data").unwrap_or_else(|| "echo".into()))
            }
            "get_debug_log" => BridgeCommand::GetDebugLog,
            "send_raw" => BridgeCommand::Raw {
                service: p.u8(&["service"])?,
                data: p.hex("data")?,
            },

            "status" => BridgeCommand::Status,
            "get_token" => BridgeCommand::GetToken,
            "set_token" => BridgeCommand::SetToken(p.u8(&["token"])?),
            "clear_token" => BridgeCommand::ClearToken,
            "bruteforce_token" => BridgeCommand::BruteforceToken,
            "connect_to" => BridgeCommand::ConnectTo(p.string("device_name")?),
            "scan_ble" => BridgeCommand::ScanBle,
            "disconnect_ble" => BridgeCommand::DisconnectBle,
            "scan_wifi" => BridgeCommand::ScanWifi,
            "set_wifi" => BridgeCommand::SetWifi {
                ssid: p.string("ssid")?,
                password: p.optional_string("password").unwrap_or_default(),
            },
            "start_ota" | "ota_update" => BridgeCommand::StartOta(p.string("url")?),
            "get_ota_progress" => BridgeCommand::GetOtaProgress,

            other => BridgeCommand::Unknown(other.to_string()),
        };
        Ok(command)
    }

    /// The single frame this command sends, or `None` for commands the
    /// gateway answers itself (and composites such as [`BridgeCommand::Refresh`]).
    pub fn device_call(&self) -> Option<DeviceCall> {
        use BridgeCommand as C;

        let (service, body) = match self {
            C::TurnOnPort { port } => (commands::TURN_ON_PORT, vec![*port]),
            C::TurnOffPort { port } => (commands::TURN_OFF_PORT, vec![*port]),
            C::GetPortStatus => (commands::GET_ALL_POWER_STATISTICS, vec![]),
            C::GetPortPdStatus { port } => (commands::GET_PORT_PD_STATUS, vec![*port]),
            C::SetPortPriority { port, priority } => (commands::SET_PORT_PRIORITY, vec![*port, *priority]),
            C::GetPortConfig { port } => (commands::GET_PORT_CONFIG, vec![*port]),
            C::SetPortConfig { port, protocol } => (commands::SET_PORT_CONFIG, vec![*port, *protocol]),
            C::Reboot => (commands::REBOOT_DEVICE, vec![]),
            C::FactoryReset => (commands::RESET_DEVICE, vec![]),
            C::GetDeviceModel => (commands::GET_DEVICE_MODEL, vec![]),
            C::GetDeviceSerial => (commands::GET_DEVICE_SERIAL_NO, vec![]),
            C::GetApVersion => (commands::GET_AP_VERSION, vec![]),
            C::GetBleAddr => (commands::GET_DEVICE_BLE_ADDR, vec![]),
            C::GetUptime => (commands::GET_DEVICE_UPTIME, vec![]),
            C::SetDeviceWifi { ssid, password } => {
                let mut body = Vec::with_capacity(ssid.len() + password.len() + 2);
                body.extend_from_slice(ssid.as_bytes());
                body.push(0);
                body.extend_from_slice(password.as_bytes());
                body.push(0);
                (commands::SET_WIFI_SSID_AND_PASSWORD, body)
            }
            C::SetBrightness(level) => (commands::SET_DISPLAY_INTENSITY, vec![*level]),
            C::SetDisplayMode(mode) => (commands::SET_DISPLAY_MODE, vec![*mode]),
            C::FlipDisplay => (commands::SET_DISPLAY_FLIP, vec![1]),
            C::SetPowerMode(mode) => (commands::SET_CHARGING_STRATEGY, vec![*mode]),
            C::GetChargingStrategy => (commands::GET_CHARGING_STRATEGY, vec![]),
            C::SetTempMode(enabled) => (commands::SET_TEMPERATURE_MODE, vec![u8::from(*enabled)]),
            C::GetPowerCurve => (commands::GET_POWER_HISTORICAL_STATS, vec![]),
            C::BleEchoTest(text) => (commands::BLE_ECHO_TEST, text.as_bytes().to_vec()),
            C::GetDebugLog => (commands::GET_DEBUG_LOG, vec![]),
            C::Raw { service, data } => (*service, data.clone()),
            _ => return None,
        };
        Some(DeviceCall { service, body })
    }

    /// Render the device's answer for the bridge
    pub fn decode(&self, message: &Message) -> Result<JsonValue> {
        use BridgeCommand as C;
        let payload = message.payload.as_slice();

        let doc = match self {
            C::GetPortStatus => serde_json::to_value(Telemetry::ports(payload))?,
            C::GetDeviceModel => json!({ "model": telemetry::parse_text(payload) }),
            C::GetDeviceSerial => json!({ "serial": telemetry::parse_text(payload) }),
            C::GetApVersion => json!({ "firmware": telemetry::parse_text(payload) }),
            C::GetBleAddr => json!({ "address": format_address(payload) }),
            C::GetUptime => json!({ "uptime_secs": telemetry::parse_uptime_secs(payload) }),
            C::GetPortPdStatus { port } => json!({ "port_id": port, "pd_status": payload.first() }),
            C::GetPortConfig { port } if payload.len() >= 2 => {
                json!({ "port_id": port, "protocol": payload[0], "priority": payload[1] })
            }
            C::GetChargingStrategy => json!({ "strategy": payload.first() }),
            C::GetPowerCurve => json!({ "curve": payload.iter().take(24).collect::<Vec<_>>() }),
            C::BleEchoTest(_) => json!({ "data": String::from_utf8_lossy(payload) }),
            C::GetDebugLog => json!({ "log": String::from_utf8_lossy(payload) }),
            _ if payload.is_empty() => JsonValue::Null,
            _ => json!({ "payload": data_encoding::HEXLOWER.encode(payload) }),
        };
        Ok(doc)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, BridgeCommand::Unknown(_))
    }
}

/// Colon-separated hex, as BLE addresses are usually shown
pub fn format_address(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

struct Params<'a> {
    command: &'a str,
    params: &'a JsonValue,
}

impl Params<'_> {
    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::invalid_params(self.command, reason)
    }

    fn optional_u8(&self, keys: &[&str]) -> Result<Option<u8>> {
        for key in keys {
            match self.params.get(*key) {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::Bool(b)) => return Ok(Some(u8::from(*b))),
                Some(value) => {
                    let n = value
                        .as_u64()
                        .ok_or_else(|| self.invalid(format!("{key} must be a non-negative integer")))?;
                    let n = u8::try_from(n).map_err(|_| self.invalid(format!("{key} must be 0..=255")))?;
                    return Ok(Some(n));
                }
            }
        }
        Ok(None)
    }

    fn u8(&self, keys: &[&str]) -> Result<u8> {
        self.optional_u8(keys)?
            .ok_or_else(|| self.invalid(format!("{} required", keys.join(" or "))))
    }

    fn port(&self) -> Result<u8> {
        self.u8(&["port_id", "port"])
    }

    fn flag(&self, keys: &[&str]) -> Result<bool> {
        Ok(self.u8(keys)? != 0)
    }

    fn optional_string(&self, key: &str) -> Option<String> {
        self.params.get(key).and_then(JsonValue::as_str).map(str::to_string)
    }

    fn string(&self, key: &str) -> Result<String> {
        match self.optional_string(key) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(self.invalid(format!("{key} required"))),
        }
    }

    fn hex(&self, key: &str) -> Result<Vec<u8>> {
        match self.optional_string(key) {
            None => Ok(Vec::new()),
            Some(s) => data_encoding::HEXLOWER_PERMISSIVE
                .decode(s.as_bytes())
                .map_err(|e| self.invalid(format!("{key} is not hex: {e}"))),
        }
    }
}
