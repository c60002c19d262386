//! BLE GATT constants and service codes for the CP02 charger
//!
//! The charger exposes a single service with one notify characteristic (TX,
//! device to host) and one write characteristic (RX, host to device). None of
//! these are negotiated.

/// BLE Service UUID: 048e3f2e-e1a6-4707-9e74-a930e898a1ea
pub const SERVICE_UUID: &str = "048e3f2e-e1a6-4707-9e74-a930e898a1ea";

/// TX characteristic (notify, device to host)
pub const TX_CHAR_UUID: &str = "148e3f2e-e1a6-4707-9e74-a930e898a1ea";

/// RX characteristic (write, host to device)
pub const RX_CHAR_UUID: &str = "248e3f2e-e1a6-4707-9e74-a930e898a1ea";

/// Advertised name prefix of every charger
pub const DEVICE_PREFIX: &str = "CP02-";

/// Service codes (request side of the `service` header byte)
pub mod commands {
    // Test commands
    pub const BLE_ECHO_TEST: u8 = 0x00;
    pub const GET_DEBUG_LOG: u8 = 0x01;
    pub const GET_SECURE_BOOT_DIGEST: u8 = 0x02;
    pub const PING_MQTT_TELEMETRY: u8 = 0x03;
    pub const PING_HTTP: u8 = 0x04;
    pub const GET_DEVICE_PASSWORD: u8 = 0x05;
    pub const MANAGE_POWER_ALLOCATOR_ENABLED: u8 = 0x09;

    // Feature management
    pub const MANAGE_POWER_CONFIG: u8 = 0x0a;
    pub const MANAGE_FEATURE_TOGGLE: u8 = 0x0b;
    pub const ENABLE_RELEASE_MODE: u8 = 0x0c;

    /// Associate device - the only command sent without a token
    pub const ASSOCIATE_DEVICE: u8 = 0x10;
    pub const REBOOT_DEVICE: u8 = 0x11;
    pub const RESET_DEVICE: u8 = 0x12;
    pub const GET_DEVICE_SERIAL_NO: u8 = 0x13;
    pub const GET_DEVICE_UPTIME: u8 = 0x14;
    pub const GET_AP_VERSION: u8 = 0x15;
    pub const GET_BP_VERSION: u8 = 0x16;
    pub const GET_FPGA_VERSION: u8 = 0x17;
    pub const GET_ZRLIB_VERSION: u8 = 0x18;
    pub const GET_DEVICE_BLE_ADDR: u8 = 0x19;
    pub const SWITCH_DEVICE: u8 = 0x1a;
    pub const GET_DEVICE_SWITCH: u8 = 0x1b;
    /// Cheap, idempotent, read-only: used as the token probe
    pub const GET_DEVICE_MODEL: u8 = 0x1c;
    pub const PUSH_LICENSE: u8 = 0x1d;
    pub const GET_BLE_RSSI: u8 = 0x1e;
    pub const GET_BLE_MTU: u8 = 0x1f;

    // OTA
    pub const PERFORM_BLE_OTA: u8 = 0x20;
    pub const PERFORM_WIFI_OTA: u8 = 0x21;
    pub const GET_WIFI_OTA_PROGRESS: u8 = 0x22;
    pub const CONFIRM_OTA: u8 = 0x23;

    // WiFi
    pub const SCAN_WIFI: u8 = 0x30;
    pub const GET_WIFI_SCAN_RESULT: u8 = 0x31;
    pub const SET_WIFI_SSID: u8 = 0x32;
    pub const RESET_WIFI: u8 = 0x33;
    pub const GET_WIFI_STATUS: u8 = 0x34;
    pub const GET_DEVICE_WIFI_ADDR: u8 = 0x35;
    pub const SET_WIFI_SSID_AND_PASSWORD: u8 = 0x36;
    pub const GET_WIFI_RECORDS: u8 = 0x37;
    pub const OPERATE_WIFI_RECORD: u8 = 0x38;
    pub const GET_WIFI_STATE_MACHINE: u8 = 0x39;
    pub const SET_WIFI_STATE_MACHINE: u8 = 0x3a;

    // Power
    pub const TOGGLE_PORT_POWER: u8 = 0x40;
    pub const GET_POWER_STATISTICS: u8 = 0x41;
    pub const GET_POWER_SUPPLY_STATUS: u8 = 0x42;
    pub const SET_CHARGING_STRATEGY: u8 = 0x43;
    pub const GET_CHARGING_STATUS: u8 = 0x44;
    pub const GET_POWER_HISTORICAL_STATS: u8 = 0x45;
    pub const SET_PORT_PRIORITY: u8 = 0x46;
    pub const GET_PORT_PRIORITY: u8 = 0x47;
    pub const GET_CHARGING_STRATEGY: u8 = 0x48;
    pub const GET_PORT_PD_STATUS: u8 = 0x49;
    pub const GET_ALL_POWER_STATISTICS: u8 = 0x4a;
    pub const GET_START_CHARGE_TIMESTAMP: u8 = 0x4b;
    pub const TURN_ON_PORT: u8 = 0x4c;
    pub const TURN_OFF_PORT: u8 = 0x4d;
    pub const SET_STATIC_ALLOCATOR: u8 = 0x55;
    pub const GET_STATIC_ALLOCATOR: u8 = 0x56;
    pub const SET_PORT_CONFIG: u8 = 0x57;
    pub const GET_PORT_CONFIG: u8 = 0x58;
    pub const SET_PORT_COMPATIBILITY_SETTINGS: u8 = 0x59;
    pub const GET_PORT_COMPATIBILITY_SETTINGS: u8 = 0x5a;
    pub const SET_TEMPERATURE_MODE: u8 = 0x5b;
    pub const SET_TEMPORARY_ALLOCATOR: u8 = 0x5c;
    pub const SET_PORT_CONFIG1: u8 = 0x5d;
    pub const GET_PORT_CONFIG1: u8 = 0x5e;

    // Display
    pub const SET_DISPLAY_INTENSITY: u8 = 0x70;
    pub const SET_DISPLAY_MODE: u8 = 0x71;
    pub const GET_DISPLAY_INTENSITY: u8 = 0x72;
    pub const GET_DISPLAY_MODE: u8 = 0x73;
    pub const SET_DISPLAY_FLIP: u8 = 0x74;
    pub const GET_DISPLAY_FLIP: u8 = 0x75;
    pub const SET_DISPLAY_CONFIG: u8 = 0x76;
    pub const SET_DISPLAY_STATE: u8 = 0x77;
    pub const GET_DISPLAY_STATE: u8 = 0x78;

    // System
    pub const START_TELEMETRY_STREAM: u8 = 0x90;
    pub const STOP_TELEMETRY_STREAM: u8 = 0x91;
    pub const GET_DEVICE_INFO: u8 = 0x92;
    pub const SET_BLE_STATE: u8 = 0x98;
    pub const SET_SYSLOG_STATE: u8 = 0x99;
    pub const SET_SYSTEM_TIME: u8 = 0x9a;
    pub const START_OTA: u8 = 0x9c;
}

/// Every command except association carries the session token
pub fn needs_token(service: u8) -> bool {
    service != commands::ASSOCIATE_DEVICE
}

/// Name of a service code, for logs
pub fn command_name(service: u8) -> &'static str {
    use commands::*;
    match service {
        BLE_ECHO_TEST => "BLE_ECHO_TEST",
        GET_DEBUG_LOG => "GET_DEBUG_LOG",
        ASSOCIATE_DEVICE => "ASSOCIATE_DEVICE",
        REBOOT_DEVICE => "REBOOT_DEVICE",
        RESET_DEVICE => "RESET_DEVICE",
        GET_DEVICE_SERIAL_NO => "GET_DEVICE_SERIAL_NO",
        GET_DEVICE_UPTIME => "GET_DEVICE_UPTIME",
        GET_AP_VERSION => "GET_AP_VERSION",
        GET_DEVICE_BLE_ADDR => "GET_DEVICE_BLE_ADDR",
        GET_DEVICE_MODEL => "GET_DEVICE_MODEL",
        SET_WIFI_SSID_AND_PASSWORD => "SET_WIFI_SSID_AND_PASSWORD",
        GET_WIFI_STATUS => "GET_WIFI_STATUS",
        SET_CHARGING_STRATEGY => "SET_CHARGING_STRATEGY",
        GET_POWER_HISTORICAL_STATS => "GET_POWER_HISTORICAL_STATS",
        SET_PORT_PRIORITY => "SET_PORT_PRIORITY",
        GET_CHARGING_STRATEGY => "GET_CHARGING_STRATEGY",
        GET_PORT_PD_STATUS => "GET_PORT_PD_STATUS",
        GET_ALL_POWER_STATISTICS => "GET_ALL_POWER_STATISTICS",
        TURN_ON_PORT => "TURN_ON_PORT",
        TURN_OFF_PORT => "TURN_OFF_PORT",
        SET_PORT_CONFIG => "SET_PORT_CONFIG",
        GET_PORT_CONFIG => "GET_PORT_CONFIG",
        SET_TEMPERATURE_MODE => "SET_TEMPERATURE_MODE",
        SET_DISPLAY_INTENSITY => "SET_DISPLAY_INTENSITY",
        SET_DISPLAY_MODE => "SET_DISPLAY_MODE",
        GET_DISPLAY_INTENSITY => "GET_DISPLAY_INTENSITY",
        GET_DISPLAY_MODE => "GET_DISPLAY_MODE",
        SET_DISPLAY_FLIP => "SET_DISPLAY_FLIP",
        GET_DEVICE_INFO => "GET_DEVICE_INFO",
        START_OTA => "START_OTA",
        _ => "UNKNOWN",
    }
}
