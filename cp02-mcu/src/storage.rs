//! Persistent storage abstraction
//!
//! Settings and per-charger tokens live in the MCU's key-value store (NVS on
//! ESP32). Keys are kept under 15 characters.

use std::collections::HashMap;
use std::fmt;

use cp02_node::TokenStorage;
use serde::{Deserialize, Serialize};

/// Broker settings entered at provisioning time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub gateway_id: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".into(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            gateway_id: "gw01".into(),
        }
    }
}

/// MCU-specific crates implement this with their storage backend
pub trait Storage {
    type Error: fmt::Display;

    fn wifi_credentials(&self) -> Result<Option<(String, String)>, Self::Error>;
    fn set_wifi_credentials(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error>;

    fn mqtt_settings(&self) -> Result<Option<MqttSettings>, Self::Error>;
    fn set_mqtt_settings(&mut self, settings: &MqttSettings) -> Result<(), Self::Error>;

    fn get_u8(&self, key: &str) -> Result<Option<u8>, Self::Error>;
    fn set_u8(&mut self, key: &str, value: u8) -> Result<(), Self::Error>;
    fn remove(&mut self, key: &str) -> Result<(), Self::Error>;

    /// Factory reset: settings and tokens
    fn clear_all(&mut self) -> Result<(), Self::Error>;
}

/// Storage key of the token for the charger at `address`: `t` followed by the
/// address's hex digits, lower-cased.
pub fn token_key(address: &str) -> String {
    let digits: String = address
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("t{digits}")
}

/// Tokens kept in a [`Storage`] under [`token_key`]
#[derive(Debug)]
pub struct StorageTokens<S>(pub S);

impl<S: Storage> TokenStorage for StorageTokens<S> {
    fn load(&self, peer: &str) -> std::io::Result<Option<u8>> {
        self.0.get_u8(&token_key(peer)).map_err(io_error)
    }

    fn save(&mut self, peer: &str, token: u8) -> std::io::Result<()> {
        self.0.set_u8(&token_key(peer), token).map_err(io_error)
    }

    fn remove(&mut self, peer: &str) -> std::io::Result<()> {
        self.0.remove(&token_key(peer)).map_err(io_error)
    }
}

fn io_error(e: impl fmt::Display) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

/// RAM-backed [`Storage`], for simulators and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    pub wifi: Option<(String, String)>,
    pub mqtt: Option<MqttSettings>,
    pub values: HashMap<String, u8>,
}

impl Storage for MemoryStorage {
    type Error = std::convert::Infallible;

    fn wifi_credentials(&self) -> Result<Option<(String, String)>, Self::Error> {
        Ok(self.wifi.clone())
    }

    fn set_wifi_credentials(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error> {
        self.wifi = Some((ssid.to_string(), password.to_string()));
        Ok(())
    }

    fn mqtt_settings(&self) -> Result<Option<MqttSettings>, Self::Error> {
        Ok(self.mqtt.clone())
    }

    fn set_mqtt_settings(&mut self, settings: &MqttSettings) -> Result<(), Self::Error> {
        self.mqtt = Some(settings.clone());
        Ok(())
    }

    fn get_u8(&self, key: &str) -> Result<Option<u8>, Self::Error> {
        Ok(self.values.get(key).copied())
    }

    fn set_u8(&mut self, key: &str, value: u8) -> Result<(), Self::Error> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), Self::Error> {
        self.values.remove(key);
        Ok(())
    }

    fn clear_all(&mut self) -> Result<(), Self::Error> {
        *self = Self::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_key_fits_nvs() {
        let key = token_key("AA:BB:CC:DD:EE:0F");
        assert_eq!(key, "taabbccddee0f");
        assert!(key.len() <= 15);
    }

    #[test]
    fn tokens_ignore_address_case() {
        let mut tokens = StorageTokens(MemoryStorage::default());
        tokens.save("aa:bb:cc:dd:ee:ff", 0x42).unwrap();
        assert_eq!(tokens.load("AA:BB:CC:DD:EE:FF").unwrap(), Some(0x42));
        tokens.remove("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(tokens.load("aa:bb:cc:dd:ee:ff").unwrap(), None);
    }
}
