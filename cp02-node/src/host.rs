//! Bridge front end for the async engine
//!
//! [`Host::handle`] takes one [`BridgeRequest`] and answers it, either with a
//! device call through the engine or locally (token, session, WiFi/OTA).

use std::future::Future;

use serde_json::{Value as JsonValue, json};

use crate::bridge::{BridgeCommand, BridgeRequest, BridgeResponse, OtaProgress, WifiNetwork};
use crate::engine::EngineHandle;
use crate::{Error, Result};

/// WiFi and firmware update hooks of whatever runs the bridge
pub trait Provisioning: Send + Sync + 'static {
    fn scan_wifi(&self) -> impl Future<Output = Result<Vec<WifiNetwork>>> + Send;
    fn set_wifi(&self, ssid: &str, password: &str) -> impl Future<Output = Result<()>> + Send;
    fn start_ota(&self, url: &str) -> impl Future<Output = Result<()>> + Send;
    fn ota_progress(&self) -> impl Future<Output = Result<OtaProgress>> + Send;
}

/// For hosts without WiFi or OTA: those commands answer `Unsupported`
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProvisioning;

impl Provisioning for NoProvisioning {
    async fn scan_wifi(&self) -> Result<Vec<WifiNetwork>> {
        Err(Error::Unsupported("scan_wifi".into()))
    }

    async fn set_wifi(&self, _ssid: &str, _password: &str) -> Result<()> {
        Err(Error::Unsupported("set_wifi".into()))
    }

    async fn start_ota(&self, _url: &str) -> Result<()> {
        Err(Error::Unsupported("start_ota".into()))
    }

    async fn ota_progress(&self) -> Result<OtaProgress> {
        Err(Error::Unsupported("get_ota_progress".into()))
    }
}

#[derive(Clone)]
pub struct Host<P = NoProvisioning> {
    engine: EngineHandle,
    provisioning: P,
}

impl Host {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine, provisioning: NoProvisioning }
    }
}

impl<P: Provisioning> Host<P> {
    pub fn with_provisioning(engine: EngineHandle, provisioning: P) -> Self {
        Self { engine, provisioning }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub async fn handle(&self, request: BridgeRequest) -> BridgeResponse {
        let cmd_id = request.cmd_id.clone();
        let result = match BridgeCommand::parse(&request) {
            Ok(command) => self.execute(command).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log::debug!("{} failed: {e}", request.command);
        }
        BridgeResponse::from_result(result).with_cmd_id(cmd_id)
    }

    async fn execute(&self, command: BridgeCommand) -> Result<JsonValue> {
        use BridgeCommand as C;

        if let Some(call) = command.device_call() {
            let message = self.engine.send(call.service, call.body).await?;
            return command.decode(&message);
        }

        match command {
            C::Status => Ok(serde_json::to_value(self.engine.status().await?)?),
            C::Refresh => {
                self.engine.refresh().await?;
                Ok(json!({ "refresh": "scheduled" }))
            }
            C::GetToken => Ok(json!({ "token": self.engine.token().await? })),
            C::SetToken(token) => {
                self.engine.set_token(token).await?;
                Ok(json!({ "token": token }))
            }
            C::ClearToken => {
                self.engine.clear_token().await?;
                Ok(JsonValue::Null)
            }
            C::BruteforceToken => match self.engine.bruteforce(0..=255).await? {
                Some(token) => Ok(json!({ "token": token })),
                None => Err(Error::TokenUnknown),
            },
            C::ConnectTo(target) => {
                self.engine.connect(Some(target.clone())).await?;
                Ok(json!({ "connected": target }))
            }
            C::ScanBle => {
                self.engine.rescan().await?;
                Ok(json!({ "scan": "started" }))
            }
            C::DisconnectBle => {
                self.engine.disconnect().await?;
                Ok(JsonValue::Null)
            }
            C::ScanWifi => {
                let networks = self.provisioning.scan_wifi().await?;
                Ok(json!({ "networks": networks }))
            }
            C::SetWifi { ssid, password } => {
                self.provisioning.set_wifi(&ssid, &password).await?;
                Ok(json!({ "ssid": ssid }))
            }
            C::StartOta(url) => {
                self.provisioning.start_ota(&url).await?;
                Ok(json!({ "ota": "started" }))
            }
            C::GetOtaProgress => Ok(serde_json::to_value(self.provisioning.ota_progress().await?)?),
            C::Unknown(name) => Err(Error::UnknownCommand(name)),
            other => Err(Error::Unsupported(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use cp02_proto::ble::commands;

    fn request(value: JsonValue) -> BridgeRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn device_command_round_trip() {
        let h = start(MockDevice::charger(), test_config(), Some(TOKEN));
        h.handle.connect(None).await.unwrap();
        let host = Host::new(h.handle.clone());

        let response = host
            .handle(request(json!({"command": "get_device_model", "cmd_id": "m1"})))
            .await;
        assert!(response.success, "{response:?}");
        assert_eq!(response.data, Some(json!({"model": "CP02"})));
        assert_eq!(response.cmd_id.as_deref(), Some("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_command_never_reaches_the_device() {
        let h = start(MockDevice::charger(), test_config(), Some(TOKEN));
        h.handle.connect(None).await.unwrap();
        let host = Host::new(h.handle.clone());
        let writes_before = h.device.lock().unwrap().writes.len();

        let response = host.handle(request(json!({"command": "launch_rockets"}))).await;
        assert!(!response.success);
        assert_eq!(response.error_kind, Some(crate::ErrorKind::UnknownCommand));
        assert_eq!(h.device.lock().unwrap().writes.len(), writes_before);
    }

    #[tokio::test(start_paused = true)]
    async fn token_commands_are_local() {
        let h = start(MockDevice::charger(), test_config(), None);
        let host = Host::new(h.handle.clone());

        let set = host.handle(request(json!({"command": "set_token", "params": {"token": 66}}))).await;
        assert!(set.success);
        let get = host.handle(request(json!({"command": "get_token"}))).await;
        assert_eq!(get.data, Some(json!({"token": 66})));

        h.handle.connect(None).await.unwrap();
        host.handle(request(json!({"command": "turn_on_port", "params": {"port_id": 0}})))
            .await;
        let device = h.device.lock().unwrap();
        let frame = device.writes.iter().find(|f| f[2] == commands::TURN_ON_PORT).unwrap();
        assert_eq!(&frame[9..], &[66, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn device_command_while_disconnected() {
        let h = start(MockDevice::charger(), test_config(), Some(TOKEN));
        let host = Host::new(h.handle.clone());
        let response = host.handle(request(json!({"command": "reboot"}))).await;
        assert_eq!(response.error_kind, Some(crate::ErrorKind::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_is_unsupported_by_default() {
        let h = start(MockDevice::charger(), test_config(), None);
        let host = Host::new(h.handle.clone());
        let response = host
            .handle(request(json!({"command": "start_ota", "params": {"url": "http://x/fw.bin"}})))
            .await;
        assert_eq!(response.error_kind, Some(crate::ErrorKind::Unsupported));
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_rendered_from_the_engine() {
        let h = start(MockDevice::charger(), test_config(), Some(TOKEN));
        h.handle.connect(None).await.unwrap();
        let host = Host::new(h.handle.clone());

        let response = host.handle(request(json!({"command": "status"}))).await;
        assert!(response.success, "{response:?}");
        let data = response.data.unwrap();
        assert_eq!(data["state"], "connected");
        assert_eq!(data["token_known"], true);
        assert_eq!(data["device"]["address"], ADDRESS);
    }
}
