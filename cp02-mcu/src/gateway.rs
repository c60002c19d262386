//! The gateway: one charger on BLE, one broker on MQTT, driven by `tick`
//!
//! The firmware main loop calls [`Gateway::tick`] every ~10 ms with the current
//! time and the reset button level. Each tick drains MQTT commands and BLE
//! notifications, expires timeouts, advances the session, runs due poll jobs,
//! steps the token search and writes at most one frame.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use cp02_node::{
    BridgeCommand, BridgeRequest, BridgeResponse, DeviceInfo, Dispatcher, Error, JsonValue,
    Message, Outbound, PollJob, PollSchedule, Request, Result, ScanFilter, Session, SessionAction,
    SessionEvent, SessionState, StatusReport, Telemetry, TokenSearch, TokenStore, json,
};
use cp02_proto::ble::{self, commands};

use crate::ble::BleCentral;
use crate::button::{RESET_HOLD, ResetButton};
use crate::mqtt::{Mqtt, QOS_COMMAND, QOS_STATUS, QOS_TELEMETRY, Topics};
use crate::ota::Ota;
use crate::storage::{Storage, StorageTokens};
use crate::wifi::Wifi;

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub node: cp02_node::Config,
    pub gateway_id: String,
    pub heartbeat_every: Duration,
    pub reset_hold: Duration,
}

impl GatewayConfig {
    pub fn new(gateway_id: &str) -> Self {
        Self {
            node: cp02_node::Config::gateway(),
            gateway_id: gateway_id.to_string(),
            heartbeat_every: Duration::from_secs(10),
            reset_hold: RESET_HOLD,
        }
    }
}

/// What the main loop does after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Settings were cleared or new firmware is in place
    Restart,
}

enum Slot {
    Bridge { command: BridgeCommand, cmd_id: Option<String> },
    Poll(PollJob, u8),
    Probe(u8),
}

struct Search {
    search: TokenSearch,
    probing: bool,
    resume_at: Option<Instant>,
    /// Started by `bruteforce_token`: answer on `cmd_response` when done
    reply: Option<Option<String>>,
}

pub struct Gateway<B, W, O, M, S: Storage> {
    ble: B,
    wifi: W,
    ota: O,
    mqtt: M,
    tokens: TokenStore<StorageTokens<S>>,
    config: GatewayConfig,
    topics: Topics,
    filter: ScanFilter,
    session: Session,
    dispatcher: Dispatcher<Slot>,
    poller: PollSchedule,
    ports_pending: usize,
    info_pending: usize,
    device_info: DeviceInfo,
    search: Option<Search>,
    backoff_until: Option<Instant>,
    next_heartbeat: Option<Instant>,
    reset: ResetButton,
    ota_active: bool,
    /// The broker session the command subscription was made on is still up
    subscribed: bool,
    connect_replies: Vec<Option<String>>,
    booted_at: Instant,
    now: Instant,
}

impl<B, W, O, M, S> Gateway<B, W, O, M, S>
where
    B: BleCentral,
    W: Wifi,
    O: Ota,
    M: Mqtt,
    S: Storage,
{
    pub fn new(ble: B, wifi: W, ota: O, mqtt: M, storage: S, config: GatewayConfig) -> Self {
        let node = &config.node;
        let now = Instant::now();
        Self {
            tokens: TokenStore::new(StorageTokens(storage), node.token),
            topics: Topics::new(&config.gateway_id),
            filter: node.scan_filter(),
            session: Session::new(node.max_retries, node.backoff()),
            dispatcher: Dispatcher::new(node.match_by_msg_id),
            poller: PollSchedule::new(node.ports_poll(), node.info_poll()),
            ports_pending: 0,
            info_pending: 0,
            device_info: DeviceInfo::default(),
            search: None,
            backoff_until: None,
            next_heartbeat: None,
            reset: ResetButton::new(config.reset_hold),
            ota_active: false,
            subscribed: false,
            connect_replies: Vec::new(),
            booted_at: now,
            now,
            ble,
            wifi,
            ota,
            mqtt,
            config,
        }
    }

    /// Announce the gateway and start looking for a charger
    pub fn start(&mut self, now: Instant) {
        self.now = now;
        self.booted_at = now;
        self.next_heartbeat = Some(now + self.config.heartbeat_every);
        log::info!("CP02 gateway {} v{GATEWAY_VERSION} starting", self.config.gateway_id);
        self.subscribe_commands();
        self.publish_status("online", Some("Gateway started"));
        self.apply(SessionEvent::StartScan);
    }

    pub fn tick(&mut self, now: Instant, reset_pressed: bool) -> Control {
        self.now = now;

        if self.reset.update(reset_pressed, now) {
            log::warn!("reset button held, clearing all settings");
            self.publish_status("reset", Some("Clearing settings"));
            if let Err(e) = self.storage_mut().clear_all() {
                log::error!("clearing settings failed: {e}");
            }
            return Control::Restart;
        }

        if let Some(control) = self.check_ota() {
            return control;
        }

        self.subscribe_commands();
        while let Some((topic, payload)) = self.mqtt.poll_message() {
            if self.topics.is_cmd(&topic) {
                self.on_mqtt_command(&payload);
            }
        }

        if !self.ota_active {
            self.drive_link();
        }

        if self.next_heartbeat.is_some_and(|at| at <= now) {
            self.next_heartbeat = Some(now + self.config.heartbeat_every);
            self.publish_heartbeat();
        }
        Control::Continue
    }

    fn drive_link(&mut self) {
        while let Some(data) = self.ble.poll_notification() {
            if let Some((slot, result)) = self.dispatcher.on_notification(&data) {
                self.resolve(slot, result);
            }
        }

        if self.session.is_connected() && !self.ble.is_connected() {
            self.apply(SessionEvent::LinkDown);
        }

        if let Some((slot, err)) = self.dispatcher.poll_timeout(self.now) {
            self.resolve(slot, Err(err));
            if self.session.is_connected() && self.dispatcher.is_dead_link() {
                self.apply(SessionEvent::DeadLink);
            }
        }

        if self.backoff_until.is_some_and(|at| at <= self.now) {
            self.backoff_until = None;
            self.apply(SessionEvent::BackoffElapsed);
        }

        if self.session.is_connected() {
            while let Some(job) = self.poller.poll(self.now) {
                self.run_job(job);
            }
        }

        self.step_search();
        self.pump();
    }

    /// (Re)subscribe to `cmd` whenever the broker connection comes back
    fn subscribe_commands(&mut self) {
        if !self.mqtt.is_connected() {
            self.subscribed = false;
            return;
        }
        if self.subscribed {
            return;
        }
        let topic = self.topics.cmd();
        match self.mqtt.subscribe(&topic, QOS_COMMAND) {
            Ok(()) => {
                log::info!("subscribed to {topic}");
                self.subscribed = true;
            }
            Err(e) => log::warn!("subscribe to {topic} failed: {e}"),
        }
    }

    /// Track the OTA flag; a finished update restarts into the new image
    fn check_ota(&mut self) -> Option<Control> {
        let active = self.ota.in_progress();
        if active == self.ota_active {
            return None;
        }
        self.ota_active = active;
        if active {
            log::info!("OTA started, suspending BLE");
            self.publish_status("ota_start", Some("OTA update starting"));
            return None;
        }
        match self.ota.progress().error {
            Some(error) => {
                log::error!("OTA failed: {error}");
                self.publish_status("ota_error", Some(&error));
                None
            }
            None => {
                self.publish_status("ota_complete", Some("OTA update complete, restarting"));
                Some(Control::Restart)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.session.state(),
            connected: self.session.is_connected(),
            device: self.session.peer().cloned(),
            token_known: self.tokens.get().is_some(),
            searching_token: self.tokens.is_searching(),
            retries: self.session.retries(),
            link_lost: self.session.link_lost(),
            last_error: self.session.last_error().map(str::to_string),
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn token(&self) -> Option<u8> {
        self.tokens.get()
    }

    pub fn ble_mut(&mut self) -> &mut B {
        &mut self.ble
    }

    pub fn ota_mut(&mut self) -> &mut O {
        &mut self.ota
    }

    pub fn mqtt_mut(&mut self) -> &mut M {
        &mut self.mqtt
    }

    pub fn storage(&self) -> &S {
        &self.tokens.storage().0
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.tokens.storage_mut().0
    }

    fn uptime(&self) -> Duration {
        self.now.saturating_duration_since(self.booted_at)
    }

    // session

    fn apply(&mut self, event: SessionEvent) {
        let before = self.session.state();
        let mut events = vec![event];
        while !events.is_empty() {
            for event in std::mem::take(&mut events) {
                for action in self.session.handle(event) {
                    events.extend(self.execute(action));
                }
            }
        }

        let state = self.session.state();
        match state {
            SessionState::Connected => {
                let peer = self.session.peer().cloned();
                for cmd_id in std::mem::take(&mut self.connect_replies) {
                    self.respond(cmd_id, Ok(json!({ "connected": peer })));
                }
            }
            SessionState::Disconnected => {
                let attempts = self.session.retries();
                let link_lost = self.session.link_lost();
                if link_lost && !self.connect_replies.is_empty() {
                    log::info!("connect_to failed, dropping the target pin");
                    self.filter.target = self.config.node.target.clone();
                }
                for cmd_id in std::mem::take(&mut self.connect_replies) {
                    let err = if link_lost { Error::LinkLost { attempts } } else { Error::NotConnected };
                    self.respond(cmd_id, Err(err));
                }
            }
            _ => {}
        }

        if state != before {
            let status = format!("ble_{state}");
            let message = match state {
                SessionState::Connected => self.session.peer().map(|p| p.name.clone()),
                _ => self.session.last_error().map(str::to_string),
            };
            self.publish_status(&status, message.as_deref());
        }
    }

    fn execute(&mut self, action: SessionAction) -> Option<SessionEvent> {
        let node = &self.config.node;
        match action {
            SessionAction::Scan => {
                let found = self.ble.scan(node.scan_ms).unwrap_or_else(|e| {
                    log::warn!("BLE scan failed: {e}");
                    Vec::new()
                });
                Some(match self.filter.select(&found) {
                    Some(peer) => SessionEvent::DeviceFound(peer),
                    None => SessionEvent::ScanEmpty,
                })
            }
            SessionAction::Connect(peer) => {
                while self.ble.poll_notification().is_some() {}
                self.tokens.bind(&peer.address);
                log::info!("connecting to {} ({})", peer.name, peer.address);
                Some(match self.ble.connect(&peer, node.connect_timeout_ms) {
                    Ok(()) => SessionEvent::LinkUp,
                    Err(e) => SessionEvent::ConnectFailed(e.to_string()),
                })
            }
            SessionAction::Discover => Some(match self.ble.discover() {
                Ok(true) => SessionEvent::ServiceFound,
                Ok(false) => SessionEvent::ServiceMissing,
                Err(e) => SessionEvent::ConnectFailed(e.to_string()),
            }),
            SessionAction::Subscribe => Some(match self.ble.subscribe() {
                Ok(()) => SessionEvent::NotifySubscribed,
                Err(e) => SessionEvent::ConnectFailed(e.to_string()),
            }),
            SessionAction::CloseLink => {
                if let Err(e) = self.ble.disconnect() {
                    log::debug!("BLE disconnect: {e}");
                }
                None
            }
            SessionAction::Wait(delay) => {
                log::info!("reconnecting in {delay:?}");
                self.backoff_until = Some(self.now + delay);
                None
            }
            SessionAction::FailPending => {
                self.abort_search();
                for slot in self.dispatcher.fail_all() {
                    self.resolve(slot, Err(Error::SessionReset));
                }
                self.ports_pending = 0;
                self.info_pending = 0;
                None
            }
            SessionAction::StartPolling => {
                self.poller.start(self.now);
                self.device_info = DeviceInfo::for_peer(self.session.peer());
                if self.tokens.get().is_none() && self.config.node.auto_bruteforce {
                    self.start_search(0..=255, None);
                }
                None
            }
            SessionAction::StopPolling => {
                self.poller.stop();
                None
            }
            SessionAction::LinkLost { attempts } => {
                log::error!("charger lost after {attempts} reconnect attempts");
                None
            }
        }
    }

    fn pump(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        let token = self.tokens.get();
        while let Some(outbound) = self.dispatcher.poll_transmit(self.now, token) {
            match outbound {
                Outbound::Reject(slot, err) => self.resolve(slot, Err(err)),
                Outbound::Write(tx) => {
                    if let Err(e) = self.ble.write(&tx.frame) {
                        log::warn!("BLE write failed: {e}");
                        if let Some(slot) = self.dispatcher.abort_in_flight() {
                            self.resolve(slot, Err(Error::transport(e)));
                        }
                        self.apply(SessionEvent::LinkDown);
                    }
                    return;
                }
            }
        }
    }

    fn resolve(&mut self, slot: Slot, result: Result<Message>) {
        match slot {
            Slot::Bridge { command, cmd_id } => {
                self.respond(cmd_id, result.and_then(|message| command.decode(&message)));
            }
            Slot::Poll(job, service) => self.on_poll_result(job, service, result),
            Slot::Probe(candidate) => self.on_probe_result(candidate, result),
        }
    }

    // polling

    fn run_job(&mut self, job: PollJob) {
        if self.search.is_some() || self.tokens.get().is_none() {
            return;
        }
        let pending = match job {
            PollJob::Ports => &mut self.ports_pending,
            PollJob::DeviceInfo => &mut self.info_pending,
        };
        if *pending > 0 {
            log::debug!("{job:?} poll still running, skipped");
            return;
        }
        *pending = job.commands().len();
        if job == PollJob::DeviceInfo {
            self.device_info = DeviceInfo::for_peer(self.session.peer());
        }
        for &service in job.commands() {
            self.dispatcher.submit(Request::command(
                service,
                Vec::new(),
                self.config.node.command_timeout(),
                Slot::Poll(job, service),
            ));
        }
    }

    fn on_poll_result(&mut self, job: PollJob, service: u8, result: Result<Message>) {
        let pending = match job {
            PollJob::Ports => &mut self.ports_pending,
            PollJob::DeviceInfo => &mut self.info_pending,
        };
        *pending = pending.saturating_sub(1);

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                log::debug!("poll {} failed: {e}", ble::command_name(service));
                return;
            }
        };
        match service {
            commands::GET_ALL_POWER_STATISTICS => self.publish_ports(&message.payload),
            _ => {
                self.device_info.apply(service, &message.payload);
                if service == commands::GET_DEVICE_UPTIME {
                    self.publish_device_info();
                }
            }
        }
    }

    // token search

    fn start_search(&mut self, range: RangeInclusive<u8>, reply: Option<Option<String>>) {
        match self.tokens.begin_search(range) {
            Ok(search) => {
                log::info!("searching for the token ({} candidates)", search.remaining());
                self.search = Some(Search { search, probing: false, resume_at: None, reply });
            }
            Err(e) => {
                if let Some(cmd_id) = reply {
                    self.respond(cmd_id, Err(e));
                }
            }
        }
    }

    fn step_search(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        let now = self.now;
        let Some(active) = self.search.as_mut() else {
            return;
        };
        if active.probing || active.resume_at.is_some_and(|at| at > now) {
            return;
        }
        active.resume_at = None;
        match active.search.next() {
            Some(candidate) => {
                active.probing = true;
                self.dispatcher.submit(Request::probe(
                    candidate,
                    self.config.node.probe_timeout(),
                    Slot::Probe(candidate),
                ));
            }
            None => self.finish_search(None),
        }
    }

    fn on_probe_result(&mut self, candidate: u8, result: Result<Message>) {
        let resume_at = self.now + self.config.node.probe_delay();
        let Some(active) = self.search.as_mut() else {
            return;
        };
        active.probing = false;
        match result {
            Ok(message) if !message.payload.is_empty() => self.finish_search(Some(candidate)),
            _ => active.resume_at = Some(resume_at),
        }
    }

    fn finish_search(&mut self, found: Option<u8>) {
        let Some(done) = self.search.take() else {
            return;
        };
        if let Err(e) = self.tokens.finish_search(found) {
            log::warn!("could not persist token: {e}");
        }
        match found {
            Some(token) => self.publish_status("token_found", Some(&format!("0x{token:02x}"))),
            None => {
                log::warn!("no token accepted after {} candidates", done.search.attempts());
                self.publish_status("token_not_found", None);
            }
        }
        if let Some(cmd_id) = done.reply {
            let result = found.map(|token| json!({ "token": token })).ok_or(Error::TokenUnknown);
            self.respond(cmd_id, result);
        }
    }

    fn abort_search(&mut self) {
        if let Some(done) = self.search.take() {
            let _ = self.tokens.finish_search(None);
            if let Some(cmd_id) = done.reply {
                self.respond(cmd_id, Err(Error::SessionReset));
            }
        }
    }

    // bridge

    fn on_mqtt_command(&mut self, payload: &[u8]) {
        match serde_json::from_slice::<BridgeRequest>(payload) {
            Ok(request) => self.handle_request(request),
            Err(e) => {
                log::warn!("unparseable command: {e}");
                self.respond(None, Err(Error::invalid_params("cmd", e.to_string())));
            }
        }
    }

    /// Answer one bridge request on `cmd_response`, now or once the charger replies
    pub fn handle_request(&mut self, request: BridgeRequest) {
        let cmd_id = request.cmd_id.clone();
        let command = match BridgeCommand::parse(&request) {
            Ok(command) => command,
            Err(e) => return self.respond(cmd_id, Err(e)),
        };
        log::info!("bridge command {}", request.command);

        if let Some(call) = command.device_call() {
            if !self.session.is_connected() {
                return self.respond(cmd_id, Err(Error::NotConnected));
            }
            let timeout = self.config.node.command_timeout();
            let slot = Slot::Bridge { command, cmd_id };
            self.dispatcher.submit(Request::command(call.service, call.body, timeout, slot));
            return;
        }

        if let Some(result) = self.local_command(command, cmd_id.as_deref()) {
            self.respond(cmd_id, result);
        }
    }

    /// `None` when the answer is sent later
    fn local_command(&mut self, command: BridgeCommand, cmd_id: Option<&str>) -> Option<Result<JsonValue>> {
        use BridgeCommand as C;

        let result = match command {
            C::Status => serde_json::to_value(self.status()).map_err(Error::from),
            C::Refresh => {
                if self.session.is_connected() {
                    self.poller.start(self.now);
                    Ok(json!({ "refresh": "scheduled" }))
                } else {
                    Err(Error::NotConnected)
                }
            }
            C::GetToken => Ok(json!({ "token": self.tokens.get() })),
            C::SetToken(token) => self.tokens.set(token).map(|_| json!({ "token": token })),
            C::ClearToken => self.tokens.clear().map(|_| JsonValue::Null),
            C::BruteforceToken => {
                if !self.session.is_connected() {
                    return Some(Err(Error::NotConnected));
                }
                self.start_search(0..=255, Some(cmd_id.map(str::to_string)));
                return None;
            }
            C::ConnectTo(target) => {
                self.filter.target = Some(target);
                self.apply(SessionEvent::Disconnect);
                self.backoff_until = None;
                self.connect_replies.push(cmd_id.map(str::to_string));
                self.apply(SessionEvent::StartScan);
                return None;
            }
            C::ScanBle => {
                self.apply(SessionEvent::Disconnect);
                self.backoff_until = None;
                self.apply(SessionEvent::StartScan);
                Ok(json!({ "state": self.session.state() }))
            }
            C::DisconnectBle => {
                self.apply(SessionEvent::Disconnect);
                self.backoff_until = None;
                Ok(JsonValue::Null)
            }
            C::ScanWifi => self
                .wifi
                .scan()
                .map(|networks| json!({ "networks": networks }))
                .map_err(Error::transport),
            C::SetWifi { ssid, password } => self.set_wifi(&ssid, &password).map(|_| json!({ "ssid": ssid })),
            C::StartOta(url) => self
                .ota
                .start(&url)
                .map(|_| json!({ "ota": "started" }))
                .map_err(Error::transport),
            C::GetOtaProgress => serde_json::to_value(self.ota.progress()).map_err(Error::from),
            C::Unknown(name) => Err(Error::UnknownCommand(name)),
            other => Err(Error::Unsupported(format!("{other:?}"))),
        };
        Some(result)
    }

    fn set_wifi(&mut self, ssid: &str, password: &str) -> Result<()> {
        self.storage_mut()
            .set_wifi_credentials(ssid, password)
            .map_err(|e| Error::Storage(std::io::Error::other(e.to_string())))?;
        self.wifi.connect(ssid, password).map_err(Error::transport)
    }

    fn respond(&mut self, cmd_id: Option<String>, result: Result<JsonValue>) {
        if let Err(e) = &result {
            log::debug!("command failed: {e}");
        }
        let response = BridgeResponse::from_result(result).with_cmd_id(cmd_id);
        let Some(doc) = to_json(&response) else {
            return;
        };
        self.publish(&self.topics.cmd_response(), &doc, QOS_COMMAND, false);
    }

    // telemetry

    fn envelope(&self, body: JsonValue) -> JsonValue {
        let peer = self.session.peer();
        let mut doc = json!({
            "gateway_id": self.config.gateway_id,
            "charger_name": peer.map(|p| p.name.as_str()).unwrap_or_default(),
            "charger_addr": peer.map(|p| p.address.as_str()).unwrap_or_default(),
            "timestamp": self.uptime().as_millis() as u64,
        });
        if let (Some(doc), JsonValue::Object(body)) = (doc.as_object_mut(), body) {
            doc.extend(body);
        }
        doc
    }

    fn publish(&mut self, topic: &str, doc: &JsonValue, qos: u8, retain: bool) {
        if !self.mqtt.is_connected() {
            return;
        }
        let payload = match serde_json::to_vec(doc) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("encoding {topic} payload failed: {e}");
                return;
            }
        };
        if let Err(e) = self.mqtt.publish(topic, &payload, qos, retain) {
            log::warn!("publish to {topic} failed: {e}");
        }
    }

    fn publish_ports(&mut self, payload: &[u8]) {
        let telemetry = Telemetry::ports(payload);
        let active_ports = match &telemetry {
            Telemetry::Ports { ports, .. } => ports.iter().filter(|p| p.charging).count(),
            _ => 0,
        };
        let Some(mut body) = to_json(&telemetry) else {
            return;
        };
        if let Some(body) = body.as_object_mut() {
            body.insert("active_ports".into(), active_ports.into());
        }
        let doc = self.envelope(body);
        self.publish(&self.topics.ports(), &doc, QOS_TELEMETRY, false);
    }

    fn publish_device_info(&mut self) {
        let Some(mut body) = to_json(&self.device_info) else {
            return;
        };
        if let Some(body) = body.as_object_mut() {
            body.insert("gateway_version".into(), GATEWAY_VERSION.into());
        }
        let doc = self.envelope(body);
        self.publish(&self.topics.device_info(), &doc, QOS_STATUS, true);
    }

    fn publish_heartbeat(&mut self) {
        let connected = self.session.is_connected();
        let doc = self.envelope(json!({
            "gateway_version": GATEWAY_VERSION,
            "wifi_rssi": self.wifi.rssi(),
            "ip": self.wifi.ip_info().map(|info| info.ip_str()),
            "ble_connected": connected,
            "connected": connected,
            "state": self.session.state(),
            "token_known": self.tokens.get().is_some(),
            "uptime": self.uptime().as_secs(),
        }));
        self.publish(&self.topics.heartbeat(), &doc, QOS_TELEMETRY, false);
    }

    fn publish_status(&mut self, status: &str, message: Option<&str>) {
        let doc = self.envelope(json!({
            "status": status,
            "message": message,
            "ble_connected": self.session.is_connected(),
            "state": self.session.state(),
            "link_lost": self.session.link_lost(),
        }));
        self.publish(&self.topics.status(), &doc, QOS_STATUS, true);
    }
}

fn to_json(value: &impl serde::Serialize) -> Option<JsonValue> {
    serde_json::to_value(value)
        .inspect_err(|e| log::warn!("rendering JSON failed: {e}"))
        .ok()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use cp02_node::{Advertisement, OtaProgress, Peer, WifiNetwork};
    use cp02_proto::FLAG_ACK;

    use super::*;
    use crate::storage::{MemoryStorage, token_key};
    use crate::wifi::{IpInfo, WifiStatus};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:01";
    const TOKEN: u8 = 0x42;
    const STEP: Duration = Duration::from_millis(10);

    fn advert(address: &str, name: &str, rssi: i16) -> Advertisement {
        Advertisement { address: address.into(), name: Some(name.into()), rssi: Some(rssi), has_service: true }
    }

    #[derive(Debug, Default)]
    struct MockBle {
        adverts: Vec<Advertisement>,
        token: u8,
        silent: bool,
        linked: bool,
        connected_to: Option<String>,
        connects: usize,
        writes: Vec<Vec<u8>>,
        inbox: VecDeque<Vec<u8>>,
    }

    impl MockBle {
        fn charger() -> Self {
            Self { adverts: vec![advert(ADDRESS, "CP02-0001", -50)], token: TOKEN, ..Self::default() }
        }

        fn services(&self) -> Vec<u8> {
            self.writes.iter().map(|frame| frame[2]).collect()
        }
    }

    impl BleCentral for MockBle {
        type Error = String;

        fn scan(&mut self, _duration_ms: u64) -> std::result::Result<Vec<Advertisement>, String> {
            Ok(self.adverts.clone())
        }

        fn connect(&mut self, peer: &Peer, _timeout_ms: u64) -> std::result::Result<(), String> {
            self.connects += 1;
            self.linked = true;
            self.connected_to = Some(peer.address.clone());
            Ok(())
        }

        fn discover(&mut self) -> std::result::Result<bool, String> {
            Ok(true)
        }

        fn subscribe(&mut self) -> std::result::Result<(), String> {
            Ok(())
        }

        fn write(&mut self, frame: &[u8]) -> std::result::Result<(), String> {
            self.writes.push(frame.to_vec());
            if self.silent {
                return Ok(());
            }
            let request = Message::decode(frame).map_err(|e| e.to_string())?;
            let service = request.service_code();
            if ble::needs_token(service) && request.payload.first() != Some(&self.token) {
                return Ok(());
            }
            let payload: Vec<u8> = match service {
                commands::GET_DEVICE_MODEL => b"CP02\0".to_vec(),
                commands::GET_ALL_POWER_STATISTICS => vec![0x02, 80, 72, 0x1E, 0, 0, 0, 0],
                _ => Vec::new(),
            };
            let reply = cp02_proto::encode(0, request.msg_id, (service | 0x80) as i8, 0, FLAG_ACK, &payload)
                .map_err(|e| e.to_string())?;
            self.inbox.push_back(reply);
            Ok(())
        }

        fn disconnect(&mut self) -> std::result::Result<(), String> {
            self.linked = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.linked
        }

        fn poll_notification(&mut self) -> Option<Vec<u8>> {
            self.inbox.pop_front()
        }
    }

    struct MockWifi;

    impl Wifi for MockWifi {
        type Error = String;

        fn scan(&mut self) -> std::result::Result<Vec<WifiNetwork>, String> {
            Ok(vec![WifiNetwork { ssid: "home".into(), rssi: -40, auth_required: true }])
        }

        fn connect(&mut self, _ssid: &str, _password: &str) -> std::result::Result<(), String> {
            Ok(())
        }

        fn status(&self) -> WifiStatus {
            WifiStatus::Connected
        }

        fn rssi(&self) -> Option<i8> {
            Some(-40)
        }

        fn ip_info(&self) -> Option<IpInfo> {
            None
        }
    }

    #[derive(Default)]
    struct MockOta {
        progress: OtaProgress,
        url: Option<String>,
    }

    impl Ota for MockOta {
        type Error = String;

        fn start(&mut self, url: &str) -> std::result::Result<(), String> {
            self.url = Some(url.to_string());
            self.progress.in_progress = true;
            Ok(())
        }

        fn progress(&self) -> OtaProgress {
            self.progress.clone()
        }
    }

    #[derive(Default)]
    struct MockMqtt {
        published: Vec<(String, JsonValue, bool)>,
        subscriptions: Vec<(String, u8)>,
        offline: bool,
        inbox: VecDeque<(String, Vec<u8>)>,
    }

    impl MockMqtt {
        fn on(&self, topic: &str) -> Vec<&JsonValue> {
            self.published.iter().filter(|(t, ..)| t == topic).map(|(_, doc, _)| doc).collect()
        }
    }

    impl Mqtt for MockMqtt {
        type Error = String;

        fn is_connected(&self) -> bool {
            !self.offline
        }

        fn publish(&mut self, topic: &str, payload: &[u8], _qos: u8, retain: bool) -> std::result::Result<(), String> {
            let doc = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
            self.published.push((topic.to_string(), doc, retain));
            Ok(())
        }

        fn subscribe(&mut self, topic: &str, qos: u8) -> std::result::Result<(), String> {
            self.subscriptions.push((topic.to_string(), qos));
            Ok(())
        }

        fn poll_message(&mut self) -> Option<(String, Vec<u8>)> {
            self.inbox.pop_front()
        }
    }

    type TestGateway = Gateway<MockBle, MockWifi, MockOta, MockMqtt, MemoryStorage>;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::new("gw01");
        config.node.info_poll_ms = 3_600_000;
        config
    }

    fn gateway(ble: MockBle, stored_token: Option<u8>) -> TestGateway {
        gateway_with(ble, stored_token, test_config())
    }

    fn gateway_with(ble: MockBle, stored_token: Option<u8>, config: GatewayConfig) -> TestGateway {
        let mut storage = MemoryStorage::default();
        storage.wifi = Some(("home".into(), "pw".into()));
        if let Some(token) = stored_token {
            storage.values.insert(token_key(ADDRESS), token);
        }
        Gateway::new(ble, MockWifi, MockOta::default(), MockMqtt::default(), storage, config)
    }

    fn response_to(gw: &mut TestGateway, cmd_id: &str) -> Option<JsonValue> {
        gw.mqtt_mut().on("cp02/gw01/cmd_response").into_iter().find(|r| r["cmd_id"] == cmd_id).cloned()
    }

    fn run(gw: &mut TestGateway, from: Instant, duration: Duration) -> Instant {
        let mut now = from;
        let end = from + duration;
        while now < end {
            now += STEP;
            assert_eq!(gw.tick(now, false), Control::Continue);
        }
        now
    }

    fn command(gw: &mut TestGateway, json: JsonValue) {
        let payload = serde_json::to_vec(&json).unwrap();
        gw.mqtt_mut().inbox.push_back(("cp02/gw01/cmd".into(), payload));
    }

    fn last_response(gw: &mut TestGateway) -> JsonValue {
        gw.mqtt_mut().on("cp02/gw01/cmd_response").last().cloned().cloned().unwrap()
    }

    #[test]
    fn connects_and_publishes_port_statistics() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);
        assert_eq!(gw.state(), SessionState::Connected);
        run(&mut gw, t0, Duration::from_millis(100));

        let mqtt = gw.mqtt_mut();
        let ports = mqtt.on("cp02/gw01/ports");
        let doc = ports.first().unwrap();
        assert_eq!(doc["gateway_id"], "gw01");
        assert_eq!(doc["charger_addr"], ADDRESS);
        assert_eq!(doc["ports"][0]["power_w"], 22.5);
        assert_eq!(doc["active_ports"], 1);

        let status = mqtt.published.iter().find(|(t, doc, _)| t == "cp02/gw01/status" && doc["status"] == "ble_connected");
        assert!(status.is_some_and(|(.., retain)| *retain));
    }

    #[test]
    fn finds_and_persists_the_token() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), None);
        gw.start(t0);
        run(&mut gw, t0, Duration::from_secs(30));

        assert_eq!(gw.token(), Some(TOKEN));
        assert_eq!(gw.storage().values.get(&token_key(ADDRESS)), Some(&TOKEN));

        let probes: Vec<u8> = gw
            .ble_mut()
            .writes
            .iter()
            .filter(|frame| frame[2] == commands::GET_DEVICE_MODEL)
            .map(|frame| frame[9])
            .collect();
        assert_eq!(probes, (0..=TOKEN).collect::<Vec<u8>>());
        assert!(gw.ble_mut().services().contains(&commands::GET_ALL_POWER_STATISTICS));
    }

    #[test]
    fn device_command_round_trip_over_mqtt() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);
        command(&mut gw, json!({"command": "turn_on_port", "params": {"port_id": 1}, "cmd_id": "c1"}));
        run(&mut gw, t0, Duration::from_millis(100));

        let response = gw.mqtt_mut().on("cp02/gw01/cmd_response").into_iter().find(|r| r["cmd_id"] == "c1").cloned().unwrap();
        assert_eq!(response["success"], true);
        let frame = gw.ble_mut().writes.iter().find(|f| f[2] == commands::TURN_ON_PORT).cloned().unwrap();
        assert_eq!(&frame[9..], &[TOKEN, 1]);
    }

    #[test]
    fn unknown_command_is_answered_without_touching_the_charger() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);
        let now = run(&mut gw, t0, Duration::from_millis(100));
        let writes = gw.ble_mut().writes.len();

        command(&mut gw, json!({"action": "launch_rockets", "cmd_id": "x"}));
        gw.tick(now + STEP, false);

        let response = last_response(&mut gw);
        assert_eq!(response["success"], false);
        assert_eq!(response["error_kind"], "unknown_command");
        assert_eq!(response["cmd_id"], "x");
        assert_eq!(gw.ble_mut().writes.len(), writes);
    }

    #[test]
    fn reset_button_hold_clears_settings() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);

        assert_eq!(gw.tick(t0 + STEP, true), Control::Continue);
        assert_eq!(gw.tick(t0 + Duration::from_secs(3), true), Control::Continue);
        assert_eq!(gw.tick(t0 + Duration::from_secs(6), true), Control::Restart);
        assert!(gw.storage().wifi.is_none());
        assert!(gw.storage().values.is_empty());
    }

    #[test]
    fn ota_suspends_the_link_and_restarts_when_done() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);
        command(&mut gw, json!({"command": "start_ota", "params": {"url": "http://fw/cp02.bin"}}));
        let now = run(&mut gw, t0, Duration::from_millis(50));
        assert_eq!(gw.ota_mut().url.as_deref(), Some("http://fw/cp02.bin"));

        let writes = gw.ble_mut().writes.len();
        let now = run(&mut gw, now, Duration::from_secs(10));
        assert_eq!(gw.ble_mut().writes.len(), writes);

        gw.ota_mut().progress = OtaProgress { in_progress: false, percent: 100, error: None };
        assert_eq!(gw.tick(now + STEP, false), Control::Restart);
    }

    #[test]
    fn link_drop_waits_the_fixed_backoff() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);
        gw.ble_mut().linked = false;

        let now = run(&mut gw, t0, Duration::from_millis(20));
        assert_eq!(gw.state(), SessionState::Reconnecting);
        let now = run(&mut gw, now, Duration::from_millis(4_900));
        assert_eq!(gw.ble_mut().connects, 1);
        run(&mut gw, now, Duration::from_millis(200));
        assert_eq!(gw.ble_mut().connects, 2);
        assert_eq!(gw.state(), SessionState::Connected);
    }

    #[test]
    fn connect_to_pins_the_target() {
        let t0 = Instant::now();
        let mut ble = MockBle::charger();
        ble.adverts.push(advert("AA:BB:CC:DD:EE:02", "CP02-0002", -80));
        let mut gw = gateway(ble, Some(TOKEN));
        gw.start(t0);
        assert_eq!(gw.ble_mut().connected_to.as_deref(), Some(ADDRESS));

        command(&mut gw, json!({"command": "connect_to", "params": {"device_name": "0002"}, "cmd_id": "k"}));
        gw.tick(t0 + STEP, false);

        assert_eq!(gw.ble_mut().connected_to.as_deref(), Some("AA:BB:CC:DD:EE:02"));
        let response = last_response(&mut gw);
        assert_eq!(response["success"], true);
        assert_eq!(response["cmd_id"], "k");
    }

    #[test]
    fn heartbeat_carries_session_state() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);
        run(&mut gw, t0, Duration::from_secs(11));

        let beats = gw.mqtt_mut().on("cp02/gw01/heartbeat").into_iter().cloned().collect::<Vec<_>>();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0]["state"], "connected");
        assert_eq!(beats[0]["connected"], true);
        assert_eq!(beats[0]["wifi_rssi"], -40);
    }

    #[test]
    fn command_topic_is_subscribed_again_after_a_broker_drop() {
        let t0 = Instant::now();
        let mut gw = gateway(MockBle::charger(), Some(TOKEN));
        gw.start(t0);
        let now = run(&mut gw, t0, Duration::from_millis(50));
        assert_eq!(gw.mqtt_mut().subscriptions, vec![("cp02/gw01/cmd".to_string(), QOS_COMMAND)]);

        gw.mqtt_mut().offline = true;
        let now = run(&mut gw, now, Duration::from_millis(50));
        gw.mqtt_mut().offline = false;
        run(&mut gw, now, Duration::from_millis(50));
        assert_eq!(gw.mqtt_mut().subscriptions.len(), 2);
    }

    #[test]
    fn link_drop_ends_a_requested_search() {
        let t0 = Instant::now();
        let mut ble = MockBle::charger();
        ble.token = 0xFE;
        let mut config = test_config();
        config.node.auto_bruteforce = false;
        let mut gw = gateway_with(ble, None, config);
        gw.start(t0);

        command(&mut gw, json!({"command": "bruteforce_token", "cmd_id": "b"}));
        let now = run(&mut gw, t0, Duration::from_secs(1));
        assert!(gw.status().searching_token);
        assert!(response_to(&mut gw, "b").is_none());

        gw.ble_mut().linked = false;
        run(&mut gw, now, Duration::from_millis(20));

        let response = response_to(&mut gw, "b").unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["error_kind"], "session_reset");
        assert!(!gw.status().searching_token);
        assert_eq!(gw.token(), None);
        assert_eq!(gw.storage().values.get(&token_key(ADDRESS)), None);
    }

    #[test]
    fn failed_connect_to_unpins_the_target() {
        let t0 = Instant::now();
        let mut config = test_config();
        config.node.max_retries = 1;
        let mut gw = gateway_with(MockBle::charger(), Some(TOKEN), config);
        gw.start(t0);

        command(&mut gw, json!({"command": "connect_to", "params": {"device_name": "nope"}, "cmd_id": "k"}));
        let now = run(&mut gw, t0, Duration::from_secs(12));
        let response = response_to(&mut gw, "k").unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["error_kind"], "link_lost");
        assert_eq!(gw.state(), SessionState::Disconnected);

        gw.ble_mut().connected_to = None;
        command(&mut gw, json!({"command": "scan_ble"}));
        gw.tick(now + STEP, false);
        assert_eq!(gw.ble_mut().connected_to.as_deref(), Some(ADDRESS));
        assert_eq!(gw.state(), SessionState::Connected);
    }
}
