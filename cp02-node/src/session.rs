//! Connection manager: the BLE session state machine
//!
//! [`Session`] is sans-IO. Callers feed it [`SessionEvent`]s as the transport
//! reports progress and carry out the [`SessionAction`]s it returns. It is the
//! only place the session state changes.
//!
//! ```text
//! Disconnected -StartScan-> Scanning -DeviceFound-> Connecting -LinkUp->
//! DiscoveringServices -ServiceFound-> Subscribing -NotifySubscribed-> Connected
//! ```
//!
//! Any failure on the way, or the link dropping while `Connected`, moves to
//! `Reconnecting` and waits out the backoff before scanning again. Once
//! `max_retries` reconnects have been spent the next failure is fatal
//! (`LinkLost`) and the session parks in `Disconnected` until `StartScan`.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Scanning,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Connected,
    Reconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Scanning => "scanning",
            SessionState::Connecting => "connecting",
            SessionState::DiscoveringServices => "discovering_services",
            SessionState::Subscribing => "subscribing",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
        }
    }

    /// States in which a transport link may be open
    fn has_link(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::DiscoveringServices
                | SessionState::Subscribing
                | SessionState::Connected
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay before reconnect attempt `n` (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time (the gateway waits 5 s)
    Fixed(Duration),
    /// `base * 2^(n-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential { base: Duration::from_secs(1), max: Duration::from_secs(30) }
    }
}

/// A charger picked out of a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub address: String,
    pub name: String,
}

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// The advertisement lists the charger's GATT service
    pub has_service: bool,
}

/// Which advertisements count as a charger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub name_prefix: String,
    /// Pin the session to one charger: a substring of its name or address
    pub target: Option<String>,
}

impl ScanFilter {
    pub fn matches(&self, adv: &Advertisement) -> bool {
        let name = adv.name.as_deref().unwrap_or_default();
        let is_charger = adv.has_service || name.starts_with(&self.name_prefix);
        if !is_charger {
            return false;
        }
        match &self.target {
            Some(target) => {
                let target = target.to_lowercase();
                name.to_lowercase().contains(&target)
                    || adv.address.to_lowercase().contains(&target)
            }
            None => true,
        }
    }

    /// First match, strongest signal first
    pub fn select(&self, found: &[Advertisement]) -> Option<Peer> {
        found
            .iter()
            .filter(|adv| self.matches(adv))
            .max_by_key(|adv| adv.rssi.unwrap_or(i16::MIN))
            .map(|adv| Peer {
                address: adv.address.clone(),
                name: adv.name.clone().unwrap_or_default(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StartScan,
    DeviceFound(Peer),
    ScanEmpty,
    LinkUp,
    /// Connect, discovery or subscribe failed in the transport
    ConnectFailed(String),
    ServiceFound,
    ServiceMissing,
    NotifySubscribed,
    /// The transport reported the link dropped
    LinkDown,
    /// Explicit disconnect by the user
    Disconnect,
    BackoffElapsed,
    /// Repeated request timeouts on an apparently open link
    DeadLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Scan,
    Connect(Peer),
    Discover,
    Subscribe,
    /// Tear down whatever link is open
    CloseLink,
    /// Schedule `BackoffElapsed` after this long
    Wait(Duration),
    /// Fail every pending request with `SessionReset`
    FailPending,
    StartPolling,
    StopPolling,
    /// Retries exhausted
    LinkLost { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    retries: u32,
    max_retries: u32,
    backoff: Backoff,
    peer: Option<Peer>,
    link_lost: bool,
    last_error: Option<String>,
}

impl Session {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            state: SessionState::Disconnected,
            retries: 0,
            max_retries,
            backoff,
            peer: None,
            link_lost: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    /// Reconnect attempts spent since the last successful connect
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The last run ended in `LinkLost` and nothing restarted it
    pub fn link_lost(&self) -> bool {
        self.link_lost
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        use SessionEvent as E;
        use SessionState as S;

        let from = self.state;
        let actions = match (from, event) {
            (S::Disconnected, E::StartScan) => {
                self.retries = 0;
                self.link_lost = false;
                self.last_error = None;
                self.state = S::Scanning;
                vec![SessionAction::Scan]
            }
            (S::Scanning, E::DeviceFound(peer)) => {
                self.peer = Some(peer.clone());
                self.state = S::Connecting;
                vec![SessionAction::Connect(peer)]
            }
            (S::Scanning, E::ScanEmpty) => self.fail("no charger found", Vec::new()),
            (S::Connecting, E::LinkUp) => {
                self.state = S::DiscoveringServices;
                vec![SessionAction::Discover]
            }
            (S::DiscoveringServices, E::ServiceFound) => {
                self.state = S::Subscribing;
                vec![SessionAction::Subscribe]
            }
            (S::DiscoveringServices, E::ServiceMissing) => {
                self.fail("charger service missing", vec![SessionAction::CloseLink])
            }
            (S::Subscribing, E::NotifySubscribed) => {
                self.state = S::Connected;
                self.retries = 0;
                self.last_error = None;
                vec![SessionAction::FailPending, SessionAction::StartPolling]
            }
            (S::Connecting | S::DiscoveringServices | S::Subscribing, E::ConnectFailed(reason)) => {
                self.fail(&reason, vec![SessionAction::CloseLink])
            }
            (S::Connecting | S::DiscoveringServices | S::Subscribing, E::LinkDown) => {
                self.fail("link dropped while connecting", Vec::new())
            }
            (S::Connected, E::LinkDown) => self.fail(
                "link dropped",
                vec![SessionAction::StopPolling, SessionAction::FailPending],
            ),
            (S::Connected, E::DeadLink) => self.fail(
                "device stopped responding",
                vec![
                    SessionAction::StopPolling,
                    SessionAction::FailPending,
                    SessionAction::CloseLink,
                ],
            ),
            (S::Reconnecting, E::BackoffElapsed) => {
                self.state = S::Scanning;
                vec![SessionAction::Scan]
            }
            (_, E::Disconnect) => {
                let mut actions = Vec::new();
                if from == S::Connected {
                    actions.push(SessionAction::StopPolling);
                    actions.push(SessionAction::FailPending);
                }
                if from.has_link() {
                    actions.push(SessionAction::CloseLink);
                }
                self.state = S::Disconnected;
                self.retries = 0;
                self.peer = None;
                actions
            }
            (state, event) => {
                log::debug!("session: ignoring {event:?} in {state}");
                Vec::new()
            }
        };

        if self.state != from {
            log::info!("session: {from} -> {}", self.state);
        }
        actions
    }

    fn fail(&mut self, reason: &str, mut actions: Vec<SessionAction>) -> Vec<SessionAction> {
        log::warn!("session: {reason}");
        self.last_error = Some(reason.to_string());

        if self.retries >= self.max_retries {
            self.state = SessionState::Disconnected;
            self.link_lost = true;
            self.peer = None;
            actions.push(SessionAction::LinkLost { attempts: self.retries });
        } else {
            self.retries += 1;
            self.state = SessionState::Reconnecting;
            actions.push(SessionAction::Wait(self.backoff.delay(self.retries)));
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer { address: "AA:BB:CC:DD:EE:FF".into(), name: "CP02-0A1B".into() }
    }

    fn connect(session: &mut Session) {
        session.handle(SessionEvent::StartScan);
        session.handle(SessionEvent::DeviceFound(peer()));
        session.handle(SessionEvent::LinkUp);
        session.handle(SessionEvent::ServiceFound);
        let actions = session.handle(SessionEvent::NotifySubscribed);
        assert_eq!(actions, vec![SessionAction::FailPending, SessionAction::StartPolling]);
    }

    #[test]
    fn happy_path_reaches_connected() {
        let mut session = Session::new(3, Backoff::default());
        assert_eq!(session.handle(SessionEvent::StartScan), vec![SessionAction::Scan]);
        assert_eq!(
            session.handle(SessionEvent::DeviceFound(peer())),
            vec![SessionAction::Connect(peer())]
        );
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.handle(SessionEvent::LinkUp), vec![SessionAction::Discover]);
        assert_eq!(session.handle(SessionEvent::ServiceFound), vec![SessionAction::Subscribe]);
        session.handle(SessionEvent::NotifySubscribed);
        assert!(session.is_connected());
        assert_eq!(session.peer(), Some(&peer()));
    }

    #[test]
    fn reconnecting_is_bounded_by_max_retries() {
        let max_retries = 3;
        let mut session = Session::new(max_retries, Backoff::Fixed(Duration::from_secs(5)));
        session.handle(SessionEvent::StartScan);

        let mut reconnects = 0;
        let mut lost = None;
        for _ in 0..20 {
            let actions = session.handle(SessionEvent::ScanEmpty);
            if session.state() == SessionState::Reconnecting {
                reconnects += 1;
                assert_eq!(actions, vec![SessionAction::Wait(Duration::from_secs(5))]);
                session.handle(SessionEvent::BackoffElapsed);
            } else {
                lost = actions.into_iter().find_map(|a| match a {
                    SessionAction::LinkLost { attempts } => Some(attempts),
                    _ => None,
                });
                break;
            }
        }

        assert_eq!(reconnects, max_retries);
        assert_eq!(lost, Some(max_retries));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.link_lost());

        // no auto retry, a manual restart is allowed
        assert!(session.handle(SessionEvent::BackoffElapsed).is_empty());
        assert_eq!(session.handle(SessionEvent::StartScan), vec![SessionAction::Scan]);
        assert!(!session.link_lost());
        assert_eq!(session.retries(), 0);
    }

    #[test]
    fn link_drop_while_connected_reconnects() {
        let mut session = Session::new(5, Backoff::default());
        connect(&mut session);

        let actions = session.handle(SessionEvent::LinkDown);
        assert_eq!(
            actions,
            vec![
                SessionAction::StopPolling,
                SessionAction::FailPending,
                SessionAction::Wait(Duration::from_secs(1)),
            ]
        );
        assert_eq!(session.state(), SessionState::Reconnecting);

        session.handle(SessionEvent::BackoffElapsed);
        assert_eq!(session.state(), SessionState::Scanning);
    }

    #[test]
    fn successful_connect_resets_retries() {
        let mut session = Session::new(2, Backoff::default());
        session.handle(SessionEvent::StartScan);
        session.handle(SessionEvent::DeviceFound(peer()));
        session.handle(SessionEvent::ConnectFailed("timeout".into()));
        assert_eq!(session.retries(), 1);
        session.handle(SessionEvent::BackoffElapsed);
        session.handle(SessionEvent::DeviceFound(peer()));
        session.handle(SessionEvent::LinkUp);
        session.handle(SessionEvent::ServiceFound);
        session.handle(SessionEvent::NotifySubscribed);
        assert_eq!(session.retries(), 0);
    }

    #[test]
    fn explicit_disconnect_does_not_reconnect() {
        let mut session = Session::new(5, Backoff::default());
        connect(&mut session);

        let actions = session.handle(SessionEvent::Disconnect);
        assert_eq!(
            actions,
            vec![SessionAction::StopPolling, SessionAction::FailPending, SessionAction::CloseLink]
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.link_lost());
        assert!(session.handle(SessionEvent::LinkDown).is_empty());
    }

    #[test]
    fn dead_link_forces_reconnect() {
        let mut session = Session::new(5, Backoff::default());
        connect(&mut session);
        let actions = session.handle(SessionEvent::DeadLink);
        assert!(actions.contains(&SessionAction::CloseLink));
        assert_eq!(session.state(), SessionState::Reconnecting);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(4),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(4));
        assert_eq!(backoff.delay(40), Duration::from_secs(4));
    }

    #[test]
    fn scan_filter_prefers_target_and_signal() {
        let found = vec![
            Advertisement {
                address: "11:11:11:11:11:11".into(),
                name: Some("CP02-AAAA".into()),
                rssi: Some(-80),
                has_service: false,
            },
            Advertisement {
                address: "22:22:22:22:22:22".into(),
                name: Some("CP02-BBBB".into()),
                rssi: Some(-40),
                has_service: false,
            },
            Advertisement {
                address: "33:33:33:33:33:33".into(),
                name: Some("Headphones".into()),
                rssi: Some(-10),
                has_service: false,
            },
            Advertisement {
                address: "44:44:44:44:44:44".into(),
                name: None,
                rssi: Some(-90),
                has_service: true,
            },
        ];

        let any = ScanFilter { name_prefix: "CP02-".into(), target: None };
        assert_eq!(any.select(&found).map(|p| p.name), Some("CP02-BBBB".to_string()));

        let pinned = ScanFilter { name_prefix: "CP02-".into(), target: Some("aaaa".into()) };
        assert_eq!(
            pinned.select(&found).map(|p| p.address),
            Some("11:11:11:11:11:11".to_string())
        );

        let by_addr = ScanFilter { name_prefix: "CP02-".into(), target: Some("44:44".into()) };
        assert!(by_addr.select(&found).is_some());

        let missing = ScanFilter { name_prefix: "CP02-".into(), target: Some("zzz".into()) };
        assert_eq!(missing.select(&found), None);
    }
}
