//! CP02 Node - session, dispatcher and token handling shared by every front end
//!
//! The core is sans-IO: [`Session`], [`Dispatcher`], [`TokenStore`] and
//! [`PollSchedule`] take events and the current time and return what to do
//! next. The embedded gateway drives them from a cooperative tick; the host
//! drives them from the tokio [`Engine`] (feature `async`, on by default).

mod bridge;
mod config;
mod dispatcher;
mod error;
mod poller;
mod session;
mod token;

#[cfg(feature = "async")]
mod engine;
#[cfg(feature = "async")]
mod host;

pub use bridge::{
    BridgeCommand, BridgeRequest, BridgeResponse, DeviceCall, OtaProgress, WifiNetwork,
    format_address,
};
pub use config::{BackoffKind, Config, cp02_home};
pub use dispatcher::{Auth, DEAD_LINK_TIMEOUTS, Dispatcher, Outbound, Request, Transmit};
pub use error::{Error, ErrorKind, Result};
pub use poller::{DeviceInfo, PollJob, PollSchedule, StatusReport, Telemetry};
pub use session::{
    Advertisement, Backoff, Peer, ScanFilter, Session, SessionAction, SessionEvent, SessionState,
};
pub use token::{
    JsonTokenFile, MemoryTokens, SharedTokenStore, TokenRecord, TokenSearch, TokenStorage,
    TokenStore,
};

#[cfg(feature = "async")]
pub use engine::{Engine, EngineHandle, Link, LinkEvent};
#[cfg(feature = "async")]
pub use host::{Host, NoProvisioning, Provisioning};

pub use cp02_proto::{Message, ble, telemetry};
pub use serde_json::{Value as JsonValue, json};
