//! Async engine: one task owns the link, the session and the dispatcher
//!
//! Other tasks talk to it through a cloneable [`EngineHandle`]: every call is a
//! message on an mpsc queue answered on a oneshot. Telemetry goes out on a
//! broadcast channel and is dropped when nobody listens.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

use cp02_proto::Message;
use cp02_proto::ble::{self, commands};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::config::Config;
use crate::dispatcher::{Auth, Dispatcher, Outbound, Request};
use crate::poller::{DeviceInfo, PollJob, PollSchedule, StatusReport, Telemetry};
use crate::session::{
    Advertisement, Peer, ScanFilter, Session, SessionAction, SessionEvent, SessionState,
};
use crate::token::{SharedTokenStore, TokenSearch, TokenStorage, TokenStore};
use crate::{Error, Result};

const COMMAND_QUEUE: usize = 32;
const TELEMETRY_QUEUE: usize = 64;

/// The BLE transport as the engine sees it.
///
/// Notifications from the TX characteristic and link drops are reported on the
/// [`LinkEvent`] channel handed to [`Engine::new`].
pub trait Link: Send + 'static {
    fn scan(&mut self, duration: Duration)
        -> impl Future<Output = Result<Vec<Advertisement>>> + Send;

    fn connect(&mut self, peer: &Peer) -> impl Future<Output = Result<()>> + Send;

    /// Resolve the charger service and its TX/RX characteristics. `Ok(false)`
    /// means the peer does not expose them.
    fn discover(&mut self) -> impl Future<Output = Result<bool>> + Send;

    /// Enable notifications on TX
    fn subscribe(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Write one frame to RX
    fn write(&mut self, frame: &[u8]) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification(Vec<u8>),
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
enum TokenOp {
    Get,
    Set(u8),
    Clear,
}

enum Command {
    Send {
        service: u8,
        body: Vec<u8>,
        auth: Option<Auth>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Message>>,
    },
    Connect {
        target: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Rescan {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Bruteforce {
        range: RangeInclusive<u8>,
        reply: oneshot::Sender<Result<Option<u8>>>,
    },
    CancelBruteforce,
    Token {
        op: TokenOp,
        reply: oneshot::Sender<Result<Option<u8>>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
}

/// Who is waiting for a dispatched request
enum Slot {
    Caller(oneshot::Sender<Result<Message>>),
    Poll(PollJob, u8),
    Probe(u8),
}

struct ActiveSearch {
    search: TokenSearch,
    reply: Option<oneshot::Sender<Result<Option<u8>>>>,
    probing: bool,
    resume_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct PollsInFlight {
    ports: usize,
    info: usize,
}

impl PollsInFlight {
    fn of(&mut self, job: PollJob) -> &mut usize {
        match job {
            PollJob::Ports => &mut self.ports,
            PollJob::DeviceInfo => &mut self.info,
        }
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    telemetry: broadcast::Sender<Telemetry>,
}

impl EngineHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::transport("engine stopped"))?;
        response.await.map_err(|_| Error::transport("engine stopped"))
    }

    /// Send one command with the default timeout. The token is added when the
    /// service code requires it.
    pub async fn send(&self, service: u8, body: Vec<u8>) -> Result<Message> {
        self.request(|reply| Command::Send { service, body, auth: None, timeout: None, reply })
            .await?
    }

    pub async fn send_with_timeout(
        &self,
        service: u8,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request(|reply| Command::Send {
            service,
            body,
            auth: None,
            timeout: Some(timeout),
            reply,
        })
        .await?
    }

    /// Send with an explicit token choice instead of the one the service
    /// code implies. `None` for `timeout` uses the configured default.
    pub async fn send_with_auth(
        &self,
        service: u8,
        body: Vec<u8>,
        auth: Auth,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.request(|reply| Command::Send { service, body, auth: Some(auth), timeout, reply })
            .await?
    }

    /// Start the session (optionally pinned to `target`) and wait until it is
    /// connected or gives up with `LinkLost`.
    pub async fn connect(&self, target: Option<String>) -> Result<()> {
        self.request(|reply| Command::Connect { target, reply }).await?
    }

    /// Drop the current link and scan again
    pub async fn rescan(&self) -> Result<()> {
        self.request(|reply| Command::Rescan { reply }).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Search `range` for the token. `Ok(None)` when no candidate was accepted
    /// or the search was cancelled.
    pub async fn bruteforce(&self, range: RangeInclusive<u8>) -> Result<Option<u8>> {
        self.request(|reply| Command::Bruteforce { range, reply }).await?
    }

    pub async fn cancel_bruteforce(&self) -> Result<()> {
        self.commands
            .send(Command::CancelBruteforce)
            .await
            .map_err(|_| Error::transport("engine stopped"))
    }

    pub async fn token(&self) -> Result<Option<u8>> {
        self.request(|reply| Command::Token { op: TokenOp::Get, reply }).await?
    }

    pub async fn set_token(&self, token: u8) -> Result<()> {
        self.request(|reply| Command::Token { op: TokenOp::Set(token), reply })
            .await?
            .map(|_| ())
    }

    pub async fn clear_token(&self) -> Result<()> {
        self.request(|reply| Command::Token { op: TokenOp::Clear, reply })
            .await?
            .map(|_| ())
    }

    /// Run both poll jobs now
    pub async fn refresh(&self) -> Result<()> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Telemetry> {
        self.telemetry.subscribe()
    }
}

pub struct Engine<L, S> {
    link: L,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::Receiver<Command>,
    telemetry: broadcast::Sender<Telemetry>,
    config: Config,
    filter: ScanFilter,
    session: Session,
    dispatcher: Dispatcher<Slot>,
    poller: PollSchedule,
    polls: PollsInFlight,
    device_info: DeviceInfo,
    tokens: SharedTokenStore<S>,
    search: Option<ActiveSearch>,
    backoff_until: Option<Instant>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl<L: Link, S: TokenStorage + Send + 'static> Engine<L, S> {
    pub fn new(
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: Config,
        tokens: SharedTokenStore<S>,
    ) -> (Self, EngineHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (telemetry, _) = broadcast::channel(TELEMETRY_QUEUE);
        let handle = EngineHandle { commands: command_tx, telemetry: telemetry.clone() };

        let engine = Self {
            link,
            link_events,
            commands,
            telemetry,
            filter: config.scan_filter(),
            session: Session::new(config.max_retries, config.backoff()),
            dispatcher: Dispatcher::new(config.match_by_msg_id),
            poller: PollSchedule::new(config.ports_poll(), config.info_poll()),
            polls: PollsInFlight::default(),
            device_info: DeviceInfo::default(),
            tokens,
            search: None,
            backoff_until: None,
            connect_waiters: Vec::new(),
            config,
        };
        (engine, handle)
    }

    /// Spawn the engine on the current tokio runtime
    pub fn spawn(
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: Config,
        tokens: SharedTokenStore<S>,
    ) -> EngineHandle {
        let (engine, handle) = Self::new(link, link_events, config, tokens);
        tokio::spawn(engine.run());
        handle
    }

    /// Run until every [`EngineHandle`] is dropped
    pub async fn run(mut self) {
        loop {
            self.pump().await;
            let wake = self.next_wakeup();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                event = self.link_events.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => {
                        log::warn!("link event stream closed");
                        break;
                    }
                },
                _ = sleep_or_pending(wake) => self.on_timer().await,
            }
        }

        if self.session.state() != SessionState::Disconnected {
            self.apply(SessionEvent::Disconnect).await;
        }
        log::debug!("engine stopped");
    }

    fn tokens(&self) -> MutexGuard<'_, TokenStore<S>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let poll = if self.session.is_connected() { self.poller.next_deadline() } else { None };
        [self.dispatcher.next_deadline(), poll]
            .into_iter()
            .flatten()
            .map(Instant::from_std)
            .chain(self.backoff_until)
            .chain(self.search.as_ref().and_then(|s| s.resume_at))
            .min()
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { service, body, auth, timeout, reply } => {
                if !self.session.is_connected() {
                    let _ = reply.send(Err(Error::NotConnected));
                    return;
                }
                let timeout = timeout.unwrap_or(self.config.command_timeout());
                let slot = Slot::Caller(reply);
                let request = match auth {
                    Some(auth) => Request { service, body, auth, timeout, slot },
                    None => Request::command(service, body, timeout, slot),
                };
                self.dispatcher.submit(request);
            }
            Command::Connect { target, reply } => self.connect(target, reply).await,
            Command::Rescan { reply } => {
                self.apply(SessionEvent::Disconnect).await;
                self.backoff_until = None;
                self.apply(SessionEvent::StartScan).await;
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect { reply } => {
                self.apply(SessionEvent::Disconnect).await;
                self.backoff_until = None;
                let _ = reply.send(Ok(()));
            }
            Command::Bruteforce { range, reply } => {
                if !self.session.is_connected() {
                    let _ = reply.send(Err(Error::NotConnected));
                    return;
                }
                self.start_search(range, Some(reply));
            }
            Command::CancelBruteforce => {
                if let Some(active) = self.search.as_mut() {
                    log::info!("token search cancelled");
                    active.search.cancel();
                }
            }
            Command::Token { op, reply } => {
                let result = {
                    let mut tokens = self.tokens();
                    match op {
                        TokenOp::Get => Ok(tokens.get()),
                        TokenOp::Set(token) => tokens.set(token).map(|_| Some(token)),
                        TokenOp::Clear => tokens.clear().map(|_| None),
                    }
                };
                let _ = reply.send(result);
            }
            Command::Refresh { reply } => {
                if self.session.is_connected() {
                    self.poller.start(Instant::now().into_std());
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(Error::NotConnected));
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn connect(&mut self, target: Option<String>, reply: oneshot::Sender<Result<()>>) {
        let retarget = target.is_some() && target != self.filter.target;
        if let Some(target) = target {
            self.filter.target = Some(target);
        }

        if self.session.is_connected() && !retarget {
            let _ = reply.send(Ok(()));
            return;
        }
        if retarget && self.session.state() != SessionState::Disconnected {
            self.apply(SessionEvent::Disconnect).await;
            self.backoff_until = None;
        }

        self.connect_waiters.push(reply);
        if self.session.state() == SessionState::Disconnected {
            self.apply(SessionEvent::StartScan).await;
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Notification(data) => {
                if let Some((slot, result)) = self.dispatcher.on_notification(&data) {
                    self.resolve(slot, result);
                }
            }
            LinkEvent::Disconnected => self.apply(SessionEvent::LinkDown).await,
        }
    }

    async fn on_timer(&mut self) {
        if self.backoff_until.is_some_and(|at| at <= Instant::now()) {
            self.backoff_until = None;
            self.apply(SessionEvent::BackoffElapsed).await;
        }

        if let Some((slot, err)) = self.dispatcher.poll_timeout(Instant::now().into_std()) {
            self.resolve(slot, Err(err));
            if self.session.is_connected() && self.dispatcher.is_dead_link() {
                self.apply(SessionEvent::DeadLink).await;
            }
        }

        if self.session.is_connected() {
            while let Some(job) = self.poller.poll(Instant::now().into_std()) {
                self.run_job(job);
            }
        }
    }

    /// Put the next frame on the air if nothing is in flight
    async fn pump(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        self.step_search();

        loop {
            let token = self.tokens().get();
            let Some(outbound) = self.dispatcher.poll_transmit(Instant::now().into_std(), token)
            else {
                break;
            };
            match outbound {
                Outbound::Reject(slot, err) => self.resolve(slot, Err(err)),
                Outbound::Write(tx) => {
                    if let Err(e) = self.link.write(&tx.frame).await {
                        log::warn!("write of msg_id={} failed: {e}", tx.msg_id);
                        if let Some(slot) = self.dispatcher.abort_in_flight() {
                            self.resolve(slot, Err(e));
                        }
                        self.apply(SessionEvent::LinkDown).await;
                    }
                    break;
                }
            }
        }
    }

    async fn apply(&mut self, event: SessionEvent) {
        let before = self.session.state();
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            for action in self.session.handle(event) {
                if let Some(next) = self.execute(action).await {
                    events.push_back(next);
                }
            }
        }

        match self.session.state() {
            SessionState::Connected => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            SessionState::Disconnected => {
                let attempts = self.session.retries();
                let link_lost = self.session.link_lost();
                if link_lost && !self.connect_waiters.is_empty() {
                    log::info!("connect failed, dropping the target pin");
                    self.filter.target = self.config.target.clone();
                }
                for waiter in self.connect_waiters.drain(..) {
                    let err = if link_lost { Error::LinkLost { attempts } } else { Error::NotConnected };
                    let _ = waiter.send(Err(err));
                }
            }
            _ => {}
        }

        if self.session.state() != before {
            self.publish_status();
        }
    }

    async fn execute(&mut self, action: SessionAction) -> Option<SessionEvent> {
        match action {
            SessionAction::Scan => {
                let found = match self.link.scan(self.config.scan_duration()).await {
                    Ok(found) => found,
                    Err(e) => {
                        log::warn!("scan failed: {e}");
                        Vec::new()
                    }
                };
                log::debug!("scan saw {} advertisements", found.len());
                Some(match self.filter.select(&found) {
                    Some(peer) => SessionEvent::DeviceFound(peer),
                    None => SessionEvent::ScanEmpty,
                })
            }
            SessionAction::Connect(peer) => {
                // events left over from the previous link
                while self.link_events.try_recv().is_ok() {}
                self.tokens().bind(&peer.address);

                log::info!("connecting to {} ({})", peer.name, peer.address);
                let connect = tokio::time::timeout(self.config.connect_timeout(), self.link.connect(&peer));
                Some(match connect.await {
                    Ok(Ok(())) => SessionEvent::LinkUp,
                    Ok(Err(e)) => SessionEvent::ConnectFailed(e.to_string()),
                    Err(_) => SessionEvent::ConnectFailed("connect timed out".to_string()),
                })
            }
            SessionAction::Discover => Some(match self.link.discover().await {
                Ok(true) => SessionEvent::ServiceFound,
                Ok(false) => SessionEvent::ServiceMissing,
                Err(e) => SessionEvent::ConnectFailed(e.to_string()),
            }),
            SessionAction::Subscribe => Some(match self.link.subscribe().await {
                Ok(()) => SessionEvent::NotifySubscribed,
                Err(e) => SessionEvent::ConnectFailed(e.to_string()),
            }),
            SessionAction::CloseLink => {
                if let Err(e) = self.link.disconnect().await {
                    log::debug!("disconnect: {e}");
                }
                None
            }
            SessionAction::Wait(delay) => {
                log::info!("reconnecting in {delay:?}");
                self.backoff_until = Some(Instant::now() + delay);
                None
            }
            SessionAction::FailPending => {
                self.abort_search();
                for slot in self.dispatcher.fail_all() {
                    self.resolve(slot, Err(Error::SessionReset));
                }
                self.polls = PollsInFlight::default();
                None
            }
            SessionAction::StartPolling => {
                self.poller.start(Instant::now().into_std());
                self.device_info = DeviceInfo::for_peer(self.session.peer());
                let token_known = self.tokens().get().is_some();
                if !token_known && self.config.auto_bruteforce {
                    self.start_search(0..=255, None);
                }
                None
            }
            SessionAction::StopPolling => {
                self.poller.stop();
                None
            }
            SessionAction::LinkLost { attempts } => {
                log::error!("giving up after {attempts} reconnect attempts");
                None
            }
        }
    }

    fn resolve(&mut self, slot: Slot, result: Result<Message>) {
        match slot {
            Slot::Caller(reply) => {
                let _ = reply.send(result);
            }
            Slot::Poll(job, service) => self.on_poll_result(job, service, result),
            Slot::Probe(candidate) => self.on_probe_result(candidate, result),
        }
    }

    fn run_job(&mut self, job: PollJob) {
        if self.search.is_some() || self.tokens().get().is_none() {
            log::debug!("skipping {job:?} poll until the token is known");
            return;
        }
        if *self.polls.of(job) > 0 {
            log::debug!("skipping {job:?} poll, previous run still pending");
            return;
        }
        if job == PollJob::DeviceInfo {
            self.device_info = DeviceInfo::for_peer(self.session.peer());
        }
        for &service in job.commands() {
            self.dispatcher.submit(Request::command(
                service,
                Vec::new(),
                self.config.command_timeout(),
                Slot::Poll(job, service),
            ));
            *self.polls.of(job) += 1;
        }
    }

    fn on_poll_result(&mut self, job: PollJob, service: u8, result: Result<Message>) {
        let outstanding = self.polls.of(job);
        *outstanding = outstanding.saturating_sub(1);

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                log::debug!("poll {} failed: {e}", ble::command_name(service));
                return;
            }
        };

        if service == commands::GET_ALL_POWER_STATISTICS {
            self.publish(Telemetry::ports(&message.payload));
        } else {
            self.device_info.apply(service, &message.payload);
            if service == commands::GET_DEVICE_UPTIME {
                self.publish(Telemetry::DeviceInfo(self.device_info.clone()));
                self.publish_status();
            }
        }
    }

    fn start_search(&mut self, range: RangeInclusive<u8>, reply: Option<oneshot::Sender<Result<Option<u8>>>>) {
        let begun = self.tokens().begin_search(range);
        match begun {
            Ok(search) => {
                log::info!("searching for the token ({} candidates)", search.remaining());
                self.search = Some(ActiveSearch { search, reply, probing: false, resume_at: None });
                self.publish_status();
            }
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    fn step_search(&mut self) {
        let now = Instant::now();
        let Some(active) = self.search.as_mut() else {
            return;
        };
        if active.probing || active.resume_at.is_some_and(|at| at > now) {
            return;
        }
        active.resume_at = None;

        match active.search.next() {
            Some(candidate) => {
                if candidate % 32 == 0 {
                    log::info!("token search: trying 0x{candidate:02x}..");
                }
                active.probing = true;
                self.dispatcher.submit(Request::probe(
                    candidate,
                    self.config.probe_timeout(),
                    Slot::Probe(candidate),
                ));
            }
            None => self.finish_search(None),
        }
    }

    fn on_probe_result(&mut self, candidate: u8, result: Result<Message>) {
        let probe_delay = self.config.probe_delay();
        let Some(active) = self.search.as_mut() else {
            return;
        };
        active.probing = false;

        let accepted = matches!(&result, Ok(message) if !message.payload.is_empty());
        if accepted {
            self.finish_search(Some(candidate));
        } else {
            active.resume_at = Some(Instant::now() + probe_delay);
        }
    }

    fn finish_search(&mut self, found: Option<u8>) {
        let Some(active) = self.search.take() else {
            return;
        };
        let persisted = self.tokens().finish_search(found);
        if let Err(e) = persisted {
            log::warn!("could not persist token: {e}");
        }
        if found.is_none() {
            if active.search.is_cancelled() {
                log::info!("token search stopped after {} candidates", active.search.attempts());
            } else {
                log::warn!("no token accepted after {} candidates", active.search.attempts());
            }
        }
        if let Some(reply) = active.reply {
            let _ = reply.send(Ok(found));
        }
        self.publish_status();
    }

    fn abort_search(&mut self) {
        if let Some(active) = self.search.take() {
            let _ = self.tokens().finish_search(None);
            if let Some(reply) = active.reply {
                let _ = reply.send(Err(Error::SessionReset));
            }
        }
    }

    fn status(&self) -> StatusReport {
        let (token_known, searching_token) = {
            let tokens = self.tokens();
            (tokens.get().is_some(), tokens.is_searching())
        };
        StatusReport {
            state: self.session.state(),
            connected: self.session.is_connected(),
            device: self.session.peer().cloned(),
            token_known,
            searching_token,
            retries: self.session.retries(),
            link_lost: self.session.link_lost(),
            last_error: self.session.last_error().map(str::to_string),
        }
    }

    fn publish(&self, event: Telemetry) {
        let _ = self.telemetry.send(event);
    }

    fn publish_status(&self) {
        self.publish(Telemetry::Status(self.status()));
    }
}

async fn sleep_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
