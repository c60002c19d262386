//! Request/response correlation over the notify characteristic
//!
//! The charger handles one command at a time, so the dispatcher keeps at most
//! one request in flight and queues the rest FIFO. Each request carries an
//! opaque result slot `T` (a oneshot sender in the async engine, a bridge
//! command id in the gateway) that is handed back exactly once: on a matching
//! response, on timeout, or on [`Dispatcher::fail_all`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use cp02_proto::{Message, auth_commands, ble};

use crate::{Error, Result};

/// Consecutive timeouts after which the link is considered dead
pub const DEAD_LINK_TIMEOUTS: u32 = 3;

/// Which token, if any, goes in front of the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    None,
    /// Whatever the token store holds when the frame goes out
    Session,
    /// A specific candidate, used while searching for the token
    Candidate(u8),
}

#[derive(Debug)]
pub struct Request<T> {
    pub service: u8,
    pub body: Vec<u8>,
    pub auth: Auth,
    pub timeout: Duration,
    pub slot: T,
}

impl<T> Request<T> {
    /// A command authenticated the way the service code requires
    pub fn command(service: u8, body: Vec<u8>, timeout: Duration, slot: T) -> Self {
        let auth = if ble::needs_token(service) { Auth::Session } else { Auth::None };
        Self { service, body, auth, timeout, slot }
    }

    /// Token probe: `GET_DEVICE_MODEL` carrying `candidate`
    pub fn probe(candidate: u8, timeout: Duration, slot: T) -> Self {
        Self {
            service: ble::commands::GET_DEVICE_MODEL,
            body: Vec::new(),
            auth: Auth::Candidate(candidate),
            timeout,
            slot,
        }
    }
}

/// A frame ready to be written to the RX characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub msg_id: u8,
    pub service: u8,
    pub frame: Vec<u8>,
}

/// What [`Dispatcher::poll_transmit`] wants done next
#[derive(Debug)]
pub enum Outbound<T> {
    Write(Transmit),
    /// The head of the queue could not be framed; resolve its slot with the error
    Reject(T, Error),
}

#[derive(Debug)]
struct InFlight<T> {
    msg_id: u8,
    service: u8,
    auth: Auth,
    sent_at: Instant,
    deadline: Instant,
    timeout: Duration,
    slot: T,
}

#[derive(Debug)]
pub struct Dispatcher<T> {
    next_msg_id: u8,
    queue: VecDeque<Request<T>>,
    in_flight: Option<InFlight<T>>,
    match_by_msg_id: bool,
    consecutive_timeouts: u32,
}

impl<T> Dispatcher<T> {
    /// `match_by_msg_id = false` resolves the in-flight request with whatever
    /// frame arrives next, for firmware that does not echo message ids.
    pub fn new(match_by_msg_id: bool) -> Self {
        Self {
            next_msg_id: 1,
            queue: VecDeque::new(),
            in_flight: None,
            match_by_msg_id,
            consecutive_timeouts: 0,
        }
    }

    pub fn submit(&mut self, request: Request<T>) {
        self.queue.push_back(request);
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    /// Requests queued or in flight
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    pub fn in_flight_msg_id(&self) -> Option<u8> {
        self.in_flight.as_ref().map(|f| f.msg_id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    pub fn is_dead_link(&self) -> bool {
        self.consecutive_timeouts >= DEAD_LINK_TIMEOUTS
    }

    fn allocate_msg_id(&mut self) -> u8 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Frame the next queued request if nothing is in flight. `token` is the
    /// current session token, needed by [`Auth::Session`] requests.
    pub fn poll_transmit(&mut self, now: Instant, token: Option<u8>) -> Option<Outbound<T>> {
        if self.in_flight.is_some() {
            return None;
        }
        let request = self.queue.pop_front()?;

        let body = match request.auth {
            Auth::None => auth_commands(false, 0, &request.body),
            Auth::Candidate(candidate) => auth_commands(true, candidate, &request.body),
            Auth::Session => match token {
                Some(token) => auth_commands(true, token, &request.body),
                None => return Some(Outbound::Reject(request.slot, Error::TokenUnknown)),
            },
        };

        let msg_id = self.allocate_msg_id();
        let frame = match Message::request(msg_id, request.service, body).encode() {
            Ok(frame) => frame,
            Err(e) => return Some(Outbound::Reject(request.slot, e.into())),
        };

        log::debug!(
            "-> {} msg_id={msg_id} {}",
            ble::command_name(request.service),
            data_encoding::HEXLOWER.encode(&frame)
        );

        self.in_flight = Some(InFlight {
            msg_id,
            service: request.service,
            auth: request.auth,
            sent_at: now,
            deadline: now + request.timeout,
            timeout: request.timeout,
            slot: request.slot,
        });
        Some(Outbound::Write(Transmit { msg_id, service: request.service, frame }))
    }

    /// Feed one notification. Returns the resolved slot when the frame answers
    /// the in-flight request; malformed or stale frames are logged and dropped.
    pub fn on_notification(&mut self, data: &[u8]) -> Option<(T, Result<Message>)> {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("dropping malformed frame ({e}): {}", data_encoding::HEXLOWER.encode(data));
                return None;
            }
        };

        let Some(in_flight) = self.in_flight.as_ref() else {
            log::debug!("unsolicited frame msg_id={} dropped", message.msg_id);
            return None;
        };
        if self.match_by_msg_id && message.msg_id != in_flight.msg_id {
            log::debug!(
                "stale frame msg_id={} (waiting for {}) dropped",
                message.msg_id,
                in_flight.msg_id
            );
            return None;
        }

        let in_flight = self.in_flight.take()?;
        self.consecutive_timeouts = 0;
        let service = ble::command_name(in_flight.service);
        log::debug!(
            "<- {service} msg_id={} success={} after {:?}",
            message.msg_id,
            message.is_success(),
            message_latency(&in_flight)
        );

        let result = if message.is_success() {
            Ok(message)
        } else if in_flight.auth == Auth::None {
            Err(Error::Rejected { service })
        } else {
            Err(Error::Auth { service })
        };
        Some((in_flight.slot, result))
    }

    /// Expire the in-flight request if its deadline has passed
    pub fn poll_timeout(&mut self, now: Instant) -> Option<(T, Error)> {
        if self.in_flight.as_ref()?.deadline > now {
            return None;
        }
        let in_flight = self.in_flight.take()?;
        // a wrong candidate is often just ignored by the charger
        if !matches!(in_flight.auth, Auth::Candidate(_)) {
            self.consecutive_timeouts += 1;
        }
        let service = ble::command_name(in_flight.service);
        log::warn!(
            "{service} msg_id={} timed out ({} in a row)",
            in_flight.msg_id,
            self.consecutive_timeouts
        );
        Some((
            in_flight.slot,
            Error::Timeout { service, msg_id: in_flight.msg_id, timeout: in_flight.timeout },
        ))
    }

    /// Drop the in-flight request without an answer (its write failed)
    pub fn abort_in_flight(&mut self) -> Option<T> {
        self.in_flight.take().map(|f| f.slot)
    }

    /// Empty the table. The caller resolves every returned slot with
    /// `SessionReset` (or `NotConnected`).
    pub fn fail_all(&mut self) -> Vec<T> {
        self.consecutive_timeouts = 0;
        let mut slots: Vec<T> = self.in_flight.take().into_iter().map(|f| f.slot).collect();
        slots.extend(self.queue.drain(..).map(|r| r.slot));
        slots
    }
}

fn message_latency<T>(in_flight: &InFlight<T>) -> Duration {
    Instant::now().saturating_duration_since(in_flight.sent_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp02_proto::{FLAG_ACK, ble::commands};

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn response(msg_id: u8, service: u8, success: bool, payload: &[u8]) -> Vec<u8> {
        let service = if success { (service | 0x80) as i8 } else { service as i8 };
        cp02_proto::encode(0, msg_id, service, 0, FLAG_ACK, payload).unwrap()
    }

    fn write(outbound: Option<Outbound<u32>>) -> Transmit {
        match outbound {
            Some(Outbound::Write(tx)) => tx,
            other => panic!("expected a write, got {other:?}"),
        }
    }

    #[test]
    fn one_request_in_flight_and_fifo_order() {
        let now = Instant::now();
        let mut d = Dispatcher::new(true);
        d.submit(Request::command(commands::TURN_ON_PORT, vec![1], TIMEOUT, 1u32));
        d.submit(Request::command(commands::TURN_OFF_PORT, vec![2], TIMEOUT, 2u32));

        let first = write(d.poll_transmit(now, Some(0x42)));
        assert_eq!(first.service, commands::TURN_ON_PORT);
        assert_eq!(&first.frame[9..], &[0x42, 1]);
        assert!(d.poll_transmit(now, Some(0x42)).is_none());
        assert_eq!(d.pending(), 2);

        let (slot, result) = d.on_notification(&response(first.msg_id, commands::TURN_ON_PORT, true, &[])).unwrap();
        assert_eq!(slot, 1);
        assert!(result.unwrap().is_success());

        let second = write(d.poll_transmit(now, Some(0x42)));
        assert_eq!(second.service, commands::TURN_OFF_PORT);
        assert_eq!(second.msg_id, first.msg_id.wrapping_add(1));
    }

    #[test]
    fn timeout_leaves_an_empty_table() {
        let now = Instant::now();
        let mut d = Dispatcher::new(true);
        d.submit(Request::command(commands::GET_DEVICE_MODEL, vec![], TIMEOUT, 7u32));
        let tx = write(d.poll_transmit(now, Some(1)));

        assert!(d.poll_timeout(now + Duration::from_secs(2)).is_none());
        let (slot, err) = d.poll_timeout(now + TIMEOUT).unwrap();
        assert_eq!(slot, 7);
        assert!(matches!(err, Error::Timeout { msg_id, .. } if msg_id == tx.msg_id));
        assert!(d.is_idle());
        assert_eq!(d.next_deadline(), None);

        // a late answer finds nothing to resolve
        assert!(d.on_notification(&response(tx.msg_id, commands::GET_DEVICE_MODEL, true, b"CP02")).is_none());
    }

    #[test]
    fn stale_and_malformed_frames_are_dropped() {
        let now = Instant::now();
        let mut d = Dispatcher::new(true);
        d.submit(Request::command(commands::GET_DEVICE_MODEL, vec![], TIMEOUT, 1u32));
        let tx = write(d.poll_transmit(now, Some(1)));

        let mut corrupt = response(tx.msg_id, commands::GET_DEVICE_MODEL, true, b"x");
        corrupt[8] ^= 0xFF;
        assert!(d.on_notification(&corrupt).is_none());
        assert!(d.on_notification(&[0x00, 0x01]).is_none());
        assert!(d.on_notification(&response(tx.msg_id.wrapping_sub(1), 0x1c, true, b"old")).is_none());
        assert_eq!(d.in_flight_msg_id(), Some(tx.msg_id));

        let (_, result) = d.on_notification(&response(tx.msg_id, 0x1c, true, b"CP02")).unwrap();
        assert_eq!(result.unwrap().payload, b"CP02");
    }

    #[test]
    fn single_outstanding_fallback_ignores_msg_id() {
        let now = Instant::now();
        let mut d = Dispatcher::new(false);
        d.submit(Request::command(commands::GET_DEVICE_MODEL, vec![], TIMEOUT, 1u32));
        let tx = write(d.poll_transmit(now, Some(1)));
        let (slot, _) = d.on_notification(&response(tx.msg_id.wrapping_add(9), 0x1c, true, b"m")).unwrap();
        assert_eq!(slot, 1);
    }

    #[test]
    fn failure_is_auth_or_rejected_depending_on_token() {
        let now = Instant::now();
        let mut d = Dispatcher::new(true);

        d.submit(Request::command(commands::REBOOT_DEVICE, vec![], TIMEOUT, 1u32));
        let tx = write(d.poll_transmit(now, Some(9)));
        let (_, result) = d.on_notification(&response(tx.msg_id, commands::REBOOT_DEVICE, false, &[])).unwrap();
        assert!(matches!(result, Err(Error::Auth { .. })));

        d.submit(Request::command(commands::ASSOCIATE_DEVICE, vec![5], TIMEOUT, 2u32));
        let tx = write(d.poll_transmit(now, None));
        assert_eq!(&tx.frame[9..], &[5]);
        let (_, result) = d.on_notification(&response(tx.msg_id, commands::ASSOCIATE_DEVICE, false, &[])).unwrap();
        assert!(matches!(result, Err(Error::Rejected { .. })));
    }

    #[test]
    fn session_token_required() {
        let mut d = Dispatcher::new(true);
        d.submit(Request::command(commands::GET_DEVICE_MODEL, vec![], TIMEOUT, 3u32));
        match d.poll_transmit(Instant::now(), None) {
            Some(Outbound::Reject(3, Error::TokenUnknown)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(d.is_idle());
    }

    #[test]
    fn probe_uses_the_candidate() {
        let mut d = Dispatcher::new(true);
        d.submit(Request::probe(0x42, Duration::from_millis(300), 0u32));
        let tx = write(d.poll_transmit(Instant::now(), Some(0x01)));
        assert_eq!(tx.service, commands::GET_DEVICE_MODEL);
        assert_eq!(&tx.frame[9..], &[0x42]);
    }

    #[test]
    fn three_timeouts_mark_a_dead_link() {
        let mut now = Instant::now();
        let mut d = Dispatcher::new(true);
        for i in 0..DEAD_LINK_TIMEOUTS {
            assert!(!d.is_dead_link());
            d.submit(Request::command(commands::GET_DEVICE_MODEL, vec![], TIMEOUT, i));
            write(d.poll_transmit(now, Some(1)));
            now += TIMEOUT;
            assert!(d.poll_timeout(now).is_some());
        }
        assert!(d.is_dead_link());
        d.fail_all();
        assert!(!d.is_dead_link());
    }

    #[test]
    fn silent_probes_do_not_count_toward_a_dead_link() {
        let mut now = Instant::now();
        let mut d = Dispatcher::new(true);
        for candidate in 0..10u8 {
            d.submit(Request::probe(candidate, Duration::from_millis(300), 0u32));
            write(d.poll_transmit(now, None));
            now += Duration::from_millis(300);
            assert!(d.poll_timeout(now).is_some());
        }
        assert!(!d.is_dead_link());
    }

    #[test]
    fn fail_all_returns_every_slot() {
        let mut d = Dispatcher::new(true);
        for i in 0..3u32 {
            d.submit(Request::command(commands::GET_DEVICE_MODEL, vec![], TIMEOUT, i));
        }
        write(d.poll_transmit(Instant::now(), Some(1)));
        assert_eq!(d.fail_all(), vec![0, 1, 2]);
        assert!(d.is_idle());
    }

    #[test]
    fn msg_id_counts_from_one_and_wraps() {
        let now = Instant::now();
        let mut d = Dispatcher::new(true);
        let mut ids = Vec::new();
        for _ in 0..=256 {
            d.submit(Request::command(commands::GET_DEVICE_MODEL, vec![], TIMEOUT, 0u32));
            ids.push(write(d.poll_transmit(now, Some(1))).msg_id);
            d.abort_in_flight();
        }
        assert_eq!(ids[0], 1);
        assert_eq!(ids[254], 255);
        assert_eq!(ids[255], 0);
        assert_eq!(ids[256], 1);
    }
}
