//! Session state machine and public API.
//!
//! A session walks through three phases: `create` (register with the
//! signaling service and open the push stream), `start` (wake the console
//! and receive its `customData1`), and one `punch_hole` per channel
//! (exchange OFFER/RESULT/ACCEPT messages and probe the peer's candidates
//! until a UDP socket works). Progress is tracked in a monotonic bitfield;
//! bits are set exactly once and never cleared.

use crate::config::HolepunchConfig;
use crate::discovery::{self, UpnpGateway};
use crate::error::{HolepunchError, Result};
use crate::message::{
    self, bytes_to_hex, decode_custom_data1, parse_hex_duid, Candidate, CandidateType,
    ConnectionRequest, SessionMessage, SessionMessageAction,
};
use crate::probe::{check_candidates, ProbeIdentity};
use crate::psn::{ConsoleFamily, PsnClient};
use crate::push::{run_push_worker, NotificationKind, NotificationQueue, NotificationWaiter};
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Prefix of client-generated device unique ids.
pub const DUID_PREFIX: &str = "0000000700410080";

/// Length of a client-generated device unique id string.
pub const DUID_STR_SIZE: usize = DUID_PREFIX.len() + 32;

/// Request id used for our own OFFER.
const OFFER_REQ_ID: u16 = 1;

/// Request id used for our ACCEPT.
// TODO: derive from the preceding exchange once the console's numbering is
// reverse-engineered; the official client always sends 2 here
const ACCEPT_REQ_ID: u16 = 2;

/// Channel to punch a hole for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Control channel, punched first.
    Ctrl,
    /// Data channel, requires the control channel to be established.
    Data,
}

impl Channel {
    const fn as_str(self) -> &'static str {
        match self {
            Channel::Ctrl => "control",
            Channel::Data => "data",
        }
    }

    const fn offer_received(self) -> SessionState {
        match self {
            Channel::Ctrl => SessionState::CTRL_OFFER_RECEIVED,
            Channel::Data => SessionState::DATA_OFFER_RECEIVED,
        }
    }

    const fn offer_sent(self) -> SessionState {
        match self {
            Channel::Ctrl => SessionState::CTRL_OFFER_SENT,
            Channel::Data => SessionState::DATA_OFFER_SENT,
        }
    }

    const fn console_accepted(self) -> SessionState {
        match self {
            Channel::Ctrl => SessionState::CTRL_CONSOLE_ACCEPTED,
            Channel::Data => SessionState::DATA_CONSOLE_ACCEPTED,
        }
    }

    const fn client_accepted(self) -> SessionState {
        match self {
            Channel::Ctrl => SessionState::CTRL_CLIENT_ACCEPTED,
            Channel::Data => SessionState::DATA_CLIENT_ACCEPTED,
        }
    }

    const fn established(self) -> SessionState {
        match self {
            Channel::Ctrl => SessionState::CTRL_ESTABLISHED,
            Channel::Data => SessionState::DATA_ESTABLISHED,
        }
    }
}

/// Monotonic session progress bits. Bits are only ever set, never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState(u32);

impl SessionState {
    pub const INIT: SessionState = SessionState(0);
    pub const WS_OPEN: SessionState = SessionState(1);
    pub const CREATED: SessionState = SessionState(1 << 1);
    pub const STARTED: SessionState = SessionState(1 << 2);
    pub const CLIENT_JOINED: SessionState = SessionState(1 << 3);
    pub const DATA_SENT: SessionState = SessionState(1 << 4);
    pub const CONSOLE_JOINED: SessionState = SessionState(1 << 5);
    pub const CUSTOMDATA1_RECEIVED: SessionState = SessionState(1 << 6);
    pub const CTRL_OFFER_RECEIVED: SessionState = SessionState(1 << 7);
    pub const CTRL_OFFER_SENT: SessionState = SessionState(1 << 8);
    pub const CTRL_CONSOLE_ACCEPTED: SessionState = SessionState(1 << 9);
    pub const CTRL_CLIENT_ACCEPTED: SessionState = SessionState(1 << 10);
    pub const CTRL_ESTABLISHED: SessionState = SessionState(1 << 11);
    pub const DATA_OFFER_RECEIVED: SessionState = SessionState(1 << 12);
    pub const DATA_OFFER_SENT: SessionState = SessionState(1 << 13);
    pub const DATA_CONSOLE_ACCEPTED: SessionState = SessionState(1 << 14);
    pub const DATA_CLIENT_ACCEPTED: SessionState = SessionState(1 << 15);
    pub const DATA_ESTABLISHED: SessionState = SessionState(1 << 16);

    const NAMES: &'static [(SessionState, &'static str)] = &[
        (Self::WS_OPEN, "WS_OPEN"),
        (Self::CREATED, "CREATED"),
        (Self::STARTED, "STARTED"),
        (Self::CLIENT_JOINED, "CLIENT_JOINED"),
        (Self::DATA_SENT, "DATA_SENT"),
        (Self::CONSOLE_JOINED, "CONSOLE_JOINED"),
        (Self::CUSTOMDATA1_RECEIVED, "CUSTOMDATA1_RECEIVED"),
        (Self::CTRL_OFFER_RECEIVED, "CTRL_OFFER_RECEIVED"),
        (Self::CTRL_OFFER_SENT, "CTRL_OFFER_SENT"),
        (Self::CTRL_CONSOLE_ACCEPTED, "CTRL_CONSOLE_ACCEPTED"),
        (Self::CTRL_CLIENT_ACCEPTED, "CTRL_CLIENT_ACCEPTED"),
        (Self::CTRL_ESTABLISHED, "CTRL_ESTABLISHED"),
        (Self::DATA_OFFER_RECEIVED, "DATA_OFFER_RECEIVED"),
        (Self::DATA_OFFER_SENT, "DATA_OFFER_SENT"),
        (Self::DATA_CONSOLE_ACCEPTED, "DATA_CONSOLE_ACCEPTED"),
        (Self::DATA_CLIENT_ACCEPTED, "DATA_CLIENT_ACCEPTED"),
        (Self::DATA_ESTABLISHED, "DATA_ESTABLISHED"),
    ];

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: SessionState) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every bit of `other`.
    pub fn insert(&mut self, other: SessionState) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for SessionState {
    type Output = SessionState;

    fn bitor(self, rhs: SessionState) -> SessionState {
        SessionState(self.0 | rhs.0)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (bit, name) in Self::NAMES {
            if self.contains(*bit) {
                write!(f, " {}", name)?;
            }
        }
        write!(f, " ]")
    }
}

/// Addressing data a session message envelope needs; filled in by the
/// create and start phases.
#[derive(Default)]
struct MessageTarget {
    session_id: String,
    account_id: u64,
    console_uid_hex: Option<String>,
    family: Option<ConsoleFamily>,
}

/// Session state shared with the push worker.
pub(crate) struct SessionInner {
    pub(crate) psn: PsnClient,
    pub(crate) config: HolepunchConfig,
    pub(crate) queue: Arc<NotificationQueue>,
    state: watch::Sender<SessionState>,
    target: Mutex<MessageTarget>,
}

impl SessionInner {
    /// Set progress bits and log the transition. Bits are OR-ed in, keeping
    /// the field monotonic.
    pub(crate) fn set_state(&self, bits: SessionState) {
        self.state.send_modify(|state| state.insert(bits));
        debug!("session state: {}", *self.state.borrow());
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Serialize and send a session message to the console.
    pub(crate) async fn send_session_message(&self, message: &SessionMessage) -> Result<()> {
        let (session_id, account_id, console_uid_hex, family) = {
            let target = self.target.lock().expect("message target poisoned");
            let console_uid_hex = target
                .console_uid_hex
                .clone()
                .ok_or(HolepunchError::Uninitialized("console not selected yet"))?;
            let family = target
                .family
                .ok_or(HolepunchError::Uninitialized("console not selected yet"))?;
            (
                target.session_id.clone(),
                target.account_id,
                console_uid_hex,
                family,
            )
        };
        let body = message.serialize(account_id);
        self.psn
            .send_session_message(&session_id, account_id, &console_uid_hex, family, &body)
            .await
    }
}

/// A hole-punching session against one console.
///
/// Phases must be called in order from a single task: [`Session::create`],
/// [`Session::start`], then [`Session::punch_hole`] for the control channel
/// and again for the data channel. [`Session::fini`] releases the push
/// worker and any UPnP mappings.
pub struct Session {
    inner: Arc<SessionInner>,
    state_rx: watch::Receiver<SessionState>,
    stop_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,

    pushctx_id: String,
    sid_local: u16,
    sid_peer: u16,
    hashed_id_local: [u8; 20],
    hashed_id_peer: [u8; 20],
    data1: [u8; 16],
    data2: [u8; 16],
    custom_data1: [u8; 16],

    /// Socket the console can reach us on, advertised in our OFFER. Kept
    /// bound for the lifetime of the session.
    client_socks: Vec<UdpSocket>,
    upnp: Option<UpnpGateway>,
}

impl Session {
    /// Create a session context with default configuration.
    pub fn new(token: &str) -> Session {
        Self::with_config(token, HolepunchConfig::default())
    }

    /// Create a session context.
    pub fn with_config(token: &str, config: HolepunchConfig) -> Session {
        let (state_tx, state_rx) = watch::channel(SessionState::INIT);
        let (stop_tx, _) = watch::channel(false);

        let mut hashed_id_local = [0u8; 20];
        OsRng.fill_bytes(&mut hashed_id_local);
        let mut data1 = [0u8; 16];
        OsRng.fill_bytes(&mut data1);
        let mut data2 = [0u8; 16];
        OsRng.fill_bytes(&mut data2);

        let inner = Arc::new(SessionInner {
            psn: PsnClient::new(token),
            config,
            queue: Arc::new(NotificationQueue::default()),
            state: state_tx,
            target: Mutex::new(MessageTarget::default()),
        });
        debug!("session state: {}", SessionState::INIT);

        Session {
            inner,
            state_rx,
            stop_tx,
            worker: None,
            pushctx_id: Uuid::new_v4().to_string(),
            sid_local: OsRng.next_u32() as u16,
            sid_peer: 0,
            hashed_id_local,
            hashed_id_peer: [0u8; 20],
            data1,
            data2,
            custom_data1: [0u8; 16],
            client_socks: Vec::new(),
            upnp: None,
        }
    }

    /// The 16-byte `customData1` value received from the console.
    pub fn custom_data1(&self) -> &[u8; 16] {
        &self.custom_data1
    }

    /// Current progress bits.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Create the remote play session on the signaling service.
    ///
    /// Starts the push worker, waits for the stream to open, registers the
    /// session and consumes the `SessionCreated`/`MemberCreated`
    /// notifications confirming it. On failure the worker is stopped and
    /// resources are released.
    pub async fn create(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(HolepunchError::Unknown("session already created".into()));
        }
        let fqdn = self.inner.psn.get_websocket_fqdn().await?;
        let worker = tokio::spawn(run_push_worker(
            self.inner.clone(),
            fqdn,
            self.stop_tx.subscribe(),
        ));
        self.worker = Some(worker);
        debug!("started push notification worker");

        let deadline = Instant::now() + self.inner.config.creation_timeout;
        let result = self.create_inner(deadline).await;
        if result.is_err() {
            self.stop_worker().await;
        }
        result
    }

    async fn create_inner(&mut self, deadline: Instant) -> Result<()> {
        self.await_state(SessionState::WS_OPEN, deadline, "websocket open")
            .await?;

        let (session_id, account_id) = self.inner.psn.create_session(&self.pushctx_id).await?;
        info!("session {} created for account {}", session_id, account_id);
        {
            let mut target = self.inner.target.lock().expect("message target poisoned");
            target.session_id = session_id;
            target.account_id = account_id;
        }

        let mut waiter = NotificationWaiter::new(self.inner.queue.clone());
        let mask = NotificationKind::SessionCreated.mask() | NotificationKind::MemberCreated.mask();
        let wanted = SessionState::CREATED | SessionState::CLIENT_JOINED;
        while !self.inner.state().contains(wanted) {
            let notification = waiter
                .wait(mask, deadline, "session creation notifications")
                .await?;
            match notification.kind {
                NotificationKind::SessionCreated => {
                    debug!("session created");
                    self.inner.set_state(SessionState::CREATED);
                }
                NotificationKind::MemberCreated => {
                    debug!("client joined session");
                    self.inner.set_state(SessionState::CLIENT_JOINED);
                }
                kind => {
                    return Err(HolepunchError::Unknown(format!(
                        "unexpected notification kind {:?}",
                        kind
                    )))
                }
            }
            self.inner.queue.clear(notification.seq);
        }
        Ok(())
    }

    /// Start the session on the given console.
    ///
    /// Waits until the console joined the session and its `customData1`
    /// arrived, both under one shared deadline.
    pub async fn start(&mut self, console_uid: [u8; 32], family: ConsoleFamily) -> Result<()> {
        let state = self.inner.state();
        if !state.contains(SessionState::CREATED) {
            return Err(HolepunchError::Uninitialized("session not created yet"));
        }
        if state.contains(SessionState::STARTED) {
            return Err(HolepunchError::Unknown("session already started".into()));
        }

        let console_uid_hex = bytes_to_hex(&console_uid);
        let (session_id, account_id) = {
            let mut target = self.inner.target.lock().expect("message target poisoned");
            target.console_uid_hex = Some(console_uid_hex.clone());
            target.family = Some(family);
            (target.session_id.clone(), target.account_id)
        };
        debug!(
            "starting session {} for device {}",
            session_id, console_uid_hex
        );

        self.inner
            .psn
            .start_session(
                account_id,
                &session_id,
                &self.data1,
                &self.data2,
                &console_uid_hex,
                family,
            )
            .await?;
        self.inner
            .set_state(SessionState::DATA_SENT | SessionState::STARTED);

        let deadline = Instant::now() + self.inner.config.start_timeout;
        let mut waiter = NotificationWaiter::new(self.inner.queue.clone());
        let mask =
            NotificationKind::MemberCreated.mask() | NotificationKind::CustomData1Updated.mask();
        let wanted = SessionState::CONSOLE_JOINED | SessionState::CUSTOMDATA1_RECEIVED;
        while !self.inner.state().contains(wanted) {
            let notification = waiter
                .wait(mask, deadline, "session start notifications")
                .await?;
            match notification.kind {
                NotificationKind::MemberCreated => {
                    // Check that the joined member is the console we asked for
                    let member_duid = notification
                        .json
                        .pointer("/body/data/members/0/deviceUniqueId")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            HolepunchError::Schema(
                                "notification has no member deviceUniqueId".into(),
                            )
                        })?;
                    if parse_hex_duid(member_duid)? != console_uid {
                        return Err(HolepunchError::Unknown(
                            "session does not contain the requested console".into(),
                        ));
                    }
                    info!("console joined session");
                    self.inner.set_state(SessionState::CONSOLE_JOINED);
                }
                NotificationKind::CustomData1Updated => {
                    let encoded = notification
                        .json
                        .pointer("/body/data/customData1")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            HolepunchError::Schema("notification has no customData1".into())
                        })?;
                    if encoded.len() != 32 {
                        return Err(HolepunchError::Schema(format!(
                            "customData1 has unexpected length {}",
                            encoded.len()
                        )));
                    }
                    self.custom_data1 = decode_custom_data1(encoded)?;
                    debug!("received customData1");
                    self.inner.set_state(SessionState::CUSTOMDATA1_RECEIVED);
                }
                kind => {
                    return Err(HolepunchError::Unknown(format!(
                        "unexpected notification kind {:?}",
                        kind
                    )))
                }
            }
            self.inner.queue.clear(notification.seq);
        }
        Ok(())
    }

    /// Punch a UDP hole for the given channel and return the working socket.
    pub async fn punch_hole(&mut self, channel: Channel) -> Result<UdpSocket> {
        let state = self.inner.state();
        match channel {
            Channel::Ctrl if !state.contains(SessionState::CUSTOMDATA1_RECEIVED) => {
                return Err(HolepunchError::Uninitialized("customData1 not received yet"));
            }
            Channel::Data if !state.contains(SessionState::CTRL_ESTABLISHED) => {
                return Err(HolepunchError::Uninitialized(
                    "control channel not established yet",
                ));
            }
            _ => {}
        }

        let mut waiter = NotificationWaiter::new(self.inner.queue.clone());

        // The console opens the exchange with an OFFER carrying its
        // candidates and hashed id.
        let offer = self
            .wait_for_session_message(
                &mut waiter,
                SessionMessageAction::Offer.mask(),
                "peer OFFER session message",
            )
            .await?;
        let peer_request = offer
            .conn_request
            .as_ref()
            .ok_or_else(|| HolepunchError::Schema("peer OFFER has no connection request".into()))?;
        self.hashed_id_peer = peer_request.local_hashed_id;
        self.sid_peer = peer_request.sid as u16;
        let peer_candidates = peer_request.candidates.clone();
        self.inner.set_state(channel.offer_received());

        // Ack it right away
        self.inner
            .send_session_message(&SessionMessage {
                action: SessionMessageAction::Result,
                req_id: offer.req_id,
                error: 0,
                conn_request: None,
            })
            .await?;

        // Our counter-OFFER, then the console's ack for it
        self.send_offer(OFFER_REQ_ID).await?;
        self.inner.set_state(channel.offer_sent());
        self.wait_for_session_message_ack(&mut waiter, OFFER_REQ_ID)
            .await?;

        let identity = ProbeIdentity {
            local_hashed_id: self.hashed_id_local,
            peer_hashed_id: self.hashed_id_peer,
            sid_local: self.sid_local,
            sid_peer: self.sid_peer,
        };
        let (socket, local_port, selected) = check_candidates(
            &identity,
            &peer_candidates,
            self.inner.config.start_timeout,
        )
        .await?;
        debug!(
            "selected {} candidate {}:{} for {} channel (local port {})",
            selected.kind.as_str(),
            selected.addr,
            selected.port,
            channel.as_str(),
            local_port
        );

        self.send_accept(ACCEPT_REQ_ID, &selected).await?;
        self.inner.set_state(channel.client_accepted());

        self.wait_for_session_message(
            &mut waiter,
            SessionMessageAction::Accept.mask(),
            "peer ACCEPT session message",
        )
        .await?;
        self.inner
            .set_state(channel.console_accepted() | channel.established());
        info!("{} connection established", channel.as_str());

        Ok(socket)
    }

    /// Stop the push worker and release every resource the session holds.
    pub async fn fini(mut self) {
        self.stop_worker().await;
        if let Some(mut gateway) = self.upnp.take() {
            gateway.teardown().await;
        }
    }

    async fn stop_worker(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!("push worker panicked: {}", e);
                }
            }
        }
    }

    /// Build and send our OFFER: one LOCAL candidate for the freshly bound
    /// client socket and one STATIC candidate for the discovered external
    /// address, mapped via UPnP when a gateway answers.
    async fn send_offer(&mut self, req_id: u16) -> Result<()> {
        let client_sock = UdpSocket::bind("0.0.0.0:0").await?;
        let local_port = client_sock.local_addr()?.port();

        let mut local_addr: Option<Ipv4Addr> = None;
        let mut external_addr: Option<Ipv4Addr> = None;

        if self.inner.config.upnp {
            if self.upnp.is_none() {
                match UpnpGateway::discover(self.inner.config.upnp_discovery_timeout).await {
                    Ok(gateway) => self.upnp = Some(gateway),
                    Err(e) => debug!("no UPnP gateway: {}", e),
                }
            }
            if let Some(gateway) = self.upnp.as_mut() {
                match gateway.external_ip().await {
                    Ok(addr) => external_addr = Some(addr),
                    Err(e) => warn!("UPnP external address lookup failed: {}", e),
                }
                local_addr = discovery::local_ip_for_target(gateway.addr()).ok();
                if let Some(addr) = local_addr {
                    if let Err(e) = gateway.add_udp_mapping(addr, local_port).await {
                        warn!("UPnP port mapping failed: {}", e);
                    }
                }
            }
        }

        let local_addr = match local_addr {
            Some(addr) => addr,
            None => discovery::local_address()?,
        };
        let external_addr = match external_addr {
            Some(addr) => addr,
            None => {
                discovery::stun_external_address(&self.inner.config.stun_servers).await?
            }
        };
        let mac = discovery::default_route_mac(local_addr);

        let request = ConnectionRequest {
            sid: self.sid_local as u32,
            peer_sid: 0,
            skey: [0u8; 16],
            nat_type: 2,
            candidates: vec![
                Candidate {
                    kind: CandidateType::Local,
                    addr: local_addr.to_string(),
                    mapped_addr: "0.0.0.0".to_string(),
                    port: local_port,
                    mapped_port: 0,
                },
                Candidate {
                    kind: CandidateType::Static,
                    addr: external_addr.to_string(),
                    mapped_addr: "0.0.0.0".to_string(),
                    port: local_port,
                    mapped_port: 0,
                },
            ],
            default_route_mac_addr: mac,
            local_hashed_id: self.hashed_id_local,
        };
        log_connection_request(&request);

        self.inner
            .send_session_message(&SessionMessage {
                action: SessionMessageAction::Offer,
                req_id,
                error: 0,
                conn_request: Some(request),
            })
            .await?;
        self.client_socks.push(client_sock);
        Ok(())
    }

    async fn send_accept(&self, req_id: u16, selected: &Candidate) -> Result<()> {
        let nat_type = if selected.kind == CandidateType::Local {
            0
        } else {
            2
        };
        self.inner
            .send_session_message(&SessionMessage {
                action: SessionMessageAction::Accept,
                req_id,
                error: 0,
                conn_request: Some(ConnectionRequest {
                    sid: self.sid_local as u32,
                    peer_sid: self.sid_peer as u32,
                    skey: [0u8; 16],
                    nat_type,
                    candidates: vec![selected.clone()],
                    default_route_mac_addr: [0u8; 6],
                    local_hashed_id: [0u8; 20],
                }),
            })
            .await
    }

    /// Wait for a session message whose action matches `actions`; messages
    /// with other actions are logged and skipped.
    async fn wait_for_session_message(
        &self,
        waiter: &mut NotificationWaiter,
        actions: u8,
        what: &'static str,
    ) -> Result<SessionMessage> {
        let deadline = Instant::now() + self.inner.config.start_timeout;
        loop {
            let notification = waiter
                .wait(NotificationKind::SessionMessageCreated.mask(), deadline, what)
                .await?;
            let payload = message::payload_from_notification(&notification.json)?;
            let parsed = SessionMessage::parse(&payload)?;
            if parsed.action.mask() & actions == 0 {
                debug!("ignoring session message with action {:?}", parsed.action);
                continue;
            }
            self.inner.queue.clear(notification.seq);
            return Ok(parsed);
        }
    }

    /// Wait for the RESULT acknowledging our request id; acks for other ids
    /// are logged and skipped.
    async fn wait_for_session_message_ack(
        &self,
        waiter: &mut NotificationWaiter,
        req_id: u16,
    ) -> Result<()> {
        loop {
            let message = self
                .wait_for_session_message(
                    waiter,
                    SessionMessageAction::Result.mask(),
                    "connection offer acknowledgement",
                )
                .await?;
            if message.req_id != req_id {
                warn!("got acknowledgement for unexpected request id {}", message.req_id);
                continue;
            }
            return Ok(());
        }
    }

    async fn await_state(
        &mut self,
        bits: SessionState,
        deadline: Instant,
        what: &'static str,
    ) -> Result<()> {
        tokio::time::timeout_at(deadline, self.state_rx.wait_for(|state| state.contains(bits)))
            .await
            .map_err(|_| HolepunchError::Timeout(what))?
            .map_err(|_| HolepunchError::Unknown("state channel closed".into()))?;
        Ok(())
    }
}

fn log_connection_request(request: &ConnectionRequest) {
    debug!(
        "connection request: sid={} peerSid={} natType={} mac={} localHashedId={}",
        request.sid,
        request.peer_sid,
        request.nat_type,
        message::format_mac(&request.default_route_mac_addr),
        bytes_to_hex(&request.local_hashed_id)
    );
    for candidate in &request.candidates {
        debug!(
            "  {} candidate {}:{} (mapped {}:{})",
            candidate.kind.as_str(),
            candidate.addr,
            candidate.port,
            candidate.mapped_addr,
            candidate.mapped_port
        );
    }
}

/// Generate a client device unique id into `out`.
///
/// Writes [`DUID_PREFIX`] followed by 32 lowercase hex characters of
/// cryptographically random data and returns the written length.
pub fn generate_client_device_uid(out: &mut [u8]) -> Result<usize> {
    if out.len() < DUID_STR_SIZE {
        return Err(HolepunchError::BufferTooSmall {
            need: DUID_STR_SIZE,
            have: out.len(),
        });
    }
    let mut random = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut random)
        .map_err(|e| HolepunchError::crypto_with_source("failed to draw random bytes", e))?;
    let duid = format!("{}{}", DUID_PREFIX, bytes_to_hex(&random));
    out[..DUID_STR_SIZE].copy_from_slice(duid.as_bytes());
    Ok(DUID_STR_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bits_are_monotonic_under_insert() {
        let mut state = SessionState::INIT;
        let sequence = [
            SessionState::WS_OPEN,
            SessionState::CREATED,
            SessionState::CLIENT_JOINED,
            SessionState::DATA_SENT,
            SessionState::CONSOLE_JOINED,
            SessionState::CUSTOMDATA1_RECEIVED,
            SessionState::CTRL_OFFER_RECEIVED,
            SessionState::CTRL_ESTABLISHED,
        ];
        let mut seen = Vec::new();
        for bits in sequence {
            state.insert(bits);
            seen.push(bits);
            for earlier in &seen {
                assert!(state.contains(*earlier), "bit {} was cleared", earlier);
            }
        }
    }

    #[test]
    fn test_state_ordering_invariants_hold_on_happy_path() {
        // CTRL_ESTABLISHED implies the offer and customData1 prerequisites,
        // DATA_ESTABLISHED implies CTRL_ESTABLISHED
        let mut state = SessionState::INIT;
        state.insert(SessionState::CONSOLE_JOINED);
        state.insert(SessionState::CUSTOMDATA1_RECEIVED);
        state.insert(SessionState::CTRL_OFFER_RECEIVED);
        state.insert(SessionState::CTRL_ESTABLISHED);
        assert!(state.contains(SessionState::CTRL_OFFER_RECEIVED));
        assert!(state.contains(SessionState::CUSTOMDATA1_RECEIVED));

        state.insert(SessionState::DATA_OFFER_RECEIVED);
        state.insert(SessionState::DATA_ESTABLISHED);
        assert!(state.contains(SessionState::CTRL_ESTABLISHED));
    }

    #[test]
    fn test_state_display_lists_set_bits() {
        let state = SessionState::WS_OPEN | SessionState::CREATED;
        let rendered = state.to_string();
        assert_eq!(rendered, "[ WS_OPEN CREATED ]");
    }

    #[test]
    fn test_channel_bit_mapping() {
        assert_eq!(
            Channel::Ctrl.established(),
            SessionState::CTRL_ESTABLISHED
        );
        assert_eq!(Channel::Data.established(), SessionState::DATA_ESTABLISHED);
        assert_eq!(
            Channel::Data.offer_received(),
            SessionState::DATA_OFFER_RECEIVED
        );
        assert_ne!(Channel::Ctrl.offer_sent(), Channel::Data.offer_sent());
    }

    #[test]
    fn test_generate_client_device_uid() {
        let mut buf = [0u8; DUID_STR_SIZE];
        let written = generate_client_device_uid(&mut buf).expect("generate duid");
        assert_eq!(written, DUID_STR_SIZE);

        let duid = std::str::from_utf8(&buf).expect("duid is UTF-8");
        assert!(duid.starts_with(DUID_PREFIX));
        let suffix = &duid[DUID_PREFIX.len()..];
        assert_eq!(suffix.len(), 32);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_client_device_uid_is_random() {
        let mut first = [0u8; DUID_STR_SIZE];
        let mut second = [0u8; DUID_STR_SIZE];
        generate_client_device_uid(&mut first).expect("generate first duid");
        generate_client_device_uid(&mut second).expect("generate second duid");
        assert_ne!(first, second);
    }

    #[test]
    fn test_generate_client_device_uid_buffer_too_small() {
        let mut buf = [0u8; DUID_STR_SIZE - 1];
        let err = generate_client_device_uid(&mut buf).expect_err("buffer too small");
        match err {
            HolepunchError::BufferTooSmall { need, have } => {
                assert_eq!(need, DUID_STR_SIZE);
                assert_eq!(have, DUID_STR_SIZE - 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_phases_out_of_order_are_rejected() {
        let mut session = Session::new("test-token");

        let err = session
            .start([0u8; 32], ConsoleFamily::Ps5)
            .await
            .expect_err("start before create");
        assert!(matches!(err, HolepunchError::Uninitialized(_)));

        let err = session
            .punch_hole(Channel::Ctrl)
            .await
            .expect_err("punch before customData1");
        assert!(matches!(err, HolepunchError::Uninitialized(_)));

        let err = session
            .punch_hole(Channel::Data)
            .await
            .expect_err("data punch before ctrl");
        assert!(matches!(err, HolepunchError::Uninitialized(_)));

        session.fini().await;
    }

    #[test]
    fn test_session_init_draws_fresh_identifiers() {
        let first = Session::new("token");
        let second = Session::new("token");
        assert_ne!(first.hashed_id_local, second.hashed_id_local);
        assert_ne!(first.pushctx_id, second.pushctx_id);
        assert_eq!(first.pushctx_id.len(), 36);
    }
}
