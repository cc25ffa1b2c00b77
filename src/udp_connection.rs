//! Datagram-transport connection: framed messaging over UDP with optional
//!  reliability per message.
//!
//! Messages flagged reliable get monotonically increasing ids from a counter
//!  separate from the unreliable one, are acknowledged by the peer, retransmitted
//!  on a timer until acknowledged, and released to the application in id order
//!  through the reliable queue. Unreliable messages are delivered as they arrive.
//!
//! Responses correlate to their request through the request's message id with the
//!  response bit set; they bypass the reliable queue and the ack machinery (their
//!  ids live in the requester's id space, see `DESIGN.md`).

use crate::config::TempestConfig;
use crate::connection::{
    Connection, ConnectionObserver, ConnectionState, DisconnectEvent, MessageEvent, PendingOps, PingTracker,
    SharedResources,
};
use crate::crypto::{AesHmacCrypto, MessageCrypto, NoCrypto};
use crate::dynamic_types::TypeRegistry;
use crate::frame::{self, HeaderOutcome, MessageId};
use crate::handshake::{KeyExchange, PendingKeyExchange};
use crate::messages::{Acknowledge, Disconnect, DisconnectReason, HandshakeAccept, HandshakeOffer, Ping, Pong};
use crate::protocol::{is_internal, is_reliable, Message, MessageHeader, ProtocolSet};
use crate::reliable_queue::ReliableQueue;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
// NB: tokio's Instant so the resend clock follows paused test time
use tokio::time::Instant;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

/// initial capacity of the per-send scratch buffer, grown as needed
const SCRATCH_CAPACITY: usize = 2048;

/// how often the connect handshake is retried before giving up
const CONNECT_ATTEMPTS: u32 = 3;

/// Sending side of a UDP socket, as a seam so the I/O can be mocked away in
///  tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

pub struct TokioDatagramSocket {
    socket: Arc<UdpSocket>,
}

impl TokioDatagramSocket {
    pub fn new(socket: Arc<UdpSocket>) -> TokioDatagramSocket {
        TokioDatagramSocket { socket }
    }
}

#[async_trait]
impl DatagramSocket for TokioDatagramSocket {
    async fn send_datagram(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        match self.socket.send_to(buf, to).await {
            Ok(_) => Ok(()),
            // a closed or unreachable peer socket is routine for UDP - swallow it
            Err(e) if matches!(e.kind(), std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotConnected) => {
                debug!("transient error sending datagram to {:?}: {}", to, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

enum UdpHandshake {
    /// server side, waiting for the peer's offer
    AwaitingOffer,
    /// client side, offer sent; `None` when no protocol requires key agreement
    AwaitingAccept(Option<Box<dyn PendingKeyExchange>>),
    /// finished; the server caches its response so a repeated offer (lost accept)
    ///  gets the identical answer back
    Complete { offer: Vec<u8>, accept: Vec<u8> },
}

struct PendingAckEntry {
    sent_at: Instant,
    message: Arc<dyn Message>,
}

pub struct UdpConnection {
    connection_id: u32,
    peer_addr: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    protocols: Arc<ProtocolSet>,
    types: Arc<TypeRegistry>,
    key_exchange: Arc<dyn KeyExchange>,
    config: Arc<TempestConfig>,
    observer: Arc<dyn ConnectionObserver>,

    crypto: RwLock<Arc<dyn MessageCrypto>>,
    state: Mutex<ConnectionState>,
    handshake: Mutex<UdpHandshake>,
    ping: Mutex<PingTracker>,

    next_reliable_message_id: AtomicU32,
    next_message_id: AtomicU32,
    pending_ack: Mutex<FxHashMap<u32, PendingAckEntry>>,
    responses: Mutex<FxHashMap<u32, oneshot::Sender<MessageEvent>>>,
    reliable_queue: Mutex<ReliableQueue<MessageEvent>>,

    pending_ops: Arc<PendingOps>,
    disconnecting: AtomicBool,
    disconnected_fired: AtomicBool,
    state_changed: Notify,

    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpConnection {
    /// Dial a peer: binds an ephemeral socket, performs the connect handshake
    ///  (with retries, datagrams get lost) and returns once `Connected`.
    pub async fn connect(
        target: SocketAddr,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> anyhow::Result<Arc<UdpConnection>> {
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        let conn = Self::spin_up(
            target,
            Arc::new(TokioDatagramSocket::new(socket.clone())),
            protocols,
            types,
            key_exchange,
            config,
            shared,
            observer,
            UdpHandshake::AwaitingAccept(None),
        );

        let receive_conn = conn.clone();
        conn.background_tasks
            .lock()
            .unwrap()
            .push(tokio::spawn(async move { receive_conn.receive_loop(socket, target).await }));

        let offer_blob = if conn.protocols.requires_handshake() {
            let (offer, pending) = conn.key_exchange.start()?;
            *conn.handshake.lock().unwrap() = UdpHandshake::AwaitingAccept(Some(pending));
            offer
        } else {
            Vec::new()
        };

        let offer = Arc::new(HandshakeOffer { public: offer_blob });
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                debug!("re-sending connect offer to {:?} (attempt {})", target, attempt + 1);
            }
            conn.send_core(offer.clone(), None, false, None).await?;

            match tokio::time::timeout(conn.config.resend_interval, conn.await_connected()).await {
                Ok(Ok(())) => return Ok(conn),
                Ok(Err(e)) => return Err(e),
                Err(_) => {} // no accept yet - retry
            }
        }

        conn.disconnect_internal(true, DisconnectReason::HandshakeFailed, None).await;
        bail!("no response from {:?} after {} connect attempts", target, CONNECT_ATTEMPTS)
    }

    /// Server-side construction for a freshly seen peer. Datagrams are fed in by
    ///  the provider owning the shared socket.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn accept(
        peer_addr: SocketAddr,
        socket: Arc<dyn DatagramSocket>,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<UdpConnection> {
        Self::spin_up(
            peer_addr, socket, protocols, types, key_exchange, config, shared, observer,
            UdpHandshake::AwaitingOffer,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spin_up(
        peer_addr: SocketAddr,
        socket: Arc<dyn DatagramSocket>,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
        observer: Arc<dyn ConnectionObserver>,
        handshake: UdpHandshake,
    ) -> Arc<UdpConnection> {
        let conn = Arc::new(UdpConnection {
            connection_id: shared.next_connection_id(),
            peer_addr,
            socket,
            protocols,
            types,
            key_exchange,
            config,
            observer,
            crypto: RwLock::new(Arc::new(NoCrypto)),
            state: Mutex::new(ConnectionState::Handshaking),
            handshake: Mutex::new(handshake),
            ping: Mutex::new(PingTracker::new()),
            next_reliable_message_id: AtomicU32::new(0),
            next_message_id: AtomicU32::new(0),
            pending_ack: Mutex::new(FxHashMap::default()),
            responses: Mutex::new(FxHashMap::default()),
            reliable_queue: Mutex::new(ReliableQueue::new()),
            pending_ops: Arc::new(PendingOps::new()),
            disconnecting: AtomicBool::new(false),
            disconnected_fired: AtomicBool::new(false),
            state_changed: Notify::new(),
            background_tasks: Mutex::new(Vec::new()),
        });

        let resend_conn = conn.clone();
        conn.background_tasks
            .lock()
            .unwrap()
            .push(tokio::spawn(async move { resend_conn.resend_loop().await }));

        if let Some(interval) = conn.config.ping_interval {
            let ping_conn = conn.clone();
            conn.background_tasks
                .lock()
                .unwrap()
                .push(tokio::spawn(async move { ping_conn.ping_loop(interval).await }));
        }

        conn
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn protocols(&self) -> &Arc<ProtocolSet> {
        &self.protocols
    }

    /// number of reliable messages awaiting acknowledgement
    pub fn num_pending_ack(&self) -> usize {
        self.pending_ack.lock().unwrap().len()
    }

    async fn await_connected(&self) -> anyhow::Result<()> {
        loop {
            let changed = self.state_changed.notified();
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                    bail!("connection closed before the handshake completed")
                }
                _ => changed.await,
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>, expected_peer: SocketAddr) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if self.disconnecting.load(Ordering::Acquire) {
                return;
            }
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if from != expected_peer {
                        debug!("dropping datagram from unexpected sender {:?}", from);
                        continue;
                    }
                    let correlation_id = Uuid::new_v4();
                    let span = tracing::span!(tracing::Level::TRACE, "datagram_received", ?correlation_id);
                    self.on_datagram(&buf[..len]).instrument(span).await;
                }
                Err(e) => {
                    debug!("error receiving datagram: {}", e);
                }
            }
        }
    }

    async fn resend_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.resend_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if self.disconnecting.load(Ordering::Acquire) {
                return;
            }
            self.resend_pending().await;
        }
    }

    async fn ping_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.disconnecting.load(Ordering::Acquire) {
                return;
            }
            if self.state() != ConnectionState::Connected {
                continue;
            }
            self.ping.lock().unwrap().on_ping_sent();
            let _ = self.send_core(Arc::new(Ping), None, false, None).await;
        }
    }

    /// retransmit every pending reliable message older than the resend interval
    pub async fn resend_pending(&self) {
        let threshold = self.config.resend_interval;
        let due: Vec<(u32, Arc<dyn Message>)> = {
            let mut pending = self.pending_ack.lock().unwrap();
            let now = Instant::now();
            pending
                .iter_mut()
                .filter(|(_, entry)| now.duration_since(entry.sent_at) >= threshold)
                .map(|(&id, entry)| {
                    entry.sent_at = now;
                    (id, entry.message.clone())
                })
                .collect()
        };

        for (message_id, message) in due {
            debug!("resending unacknowledged message #{} to {:?}", message_id, self.peer_addr);
            let _ = self.send_core(message, Some(message_id), false, None).await;
        }
    }

    /// The one send path. Assigns a message id (unless resending or responding),
    ///  registers the optional response future, encodes into a scratch buffer and
    ///  submits the datagram. Freshly sent reliable messages are recorded for
    ///  retransmission.
    async fn send_core(
        &self,
        message: Arc<dyn Message>,
        preassigned_id: Option<u32>,
        is_response: bool,
        response: Option<oneshot::Sender<MessageEvent>>,
    ) -> anyhow::Result<u32> {
        if self.state() == ConnectionState::Disconnected {
            bail!("connection to {:?} is closed", self.peer_addr);
        }

        let reliable = is_reliable(message.as_ref());
        let message_id = match preassigned_id {
            Some(id) => id,
            None => {
                let counter = if reliable {
                    &self.next_reliable_message_id
                } else {
                    &self.next_message_id
                };
                counter.fetch_add(1, Ordering::AcqRel) + 1
            }
        };

        let registered_response = response.is_some();
        if let Some(tx) = response {
            self.responses.lock().unwrap().insert(message_id, tx);
        }

        let mut scratch = crate::buffers::wire::WireWriter::with_capacity(SCRATCH_CAPACITY);
        let crypto = self.crypto.read().unwrap().clone();
        let encode_result = frame::encode(
            message.as_ref(),
            Some(MessageId { id: message_id, is_response }),
            crypto.as_ref(),
            &self.types,
            &mut scratch,
        );
        if let Err(e) = encode_result {
            if registered_response {
                self.responses.lock().unwrap().remove(&message_id);
            }
            return Err(e);
        }

        let guard = self.pending_ops.acquire();
        let send_result = self.socket.send_datagram(scratch.as_ref(), self.peer_addr).await;
        drop(guard);
        if let Err(e) = send_result {
            if registered_response {
                self.responses.lock().unwrap().remove(&message_id);
            }
            bail!("send to {:?} failed: {}", self.peer_addr, e);
        }
        trace!("sent message #{} ({} bytes) to {:?}", message_id, scratch.len(), self.peer_addr);

        if reliable && !is_response && !is_internal(message.as_ref()) && preassigned_id.is_none() {
            self.pending_ack.lock().unwrap().insert(
                message_id,
                PendingAckEntry {
                    sent_at: Instant::now(),
                    message: message.clone(),
                },
            );
        }

        if !is_internal(message.as_ref()) {
            self.observer
                .on_message_sent(MessageEvent {
                    connection_id: self.connection_id,
                    peer_addr: self.peer_addr,
                    header: MessageHeader {
                        protocol_id: message.protocol_id(),
                        message_type: message.message_type(),
                        message_length: scratch.len() as u32,
                        header_length: frame::BASE_HEADER_LENGTH as u16,
                        message_id,
                        is_response,
                    },
                    message,
                })
                .await;
        }

        Ok(message_id)
    }

    /// Send a message that answers `request`: it carries the request's message id
    ///  with the response bit set, completing the requester's `send_for` future.
    pub async fn send_response(&self, request: &MessageHeader, message: Arc<dyn Message>) -> anyhow::Result<()> {
        if request.message_id == 0 {
            bail!("cannot respond to a message without an id");
        }
        self.send_core(message, Some(request.message_id), true, None).await.map(|_| ())
    }

    /// Send a reliable message and wait for the peer's typed response.
    pub async fn send_for<T: Message>(&self, message: Arc<dyn Message>, timeout: Duration) -> anyhow::Result<Arc<T>> {
        if !is_reliable(message.as_ref()) {
            bail!("send_for requires a message flagged reliable");
        }

        let (tx, rx) = oneshot::channel();
        let message_id = self.send_core(message, None, false, Some(tx)).await?;

        let event = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| anyhow!("timed out waiting for a response to message #{}", message_id))?
            .map_err(|_| anyhow!("connection closed before a response to message #{} arrived", message_id))?;

        event
            .message
            .into_any()
            .downcast::<T>()
            .map_err(|_| anyhow!("response to message #{} has an unexpected type", message_id))
    }

    /// Process one received datagram. Called by the client receive loop or, on the
    ///  server, by the provider demultiplexing the shared socket.
    pub(crate) async fn on_datagram(&self, data: &[u8]) {
        let crypto = self.crypto.read().unwrap().clone();

        let header = match frame::try_get_header(data, &self.protocols, crypto.as_ref(), self.config.max_message_length) {
            Err(e) => {
                debug!("undecodable datagram from {:?} - dropping: {}", self.peer_addr, e);
                return;
            }
            Ok(HeaderOutcome::NeedMore) => {
                debug!("truncated datagram from {:?} - dropping", self.peer_addr);
                return;
            }
            Ok(HeaderOutcome::TooLarge { declared }) => {
                warn!("datagram from {:?} declares {} bytes - disconnecting", self.peer_addr, declared);
                self.disconnect_internal(true, DisconnectReason::MessageTooLarge, None).await;
                return;
            }
            Ok(HeaderOutcome::Skip { .. }) => {
                debug!("dropping datagram for unknown protocol or message type from {:?}", self.peer_addr);
                return;
            }
            Ok(HeaderOutcome::Ready(header)) => header,
        };

        let frame_bytes = &data[..header.frame_length];
        let (message, message_header) = match frame::decode_frame(frame_bytes, header, crypto.as_ref(), &self.types, true)
        {
            Ok(decoded) => decoded,
            Err(frame::DecodeError::AuthenticationFailed) => {
                warn!("message authentication failed for datagram from {:?}", self.peer_addr);
                self.disconnect_internal(true, DisconnectReason::MessageAuthenticationFailed, None).await;
                return;
            }
            Err(frame::DecodeError::Malformed(e)) => {
                debug!("undecodable datagram payload from {:?} - dropping: {}", self.peer_addr, e);
                return;
            }
        };

        let message: Arc<dyn Message> = Arc::from(message);
        let event = MessageEvent {
            connection_id: self.connection_id,
            peer_addr: self.peer_addr,
            message: message.clone(),
            header: message_header.clone(),
        };

        // responses live in the requester's id space and bypass ack and ordering
        let queue_eligible =
            message_header.message_id != 0 && is_reliable(message.as_ref()) && !message_header.is_response;
        if queue_eligible {
            let internal = is_internal(message.as_ref());
            if !internal {
                self.send_ack(message_header.message_id).await;
            }

            let deliverable = self
                .reliable_queue
                .lock()
                .unwrap()
                .enqueue(message_header.message_id, event);
            for deliverable_event in deliverable {
                self.route(deliverable_event).await;
            }

            // for control messages the queue observes the id before the ack goes out
            if internal {
                self.send_ack(message_header.message_id).await;
            }
        } else {
            self.route(event).await;
        }
    }

    async fn send_ack(&self, message_id: u32) {
        let _ = self.send_core(Arc::new(Acknowledge { message_id }), None, false, None).await;
    }

    async fn route(&self, event: MessageEvent) {
        if is_internal(event.message.as_ref()) {
            self.on_tempest_message(event).await;
            return;
        }

        if event.header.is_response {
            let tx = self.responses.lock().unwrap().remove(&event.header.message_id);
            if let Some(tx) = tx {
                let _ = tx.send(event.clone());
            }
        }
        self.observer.on_message(event).await;
    }

    async fn on_tempest_message(&self, event: MessageEvent) {
        let message = event.message;
        if let Some(ack) = message.as_any().downcast_ref::<Acknowledge>() {
            trace!("message #{} acknowledged by {:?}", ack.message_id, self.peer_addr);
            self.pending_ack.lock().unwrap().remove(&ack.message_id);
        } else if let Some(disconnect) = message.as_any().downcast_ref::<Disconnect>() {
            debug!("peer {:?} requested disconnect: {:?}", self.peer_addr, disconnect.reason);
            self.disconnect_internal(true, disconnect.reason, disconnect.custom_reason.clone()).await;
        } else if message.as_any().downcast_ref::<Ping>().is_some() {
            let _ = self.send_core(Arc::new(Pong), None, false, None).await;
        } else if message.as_any().downcast_ref::<Pong>().is_some() {
            self.ping.lock().unwrap().on_pong_received();
        } else if let Some(offer) = message.as_any().downcast_ref::<HandshakeOffer>() {
            self.handle_handshake_offer(offer).await;
        } else if let Some(accept) = message.as_any().downcast_ref::<HandshakeAccept>() {
            self.handle_handshake_accept(accept).await;
        }
    }

    async fn handle_handshake_offer(&self, offer: &HandshakeOffer) {
        enum Action {
            Respond,
            Repeat(Vec<u8>),
            Ignore,
        }

        let action = {
            let handshake = self.handshake.lock().unwrap();
            match &*handshake {
                UdpHandshake::AwaitingOffer => Action::Respond,
                UdpHandshake::Complete { offer: seen, accept } if *seen == offer.public => {
                    // the peer re-offered, so our accept got lost - repeat it verbatim
                    Action::Repeat(accept.clone())
                }
                _ => Action::Ignore,
            }
        };

        match action {
            Action::Respond => {
                let response = if self.protocols.requires_handshake() {
                    match self.key_exchange.respond(&offer.public) {
                        Ok((accept, keys)) => {
                            self.install_keys(keys);
                            accept
                        }
                        Err(e) => {
                            warn!("handshake with {:?} failed: {}", self.peer_addr, e);
                            self.disconnect_internal(true, DisconnectReason::HandshakeFailed, None).await;
                            return;
                        }
                    }
                } else {
                    Vec::new()
                };

                *self.handshake.lock().unwrap() = UdpHandshake::Complete {
                    offer: offer.public.clone(),
                    accept: response.clone(),
                };
                let _ = self
                    .send_core(Arc::new(HandshakeAccept { public: response }), None, false, None)
                    .await;
                self.set_connected();
            }
            Action::Repeat(accept) => {
                debug!("repeating handshake accept for {:?}", self.peer_addr);
                let _ = self
                    .send_core(Arc::new(HandshakeAccept { public: accept }), None, false, None)
                    .await;
            }
            Action::Ignore => {
                debug!("ignoring unexpected handshake offer from {:?}", self.peer_addr);
            }
        }
    }

    async fn handle_handshake_accept(&self, accept: &HandshakeAccept) {
        let pending = {
            let mut handshake = self.handshake.lock().unwrap();
            match std::mem::replace(
                &mut *handshake,
                UdpHandshake::Complete { offer: Vec::new(), accept: Vec::new() },
            ) {
                UdpHandshake::AwaitingAccept(pending) => pending,
                other => {
                    // duplicate accept after completion is routine with datagrams
                    *handshake = other;
                    return;
                }
            }
        };

        if let Some(pending) = pending {
            match pending.complete(&accept.public) {
                Ok(keys) => self.install_keys(keys),
                Err(e) => {
                    warn!("handshake with {:?} failed: {}", self.peer_addr, e);
                    self.disconnect_internal(true, DisconnectReason::HandshakeFailed, None).await;
                    return;
                }
            }
        }
        self.set_connected();
    }

    fn install_keys(&self, keys: crate::crypto::SessionKeys) {
        *self.crypto.write().unwrap() = Arc::new(AesHmacCrypto::new(keys, self.config.signing_hash));
    }

    fn set_connected(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Connecting || *state == ConnectionState::Handshaking {
            *state = ConnectionState::Connected;
        }
        drop(state);
        self.state_changed.notify_waiters();
    }

    async fn disconnect_internal(&self, now: bool, reason: DisconnectReason, custom_reason: Option<String>) {
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("disconnecting from {:?}: {:?}", self.peer_addr, reason);
        *self.state.lock().unwrap() = ConnectionState::Disconnecting;
        self.state_changed.notify_waiters();

        if !now {
            let goodbye = Arc::new(Disconnect {
                reason,
                custom_reason: custom_reason.clone(),
            });
            let _ = self.send_core(goodbye, None, false, None).await;
            self.pending_ops.wait_until_at_most(0).await;
        }

        // cleanup: cancel response futures, drop buffered and pending messages
        self.responses.lock().unwrap().clear();
        self.reliable_queue.lock().unwrap().clear();
        self.pending_ack.lock().unwrap().clear();

        if !self.disconnected_fired.swap(true, Ordering::AcqRel) {
            self.observer
                .on_disconnected(DisconnectEvent {
                    connection_id: self.connection_id,
                    peer_addr: self.peer_addr,
                    reason,
                    custom_reason,
                })
                .await;
        }

        self.pending_ops.wait_until_at_most(0).await;
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        *self.crypto.write().unwrap() = Arc::new(NoCrypto);
        self.state_changed.notify_waiters();

        // stop the background loops. This must stay the last step: when a loop
        //  itself triggered the disconnect, the abort takes effect at its next
        //  await point, after all cleanup above already ran
        for task in self.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Synchronous-barrier teardown: returns only once no operation is in flight.
    pub async fn dispose(&self) {
        self.disconnect_internal(true, DisconnectReason::Requested, None).await;
        self.pending_ops.wait_until_at_most(0).await;
    }
}

#[async_trait]
impl Connection for UdpConnection {
    fn connection_id(&self) -> u32 {
        self.connection_id
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn remote_target(&self) -> SocketAddr {
        self.peer_addr
    }

    fn response_time(&self) -> Option<Duration> {
        self.ping.lock().unwrap().response_time()
    }

    async fn send(&self, message: Arc<dyn Message>) -> anyhow::Result<()> {
        self.send_core(message, None, false, None).await.map(|_| ())
    }

    async fn disconnect(&self, now: bool, reason: DisconnectReason, custom_reason: Option<String>) {
        self.disconnect_internal(now, reason, custom_reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MessageId;
    use crate::test_util::*;
    use mockall::predicate::always;

    /// frames as the remote peer would put them on the wire
    fn peer_frame(message: &dyn Message, id: u32, is_response: bool) -> Vec<u8> {
        let mut w = crate::buffers::wire::WireWriter::new();
        frame::encode(message, Some(MessageId { id, is_response }), &NoCrypto, &test_type_registry(), &mut w).unwrap();
        w.as_ref().to_vec()
    }

    struct Harness {
        conn: Arc<UdpConnection>,
        observer: Arc<RecordingObserver>,
        outbound: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    /// a connection with a mock socket capturing everything it sends
    fn harness() -> Harness {
        let outbound: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut socket = MockDatagramSocket::new();
        let captured = outbound.clone();
        socket
            .expect_send_datagram()
            .with(always(), always())
            .returning(move |buf, _| {
                captured.lock().unwrap().push(buf.to_vec());
                Ok(())
            });
        socket.expect_local_addr().returning(|| None);

        let config = Arc::new(TempestConfig::default());
        let shared = SharedResources::new(&config);
        let mut protocols = ProtocolSet::new();
        protocols.register(Arc::new(TestProtocol)).unwrap();
        let observer = RecordingObserver::new();

        let conn = UdpConnection::accept(
            "127.0.0.1:9999".parse().unwrap(),
            Arc::new(socket),
            Arc::new(protocols),
            test_type_registry(),
            Arc::new(crate::handshake::X25519KeyExchange),
            config,
            shared,
            observer.clone(),
        );

        Harness { conn, observer, outbound }
    }

    fn decode_outbound(harness: &Harness) -> Vec<(u16, u32, bool)> {
        let protocols = {
            let mut p = ProtocolSet::new();
            p.register(Arc::new(TestProtocol)).unwrap();
            p
        };
        harness
            .outbound
            .lock()
            .unwrap()
            .iter()
            .map(|datagram| {
                let header = match frame::try_get_header(datagram, &protocols, &NoCrypto, 1024 * 1024).unwrap() {
                    HeaderOutcome::Ready(header) => header,
                    _ => panic!("captured datagram does not parse"),
                };
                let (message, message_header) =
                    frame::decode_frame(datagram, header, &NoCrypto, &test_type_registry(), true).unwrap();
                (message.message_type(), message_header.message_id, message_header.is_response)
            })
            .collect()
    }

    fn delivered_texts(observer: &RecordingObserver) -> Vec<String> {
        observer
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.message.as_any().downcast_ref::<EchoMessage>().map(|m| m.text.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_out_of_order_reliable_messages_are_delivered_in_id_order() {
        let h = harness();

        for id in [3u32, 1, 5, 2, 4] {
            let frame_bytes = peer_frame(&EchoMessage::new(&format!("m{}", id)), id, false);
            h.conn.on_datagram(&frame_bytes).await;
        }

        assert_eq!(delivered_texts(&h.observer), vec!["m1", "m2", "m3", "m4", "m5"]);

        // every reliable message got acknowledged
        let ack_count = decode_outbound(&h)
            .iter()
            .filter(|(t, _, _)| *t == crate::messages::MSG_TYPE_ACKNOWLEDGE)
            .count();
        assert_eq!(ack_count, 5);
    }

    #[tokio::test]
    async fn test_duplicate_reliable_message_is_dropped_but_acknowledged() {
        let h = harness();

        let frame_bytes = peer_frame(&EchoMessage::new("only once"), 1, false);
        h.conn.on_datagram(&frame_bytes).await;
        h.conn.on_datagram(&frame_bytes).await;

        assert_eq!(delivered_texts(&h.observer), vec!["only once"]);

        let ack_count = decode_outbound(&h)
            .iter()
            .filter(|(t, _, _)| *t == crate::messages::MSG_TYPE_ACKNOWLEDGE)
            .count();
        assert_eq!(ack_count, 2);
    }

    #[tokio::test]
    async fn test_unreliable_messages_are_delivered_as_they_arrive() {
        let h = harness();

        for id in [7u32, 3, 5] {
            let frame_bytes = peer_frame(&UnreliableMessage { n: id }, id, false);
            h.conn.on_datagram(&frame_bytes).await;
        }

        let delivered: Vec<u32> = h
            .observer
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.as_any().downcast_ref::<UnreliableMessage>().unwrap().n)
            .collect();
        assert_eq!(delivered, vec![7, 3, 5]);

        // nothing was acknowledged
        assert!(decode_outbound(&h)
            .iter()
            .all(|(t, _, _)| *t != crate::messages::MSG_TYPE_ACKNOWLEDGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_is_resent_and_ack_stops_resends() {
        let h = harness();

        h.conn.send(Arc::new(EchoMessage::new("resend me"))).await.unwrap();
        assert_eq!(h.outbound.lock().unwrap().len(), 1);
        assert_eq!(h.conn.num_pending_ack(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let after_one_interval = h.outbound.lock().unwrap().len();
        assert!(after_one_interval >= 2, "message was not resent");

        // the resent frame is byte-identical: same message id, same payload
        {
            let outbound = h.outbound.lock().unwrap();
            assert_eq!(outbound[0], outbound[1]);
        }

        // the peer acknowledges - the entry drains and resends stop
        let ack = peer_frame(&Acknowledge { message_id: 1 }, 900, false);
        h.conn.on_datagram(&ack).await;
        assert_eq!(h.conn.num_pending_ack(), 0);

        let before = h.outbound.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.outbound.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_send_for_completes_on_matching_response() {
        let h = harness();

        let conn = h.conn.clone();
        let pending = tokio::spawn(async move {
            conn.send_for::<EchoMessage>(Arc::new(EchoMessage::new("question")), Duration::from_secs(2)).await
        });

        // wait until the request went out, then feed the response with the
        //  request's id and the response bit set
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = decode_outbound(&h);
        let (_, request_id, _) = sent[0];
        assert_eq!(request_id, 1);

        let response = peer_frame(&EchoMessage::new("answer"), request_id, true);
        h.conn.on_datagram(&response).await;

        let answer = pending.await.unwrap().unwrap();
        assert_eq!(answer.text, "answer");
    }

    #[tokio::test]
    async fn test_send_for_rejects_unreliable_messages() {
        let h = harness();
        let result = h
            .conn
            .send_for::<EchoMessage>(Arc::new(UnreliableMessage { n: 1 }), Duration::from_millis(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_for_times_out_without_response() {
        let h = harness();
        let result = h
            .conn
            .send_for::<EchoMessage>(Arc::new(EchoMessage::new("void")), Duration::from_millis(50))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reliable_and_unreliable_ids_are_separate_counters() {
        let h = harness();

        h.conn.send(Arc::new(EchoMessage::new("r1"))).await.unwrap();
        h.conn.send(Arc::new(UnreliableMessage { n: 1 })).await.unwrap();
        h.conn.send(Arc::new(EchoMessage::new("r2"))).await.unwrap();

        let sent = decode_outbound(&h);
        assert_eq!(sent[0], (1, 1, false)); // first reliable id
        assert_eq!(sent[1], (4, 1, false)); // first unreliable id, own counter
        assert_eq!(sent[2], (1, 2, false)); // second reliable id
    }

    #[tokio::test]
    async fn test_peer_disconnect_message_closes_the_connection() {
        let h = harness();

        let goodbye = peer_frame(
            &Disconnect {
                reason: DisconnectReason::Custom,
                custom_reason: Some("bye".to_owned()),
            },
            1,
            false,
        );
        h.conn.on_datagram(&goodbye).await;

        h.observer.wait_for_disconnect().await;
        let disconnects = h.observer.disconnects.lock().unwrap();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].reason, DisconnectReason::Custom);
        assert_eq!(disconnects[0].custom_reason.as_deref(), Some("bye"));
        drop(disconnects);

        assert!(!h.conn.is_connected());
        assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_cleanup_cancels_response_futures() {
        let h = harness();

        let conn = h.conn.clone();
        let pending = tokio::spawn(async move {
            conn.send_for::<EchoMessage>(Arc::new(EchoMessage::new("q")), Duration::from_secs(30)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.conn.dispose().await;
        let result = pending.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handshake_offer_installs_keys_and_connects() {
        let h = harness();
        assert_eq!(h.conn.state(), ConnectionState::Handshaking);

        let offer = peer_frame(&HandshakeOffer { public: Vec::new() }, 1, false);
        h.conn.on_datagram(&offer).await;

        assert!(h.conn.is_connected());
        let sent = decode_outbound(&h);
        assert!(sent.iter().any(|(t, _, _)| *t == crate::messages::MSG_TYPE_HANDSHAKE_ACCEPT));
    }

    #[tokio::test]
    async fn test_repeated_offer_repeats_the_accept() {
        let h = harness();

        let offer = peer_frame(&HandshakeOffer { public: Vec::new() }, 1, false);
        h.conn.on_datagram(&offer).await;
        h.conn.on_datagram(&offer).await;

        let accepts = decode_outbound(&h)
            .iter()
            .filter(|(t, _, _)| *t == crate::messages::MSG_TYPE_HANDSHAKE_ACCEPT)
            .count();
        assert_eq!(accepts, 2);
    }
}
