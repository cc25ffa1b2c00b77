//! Stream-transport connection: full-duplex framed messaging over TCP.
//!
//! Receiving is a single loop with one outstanding read. Partially received
//!  frames stay in the receive buffer; completed frames are drained out of it,
//!  the remainder is compacted to the front and the buffer grows when a declared
//!  frame exceeds its capacity. Sending borrows a buffer from the process-wide
//!  pool for the duration of one socket write.
//!
//! Teardown is gated on the pending-operation counter: the connection does not
//!  recycle its resources while a send is still in flight.

use crate::config::TempestConfig;
use crate::connection::{
    Connection, ConnectionObserver, ConnectionState, DisconnectEvent, MessageEvent, PendingOps, PingTracker,
    SharedResources,
};
use crate::crypto::{AesHmacCrypto, MessageCrypto, NoCrypto};
use crate::dynamic_types::TypeRegistry;
use crate::frame::{self, HeaderOutcome};
use crate::handshake::{KeyExchange, PendingKeyExchange};
use crate::messages::{Disconnect, DisconnectReason, HandshakeAccept, HandshakeOffer, Ping, Pong};
use crate::protocol::{is_internal, Message, MessageHeader, ProtocolSet};
use anyhow::bail;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

const INITIAL_RECEIVE_BUFFER: usize = 4096;

enum HandshakeState {
    NotRequired,
    /// server side, waiting for the peer's offer
    AwaitingOffer,
    /// client side, offer sent, waiting for the accept
    AwaitingAccept(Box<dyn PendingKeyExchange>),
    Complete,
}

pub struct TcpConnection {
    connection_id: u32,
    peer_addr: SocketAddr,
    protocols: Arc<ProtocolSet>,
    types: Arc<TypeRegistry>,
    key_exchange: Arc<dyn KeyExchange>,
    config: Arc<TempestConfig>,
    shared: Arc<SharedResources>,
    observer: Arc<dyn ConnectionObserver>,

    crypto: RwLock<Arc<dyn MessageCrypto>>,
    state: Mutex<ConnectionState>,
    handshake: Mutex<HandshakeState>,
    ping: Mutex<PingTracker>,

    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending_ops: Arc<PendingOps>,

    disconnecting: AtomicBool,
    disconnected_fired: AtomicBool,
    /// signalled when the connection leaves `Handshaking` or dies
    state_changed: Notify,
    /// tells the receive loop to stop even while blocked in a read
    closing: Notify,

    receive_task: Mutex<Option<JoinHandle<()>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    /// Dial a server. Returns once the connection is fully `Connected`, i.e. after
    ///  the handshake when any registered protocol requires one.
    pub async fn connect(
        target: SocketAddr,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> anyhow::Result<Arc<TcpConnection>> {
        let stream = TcpStream::connect(target).await?;
        let requires_handshake = protocols.requires_handshake();

        let conn = Self::spin_up(
            stream, target, protocols, types, key_exchange, config, shared, observer,
            if requires_handshake { ConnectionState::Handshaking } else { ConnectionState::Connected },
        );

        if requires_handshake {
            let (offer, pending) = conn.key_exchange.start()?;
            *conn.handshake.lock().unwrap() = HandshakeState::AwaitingAccept(pending);
            conn.send(Arc::new(HandshakeOffer { public: offer })).await?;
            conn.await_connected().await?;
        }
        Ok(conn)
    }

    /// Wrap an accepted socket on the server side.
    pub fn accept(
        stream: TcpStream,
        peer_addr: SocketAddr,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<TcpConnection> {
        let requires_handshake = protocols.requires_handshake();
        let conn = Self::spin_up(
            stream, peer_addr, protocols, types, key_exchange, config, shared, observer,
            if requires_handshake { ConnectionState::Handshaking } else { ConnectionState::Connected },
        );
        if requires_handshake {
            *conn.handshake.lock().unwrap() = HandshakeState::AwaitingOffer;
        }
        conn
    }

    #[allow(clippy::too_many_arguments)]
    fn spin_up(
        stream: TcpStream,
        peer_addr: SocketAddr,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
        observer: Arc<dyn ConnectionObserver>,
        initial_state: ConnectionState,
    ) -> Arc<TcpConnection> {
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new(TcpConnection {
            connection_id: shared.next_connection_id(),
            peer_addr,
            protocols,
            types,
            key_exchange,
            config,
            shared,
            observer,
            crypto: RwLock::new(Arc::new(NoCrypto)),
            state: Mutex::new(initial_state),
            handshake: Mutex::new(HandshakeState::NotRequired),
            ping: Mutex::new(PingTracker::new()),
            write_half: tokio::sync::Mutex::new(Some(write_half)),
            pending_ops: Arc::new(PendingOps::new()),
            disconnecting: AtomicBool::new(false),
            disconnected_fired: AtomicBool::new(false),
            state_changed: Notify::new(),
            closing: Notify::new(),
            receive_task: Mutex::new(None),
            ping_task: Mutex::new(None),
        });

        let receive_conn = conn.clone();
        *conn.receive_task.lock().unwrap() =
            Some(tokio::spawn(async move { receive_conn.receive_loop(read_half).await }));

        if let Some(interval) = conn.config.ping_interval {
            let ping_conn = conn.clone();
            *conn.ping_task.lock().unwrap() = Some(tokio::spawn(async move { ping_conn.ping_loop(interval).await }));
        }

        conn
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn protocols(&self) -> &Arc<ProtocolSet> {
        &self.protocols
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

    async fn ping_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if self.state() != ConnectionState::Connected {
                continue;
            }
            self.ping.lock().unwrap().on_ping_sent();
            if self.send(Arc::new(Ping)).await.is_err() {
                return;
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; INITIAL_RECEIVE_BUFFER];
        let mut offset = 0usize;
        let mut loaded = 0usize;

        loop {
            if self.disconnecting.load(Ordering::Acquire) {
                return;
            }
            let bytes_read = tokio::select! {
                _ = self.closing.notified() => return,
                result = read_half.read(&mut buf[offset + loaded..]) => match result {
                    Ok(0) => {
                        debug!("peer {:?} closed the connection", self.peer_addr);
                        self.disconnect(true, DisconnectReason::ConnectionFailed, None).await;
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("socket error on connection to {:?}: {}", self.peer_addr, e);
                        self.disconnect(true, DisconnectReason::ConnectionFailed, None).await;
                        return;
                    }
                },
            };
            loaded += bytes_read;

            let correlation_id = Uuid::new_v4();
            let span = tracing::span!(tracing::Level::TRACE, "tcp_received", ?correlation_id);
            trace!(parent: &span, "received {} bytes from {:?}", bytes_read, self.peer_addr);

            match self.drain_frames(&buf, &mut offset, &mut loaded).instrument(span).await {
                Ok(()) => {}
                Err(reason) => {
                    self.disconnect(true, reason, None).await;
                    return;
                }
            }

            // compact the remaining partial frame to the buffer start
            if loaded == 0 {
                offset = 0;
            } else if offset > 0 {
                buf.copy_within(offset..offset + loaded, 0);
                offset = 0;
            }

            // grow when the declared next frame does not fit the current capacity
            if loaded == buf.len() {
                let declared = declared_frame_length(&buf[..loaded]);
                let new_size = declared.unwrap_or(0).max(buf.len() * 2);
                debug!("growing receive buffer from {} to {} bytes", buf.len(), new_size);
                buf.resize(new_size, 0);
            }
        }
    }

    /// Decode and dispatch every complete frame currently buffered. An error is
    ///  the disconnect reason to apply.
    async fn drain_frames(
        self: &Arc<Self>,
        buf: &[u8],
        offset: &mut usize,
        loaded: &mut usize,
    ) -> Result<(), DisconnectReason> {
        loop {
            let crypto = self.crypto.read().unwrap().clone();
            let window = &buf[*offset..*offset + *loaded];

            let header = match frame::try_get_header(window, &self.protocols, crypto.as_ref(), self.config.max_message_length)
            {
                Err(e) => {
                    warn!("malformed frame from {:?}: {}", self.peer_addr, e);
                    return Err(DisconnectReason::MalformedFrame);
                }
                Ok(HeaderOutcome::NeedMore) => return Ok(()),
                Ok(HeaderOutcome::TooLarge { declared }) => {
                    warn!(
                        "frame from {:?} declares {} bytes, exceeding the maximum of {}",
                        self.peer_addr, declared, self.config.max_message_length
                    );
                    return Err(DisconnectReason::MessageTooLarge);
                }
                Ok(HeaderOutcome::Skip { frame_length }) => {
                    debug!("skipping frame for unknown protocol or message type from {:?}", self.peer_addr);
                    *offset += frame_length;
                    *loaded -= frame_length;
                    continue;
                }
                Ok(HeaderOutcome::Ready(header)) => header,
            };

            let frame_length = header.frame_length;
            let frame_bytes = &window[..frame_length];
            match frame::decode_frame(frame_bytes, header, crypto.as_ref(), &self.types, false) {
                Ok((message, message_header)) => {
                    self.handle_message(Arc::from(message), message_header).await;
                }
                Err(frame::DecodeError::AuthenticationFailed) => {
                    warn!("message authentication failed for frame from {:?}", self.peer_addr);
                    return Err(DisconnectReason::MessageAuthenticationFailed);
                }
                Err(frame::DecodeError::Malformed(e)) => {
                    warn!("undecodable frame from {:?}: {}", self.peer_addr, e);
                    return Err(DisconnectReason::MalformedFrame);
                }
            }

            *offset += frame_length;
            *loaded -= frame_length;
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Arc<dyn Message>, header: MessageHeader) {
        if is_internal(message.as_ref()) {
            self.handle_tempest_message(message, header).await;
            return;
        }

        if self.state() != ConnectionState::Connected {
            debug!("dropping application message from {:?} received before the handshake completed", self.peer_addr);
            return;
        }
        self.observer
            .on_message(MessageEvent {
                connection_id: self.connection_id,
                peer_addr: self.peer_addr,
                message,
                header,
            })
            .await;
    }

    async fn handle_tempest_message(self: &Arc<Self>, message: Arc<dyn Message>, _header: MessageHeader) {
        if let Some(_ping) = message.as_any().downcast_ref::<Ping>() {
            let _ = self.send(Arc::new(Pong)).await;
        } else if message.as_any().downcast_ref::<Pong>().is_some() {
            self.ping.lock().unwrap().on_pong_received();
        } else if let Some(disconnect) = message.as_any().downcast_ref::<Disconnect>() {
            debug!("peer {:?} requested disconnect: {:?}", self.peer_addr, disconnect.reason);
            self.disconnect(true, disconnect.reason, disconnect.custom_reason.clone()).await;
        } else if let Some(offer) = message.as_any().downcast_ref::<HandshakeOffer>() {
            self.handle_handshake_offer(offer).await;
        } else if let Some(accept) = message.as_any().downcast_ref::<HandshakeAccept>() {
            self.handle_handshake_accept(accept).await;
        } else {
            trace!("ignoring control message {:?} on stream transport", message.message_type());
        }
    }

    async fn handle_handshake_offer(self: &Arc<Self>, offer: &HandshakeOffer) {
        let expecting = matches!(*self.handshake.lock().unwrap(), HandshakeState::AwaitingOffer);
        if !expecting {
            warn!("unexpected handshake offer from {:?}", self.peer_addr);
            return;
        }

        match self.key_exchange.respond(&offer.public) {
            Ok((accept, keys)) => {
                self.install_keys(keys);
                *self.handshake.lock().unwrap() = HandshakeState::Complete;
                if self.send(Arc::new(HandshakeAccept { public: accept })).await.is_ok() {
                    self.set_connected();
                }
            }
            Err(e) => {
                warn!("handshake with {:?} failed: {}", self.peer_addr, e);
                self.disconnect(true, DisconnectReason::HandshakeFailed, None).await;
            }
        }
    }

    async fn handle_handshake_accept(self: &Arc<Self>, accept: &HandshakeAccept) {
        let pending = match std::mem::replace(&mut *self.handshake.lock().unwrap(), HandshakeState::Complete) {
            HandshakeState::AwaitingAccept(pending) => pending,
            other => {
                *self.handshake.lock().unwrap() = other;
                warn!("unexpected handshake accept from {:?}", self.peer_addr);
                return;
            }
        };

        match pending.complete(&accept.public) {
            Ok(keys) => {
                self.install_keys(keys);
                self.set_connected();
            }
            Err(e) => {
                warn!("handshake with {:?} failed: {}", self.peer_addr, e);
                self.disconnect(true, DisconnectReason::HandshakeFailed, None).await;
            }
        }
    }

    fn install_keys(&self, keys: crate::crypto::SessionKeys) {
        *self.crypto.write().unwrap() = Arc::new(AesHmacCrypto::new(keys, self.config.signing_hash));
    }

    fn set_connected(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Handshaking || *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
        }
        drop(state);
        self.state_changed.notify_waiters();
    }

    fn is_sendable(&self, message: &dyn Message) -> bool {
        match self.state() {
            ConnectionState::Connected => true,
            // the handshake itself and the goodbye message ride through non-connected states
            ConnectionState::Connecting | ConnectionState::Handshaking | ConnectionState::Disconnecting => {
                is_internal(message)
            }
            ConnectionState::Disconnected => false,
        }
    }

    async fn disconnect_internal(&self, now: bool, reason: DisconnectReason, custom_reason: Option<String>) {
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            // a disconnect is already in flight - subsequent requests are no-ops
            return;
        }
        debug!("disconnecting from {:?}: {:?}", self.peer_addr, reason);
        *self.state.lock().unwrap() = ConnectionState::Disconnecting;
        self.state_changed.notify_waiters();

        if !now {
            // best effort: tell the peer why, then let in-flight sends drain
            let goodbye = Arc::new(Disconnect {
                reason,
                custom_reason: custom_reason.clone(),
            });
            let _ = self.send(goodbye).await;
            self.pending_ops.wait_until_at_most(0).await;
        }

        // notify_one leaves a permit behind if the receive loop is not currently
        //  parked in its select, so the wakeup cannot be lost
        self.closing.notify_one();
        {
            let mut write_half = self.write_half.lock().await;
            if let Some(half) = write_half.as_mut() {
                let _ = half.shutdown().await;
            }
            *write_half = None;
        }

        if let Some(task) = self.ping_task.lock().unwrap().take() {
            task.abort();
        }

        self.pending_ops.wait_until_at_most(0).await;

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

        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        *self.crypto.write().unwrap() = Arc::new(NoCrypto);
        self.state_changed.notify_waiters();
    }

    /// Synchronous-barrier teardown: returns only once no operation is in flight.
    pub async fn dispose(&self) {
        self.disconnect_internal(true, DisconnectReason::Requested, None).await;
        self.pending_ops.wait_until_at_most(0).await;
        let receive_task = self.receive_task.lock().unwrap().take();
        if let Some(task) = receive_task {
            task.abort();
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
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
        if !self.is_sendable(message.as_ref()) {
            bail!("connection to {:?} is not in a sendable state", self.peer_addr);
        }

        let mut buffer = self.shared.buffer_pool.acquire().await;
        let crypto = self.crypto.read().unwrap().clone();
        let frame_length = match frame::encode(message.as_ref(), None, crypto.as_ref(), &self.types, &mut buffer) {
            Ok(len) => len,
            Err(e) => {
                self.shared.buffer_pool.release(buffer);
                return Err(e);
            }
        };

        let guard = self.pending_ops.acquire();
        let write_result = {
            let mut write_half = self.write_half.lock().await;
            match write_half.as_mut() {
                Some(half) => half.write_all(buffer.as_ref()).await,
                None => {
                    self.shared.buffer_pool.release(buffer);
                    drop(guard);
                    bail!("connection to {:?} is closed", self.peer_addr);
                }
            }
        };
        self.shared.buffer_pool.release(buffer);
        drop(guard);

        if let Err(e) = write_result {
            debug!("send to {:?} failed: {}", self.peer_addr, e);
            self.disconnect_internal(true, DisconnectReason::ConnectionFailed, None).await;
            bail!("send to {:?} failed: {}", self.peer_addr, e);
        }

        if !is_internal(message.as_ref()) {
            self.observer
                .on_message_sent(MessageEvent {
                    connection_id: self.connection_id,
                    peer_addr: self.peer_addr,
                    header: MessageHeader {
                        protocol_id: message.protocol_id(),
                        message_type: message.message_type(),
                        message_length: frame_length,
                        header_length: frame::BASE_HEADER_LENGTH as u16,
                        message_id: 0,
                        is_response: false,
                    },
                    message,
                })
                .await;
        }
        Ok(())
    }

    async fn disconnect(&self, now: bool, reason: DisconnectReason, custom_reason: Option<String>) {
        self.disconnect_internal(now, reason, custom_reason).await;
    }
}

/// length declared by the (complete) base header at the start of `buf`, if enough
///  bytes are present to read it
fn declared_frame_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < frame::BASE_HEADER_LENGTH {
        return None;
    }
    let word = u32::from_le_bytes(buf[3..7].try_into().expect("length-checked slice"));
    Some((word >> 1) as usize)
}
