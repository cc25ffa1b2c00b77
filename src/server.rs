//! Server side: connection providers feeding a shared handler, with two
//!  delivery disciplines.
//!
//! `ConnectionOrder` invokes the handler directly on each connection's receive
//!  path: strict per-connection ordering, no guarantee across connections.
//!  `GlobalOrder` funnels every event through one FIFO drained by a single
//!  worker: a total order across all connections, handlers never run
//!  concurrently.

use crate::config::TempestConfig;
use crate::connection::{Connection, ConnectionObserver, DisconnectEvent, MessageEvent, SharedResources};
use crate::dynamic_types::TypeRegistry;
use crate::frame::{self, HeaderOutcome};
use crate::handshake::KeyExchange;
use crate::messages::{DisconnectReason, HandshakeOffer};
use crate::protocol::{is_internal, ProtocolSet};
use crate::tcp_connection::TcpConnection;
use crate::udp_connection::{DatagramSocket, TokioDatagramSocket, UdpConnection};
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// handlers run on each connection's own receive path
    ConnectionOrder,
    /// handlers run sequentially on one worker, in global enqueue order
    GlobalOrder,
}

/// The application's server-side surface.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    async fn connection_made(&self, connection: Arc<dyn Connection>);

    async fn message_received(&self, event: MessageEvent);

    /// a valid application frame from a peer without an established connection
    async fn connectionless_message_received(&self, event: MessageEvent);

    async fn disconnected(&self, event: DisconnectEvent);
}

pub enum ServerEvent {
    ConnectionMade(Arc<dyn Connection>),
    MessageReceived(MessageEvent),
    ConnectionlessMessageReceived(MessageEvent),
    Disconnected(DisconnectEvent),
}

/// Where a provider delivers its events: straight into the handler
///  (ConnectionOrder) or into the server's shared FIFO (GlobalOrder).
pub struct ServerEventSink {
    mode: ExecutionMode,
    handler: Arc<dyn ServerHandler>,
    queue: Option<mpsc::UnboundedSender<ServerEvent>>,
}

impl ServerEventSink {
    fn new(
        mode: ExecutionMode,
        handler: Arc<dyn ServerHandler>,
        queue: Option<mpsc::UnboundedSender<ServerEvent>>,
    ) -> Arc<ServerEventSink> {
        Arc::new(ServerEventSink { mode, handler, queue })
    }

    pub(crate) async fn dispatch(&self, event: ServerEvent) {
        match (self.mode, &self.queue) {
            (ExecutionMode::GlobalOrder, Some(queue)) => {
                let _ = queue.send(event);
            }
            _ => dispatch_to_handler(self.handler.as_ref(), event).await,
        }
    }
}

async fn dispatch_to_handler(handler: &dyn ServerHandler, event: ServerEvent) {
    match event {
        ServerEvent::ConnectionMade(connection) => handler.connection_made(connection).await,
        ServerEvent::MessageReceived(event) => handler.message_received(event).await,
        ServerEvent::ConnectionlessMessageReceived(event) => handler.connectionless_message_received(event).await,
        ServerEvent::Disconnected(event) => handler.disconnected(event).await,
    }
}

/// Adapts a connection's observer callbacks onto a provider's event sink.
struct SinkObserver {
    sink: Arc<ServerEventSink>,
}

#[async_trait]
impl ConnectionObserver for SinkObserver {
    async fn on_message(&self, event: MessageEvent) {
        self.sink.dispatch(ServerEvent::MessageReceived(event)).await;
    }

    async fn on_message_sent(&self, _event: MessageEvent) {}

    async fn on_disconnected(&self, event: DisconnectEvent) {
        self.sink.dispatch(ServerEvent::Disconnected(event)).await;
    }
}

#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    fn execution_mode(&self) -> ExecutionMode;

    async fn start(&self, sink: Arc<ServerEventSink>) -> anyhow::Result<()>;

    async fn stop(&self);
}

pub struct TcpConnectionProvider {
    bind_addr: SocketAddr,
    mode: ExecutionMode,
    protocols: Arc<ProtocolSet>,
    types: Arc<TypeRegistry>,
    key_exchange: Arc<dyn KeyExchange>,
    config: Arc<TempestConfig>,
    shared: Arc<SharedResources>,

    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<Vec<Arc<TcpConnection>>>>,
}

impl TcpConnectionProvider {
    pub fn new(
        bind_addr: SocketAddr,
        mode: ExecutionMode,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
    ) -> TcpConnectionProvider {
        TcpConnectionProvider {
            bind_addr,
            mode,
            protocols,
            types,
            key_exchange,
            config,
            shared,
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// the actually bound address, available once started (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }
}

#[async_trait]
impl ConnectionProvider for TcpConnectionProvider {
    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn start(&self, sink: Arc<ServerEventSink>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        *self.local_addr.lock().unwrap() = Some(listener.local_addr()?);
        info!("listening for stream connections on {:?}", listener.local_addr()?);

        let protocols = self.protocols.clone();
        let types = self.types.clone();
        let key_exchange = self.key_exchange.clone();
        let config = self.config.clone();
        let shared = self.shared.clone();
        let connections = self.connections.clone();

        *self.accept_task.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("accepted stream connection from {:?}", peer_addr);
                        let observer = Arc::new(SinkObserver { sink: sink.clone() });
                        let conn = TcpConnection::accept(
                            stream,
                            peer_addr,
                            protocols.clone(),
                            types.clone(),
                            key_exchange.clone(),
                            config.clone(),
                            shared.clone(),
                            observer,
                        );
                        connections.lock().unwrap().push(conn.clone());
                        sink.dispatch(ServerEvent::ConnectionMade(conn)).await;
                    }
                    Err(e) => {
                        warn!("error accepting connection: {}", e);
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let connections: Vec<_> = self.connections.lock().unwrap().drain(..).collect();
        for connection in connections {
            connection.dispose().await;
        }
    }
}

/// Observer for server-side datagram peers: forwards into the sink and removes
///  the peer from the demux map when its connection dies.
struct UdpPeerObserver {
    peers: Arc<Mutex<FxHashMap<SocketAddr, Arc<UdpConnection>>>>,
    peer_addr: SocketAddr,
    sink: Arc<ServerEventSink>,
}

#[async_trait]
impl ConnectionObserver for UdpPeerObserver {
    async fn on_message(&self, event: MessageEvent) {
        self.sink.dispatch(ServerEvent::MessageReceived(event)).await;
    }

    async fn on_message_sent(&self, _event: MessageEvent) {}

    async fn on_disconnected(&self, event: DisconnectEvent) {
        self.peers.lock().unwrap().remove(&self.peer_addr);
        self.sink.dispatch(ServerEvent::Disconnected(event)).await;
    }
}

pub struct UdpConnectionProvider {
    bind_addr: SocketAddr,
    mode: ExecutionMode,
    protocols: Arc<ProtocolSet>,
    types: Arc<TypeRegistry>,
    key_exchange: Arc<dyn KeyExchange>,
    config: Arc<TempestConfig>,
    shared: Arc<SharedResources>,

    local_addr: Mutex<Option<SocketAddr>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    peers: Arc<Mutex<FxHashMap<SocketAddr, Arc<UdpConnection>>>>,
}

impl UdpConnectionProvider {
    pub fn new(
        bind_addr: SocketAddr,
        mode: ExecutionMode,
        protocols: Arc<ProtocolSet>,
        types: Arc<TypeRegistry>,
        key_exchange: Arc<dyn KeyExchange>,
        config: Arc<TempestConfig>,
        shared: Arc<SharedResources>,
    ) -> UdpConnectionProvider {
        UdpConnectionProvider {
            bind_addr,
            mode,
            protocols,
            types,
            key_exchange,
            config,
            shared,
            local_addr: Mutex::new(None),
            receive_task: Mutex::new(None),
            peers: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

enum FirstContact {
    /// a connect offer: create a connection for the peer
    Offer,
    /// a valid application frame outside any connection
    Connectionless(MessageEvent),
    /// anything else from an unknown peer is dropped
    Drop,
}

/// Classify the first datagram from an unknown peer. Runs without session keys,
///  so anything encrypted or authenticated from a stranger is dropped.
fn classify_first_contact(
    data: &[u8],
    from: SocketAddr,
    protocols: &ProtocolSet,
    types: &Arc<TypeRegistry>,
    max_message_length: usize,
) -> FirstContact {
    let header = match frame::try_get_header(data, protocols, &crate::crypto::NoCrypto, max_message_length) {
        Ok(HeaderOutcome::Ready(header)) => header,
        _ => return FirstContact::Drop,
    };
    let frame_length = header.frame_length;
    let (message, message_header) =
        match frame::decode_frame(&data[..frame_length], header, &crate::crypto::NoCrypto, types, true) {
            Ok(decoded) => decoded,
            Err(_) => return FirstContact::Drop,
        };

    if message.as_any().downcast_ref::<HandshakeOffer>().is_some() {
        return FirstContact::Offer;
    }
    if is_internal(message.as_ref()) {
        return FirstContact::Drop;
    }
    FirstContact::Connectionless(MessageEvent {
        connection_id: 0,
        peer_addr: from,
        message: Arc::from(message),
        header: message_header,
    })
}

#[async_trait]
impl ConnectionProvider for UdpConnectionProvider {
    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn start(&self, sink: Arc<ServerEventSink>) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.bind_addr).await?);
        *self.local_addr.lock().unwrap() = Some(socket.local_addr()?);
        info!("listening for datagrams on {:?}", socket.local_addr()?);

        let datagram_socket: Arc<dyn DatagramSocket> = Arc::new(TokioDatagramSocket::new(socket.clone()));
        let protocols = self.protocols.clone();
        let types = self.types.clone();
        let key_exchange = self.key_exchange.clone();
        let config = self.config.clone();
        let shared = self.shared.clone();
        let peers = self.peers.clone();

        *self.receive_task.lock().unwrap() = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("error receiving datagram: {}", e);
                        continue;
                    }
                };
                let data = &buf[..len];

                let correlation_id = Uuid::new_v4();
                let span = tracing::span!(tracing::Level::TRACE, "datagram_received", ?correlation_id);

                let existing = peers.lock().unwrap().get(&from).cloned();
                if let Some(conn) = existing {
                    conn.on_datagram(data).instrument(span).await;
                    continue;
                }

                match classify_first_contact(data, from, &protocols, &types, config.max_message_length) {
                    FirstContact::Offer => {
                        debug!("new datagram peer {:?}", from);
                        let observer = Arc::new(UdpPeerObserver {
                            peers: peers.clone(),
                            peer_addr: from,
                            sink: sink.clone(),
                        });
                        let conn = UdpConnection::accept(
                            from,
                            datagram_socket.clone(),
                            protocols.clone(),
                            types.clone(),
                            key_exchange.clone(),
                            config.clone(),
                            shared.clone(),
                            observer,
                        );
                        peers.lock().unwrap().insert(from, conn.clone());
                        sink.dispatch(ServerEvent::ConnectionMade(conn.clone())).await;
                        conn.on_datagram(data).instrument(span).await;
                    }
                    FirstContact::Connectionless(event) => {
                        sink.dispatch(ServerEvent::ConnectionlessMessageReceived(event)).await;
                    }
                    FirstContact::Drop => {
                        debug!("dropping datagram from unknown peer {:?}", from);
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.receive_task.lock().unwrap().take() {
            task.abort();
        }
        let peers: Vec<_> = self.peers.lock().unwrap().drain().map(|(_, conn)| conn).collect();
        for connection in peers {
            connection.dispose().await;
        }
    }
}

pub struct TempestServer {
    handler: Arc<dyn ServerHandler>,
    providers: Mutex<Vec<Arc<dyn ConnectionProvider>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_shutdown: Arc<Notify>,
    started: AtomicBool,
}

impl TempestServer {
    pub fn new(handler: Arc<dyn ServerHandler>) -> TempestServer {
        TempestServer {
            handler,
            providers: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            worker_shutdown: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn add_provider(&self, provider: Arc<dyn ConnectionProvider>) {
        self.providers.lock().unwrap().push(provider);
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("server is already started");
        }
        let providers: Vec<_> = self.providers.lock().unwrap().clone();

        let needs_worker = providers.iter().any(|p| p.execution_mode() == ExecutionMode::GlobalOrder);
        let queue = if needs_worker {
            let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
            let handler = self.handler.clone();
            let shutdown = self.worker_shutdown.clone();
            *self.worker.lock().unwrap() = Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => return,
                        event = rx.recv() => match event {
                            Some(event) => dispatch_to_handler(handler.as_ref(), event).await,
                            None => return,
                        },
                    }
                }
            }));
            Some(tx)
        } else {
            None
        };

        for provider in &providers {
            let provider_queue = match provider.execution_mode() {
                ExecutionMode::GlobalOrder => queue.clone(),
                ExecutionMode::ConnectionOrder => None,
            };
            let sink = ServerEventSink::new(provider.execution_mode(), self.handler.clone(), provider_queue);
            provider.start(sink).await?;
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let providers: Vec<_> = self.providers.lock().unwrap().clone();
        for provider in &providers {
            provider.stop().await;
        }

        self.worker_shutdown.notify_one();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.started.store(false, Ordering::Release);
    }

    /// Tell the peer why, then close.
    pub async fn disconnect_with_reason(&self, connection: &Arc<dyn Connection>, reason: &str) {
        connection
            .disconnect(false, DisconnectReason::Custom, Some(reason.to_owned()))
            .await;
    }
}
