use crate::cipher::{SymmetricCipher, BLOCK_SIZE, KEY_SIZE};
use crate::config::EndPointConfig;
use crate::connection::Connection;
use crate::event::ConnectionEvent;
use crate::random::ThreadRngRandom;
use crate::socket::MAX_DATAGRAM_SIZE;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Where a fleet of connections reports its events. Implementations must not
///  block the endpoint loop for long; hand heavy work off.
#[async_trait]
pub trait ConnectionEventSink: Send + Sync {
    async fn on_event(&self, peer: SocketAddr, event: ConnectionEvent);

    /// A datagram from an address with no live connection. This is where the
    ///  handshake collaborator picks up challenge/connect traffic.
    async fn on_unmatched_datagram(&self, from: SocketAddr, bytes: Bytes);
}

/// Session material negotiated by the handshake collaborator.
#[derive(Clone)]
pub struct SessionParameters {
    pub cipher_key: [u8; KEY_SIZE],
    pub init_vector: [u8; BLOCK_SIZE],
    /// the peer's initial send sequence, i.e. our initial receive sequence
    pub initial_recv_seq: u32,
}

enum Command {
    /// Create a pending connection and report its initial send sequence for
    ///  the handshake to transmit.
    Open {
        peer: SocketAddr,
        reply: oneshot::Sender<anyhow::Result<u32>>,
    },
    /// Install the negotiated session and bring the connection up.
    Complete {
        peer: SocketAddr,
        session: SessionParameters,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    QueuePayload {
        peer: SocketAddr,
        payload: Bytes,
        extension: Option<Bytes>,
    },
    Disconnect {
        peer: SocketAddr,
        reason: Bytes,
    },
}

/// Cloneable front door to a running [`EndPoint`] loop.
#[derive(Clone)]
pub struct EndPointHandle {
    commands: mpsc::Sender<Command>,
}

impl EndPointHandle {
    /// Creates a pending connection to `peer` and returns the local initial
    ///  send sequence the handshake must carry to the other side.
    pub async fn open_connection(&self, peer: SocketAddr) -> anyhow::Result<u32> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Open { peer, reply })
            .await
            .map_err(|_| anyhow!("endpoint loop is gone"))?;
        response.await.map_err(|_| anyhow!("endpoint loop is gone"))?
    }

    /// Installs the negotiated session; the connection emits `Established`.
    pub async fn complete_connection(
        &self,
        peer: SocketAddr,
        session: SessionParameters,
    ) -> anyhow::Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Complete { peer, session, reply })
            .await
            .map_err(|_| anyhow!("endpoint loop is gone"))?;
        response.await.map_err(|_| anyhow!("endpoint loop is gone"))?
    }

    pub async fn queue_payload(&self, peer: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        self.commands
            .send(Command::QueuePayload {
                peer,
                payload,
                extension: None,
            })
            .await
            .map_err(|_| anyhow!("endpoint loop is gone"))
    }

    pub async fn queue_payload_tagged(
        &self,
        peer: SocketAddr,
        payload: Bytes,
        extension: Bytes,
    ) -> anyhow::Result<()> {
        self.commands
            .send(Command::QueuePayload {
                peer,
                payload,
                extension: Some(extension),
            })
            .await
            .map_err(|_| anyhow!("endpoint loop is gone"))
    }

    pub async fn disconnect(&self, peer: SocketAddr, reason: Bytes) -> anyhow::Result<()> {
        self.commands
            .send(Command::Disconnect { peer, reason })
            .await
            .map_err(|_| anyhow!("endpoint loop is gone"))
    }
}

/// EndPoint is where the pieces come together for production use: it owns the
///  UDP socket and the per-peer connections, pumps received datagrams into
///  them, ticks them at a fixed cadence, and forwards their events to the
///  sink. It is the serialization boundary the core requires: every connection
///  is touched only from the `run` task.
pub struct EndPoint {
    socket: Arc<UdpSocket>,
    config: EndPointConfig,
    sink: Arc<dyn ConnectionEventSink>,
    connections: FxHashMap<SocketAddr, Connection>,
    /// taken by `run`
    commands: Option<mpsc::Receiver<Command>>,
    started: Instant,
}

impl EndPoint {
    pub async fn new(
        config: EndPointConfig,
        sink: Arc<dyn ConnectionEventSink>,
    ) -> anyhow::Result<(EndPoint, EndPointHandle)> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound endpoint socket to {:?}", socket.local_addr()?);

        let (command_tx, command_rx) = mpsc::channel(64);
        Ok((
            EndPoint {
                socket,
                config,
                sink,
                connections: FxHashMap::default(),
                commands: Some(command_rx),
                started: Instant::now(),
            },
            EndPointHandle {
                commands: command_tx,
            },
        ))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Drives the endpoint until every handle is dropped.
    pub async fn run(mut self) {
        info!("starting endpoint loop");

        let socket = self.socket.clone();
        let mut commands = self.commands.take().expect("run may only be called once");
        let mut tick = interval(self.config.tick_interval);
        // one extra byte so oversized datagrams are detectable
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            if len > MAX_DATAGRAM_SIZE {
                                debug!("datagram from {:?} exceeds the configured MTU - dropping", from);
                                continue;
                            }
                            let bytes = buf[..len].to_vec();
                            self.handle_datagram(from, &bytes).await;
                        }
                        Err(e) => {
                            warn!("socket error: {}", e);
                        }
                    }
                }
                _ = tick.tick() => {
                    self.tick_connections().await;
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("all endpoint handles dropped - stopping");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        let now_ms = self.now_ms();
        match self.connections.get_mut(&from) {
            Some(connection) if connection.is_established() => {
                {
                    let _entered = span.enter();
                    trace!("received {} bytes from {:?}", bytes.len(), from);
                    connection.receive_datagram(now_ms, bytes);
                }
                self.flush_events(from).instrument(span).await;
            }
            _ => {
                self.sink
                    .on_unmatched_datagram(from, Bytes::copy_from_slice(bytes))
                    .instrument(span)
                    .await;
            }
        }
    }

    async fn tick_connections(&mut self) {
        let now_ms = self.now_ms();
        let peers: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for peer in peers {
            if let Some(connection) = self.connections.get_mut(&peer) {
                connection.tick(now_ms);
            }
            self.flush_events(peer).await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { peer, reply } => {
                let _ = reply.send(self.open_connection(peer));
            }
            Command::Complete { peer, session, reply } => {
                let result = self.complete_connection(peer, session);
                let _ = reply.send(result);
                self.flush_events(peer).await;
            }
            Command::QueuePayload { peer, payload, extension } => {
                match self.connections.get_mut(&peer) {
                    Some(connection) => match extension {
                        Some(extension) => connection.queue_payload_tagged(payload, extension),
                        None => connection.queue_payload(payload),
                    },
                    None => warn!("payload for unknown peer {:?} - discarding", peer),
                }
            }
            Command::Disconnect { peer, reason } => {
                if let Some(connection) = self.connections.get_mut(&peer) {
                    connection.disconnect(reason);
                }
                self.flush_events(peer).await;
            }
        }
    }

    fn open_connection(&mut self, peer: SocketAddr) -> anyhow::Result<u32> {
        if self.connections.contains_key(&peer) {
            bail!("a connection to {:?} already exists", peer);
        }

        debug!("opening connection to {:?}", peer);
        let mut connection = Connection::new(
            self.config.connection.clone(),
            peer,
            Arc::new(self.socket.clone()),
            Box::new(ThreadRngRandom),
        )?;
        connection.begin_connect();

        let initial_send_seq = connection.initial_send_sequence();
        self.connections.insert(peer, connection);
        Ok(initial_send_seq)
    }

    fn complete_connection(
        &mut self,
        peer: SocketAddr,
        session: SessionParameters,
    ) -> anyhow::Result<()> {
        let now = self.now_ms();
        let connection = self
            .connections
            .get_mut(&peer)
            .ok_or_else(|| anyhow!("no pending connection to {:?}", peer))?;

        connection.install_session(
            SymmetricCipher::new(&session.cipher_key, &session.init_vector),
            session.initial_recv_seq,
        );
        connection.handshake_complete(now);
        debug!("connection to {:?} established", peer);
        Ok(())
    }

    /// Drains one connection's event queue into the sink, dropping the
    ///  connection once it reports a terminal event.
    async fn flush_events(&mut self, peer: SocketAddr) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };

        let mut events = Vec::new();
        while let Some(event) = connection.poll_event() {
            events.push(event);
        }
        let terminal = connection.state().is_terminal();

        for event in events {
            self.sink.on_event(peer, event).await;
        }
        if terminal {
            debug!("removing terminal connection to {:?}", peer);
            self.connections.remove(&peer);
        }
    }
}
