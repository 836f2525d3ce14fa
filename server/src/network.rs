//! Server network layer handling UDP communications
//!
//! Datagrams are decoded into [`Packet`]s by a receiver task and handed to
//! the main loop, which turns requests into [`ServerState`] operations.
//! Outbound traffic goes through a sender task; the [`NetworkChannel`] is the
//! event channel that feeds it with notifications.

use crate::actor::{Actor, SanctionRequest};
use crate::client_manager::{ClientManager, CLIENT_TIMEOUT};
use crate::error::Result as StateResult;
use crate::events::{EventChannel, GameEvent, ResourceRequest};
use crate::state::ServerState;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Identifier, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { id: Identifier },
    Shutdown,
}

/// Outbound traffic queued for the sender task
#[derive(Debug)]
pub enum Outbound {
    Unicast { packet: Packet, addr: SocketAddr },
    /// Sent to every connected client
    Broadcast(Packet),
}

/// Event channel that broadcasts each event's client notification.
#[derive(Clone)]
pub struct NetworkChannel {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

impl NetworkChannel {
    pub fn new(outbound_tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { outbound_tx }
    }
}

impl EventChannel for NetworkChannel {
    fn handle(&self, event: &GameEvent) {
        let Some(notification) = event.notification() else {
            return;
        };
        let packet = Packet::Notification(notification);
        if self.outbound_tx.send(Outbound::Broadcast(packet)).is_err() {
            debug!("Sender stopped, dropping {} notification", event.kind());
        }
    }
}

fn decode_datagram(bytes: &[u8], addr: SocketAddr) -> Option<Packet> {
    match deserialize::<Packet>(bytes) {
        Ok(packet) => Some(packet),
        Err(e) => {
            warn!("Dropping malformed datagram from {}: {}", addr, e);
            None
        }
    }
}

/// UDP front end for a shared [`ServerState`]
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    state: Arc<ServerState>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
}

impl Server {
    pub async fn new(
        addr: &str,
        state: Arc<ServerState>,
        max_clients: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            state,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Channel that forwards state notifications to every connected client.
    pub fn network_channel(&self) -> NetworkChannel {
        NetworkChannel::new(self.outbound_tx.clone())
    }

    /// Handle for stopping [`Server::run`] from another task.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Decodes datagrams and hands them to the main loop
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                let (len, addr) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                let Some(packet) = decode_datagram(&buffer[..len], addr) else {
                    continue;
                };
                if server_tx
                    .send(ServerMessage::PacketReceived { packet, addr })
                    .is_err()
                {
                    debug!("Main loop closed, receiver stopping");
                    return;
                }
            }
        });
    }

    /// Drains the outbound queue. Each packet is encoded once, however many
    /// clients it goes to.
    fn spawn_network_sender(&mut self) {
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            warn!("Sender task already running");
            return;
        };
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);

        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Unicast { packet, addr } => {
                        Self::deliver(&socket, &packet, &[addr]).await;
                    }
                    Outbound::Broadcast(packet) => {
                        let targets: Vec<SocketAddr> = clients
                            .read()
                            .await
                            .get_client_addrs()
                            .into_iter()
                            .map(|(_, addr)| addr)
                            .collect();
                        Self::deliver(&socket, &packet, &targets).await;
                    }
                }
            }
        });
    }

    /// Reports clients that have been silent for longer than [`CLIENT_TIMEOUT`]
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(CLIENT_TIMEOUT / 5);
            loop {
                sweep.tick().await;
                let expired = clients.write().await.check_timeouts(CLIENT_TIMEOUT);
                for id in expired {
                    if server_tx.send(ServerMessage::ClientTimeout { id }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    async fn deliver(socket: &UdpSocket, packet: &Packet, targets: &[SocketAddr]) {
        let data = match serialize(packet) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode {:?}: {}", packet, e);
                return;
            }
        };
        for addr in targets {
            if let Err(e) = socket.send_to(&data, *addr).await {
                warn!("Failed to send to {}: {}", addr, e);
            }
        }
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.outbound_tx.send(Outbound::Unicast { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Processes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );
                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: format!(
                                "Unsupported protocol version {}, expected {}",
                                client_version, PROTOCOL_VERSION
                            ),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                let existing = {
                    let clients = self.clients.read().await;
                    clients.find_client_by_addr(addr)
                };
                if let Some(existing) = existing {
                    info!("Removing existing {} from {}", existing, addr);
                    self.clients.write().await.remove_client(&existing);
                    self.state.remove_client(existing);
                }

                let id = self.clients.write().await.add_client(addr);
                match id {
                    Some(id) => {
                        let actor = self.state.add_client(Actor::new(id));
                        let group = actor.group.map_or(0, |group| group.0);
                        self.send_packet(
                            Packet::Connected {
                                id,
                                chat_handle: actor.chat_handle.unwrap_or_default(),
                                group,
                            },
                            addr,
                        );
                    }
                    None => {
                        self.send_packet(
                            Packet::Disconnected {
                                reason: "Server full".to_string(),
                            },
                            addr,
                        );
                    }
                }
            }

            Packet::Disconnect => {
                let id = {
                    let clients = self.clients.read().await;
                    clients.find_client_by_addr(addr)
                };
                if let Some(id) = id {
                    self.clients.write().await.remove_client(&id);
                    self.state.remove_client(id);
                }
            }

            packet => {
                let id = self.clients.write().await.touch(addr);
                match id {
                    Some(id) => {
                        if let Err(e) = self.handle_request(id, packet, addr) {
                            warn!("Request from {} failed: {}", id, e);
                        }
                    }
                    None => warn!("Packet from unknown client at {}", addr),
                }
            }
        }
    }

    /// Routes a request from a connected client to the server state
    fn handle_request(&self, id: Identifier, packet: Packet, addr: SocketAddr) -> StateResult<()> {
        match packet {
            Packet::Move { direction } => self.state.move_client(id, direction)?,
            Packet::CollectToken => {
                self.state.collect_token(id)?;
            }
            Packet::LockResource { position } => {
                let granted = self
                    .state
                    .lock_resource(&ResourceRequest { id, position })?;
                self.send_packet(Packet::LockResult { position, granted }, addr);
            }
            Packet::UnlockResource { position } => {
                self.state
                    .unlock_resource(&ResourceRequest { id, position })?;
            }
            Packet::HarvestResource { position } => {
                self.state
                    .harvest_resource(&ResourceRequest { id, position })?;
            }
            Packet::HarvestFruit { position } => {
                self.state
                    .harvest_fruits(&ResourceRequest { id, position })?;
            }
            Packet::ResetTokenDistribution => self.state.reset_token_distribution(id)?,
            Packet::CollectionMode { explicit } => {
                self.state.set_explicit_collection_mode(id, explicit)?
            }
            Packet::Sanction { target } => self.state.record_sanction(SanctionRequest {
                source: id,
                target,
            })?,
            Packet::Heartbeat => debug!("Heartbeat from {}", id),
            _ => warn!("Unexpected packet type from {} at {}", id, addr),
        }
        Ok(())
    }

    /// Main server loop. Returns after a [`ServerMessage::Shutdown`].
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::PacketReceived { packet, addr } => {
                    self.handle_packet(packet, addr).await;
                }
                ServerMessage::ClientTimeout { id } => {
                    info!("{} timed out", id);
                    self.state.remove_client(id);
                }
                ServerMessage::Shutdown => break,
            }
        }

        info!("Server shutting down");
        Ok(())
    }
}
