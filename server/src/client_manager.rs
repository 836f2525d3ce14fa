//! Connection bookkeeping for the UDP transport
//!
//! This module tracks which network address speaks for which participant:
//! - Connection lifecycle (connect, disconnect, timeout)
//! - Liveness tracking from any received packet
//! - Capacity enforcement and address lookup
//!
//! Participants are identified by [`Identifier::Client`] values handed out in
//! connection order; the game state never sees socket addresses.

use log::info;
use shared::Identifier;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Clients that stay silent this long are dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected participant's transport state
#[derive(Debug)]
pub struct Client {
    pub id: Identifier,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
}

impl Client {
    pub fn new(id: Identifier, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing was received from this client within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Maps transport addresses to participant identifiers and enforces the
/// connection cap.
pub struct ClientManager {
    clients: HashMap<Identifier, Client>,
    /// Index of the next `Identifier::Client` to hand out
    next_client_index: u32,
    max_clients: usize,
}

impl ClientManager {
    /// Creates an empty roster. Client indices start from 1.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_index: 1,
            max_clients,
        }
    }

    /// Registers a new connection from `addr`.
    ///
    /// Returns `None` when the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<Identifier> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let id = Identifier::Client(self.next_client_index);
        self.next_client_index += 1;

        info!("{} connected from {}", id, addr);
        self.clients.insert(id, Client::new(id, addr));

        Some(id)
    }

    /// Returns true if the client was found and removed.
    pub fn remove_client(&mut self, id: &Identifier) -> bool {
        if let Some(client) = self.clients.remove(id) {
            info!("{} disconnected", client.id);
            true
        } else {
            false
        }
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<Identifier> {
        self.clients
            .values()
            .find(|client| client.addr == addr)
            .map(|client| client.id)
    }

    /// Records activity from `addr`. Returns the sender's identifier if the
    /// address belongs to a connected client.
    pub fn touch(&mut self, addr: SocketAddr) -> Option<Identifier> {
        let client = self.clients.values_mut().find(|client| client.addr == addr)?;
        client.touch();
        Some(client.id)
    }

    /// Removes and returns every client silent for longer than `timeout`.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Identifier> {
        let timed_out: Vec<Identifier> = self
            .clients
            .values()
            .filter(|client| client.is_timed_out(timeout))
            .map(|client| client.id)
            .collect();

        for id in &timed_out {
            self.remove_client(id);
        }

        timed_out
    }

    /// All connected identifiers with their addresses, for broadcasting.
    pub fn get_client_addrs(&self) -> Vec<(Identifier, SocketAddr)> {
        self.clients
            .values()
            .map(|client| (client.id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
