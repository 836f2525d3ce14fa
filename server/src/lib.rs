//! # Foraging Experiment Server Library
//!
//! This library provides the authoritative server implementation for a
//! multi-client resource harvesting experiment. Participants move on a board,
//! harvest tokens and are split into groups that each run their own token
//! economy. Every transition is an event, so a recorded session can be
//! replayed into an identical state.
//!
//! ## Core Responsibilities
//!
//! ### Event Sourced State
//! [`state::ServerState::apply`] is the single mutation path for live traffic
//! and replay. Live operations build a [`events::GameEvent`], apply it and
//! announce it on the installed [`events::EventChannel`].
//!
//! ### Group Partitioning
//! Clients fill groups greedily in creation order. A group holds its members
//! and its token registry; groups never share an actor.
//!
//! ### Treatments
//! Experimenter strategies are distributed over groups by a quota-respecting
//! random allocation, and the trust game computes pairwise payoffs.
//!
//! ## Module Organization
//!
//! ### State (`state`), Groups (`group`), Actors (`actor`), Tokens (`resource`)
//! The core state machine, from the server-wide registry down to the
//! per-position token records.
//!
//! ### Events (`events`)
//! The event vocabulary, event sinks, the recorded event log and replay.
//!
//! ### Strategy (`strategy`) and Trust Game (`trust_game`)
//! Treatment allocation and the two-player payoff calculation.
//!
//! ### Client Manager (`client_manager`) and Network (`network`)
//! The UDP transport: address tracking, timeouts, request routing and
//! notification broadcast.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::RoundConfiguration;
//! use server::events::NullEventChannel;
//! use server::network::Server;
//! use server::state::ServerState;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = Arc::new(ServerState::new(
//!         RoundConfiguration::default(),
//!         Arc::new(NullEventChannel),
//!     ));
//!     let mut server = Server::new("127.0.0.1:8080", Arc::clone(&state), 32).await?;
//!     state.set_channel(Arc::new(server.network_channel()));
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod network;
pub mod resource;
pub mod state;
pub mod strategy;
pub mod trust_game;
