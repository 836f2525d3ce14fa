//! Participant records held by groups
//!
//! Clients and bots share one record type; the variant lives in the
//! [`Identifier`]. An actor links to its group through a [`GroupId`] handle
//! rather than a reference, so the group registry stays the single owner.

use crate::config::RoundConfiguration;
use crate::group::GroupId;
use serde::{Deserialize, Serialize};
use shared::{Identifier, Point};
use std::collections::VecDeque;
use std::fmt;

/// A real-time sanction issued by one actor against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionRequest {
    pub source: Identifier,
    pub target: Identifier,
}

/// Per-actor trust game inputs and accumulated results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustGameLedger {
    /// Fraction of the endowment kept when playing as player one
    pub player_one_amount_to_keep: f64,
    /// Fractions of the tripled transfer kept as player two, indexed by the
    /// amount player one sent (0.25, 0.50, 0.75, 1.00)
    pub player_two_amounts_to_keep: [f64; 4],
    pub earnings: f64,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Identifier,
    pub chat_handle: Option<String>,
    pub position: Point,
    /// Tokens collected in the current round
    pub tokens: u32,
    pub explicit_collection_mode: bool,
    pub latest_sanctions: VecDeque<SanctionRequest>,
    pub group: Option<GroupId>,
    /// 1-based slot within the group, drives placement
    pub assigned_number: usize,
    pub trust_game: TrustGameLedger,
}

impl Actor {
    pub fn new(id: Identifier) -> Self {
        Self {
            id,
            chat_handle: None,
            position: Point::default(),
            tokens: 0,
            explicit_collection_mode: false,
            latest_sanctions: VecDeque::new(),
            group: None,
            assigned_number: 0,
            trust_game: TrustGameLedger::default(),
        }
    }

    pub fn is_bot(&self) -> bool {
        self.id.is_bot()
    }

    /// Places the actor by the group spacing rule: members are spread evenly
    /// along the horizontal midline in slot order.
    pub fn initialize_position(&mut self, config: &RoundConfiguration) {
        let slots = (config.clients_per_group as i32).saturating_add(1).max(1);
        let spacing = config.board_width / slots;
        let x = spacing
            .saturating_mul(self.assigned_number as i32)
            .clamp(0, config.board_width.saturating_sub(1).max(0));
        self.position = Point::new(x, (config.board_height / 2).max(0));
    }

    pub fn add_token(&mut self) {
        self.tokens += 1;
    }

    pub fn log_trust_game(&mut self, entry: String) {
        self.trust_game.log.push(entry);
    }

    pub fn add_trust_game_earnings(&mut self, earnings: f64) {
        self.trust_game.earnings += earnings;
    }

    pub fn reset_latest_sanctions(&mut self) {
        self.latest_sanctions.clear();
    }

    /// Clears per-round state. Trust game history and group placement stay.
    pub fn cleanup_round(&mut self) {
        self.tokens = 0;
        self.latest_sanctions.clear();
        self.explicit_collection_mode = false;
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.chat_handle {
            Some(handle) => write!(f, "{} ({})", handle, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
