//! Two-player trust game payoffs
//!
//! Player one starts with a $1.00 endowment, keeps part of it and sends the
//! rest. The amount sent is tripled. Player two answers with a keep fraction
//! chosen in advance for each possible transfer, and what is not kept goes
//! back to player one.

use crate::actor::Actor;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::Identifier;

const MULTIPLIER: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustGameResult {
    pub player_one: Identifier,
    pub player_two: Identifier,
    pub player_one_amount_to_keep: f64,
    pub player_two_amounts_to_keep: [f64; 4],
    pub player_one_earnings: f64,
    pub player_two_earnings: f64,
    pub log: String,
}

impl TrustGameResult {
    fn new(player_one: Identifier, player_two: Identifier) -> Self {
        Self {
            player_one,
            player_two,
            player_one_amount_to_keep: 0.0,
            player_two_amounts_to_keep: [0.0; 4],
            player_one_earnings: 0.0,
            player_two_earnings: 0.0,
            log: String::new(),
        }
    }
}

pub fn currency(amount: f64) -> String {
    format!("${:.2}", amount)
}

/// Index into player two's keep table for the amount player one sent.
///
/// Only the four exact transfers have an entry.
#[allow(clippy::float_cmp)]
fn response_index(amount_sent: f64) -> Option<usize> {
    if amount_sent == 0.25 {
        Some(0)
    } else if amount_sent == 0.50 {
        Some(1)
    } else if amount_sent == 0.75 {
        Some(2)
    } else if amount_sent == 1.0 {
        Some(3)
    } else {
        None
    }
}

/// Player two is only credited while they have fewer log entries than player
/// one, i.e. they have not yet played this round as player one.
// TODO: key this on round participation instead of log length; repeated or
// out-of-order pairings can credit or skip player two incorrectly.
fn should_log_player_two(player_one: &Actor, player_two: &Actor) -> bool {
    info!(
        "{} (P1) log: {:?} vs. {} (P2) log: {:?}",
        player_one, player_one.trust_game.log, player_two, player_two.trust_game.log
    );
    player_two.trust_game.log.len() < player_one.trust_game.log.len()
}

/// Plays one trust game between `player_one` and `player_two` and merges the
/// earnings and transcript lines into both ledgers.
///
/// Pairing an actor with itself is reported in the result log and leaves
/// both ledgers untouched.
pub fn calculate_trust_game(player_one: &mut Actor, player_two: &mut Actor) -> TrustGameResult {
    let mut result = TrustGameResult::new(player_one.id, player_two.id);
    if player_one.id == player_two.id {
        let message = format!(
            "{} tried to calculate trust game with self, aborting",
            player_one
        );
        warn!("{}", message);
        result.log = message;
        return result;
    }

    let player_one_amount_to_keep = player_one.trust_game.player_one_amount_to_keep;
    let player_two_amounts_to_keep = player_two.trust_game.player_two_amounts_to_keep;
    result.player_one_amount_to_keep = player_one_amount_to_keep;
    result.player_two_amounts_to_keep = player_two_amounts_to_keep;

    let amount_sent = 1.0 - player_one_amount_to_keep;
    let total_amount_sent = amount_sent * MULTIPLIER;
    let mut player_one_earnings = player_one_amount_to_keep;
    let mut player_two_earnings = 0.0;
    let mut amount_returned = 0.0;
    if amount_sent > 0.0 {
        if let Some(index) = response_index(amount_sent) {
            player_two_earnings = player_two_amounts_to_keep[index] * total_amount_sent;
            amount_returned = total_amount_sent - player_two_earnings;
            player_one_earnings += amount_returned;
        }
    }

    let mut transcript = String::new();
    let player_one_line = format!(
        " Player 1 kept {}, sent {}, and received {} back from Player 2 for a total earnings of {}",
        currency(player_one_amount_to_keep),
        currency(amount_sent),
        currency(amount_returned),
        currency(player_one_earnings)
    );
    player_one.log_trust_game(format!("You were Player 1.{}", player_one_line));
    player_one.add_trust_game_earnings(player_one_earnings);
    transcript.push_str(&format!("{}{}\n", player_one, player_one_line));

    if should_log_player_two(player_one, player_two) {
        let player_two_line = format!(
            " Player 2 received {} from Player 1 and sent back {} for a total earnings of {}",
            currency(total_amount_sent),
            currency(amount_returned),
            currency(player_two_earnings)
        );
        player_two.log_trust_game(format!("You were Player 2.{}", player_two_line));
        player_two.add_trust_game_earnings(player_two_earnings);
        transcript.push_str(&format!("{}{}\n", player_two, player_two_line));
    } else {
        transcript.push_str(&format!(
            "{} already participated in the trust game and was only used as a Player 2 strategy to respond to Player 1.",
            player_two
        ));
    }

    result.player_one_earnings = player_one_earnings;
    result.player_two_earnings = player_two_earnings;
    result.log = transcript;
    result
}
