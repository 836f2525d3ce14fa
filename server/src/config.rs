//! Round configuration consumed by the server state
//!
//! Loading and round transitions belong to the session layer; the server
//! only reads the values below.

use crate::error::{Result, ServerError};
use log::warn;
use serde::{Deserialize, Serialize};
use shared::{DEFAULT_BOARD_HEIGHT, DEFAULT_BOARD_WIDTH};

/// Labels used for chat handles when handles are not numeric.
pub const CHAT_HANDLES: [&str; 10] = [
    "A", "B", "C", "D", "E", "F", "G", "H", "I", "J",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundConfiguration {
    pub board_width: i32,
    pub board_height: i32,
    /// Maximum number of clients placed in one group by `add_client`
    pub clients_per_group: usize,
    pub chat_handle_prefix: String,
    pub chat_handles_numeric: bool,
    pub last_round: bool,
}

impl Default for RoundConfiguration {
    fn default() -> Self {
        Self {
            board_width: DEFAULT_BOARD_WIDTH,
            board_height: DEFAULT_BOARD_HEIGHT,
            clients_per_group: 5,
            chat_handle_prefix: String::new(),
            chat_handles_numeric: false,
            last_round: false,
        }
    }
}

impl RoundConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.board_width <= 0 || self.board_height <= 0 {
            return Err(ServerError::InvalidConfiguration(format!(
                "board must have positive dimensions, got {}x{}",
                self.board_width, self.board_height
            )));
        }
        if self.clients_per_group == 0 {
            return Err(ServerError::InvalidConfiguration(
                "clients_per_group must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Chat handle for the member occupying 1-based `slot` in its group.
    ///
    /// Falls back to the numeric form once the label table is exhausted.
    pub fn chat_handle(&self, slot: usize) -> String {
        let suffix = if self.chat_handles_numeric {
            slot.to_string()
        } else {
            match slot.checked_sub(1).and_then(|index| CHAT_HANDLES.get(index)) {
                Some(label) => label.to_string(),
                None => {
                    warn!("No chat handle label for slot {}, using number", slot);
                    slot.to_string()
                }
            }
        };
        format!("{}{}", self.chat_handle_prefix, suffix)
    }
}
