use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_BOARD_WIDTH: i32 = 28;
pub const DEFAULT_BOARD_HEIGHT: i32 = 28;
pub const PROTOCOL_VERSION: u32 = 1;

/// Handle for an actor, stable for its lifetime.
///
/// Human participants and bots share one identifier space but never collide,
/// because the variant is part of the identity.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Identifier {
    Client(u32),
    Bot(u32),
}

impl Identifier {
    pub fn is_bot(&self) -> bool {
        matches!(self, Identifier::Bot(_))
    }

    pub fn index(&self) -> u32 {
        match self {
            Identifier::Client(index) | Identifier::Bot(index) => *index,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Client(index) => write!(f, "client-{}", index),
            Identifier::Bot(index) => write!(f, "bot-{}", index),
        }
    }
}

/// Integer cell on the board. Ordered row-major so sets of points iterate
/// deterministically.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Point {
    pub y: i32,
    pub x: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Moves one cell in `direction`, clamped to a `width` x `height` board.
    pub fn step(&self, direction: Direction, width: i32, height: i32) -> Point {
        let (dx, dy) = direction.delta();
        Point {
            x: (self.x + dx).clamp(0, (width - 1).max(0)),
            y: (self.y + dy).clamp(0, (height - 1).max(0)),
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Screen coordinates: y grows downwards.
    pub fn delta(&self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

/// Treatment conditions an experimenter can impose on a whole group.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strategy {
    WaitBeforeHarvest,
    HarvestSlowly,
    SplitTerritory,
    RotateHarvesting,
    LeaveTokensToRegrow,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Strategy::WaitBeforeHarvest => "wait before harvesting",
            Strategy::HarvestSlowly => "harvest slowly",
            Strategy::SplitTerritory => "split the territory",
            Strategy::RotateHarvesting => "rotate harvesting",
            Strategy::LeaveTokensToRegrow => "leave tokens to regrow",
        };
        f.write_str(label)
    }
}

/// Outbound, client-facing view of a server state transition.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Notification {
    ClientJoined {
        id: Identifier,
        chat_handle: String,
        group: u32,
        position: Point,
    },
    ClientLeft {
        id: Identifier,
    },
    ResourcesAdded {
        group: u32,
        positions: Vec<Point>,
    },
    ClientMoved {
        id: Identifier,
        direction: Direction,
    },
    TokenCollected {
        id: Identifier,
        position: Point,
    },
    TokenMoved {
        from: Point,
        to: Point,
    },
    TokensMoved {
        removed: Vec<Point>,
        added: Vec<Point>,
    },
    ResourceLockChanged {
        id: Identifier,
        position: Point,
        locked: bool,
    },
    TokenDistributionReset {
        id: Identifier,
    },
    ImposedStrategy {
        id: Identifier,
        strategy: Option<Strategy>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Move {
        direction: Direction,
    },
    CollectToken,
    LockResource {
        position: Point,
    },
    UnlockResource {
        position: Point,
    },
    HarvestResource {
        position: Point,
    },
    HarvestFruit {
        position: Point,
    },
    ResetTokenDistribution,
    CollectionMode {
        explicit: bool,
    },
    Sanction {
        target: Identifier,
    },
    Heartbeat,
    Disconnect,

    Connected {
        id: Identifier,
        chat_handle: String,
        group: u32,
    },
    LockResult {
        position: Point,
        granted: bool,
    },
    Notification(Notification),
    Disconnected {
        reason: String,
    },
}
