//! Game events, event sinks and the event log
//!
//! Every state transition the server performs is announced as a [`GameEvent`]
//! on an [`EventChannel`]. Recording those events in an [`EventLog`] and
//! feeding them back through [`ServerState::apply`](crate::state::ServerState::apply)
//! reconstructs the session.

use crate::actor::{Actor, SanctionRequest};
use crate::error::Result;
use crate::group::GroupId;
use crate::resource::Resource;
use crate::state::ServerState;
use bincode::{deserialize, deserialize_from, serialize, serialize_into};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::{Direction, Identifier, Notification, Point, Strategy};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Client request that targets the token at `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: Identifier,
    pub position: Point,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    /// Full snapshot of the joining actor, its group and its recorded position
    ClientAdded {
        actor: Actor,
        group: GroupId,
        position: Point,
    },
    ClientRemoved {
        id: Identifier,
    },
    ResourcesAdded {
        group: GroupId,
        resources: Vec<Resource>,
    },
    ResourceAdded {
        group: GroupId,
        resource: Resource,
    },
    Movement {
        id: Identifier,
        direction: Direction,
    },
    RealTimeSanction(SanctionRequest),
    ResetTokenDistribution {
        id: Identifier,
    },
    TokenCollected {
        id: Identifier,
        location: Point,
    },
    ExplicitCollectionMode {
        id: Identifier,
        explicit: bool,
    },
    TokenMoved {
        group: GroupId,
        from: Point,
        to: Point,
    },
    TokensMoved {
        group: GroupId,
        removed: Vec<Point>,
        added: Vec<Point>,
    },
    LockResource {
        request: ResourceRequest,
        granted: bool,
    },
    UnlockResource(ResourceRequest),
    ShowImposedStrategy {
        id: Identifier,
        strategy: Option<Strategy>,
    },
    /// A record of a kind this build does not know about
    Unknown {
        kind: String,
    },
}

impl GameEvent {
    pub fn kind(&self) -> &str {
        match self {
            GameEvent::ClientAdded { .. } => "client-added",
            GameEvent::ClientRemoved { .. } => "client-removed",
            GameEvent::ResourcesAdded { .. } => "resources-added",
            GameEvent::ResourceAdded { .. } => "resource-added",
            GameEvent::Movement { .. } => "movement",
            GameEvent::RealTimeSanction(_) => "real-time-sanction",
            GameEvent::ResetTokenDistribution { .. } => "reset-token-distribution",
            GameEvent::TokenCollected { .. } => "token-collected",
            GameEvent::ExplicitCollectionMode { .. } => "explicit-collection-mode",
            GameEvent::TokenMoved { .. } => "token-moved",
            GameEvent::TokensMoved { .. } => "tokens-moved",
            GameEvent::LockResource { .. } => "lock-resource",
            GameEvent::UnlockResource(_) => "unlock-resource",
            GameEvent::ShowImposedStrategy { .. } => "show-imposed-strategy",
            GameEvent::Unknown { kind } => kind.as_str(),
        }
    }

    /// Client-facing form of this event, if clients are told about it.
    pub fn notification(&self) -> Option<Notification> {
        let notification = match self {
            GameEvent::ClientAdded {
                actor,
                group,
                position,
            } => Notification::ClientJoined {
                id: actor.id,
                chat_handle: actor.chat_handle.clone().unwrap_or_default(),
                group: group.0,
                position: *position,
            },
            GameEvent::ClientRemoved { id } => Notification::ClientLeft { id: *id },
            GameEvent::ResourcesAdded { group, resources } => Notification::ResourcesAdded {
                group: group.0,
                positions: resources.iter().map(|resource| resource.position).collect(),
            },
            GameEvent::ResourceAdded { group, resource } => Notification::ResourcesAdded {
                group: group.0,
                positions: vec![resource.position],
            },
            GameEvent::Movement { id, direction } => Notification::ClientMoved {
                id: *id,
                direction: *direction,
            },
            GameEvent::TokenCollected { id, location } => Notification::TokenCollected {
                id: *id,
                position: *location,
            },
            GameEvent::TokenMoved { from, to, .. } => Notification::TokenMoved {
                from: *from,
                to: *to,
            },
            GameEvent::TokensMoved { removed, added, .. } => Notification::TokensMoved {
                removed: removed.clone(),
                added: added.clone(),
            },
            GameEvent::LockResource { request, granted } => Notification::ResourceLockChanged {
                id: request.id,
                position: request.position,
                locked: *granted,
            },
            GameEvent::UnlockResource(request) => Notification::ResourceLockChanged {
                id: request.id,
                position: request.position,
                locked: false,
            },
            GameEvent::ResetTokenDistribution { id } => {
                Notification::TokenDistributionReset { id: *id }
            }
            GameEvent::ShowImposedStrategy { id, strategy } => Notification::ImposedStrategy {
                id: *id,
                strategy: *strategy,
            },
            GameEvent::RealTimeSanction(_)
            | GameEvent::ExplicitCollectionMode { .. }
            | GameEvent::Unknown { .. } => return None,
        };
        Some(notification)
    }
}

/// An event as stored in the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub sequence: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub event: GameEvent,
}

/// Sink for outbound events. Implementations must not call back into the
/// server state.
pub trait EventChannel: Send + Sync {
    fn handle(&self, event: &GameEvent);
}

/// Discards everything. Installed while replaying so nothing is rebroadcast.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventChannel;

impl EventChannel for NullEventChannel {
    fn handle(&self, _event: &GameEvent) {}
}

/// Forwards each event to every inner channel in order.
#[derive(Default)]
pub struct FanoutChannel {
    channels: Vec<Arc<dyn EventChannel>>,
}

impl FanoutChannel {
    pub fn new(channels: Vec<Arc<dyn EventChannel>>) -> Self {
        Self { channels }
    }
}

impl EventChannel for FanoutChannel {
    fn handle(&self, event: &GameEvent) {
        for channel in &self.channels {
            channel.handle(event);
        }
    }
}

/// On-disk form of a record. The event is encoded on its own behind its kind
/// tag, so a record written by a build with more event kinds still loads.
#[derive(Debug, Serialize, Deserialize)]
struct LogFrame {
    sequence: u64,
    timestamp: u64,
    kind: String,
    payload: Vec<u8>,
}

impl LogFrame {
    fn encode(record: &PersistedEvent) -> Result<Self> {
        Ok(Self {
            sequence: record.sequence,
            timestamp: record.timestamp,
            kind: record.event.kind().to_string(),
            payload: serialize(&record.event)?,
        })
    }

    fn decode(self) -> PersistedEvent {
        let event = match deserialize::<GameEvent>(&self.payload) {
            Ok(event) if event.kind() == self.kind => event,
            _ => {
                warn!("Record #{} has unrecognized kind {}", self.sequence, self.kind);
                GameEvent::Unknown { kind: self.kind }
            }
        };
        PersistedEvent {
            sequence: self.sequence,
            timestamp: self.timestamp,
            event,
        }
    }
}

pub fn get_timestamp() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}

/// Recording channel: assigns each event a sequence number and timestamp.
#[derive(Debug, Default)]
pub struct EventLog {
    records: Mutex<Vec<PersistedEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<PersistedEvent>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, event: GameEvent) {
        let mut records = self.records();
        let sequence = records.len() as u64;
        records.push(PersistedEvent {
            sequence,
            timestamp: get_timestamp(),
            event,
        });
    }

    pub fn events(&self) -> Vec<PersistedEvent> {
        self.records().clone()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn save<W: Write>(&self, writer: W) -> Result<()> {
        let frames = self
            .records()
            .iter()
            .map(LogFrame::encode)
            .collect::<Result<Vec<_>>>()?;
        serialize_into(writer, &frames)?;
        Ok(())
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.save(&mut writer)?;
        writer.flush()?;
        info!("Wrote {} events to {}", self.len(), path.as_ref().display());
        Ok(())
    }

    /// Reads a saved log. Records of kinds this build does not know come
    /// back as [`GameEvent::Unknown`].
    pub fn load<R: Read>(reader: R) -> Result<Vec<PersistedEvent>> {
        let frames: Vec<LogFrame> = deserialize_from(reader)?;
        Ok(frames.into_iter().map(LogFrame::decode).collect())
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Vec<PersistedEvent>> {
        Self::load(BufReader::new(File::open(path)?))
    }
}

impl EventChannel for EventLog {
    fn handle(&self, event: &GameEvent) {
        self.record(event.clone());
    }
}

/// Applies `events` to `state` in recorded order. Stops at the first event
/// that cannot be applied; unknown kinds are skipped inside `apply`.
pub fn replay(state: &ServerState, events: &[PersistedEvent]) -> Result<usize> {
    for record in events {
        debug!("Replaying #{} ({})", record.sequence, record.event.kind());
        state.apply(&record.event)?;
    }
    Ok(events.len())
}
