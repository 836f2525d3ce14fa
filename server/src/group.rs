//! Simulation sub-arenas
//!
//! A group owns its members and its token registry behind a single mutex, so
//! resource mutations are serialized per group while unrelated groups proceed
//! in parallel. Groups never reach back into the server state; the server
//! addresses them by [`GroupId`].

use crate::actor::{Actor, SanctionRequest, TrustGameLedger};
use crate::config::RoundConfiguration;
use crate::resource::{Resource, ResourceRegistry};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use shared::{Direction, Identifier, Point, Strategy};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Creation sequence number of a group. Also its total ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Persistent contents of a group, as captured in a server snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub actors: Vec<Actor>,
    pub resources: ResourceRegistry,
    pub imposed_strategy: Option<Strategy>,
}

#[derive(Debug, Default)]
struct GroupData {
    /// Members in join order
    actors: Vec<Actor>,
    resources: ResourceRegistry,
    imposed_strategy: Option<Strategy>,
}

impl GroupData {
    fn actor_mut(&mut self, id: Identifier) -> Option<&mut Actor> {
        self.actors.iter_mut().find(|actor| actor.id == id)
    }

    fn credit_token(&mut self, id: Identifier) {
        if let Some(actor) = self.actor_mut(id) {
            actor.add_token();
        }
    }
}

#[derive(Debug)]
pub struct Group {
    id: GroupId,
    data: Mutex<GroupData>,
}

impl Group {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            data: Mutex::new(GroupData::default()),
        }
    }

    pub fn from_snapshot(snapshot: GroupSnapshot) -> Self {
        Self {
            id: snapshot.id,
            data: Mutex::new(GroupData {
                actors: snapshot.actors,
                resources: snapshot.resources,
                imposed_strategy: snapshot.imposed_strategy,
            }),
        }
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        let data = self.data();
        GroupSnapshot {
            id: self.id,
            actors: data.actors.clone(),
            resources: data.resources.clone(),
            imposed_strategy: data.imposed_strategy,
        }
    }

    fn data(&self) -> MutexGuard<'_, GroupData> {
        // every method leaves the data consistent, so poisoning is ignored
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.data().actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().actors.is_empty()
    }

    pub fn is_full(&self, config: &RoundConfiguration) -> bool {
        self.size() >= config.clients_per_group
    }

    pub fn contains(&self, id: Identifier) -> bool {
        self.data().actors.iter().any(|actor| actor.id == id)
    }

    /// Adds `actor` as the newest member and places it.
    ///
    /// The member's slot is the group size after insertion; the slot decides
    /// both the spacing position and the chat handle. Returns the placed
    /// record.
    pub fn add_actor(&self, mut actor: Actor, config: &RoundConfiguration) -> Actor {
        let mut data = self.data();
        data.actors.retain(|member| member.id != actor.id);
        let slot = data.actors.len() + 1;
        actor.group = Some(self.id);
        actor.assigned_number = slot;
        actor.chat_handle = Some(config.chat_handle(slot));
        actor.initialize_position(config);
        data.actors.push(actor.clone());
        debug!("{} joined {} in slot {}", actor.id, self.id, slot);
        actor
    }

    pub fn remove_actor(&self, id: Identifier) -> Option<Actor> {
        let mut data = self.data();
        let index = data.actors.iter().position(|actor| actor.id == id)?;
        data.resources.release_locks_held_by(id);
        let mut actor = data.actors.remove(index);
        actor.group = None;
        Some(actor)
    }

    pub fn actor(&self, id: Identifier) -> Option<Actor> {
        self.data().actors.iter().find(|actor| actor.id == id).cloned()
    }

    pub fn actors(&self) -> Vec<Actor> {
        self.data().actors.clone()
    }

    pub fn client_identifiers(&self) -> Vec<Identifier> {
        self.data()
            .actors
            .iter()
            .filter(|actor| !actor.is_bot())
            .map(|actor| actor.id)
            .collect()
    }

    pub fn client_map(&self) -> HashMap<Identifier, Actor> {
        self.data()
            .actors
            .iter()
            .filter(|actor| !actor.is_bot())
            .map(|actor| (actor.id, actor.clone()))
            .collect()
    }

    pub fn bot_map(&self) -> HashMap<Identifier, Actor> {
        self.data()
            .actors
            .iter()
            .filter(|actor| actor.is_bot())
            .map(|actor| (actor.id, actor.clone()))
            .collect()
    }

    /// Positions of every member, bots included.
    pub fn client_positions(&self) -> HashMap<Identifier, Point> {
        self.data()
            .actors
            .iter()
            .map(|actor| (actor.id, actor.position))
            .collect()
    }

    pub fn client_position(&self, id: Identifier) -> Option<Point> {
        self.actor(id).map(|actor| actor.position)
    }

    pub fn set_position(&self, id: Identifier, position: Point) -> bool {
        match self.data().actor_mut(id) {
            Some(actor) => {
                actor.position = position;
                true
            }
            None => false,
        }
    }

    /// Steps the member one cell in `direction`, staying on the board.
    pub fn move_actor(
        &self,
        id: Identifier,
        direction: Direction,
        config: &RoundConfiguration,
    ) -> Option<Point> {
        let mut data = self.data();
        let actor = data.actor_mut(id)?;
        actor.position = actor
            .position
            .step(direction, config.board_width, config.board_height);
        Some(actor.position)
    }

    pub fn current_tokens(&self, id: Identifier) -> Option<u32> {
        self.actor(id).map(|actor| actor.tokens)
    }

    pub fn set_explicit_collection_mode(&self, id: Identifier, explicit: bool) -> bool {
        match self.data().actor_mut(id) {
            Some(actor) => {
                actor.explicit_collection_mode = explicit;
                true
            }
            None => false,
        }
    }

    pub fn queue_sanction(&self, request: SanctionRequest) -> bool {
        match self.data().actor_mut(request.target) {
            Some(actor) => {
                actor.latest_sanctions.push_back(request);
                true
            }
            None => false,
        }
    }

    pub fn latest_sanctions(&self, id: Identifier) -> Option<VecDeque<SanctionRequest>> {
        self.actor(id).map(|actor| actor.latest_sanctions)
    }

    pub fn reset_latest_sanctions(&self, id: Identifier) {
        if let Some(actor) = self.data().actor_mut(id) {
            actor.reset_latest_sanctions();
        }
    }

    pub fn set_trust_game_ledger(&self, id: Identifier, ledger: TrustGameLedger) {
        if let Some(actor) = self.data().actor_mut(id) {
            actor.trust_game = ledger;
        }
    }

    pub fn imposed_strategy(&self) -> Option<Strategy> {
        self.data().imposed_strategy
    }

    pub fn set_imposed_strategy(&self, strategy: Option<Strategy>) {
        self.data().imposed_strategy = strategy;
    }

    pub fn add_resource(&self, resource: Resource) {
        self.data().resources.add(resource);
    }

    pub fn add_resources<I>(&self, resources: I)
    where
        I: IntoIterator<Item = Resource>,
    {
        self.data().resources.add_all(resources);
    }

    pub fn move_resource(&self, from: Point, to: Point) {
        self.data().resources.relocate(from, to);
    }

    /// Batch relocation: every addition lands before any removal.
    pub fn move_resources(&self, removed: &[Point], added: &[Point]) {
        let mut data = self.data();
        for position in added {
            data.resources.add(Resource::new(*position));
        }
        for position in removed {
            if !added.contains(position) {
                data.resources.remove(*position);
            }
        }
    }

    pub fn resource_positions(&self) -> BTreeSet<Point> {
        self.data().resources.positions()
    }

    pub fn resource_count(&self) -> usize {
        self.data().resources.len()
    }

    pub fn resource(&self, position: Point) -> Option<Resource> {
        self.data().resources.get(position).cloned()
    }

    pub fn lock_resource(&self, id: Identifier, position: Point) -> bool {
        self.data().resources.lock(position, id)
    }

    pub fn unlock_resource(&self, id: Identifier, position: Point) -> bool {
        self.data().resources.unlock(position, id)
    }

    /// Removes the token at `position` and credits `id`, unless another
    /// member holds its lock.
    pub fn harvest_resource(&self, id: Identifier, position: Point) -> bool {
        let mut data = self.data();
        if data.resources.harvest(position, id).is_none() {
            return false;
        }
        data.credit_token(id);
        true
    }

    pub fn harvest_fruits(&self, id: Identifier, position: Point) -> bool {
        self.harvest_resource(id, position)
    }

    /// Real-time pickup at the member's current position.
    pub fn collect_token(&self, id: Identifier) -> Option<Point> {
        let mut data = self.data();
        let position = data.actor_mut(id)?.position;
        data.resources.harvest(position, id)?;
        data.credit_token(id);
        Some(position)
    }

    /// Replays a recorded collection: the token goes regardless of locks and
    /// the recorded collector is credited if it is a member.
    pub fn remove_collected_token(&self, id: Identifier, position: Point) -> bool {
        let mut data = self.data();
        if data.resources.take(position, id).is_none() {
            warn!("No token at {} in {} to collect for {}", position, self.id, id);
            return false;
        }
        data.credit_token(id);
        true
    }

    pub fn reset_resource_distribution(&self) {
        self.data().resources.reset_distribution();
    }

    /// Re-places every client by the spacing rule and repairs group links
    /// that disagree with this group.
    pub fn initialize_positions(&self, config: &RoundConfiguration) {
        let mut data = self.data();
        for actor in data.actors.iter_mut().filter(|actor| !actor.is_bot()) {
            actor.initialize_position(config);
            if actor.group != Some(self.id) {
                warn!(
                    "{} had group {:?} but belongs to {}, repairing",
                    actor.id, actor.group, self.id
                );
                actor.group = Some(self.id);
            }
        }
    }

    pub fn cleanup_round(&self) {
        let mut data = self.data();
        data.resources.clear();
        for actor in data.actors.iter_mut() {
            actor.cleanup_round();
        }
    }

    pub fn clear(&self) {
        let mut data = self.data();
        data.actors.clear();
        data.resources.clear();
        data.imposed_strategy = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> RoundConfiguration {
        RoundConfiguration {
            board_width: 20,
            board_height: 10,
            clients_per_group: capacity,
            ..RoundConfiguration::default()
        }
    }

    #[test]
    fn test_add_actor_assigns_slot_and_handle() {
        let group = Group::new(GroupId(0));
        let config = config(3);

        let first = group.add_actor(Actor::new(Identifier::Client(1)), &config);
        let second = group.add_actor(Actor::new(Identifier::Client(2)), &config);

        assert_eq!(first.assigned_number, 1);
        assert_eq!(second.assigned_number, 2);
        assert_eq!(first.chat_handle.as_deref(), Some("A"));
        assert_eq!(second.chat_handle.as_deref(), Some("B"));
        assert_eq!(second.group, Some(GroupId(0)));
        assert_eq!(first.position, Point::new(5, 5));
        assert_eq!(second.position, Point::new(10, 5));
    }

    #[test]
    fn test_is_full() {
        let group = Group::new(GroupId(0));
        let config = config(2);
        group.add_actor(Actor::new(Identifier::Client(1)), &config);
        assert!(!group.is_full(&config));
        group.add_actor(Actor::new(Identifier::Client(2)), &config);
        assert!(group.is_full(&config));
    }

    #[test]
    fn test_readding_member_does_not_duplicate() {
        let group = Group::new(GroupId(0));
        let config = config(4);
        group.add_actor(Actor::new(Identifier::Client(1)), &config);
        group.add_actor(Actor::new(Identifier::Client(1)), &config);
        assert_eq!(group.size(), 1);
    }

    #[test]
    fn test_remove_actor_releases_locks() {
        let group = Group::new(GroupId(0));
        let config = config(4);
        group.add_actor(Actor::new(Identifier::Client(1)), &config);
        group.add_resource(Resource::new(Point::new(2, 2)));
        assert!(group.lock_resource(Identifier::Client(1), Point::new(2, 2)));

        let removed = group.remove_actor(Identifier::Client(1)).unwrap();

        assert!(removed.group.is_none());
        assert!(group.is_empty());
        assert_eq!(group.resource(Point::new(2, 2)).unwrap().lock_owner, None);
    }

    #[test]
    fn test_move_actor_stays_on_board() {
        let group = Group::new(GroupId(0));
        let config = config(4);
        let id = Identifier::Client(1);
        group.add_actor(Actor::new(id), &config);
        group.set_position(id, Point::new(0, 0));

        assert_eq!(group.move_actor(id, Direction::Left, &config), Some(Point::new(0, 0)));
        assert_eq!(group.move_actor(id, Direction::Down, &config), Some(Point::new(0, 1)));
        assert_eq!(group.move_actor(Identifier::Client(9), Direction::Down, &config), None);
    }

    #[test]
    fn test_collect_token_at_current_position() {
        let group = Group::new(GroupId(0));
        let config = config(4);
        let id = Identifier::Client(1);
        let placed = group.add_actor(Actor::new(id), &config);
        group.add_resource(Resource::new(placed.position));

        assert_eq!(group.collect_token(id), Some(placed.position));
        assert_eq!(group.current_tokens(id), Some(1));
        assert_eq!(group.collect_token(id), None);
        assert_eq!(group.current_tokens(id), Some(1));
    }

    #[test]
    fn test_harvest_blocked_by_other_lock() {
        let group = Group::new(GroupId(0));
        let config = config(4);
        let alice = Identifier::Client(1);
        let bob = Identifier::Client(2);
        group.add_actor(Actor::new(alice), &config);
        group.add_actor(Actor::new(bob), &config);
        group.add_resource(Resource::new(Point::new(7, 7)));
        group.lock_resource(alice, Point::new(7, 7));

        assert!(!group.harvest_resource(bob, Point::new(7, 7)));
        assert!(group.harvest_fruits(alice, Point::new(7, 7)));
        assert_eq!(group.current_tokens(alice), Some(1));
        assert_eq!(group.current_tokens(bob), Some(0));
    }

    #[test]
    fn test_move_resources_adds_before_removing() {
        let group = Group::new(GroupId(0));
        group.add_resources(vec![Resource::new(Point::new(1, 1)), Resource::new(Point::new(2, 2))]);

        group.move_resources(
            &[Point::new(1, 1), Point::new(2, 2)],
            &[Point::new(2, 2), Point::new(3, 3)],
        );

        let positions: Vec<Point> = group.resource_positions().into_iter().collect();
        assert_eq!(positions, vec![Point::new(2, 2), Point::new(3, 3)]);
    }

    #[test]
    fn test_initialize_positions_repairs_group_link() {
        let group = Group::new(GroupId(3));
        let config = config(4);
        let mut stray = Actor::new(Identifier::Client(1));
        stray.group = Some(GroupId(9));
        stray.assigned_number = 1;
        let mut snapshot = group.snapshot();
        snapshot.actors.push(stray);
        let group = Group::from_snapshot(snapshot);

        group.initialize_positions(&config);

        let actor = group.actor(Identifier::Client(1)).unwrap();
        assert_eq!(actor.group, Some(GroupId(3)));
        assert_eq!(actor.position, Point::new(4, 5));
    }

    #[test]
    fn test_cleanup_round_keeps_members() {
        let group = Group::new(GroupId(0));
        let config = config(4);
        let id = Identifier::Client(1);
        let placed = group.add_actor(Actor::new(id), &config);
        group.add_resource(Resource::new(placed.position));
        group.collect_token(id);
        group.add_resource(Resource::new(Point::new(0, 0)));

        group.cleanup_round();

        assert_eq!(group.size(), 1);
        assert_eq!(group.resource_count(), 0);
        assert_eq!(group.current_tokens(id), Some(0));
    }
}
