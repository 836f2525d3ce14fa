//! Authoritative server state
//!
//! `ServerState` owns the identifier to group mapping and the group registry.
//! Every transition is expressed as a [`GameEvent`]; live operations build the
//! event, run it through [`ServerState::apply`] and announce it on the event
//! channel, so a recorded session replays through the same code.
//!
//! Locking: membership changes are serialized by the membership mutex, group
//! contents by each group's own mutex. The membership lock is always taken
//! first and events are emitted after every lock is released.

use crate::actor::{Actor, SanctionRequest};
use crate::config::RoundConfiguration;
use crate::error::{Result, ServerError};
use crate::events::{EventChannel, GameEvent, NullEventChannel, ResourceRequest};
use crate::group::{Group, GroupId, GroupSnapshot};
use crate::resource::Resource;
use crate::strategy::{self, StrategyDistribution};
use crate::trust_game::{self, TrustGameResult};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use shared::{Direction, Identifier, Point, Strategy};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Persistent part of the server state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub groups: Vec<GroupSnapshot>,
    pub imposed_strategy_distribution: StrategyDistribution,
}

#[derive(Debug, Default)]
struct Membership {
    /// Clients only; bots are found by scanning group membership
    clients_to_groups: HashMap<Identifier, GroupId>,
    groups: BTreeMap<GroupId, Arc<Group>>,
    next_group_id: u32,
}

impl Membership {
    fn group_of(&self, id: Identifier) -> Option<Arc<Group>> {
        if let Some(group_id) = self.clients_to_groups.get(&id) {
            if let Some(group) = self.groups.get(group_id) {
                return Some(Arc::clone(group));
            }
        }
        self.groups
            .values()
            .find(|group| group.contains(id))
            .cloned()
    }

    fn create_group(&mut self) -> Arc<Group> {
        let id = GroupId(self.next_group_id);
        self.group_or_create(id)
    }

    fn group_or_create(&mut self, id: GroupId) -> Arc<Group> {
        self.next_group_id = self.next_group_id.max(id.0 + 1);
        Arc::clone(self.groups.entry(id).or_insert_with(|| {
            info!("Created {}", id);
            Arc::new(Group::new(id))
        }))
    }

    fn first_open_group(&mut self, config: &RoundConfiguration) -> Arc<Group> {
        match self.groups.values().find(|group| !group.is_full(config)) {
            Some(group) => Arc::clone(group),
            None => self.create_group(),
        }
    }

    /// Moves `actor` into `group`, leaving any group it was in before.
    fn attach(&mut self, group: &Group, actor: Actor, config: &RoundConfiguration) -> Actor {
        let id = actor.id;
        if let Some(previous) = self.group_of(id) {
            if previous.id() != group.id() {
                debug!("Moving {} out of {}", id, previous.id());
                previous.remove_actor(id);
            }
        }
        let placed = group.add_actor(actor, config);
        if !id.is_bot() {
            self.clients_to_groups.insert(id, group.id());
        }
        placed
    }
}

pub struct ServerState {
    membership: Mutex<Membership>,
    config: RwLock<RoundConfiguration>,
    imposed_strategy_distribution: Mutex<StrategyDistribution>,
    dirty: AtomicBool,
    rng: Mutex<StdRng>,
    channel: RwLock<Arc<dyn EventChannel>>,
}

impl ServerState {
    pub fn new(config: RoundConfiguration, channel: Arc<dyn EventChannel>) -> Self {
        Self::with_rng(config, channel, StdRng::from_entropy())
    }

    /// Builds a state drawing all randomness from `rng`.
    pub fn with_rng(
        config: RoundConfiguration,
        channel: Arc<dyn EventChannel>,
        rng: StdRng,
    ) -> Self {
        Self {
            membership: Mutex::new(Membership::default()),
            config: RwLock::new(config),
            imposed_strategy_distribution: Mutex::new(StrategyDistribution::new()),
            dirty: AtomicBool::new(false),
            rng: Mutex::new(rng),
            channel: RwLock::new(channel),
        }
    }

    /// Rehydrates a snapshot with a fresh random source and `channel`.
    pub fn from_snapshot(
        snapshot: ServerSnapshot,
        config: RoundConfiguration,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        let state = Self::new(config, channel);
        {
            let mut membership = state.membership();
            for group_snapshot in snapshot.groups {
                let group = Arc::new(Group::from_snapshot(group_snapshot));
                for id in group.client_identifiers() {
                    membership.clients_to_groups.insert(id, group.id());
                }
                membership.next_group_id = membership.next_group_id.max(group.id().0 + 1);
                membership.groups.insert(group.id(), group);
            }
        }
        *state.strategy_distribution() = snapshot.imposed_strategy_distribution;
        state
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let groups = self
            .ordered_groups()
            .iter()
            .map(|group| group.snapshot())
            .collect();
        ServerSnapshot {
            groups,
            imposed_strategy_distribution: self.strategy_distribution().clone(),
        }
    }

    fn membership(&self) -> MutexGuard<'_, Membership> {
        self.membership
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn strategy_distribution(&self) -> MutexGuard<'_, StrategyDistribution> {
        self.imposed_strategy_distribution
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> RoundConfiguration {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_round_configuration(&self, config: RoundConfiguration) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    pub fn is_last_round(&self) -> bool {
        self.config().last_round
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    pub fn set_channel(&self, channel: Arc<dyn EventChannel>) {
        *self
            .channel
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = channel;
    }

    pub fn set_null_event_channel(&self) {
        self.set_channel(Arc::new(NullEventChannel));
    }

    fn emit(&self, event: &GameEvent) {
        let channel = self
            .channel
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        channel.handle(event);
    }

    /// Applies `event` and announces it.
    fn perform(&self, event: GameEvent) -> Result<()> {
        self.apply(&event)?;
        self.emit(&event);
        Ok(())
    }

    fn group_for(&self, id: Identifier) -> Result<Arc<Group>> {
        self.membership()
            .group_of(id)
            .ok_or(ServerError::NoGroupForClient(id))
    }

    fn require_group(&self, id: GroupId) -> Result<Arc<Group>> {
        self.group_by_id(id).ok_or(ServerError::UnknownGroup(id))
    }

    /// Performs the state transition recorded in `event`.
    ///
    /// Used for live traffic and replay alike. Nothing is emitted. Event kinds
    /// without a transition are logged and skipped.
    pub fn apply(&self, event: &GameEvent) -> Result<()> {
        debug!("Applying {}", event.kind());
        match event {
            GameEvent::ClientAdded {
                actor,
                group,
                position,
            } => {
                let config = self.config();
                let mut membership = self.membership();
                let group = membership.group_or_create(*group);
                membership.attach(&group, actor.clone(), &config);
                group.set_position(actor.id, *position);
            }
            GameEvent::ClientRemoved { id } => {
                self.detach(*id).ok_or(ServerError::NoGroupForClient(*id))?;
            }
            GameEvent::ResourcesAdded { group, resources } => {
                self.require_group(*group)?
                    .add_resources(resources.iter().cloned());
                self.set_dirty(true);
            }
            GameEvent::ResourceAdded { group, resource } => {
                self.require_group(*group)?.add_resource(resource.clone());
                self.set_dirty(true);
            }
            GameEvent::Movement { id, direction } => {
                let config = self.config();
                self.group_for(*id)?
                    .move_actor(*id, *direction, &config)
                    .ok_or(ServerError::NoGroupForClient(*id))?;
                self.set_dirty(true);
            }
            GameEvent::RealTimeSanction(_) => {
                self.set_dirty(true);
            }
            GameEvent::ResetTokenDistribution { id } => {
                self.group_for(*id)?.reset_resource_distribution();
                self.set_dirty(true);
            }
            GameEvent::TokenCollected { id, location } => {
                self.group_for(*id)?.remove_collected_token(*id, *location);
                self.set_dirty(true);
            }
            GameEvent::ExplicitCollectionMode { id, explicit } => {
                self.group_for(*id)?
                    .set_explicit_collection_mode(*id, *explicit);
            }
            GameEvent::TokenMoved { group, from, to } => {
                self.require_group(*group)?.move_resource(*from, *to);
                self.set_dirty(true);
            }
            GameEvent::TokensMoved {
                group,
                removed,
                added,
            } => {
                self.require_group(*group)?.move_resources(removed, added);
                self.set_dirty(true);
            }
            GameEvent::LockResource { request, granted } => {
                if *granted {
                    self.group_for(request.id)?
                        .lock_resource(request.id, request.position);
                }
            }
            GameEvent::UnlockResource(request) => {
                self.group_for(request.id)?
                    .unlock_resource(request.id, request.position);
            }
            GameEvent::ShowImposedStrategy { id, strategy } => {
                self.group_for(*id)?.set_imposed_strategy(*strategy);
            }
            GameEvent::Unknown { kind } => {
                warn!("Did not apply unknown event kind {}", kind);
            }
        }
        Ok(())
    }

    /// Reversal is not supported; the event is only logged.
    pub fn unapply(&self, event: &GameEvent) {
        warn!("unapply is not implemented, ignoring {}", event.kind());
    }

    /// Adds `actor` to the first group with room, creating one if all are full.
    pub fn add_client(&self, actor: Actor) -> Actor {
        let config = self.config();
        let (placed, group_id) = {
            let mut membership = self.membership();
            let group = membership.first_open_group(&config);
            (membership.attach(&group, actor, &config), group.id())
        };
        self.client_added(&placed, group_id);
        placed
    }

    /// Adds `actor` to a specific group regardless of its capacity.
    pub fn add_client_to_group(&self, actor: Actor, group_id: GroupId) -> Actor {
        let config = self.config();
        let placed = {
            let mut membership = self.membership();
            let group = membership.group_or_create(group_id);
            membership.attach(&group, actor, &config)
        };
        self.client_added(&placed, group_id);
        placed
    }

    /// Bots join like clients but are never entered in the client map.
    pub fn add_bot_to_group(&self, bot: Actor, group_id: GroupId) -> Actor {
        if !bot.is_bot() {
            warn!("{} is not a bot but was added as one", bot.id);
        }
        self.add_client_to_group(bot, group_id)
    }

    fn client_added(&self, actor: &Actor, group: GroupId) {
        info!("{} joined {}", actor, group);
        self.emit(&GameEvent::ClientAdded {
            actor: actor.clone(),
            group,
            position: actor.position,
        });
    }

    /// Removes `id` from its group. The group stays registered even if it is
    /// now empty.
    pub fn remove_client(&self, id: Identifier) -> Option<Actor> {
        let removed = self.detach(id);
        match &removed {
            Some(actor) => {
                info!("{} left the session", actor);
                self.emit(&GameEvent::ClientRemoved { id });
            }
            None => warn!("{} was not in any group", id),
        }
        removed
    }

    /// Drops `id` from the client map and its group, releasing its locks.
    fn detach(&self, id: Identifier) -> Option<Actor> {
        let mut membership = self.membership();
        let group = membership.group_of(id);
        membership.clients_to_groups.remove(&id);
        group.and_then(|group| group.remove_actor(id))
    }

    /// Group containing `id`, if any.
    pub fn group(&self, id: Identifier) -> Option<Arc<Group>> {
        let group = self.membership().group_of(id);
        if group.is_none() {
            warn!("No group found for {}", id);
        }
        group
    }

    pub fn group_by_id(&self, id: GroupId) -> Option<Arc<Group>> {
        self.membership().groups.get(&id).cloned()
    }

    /// Groups in creation order.
    pub fn ordered_groups(&self) -> Vec<Arc<Group>> {
        self.membership().groups.values().cloned().collect()
    }

    pub fn number_of_groups(&self) -> usize {
        self.membership().groups.len()
    }

    pub fn number_of_clients(&self) -> usize {
        self.membership().clients_to_groups.len()
    }

    pub fn add_resource(&self, group: GroupId, resource: Resource) -> Result<()> {
        self.perform(GameEvent::ResourceAdded { group, resource })
    }

    pub fn add_resources(&self, group: GroupId, resources: Vec<Resource>) -> Result<()> {
        self.perform(GameEvent::ResourcesAdded { group, resources })
    }

    /// Moves the token at `from` to `to` within `group`.
    pub fn move_resource(&self, group: GroupId, from: Point, to: Point) -> Result<()> {
        self.perform(GameEvent::TokenMoved { group, from, to })
    }

    pub fn move_resources(
        &self,
        group: GroupId,
        removed: Vec<Point>,
        added: Vec<Point>,
    ) -> Result<()> {
        self.perform(GameEvent::TokensMoved {
            group,
            removed,
            added,
        })
    }

    /// Tries to lock the token at the requested position for the requester.
    pub fn lock_resource(&self, request: &ResourceRequest) -> Result<bool> {
        let granted = self
            .group_for(request.id)?
            .lock_resource(request.id, request.position);
        debug!(
            "{} lock on {}: {}",
            request.id,
            request.position,
            if granted { "granted" } else { "denied" }
        );
        self.emit(&GameEvent::LockResource {
            request: *request,
            granted,
        });
        Ok(granted)
    }

    pub fn unlock_resource(&self, request: &ResourceRequest) -> Result<bool> {
        let released = self
            .group_for(request.id)?
            .unlock_resource(request.id, request.position);
        if released {
            self.emit(&GameEvent::UnlockResource(*request));
        }
        Ok(released)
    }

    pub fn harvest_resource(&self, request: &ResourceRequest) -> Result<bool> {
        let harvested = self
            .group_for(request.id)?
            .harvest_resource(request.id, request.position);
        self.token_collected(request, harvested);
        Ok(harvested)
    }

    pub fn harvest_fruits(&self, request: &ResourceRequest) -> Result<bool> {
        let harvested = self
            .group_for(request.id)?
            .harvest_fruits(request.id, request.position);
        self.token_collected(request, harvested);
        Ok(harvested)
    }

    fn token_collected(&self, request: &ResourceRequest, harvested: bool) {
        if harvested {
            self.set_dirty(true);
            self.emit(&GameEvent::TokenCollected {
                id: request.id,
                location: request.position,
            });
        }
    }

    /// Collects the token under the actor, if there is one.
    pub fn collect_token(&self, id: Identifier) -> Result<Option<Point>> {
        let collected = {
            let membership = self.membership();
            let group = membership
                .group_of(id)
                .ok_or(ServerError::NoGroupForClient(id))?;
            group.collect_token(id)
        };
        if let Some(location) = collected {
            self.set_dirty(true);
            self.emit(&GameEvent::TokenCollected { id, location });
        }
        Ok(collected)
    }

    pub fn move_client(&self, id: Identifier, direction: Direction) -> Result<()> {
        self.perform(GameEvent::Movement { id, direction })
    }

    pub fn reset_token_distribution(&self, id: Identifier) -> Result<()> {
        self.perform(GameEvent::ResetTokenDistribution { id })
    }

    pub fn set_explicit_collection_mode(&self, id: Identifier, explicit: bool) -> Result<()> {
        self.perform(GameEvent::ExplicitCollectionMode { id, explicit })
    }

    /// Queues a sanction on the target's record.
    pub fn record_sanction(&self, request: SanctionRequest) -> Result<()> {
        if !self.group_for(request.target)?.queue_sanction(request) {
            return Err(ServerError::NoGroupForClient(request.target));
        }
        self.perform(GameEvent::RealTimeSanction(request))
    }

    pub fn latest_sanctions(&self, id: Identifier) -> Option<VecDeque<SanctionRequest>> {
        self.group(id)?.latest_sanctions(id)
    }

    pub fn reset_sanction_count(&self, id: Identifier) {
        if let Some(group) = self.group(id) {
            group.reset_latest_sanctions(id);
        }
    }

    pub fn client_position(&self, id: Identifier) -> Result<Point> {
        self.group_for(id)?
            .client_position(id)
            .ok_or(ServerError::NoGroupForClient(id))
    }

    /// Positions of every member of the group `id` belongs to.
    pub fn client_positions(&self, id: Identifier) -> Result<HashMap<Identifier, Point>> {
        Ok(self.group_for(id)?.client_positions())
    }

    pub fn tokens_consumed_by(&self, id: Identifier) -> Option<u32> {
        self.group(id)?.current_tokens(id)
    }

    /// Live token positions in the group `id` belongs to.
    pub fn resource_positions(&self, id: Identifier) -> Option<BTreeSet<Point>> {
        Some(self.group(id)?.resource_positions())
    }

    pub fn client_data(&self, id: Identifier) -> Option<Actor> {
        self.group(id)?.actor(id)
    }

    pub fn client_data_map(&self) -> HashMap<Identifier, Actor> {
        self.ordered_groups()
            .iter()
            .flat_map(|group| group.client_map())
            .collect()
    }

    pub fn bot_map(&self) -> HashMap<Identifier, Actor> {
        self.ordered_groups()
            .iter()
            .flat_map(|group| group.bot_map())
            .collect()
    }

    /// Clients and bots together.
    pub fn actor_map(&self) -> HashMap<Identifier, Actor> {
        self.ordered_groups()
            .iter()
            .flat_map(|group| group.actors())
            .map(|actor| (actor.id, actor))
            .collect()
    }

    pub fn all_client_identifiers(&self) -> Vec<Identifier> {
        self.ordered_groups()
            .iter()
            .flat_map(|group| group.client_identifiers())
            .collect()
    }

    /// Clears tokens, locks, tallies and sanctions in every group. Membership
    /// is kept.
    pub fn cleanup_round(&self) {
        for group in self.ordered_groups() {
            group.cleanup_round();
        }
    }

    /// Empties every group and the client map. Groups stay registered.
    pub fn clear(&self) {
        let mut membership = self.membership();
        for group in membership.groups.values() {
            group.clear();
        }
        membership.clients_to_groups.clear();
    }

    pub fn reset_group_resource_distributions(&self) {
        for group in self.ordered_groups() {
            group.reset_resource_distribution();
        }
    }

    /// Prepares the state for replay under `config`: events are no longer
    /// announced, tokens are dropped and clients go back to their start
    /// positions.
    pub fn reinitialize(&self, config: RoundConfiguration) {
        self.set_null_event_channel();
        for group in self.ordered_groups() {
            group.reset_resource_distribution();
            group.initialize_positions(&config);
        }
        self.set_round_configuration(config);
    }

    /// Uniformly random cell on the current board.
    pub fn create_random_point(&self) -> Point {
        let config = self.config();
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Point::new(
            rng.gen_range(0..config.board_width.max(1)),
            rng.gen_range(0..config.board_height.max(1)),
        )
    }

    pub fn imposed_strategy_distribution(&self) -> StrategyDistribution {
        self.strategy_distribution().clone()
    }

    pub fn set_imposed_strategy_distribution(&self, distribution: StrategyDistribution) {
        *self.strategy_distribution() = distribution;
    }

    /// Imposes strategies on groups according to `distribution`.
    ///
    /// Fails without touching any group if the distribution is empty or asks
    /// for more impositions than there are groups.
    pub fn allocate_imposed_strategy_distribution(
        &self,
        distribution: &StrategyDistribution,
    ) -> Result<Vec<(GroupId, Option<Strategy>)>> {
        let membership = self.membership();
        let ordered: Vec<GroupId> = membership.groups.keys().copied().collect();
        let assignments = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            strategy::allocate(&ordered, distribution, &mut *rng)?
        };
        for (group_id, strategy) in &assignments {
            if let Some(group) = membership.groups.get(group_id) {
                group.set_imposed_strategy(*strategy);
            }
            match strategy {
                Some(strategy) => info!("{} will {}", group_id, strategy),
                None => debug!("{} has no imposed strategy", group_id),
            }
        }
        Ok(assignments)
    }

    /// Allocates the stored distribution.
    pub fn allocate_pending_strategy_distribution(
        &self,
    ) -> Result<Vec<(GroupId, Option<Strategy>)>> {
        let distribution = self.imposed_strategy_distribution();
        self.allocate_imposed_strategy_distribution(&distribution)
    }

    /// Tells every client which strategy its group was given.
    pub fn show_imposed_strategies(&self) {
        for group in self.ordered_groups() {
            let strategy = group.imposed_strategy();
            for id in group.client_identifiers() {
                self.emit(&GameEvent::ShowImposedStrategy { id, strategy });
            }
        }
    }

    /// Plays the trust game between two actors and stores both updated
    /// ledgers.
    pub fn calculate_trust_game(
        &self,
        player_one: Identifier,
        player_two: Identifier,
    ) -> Result<TrustGameResult> {
        let membership = self.membership();
        let first_group = membership
            .group_of(player_one)
            .ok_or(ServerError::NoGroupForClient(player_one))?;
        let second_group = membership
            .group_of(player_two)
            .ok_or(ServerError::NoGroupForClient(player_two))?;
        let mut first = first_group
            .actor(player_one)
            .ok_or(ServerError::NoGroupForClient(player_one))?;
        let mut second = second_group
            .actor(player_two)
            .ok_or(ServerError::NoGroupForClient(player_two))?;

        let result = trust_game::calculate_trust_game(&mut first, &mut second);
        if player_one != player_two {
            first_group.set_trust_game_ledger(player_one, first.trust_game);
            second_group.set_trust_game_ledger(player_two, second.trust_game);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{replay, EventLog};
    use assert_approx_eq::assert_approx_eq;
    use std::thread;

    fn config(capacity: usize) -> RoundConfiguration {
        RoundConfiguration {
            board_width: 20,
            board_height: 10,
            clients_per_group: capacity,
            ..RoundConfiguration::default()
        }
    }

    fn seeded(capacity: usize) -> ServerState {
        ServerState::with_rng(
            config(capacity),
            Arc::new(NullEventChannel),
            StdRng::seed_from_u64(42),
        )
    }

    fn client(index: u32) -> Actor {
        Actor::new(Identifier::Client(index))
    }

    #[test]
    fn test_add_client_fills_groups_in_order() {
        let state = seeded(2);
        for index in 1..=5 {
            state.add_client(client(index));
        }

        assert_eq!(state.number_of_groups(), 3);
        let sizes: Vec<usize> = state.ordered_groups().iter().map(|g| g.size()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(state.group(Identifier::Client(3)).unwrap().id(), GroupId(1));
    }

    #[test]
    fn test_groups_are_disjoint() {
        let state = seeded(3);
        for index in 1..=7 {
            state.add_client(client(index));
        }
        // moving a client explicitly must take it out of its old group
        state.add_client_to_group(client(1), GroupId(2));

        let mut seen = BTreeSet::new();
        for group in state.ordered_groups() {
            for id in group.client_identifiers() {
                assert!(seen.insert(id), "{} is in two groups", id);
            }
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(state.group(Identifier::Client(1)).unwrap().id(), GroupId(2));
    }

    #[test]
    fn test_remove_client_keeps_group() {
        let state = seeded(2);
        state.add_client(client(1));

        let removed = state.remove_client(Identifier::Client(1)).unwrap();

        assert!(removed.group.is_none());
        assert_eq!(state.number_of_clients(), 0);
        assert_eq!(state.number_of_groups(), 1);
        assert!(state.remove_client(Identifier::Client(1)).is_none());
    }

    #[test]
    fn test_departure_replays_to_live_state() {
        let log = Arc::new(EventLog::new());
        let live = ServerState::with_rng(config(2), log.clone(), StdRng::seed_from_u64(5));
        live.add_client(client(1));
        live.add_client(client(2));
        let position = Point::new(4, 4);
        live.add_resource(GroupId(0), Resource::new(position)).unwrap();
        let request = ResourceRequest {
            id: Identifier::Client(1),
            position,
        };
        assert!(live.lock_resource(&request).unwrap());

        live.remove_client(Identifier::Client(1)).unwrap();
        let third = live.add_client(client(3));

        assert_eq!(third.chat_handle.as_deref(), Some("B"));
        let departures = log
            .events()
            .into_iter()
            .filter(|record| record.event.kind() == "client-removed")
            .count();
        assert_eq!(departures, 1);

        let replayed = ServerState::new(config(2), Arc::new(NullEventChannel));
        replay(&replayed, &log.events()).unwrap();

        assert_eq!(replayed.snapshot(), live.snapshot());
        assert_eq!(replayed.number_of_clients(), 2);
        let group = replayed.group_by_id(GroupId(0)).unwrap();
        assert_eq!(group.size(), 2);
        assert_eq!(group.resource(position).unwrap().lock_owner, None);
    }

    #[test]
    fn test_replayed_departure_of_unknown_client_fails() {
        let state = seeded(2);
        assert!(matches!(
            state.apply(&GameEvent::ClientRemoved {
                id: Identifier::Client(7)
            }),
            Err(ServerError::NoGroupForClient(_))
        ));
    }

    #[test]
    fn test_empty_board_does_not_panic() {
        let config = RoundConfiguration {
            board_width: 0,
            board_height: 0,
            clients_per_group: 2,
            ..RoundConfiguration::default()
        };
        let state = ServerState::new(config, Arc::new(NullEventChannel));

        let placed = state.add_client(client(1));
        state.move_client(Identifier::Client(1), Direction::Left).unwrap();

        assert_eq!(placed.position, Point::new(0, 0));
        assert_eq!(state.client_position(Identifier::Client(1)).unwrap(), Point::new(0, 0));
    }

    #[test]
    fn test_client_data_map_excludes_bots() {
        let state = seeded(2);
        state.add_client(client(1));
        state.add_client(client(2));
        state.add_client(client(3));
        state.add_bot_to_group(Actor::new(Identifier::Bot(1)), GroupId(1));

        let clients = state.client_data_map();

        assert_eq!(clients.len(), 3);
        assert!(!clients.contains_key(&Identifier::Bot(1)));
        assert_eq!(clients[&Identifier::Client(3)].group, Some(GroupId(1)));
    }

    #[test]
    fn test_is_last_round_follows_configuration() {
        let state = seeded(2);
        assert!(!state.is_last_round());

        state.set_round_configuration(RoundConfiguration {
            last_round: true,
            ..config(2)
        });

        assert!(state.is_last_round());
    }

    #[test]
    fn test_bots_are_found_without_client_map() {
        let state = seeded(4);
        state.add_client(client(1));
        state.add_bot_to_group(Actor::new(Identifier::Bot(1)), GroupId(0));

        assert_eq!(state.number_of_clients(), 1);
        assert_eq!(state.bot_map().len(), 1);
        assert_eq!(state.actor_map().len(), 2);
        assert!(state.client_position(Identifier::Bot(1)).is_ok());
        assert_eq!(state.client_positions(Identifier::Client(1)).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_client_is_an_error() {
        let state = seeded(2);
        assert!(matches!(
            state.client_position(Identifier::Client(9)),
            Err(ServerError::NoGroupForClient(_))
        ));
        assert!(state.move_client(Identifier::Client(9), Direction::Up).is_err());
        assert!(state.tokens_consumed_by(Identifier::Client(9)).is_none());
    }

    #[test]
    fn test_collect_token_credits_actor() {
        let state = seeded(2);
        let placed = state.add_client(client(1));
        state
            .add_resource(GroupId(0), Resource::new(placed.position))
            .unwrap();

        assert_eq!(
            state.collect_token(Identifier::Client(1)).unwrap(),
            Some(placed.position)
        );
        assert_eq!(state.tokens_consumed_by(Identifier::Client(1)), Some(1));
        assert!(state.is_dirty());
    }

    #[test]
    fn test_events_are_emitted() {
        let log = Arc::new(EventLog::new());
        let state = ServerState::with_rng(config(2), log.clone(), StdRng::seed_from_u64(1));

        state.add_client(client(1));
        state.move_client(Identifier::Client(1), Direction::Right).unwrap();
        state
            .add_resource(GroupId(0), Resource::new(Point::new(0, 0)))
            .unwrap();

        let kinds: Vec<String> = log
            .events()
            .iter()
            .map(|record| record.event.kind().to_string())
            .collect();
        assert_eq!(kinds, vec!["client-added", "movement", "resource-added"]);
    }

    #[test]
    fn test_apply_client_added_creates_recorded_group() {
        let state = seeded(2);
        let mut actor = client(4);
        actor.chat_handle = Some("A".to_string());

        state
            .apply(&GameEvent::ClientAdded {
                actor,
                group: GroupId(3),
                position: Point::new(7, 2),
            })
            .unwrap();

        assert_eq!(state.group(Identifier::Client(4)).unwrap().id(), GroupId(3));
        assert_eq!(state.client_position(Identifier::Client(4)).unwrap(), Point::new(7, 2));
        assert!(!state.is_dirty());
        // the next lazily created group follows the recorded one
        state.add_client(client(5));
        state.add_client(client(6));
        assert!(state.group_by_id(GroupId(4)).is_some());
    }

    #[test]
    fn test_collection_mode_does_not_mark_dirty() {
        let state = seeded(2);
        state.add_client(client(1));

        state
            .set_explicit_collection_mode(Identifier::Client(1), true)
            .unwrap();

        assert!(!state.is_dirty());
        assert!(state.client_data(Identifier::Client(1)).unwrap().explicit_collection_mode);
    }

    #[test]
    fn test_sanction_marks_dirty_and_queues() {
        let state = seeded(2);
        state.add_client(client(1));
        state.add_client(client(2));
        let request = SanctionRequest {
            source: Identifier::Client(1),
            target: Identifier::Client(2),
        };

        state.record_sanction(request).unwrap();

        assert!(state.is_dirty());
        assert_eq!(state.latest_sanctions(Identifier::Client(2)).unwrap().len(), 1);
        state.reset_sanction_count(Identifier::Client(2));
        assert!(state.latest_sanctions(Identifier::Client(2)).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_event_is_tolerated() {
        let state = seeded(2);
        state.add_client(client(1));
        let before = state.snapshot();

        let result = state.apply(&GameEvent::Unknown {
            kind: "chat-request".to_string(),
        });

        assert!(result.is_ok());
        assert_eq!(state.snapshot(), before);
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_unapply_changes_nothing() {
        let state = seeded(2);
        state.add_client(client(1));
        let before = state.snapshot();

        state.unapply(&GameEvent::Movement {
            id: Identifier::Client(1),
            direction: Direction::Up,
        });

        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_allocation_respects_quota() {
        let state = seeded(1);
        for index in 1..=3 {
            state.add_client(client(index));
        }
        let mut distribution = StrategyDistribution::new();
        distribution.insert(Strategy::HarvestSlowly, 2);
        distribution.insert(Strategy::SplitTerritory, 1);

        state
            .allocate_imposed_strategy_distribution(&distribution)
            .unwrap();

        let strategies: Vec<Option<Strategy>> = state
            .ordered_groups()
            .iter()
            .map(|group| group.imposed_strategy())
            .collect();
        let slowly = strategies
            .iter()
            .filter(|s| **s == Some(Strategy::HarvestSlowly))
            .count();
        let split = strategies
            .iter()
            .filter(|s| **s == Some(Strategy::SplitTerritory))
            .count();
        assert_eq!((slowly, split), (2, 1));
    }

    #[test]
    fn test_over_quota_allocation_touches_nothing() {
        let state = seeded(1);
        for index in 1..=3 {
            state.add_client(client(index));
        }
        state.group_by_id(GroupId(0)).unwrap().set_imposed_strategy(Some(Strategy::WaitBeforeHarvest));
        let mut distribution = StrategyDistribution::new();
        distribution.insert(Strategy::HarvestSlowly, 2);
        distribution.insert(Strategy::SplitTerritory, 2);

        let result = state.allocate_imposed_strategy_distribution(&distribution);

        assert!(matches!(result, Err(ServerError::StrategyQuotaExceeded { .. })));
        let strategies: Vec<Option<Strategy>> = state
            .ordered_groups()
            .iter()
            .map(|group| group.imposed_strategy())
            .collect();
        assert_eq!(strategies, vec![Some(Strategy::WaitBeforeHarvest), None, None]);
    }

    #[test]
    fn test_pending_distribution_must_be_set() {
        let state = seeded(1);
        state.add_client(client(1));
        assert!(matches!(
            state.allocate_pending_strategy_distribution(),
            Err(ServerError::EmptyStrategyDistribution)
        ));
    }

    #[test]
    fn test_pending_distribution_is_allocated() {
        let state = seeded(1);
        for index in 1..=3 {
            state.add_client(client(index));
        }
        let mut distribution = StrategyDistribution::new();
        distribution.insert(Strategy::HarvestSlowly, 1);
        distribution.insert(Strategy::SplitTerritory, 1);
        state.set_imposed_strategy_distribution(distribution.clone());

        let assignments = state.allocate_pending_strategy_distribution().unwrap();

        assert_eq!(state.imposed_strategy_distribution(), distribution);
        assert_eq!(assignments.len(), 3);
        assert_eq!(assignments.iter().filter(|(_, s)| s.is_none()).count(), 1);
        for (group_id, strategy) in assignments {
            assert_eq!(state.group_by_id(group_id).unwrap().imposed_strategy(), strategy);
        }
    }

    #[test]
    fn test_show_imposed_strategies_notifies_each_client() {
        let log = Arc::new(EventLog::new());
        let state = ServerState::with_rng(config(2), log.clone(), StdRng::seed_from_u64(1));
        state.add_client(client(1));
        state.add_client(client(2));
        state.add_bot_to_group(Actor::new(Identifier::Bot(1)), GroupId(0));
        state
            .group_by_id(GroupId(0))
            .unwrap()
            .set_imposed_strategy(Some(Strategy::RotateHarvesting));

        state.show_imposed_strategies();

        let shown = log
            .events()
            .into_iter()
            .filter(|record| record.event.kind() == "show-imposed-strategy")
            .count();
        assert_eq!(shown, 2);
    }

    #[test]
    fn test_lock_is_exclusive_across_threads() {
        let state = Arc::new(seeded(2));
        state.add_client(client(1));
        state.add_client(client(2));
        let position = Point::new(3, 3);
        state.add_resource(GroupId(0), Resource::new(position)).unwrap();

        let handles: Vec<_> = (1..=2)
            .map(|index| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    state
                        .lock_resource(&ResourceRequest {
                            id: Identifier::Client(index),
                            position,
                        })
                        .unwrap()
                })
            })
            .collect();
        let granted: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(granted.iter().filter(|g| **g).count(), 1);
        let owner = state
            .group_by_id(GroupId(0))
            .unwrap()
            .resource(position)
            .unwrap()
            .lock_owner;
        assert!(owner.is_some());
    }

    #[test]
    fn test_trust_game_updates_stored_ledgers() {
        let state = seeded(2);
        let mut one = client(1);
        one.trust_game.player_one_amount_to_keep = 0.5;
        let mut two = client(2);
        two.trust_game.player_two_amounts_to_keep = [0.1, 0.2, 0.3, 0.4];
        state.add_client(one);
        state.add_client(two);

        let result = state
            .calculate_trust_game(Identifier::Client(1), Identifier::Client(2))
            .unwrap();

        assert!(result.log.contains("Player 1 kept $0.50"));
        let first = state.client_data(Identifier::Client(1)).unwrap();
        assert_approx_eq!(first.trust_game.earnings, 1.70, 1e-9);
        let stored = state.client_data(Identifier::Client(2)).unwrap();
        assert_eq!(stored.trust_game.log.len(), 1);
        assert_approx_eq!(stored.trust_game.earnings, 0.30, 1e-9);
    }

    #[test]
    fn test_snapshot_round_trip_rebuilds_membership() {
        let state = seeded(2);
        for index in 1..=3 {
            state.add_client(client(index));
        }
        state.add_bot_to_group(Actor::new(Identifier::Bot(1)), GroupId(1));

        let restored = ServerState::from_snapshot(
            state.snapshot(),
            config(2),
            Arc::new(NullEventChannel),
        );

        assert_eq!(restored.snapshot(), state.snapshot());
        assert_eq!(restored.number_of_clients(), 3);
        assert_eq!(restored.group(Identifier::Bot(1)).unwrap().id(), GroupId(1));
    }

    #[test]
    fn test_reinitialize_replaces_clients() {
        let state = seeded(2);
        let placed = state.add_client(client(1));
        state.move_client(Identifier::Client(1), Direction::Up).unwrap();
        state
            .add_resource(GroupId(0), Resource::new(Point::new(1, 1)))
            .unwrap();

        state.reinitialize(config(2));

        assert_eq!(state.client_position(Identifier::Client(1)).unwrap(), placed.position);
        assert!(state.resource_positions(Identifier::Client(1)).unwrap().is_empty());
    }

    #[test]
    fn test_clear_keeps_groups_registered() {
        let state = seeded(1);
        state.add_client(client(1));
        state.add_client(client(2));

        state.clear();

        assert_eq!(state.number_of_groups(), 2);
        assert_eq!(state.number_of_clients(), 0);
        assert!(state.all_client_identifiers().is_empty());
    }

    #[test]
    fn test_random_point_is_on_board() {
        let state = seeded(1);
        for _ in 0..100 {
            let point = state.create_random_point();
            assert!((0..20).contains(&point.x));
            assert!((0..10).contains(&point.y));
        }
    }
}
