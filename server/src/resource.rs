//! Per-group token bookkeeping
//!
//! The registry is keyed by board position, so a position can never hold
//! two live tokens. Harvested tokens are moved to a history list together
//! with the identifier that removed them.

use serde::{Deserialize, Serialize};
use shared::{Identifier, Point};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub position: Point,
    pub lock_owner: Option<Identifier>,
    pub added_by: Option<Identifier>,
    pub removed_by: Option<Identifier>,
}

impl Resource {
    pub fn new(position: Point) -> Self {
        Self {
            position,
            lock_owner: None,
            added_by: None,
            removed_by: None,
        }
    }

    pub fn added_by(position: Point, id: Identifier) -> Self {
        Self {
            added_by: Some(id),
            ..Self::new(position)
        }
    }

    /// True if `id` may harvest this token right now.
    pub fn is_available_to(&self, id: Identifier) -> bool {
        self.lock_owner.map_or(true, |owner| owner == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRegistry {
    live: BTreeMap<Point, Resource>,
    harvested: Vec<Resource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a token. Returns false when the position was already occupied,
    /// in which case the new record replaces the old one.
    pub fn add(&mut self, resource: Resource) -> bool {
        self.live.insert(resource.position, resource).is_none()
    }

    pub fn add_all<I>(&mut self, resources: I)
    where
        I: IntoIterator<Item = Resource>,
    {
        for resource in resources {
            self.add(resource);
        }
    }

    pub fn remove(&mut self, position: Point) -> Option<Resource> {
        self.live.remove(&position)
    }

    /// Relocates the token at `from` to `to`. The destination is written
    /// before the source is cleared; a missing source still yields a token
    /// at `to`. Locks do not survive a move.
    pub fn relocate(&mut self, from: Point, to: Point) {
        if from == to {
            if !self.live.contains_key(&to) {
                self.add(Resource::new(to));
            }
            return;
        }
        let moved = match self.live.get(&from) {
            Some(existing) => Resource {
                position: to,
                lock_owner: None,
                ..existing.clone()
            },
            None => Resource::new(to),
        };
        self.add(moved);
        self.remove(from);
    }

    /// Acquires the lock on the token at `position` for `id`.
    ///
    /// Succeeds when the token is unlocked or already held by `id`.
    pub fn lock(&mut self, position: Point, id: Identifier) -> bool {
        match self.live.get_mut(&position) {
            Some(resource) => match resource.lock_owner {
                None => {
                    resource.lock_owner = Some(id);
                    true
                }
                Some(owner) => owner == id,
            },
            None => false,
        }
    }

    /// Releases the lock at `position` if `id` holds it. Returns whether a
    /// lock was released.
    pub fn unlock(&mut self, position: Point, id: Identifier) -> bool {
        match self.live.get_mut(&position) {
            Some(resource) if resource.lock_owner == Some(id) => {
                resource.lock_owner = None;
                true
            }
            _ => false,
        }
    }

    pub fn release_locks_held_by(&mut self, id: Identifier) {
        for resource in self.live.values_mut() {
            if resource.lock_owner == Some(id) {
                resource.lock_owner = None;
            }
        }
    }

    /// Removes the token at `position` on behalf of `id` if it is unlocked or
    /// locked by `id`.
    pub fn harvest(&mut self, position: Point, id: Identifier) -> Option<Resource> {
        let available = self
            .live
            .get(&position)
            .map_or(false, |resource| resource.is_available_to(id));
        if !available {
            return None;
        }
        let mut resource = self.live.remove(&position)?;
        resource.lock_owner = None;
        resource.removed_by = Some(id);
        self.harvested.push(resource.clone());
        Some(resource)
    }

    /// Removes the token at `position` as collected by `id`, ignoring locks.
    pub fn take(&mut self, position: Point, id: Identifier) -> Option<Resource> {
        let mut resource = self.live.remove(&position)?;
        resource.lock_owner = None;
        resource.removed_by = Some(id);
        self.harvested.push(resource.clone());
        Some(resource)
    }

    pub fn get(&self, position: Point) -> Option<&Resource> {
        self.live.get(&position)
    }

    pub fn contains(&self, position: Point) -> bool {
        self.live.contains_key(&position)
    }

    pub fn positions(&self) -> BTreeSet<Point> {
        self.live.keys().copied().collect()
    }

    pub fn harvested(&self) -> &[Resource] {
        &self.harvested
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Drops every live token. Harvest history is kept.
    pub fn reset_distribution(&mut self) {
        self.live.clear();
    }

    pub fn clear(&mut self) {
        self.live.clear();
        self.harvested.clear();
    }
}
