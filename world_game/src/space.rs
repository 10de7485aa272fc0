//! Spaces: world regions owning member entities and their interest scope.
//!
//! A space is a special kind of entity. The distinguished kind-0 ("nil")
//! space exists once per game process; entities live there when they are
//! in no real space, and it maintains no AOI. Every entity outside the nil
//! space is in exactly one space at a time.

use std::collections::HashSet;

use world_shared::ids::EntityId;
use world_shared::math::Vec3;

use crate::aoi::{AoiEvent, AoiField, AoiHandle};

/// Kind of the per-process universal space.
pub const NIL_SPACE_KIND: i32 = 0;

/// A world region: member set plus the AOI field that scopes interest.
pub struct Space {
    id: EntityId,
    kind: i32,
    members: HashSet<EntityId>,
    /// None for the nil space: no positions, no interest.
    aoi: Option<AoiField>,
}

impl Space {
    pub fn new(id: EntityId, kind: i32, aoi_distance: f32) -> Self {
        let aoi = if kind == NIL_SPACE_KIND {
            None
        } else {
            Some(AoiField::new(aoi_distance))
        };
        Self {
            id,
            kind,
            members: HashSet::new(),
            aoi,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn is_nil(&self) -> bool {
        self.kind == NIL_SPACE_KIND
    }

    pub fn members(&self) -> &HashSet<EntityId> {
        &self.members
    }

    pub fn contains(&self, e: EntityId) -> bool {
        self.members.contains(&e)
    }

    pub fn aoi(&self) -> Option<&AoiField> {
        self.aoi.as_ref()
    }

    pub fn aoi_mut(&mut self) -> Option<&mut AoiField> {
        self.aoi.as_mut()
    }

    /// Adds a member: pairwise space interest is implied by membership;
    /// distance-bounded neighbor interest comes from the AOI insert.
    pub fn enter(&mut self, e: EntityId, pos: Vec3) -> (Option<AoiHandle>, Vec<AoiEvent>) {
        self.members.insert(e);
        match self.aoi.as_mut() {
            Some(aoi) => {
                let (h, events) = aoi.insert(e, pos.x, pos.z);
                (Some(h), events)
            }
            None => (None, Vec::new()),
        }
    }

    /// Removes a member and drops its mutual interest.
    pub fn leave(&mut self, e: EntityId, handle: Option<AoiHandle>) -> Vec<AoiEvent> {
        self.members.remove(&e);
        match (self.aoi.as_mut(), handle) {
            (Some(aoi), Some(h)) => aoi.remove(h),
            _ => Vec::new(),
        }
    }

    /// Repositions a member within this space.
    pub fn move_member(&mut self, handle: AoiHandle, pos: Vec3) -> Vec<AoiEvent> {
        match self.aoi.as_mut() {
            Some(aoi) => aoi.move_to(handle, pos.x, pos.z),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_space_tracks_members_without_aoi() {
        let mut s = Space::new(EntityId::new_unique(), NIL_SPACE_KIND, 10.0);
        let e = EntityId::new_unique();
        let (h, events) = s.enter(e, Vec3::new(1.0, 0.0, 1.0));
        assert!(h.is_none());
        assert!(events.is_empty());
        assert!(s.contains(e));
        assert!(s.leave(e, h).is_empty());
        assert!(!s.contains(e));
    }

    #[test]
    fn enter_then_leave_restores_pre_enter_state() {
        let mut s = Space::new(EntityId::new_unique(), 1, 10.0);
        let resident = EntityId::new_unique();
        let (rh, _) = s.enter(resident, Vec3::ZERO);
        let rh = rh.unwrap();

        let before_members = s.members().clone();
        let visitor = EntityId::new_unique();
        let (vh, enters) = s.enter(visitor, Vec3::new(1.0, 0.0, 1.0));
        assert_eq!(enters.len(), 1);

        let leaves = s.leave(visitor, vh);
        assert_eq!(leaves.len(), 1);
        assert_eq!(s.members(), &before_members);
        assert!(s.aoi().unwrap().neighbors(rh).is_empty());
        s.aoi().unwrap().check_invariants().unwrap();
    }
}
