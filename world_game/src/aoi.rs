//! Area-of-interest engine: twin sorted sweep lists over an arena.
//!
//! Every positioned entity in a space owns one AOI record. Records live in
//! an arena indexed by handle; each record is a node of two independent
//! doubly-linked lists, one sorted ascending by X and one by Z, with
//! prev/next stored as optional handles. The arena's bookkeeping enforces
//! exactly-one-membership per axis list; there are no ownership-bearing
//! links to dangle after removal.
//!
//! Interest semantics: two entities are neighbors iff |dx| <= distance AND
//! |dz| <= distance, boundary included. The X-axis outward walk
//! (`x_range`) is only a pre-filter; the Z bound is applied on top of it.
//! Neighbor maintenance is incremental: a move walks the lists only as far
//! as sort order requires and rescans only the X-range around the mover,
//! never the whole population. Traversal counters expose that property to
//! tests.

use std::collections::HashSet;

use world_shared::ids::EntityId;

/// Index of one AOI record inside its field's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AoiHandle(usize);

/// Mutual-interest transition produced by insert/move/remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoiEvent {
    /// The two entities became neighbors.
    Enter(EntityId, EntityId),
    /// The two entities stopped being neighbors.
    Leave(EntityId, EntityId),
}

/// Traversal counters for incremental-cost assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AoiStats {
    /// Nodes visited while restoring sort order (insert scans + move walks).
    pub sort_steps: u64,
    /// Nodes visited while collecting the X-range around an entity.
    pub scan_steps: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Z,
}

struct AoiRecord {
    entity: EntityId,
    x: f32,
    z: f32,
    neighbors: HashSet<AoiHandle>,
    x_prev: Option<AoiHandle>,
    x_next: Option<AoiHandle>,
    z_prev: Option<AoiHandle>,
    z_next: Option<AoiHandle>,
}

/// One space's AOI state: arena plus the two sweep lists.
pub struct AoiField {
    distance: f32,
    slots: Vec<Option<AoiRecord>>,
    free: Vec<usize>,
    x_head: Option<AoiHandle>,
    x_tail: Option<AoiHandle>,
    z_head: Option<AoiHandle>,
    z_tail: Option<AoiHandle>,
    len: usize,
    stats: AoiStats,
}

impl AoiField {
    pub fn new(distance: f32) -> Self {
        Self {
            distance,
            slots: Vec::new(),
            free: Vec::new(),
            x_head: None,
            x_tail: None,
            z_head: None,
            z_tail: None,
            len: 0,
            stats: AoiStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn distance(&self) -> f32 {
        self.distance
    }

    pub fn stats(&self) -> AoiStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = AoiStats::default();
    }

    fn rec(&self, h: AoiHandle) -> &AoiRecord {
        self.slots[h.0].as_ref().expect("stale aoi handle")
    }

    fn rec_mut(&mut self, h: AoiHandle) -> &mut AoiRecord {
        self.slots[h.0].as_mut().expect("stale aoi handle")
    }

    pub fn entity(&self, h: AoiHandle) -> EntityId {
        self.rec(h).entity
    }

    pub fn position(&self, h: AoiHandle) -> (f32, f32) {
        let r = self.rec(h);
        (r.x, r.z)
    }

    /// Current neighbor set (both-axes semantics already applied).
    pub fn neighbors(&self, h: AoiHandle) -> Vec<EntityId> {
        self.rec(h)
            .neighbors
            .iter()
            .map(|&n| self.rec(n).entity)
            .collect()
    }

    // ─── axis plumbing ───

    fn coord(&self, h: AoiHandle, axis: Axis) -> f32 {
        let r = self.rec(h);
        match axis {
            Axis::X => r.x,
            Axis::Z => r.z,
        }
    }

    fn next(&self, h: AoiHandle, axis: Axis) -> Option<AoiHandle> {
        let r = self.rec(h);
        match axis {
            Axis::X => r.x_next,
            Axis::Z => r.z_next,
        }
    }

    fn prev(&self, h: AoiHandle, axis: Axis) -> Option<AoiHandle> {
        let r = self.rec(h);
        match axis {
            Axis::X => r.x_prev,
            Axis::Z => r.z_prev,
        }
    }

    fn set_next(&mut self, h: AoiHandle, axis: Axis, v: Option<AoiHandle>) {
        let r = self.rec_mut(h);
        match axis {
            Axis::X => r.x_next = v,
            Axis::Z => r.z_next = v,
        }
    }

    fn set_prev(&mut self, h: AoiHandle, axis: Axis, v: Option<AoiHandle>) {
        let r = self.rec_mut(h);
        match axis {
            Axis::X => r.x_prev = v,
            Axis::Z => r.z_prev = v,
        }
    }

    fn head(&self, axis: Axis) -> Option<AoiHandle> {
        match axis {
            Axis::X => self.x_head,
            Axis::Z => self.z_head,
        }
    }

    fn set_head(&mut self, axis: Axis, v: Option<AoiHandle>) {
        match axis {
            Axis::X => self.x_head = v,
            Axis::Z => self.z_head = v,
        }
    }

    fn tail(&self, axis: Axis) -> Option<AoiHandle> {
        match axis {
            Axis::X => self.x_tail,
            Axis::Z => self.z_tail,
        }
    }

    fn set_tail(&mut self, axis: Axis, v: Option<AoiHandle>) {
        match axis {
            Axis::X => self.x_tail = v,
            Axis::Z => self.z_tail = v,
        }
    }

    /// Unsplices `h` from one axis list; constant time.
    fn unlink(&mut self, h: AoiHandle, axis: Axis) {
        let p = self.prev(h, axis);
        let n = self.next(h, axis);
        match p {
            Some(p) => self.set_next(p, axis, n),
            None => self.set_head(axis, n),
        }
        match n {
            Some(n) => self.set_prev(n, axis, p),
            None => self.set_tail(axis, p),
        }
        self.set_prev(h, axis, None);
        self.set_next(h, axis, None);
    }

    /// Splices `h` immediately before `at`, or at the tail for `None`.
    fn link_before(&mut self, h: AoiHandle, at: Option<AoiHandle>, axis: Axis) {
        match at {
            Some(at) => {
                let p = self.prev(at, axis);
                self.set_prev(h, axis, p);
                self.set_next(h, axis, Some(at));
                self.set_prev(at, axis, Some(h));
                match p {
                    Some(p) => self.set_next(p, axis, Some(h)),
                    None => self.set_head(axis, Some(h)),
                }
            }
            None => {
                let t = self.tail(axis);
                self.set_prev(h, axis, t);
                self.set_next(h, axis, None);
                match t {
                    Some(t) => self.set_next(t, axis, Some(h)),
                    None => self.set_head(axis, Some(h)),
                }
                self.set_tail(axis, Some(h));
            }
        }
    }

    /// Head-scan insertion: first node with coordinate >= ours.
    fn insert_sorted(&mut self, h: AoiHandle, axis: Axis) {
        let my = self.coord(h, axis);
        let mut at = self.head(axis);
        while let Some(n) = at {
            self.stats.sort_steps += 1;
            if self.coord(n, axis) >= my {
                break;
            }
            at = self.next(n, axis);
        }
        self.link_before(h, at, axis);
    }

    /// Local re-sort after a coordinate change: walk from the node's own
    /// position only as far as order requires. Strict comparisons keep
    /// coincident coordinates stable (no swapping, no cycles).
    fn resort(&mut self, h: AoiHandle, axis: Axis) {
        let my = self.coord(h, axis);

        if let Some(first) = self.next(h, axis) {
            if self.coord(first, axis) < my {
                // Drifted right: find the first successor with coord >= ours.
                let mut after = first;
                loop {
                    self.stats.sort_steps += 1;
                    match self.next(after, axis) {
                        Some(n) if self.coord(n, axis) < my => after = n,
                        _ => break,
                    }
                }
                let target = self.next(after, axis);
                self.unlink(h, axis);
                self.link_before(h, target, axis);
                return;
            }
        }

        if let Some(first) = self.prev(h, axis) {
            if self.coord(first, axis) > my {
                // Drifted left: find the last predecessor with coord > ours.
                let mut before = first;
                loop {
                    self.stats.sort_steps += 1;
                    match self.prev(before, axis) {
                        Some(p) if self.coord(p, axis) > my => before = p,
                        _ => break,
                    }
                }
                self.unlink(h, axis);
                self.link_before(h, Some(before), axis);
            }
        }
    }

    /// Inserts an entity and computes its initial neighbor set.
    pub fn insert(&mut self, entity: EntityId, x: f32, z: f32) -> (AoiHandle, Vec<AoiEvent>) {
        let record = AoiRecord {
            entity,
            x,
            z,
            neighbors: HashSet::new(),
            x_prev: None,
            x_next: None,
            z_prev: None,
            z_next: None,
        };
        let h = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(record);
                AoiHandle(i)
            }
            None => {
                self.slots.push(Some(record));
                AoiHandle(self.slots.len() - 1)
            }
        };
        self.len += 1;
        self.insert_sorted(h, Axis::X);
        self.insert_sorted(h, Axis::Z);
        let events = self.refresh_neighbors(h);
        (h, events)
    }

    /// Removes an entity; unsplicing is constant time, interest drops are
    /// proportional to its neighbor count.
    pub fn remove(&mut self, h: AoiHandle) -> Vec<AoiEvent> {
        let me = self.rec(h).entity;
        let neighbors: Vec<AoiHandle> = self.rec(h).neighbors.iter().copied().collect();
        let mut events = Vec::with_capacity(neighbors.len());
        for n in neighbors {
            self.rec_mut(n).neighbors.remove(&h);
            events.push(AoiEvent::Leave(me, self.rec(n).entity));
        }
        self.unlink(h, Axis::X);
        self.unlink(h, Axis::Z);
        self.slots[h.0] = None;
        self.free.push(h.0);
        self.len -= 1;
        events
    }

    /// Moves an entity, restoring sort order locally and diffing interest.
    pub fn move_to(&mut self, h: AoiHandle, x: f32, z: f32) -> Vec<AoiEvent> {
        let (old_x, old_z) = self.position(h);
        {
            let r = self.rec_mut(h);
            r.x = x;
            r.z = z;
        }
        if x != old_x {
            self.resort(h, Axis::X);
        }
        if z != old_z {
            self.resort(h, Axis::Z);
        }
        self.refresh_neighbors(h)
    }

    /// Entities within the AOI distance on the X axis only.
    ///
    /// This is a pre-filter: it ignores Z entirely and is NOT an interest
    /// query by itself. Callers must intersect with the Z bound, which is
    /// exactly what neighbor maintenance does.
    pub fn x_range(&mut self, h: AoiHandle) -> Vec<AoiHandle> {
        let my_x = self.coord(h, Axis::X);
        let mut out = Vec::new();

        let mut cur = self.prev(h, Axis::X);
        while let Some(n) = cur {
            self.stats.scan_steps += 1;
            if (my_x - self.coord(n, Axis::X)).abs() > self.distance {
                break;
            }
            out.push(n);
            cur = self.prev(n, Axis::X);
        }

        let mut cur = self.next(h, Axis::X);
        while let Some(n) = cur {
            self.stats.scan_steps += 1;
            if (self.coord(n, Axis::X) - my_x).abs() > self.distance {
                break;
            }
            out.push(n);
            cur = self.next(n, Axis::X);
        }
        out
    }

    /// Recomputes `h`'s neighbor set (X pre-filter intersected with the Z
    /// bound) and applies the diff symmetrically.
    fn refresh_neighbors(&mut self, h: AoiHandle) -> Vec<AoiEvent> {
        let me = self.rec(h).entity;
        let (_, my_z) = self.position(h);

        let candidates = self.x_range(h);
        let mut fresh: HashSet<AoiHandle> = HashSet::with_capacity(candidates.len());
        for c in candidates {
            let (_, cz) = self.position(c);
            if (cz - my_z).abs() <= self.distance {
                fresh.insert(c);
            }
        }

        let old: HashSet<AoiHandle> = self.rec(h).neighbors.clone();
        let mut events = Vec::new();

        for &n in fresh.difference(&old) {
            self.rec_mut(n).neighbors.insert(h);
            events.push(AoiEvent::Enter(me, self.rec(n).entity));
        }
        for &n in old.difference(&fresh) {
            self.rec_mut(n).neighbors.remove(&h);
            events.push(AoiEvent::Leave(me, self.rec(n).entity));
        }
        self.rec_mut(h).neighbors = fresh;
        events
    }

    /// Entities in X-list order, for invariant checks.
    pub fn x_order(&self) -> Vec<(EntityId, f32)> {
        self.axis_order(Axis::X)
    }

    /// Entities in Z-list order, for invariant checks.
    pub fn z_order(&self) -> Vec<(EntityId, f32)> {
        self.axis_order(Axis::Z)
    }

    fn axis_order(&self, axis: Axis) -> Vec<(EntityId, f32)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head(axis);
        while let Some(h) = cur {
            out.push((self.rec(h).entity, self.coord(h, axis)));
            cur = self.next(h, axis);
        }
        out
    }

    /// Checks the structural invariants; list corruption here is fatal.
    ///
    /// - Both lists are sorted ascending.
    /// - Both lists contain every live record exactly once.
    /// - Neighbor links are symmetric.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        for axis in [Axis::X, Axis::Z] {
            let order = self.axis_order(axis);
            if order.len() != self.len {
                anyhow::bail!(
                    "axis list has {} nodes, arena has {}",
                    order.len(),
                    self.len
                );
            }
            for pair in order.windows(2) {
                if pair[0].1 > pair[1].1 {
                    anyhow::bail!("axis list out of order: {} > {}", pair[0].1, pair[1].1);
                }
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(r) = slot else { continue };
            for &n in &r.neighbors {
                let other = self.slots[n.0]
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("neighbor handle points at freed slot"))?;
                if !other.neighbors.contains(&AoiHandle(i)) {
                    anyhow::bail!(
                        "asymmetric neighbor link {} -> {}",
                        r.entity,
                        other.entity
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> AoiField {
        AoiField::new(10.0)
    }

    #[test]
    fn insert_keeps_both_axes_sorted() {
        let mut f = field();
        for (x, z) in [(5.0, 1.0), (1.0, 9.0), (3.0, 4.0), (2.0, 2.0)] {
            f.insert(EntityId::new_unique(), x, z);
        }
        f.check_invariants().unwrap();
        let xs: Vec<f32> = f.x_order().iter().map(|&(_, c)| c).collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0, 5.0]);
        let zs: Vec<f32> = f.z_order().iter().map(|&(_, c)| c).collect();
        assert_eq!(zs, vec![1.0, 2.0, 4.0, 9.0]);
    }

    #[test]
    fn boundary_distance_is_inside() {
        let mut f = field();
        let a = EntityId::new_unique();
        let b = EntityId::new_unique();
        let (ha, _) = f.insert(a, 0.0, 0.0);
        let (_, events) = f.insert(b, 10.0, 10.0);
        assert_eq!(events, vec![AoiEvent::Enter(b, a)]);
        assert_eq!(f.neighbors(ha), vec![b]);
    }

    #[test]
    fn one_axis_alone_is_not_interest() {
        let mut f = field();
        let a = EntityId::new_unique();
        let b = EntityId::new_unique();
        let (ha, _) = f.insert(a, 0.0, 0.0);
        // Inside on X, outside on Z.
        let (hb, events) = f.insert(b, 5.0, 50.0);
        assert!(events.is_empty());
        assert!(f.neighbors(ha).is_empty());
        // The X pre-filter still sees it.
        assert_eq!(f.x_range(hb).len(), 1);
    }

    #[test]
    fn move_produces_enter_then_leave() {
        let mut f = field();
        let a = EntityId::new_unique();
        let b = EntityId::new_unique();
        let (_, _) = f.insert(a, 0.0, 0.0);
        let (hb, _) = f.insert(b, 100.0, 0.0);

        let events = f.move_to(hb, 8.0, 0.0);
        assert_eq!(events, vec![AoiEvent::Enter(b, a)]);
        f.check_invariants().unwrap();

        let events = f.move_to(hb, 100.0, 0.0);
        assert_eq!(events, vec![AoiEvent::Leave(b, a)]);
        f.check_invariants().unwrap();
    }

    #[test]
    fn remove_drops_mutual_interest() {
        let mut f = field();
        let a = EntityId::new_unique();
        let b = EntityId::new_unique();
        let (ha, _) = f.insert(a, 0.0, 0.0);
        let (hb, _) = f.insert(b, 1.0, 1.0);
        assert_eq!(f.neighbors(ha), vec![b]);

        let events = f.remove(hb);
        assert_eq!(events, vec![AoiEvent::Leave(b, a)]);
        assert!(f.neighbors(ha).is_empty());
        f.check_invariants().unwrap();
    }

    #[test]
    fn coincident_positions_do_not_loop() {
        let mut f = field();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let (h, _) = f.insert(EntityId::new_unique(), 2.0, 2.0);
            handles.push(h);
        }
        // Moving within the stack must terminate and keep order stable.
        for &h in &handles {
            f.move_to(h, 2.0, 2.0);
        }
        f.check_invariants().unwrap();
        assert_eq!(f.len(), 4);
    }

    #[test]
    fn handle_reuse_after_remove() {
        let mut f = field();
        let (h, _) = f.insert(EntityId::new_unique(), 1.0, 1.0);
        f.remove(h);
        let (h2, _) = f.insert(EntityId::new_unique(), 2.0, 2.0);
        assert_eq!(h.0, h2.0); // slot reused
        f.check_invariants().unwrap();
    }
}
