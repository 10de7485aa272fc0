//! Entity timers, driven from the game tick.
//!
//! One-shot and repeating timers keyed by id and indexed by entity so the
//! destroy path can release everything an entity scheduled. Cancelled ids
//! stay in the heap as stale entries and are skipped lazily on expiry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use world_shared::ids::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    entity: EntityId,
    tag: String,
    interval: Option<Duration>,
}

/// Min-heap timer wheel for one game loop.
#[derive(Default)]
pub struct TimerService {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    by_entity: HashMap<EntityId, HashSet<TimerId>>,
    next_id: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a timer firing after `delay`; `interval` makes it repeat.
    pub fn add(
        &mut self,
        entity: EntityId,
        tag: &str,
        delay: Duration,
        interval: Option<Duration>,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.insert(
            id,
            TimerEntry {
                entity,
                tag: tag.to_string(),
                interval,
            },
        );
        self.by_entity.entry(entity).or_default().insert(id);
        self.heap.push(Reverse((Instant::now() + delay, id)));
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                if let Some(set) = self.by_entity.get_mut(&entry.entity) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.by_entity.remove(&entry.entity);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Releases every timer an entity scheduled; returns how many.
    pub fn cancel_entity(&mut self, entity: EntityId) -> usize {
        let Some(ids) = self.by_entity.remove(&entity) else {
            return 0;
        };
        let count = ids.len();
        for id in ids {
            self.entries.remove(&id);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pops every timer due at `now`, re-arming repeating ones.
    ///
    /// Repeats are re-armed relative to `now`, not the missed deadline, so
    /// a stalled loop does not fire a catch-up burst.
    pub fn due(&mut self, now: Instant) -> Vec<(EntityId, String)> {
        let mut fired = Vec::new();
        while let Some(&Reverse((when, id))) = self.heap.peek() {
            if when > now {
                break;
            }
            self.heap.pop();
            let Some(entry) = self.entries.get(&id) else {
                continue; // cancelled, stale heap entry
            };
            fired.push((entry.entity, entry.tag.clone()));
            match entry.interval {
                Some(interval) => self.heap.push(Reverse((now + interval, id))),
                None => {
                    self.cancel(id);
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let mut t = TimerService::new();
        let e = EntityId::new_unique();
        t.add(e, "spawn", Duration::from_millis(0), None);
        let fired = t.due(Instant::now() + Duration::from_millis(1));
        assert_eq!(fired, vec![(e, "spawn".to_string())]);
        assert!(t.is_empty());
        assert!(t.due(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn repeating_timer_rearms() {
        let mut t = TimerService::new();
        let e = EntityId::new_unique();
        t.add(
            e,
            "heartbeat",
            Duration::from_millis(0),
            Some(Duration::from_millis(10)),
        );
        let now = Instant::now();
        assert_eq!(t.due(now + Duration::from_millis(1)).len(), 1);
        assert_eq!(t.due(now + Duration::from_millis(20)).len(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn cancel_entity_releases_all() {
        let mut t = TimerService::new();
        let e = EntityId::new_unique();
        let other = EntityId::new_unique();
        t.add(e, "a", Duration::from_millis(0), None);
        t.add(e, "b", Duration::from_millis(0), None);
        let keep = t.add(other, "c", Duration::from_millis(0), None);
        assert_eq!(t.cancel_entity(e), 2);
        let fired = t.due(Instant::now() + Duration::from_millis(1));
        assert_eq!(fired, vec![(other, "c".to_string())]);
        assert!(!t.cancel(keep)); // already consumed as one-shot
    }
}
