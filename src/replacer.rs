//! LRU-K replacement policy for the buffer pool.
//!
//! Tracks up to the `k` most recent access timestamps of every frame and
//! evicts the evictable frame with the largest backward k-distance: frames
//! with fewer than `k` recorded accesses have infinite distance and are
//! preferred, oldest first; among fully-sampled frames the one whose k-th
//! most recent access is oldest wins.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::{lock_mutex_recover, FrameId};

struct LruKNode {
    /// Most recent first; trimmed to the newest `k` entries.
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn record(&mut self, timestamp: u64, k: usize) {
        if self.history.len() >= k {
            self.history.pop_back();
        }
        self.history.push_front(timestamp);
    }

    /// Oldest retained timestamp. For a fully-sampled node this is the k-th
    /// most recent access; below k samples it is the earliest access ever.
    fn oldest_timestamp(&self) -> u64 {
        *self.history.back().expect("node has no recorded access")
    }
}

struct ReplacerState {
    node_store: HashMap<FrameId, LruKNode>,
    /// Frames with fewer than k recorded accesses, most recently accessed first.
    less_than_k: VecDeque<FrameId>,
    /// Frames with at least k recorded accesses; victim chosen by scan.
    at_least_k: VecDeque<FrameId>,
    current_timestamp: u64,
    curr_size: usize,
}

pub struct LruKReplacer {
    state: Mutex<ReplacerState>,
    num_frames: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            state: Mutex::new(ReplacerState {
                node_store: HashMap::with_capacity(num_frames),
                less_than_k: VecDeque::new(),
                at_least_k: VecDeque::new(),
                current_timestamp: 0,
                curr_size: 0,
            }),
            num_frames,
            k,
        }
    }

    /// Records an access to `frame_id` at the current logical time. An
    /// untracked frame gets a fresh node, created evictable.
    pub fn record_access(&self, frame_id: FrameId) {
        let mut state = lock_mutex_recover(&self.state);
        self.touch(&mut state, frame_id);
    }

    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = lock_mutex_recover(&self.state);
        Self::mark(&mut state, frame_id, evictable);
    }

    /// [`record_access`] and [`set_evictable`] under a single lock
    /// acquisition, so no other thread can observe the frame between the
    /// access being recorded and the evictability changing.
    ///
    /// [`record_access`]: Self::record_access
    /// [`set_evictable`]: Self::set_evictable
    pub fn record_access_and_set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = lock_mutex_recover(&self.state);
        self.touch(&mut state, frame_id);
        Self::mark(&mut state, frame_id, evictable);
    }

    /// Drops a tracked frame. The frame must be evictable; unknown frames
    /// are ignored.
    pub fn remove(&self, frame_id: FrameId) {
        let mut state = lock_mutex_recover(&self.state);
        let Some(node) = state.node_store.get(&frame_id) else {
            return;
        };
        assert!(node.is_evictable, "removing a non-evictable frame");
        let in_full_tier = node.history.len() >= self.k;
        Self::unlink(&mut state, frame_id, in_full_tier);
        state.node_store.remove(&frame_id);
        state.curr_size -= 1;
    }

    /// Picks a victim, removes its node and returns its frame id, or `None`
    /// when nothing is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = lock_mutex_recover(&self.state);
        if state.curr_size == 0 {
            return None;
        }

        // Infinite-distance tier first: the evictable frame with the
        // earliest recorded access loses.
        let victim = Self::scan_tier(&state, &state.less_than_k)
            .or_else(|| Self::scan_tier(&state, &state.at_least_k));
        let (frame_id, in_full_tier) = victim?;

        Self::unlink(&mut state, frame_id, in_full_tier);
        state.node_store.remove(&frame_id);
        state.curr_size -= 1;
        Some(frame_id)
    }

    /// Number of evictable frames currently tracked.
    pub fn size(&self) -> usize {
        lock_mutex_recover(&self.state).curr_size
    }

    fn touch(&self, state: &mut ReplacerState, frame_id: FrameId) {
        assert!(
            frame_id < self.num_frames,
            "frame id {frame_id} out of range for replacer of {} frames",
            self.num_frames
        );
        state.current_timestamp += 1;
        let timestamp = state.current_timestamp;

        match state.node_store.get_mut(&frame_id) {
            None => {
                let mut node = LruKNode {
                    history: VecDeque::with_capacity(self.k),
                    is_evictable: true,
                };
                node.record(timestamp, self.k);
                let full = node.history.len() >= self.k;
                state.node_store.insert(frame_id, node);
                if full {
                    state.at_least_k.push_back(frame_id);
                } else {
                    state.less_than_k.push_front(frame_id);
                }
                state.curr_size += 1;
            }
            Some(node) => {
                let was_partial = node.history.len() < self.k;
                node.record(timestamp, self.k);
                let now_full = node.history.len() >= self.k;
                if was_partial && now_full {
                    Self::delist(&mut state.less_than_k, frame_id);
                    state.at_least_k.push_back(frame_id);
                } else if was_partial {
                    Self::delist(&mut state.less_than_k, frame_id);
                    state.less_than_k.push_front(frame_id);
                }
            }
        }
    }

    fn mark(state: &mut ReplacerState, frame_id: FrameId, evictable: bool) {
        let node = state
            .node_store
            .get_mut(&frame_id)
            .expect("set_evictable on an untracked frame");
        if node.is_evictable != evictable {
            node.is_evictable = evictable;
            if evictable {
                state.curr_size += 1;
            } else {
                state.curr_size -= 1;
            }
        }
    }

    /// Returns the evictable frame with the smallest oldest-retained
    /// timestamp in `tier`, tagged with whether the tier is the full one.
    fn scan_tier(state: &ReplacerState, tier: &VecDeque<FrameId>) -> Option<(FrameId, bool)> {
        let mut best: Option<(FrameId, u64)> = None;
        for &frame_id in tier {
            let node = &state.node_store[&frame_id];
            if !node.is_evictable {
                continue;
            }
            let ts = node.oldest_timestamp();
            if best.map_or(true, |(_, best_ts)| ts < best_ts) {
                best = Some((frame_id, ts));
            }
        }
        best.map(|(frame_id, _)| (frame_id, std::ptr::eq(tier, &state.at_least_k)))
    }

    fn unlink(state: &mut ReplacerState, frame_id: FrameId, in_full_tier: bool) {
        if in_full_tier {
            Self::delist(&mut state.at_least_k, frame_id);
        } else {
            Self::delist(&mut state.less_than_k, frame_id);
        }
    }

    fn delist(tier: &mut VecDeque<FrameId>, frame_id: FrameId) {
        if let Some(pos) = tier.iter().position(|&f| f == frame_id) {
            tier.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evict_empty_returns_none() {
        let replacer = LruKReplacer::new(4, 2);
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn partial_tier_is_preferred_and_lru_ordered() {
        let replacer = LruKReplacer::new(4, 2);
        // Frame 0 becomes fully sampled, frames 1 and 2 stay below k.
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(0);
        assert_eq!(replacer.size(), 3);

        // Frames 1 and 2 have infinite distance; 1 was accessed first.
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn full_tier_picks_largest_backward_k_distance() {
        let replacer = LruKReplacer::new(4, 2);
        // Access order: 0, 1, 2, 2, 1, 0 -> k-th recent: 0@1, 1@2, 2@3.
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.record_access(2);
        replacer.record_access(1);
        replacer.record_access(0);

        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.set_evictable(0, false);
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(0, true);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn set_evictable_is_idempotent_on_size() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(3);
        replacer.set_evictable(3, true);
        replacer.set_evictable(3, true);
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(3, false);
        replacer.set_evictable(3, false);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn record_and_set_evictable_is_consistent_for_new_frames() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access_and_set_evictable(0, false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.record_access_and_set_evictable(0, true);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(0));
    }

    #[test]
    fn remove_unknown_frame_is_a_no_op() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.remove(2);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn remove_drops_history() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.remove(0);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn remove_non_evictable_frame_panics() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access_and_set_evictable(0, false);
        replacer.remove(0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn record_access_out_of_range_panics() {
        let replacer = LruKReplacer::new(2, 2);
        replacer.record_access(2);
    }

    #[test]
    fn k_equal_one_degenerates_to_lru() {
        let replacer = LruKReplacer::new(4, 1);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(0);

        // Plain LRU: frame 1 is now the coldest.
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(0));
    }

    /// The buffer-pool eviction scenario: three frames accessed once each,
    /// the first re-accessed twice. The victim comes from the below-k tier,
    /// oldest single access first.
    #[test]
    fn reaccessed_frame_outlives_cold_frames() {
        let replacer = LruKReplacer::new(3, 2);
        for frame in 0..3 {
            replacer.record_access_and_set_evictable(frame, false);
        }
        for frame in 0..3 {
            replacer.set_evictable(frame, true);
        }
        replacer.record_access_and_set_evictable(0, false);
        replacer.record_access_and_set_evictable(0, false);
        replacer.set_evictable(0, true);

        assert_eq!(replacer.evict(), Some(1));
    }
}
