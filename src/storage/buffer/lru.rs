use super::replacer::{FrameId, Replacer};
use std::collections::{BTreeMap, HashMap};

/// Least-recently-unpinned eviction. Every unpin stamps the frame with a
/// monotonically increasing tick; the smallest tick is evicted first.
#[derive(Debug)]
pub struct LruReplacer {
    by_tick: BTreeMap<u64, FrameId>,
    ticks: HashMap<FrameId, u64>,
    clock: u64,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_tick: BTreeMap::new(),
            ticks: HashMap::with_capacity(capacity),
            clock: 0,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        let (_, frame_id) = self.by_tick.pop_first()?;
        self.ticks.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.remove(frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if self.ticks.contains_key(&frame_id) {
            return;
        }
        self.clock += 1;
        self.by_tick.insert(self.clock, frame_id);
        self.ticks.insert(frame_id, self.clock);
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(tick) = self.ticks.remove(&frame_id) {
            self.by_tick.remove(&tick);
        }
    }

    fn size(&self) -> usize {
        self.ticks.len()
    }
}
