// THEORY:
// The `PlaybackBuffer` lets an operator scrub a recorded session and see the
// analytics that were live at that point in the video. Replay frames arrive
// tagged with their position in the recording; the buffer stores them by that
// timestamp and answers "which frame was closest to time T?".
//
// Key architectural principles:
// 1.  **Unique Keys**: One frame per timestamp. Recording the same timestamp again
//     replaces the earlier frame.
// 2.  **Bounded Answers**: A lookup only succeeds when the nearest frame is within
//     the match window. Between sparse samples the caller gets `None` and keeps
//     showing what it had, instead of flickering to a far-away frame.
// 3.  **Ordered Index**: Frames live in a `BTreeMap`, so the nearest neighbour is
//     one step either side of the query. Ties go to the earlier frame.

use crate::core_modules::density_frame::DensityFrame;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default maximum distance between a query and the frame it returns.
pub const DEFAULT_MATCH_WINDOW_MS: u64 = 500;

/// Time-indexed store of replay frames for one playback session.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    frames: BTreeMap<u64, Arc<DensityFrame>>,
    window_ms: u64,
}

impl PlaybackBuffer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            frames: BTreeMap::new(),
            window_ms,
        }
    }

    /// Stores a frame under its own timestamp, replacing any previous one.
    pub fn record(&mut self, frame: impl Into<Arc<DensityFrame>>) {
        let frame = frame.into();
        self.frames.insert(frame.timestamp, frame);
    }

    /// The frame nearest to `query_ms`, if it lies within the match window.
    pub fn lookup(&self, query_ms: u64) -> Option<Arc<DensityFrame>> {
        let before = self
            .frames
            .range(..=query_ms)
            .next_back()
            .map(|(ts, frame)| (query_ms - ts, frame));
        let after = self
            .frames
            .range(query_ms..)
            .next()
            .map(|(ts, frame)| (ts - query_ms, frame));

        let (distance, frame) = match (before, after) {
            (Some(b), Some(a)) if a.0 < b.0 => a,
            (Some(b), _) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        (distance <= self.window_ms).then(|| Arc::clone(frame))
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// First and last recorded timestamps.
    pub fn time_span(&self) -> Option<(u64, u64)> {
        let first = *self.frames.keys().next()?;
        let last = *self.frames.keys().next_back()?;
        Some((first, last))
    }
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_WINDOW_MS)
    }
}
