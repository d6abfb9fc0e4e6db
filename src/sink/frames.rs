//! Frame space of a sink.
//!
//! Axis names are recorded in first-seen order; each axis grows to one past
//! the largest index written. Frames are keyed by their per-axis index
//! vector, which is extended with zeros whenever a new axis appears.

use std::collections::BTreeMap;

use crate::source::FrameAxes;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FrameSpace {
    axes: Vec<(String, usize)>,
}

impl FrameSpace {
    pub fn axes(&self) -> FrameAxes {
        FrameAxes::new(self.axes.clone())
    }

    pub fn frame_count(&self) -> usize {
        self.axes().frame_count()
    }

    /// Register the axes of a write and return its frame key.
    ///
    /// Returns the number of axes newly added, so existing keys can be
    /// padded.
    pub fn key_for(&mut self, index: &BTreeMap<String, usize>) -> (Vec<usize>, usize) {
        let mut added = 0;
        for (name, &i) in index {
            match self.axes.iter_mut().find(|(n, _)| n == name) {
                Some((_, count)) => *count = (*count).max(i + 1),
                None => {
                    self.axes.push((name.clone(), i + 1));
                    added += 1;
                }
            }
        }
        let key = self
            .axes
            .iter()
            .map(|(name, _)| index.get(name).copied().unwrap_or(0))
            .collect();
        (key, added)
    }

    /// Register axes up front, in their given order, sized to at least
    /// their given counts. Returns the number of axes newly added.
    pub fn declare(&mut self, axes: &FrameAxes) -> usize {
        let mut added = 0;
        for (name, size) in axes.axes() {
            match self.axes.iter_mut().find(|(n, _)| n == name) {
                Some((_, count)) => *count = (*count).max(*size),
                None => {
                    self.axes.push((name.clone(), *size));
                    added += 1;
                }
            }
        }
        added
    }

    /// Key of a linear frame index.
    pub fn key_of_frame(&self, frame: usize) -> Option<Vec<usize>> {
        if frame >= self.frame_count() {
            return None;
        }
        let index = self.axes().decompose(frame);
        Some(
            self.axes
                .iter()
                .map(|(name, _)| index.get(name).copied().unwrap_or(0))
                .collect(),
        )
    }

    /// Linear frame index of a key.
    pub fn frame_of_key(&self, key: &[usize]) -> Option<usize> {
        let index: BTreeMap<String, usize> = self
            .axes
            .iter()
            .zip(key)
            .map(|((name, _), &i)| (name.clone(), i))
            .collect();
        self.axes().compose(&index)
    }
}
