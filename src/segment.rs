//! Segment: one contiguous, non-overlapping byte range of the target file,
//! backed by one chunk file. Pure data + ranking/usability helpers; the
//! table itself (and its lock) lives in [`crate::coordinator`].

use std::sync::Arc;

use crate::task::SegmentTask;

pub(crate) struct Segment {
    pub offset: u64,
    pub target_length: u64,
    pub completed_length: u64,
    pub task: Option<Arc<SegmentTask>>,
}

impl Segment {
    pub fn new(offset: u64, target_length: u64, completed_length: u64) -> Self {
        Self {
            offset,
            target_length,
            completed_length,
            task: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_length >= self.target_length
    }

    /// Dispatch rank: 0 free, 1 busy with a range-proven task, 2 busy with
    /// capability still unknown.
    pub fn rank(&self) -> u8 {
        match &self.task {
            None => 0,
            Some(t) => {
                if t.know_can_use_range() == Some(true) {
                    1
                } else {
                    2
                }
            }
        }
    }

    /// Usable for dispatch: not yet complete, and either free or with enough
    /// remaining slack (relative to the task's own progress) to be worth
    /// splitting.
    pub fn is_usable(&self, min_task_length: u64) -> bool {
        if self.is_complete() {
            return false;
        }
        match &self.task {
            None => true,
            Some(t) => {
                let remain = self.target_length.saturating_sub(t.completed_length());
                remain >= 2 * min_task_length
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_segment_is_rank_zero_and_usable() {
        let s = Segment::new(0, 100, 0);
        assert_eq!(s.rank(), 0);
        assert!(s.is_usable(10));
    }

    #[test]
    fn complete_segment_is_never_usable() {
        let s = Segment::new(0, 100, 100);
        assert!(!s.is_usable(1));
    }

    #[test]
    fn free_segment_usable_even_below_min_task_length() {
        let s = Segment::new(90, 10, 0);
        assert!(s.is_usable(100));
    }
}
