//! Which held frame a capture request gets

use std::time::Duration;

use crate::frame::BufferTap;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SelectionPolicy {
    /// Oldest held frame
    #[default]
    Fifo,
    /// Frame whose sync count equals `target` (flash / OIS synchronised
    /// capture). Frames after a missed target are accepted; at the deadline
    /// the oldest held frame is taken instead.
    MatchCount { target: u32 },
    /// Highest focus score among `count` held candidates
    Sharpest,
}

/// Which frames are worth holding at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HoldFilter {
    #[default]
    All,
    /// Only sync counts in `base + 1 ..= base + len` (bracketed HDR burst)
    SyncWindow { base: u32, len: u32 },
}

impl HoldFilter {
    pub fn accepts(self, sync_count: u32) -> bool {
        match self {
            HoldFilter::All => true,
            HoldFilter::SyncWindow { base, len } => {
                sync_count > base && sync_count <= base.saturating_add(len)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectRequest {
    /// Candidates `Sharpest` waits for; at least one
    pub count: usize,
    pub tap: BufferTap,
    /// Falls back to the selector's wait time
    pub timeout: Option<Duration>,
    pub policy: SelectionPolicy,
    /// Take the oldest candidate (or the next arrival) regardless of policy
    pub first_frame: bool,
}

impl SelectRequest {
    pub fn new(tap: BufferTap) -> Self {
        Self {
            count: 1,
            tap,
            timeout: None,
            policy: SelectionPolicy::Fifo,
            first_frame: false,
        }
    }

    pub fn policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn first_frame(mut self, first_frame: bool) -> Self {
        self.first_frame = first_frame;
        self
    }
}

/// What the policy sees of one held entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    /// Position in the hold list
    pub pos: usize,
    pub sync_count: u32,
    pub focus_score: Option<f32>,
}

/// Pick among candidates ordered oldest first. `None` means keep waiting.
///
/// At the deadline any non-empty candidate list yields a frame.
pub(crate) fn pick(
    candidates: &[Candidate],
    req: &SelectRequest,
    at_deadline: bool,
) -> Option<usize> {
    let oldest = candidates.first()?;
    if req.first_frame {
        return Some(oldest.pos);
    }

    match req.policy {
        SelectionPolicy::Fifo => Some(oldest.pos),
        SelectionPolicy::MatchCount { target } => candidates
            .iter()
            .find(|c| c.sync_count == target)
            .or_else(|| candidates.iter().find(|c| c.sync_count > target))
            .or(at_deadline.then_some(oldest))
            .map(|c| c.pos),
        SelectionPolicy::Sharpest => {
            if candidates.len() < req.count.max(1) && !at_deadline {
                return None;
            }
            let mut best = oldest;
            for candidate in &candidates[1..] {
                let score = candidate.focus_score.unwrap_or(f32::NEG_INFINITY);
                if score > best.focus_score.unwrap_or(f32::NEG_INFINITY) {
                    best = candidate;
                }
            }
            Some(best.pos)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StageId;

    fn candidates(counts: &[u32]) -> Vec<Candidate> {
        counts
            .iter()
            .enumerate()
            .map(|(pos, count)| Candidate {
                pos,
                sync_count: *count,
                focus_score: None,
            })
            .collect()
    }

    fn request(policy: SelectionPolicy) -> SelectRequest {
        SelectRequest::new(BufferTap::dst(StageId::BAYER, 0)).policy(policy)
    }

    #[test]
    fn match_count_prefers_exact_then_later() {
        let held = candidates(&[9, 10, 11]);
        let exact = request(SelectionPolicy::MatchCount { target: 10 });
        assert_eq!(pick(&held, &exact, false), Some(1));

        let missed = candidates(&[7, 12, 13]);
        let late = request(SelectionPolicy::MatchCount { target: 10 });
        assert_eq!(pick(&missed, &late, false), Some(1));

        let early = candidates(&[7, 8]);
        assert_eq!(pick(&early, &late, false), None);
    }

    #[test]
    fn match_count_falls_back_to_oldest_at_deadline() {
        let early = candidates(&[7, 8]);
        let req = request(SelectionPolicy::MatchCount { target: 10 });
        assert_eq!(pick(&early, &req, true), Some(0));
        assert_eq!(pick(&[], &req, true), None);
    }

    #[test]
    fn duplicate_match_takes_oldest() {
        let held = candidates(&[5, 5, 6]);
        let req = request(SelectionPolicy::MatchCount { target: 5 });
        assert_eq!(pick(&held, &req, false), Some(0));
    }

    #[test]
    fn first_frame_overrides_policy() {
        let held = candidates(&[3, 4]);
        let req = request(SelectionPolicy::MatchCount { target: 100 }).first_frame(true);
        assert_eq!(pick(&held, &req, false), Some(0));
        assert_eq!(pick(&[], &req, false), None);
    }

    #[test]
    fn sharpest_waits_for_count_until_deadline() {
        let mut held = candidates(&[1, 2]);
        held[0].focus_score = Some(0.4);
        held[1].focus_score = Some(0.9);
        let req = request(SelectionPolicy::Sharpest).count(3);
        assert_eq!(pick(&held, &req, false), None);
        assert_eq!(pick(&held, &req, true), Some(1));

        held.push(Candidate {
            pos: 2,
            sync_count: 3,
            focus_score: Some(0.9),
        });
        assert_eq!(pick(&held, &req, false), Some(1));
    }

    #[test]
    fn sync_window_bounds() {
        let filter = HoldFilter::SyncWindow { base: 10, len: 3 };
        assert!(!filter.accepts(10));
        assert!(filter.accepts(11));
        assert!(filter.accepts(13));
        assert!(!filter.accepts(14));
        assert!(HoldFilter::All.accepts(0));
    }
}
