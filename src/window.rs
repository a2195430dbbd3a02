use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

/// Overlap at or above this ratio counts as the same detection.
pub(crate) const NMS_IOU_THRESHOLD: f32 = 0.5;

/// A template surviving hash voting for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub template_id: u32,
    pub votes: u32,
}

/// A sliding-window detection hypothesis. Created by the objectness filter,
/// its candidate list is grown by the hasher and pruned by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub rect: Rect,
    /// Ordered by votes descending, ties by template id ascending.
    pub candidates: Vec<Candidate>,
}

impl Window {
    pub fn new(rect: Rect) -> Window {
        Window { rect, candidates: Vec::new() }
    }

    pub fn top_left(&self) -> (i32, i32) {
        (self.rect.left(), self.rect.top())
    }

    pub fn bottom_right(&self) -> (i32, i32) {
        (
            self.rect.left() + self.rect.width() as i32,
            self.rect.top() + self.rect.height() as i32,
        )
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }
}

/// A verified detection. The reported pose is the matched template's pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub window_rect: Rect,
    pub template_id: u32,
    /// Sum of the five cascade test scores, at most five times the feature
    /// point count.
    pub score: u32,
}

/// Intersection over union of two rectangles.
pub(crate) fn iou(a: &Rect, b: &Rect) -> f32 {
    let x1 = a.left().max(b.left());
    let y1 = a.top().max(b.top());
    let x2 = (a.left() + a.width() as i32).min(b.left() + b.width() as i32);
    let y2 = (a.top() + a.height() as i32).min(b.top() + b.height() as i32);

    let iw = (x2 - x1).max(0) as f32;
    let ih = (y2 - y1).max(0) as f32;
    let inter = iw * ih;
    let union = (a.width() * a.height() + b.width() * b.height()) as f32 - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// Greedy non-maximum suppression: keep the highest-scoring match, drop
/// everything overlapping it at `NMS_IOU_THRESHOLD` or more, repeat.
pub(crate) fn non_max_suppression(mut matches: Vec<Match>) -> Vec<Match> {
    matches.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.window_rect.top().cmp(&b.window_rect.top()))
            .then(a.window_rect.left().cmp(&b.window_rect.left()))
            .then(a.template_id.cmp(&b.template_id))
    });

    let mut kept: Vec<Match> = Vec::new();
    for m in matches {
        let overlaps = kept
            .iter()
            .any(|k| iou(&k.window_rect, &m.window_rect) >= NMS_IOU_THRESHOLD);
        if !overlaps {
            kept.push(m);
        }
    }
    kept
}
