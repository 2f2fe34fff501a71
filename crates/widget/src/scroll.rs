use crate::protocol::FrameMessage;

/// Distance from an edge still treated as being at that edge.
const EDGE_THRESHOLD: f32 = 1.0;
/// Near-bottom distance used to resume follow mode.
const AUTO_FOLLOW_RESUME_THRESHOLD: f32 = 24.0;

/// Tracks the message list scroll position for edge passthrough and tail following.
///
/// Offsets grow downward: `0` is the top, `max_offset` the bottom.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollEdgeTracker {
    offset: f32,
    max_offset: f32,
    follow_bottom: bool,
}

impl ScrollEdgeTracker {
    pub fn new() -> Self {
        Self {
            offset: 0.0,
            max_offset: 0.0,
            follow_bottom: true,
        }
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    /// Records the list geometry after layout or a user scroll.
    pub fn update(&mut self, offset: f32, max_offset: f32) {
        let max_offset = max_offset.max(0.0);
        let offset = offset.clamp(0.0, max_offset);
        let content_size_changed = (max_offset - self.max_offset).abs() > EDGE_THRESHOLD;
        let scrolled_up = offset < self.offset - EDGE_THRESHOLD && !content_size_changed;

        if self.follow_bottom {
            if scrolled_up {
                self.follow_bottom = false;
            }
        } else if max_offset - offset <= AUTO_FOLLOW_RESUME_THRESHOLD {
            self.follow_bottom = true;
        }

        self.offset = offset;
        self.max_offset = max_offset;
    }

    pub fn is_at_top(&self) -> bool {
        self.offset <= EDGE_THRESHOLD
    }

    pub fn is_at_bottom(&self) -> bool {
        self.max_offset - self.offset <= EDGE_THRESHOLD
    }

    /// Returns a passthrough message when a wheel gesture pushes past an edge.
    pub fn passthrough(&self, delta_y: f32) -> Option<FrameMessage> {
        let pushes_past_edge =
            (delta_y < 0.0 && self.is_at_top()) || (delta_y > 0.0 && self.is_at_bottom());
        pushes_past_edge.then(|| FrameMessage::ScrollPassthrough {
            delta_y: f64::from(delta_y),
        })
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for ScrollEdgeTracker {
    fn default() -> Self {
        Self::new()
    }
}
