//! Constant frame-rate placement of frames by presentation timestamp.

/// Gaps longer than this restart the timeline instead of being filled.
pub const MAX_GAP_SECONDS: u64 = 600;

const SECOND_NS: i128 = 1_000_000_000;

/// What an encoder should do with one submitted frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// The frame's slot has already been written.
    Drop,
    /// Repeat the previous frame `repeats` times, then write this one.
    Write { repeats: u64 },
}

/// Tracks how many frames a constant-rate stream holds and where the next one lands.
#[derive(Clone, Debug)]
pub struct FrameTimeline {
    frame_rate: u32,
    first_pts: Option<i64>,
    written: u64,
}

impl FrameTimeline {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
            first_pts: None,
            written: 0,
        }
    }

    /// Frames in the stream so far, repeats included.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Places a frame stamped `pts` and counts every frame the placement writes.
    ///
    /// `can_repeat` is false until a previous frame exists to repeat.
    pub fn place(&mut self, pts: i64, can_repeat: bool) -> Placement {
        let first = *self.first_pts.get_or_insert(pts);
        let slot = frame_slot(pts - first, self.frame_rate);
        if slot < self.written {
            return Placement::Drop;
        }

        let mut repeats = if can_repeat { slot - self.written } else { 0 };
        if repeats > u64::from(self.frame_rate) * MAX_GAP_SECONDS {
            tracing::warn!(
                gap_frames = repeats,
                "presentation time jumped; continuing after the last frame"
            );
            self.first_pts = Some(pts - self.slot_start(self.written));
            repeats = 0;
        }
        self.written += repeats + 1;
        Placement::Write { repeats }
    }

    fn slot_start(&self, slot: u64) -> i64 {
        let nanos = i128::from(slot) * SECOND_NS / i128::from(self.frame_rate);
        i64::try_from(nanos).unwrap_or(i64::MAX)
    }
}

/// Index on the constant-rate timeline for a frame `elapsed_ns` after the first one.
pub fn frame_slot(elapsed_ns: i64, frame_rate: u32) -> u64 {
    if elapsed_ns <= 0 {
        return 0;
    }
    let scaled = elapsed_ns as u128 * u128::from(frame_rate);
    ((scaled + 500_000_000) / 1_000_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND_NS: i64 = 1_000_000_000;

    #[test]
    fn slots_follow_presentation_time() {
        assert_eq!(frame_slot(0, 30), 0);
        assert_eq!(frame_slot(33_000_000, 30), 1);
        assert_eq!(frame_slot(SECOND_NS, 30), 30);
        assert_eq!(frame_slot(-5, 30), 0);
    }

    #[test]
    fn multi_second_gap_is_filled_completely() {
        let mut timeline = FrameTimeline::new(30);
        assert_eq!(timeline.place(0, false), Placement::Write { repeats: 0 });
        assert_eq!(
            timeline.place(3 * SECOND_NS, true),
            Placement::Write { repeats: 89 }
        );
        assert_eq!(
            timeline.place(3 * SECOND_NS + SECOND_NS / 30, true),
            Placement::Write { repeats: 0 }
        );
        assert_eq!(timeline.written(), 92);
    }

    #[test]
    fn early_frames_are_dropped() {
        let mut timeline = FrameTimeline::new(30);
        timeline.place(0, false);
        timeline.place(SECOND_NS / 30, true);
        assert_eq!(timeline.place(SECOND_NS / 60, true), Placement::Drop);
        assert_eq!(timeline.written(), 2);
    }

    #[test]
    fn huge_jump_restarts_after_last_frame() {
        let mut timeline = FrameTimeline::new(30);
        timeline.place(0, false);
        timeline.place(SECOND_NS / 30, true);
        let far = 3_600 * SECOND_NS;
        assert_eq!(timeline.place(far, true), Placement::Write { repeats: 0 });
        assert_eq!(
            timeline.place(far + SECOND_NS / 30, true),
            Placement::Write { repeats: 0 }
        );
        assert_eq!(timeline.written(), 4);
    }
}
