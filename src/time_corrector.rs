//! Aligns each pin's native-clock timestamps onto one output timeline,
//! anchored to the external ticker.
//!
//! Every pin arrives with its own native timestamp domain (an RTP clock, a
//! sample counter, ...) with no fixed relationship to any other pin's. The
//! ticker is the one clock all pins share. On a pin's first frame since the
//! last [`TimeCorrector::reset`], this records the offset between that pin's
//! native timestamp and the ticker-derived output timeline; every later
//! frame on that pin is corrected by the same offset, so pins stay in sync
//! even though their native clocks started at arbitrary values.

/// Output timeline is in the same 1 ms ticks Matroska's `TimecodeScale` uses.
pub struct TimeCorrector {
    /// The output timestamp corresponding to ticker time zero — `0` for a
    /// fresh recording, or the file's existing duration when appending.
    global_origin: u64,
    /// `output_ms = ticker_ms + global_offset`, fixed on the first tick seen
    /// after construction or a `reset`.
    global_offset: Option<i64>,
    pin_offsets: Vec<Option<i64>>,
}

impl TimeCorrector {
    pub fn new(pin_count: usize, global_origin: u64) -> Self {
        TimeCorrector { global_origin, global_offset: None, pin_offsets: vec![None; pin_count] }
    }

    /// Forgets every offset, as though freshly constructed with the same
    /// `global_origin`. Used when the recorder restarts after a pause/stop.
    pub fn reset(&mut self) {
        self.global_offset = None;
        for o in &mut self.pin_offsets {
            *o = None;
        }
    }

    /// Maps `native_timestamp` on `pin`, observed at ticker time
    /// `ticker_ms`, onto the output timeline.
    pub fn correct(&mut self, pin: usize, native_timestamp: i64, ticker_ms: u64) -> i64 {
        let global_offset = *self.global_offset.get_or_insert_with(|| self.global_origin as i64 - ticker_ms as i64);
        let output_now = ticker_ms as i64 + global_offset;
        let pin_offset = *self.pin_offsets[pin].get_or_insert_with(|| output_now - native_timestamp);
        native_timestamp + pin_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_on_each_pin_anchors_to_global_origin() {
        let mut c = TimeCorrector::new(2, 0);
        assert_eq!(c.correct(0, 1_000_000, 100), 0);
        assert_eq!(c.correct(1, 500, 100), 0);
    }

    #[test]
    fn later_frames_track_native_clock_deltas() {
        let mut c = TimeCorrector::new(1, 0);
        assert_eq!(c.correct(0, 1_000_000, 100), 0);
        assert_eq!(c.correct(0, 1_000_090, 100), 90);
    }

    #[test]
    fn append_anchors_to_existing_duration() {
        let mut c = TimeCorrector::new(1, 5_000);
        assert_eq!(c.correct(0, 0, 0), 5_000);
    }

    #[test]
    fn reset_forgets_offsets_but_keeps_global_origin() {
        let mut c = TimeCorrector::new(1, 0);
        c.correct(0, 1_000_000, 100);
        c.reset();
        assert_eq!(c.correct(0, 2_000_000, 300), 0);
    }
}
