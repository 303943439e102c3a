//! The Recorder filter: records one or more pins of access units into a
//! Matroska file, driven by an external ticker.
//!
//! Every public method takes the same single lock for its entire duration
//! (`SPEC_FULL.md` §2 concurrency model) — there is no internal suspension
//! point, so two calls never interleave.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use failure::Error;

use crate::error::{invariant, precondition};
use crate::format::Format;
use crate::frame::Buffer;
use crate::matroska::Matroska;
use crate::muxer::Muxer;
use crate::rfc3984::{NullRfc3984, Rfc3984};
use crate::time_corrector::TimeCorrector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Paused,
    Running,
}

struct PinState {
    format: Option<Format>,
    track_number: Option<u64>,
    /// Set false when appending to a file whose tracks don't offer a match
    /// for this pin's format, or when the pin was explicitly disabled via
    /// `set_input_format(pin, None)` (`SPEC_FULL.md` §3's pin-disable
    /// semantics); frames on a disabled pin are silently dropped rather than
    /// failing.
    enabled: bool,
    /// Cleared once the first keyframe since `start` has been seen; only
    /// meaningful for video pins (`SPEC_FULL.md` §4.5's key-frame gate).
    need_key_frame: bool,
    rfc3984: Box<dyn Rfc3984 + Send>,
}

impl Default for PinState {
    fn default() -> Self {
        PinState {
            format: None,
            track_number: None,
            enabled: false,
            need_key_frame: true,
            rfc3984: Box::new(NullRfc3984),
        }
    }
}

struct Inner {
    state: State,
    path: Option<PathBuf>,
    mkv: Option<Matroska>,
    pins: Vec<PinState>,
    corrector: Option<TimeCorrector>,
    muxer: Option<Muxer>,
}

/// Records one or more media pins into a single Matroska file.
pub struct Recorder {
    inner: Mutex<Inner>,
}

impl Recorder {
    pub fn new(pin_count: usize) -> Self {
        Recorder {
            inner: Mutex::new(Inner {
                state: State::Closed,
                path: None,
                mkv: None,
                pins: (0..pin_count).map(|_| PinState::default()).collect(),
                corrector: None,
                muxer: None,
            }),
        }
    }

    /// Installs the RFC 3984 (de)packetizer collaborator for `pin`. Defaults
    /// to [`NullRfc3984`] (whole-NALU passthrough) if never called; the real
    /// pipeline framework supplies its own depacketizer per video pin.
    pub fn set_rfc3984(&self, pin: usize, rfc3984: Box<dyn Rfc3984 + Send>) {
        self.inner.lock().unwrap().pins[pin].rfc3984 = rfc3984;
    }

    /// Declares, clears, or (while open) resizes a pin's format.
    ///
    /// `None` disables the pin for the rest of the session, but only while
    /// `Closed` (`SPEC_FULL.md` §3); disabling an already-open pin is a
    /// precondition error. A format change after the file is open is only
    /// ever accepted as a video resize of the same codec/rate.
    pub fn set_input_format(&self, pin: usize, format: Option<Format>) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match format {
            None => {
                if inner.state != State::Closed {
                    return Err(precondition("cannot disable a pin while the recorder is open"));
                }
                inner.pins[pin].format = None;
            }
            Some(format) => {
                if inner.pins[pin].track_number.is_some() {
                    let existing = inner.pins[pin].format.clone().expect("a track implies a format");
                    if !existing.is_compatible_resize(&format) && existing != format {
                        return Err(precondition("format change is not a compatible resize"));
                    }
                }
                inner.pins[pin].format = Some(format);
            }
        }
        Ok(())
    }

    /// Opens `path`, creating it fresh or appending to an existing file.
    pub fn open(&self, path: &Path, append: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Closed {
            return Err(precondition("recorder is already open"));
        }
        let mut mkv = if append { Matroska::open_append(path)? } else { Matroska::create(path)? };

        let pin_count = inner.pins.len();
        for pin in 0..pin_count {
            let format = match inner.pins[pin].format.clone() {
                Some(f) => f,
                None => continue,
            };
            if append {
                let existing = mkv
                    .tracks()
                    .iter()
                    .find(|t| t.format.kind() == format.kind() && t.format.codec() == format.codec())
                    .map(|t| t.number);
                match existing {
                    Some(number) => {
                        inner.pins[pin].track_number = Some(number);
                        inner.pins[pin].enabled = true;
                    }
                    None => {
                        log::warn!("pin {} has no matching track in {:?}; disabling", pin, path);
                        inner.pins[pin].enabled = false;
                    }
                }
            } else {
                let number = mkv.add_track(format)?;
                inner.pins[pin].track_number = Some(number);
                inner.pins[pin].enabled = true;
            }
        }

        let global_origin = mkv.duration();
        inner.corrector = Some(TimeCorrector::new(pin_count, global_origin));
        inner.muxer = Some(Muxer::new(pin_count));
        inner.path = Some(path.to_path_buf());
        inner.mkv = Some(mkv);
        inner.state = State::Paused;
        Ok(())
    }

    /// Moves from `Paused` to `Running`: frames start being accepted, every
    /// pin's time-correction offset is recomputed from this point, and the
    /// key-frame gate rearms on every video pin.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Paused {
            return Err(precondition("recorder must be paused to start"));
        }
        inner.corrector.as_mut().expect("open sets a corrector").reset();
        for pin in &mut inner.pins {
            pin.need_key_frame = true;
        }
        inner.state = State::Running;
        Ok(())
    }

    /// Stops accepting frames, closes the current cluster, and flushes the
    /// internal muxer queues, without finalizing the file. A later `start`
    /// resumes recording.
    pub fn pause(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Running => {
                inner.mkv.as_mut().expect("running implies open").close_cluster()?;
                inner.muxer = Some(Muxer::new(inner.pins.len()));
                inner.state = State::Paused;
                Ok(())
            }
            State::Paused => Ok(()),
            State::Closed => Err(precondition("recorder is not open")),
        }
    }

    /// Synonym for `pause` used at the end of a recording session before
    /// `close`.
    pub fn stop(&self) -> Result<(), Error> {
        self.pause()
    }

    /// Finalizes the file (rendering Tracks/Cues/Info/SeekHead and pruning
    /// blockless tracks) and returns to `Closed`. Idempotent: a repeat call
    /// after the recorder is already `Closed` is a no-op (`SPEC_FULL.md` §5,
    /// "`close` is the termination mechanism and is idempotent after first
    /// call").
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return Ok(());
        }
        if inner.state == State::Running {
            inner.mkv.as_mut().expect("running implies open").close_cluster()?;
        }
        let mut mkv = inner.mkv.take().expect("non-Closed state implies an open file");
        mkv.finalize()?;
        for pin in &mut inner.pins {
            pin.track_number = None;
            pin.enabled = false;
            pin.need_key_frame = true;
        }
        inner.corrector = None;
        inner.muxer = None;
        inner.path = None;
        inner.state = State::Closed;
        Ok(())
    }

    /// Runs one tick of the recorder's per-pin ingest/mux/write pipeline
    /// (`SPEC_FULL.md` §4.5):
    ///
    /// 1. If not `Running`, every pin's queued input is simply dropped (the
    ///    caller already dequeued it from its own input pin, so not using it
    ///    here accomplishes the "drain and discard" behavior).
    /// 2. Otherwise, for each enabled pin: reassemble transport packets into
    ///    access units, rescale each unit's timestamp from its codec's native
    ///    clock rate to 1 kHz, apply the video key-frame gate, apply the time
    ///    corrector, and enqueue onto the muxer.
    /// 3. Drain the muxer in ascending corrected-timestamp order, building
    ///    and writing one container frame per buffer, applying the cluster
    ///    segmentation policy, and cueing video keyframes.
    ///
    /// `inputs[pin]` is the batch of raw transport packets that arrived on
    /// that pin since the last tick; pins beyond `inputs.len()` are treated
    /// as having no new input this tick.
    pub fn tick(&self, ticker_ms: u64, mut inputs: Vec<Vec<Buffer>>) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner: &mut Inner = &mut guard;

        if inner.state != State::Running {
            return Ok(());
        }

        let pin_count = inner.pins.len();
        inputs.resize_with(pin_count, Vec::new);

        for (pin, packets) in inputs.into_iter().enumerate() {
            if !inner.pins[pin].enabled || packets.is_empty() {
                continue;
            }
            let track_number = inner.pins[pin].track_number.expect("enabled pin has a track");
            let clock_rate = inner.pins[pin]
                .format
                .as_ref()
                .expect("enabled pin has a format")
                .clock_rate();

            let units = {
                let mkv = inner.mkv.as_mut().expect("running implies open");
                let track = mkv.track_mut(track_number).ok_or_else(|| invariant("pin's track vanished"))?;
                let rfc3984 = inner.pins[pin].rfc3984.as_mut();
                track.codec.preprocess(packets, rfc3984)?
            };

            for mut unit in units {
                unit.timestamp = unit.timestamp * 1000 / i64::from(clock_rate);

                let mkv = inner.mkv.as_mut().expect("running implies open");
                let track = mkv.track_mut(track_number).expect("pin's track vanished mid-tick");
                if track.is_video() && inner.pins[pin].need_key_frame {
                    if !track.codec.is_keyframe(&unit) {
                        continue;
                    }
                    inner.pins[pin].need_key_frame = false;
                }

                let corrector = inner.corrector.as_mut().expect("running implies a corrector");
                unit.timestamp = corrector.correct(pin, unit.timestamp, ticker_ms);

                inner.muxer.as_mut().expect("running implies a muxer").put(pin, unit);
            }
        }

        loop {
            let (pin, buf) = match inner.muxer.as_mut().expect("running implies a muxer").get() {
                Some(x) => x,
                None => break,
            };
            let track_number = inner.pins[pin]
                .track_number
                .ok_or_else(|| invariant("muxer held a buffer for a disabled pin"))?;
            let mkv = inner.mkv.as_mut().expect("running implies open");
            let is_video = mkv
                .track(track_number)
                .ok_or_else(|| invariant("pin's track vanished"))?
                .is_video();
            let frame = {
                let track = mkv.track_mut(track_number).unwrap();
                track.codec.process(buf)?
            };

            if !mkv.has_current_cluster() {
                mkv.start_cluster(frame.timestamp as u64)?;
            } else if (is_video && frame.keyframe) || mkv.cluster_would_exceed_max_duration(frame.timestamp as u64) {
                mkv.close_cluster()?;
                mkv.start_cluster(frame.timestamp as u64)?;
            }
            // A write failure here is a per-tick IO error (SPEC_FULL.md §7:
            // "IO errors on writing within a tick log a warning and
            // continue"), not an open/close failure — it must not abort the
            // whole tick or tear down the recording session.
            if let Err(e) = mkv.write_block(track_number, &frame) {
                log::warn!("dropping block for track {}: write failed: {}", track_number, e);
                continue;
            }
            if is_video && frame.keyframe {
                if let Err(e) = mkv.add_cue(track_number) {
                    log::warn!("failed to add cue for track {}: {}", track_number, e);
                }
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().state == State::Running
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().state == State::Paused
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().state == State::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn tmp_path(label: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("mkv-filters-recorder-{}-{}.mkv", label, std::process::id()));
        p
    }

    fn nalu(t: u8, extra: &[u8]) -> Bytes {
        let mut v = vec![0x60 | t];
        v.extend_from_slice(extra);
        Bytes::from(v)
    }

    #[test]
    fn lifecycle_records_video_and_audio() {
        let path = tmp_path("lifecycle");
        let rec = Recorder::new(2);
        rec.set_input_format(0, Some(Format::Video { codec: "H264", clock_rate: 90_000, width: 320, height: 240 }))
            .unwrap();
        rec.set_input_format(1, Some(Format::Audio { codec: "pcmu", clock_rate: 8000, channels: 1 })).unwrap();
        rec.open(&path, false).unwrap();
        rec.start().unwrap();

        // 90kHz video clock: one IDR access unit at t=0, rescales to 0ms.
        rec.tick(0, vec![vec![Buffer::single(0, nalu(5, &[1, 2, 3]))], vec![Buffer::single(0, Bytes::from_static(b"audio"))]])
            .unwrap();
        // Next video access unit 3000 90kHz ticks later == 33ms.
        rec.tick(33, vec![vec![Buffer::single(3000, nalu(1, &[4, 5]))], Vec::new()]).unwrap();

        rec.stop().unwrap();
        rec.close().unwrap();
        assert!(rec.is_closed());

        let mut r = Matroska::open_read(&path).unwrap();
        assert_eq!(r.tracks().len(), 2);
        r.first_block().unwrap();
        let (_, first) = r.read_frame().unwrap().unwrap();
        assert_eq!(first.timestamp, 0);
        assert!(first.keyframe);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn process_before_start_is_rejected_by_silent_discard() {
        let path = tmp_path("not-running");
        let rec = Recorder::new(1);
        rec.set_input_format(0, Some(Format::Audio { codec: "pcmu", clock_rate: 8000, channels: 1 })).unwrap();
        rec.open(&path, false).unwrap();
        // Paused: per SPEC_FULL.md §5, input is drained and discarded, not an error.
        rec.tick(0, vec![vec![Buffer::single(0, Bytes::from_static(b"x"))]]).unwrap();
        rec.close().unwrap();
        let mut r = Matroska::open_read(&path).unwrap();
        assert!(r.tracks().is_empty(), "no blocks were ever written, so the only track was pruned");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn keyframe_gate_drops_leading_p_frames() {
        let path = tmp_path("keyframe-gate");
        let rec = Recorder::new(1);
        rec.set_input_format(0, Some(Format::Video { codec: "H264", clock_rate: 90_000, width: 640, height: 480 }))
            .unwrap();
        rec.open(&path, false).unwrap();
        rec.start().unwrap();

        // Three P-frames (type 1) before any IDR: all dropped by the gate.
        rec.tick(
            0,
            vec![vec![
                Buffer::single(0, nalu(1, &[])),
                Buffer::single(900, nalu(1, &[])),
                Buffer::single(1800, nalu(1, &[])),
            ]],
        )
        .unwrap();
        // The subsequent IDR is the first block actually written.
        rec.tick(30, vec![vec![Buffer::single(2700, nalu(5, &[0xaa]))]]).unwrap();

        rec.stop().unwrap();
        rec.close().unwrap();

        let mut r = Matroska::open_read(&path).unwrap();
        r.first_block().unwrap();
        let (_, frame) = r.read_frame().unwrap().unwrap();
        assert!(frame.keyframe);
        // The gated-open IDR is the first frame the time corrector ever
        // sees on this pin, so it anchors the recording's origin: its
        // output timestamp is 0 regardless of the native/ticker clocks it
        // arrived on.
        assert_eq!(frame.timestamp, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cluster_splits_on_five_second_duration_cap_without_keyframes() {
        let path = tmp_path("duration-cap");
        let rec = Recorder::new(1);
        rec.set_input_format(0, Some(Format::Video { codec: "H264", clock_rate: 1000, width: 640, height: 480 }))
            .unwrap();
        rec.open(&path, false).unwrap();
        rec.start().unwrap();

        rec.tick(0, vec![vec![Buffer::single(0, nalu(5, &[]))]]).unwrap();
        // P-frames only, spaced past the 5000ms cap; 1kHz clock rate means the
        // recorder's ms-rescale is a no-op here.
        rec.tick(0, vec![vec![Buffer::single(6000, nalu(1, &[]))]]).unwrap();

        rec.stop().unwrap();
        rec.close().unwrap();

        let mut r = Matroska::open_read(&path).unwrap();
        r.first_block().unwrap();
        let (_, first) = r.read_frame().unwrap().unwrap();
        assert_eq!(first.timestamp, 0);
        r.next_block().unwrap();
        assert!(!r.reader_is_eof(), "the P-frame past the cap starts a second cluster");
        let (_, second) = r.read_frame().unwrap().unwrap();
        assert_eq!(second.timestamp, 6000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn close_is_idempotent() {
        let path = tmp_path("double-close");
        let rec = Recorder::new(1);
        rec.set_input_format(0, Some(Format::Audio { codec: "pcmu", clock_rate: 8000, channels: 1 })).unwrap();
        rec.open(&path, false).unwrap();
        rec.start().unwrap();
        rec.tick(0, vec![vec![Buffer::single(0, Bytes::from_static(b"a0"))]]).unwrap();
        rec.stop().unwrap();
        rec.close().unwrap();
        rec.close().unwrap();
        assert!(rec.is_closed());
        let _ = std::fs::remove_file(&path);
    }
}
