//! The Player filter: reads a Matroska file back out sequentially, one
//! output pin per track, driven by an external ticker.
//!
//! As with [`crate::recorder::Recorder`], every public method takes the
//! filter's single lock for its entire duration (`SPEC_FULL.md` §2).

use std::path::Path;
use std::sync::Mutex;

use failure::Error;

use crate::error::precondition;
use crate::format::{Format, MediaKind};
use crate::frame::Buffer;
use crate::matroska::Matroska;
use crate::rfc3984::{NullRfc3984, Rfc3984};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Paused,
    Playing,
}

/// An asynchronous notification the player raises between ticks. Currently
/// just end-of-file (`SPEC_FULL.md` §4.6 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Eof,
}

/// What one [`Player::tick`] call produced: per-pin output buffers (in
/// emission order) plus any filter-level events raised during the tick.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub pins: Vec<Vec<Buffer>>,
    pub events: Vec<Event>,
}

struct OutputPin {
    /// Which kind of default track this pin is wired to (video or audio);
    /// fixed at construction, mirroring the recorder's per-pin format
    /// declaration.
    kind: MediaKind,
    track_number: Option<u64>,
    format: Option<Format>,
    is_first_frame: bool,
    rfc3984: Box<dyn Rfc3984 + Send>,
}

struct Inner {
    state: State,
    mkv: Option<Matroska>,
    pins: Vec<OutputPin>,
    /// Output timeline, in the container's 1 kHz ticks; advanced by the
    /// ticker's interval every `Playing` tick.
    virtual_time: i64,
    /// The block `read_frame` would currently return, if any, buffered so a
    /// tick can compare its timecode against `virtual_time` before consuming
    /// it.
    pending: Option<(u64, crate::frame::ContainerFrame)>,
}

/// Plays one or more Matroska tracks back out to fixed output pins.
///
/// `pin_kinds` fixes what each output pin carries: `Player::new(vec![
/// MediaKind::Video, MediaKind::Audio])` gives the conventional two-pin
/// layout (`SPEC_FULL.md` §6, default N=2) where pin 0 is the default video
/// track and pin 1 the default audio track.
pub struct Player {
    inner: Mutex<Inner>,
}

impl Player {
    pub fn new(pin_kinds: Vec<MediaKind>) -> Self {
        Player {
            inner: Mutex::new(Inner {
                state: State::Closed,
                mkv: None,
                pins: pin_kinds
                    .into_iter()
                    .map(|kind| OutputPin {
                        kind,
                        track_number: None,
                        format: None,
                        is_first_frame: true,
                        rfc3984: Box::new(NullRfc3984),
                    })
                    .collect(),
                virtual_time: 0,
                pending: None,
            }),
        }
    }

    /// Installs the RFC 3984 packetizer collaborator for `pin`.
    pub fn set_rfc3984(&self, pin: usize, rfc3984: Box<dyn Rfc3984 + Send>) {
        self.inner.lock().unwrap().pins[pin].rfc3984 = rfc3984;
    }

    /// Opens `path` read-only: discovers one default track per configured
    /// pin kind (falling back to the first track of that kind), and
    /// positions the reader at the first block.
    pub fn open(&self, path: &Path) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Closed {
            return Err(precondition("player is already open"));
        }
        let mut mkv = Matroska::open_read(path)?;
        for pin in &mut inner.pins {
            if let Some(track) = mkv.default_track(pin.kind) {
                pin.track_number = Some(track.number);
                pin.format = Some(track.format.clone());
            } else {
                pin.track_number = None;
                pin.format = None;
            }
            pin.is_first_frame = true;
        }
        mkv.first_block()?;
        inner.mkv = Some(mkv);
        inner.virtual_time = 0;
        inner.pending = None;
        inner.state = State::Paused;
        self.refill_pending(&mut *inner)?;
        Ok(())
    }

    /// Moves from `Paused` to `Playing`.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Paused {
            return Err(precondition("player must be paused to start"));
        }
        inner.state = State::Playing;
        Ok(())
    }

    /// Moves from `Playing` back to `Paused` without rewinding.
    pub fn pause(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Playing => {
                inner.state = State::Paused;
                Ok(())
            }
            State::Paused => Ok(()),
            State::Closed => Err(precondition("player is not open")),
        }
    }

    /// Releases the file and returns to `Closed`. Idempotent: a repeat call
    /// after the player is already `Closed` is a no-op (`SPEC_FULL.md` §5).
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            return Ok(());
        }
        inner.mkv.take();
        for pin in &mut inner.pins {
            pin.track_number = None;
            pin.format = None;
        }
        inner.virtual_time = 0;
        inner.pending = None;
        inner.state = State::Closed;
        Ok(())
    }

    /// The format of whatever track `pin` is wired to, if any.
    pub fn output_format(&self, pin: usize) -> Option<Format> {
        self.inner.lock().unwrap().pins[pin].format.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().state == State::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().state == State::Paused
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().state == State::Closed
    }

    /// Runs one tick of the player's read/rescale/reverse pipeline
    /// (`SPEC_FULL.md` §4.6):
    ///
    /// Advances the virtual clock by `interval_ms`, then emits every block
    /// whose timecode falls before the new virtual time: mapped to its
    /// pin, rescaled from the container's 1 kHz ticks to the pin's codec
    /// rate, and run through the codec module's `reverse` into that pin's
    /// output queue. On end-of-file, raises [`Event::Eof`], rewinds to the
    /// first block, and returns to `Paused`.
    pub fn tick(&self, interval_ms: u64) -> Result<TickOutput, Error> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = TickOutput { pins: (0..inner.pins.len()).map(|_| Vec::new()).collect(), events: Vec::new() };
        if inner.state != State::Playing {
            return Ok(out);
        }
        inner.virtual_time += interval_ms as i64;

        loop {
            let due = match &inner.pending {
                Some((_, frame)) => frame.timestamp < inner.virtual_time,
                None => false,
            };
            if !due {
                break;
            }
            let (track_number, frame) = inner.pending.take().expect("checked above");
            if let Some(pin_index) = inner.pins.iter().position(|p| p.track_number == Some(track_number)) {
                let clock_rate = inner.pins[pin_index].format.as_ref().map(Format::clock_rate).unwrap_or(1000);
                let mut rescaled = frame.clone();
                rescaled.timestamp = rescaled.timestamp * i64::from(clock_rate) / 1000;

                let mkv = inner.mkv.as_mut().expect("playing implies open");
                let track = mkv.track_mut(track_number).expect("pin's track vanished");
                let is_first_frame = inner.pins[pin_index].is_first_frame;
                let rfc3984 = inner.pins[pin_index].rfc3984.as_mut();
                let packets = track.codec.reverse(&rescaled, is_first_frame, rfc3984)?;
                inner.pins[pin_index].is_first_frame = false;
                out.pins[pin_index].extend(packets);
            }

            let mkv = inner.mkv.as_mut().expect("playing implies open");
            mkv.next_block()?;
            if mkv.reader_is_eof() {
                out.events.push(Event::Eof);
                mkv.first_block()?;
                for pin in &mut inner.pins {
                    pin.is_first_frame = true;
                }
                inner.virtual_time = 0;
                inner.state = State::Paused;
                self.refill_pending(&mut *inner)?;
                return Ok(out);
            }
            self.refill_pending(&mut *inner)?;
        }
        Ok(out)
    }

    /// Buffers the block the reader currently points at, if any, into
    /// `inner.pending` without advancing the reader.
    fn refill_pending(&self, inner: &mut Inner) -> Result<(), Error> {
        let mkv = inner.mkv.as_mut().expect("open");
        inner.pending = mkv.read_frame()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matroska::Matroska;
    use crate::recorder::Recorder;
    use bytes::Bytes;

    fn tmp_path(label: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("mkv-filters-player-{}-{}.mkv", label, std::process::id()));
        p
    }

    fn nalu(t: u8, extra: &[u8]) -> Bytes {
        let mut v = vec![0x60 | t];
        v.extend_from_slice(extra);
        Bytes::from(v)
    }

    fn write_fixture(path: &std::path::Path) {
        let rec = Recorder::new(2);
        rec.set_input_format(0, Some(Format::Video { codec: "H264", clock_rate: 90_000, width: 320, height: 240 }))
            .unwrap();
        rec.set_input_format(1, Some(Format::Audio { codec: "pcmu", clock_rate: 8000, channels: 1 })).unwrap();
        rec.open(path, false).unwrap();
        rec.start().unwrap();
        rec.tick(0, vec![vec![Buffer::single(0, nalu(5, &[1, 2, 3]))], vec![Buffer::single(0, Bytes::from_static(b"a0"))]])
            .unwrap();
        rec.tick(33, vec![vec![Buffer::single(3000, nalu(1, &[4]))], vec![Buffer::single(160, Bytes::from_static(b"a1"))]])
            .unwrap();
        rec.stop().unwrap();
        rec.close().unwrap();
    }

    #[test]
    fn plays_back_video_and_audio_to_separate_pins() {
        let path = tmp_path("playback");
        write_fixture(&path);

        let player = Player::new(vec![MediaKind::Video, MediaKind::Audio]);
        player.open(&path).unwrap();
        player.start().unwrap();

        let mut video_frames = 0;
        let mut audio_frames = 0;
        let mut events = Vec::new();
        for _ in 0..20 {
            let tick = player.tick(10).unwrap();
            video_frames += tick.pins[0].len();
            audio_frames += tick.pins[1].len();
            events.extend(tick.events);
            if !events.is_empty() {
                break;
            }
        }

        assert_eq!(events, vec![Event::Eof]);
        // 3 packets for the keyframe access unit (sps, pps, idr) + 1 for the
        // trailing P-frame access unit.
        assert_eq!(video_frames, 4);
        assert_eq!(audio_frames, 2);
        assert!(player.is_paused());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn keyframe_is_preceded_by_sps_pps_on_playback() {
        let path = tmp_path("sps-pps");
        write_fixture(&path);

        let player = Player::new(vec![MediaKind::Video, MediaKind::Audio]);
        player.open(&path).unwrap();
        player.start().unwrap();
        let tick = player.tick(10).unwrap();
        // sps, pps, idr
        assert_eq!(tick.pins[0].len(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopening_closed_file_reads_default_tracks() {
        let path = tmp_path("reopen");
        write_fixture(&path);
        let mkv = Matroska::open_read(&path).unwrap();
        assert_eq!(mkv.tracks().len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn restarting_after_eof_replays_from_the_first_block() {
        let path = tmp_path("replay");
        write_fixture(&path);

        let player = Player::new(vec![MediaKind::Video, MediaKind::Audio]);
        player.open(&path).unwrap();
        player.start().unwrap();

        let mut first_pass_video = 0;
        loop {
            let tick = player.tick(10).unwrap();
            first_pass_video += tick.pins[0].len();
            if tick.events.contains(&Event::Eof) {
                break;
            }
        }
        assert!(player.is_paused());

        // A second run must see the same frames again, not silently produce
        // nothing because the rewound reader was never reloaded.
        player.start().unwrap();
        let mut second_pass_video = 0;
        let mut saw_eof = false;
        for _ in 0..20 {
            let tick = player.tick(10).unwrap();
            second_pass_video += tick.pins[0].len();
            if tick.events.contains(&Event::Eof) {
                saw_eof = true;
                break;
            }
        }
        assert!(saw_eof, "second playback pass never reached EOF");
        assert_eq!(second_pass_video, first_pass_video);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn close_is_idempotent() {
        let path = tmp_path("double-close");
        write_fixture(&path);
        let player = Player::new(vec![MediaKind::Video, MediaKind::Audio]);
        player.open(&path).unwrap();
        player.close().unwrap();
        player.close().unwrap();
        assert!(player.is_closed());
        let _ = std::fs::remove_file(&path);
    }
}
