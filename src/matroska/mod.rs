//! The Matroska container engine: segment/cluster lifecycle, track table,
//! cues, and block iteration, built directly on [`crate::ebml`].

pub mod track;

use std::fs::{File, OpenOptions};
use std::path::Path;

use failure::Error;

use crate::ebml::{self, ids, ElementHeader, Reader, Writer};
use crate::error::{format_error, from_io, invariant, precondition};
use crate::format::Format;
use crate::frame::ContainerFrame;

pub use track::Track;

/// Nanoseconds per tick; fixed at 1 ms for this system (`SPEC_FULL.md` §4.2).
pub const TIMECODE_SCALE: u64 = 1_000_000;

/// A cluster is forcibly closed once it has run this long from its own base
/// timecode, regardless of keyframe arrival.
pub const CLUSTER_MAX_DURATION_MS: u64 = 5000;

const SEEKHEAD_RESERVE: u64 = 1024;
const INFO_RESERVE: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Append,
    Read,
}

/// DocType-derived reading profile. Per `SPEC_FULL.md` §9 / spec.md's open
/// question: any DocType other than exactly `"matroska"` falls back to the
/// Matroska-default profile with a warning, rather than reproducing the
/// source's inverted webm check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Matroska,
}

struct ClusterState {
    start_pos: u64,
    size_pos: u64,
    payload_pos: u64,
    timecode: u64,
    block_count: u64,
    last_block_timecode: u64,
}

#[derive(Debug, Clone, Copy)]
struct CueEntry {
    time: u64,
    track: u64,
    cluster_pos: u64,
    block_number: u64,
}

pub struct Matroska {
    file: File,
    pub mode: Mode,
    pub profile: Profile,
    segment_size_pos: u64,
    segment_payload_pos: u64,
    seekhead_region_pos: u64,
    info_region_pos: u64,
    clusters_start_pos: u64,
    cluster: Option<ClusterState>,
    cluster_count: u64,
    tracks: Vec<Track>,
    cues: Vec<CueEntry>,
    /// Duration (ms) already present on file before this session; the time
    /// corrector's `globalOrigin`.
    pub global_origin: u64,
    duration: u64,
    reader_cluster_pos: Option<u64>,
    reader_block_index: usize,
    reader_eof: bool,
}

impl Matroska {
    /// Creates a brand new file: Header, reserved SeekHead/Info regions.
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)
            .map_err(from_io)?;
        let mut w = Writer::new(&file);
        write_ebml_header(&mut w)?;
        let segment_size_pos = w.write_reserved_header(ids::SEGMENT, 0)?;
        let segment_payload_pos = w.pos()?;
        let seekhead_region_pos = w.reserve_raw(SEEKHEAD_RESERVE)?;
        let info_region_pos = w.reserve_raw(INFO_RESERVE)?;
        let clusters_start_pos = w.pos()?;
        Ok(Matroska {
            file,
            mode: Mode::Create,
            profile: Profile::Matroska,
            segment_size_pos,
            segment_payload_pos,
            seekhead_region_pos,
            info_region_pos,
            clusters_start_pos,
            cluster: None,
            cluster_count: 0,
            tracks: Vec::new(),
            cues: Vec::new(),
            global_origin: 0,
            duration: 0,
            reader_cluster_pos: None,
            reader_block_index: 0,
            reader_eof: false,
        })
    }

    /// Opens an existing, previously finalized file for appending: parses
    /// the existing Tracks and Info, preserves old Cues, and positions the
    /// write cursor at the end of the last Cluster (or just past Info if
    /// there are none).
    pub fn open_append(path: &Path) -> Result<Self, Error> {
        Self::open_existing(path, Mode::Append, true)
    }

    /// Opens an existing file read-only, for sequential playback.
    pub fn open_read(path: &Path) -> Result<Self, Error> {
        Self::open_existing(path, Mode::Read, false)
    }

    fn open_existing(path: &Path, mode: Mode, writable: bool) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(writable).open(path).map_err(from_io)?;
        let mut r = Reader::new(&file);
        let header = r.read_header()?.ok_or_else(|| format_error("empty file: no EBML header"))?;
        if header.id != ids::EBML_HEADER {
            return Err(format_error("file does not start with an EBML header"));
        }
        let profile = read_profile(&mut r, &header)?;
        r.skip(&header)?;

        let seg_header = r.read_header()?.ok_or_else(|| format_error("no Segment element"))?;
        if seg_header.id != ids::SEGMENT {
            return Err(format_error("expected Segment after EBML header"));
        }
        let segment_payload_pos = seg_header.payload_pos;
        let segment_end = if seg_header.size == 0 { None } else { Some(seg_header.payload_pos + seg_header.size) };

        let mut tracks = Vec::new();
        let mut cues = Vec::new();
        let mut duration = 0u64;
        // Falls back to just past both reserved regions if the file has no
        // Cluster yet (e.g. opened for append right after being created).
        let mut clusters_start_pos = segment_payload_pos + SEEKHEAD_RESERVE + INFO_RESERVE;
        let mut write_cursor_candidate = segment_payload_pos;

        loop {
            if let Some(end) = segment_end {
                if r.pos()? >= end {
                    break;
                }
            }
            let child_start = r.pos()?;
            let h = match r.read_header()? {
                None => break,
                Some(h) => h,
            };
            match h.id {
                ids::INFO => {
                    let payload = r.read_payload(&h)?;
                    duration = parse_info_duration(&payload);
                    write_cursor_candidate = h.payload_pos + h.size;
                }
                ids::TRACKS => {
                    let payload = r.read_payload(&h)?;
                    tracks = parse_tracks(&payload)?;
                }
                ids::CUES => {
                    let payload = r.read_payload(&h)?;
                    cues = parse_cues(&payload, segment_payload_pos);
                }
                ids::CLUSTER => {
                    clusters_start_pos = clusters_start_pos.min(child_start);
                    r.skip(&h)?;
                    write_cursor_candidate = h.payload_pos + h.size;
                }
                _ => {
                    r.skip(&h)?;
                    write_cursor_candidate = h.payload_pos + h.size;
                }
            }
        }

        drop(r);
        if writable {
            let mut w = Writer::new(&file);
            w.seek_to(write_cursor_candidate)?;
        }

        Ok(Matroska {
            file,
            mode,
            profile,
            segment_size_pos: segment_payload_pos - 8,
            segment_payload_pos,
            // This crate always writes the reserved SeekHead region
            // immediately after the segment payload starts, followed
            // immediately by the reserved Info region (see `create`) — a
            // fixed layout we can rely on since append only ever reopens a
            // file this same engine produced.
            seekhead_region_pos: segment_payload_pos,
            info_region_pos: segment_payload_pos + SEEKHEAD_RESERVE,
            clusters_start_pos,
            cluster: None,
            cluster_count: 0,
            tracks,
            cues,
            global_origin: duration,
            duration,
            reader_cluster_pos: None,
            reader_block_index: 0,
            reader_eof: false,
        })
    }

    // ---- track table ----

    pub fn add_track(&mut self, format: Format) -> Result<u64, Error> {
        let number = self.tracks.len() as u64 + 1;
        let track = Track::new(number, format)?;
        self.tracks.push(track);
        Ok(number)
    }

    pub fn track(&self, number: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.number == number)
    }

    pub fn track_mut(&mut self, number: u64) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.number == number)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// The first track of `kind` flagged default, falling back to the first
    /// track of that kind at all (`SPEC_FULL.md` §3, default+fallback
    /// selection).
    pub fn default_track(&self, kind: crate::format::MediaKind) -> Option<&Track> {
        let of_kind = || self.tracks.iter().filter(move |t| t.format.kind() == kind);
        of_kind().find(|t| t.flag_default).or_else(|| of_kind().next())
    }

    // ---- cluster lifecycle ----

    pub fn has_current_cluster(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn current_cluster_timecode(&self) -> Option<u64> {
        self.cluster.as_ref().map(|c| c.timecode)
    }

    /// Starts a new cluster at `timecode_ms`. Caller (the recorder's
    /// segmentation policy) must `close_cluster` first if one is open.
    pub fn start_cluster(&mut self, timecode_ms: u64) -> Result<(), Error> {
        if self.cluster.is_some() {
            return Err(precondition("a cluster is already open"));
        }
        let mut w = Writer::new(&self.file);
        let start_pos = w.pos()?;
        let size_pos = w.write_reserved_header(ids::CLUSTER, 0)?;
        let mut tc = Vec::new();
        ebml::push_uint(&mut tc, ids::TIMECODE, timecode_ms);
        w.write_bytes(&tc)?;
        let payload_pos = w.pos()?;
        self.cluster = Some(ClusterState {
            start_pos,
            size_pos,
            payload_pos,
            timecode: timecode_ms,
            block_count: 0,
            last_block_timecode: timecode_ms,
        });
        Ok(())
    }

    /// Closes the current cluster, if any: back-patches its size, or
    /// replaces it in place with an equally-sized Void if it never received
    /// a block.
    pub fn close_cluster(&mut self) -> Result<(), Error> {
        let cs = match self.cluster.take() {
            None => return Ok(()),
            Some(cs) => cs,
        };
        let mut w = Writer::new(&self.file);
        let end_pos = w.pos()?;
        if cs.block_count == 0 {
            let total_len = end_pos - cs.start_pos;
            w.seek_to(cs.start_pos)?;
            w.write_void(total_len)?;
        } else {
            let size = end_pos - cs.payload_pos;
            w.backpatch_size8(cs.size_pos, size)?;
            self.cluster_count += 1;
        }
        Ok(())
    }

    /// Whether writing a block timestamped `candidate_ms` into the current
    /// cluster would push it past the 5-second cap from its own base
    /// timecode — the recorder's segmentation policy checks this *before*
    /// writing, so the cap is never exceeded rather than detected after the
    /// fact.
    pub fn cluster_would_exceed_max_duration(&self, candidate_ms: u64) -> bool {
        match &self.cluster {
            None => false,
            Some(cs) => candidate_ms.saturating_sub(cs.timecode) > CLUSTER_MAX_DURATION_MS,
        }
    }

    // ---- blocks ----

    /// Writes a SimpleBlock into the current cluster.
    pub fn write_block(&mut self, track_number: u64, frame: &ContainerFrame) -> Result<(), Error> {
        let relative = {
            let cs = self.cluster.as_ref().ok_or_else(|| precondition("no current cluster"))?;
            frame.timestamp - cs.timecode as i64
        };
        if !(i64::from(i16::MIN)..=i64::from(i16::MAX)).contains(&relative) {
            return Err(format_error("block timecode does not fit the current cluster"));
        }
        let mut payload = Vec::with_capacity(frame.data.len() + 8);
        payload.extend(ebml::encode_size_minimal(track_number));
        payload.extend(&(relative as i16).to_be_bytes());
        payload.push(if frame.keyframe { 0x80 } else { 0x00 });
        payload.extend_from_slice(&frame.data);

        let mut w = Writer::new(&self.file);
        w.write_element(ids::SIMPLE_BLOCK, &payload)?;

        let cs = self.cluster.as_mut().unwrap();
        cs.block_count += 1;
        cs.last_block_timecode = frame.timestamp as u64;

        if let Some(t) = self.track_mut(track_number) {
            t.blocks_written += 1;
        }
        self.duration = self.duration.max(frame.timestamp as u64);
        Ok(())
    }

    /// Adds a cue pointing at the block just written to the current
    /// cluster.
    pub fn add_cue(&mut self, track_number: u64) -> Result<(), Error> {
        let cs = self.cluster.as_ref().ok_or_else(|| precondition("no current cluster to cue"))?;
        self.cues.push(CueEntry {
            time: cs.last_block_timecode,
            track: track_number,
            cluster_pos: cs.start_pos,
            block_number: cs.block_count,
        });
        Ok(())
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    // ---- finalization ----

    /// Closes the segment: see `SPEC_FULL.md` / spec.md §4.2 "Finalization".
    pub fn finalize(&mut self) -> Result<(), Error> {
        self.close_cluster()?;

        // Track pruning on close (SPEC_FULL.md §3): drop any track that
        // never received a block. A track loaded from an existing file via
        // `open_append` already has blocks from a prior session even if this
        // one added none to it, so it's exempt from the check.
        self.tracks.retain(|t| t.blocks_written > 0 || t.loaded_from_file);

        let mut w = Writer::new(&self.file);

        // Tracks and Cues are appended as a trailer right after the last
        // cluster.
        w.seek_end()?;
        let tracks_pos = w.pos()?;
        let mut tracks_payload = Vec::new();
        for t in &self.tracks {
            ebml::push_element(&mut tracks_payload, ids::TRACK_ENTRY, &t.build_entry());
        }
        w.write_element(ids::TRACKS, &tracks_payload)?;

        let cues_pos = if self.cues.is_empty() {
            None
        } else {
            let pos = w.pos()?;
            let mut cues_payload = Vec::new();
            for cue in &self.cues {
                let mut point = Vec::new();
                ebml::push_uint(&mut point, ids::CUE_TIME, cue.time);
                let mut positions = Vec::new();
                ebml::push_uint(&mut positions, ids::CUE_TRACK, cue.track);
                ebml::push_uint(
                    &mut positions,
                    ids::CUE_CLUSTER_POSITION,
                    cue.cluster_pos - self.segment_payload_pos,
                );
                ebml::push_uint(&mut positions, ids::CUE_BLOCK_NUMBER, cue.block_number);
                ebml::push_element(&mut point, ids::CUE_TRACK_POSITIONS, &positions);
                ebml::push_element(&mut cues_payload, ids::CUE_POINT, &point);
            }
            w.write_element(ids::CUES, &cues_payload)?;
            Some(pos)
        };

        let eof = w.pos()?;

        // Info, rendered into its reserved region.
        w.seek_to(self.info_region_pos)?;
        let info_pos = w.pos()?;
        let mut info_payload = Vec::new();
        ebml::push_uint(&mut info_payload, ids::TIMECODE_SCALE, TIMECODE_SCALE);
        ebml::push_float(&mut info_payload, ids::DURATION, (self.duration + 1) as f64);
        ebml::push_string(&mut info_payload, ids::MUXING_APP, "libmediastreamer2");
        ebml::push_string(&mut info_payload, ids::WRITING_APP, "libmediastreamer2");
        w.write_element(ids::INFO, &info_payload)?;
        let info_used = w.pos()? - info_pos;
        if INFO_RESERVE > info_used {
            w.write_void(INFO_RESERVE - info_used)?;
        } else if INFO_RESERVE < info_used {
            return Err(invariant("Info element grew past its reserved region"));
        }

        // SeekHead, rendered into its reserved region, now that Info/Tracks/
        // Cues positions are all known.
        w.seek_to(self.seekhead_region_pos)?;
        let seekhead_pos = w.pos()?;
        let mut seekhead_payload = Vec::new();
        push_seek_point(&mut seekhead_payload, ids::INFO, info_pos - self.segment_payload_pos);
        push_seek_point(&mut seekhead_payload, ids::TRACKS, tracks_pos - self.segment_payload_pos);
        if let Some(pos) = cues_pos {
            push_seek_point(&mut seekhead_payload, ids::CUES, pos - self.segment_payload_pos);
        }
        w.write_element(ids::SEEK_HEAD, &seekhead_payload)?;
        let seekhead_used = w.pos()? - seekhead_pos;
        if SEEKHEAD_RESERVE > seekhead_used {
            w.write_void(SEEKHEAD_RESERVE - seekhead_used)?;
        } else if SEEKHEAD_RESERVE < seekhead_used {
            return Err(invariant("SeekHead element grew past its reserved region"));
        }

        w.backpatch_size8(self.segment_size_pos, eof - self.segment_payload_pos)?;
        w.seek_to(eof)?;
        self.file.set_len(eof).map_err(from_io)?;
        Ok(())
    }

    // ---- block iteration (player side) ----

    /// Positions the reader at the first block in the file.
    pub fn first_block(&mut self) -> Result<(), Error> {
        self.reader_cluster_pos = Some(self.clusters_start_pos);
        self.reader_block_index = 0;
        self.reader_eof = false;
        self.advance_to_first_nonempty_cluster()
    }

    fn advance_to_first_nonempty_cluster(&mut self) -> Result<(), Error> {
        loop {
            let pos = match self.reader_cluster_pos {
                None => {
                    self.reader_eof = true;
                    return Ok(());
                }
                Some(p) => p,
            };
            let mut r = Reader::new(&self.file);
            r.seek_to(pos)?;
            let h = match r.read_header()? {
                None => {
                    self.reader_eof = true;
                    return Ok(());
                }
                Some(h) => h,
            };
            if h.id != ids::CLUSTER {
                self.reader_eof = true;
                return Ok(());
            }
            let blocks = parse_cluster_blocks(&mut r, &h)?;
            if blocks.is_empty() {
                self.reader_cluster_pos = Some(h.payload_pos + h.size);
                continue;
            }
            self.reader_block_index = 0;
            return Ok(());
        }
    }

    /// Reads the block the reader currently points at, without advancing.
    pub fn read_frame(&mut self) -> Result<Option<(u64, ContainerFrame)>, Error> {
        if self.reader_eof {
            return Ok(None);
        }
        let pos = self.reader_cluster_pos.expect("not eof implies a cluster position");
        let mut r = Reader::new(&self.file);
        r.seek_to(pos)?;
        let h = r.read_header()?.ok_or_else(|| format_error("cluster disappeared mid-read"))?;
        let blocks = parse_cluster_blocks(&mut r, &h)?;
        let (track, relative, keyframe, data) = blocks[self.reader_block_index].clone();
        let cluster_timecode = parse_cluster_timecode(&mut r, &h)?;
        let timestamp = cluster_timecode as i64 + i64::from(relative);
        Ok(Some((track, ContainerFrame { timestamp, data, keyframe })))
    }

    /// Advances the reader past the block `read_frame` last returned.
    pub fn next_block(&mut self) -> Result<(), Error> {
        if self.reader_eof {
            return Ok(());
        }
        let pos = self.reader_cluster_pos.expect("not eof implies a cluster position");
        let mut r = Reader::new(&self.file);
        r.seek_to(pos)?;
        let h = r.read_header()?.ok_or_else(|| format_error("cluster disappeared mid-read"))?;
        let blocks = parse_cluster_blocks(&mut r, &h)?;
        if self.reader_block_index + 1 < blocks.len() {
            self.reader_block_index += 1;
            return Ok(());
        }
        self.reader_cluster_pos = Some(h.payload_pos + h.size);
        self.advance_to_first_nonempty_cluster()
    }

    pub fn reader_is_eof(&self) -> bool {
        self.reader_eof
    }
}

fn push_seek_point(buf: &mut Vec<u8>, target_id: u32, position: u64) {
    let mut seek = Vec::new();
    ebml::push_element(&mut seek, ids::SEEK_ID, &ebml::encode_id(target_id));
    ebml::push_uint(&mut seek, ids::SEEK_POSITION, position);
    ebml::push_element(buf, ids::SEEK, &seek);
}

fn write_ebml_header<W: std::io::Write + std::io::Seek>(w: &mut Writer<W>) -> Result<(), Error> {
    let mut payload = Vec::new();
    ebml::push_uint(&mut payload, ids::EBML_VERSION, 1);
    ebml::push_uint(&mut payload, ids::EBML_READ_VERSION, 1);
    ebml::push_uint(&mut payload, ids::EBML_MAX_ID_LENGTH, 4);
    ebml::push_uint(&mut payload, ids::EBML_MAX_SIZE_LENGTH, 8);
    ebml::push_string(&mut payload, ids::DOC_TYPE, "matroska");
    ebml::push_uint(&mut payload, ids::DOC_TYPE_VERSION, 2);
    ebml::push_uint(&mut payload, ids::DOC_TYPE_READ_VERSION, 2);
    w.write_element(ids::EBML_HEADER, &payload)
}

fn read_profile<R: std::io::Read + std::io::Seek>(r: &mut Reader<R>, header: &ElementHeader) -> Result<Profile, Error> {
    let payload = r.read_payload(header)?;
    let mut inner = Reader::new(std::io::Cursor::new(&payload[..]));
    let end = payload.len() as u64;
    let mut doc_type = None;
    while inner.pos()? < end {
        let h = match inner.read_header()? {
            None => break,
            Some(h) => h,
        };
        if h.id == ids::DOC_TYPE {
            doc_type = Some(String::from_utf8_lossy(&inner.read_payload(&h)?).into_owned());
        } else {
            inner.skip(&h)?;
        }
    }
    match doc_type.as_deref() {
        Some("matroska") => Ok(Profile::Matroska),
        other => {
            log::warn!("unrecognized or missing DocType {:?}, defaulting to matroska profile", other);
            Ok(Profile::Matroska)
        }
    }
}

fn parse_info_duration(payload: &[u8]) -> u64 {
    let mut r = Reader::new(std::io::Cursor::new(payload));
    let end = payload.len() as u64;
    let mut duration = 0u64;
    while r.pos().map(|p| p < end).unwrap_or(false) {
        let h = match r.read_header().ok().flatten() {
            None => break,
            Some(h) => h,
        };
        if h.id == ids::DURATION {
            if let Ok(p) = r.read_payload(&h) {
                duration = ebml::read_float(&p) as u64;
            }
        } else {
            let _ = r.skip(&h);
        }
    }
    duration
}

fn parse_tracks(payload: &[u8]) -> Result<Vec<Track>, Error> {
    let mut r = Reader::new(std::io::Cursor::new(payload));
    let end = payload.len() as u64;
    let mut out = Vec::new();
    while r.pos()? < end {
        let h = match r.read_header()? {
            None => break,
            Some(h) => h,
        };
        if h.id == ids::TRACK_ENTRY {
            let entry_payload = r.read_payload(&h)?;
            out.push(track::parse_entry(&entry_payload)?.into_track()?);
        } else {
            r.skip(&h)?;
        }
    }
    Ok(out)
}

fn parse_cues(payload: &[u8], segment_payload_pos: u64) -> Vec<CueEntry> {
    let mut r = Reader::new(std::io::Cursor::new(payload));
    let end = payload.len() as u64;
    let mut out = Vec::new();
    while r.pos().map(|p| p < end).unwrap_or(false) {
        let h = match r.read_header().ok().flatten() {
            None => break,
            Some(h) => h,
        };
        if h.id == ids::CUE_POINT {
            if let Ok(point_payload) = r.read_payload(&h) {
                if let Some(cue) = parse_cue_point(&point_payload, segment_payload_pos) {
                    out.push(cue);
                }
            }
        } else {
            let _ = r.skip(&h);
        }
    }
    out
}

fn parse_cue_point(payload: &[u8], segment_payload_pos: u64) -> Option<CueEntry> {
    let mut r = Reader::new(std::io::Cursor::new(payload));
    let end = payload.len() as u64;
    let mut time = None;
    let mut track = None;
    let mut cluster_pos = None;
    let mut block_number = 1u64;
    while r.pos().map(|p| p < end).unwrap_or(false) {
        let h = r.read_header().ok().flatten()?;
        match h.id {
            ids::CUE_TIME => time = Some(ebml::read_uint(&r.read_payload(&h).ok()?)),
            ids::CUE_TRACK_POSITIONS => {
                let inner_payload = r.read_payload(&h).ok()?;
                let mut inner = Reader::new(std::io::Cursor::new(&inner_payload[..]));
                let inner_end = inner_payload.len() as u64;
                while inner.pos().map(|p| p < inner_end).unwrap_or(false) {
                    let ih = inner.read_header().ok().flatten()?;
                    match ih.id {
                        ids::CUE_TRACK => track = Some(ebml::read_uint(&inner.read_payload(&ih).ok()?)),
                        ids::CUE_CLUSTER_POSITION => {
                            let rel = ebml::read_uint(&inner.read_payload(&ih).ok()?);
                            cluster_pos = Some(rel + segment_payload_pos);
                        }
                        ids::CUE_BLOCK_NUMBER => block_number = ebml::read_uint(&inner.read_payload(&ih).ok()?),
                        _ => {
                            let _ = inner.skip(&ih);
                        }
                    }
                }
            }
            _ => {
                let _ = r.skip(&h);
            }
        }
    }
    Some(CueEntry { time: time?, track: track?, cluster_pos: cluster_pos?, block_number })
}

fn parse_cluster_timecode<R: std::io::Read + std::io::Seek>(
    r: &mut Reader<R>,
    cluster: &ElementHeader,
) -> Result<u64, Error> {
    r.seek_to(cluster.payload_pos)?;
    let end = cluster.payload_pos + cluster.size;
    while r.pos()? < end {
        let h = match r.read_header()? {
            None => break,
            Some(h) => h,
        };
        if h.id == ids::TIMECODE {
            return Ok(ebml::read_uint(&r.read_payload(&h)?));
        }
        r.skip(&h)?;
    }
    Ok(0)
}

type ParsedBlock = (u64, i16, bool, bytes::Bytes);

fn parse_cluster_blocks<R: std::io::Read + std::io::Seek>(
    r: &mut Reader<R>,
    cluster: &ElementHeader,
) -> Result<Vec<ParsedBlock>, Error> {
    r.seek_to(cluster.payload_pos)?;
    let end = cluster.payload_pos + cluster.size;
    let mut out = Vec::new();
    while r.pos()? < end {
        let h = match r.read_header()? {
            None => break,
            Some(h) => h,
        };
        match h.id {
            ids::SIMPLE_BLOCK => {
                let payload = r.read_payload(&h)?;
                out.push(parse_simple_block(&payload)?);
            }
            ids::BLOCK_GROUP => {
                let group_payload = r.read_payload(&h)?;
                if let Some(block) = parse_block_group(&group_payload)? {
                    out.push(block);
                }
            }
            _ => r.skip(&h)?,
        }
    }
    Ok(out)
}

fn parse_simple_block(payload: &[u8]) -> Result<ParsedBlock, Error> {
    let first = *payload.first().ok_or_else(|| format_error("empty SimpleBlock"))?;
    let width = ebml::size_width(first).ok_or_else(|| format_error("bad SimpleBlock track vint"))?;
    if payload.len() < width as usize + 3 {
        return Err(format_error("SimpleBlock truncated before flags"));
    }
    let mut r = Reader::new(std::io::Cursor::new(payload));
    let track = r.read_size()?;
    let rest = &payload[width as usize..];
    let relative = i16::from_be_bytes([rest[0], rest[1]]);
    let flags = rest[2];
    let keyframe = flags & 0x80 != 0;
    let data = bytes::Bytes::copy_from_slice(&rest[3..]);
    Ok((track, relative, keyframe, data))
}

fn parse_block_group(payload: &[u8]) -> Result<Option<ParsedBlock>, Error> {
    let mut r = Reader::new(std::io::Cursor::new(payload));
    let end = payload.len() as u64;
    while r.pos()? < end {
        let h = match r.read_header()? {
            None => break,
            Some(h) => h,
        };
        if h.id == ids::BLOCK {
            let block_payload = r.read_payload(&h)?;
            return Ok(Some(parse_simple_block(&block_payload)?));
        }
        r.skip(&h)?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use tempfile_like::NamedTmp;

    mod tempfile_like {
        use std::path::PathBuf;

        /// A minimal self-cleaning temp path, since the teacher's
        /// dependency set carries no `tempfile` crate.
        pub struct NamedTmp(pub PathBuf);

        impl NamedTmp {
            pub fn new(label: &str) -> Self {
                let mut p = std::env::temp_dir();
                p.push(format!("mkv-filters-test-{}-{}.mkv", label, std::process::id()));
                NamedTmp(p)
            }
        }

        impl Drop for NamedTmp {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn create_write_and_reopen_round_trip() {
        let tmp = NamedTmp::new("basic");
        let mut m = Matroska::create(&tmp.0).unwrap();
        let video = m.add_track(Format::Video { codec: "H264", clock_rate: 90_000, width: 640, height: 480 }).unwrap();
        let audio = m.add_track(Format::Audio { codec: "pcmu", clock_rate: 8000, channels: 1 }).unwrap();

        m.start_cluster(0).unwrap();
        m.write_block(video, &ContainerFrame { timestamp: 0, data: bytes::Bytes::from_static(b"idr"), keyframe: true }).unwrap();
        m.add_cue(video).unwrap();
        m.write_block(audio, &ContainerFrame { timestamp: 0, data: bytes::Bytes::from_static(b"a0"), keyframe: true }).unwrap();
        m.write_block(audio, &ContainerFrame { timestamp: 20, data: bytes::Bytes::from_static(b"a1"), keyframe: true }).unwrap();
        m.finalize().unwrap();

        let mut r = Matroska::open_read(&tmp.0).unwrap();
        assert_eq!(r.tracks().len(), 2);
        r.first_block().unwrap();
        let mut seen = Vec::new();
        loop {
            match r.read_frame().unwrap() {
                None => break,
                Some((track, frame)) => {
                    seen.push((track, frame.timestamp, frame.data));
                    r.next_block().unwrap();
                    if r.reader_is_eof() {
                        break;
                    }
                }
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].2, bytes::Bytes::from_static(b"idr"));
    }

    #[test]
    fn empty_cluster_is_voided_on_close() {
        let tmp = NamedTmp::new("empty-cluster");
        let mut m = Matroska::create(&tmp.0).unwrap();
        m.start_cluster(0).unwrap();
        m.close_cluster().unwrap();
        m.finalize().unwrap();
        // No panics, no leftover current cluster, and the file parses back.
        let _r = Matroska::open_read(&tmp.0).unwrap();
    }

    #[test]
    fn append_adds_a_new_cluster_after_the_old_one_and_keeps_tracks_readable() {
        let tmp = NamedTmp::new("append");
        let mut m = Matroska::create(&tmp.0).unwrap();
        let video = m.add_track(Format::Video { codec: "H264", clock_rate: 90_000, width: 320, height: 240 }).unwrap();
        m.start_cluster(0).unwrap();
        m.write_block(video, &ContainerFrame { timestamp: 0, data: bytes::Bytes::from_static(b"idr0"), keyframe: true })
            .unwrap();
        m.finalize().unwrap();
        let first_duration = m.duration();

        let mut m2 = Matroska::open_append(&tmp.0).unwrap();
        assert_eq!(m2.tracks().len(), 1);
        assert_eq!(m2.global_origin, first_duration);
        let video2 = m2.track(video).unwrap().number;
        m2.start_cluster(first_duration + 100).unwrap();
        m2.write_block(
            video2,
            &ContainerFrame { timestamp: (first_duration + 100) as i64, data: bytes::Bytes::from_static(b"idr1"), keyframe: true },
        )
        .unwrap();
        m2.finalize().unwrap();
        assert!(m2.duration() > first_duration);

        let mut r = Matroska::open_read(&tmp.0).unwrap();
        assert_eq!(r.tracks().len(), 1, "append must not duplicate or corrupt the track table");
        r.first_block().unwrap();
        let mut seen = Vec::new();
        loop {
            let (_, frame) = r.read_frame().unwrap().unwrap();
            seen.push(frame.data);
            r.next_block().unwrap();
            if r.reader_is_eof() {
                break;
            }
        }
        assert_eq!(seen, vec![bytes::Bytes::from_static(b"idr0"), bytes::Bytes::from_static(b"idr1")]);
    }

    #[test]
    fn append_does_not_prune_a_track_untouched_this_session() {
        let tmp = NamedTmp::new("append-prune");
        let mut m = Matroska::create(&tmp.0).unwrap();
        let video = m.add_track(Format::Video { codec: "H264", clock_rate: 90_000, width: 320, height: 240 }).unwrap();
        let audio = m.add_track(Format::Audio { codec: "pcmu", clock_rate: 8000, channels: 1 }).unwrap();
        m.start_cluster(0).unwrap();
        m.write_block(video, &ContainerFrame { timestamp: 0, data: bytes::Bytes::from_static(b"idr0"), keyframe: true })
            .unwrap();
        m.write_block(audio, &ContainerFrame { timestamp: 0, data: bytes::Bytes::from_static(b"a0"), keyframe: true }).unwrap();
        m.finalize().unwrap();

        // Append-and-finalize touching only the video track.
        let mut m2 = Matroska::open_append(&tmp.0).unwrap();
        assert_eq!(m2.tracks().len(), 2);
        m2.start_cluster(100).unwrap();
        m2.write_block(video, &ContainerFrame { timestamp: 100, data: bytes::Bytes::from_static(b"idr1"), keyframe: true })
            .unwrap();
        m2.finalize().unwrap();

        // The untouched audio track must survive, since its old blocks are
        // still referenced by the earlier cluster.
        let r = Matroska::open_read(&tmp.0).unwrap();
        assert_eq!(r.tracks().len(), 2);
        assert!(r.track(audio).is_some());
    }
}
