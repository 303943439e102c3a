//! Per-pin media format descriptors.
//!
//! A `SET_INPUT_FMT`/track-discovery result names a codec by its RFC name
//! (`"H264"`, `"opus"`, `"pcmu"`) plus whatever the codec module needs to
//! build its private data: pixel dimensions for video, channel count and
//! clock rate for audio.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Format {
    Video {
        codec: &'static str,
        clock_rate: u32,
        width: u32,
        height: u32,
    },
    Audio {
        codec: &'static str,
        clock_rate: u32,
        channels: u16,
    },
}

impl Format {
    pub fn kind(&self) -> MediaKind {
        match self {
            Format::Video { .. } => MediaKind::Video,
            Format::Audio { .. } => MediaKind::Audio,
        }
    }

    pub fn codec(&self) -> &'static str {
        match self {
            Format::Video { codec, .. } | Format::Audio { codec, .. } => codec,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::Video { clock_rate, .. } | Format::Audio { clock_rate, .. } => *clock_rate,
        }
    }

    /// True if `other` differs only in video pixel dimensions, same codec
    /// and clock rate — the one kind of in-flight format change §4.5 allows
    /// while the recorder is open.
    pub fn is_compatible_resize(&self, other: &Format) -> bool {
        match (self, other) {
            (
                Format::Video { codec: c1, clock_rate: r1, .. },
                Format::Video { codec: c2, clock_rate: r2, .. },
            ) => c1 == c2 && r1 == r2,
            _ => false,
        }
    }
}
