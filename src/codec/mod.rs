//! The codec module registry: per-codec bitstream adaptation between the
//! realtime packet format and the container's frame-oriented storage.
//!
//! The source this was distilled from dispatches through a table of function
//! pointers; `SPEC_FULL.md` §9 notes this is naturally a tagged variant in a
//! systems language with sum types, so [`Module`] is a closed enum rather
//! than a `Box<dyn Trait>` registry. The process-wide registry itself (the
//! id ↔ name ↔ codec-id mapping) is a `const` table, the only "mutable
//! global state" the source has — and it isn't actually mutable here.

pub mod h264;
pub mod opus;
pub mod pcmu;

use bytes::Bytes;
use failure::Error;

use crate::format::Format;
use crate::frame::{Buffer, ContainerFrame};
use crate::rfc3984::Rfc3984;

/// Identifies a codec module. Doubles as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    H264,
    Pcmu,
    Opus,
}

struct RegistryEntry {
    id: CodecId,
    rfc_name: &'static str,
    codec_id: &'static str,
    /// Conventional RTP clock rate, used when a track's native codec rate
    /// isn't otherwise known (e.g. a video pin's target output rate when
    /// replaying — Matroska's Video element has no clock-rate field).
    default_clock_rate: u32,
}

/// The static registry: RFC name and Matroska `CodecID` for every codec this
/// crate knows how to mux/demux. An unrecognized name or id is "unsupported"
/// (`CodecId::by_rfc_name`/`by_codec_id` return `None`).
const REGISTRY: &[RegistryEntry] = &[
    RegistryEntry { id: CodecId::H264, rfc_name: "H264", codec_id: "V_MPEG4/ISO/AVC", default_clock_rate: 90_000 },
    RegistryEntry { id: CodecId::Opus, rfc_name: "opus", codec_id: "A_OPUS", default_clock_rate: 48_000 },
    RegistryEntry { id: CodecId::Pcmu, rfc_name: "pcmu", codec_id: "A_MS/ACM", default_clock_rate: 8_000 },
];

impl CodecId {
    pub fn by_rfc_name(name: &str) -> Option<CodecId> {
        REGISTRY.iter().find(|e| e.rfc_name == name).map(|e| e.id)
    }

    pub fn by_codec_id(codec_id: &str) -> Option<CodecId> {
        REGISTRY.iter().find(|e| e.codec_id == codec_id).map(|e| e.id)
    }

    pub fn rfc_name(self) -> &'static str {
        REGISTRY.iter().find(|e| e.id == self).unwrap().rfc_name
    }

    pub fn codec_id(self) -> &'static str {
        REGISTRY.iter().find(|e| e.id == self).unwrap().codec_id
    }

    pub fn default_clock_rate(self) -> u32 {
        REGISTRY.iter().find(|e| e.id == self).unwrap().default_clock_rate
    }
}

/// A live instance of a codec module, holding whatever per-track state it
/// needs (captured SPS/PPS, channel count, sample rate, ...).
#[derive(Debug)]
pub enum Module {
    H264(h264::H264Module),
    Pcmu(pcmu::PcmuModule),
    Opus(opus::OpusModule),
}

impl Module {
    pub fn new(id: CodecId) -> Self {
        match id {
            CodecId::H264 => Module::H264(h264::H264Module::default()),
            CodecId::Pcmu => Module::Pcmu(pcmu::PcmuModule::default()),
            CodecId::Opus => Module::Opus(opus::OpusModule::default()),
        }
    }

    pub fn id(&self) -> CodecId {
        match self {
            Module::H264(_) => CodecId::H264,
            Module::Pcmu(_) => CodecId::Pcmu,
            Module::Opus(_) => CodecId::Opus,
        }
    }

    /// `set(format)`: populates the private record from the negotiated
    /// format. No-op for codecs that don't need it.
    pub fn set_format(&mut self, format: &Format) -> Result<(), Error> {
        match self {
            Module::H264(m) => m.set_format(format),
            Module::Pcmu(m) => m.set_format(format),
            Module::Opus(m) => m.set_format(format),
        }
    }

    /// RTP (or other realtime transport) packets in, access units out.
    /// Identity for codecs with no reassembly step.
    pub fn preprocess(&mut self, input: Vec<Buffer>, rfc3984: &mut dyn Rfc3984) -> Result<Vec<Buffer>, Error> {
        match self {
            Module::H264(m) => m.preprocess(input, rfc3984),
            Module::Pcmu(_) | Module::Opus(_) => Ok(input),
        }
    }

    /// Access unit in, container-ready frame (+ keyframe flag) out. Default
    /// fallback concatenates the buffer's chunks and marks it a keyframe.
    pub fn process(&mut self, input: Buffer) -> Result<ContainerFrame, Error> {
        match self {
            Module::H264(m) => m.process(input),
            Module::Pcmu(_) | Module::Opus(_) => {
                let timestamp = input.timestamp;
                Ok(ContainerFrame { timestamp, data: input.to_contiguous(), keyframe: true })
            }
        }
    }

    /// Container frame in, realtime transport packets out.
    pub fn reverse(
        &mut self,
        frame: &ContainerFrame,
        is_first_frame: bool,
        rfc3984: &mut dyn Rfc3984,
    ) -> Result<Vec<Buffer>, Error> {
        match self {
            Module::H264(m) => m.reverse(frame, is_first_frame, rfc3984),
            Module::Pcmu(_) | Module::Opus(_) => {
                Ok(vec![Buffer::single(frame.timestamp, frame.data.clone())])
            }
        }
    }

    /// Whether `buf` (a pre-`process` access unit) should count as a
    /// keyframe — used by the recorder's key-frame gate. Non-video codecs
    /// default to "always a keyframe" since the gate never applies to them.
    pub fn is_keyframe(&self, buf: &Buffer) -> bool {
        match self {
            Module::H264(m) => m.is_keyframe(buf),
            Module::Pcmu(_) | Module::Opus(_) => true,
        }
    }

    pub fn serialize_private(&self) -> Vec<u8> {
        match self {
            Module::H264(m) => m.serialize_private(),
            Module::Pcmu(m) => m.serialize_private(),
            Module::Opus(m) => m.serialize_private(),
        }
    }

    pub fn load_private(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Module::H264(m) => m.load_private(data),
            Module::Pcmu(m) => m.load_private(data),
            Module::Opus(m) => m.load_private(data),
        }
    }
}

/// Common shape every per-codec private-data blob provides, used by the
/// "codec-private idempotence" testable property in `SPEC_FULL.md` §8.
pub(crate) trait Private: Sized {
    fn serialize(&self) -> Vec<u8>;
    fn load(data: &[u8]) -> Result<Self, Error>;
}

pub(crate) fn nalu_type(nalu: &Bytes) -> Option<u8> {
    nalu.first().map(|b| b & 0x1f)
}
