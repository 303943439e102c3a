//! H.264: RTP depacketization/packetization to access units, and
//! AVCDecoderConfigurationRecord (AVCC) serialization.

use bytes::{BufMut, Bytes, BytesMut};
use failure::Error;

use crate::error::format_error;
use crate::format::Format;
use crate::frame::{Buffer, ContainerFrame};
use crate::rfc3984::Rfc3984;

use super::{nalu_type, Private};

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_IDR: u8 = 5;

#[derive(Debug, Default)]
pub struct H264Module {
    private: H264Private,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct H264Private {
    pub profile: u8,
    pub level: u8,
    pub nalu_length_size_minus_one: u8,
    pub sps_list: Vec<Bytes>,
    pub pps_list: Vec<Bytes>,
}

impl H264Module {
    pub fn set_format(&mut self, _format: &Format) -> Result<(), Error> {
        // H.264 private data comes from in-band SPS/PPS, not the negotiated
        // format; nothing to do here.
        Ok(())
    }

    /// RTP packets in, one [`Buffer`] per access unit out, each a chain of
    /// whole NAL units. Delegates fragment reassembly to the externally
    /// supplied depacketizer.
    pub fn preprocess(&mut self, input: Vec<Buffer>, rfc3984: &mut dyn Rfc3984) -> Result<Vec<Buffer>, Error> {
        let mut out = Vec::with_capacity(input.len());
        for packet in input {
            let timestamp = packet.timestamp;
            let nalus = rfc3984.depacketize(packet.to_contiguous())?;
            if nalus.is_empty() {
                continue;
            }
            let mut au = Buffer::empty(timestamp);
            for nalu in nalus {
                au.push(nalu);
            }
            out.push(au);
        }
        Ok(out)
    }

    /// Access unit (chain of NALUs) in, AVCC-framed container frame out.
    /// SPS/PPS NALUs are stripped into the private store rather than written
    /// into the frame body.
    pub fn process(&mut self, input: Buffer) -> Result<ContainerFrame, Error> {
        let timestamp = input.timestamp;
        let mut body = BytesMut::new();
        let mut keyframe = false;
        for nalu in input.chunks() {
            match nalu_type(nalu) {
                Some(NAL_SPS) => self.private.add_sps(nalu.clone()),
                Some(NAL_PPS) => self.private.add_pps(nalu.clone()),
                Some(NAL_IDR) => {
                    keyframe = true;
                    body.put_u32(nalu.len() as u32);
                    body.extend_from_slice(nalu);
                }
                _ => {
                    body.put_u32(nalu.len() as u32);
                    body.extend_from_slice(nalu);
                }
            }
        }
        Ok(ContainerFrame { timestamp, data: body.freeze(), keyframe })
    }

    /// AVCC-framed container frame out, NALU packets in (prepending SPS/PPS
    /// on keyframes), then re-packetized through RFC 3984.
    ///
    /// The frame's timestamp is captured up front: the source reads it
    /// *after* releasing the input buffer, a use-after-free this
    /// implementation avoids by construction (there's nothing left to free
    /// here, but the ordering is kept deliberate, see `DESIGN.md`).
    pub fn reverse(
        &mut self,
        frame: &ContainerFrame,
        is_first_frame: bool,
        rfc3984: &mut dyn Rfc3984,
    ) -> Result<Vec<Buffer>, Error> {
        let timestamp = frame.timestamp;
        let mut nalus = Vec::new();
        if frame.keyframe {
            if let Some(sps) = self.private.sps_list.first() {
                nalus.push(sps.clone());
            }
            if let Some(pps) = self.private.pps_list.first() {
                nalus.push(pps.clone());
            }
        }
        let mut cursor: &[u8] = &frame.data[..];
        while !cursor.is_empty() {
            if cursor.len() < 4 {
                return Err(format_error("AVCC frame truncated before a length prefix"));
            }
            let len = u32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
            cursor = &cursor[4..];
            if cursor.len() < len {
                return Err(format_error("AVCC frame truncated inside a NALU"));
            }
            nalus.push(Bytes::copy_from_slice(&cursor[..len]));
            cursor = &cursor[len..];
        }
        // isFirstFrame is accepted but current policy treats every frame
        // identically; see SPEC_FULL.md §4.1.
        let _ = is_first_frame;
        let packets = rfc3984.packetize(&nalus, timestamp)?;
        Ok(packets.into_iter().map(|p| Buffer::single(timestamp, p)).collect())
    }

    /// True iff any NALU in `buf`'s chain is an IDR slice.
    pub fn is_keyframe(&self, buf: &Buffer) -> bool {
        buf.chunks().iter().any(|n| nalu_type(n) == Some(NAL_IDR))
    }

    pub fn serialize_private(&self) -> Vec<u8> {
        self.private.serialize()
    }

    pub fn load_private(&mut self, data: &[u8]) -> Result<(), Error> {
        self.private = H264Private::load(data)?;
        Ok(())
    }
}

impl H264Private {
    /// Merges a newly observed SPS into the store: dedup by byte-identity,
    /// first occurrence sets `profile`/`level`.
    fn add_sps(&mut self, nalu: Bytes) {
        if self.sps_list.iter().any(|s| s == &nalu) {
            return;
        }
        if self.sps_list.is_empty() && nalu.len() >= 4 {
            self.profile = nalu[1];
            self.level = nalu[3];
            self.nalu_length_size_minus_one = 3;
        }
        self.sps_list.push(nalu);
    }

    fn add_pps(&mut self, nalu: Bytes) {
        if self.pps_list.iter().any(|p| p == &nalu) {
            return;
        }
        self.pps_list.push(nalu);
    }
}

impl Private for H264Private {
    /// AVCDecoderConfigurationRecord: version=1, profile, constraint byte
    /// (reserved zero), level, (0xFC|len-1), (0xE0|sps_count), repeated
    /// [u16be size, sps bytes], pps_count, repeated [u16be size, pps bytes].
    fn serialize(&self) -> Vec<u8> {
        let total = 7
            + 2 * (self.sps_list.len() + self.pps_list.len())
            + self.sps_list.iter().map(Bytes::len).sum::<usize>()
            + self.pps_list.iter().map(Bytes::len).sum::<usize>();
        let mut out = Vec::with_capacity(total);
        out.push(1); // configurationVersion
        out.push(self.profile);
        out.push(0); // constraint-set byte: reserved, zero-init in the source.
        out.push(self.level);
        out.push(0xFC | self.nalu_length_size_minus_one);
        out.push(0xE0 | (self.sps_list.len() as u8));
        for sps in &self.sps_list {
            out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            out.extend_from_slice(sps);
        }
        out.push(self.pps_list.len() as u8);
        for pps in &self.pps_list {
            out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            out.extend_from_slice(pps);
        }
        out
    }

    /// Unlike the source (which ignores `size` and trusts a well-formed
    /// record), this validates every cursor advance against `data.len()` and
    /// fails on truncation.
    fn load(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 7 {
            return Err(format_error("AVCC record shorter than the fixed header"));
        }
        let profile = data[1];
        let level = data[3];
        let nalu_length_size_minus_one = data[4] & 0x03;
        let sps_count = data[5] & 0x1F;
        let mut pos = 6usize;
        let mut sps_list = Vec::with_capacity(sps_count as usize);
        for _ in 0..sps_count {
            if pos + 2 > data.len() {
                return Err(format_error("AVCC record truncated in SPS size"));
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if pos + len > data.len() {
                return Err(format_error("AVCC record truncated in SPS body"));
            }
            sps_list.push(Bytes::copy_from_slice(&data[pos..pos + len]));
            pos += len;
        }
        if pos >= data.len() {
            return Err(format_error("AVCC record truncated before PPS count"));
        }
        let pps_count = data[pos];
        pos += 1;
        let mut pps_list = Vec::with_capacity(pps_count as usize);
        for _ in 0..pps_count {
            if pos + 2 > data.len() {
                return Err(format_error("AVCC record truncated in PPS size"));
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if pos + len > data.len() {
                return Err(format_error("AVCC record truncated in PPS body"));
            }
            pps_list.push(Bytes::copy_from_slice(&data[pos..pos + len]));
            pos += len;
        }
        Ok(H264Private { profile, level, nalu_length_size_minus_one, sps_list, pps_list })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nalu(t: u8, extra: &[u8]) -> Bytes {
        let mut v = vec![0x60 | t];
        v.extend_from_slice(extra);
        Bytes::from(v)
    }

    #[test]
    fn sps_dedup_first_sets_profile_level() {
        let mut p = H264Private::default();
        p.add_sps(nalu(NAL_SPS, &[0x42, 0x00, 0x1e]));
        p.add_sps(nalu(NAL_SPS, &[0x42, 0x00, 0x1e])); // identical, ignored
        p.add_sps(nalu(NAL_SPS, &[0x64, 0x00, 0x28])); // different, kept, profile/level unchanged
        assert_eq!(p.sps_list.len(), 2);
        assert_eq!(p.profile, 0x42);
        assert_eq!(p.level, 0x1e);
    }

    #[test]
    fn process_splits_sps_pps_and_keeps_idr_in_body() {
        let mut m = H264Module::default();
        let mut buf = Buffer::empty(1000);
        buf.push(nalu(NAL_SPS, &[0x42, 0x00, 0x1e]));
        buf.push(nalu(NAL_PPS, &[]));
        buf.push(nalu(NAL_IDR, &[0xaa, 0xbb]));
        let frame = m.process(buf).unwrap();
        assert!(frame.keyframe);
        assert_eq!(m.private.sps_list.len(), 1);
        assert_eq!(m.private.pps_list.len(), 1);
        // body is 4-byte length prefix + the IDR NALU only.
        assert_eq!(frame.data.len(), 4 + 3);
    }

    #[test]
    fn avcc_round_trips() {
        let mut p = H264Private::default();
        p.add_sps(nalu(NAL_SPS, &[0x42, 0x00, 0x1e, 0x95]));
        p.add_pps(nalu(NAL_PPS, &[0xee]));
        let bytes = p.serialize();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[2], 0, "constraint byte reserved zero");
        let loaded = H264Private::load(&bytes).unwrap();
        assert_eq!(loaded.serialize(), bytes);
    }

    #[test]
    fn load_rejects_truncated_record() {
        let mut p = H264Private::default();
        p.add_sps(nalu(NAL_SPS, &[0x42, 0x00, 0x1e]));
        let bytes = p.serialize();
        assert!(H264Private::load(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn reverse_prepends_parameter_sets_on_keyframe() {
        let mut m = H264Module::default();
        m.private.add_sps(nalu(NAL_SPS, &[0x42]));
        m.private.add_pps(nalu(NAL_PPS, &[]));
        let mut body = BytesMut::new();
        let idr = nalu(NAL_IDR, &[1, 2]);
        body.put_u32(idr.len() as u32);
        body.extend_from_slice(&idr);
        let frame = ContainerFrame { timestamp: 42, data: body.freeze(), keyframe: true };
        let mut rfc = crate::rfc3984::NullRfc3984::default();
        let out = m.reverse(&frame, true, &mut rfc).unwrap();
        assert_eq!(out.len(), 3); // sps, pps, idr
        assert!(out.iter().all(|b| b.timestamp == 42));
    }
}
