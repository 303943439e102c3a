//! Opus, stored in Matroska as `A_OPUS` with a 19-byte `OpusHead` private
//! blob. No preprocessing or AVCC-style framing: the payload is already the
//! container frame.

use failure::Error;

use crate::error::format_error;
use crate::format::Format;

use super::Private;

const OPUS_HEAD_MAGIC: &[u8; 8] = b"OpusHead";
const PRE_SKIP: u16 = 3840;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct OpusModule {
    private: OpusPrivate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpusPrivate {
    pub channels: u8,
    pub input_sample_rate: u32,
}

impl Default for OpusPrivate {
    fn default() -> Self {
        OpusPrivate { channels: 1, input_sample_rate: 48000 }
    }
}

impl OpusModule {
    pub fn set_format(&mut self, format: &Format) -> Result<(), Error> {
        if let Format::Audio { channels, clock_rate, .. } = format {
            self.private.channels = (*channels).min(u16::from(u8::MAX)) as u8;
            self.private.input_sample_rate = *clock_rate;
        }
        Ok(())
    }

    pub fn serialize_private(&self) -> Vec<u8> {
        self.private.serialize()
    }

    pub fn load_private(&mut self, data: &[u8]) -> Result<(), Error> {
        self.private = OpusPrivate::load(data)?;
        Ok(())
    }
}

impl Private for OpusPrivate {
    /// `"OpusHead"`, version=1, channel count, u16le pre-skip=3840, u32le
    /// input sample rate, u16le output gain=0, mapping family=0.
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(19);
        out.extend_from_slice(OPUS_HEAD_MAGIC);
        out.push(1); // version
        out.push(self.channels);
        out.extend_from_slice(&PRE_SKIP.to_le_bytes());
        out.extend_from_slice(&self.input_sample_rate.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // output gain
        out.push(0); // mapping family
        out
    }

    fn load(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 19 {
            return Err(format_error("OpusHead private data shorter than 19 bytes"));
        }
        if &data[0..8] != OPUS_HEAD_MAGIC {
            return Err(format_error("OpusHead private data missing magic"));
        }
        let channels = data[9];
        let input_sample_rate = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        Ok(OpusPrivate { channels, input_sample_rate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_head_round_trips() {
        let p = OpusPrivate { channels: 2, input_sample_rate: 48000 };
        let bytes = p.serialize();
        assert_eq!(bytes.len(), 19);
        assert_eq!(&bytes[0..8], OPUS_HEAD_MAGIC);
        let loaded = OpusPrivate::load(&bytes).unwrap();
        assert_eq!(loaded, p);
        assert_eq!(loaded.serialize(), bytes);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let mut bytes = OpusPrivate::default().serialize();
        bytes[0] = b'X';
        assert!(OpusPrivate::load(&bytes).is_err());
    }
}
