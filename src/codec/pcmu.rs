//! µ-law (PCMU), stored in Matroska as `A_MS/ACM` with a WAVEFORMATEX
//! private-data blob. No preprocessing or AVCC-style framing: the payload
//! is already the container frame.

use failure::Error;

use crate::error::format_error;
use crate::format::Format;

use super::Private;

const WAVE_FORMAT_PCM: u16 = 7; // non-standard µ-law tag used throughout the source.

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PcmuModule {
    private: WavPrivate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavPrivate {
    pub channels: u16,
    pub samples_per_sec: u32,
}

impl Default for WavPrivate {
    fn default() -> Self {
        WavPrivate { channels: 1, samples_per_sec: 8000 }
    }
}

impl PcmuModule {
    pub fn set_format(&mut self, format: &Format) -> Result<(), Error> {
        if let Format::Audio { channels, clock_rate, .. } = format {
            self.private.channels = *channels;
            self.private.samples_per_sec = *clock_rate;
        }
        Ok(())
    }

    pub fn serialize_private(&self) -> Vec<u8> {
        self.private.serialize()
    }

    pub fn load_private(&mut self, data: &[u8]) -> Result<(), Error> {
        self.private = WavPrivate::load(data)?;
        Ok(())
    }
}

impl Private for WavPrivate {
    /// Packed little-endian WAVEFORMATEX, 22 bytes:
    /// `{wFormatTag, nChannels, nSamplesPerSec, nAvgBytesPerSec, nBlockAlign,
    /// wBitsPerSample, cbSize}`.
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        let n_channels = self.channels;
        let n_block_align = n_channels;
        let n_avg_bytes_per_sec = 8 * u32::from(n_channels) * self.samples_per_sec;
        out.extend_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
        out.extend_from_slice(&n_channels.to_le_bytes());
        out.extend_from_slice(&self.samples_per_sec.to_le_bytes());
        out.extend_from_slice(&n_avg_bytes_per_sec.to_le_bytes());
        out.extend_from_slice(&n_block_align.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes()); // wBitsPerSample
        out.extend_from_slice(&0u16.to_le_bytes()); // cbSize
        out
    }

    fn load(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 22 {
            return Err(format_error("WAVEFORMATEX private data shorter than 22 bytes"));
        }
        let channels = u16::from_le_bytes([data[2], data[3]]);
        let samples_per_sec = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Ok(WavPrivate { channels, samples_per_sec })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_private_round_trips() {
        let p = WavPrivate { channels: 1, samples_per_sec: 8000 };
        let bytes = p.serialize();
        assert_eq!(bytes.len(), 22);
        let loaded = WavPrivate::load(&bytes).unwrap();
        assert_eq!(loaded, p);
        assert_eq!(loaded.serialize(), bytes);
    }

    #[test]
    fn avg_bytes_per_sec_matches_formula() {
        let p = WavPrivate { channels: 2, samples_per_sec: 8000 };
        let bytes = p.serialize();
        let avg = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(avg, 8 * 2 * 8000);
    }
}
