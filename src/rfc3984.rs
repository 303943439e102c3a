//! Interface boundary to the RFC 3984 H.264 (de)packetizer.
//!
//! Fragmenting/reassembling H.264 NAL units into RTP-sized packets is an
//! external collaborator (see `SPEC_FULL.md` §1): this crate only needs a
//! place to plug one in. [`NullRfc3984`] is the trivial passthrough used
//! whenever the transport layer already hands over whole NAL units (as the
//! demo binaries and the tests in this crate do).

use bytes::Bytes;
use failure::Error;

use crate::frame::Timestamp;

/// A pluggable RFC 3984 depacketizer/packetizer.
pub trait Rfc3984 {
    /// Feeds one transport packet in; returns zero or more complete NAL
    /// units reassembled so far (an access unit may span several calls).
    fn depacketize(&mut self, packet: Bytes) -> Result<Vec<Bytes>, Error>;

    /// Packs one access unit's NAL units into transport-sized packets.
    fn packetize(&mut self, nalus: &[Bytes], timestamp: Timestamp) -> Result<Vec<Bytes>, Error>;
}

/// Identity implementation: every input packet is already a whole NAL unit.
#[derive(Debug, Default)]
pub struct NullRfc3984;

impl Rfc3984 for NullRfc3984 {
    fn depacketize(&mut self, packet: Bytes) -> Result<Vec<Bytes>, Error> {
        Ok(vec![packet])
    }

    fn packetize(&mut self, nalus: &[Bytes], _timestamp: Timestamp) -> Result<Vec<Bytes>, Error> {
        Ok(nalus.to_vec())
    }
}
