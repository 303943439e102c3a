//! Demo CLI: records a synthetic H.264 + PCMU stream into a Matroska file.
//!
//! There's no RTSP source wired in here — the media source and the RFC 3984
//! depacketizer are external collaborators per `SPEC_FULL.md` §1 — so this
//! drives the [`Recorder`] with synthetic access units and a synthetic
//! ticker, the way `rtsp/examples/write_mp4.rs` drives a real RTSP session.

use std::path::PathBuf;
use std::str::FromStr;

use bytes::Bytes;
use failure::Error;
use log::{error, info};
use mkv_filters::rfc3984::Rfc3984;
use mkv_filters::{Buffer, Format, Recorder};
use structopt::StructOpt;

#[derive(StructOpt)]
struct Opt {
    /// Output file path.
    #[structopt(long, parse(from_os_str))]
    out: PathBuf,

    /// Append to an existing file instead of creating a new one.
    #[structopt(long)]
    append: bool,

    /// Number of simulated 10ms ticks to run.
    #[structopt(long, default_value = "300")]
    ticks: u32,

    #[structopt(long, default_value = "640")]
    width: u32,

    #[structopt(long, default_value = "480")]
    height: u32,
}

const TICK_MS: u64 = 10;
const VIDEO_CLOCK: u32 = 90_000;
const AUDIO_CLOCK: u32 = 8_000;
/// One keyframe every 100 ticks (1 second of output).
const GOP_TICKS: u32 = 100;

/// A single-byte-length-prefixed NALU aggregate, standing in for whatever
/// real STAP-A/FU-A reassembly an RFC 3984 depacketizer would do. Splits one
/// transport packet back into the NAL units it aggregated, so a keyframe
/// access unit's SPS/PPS/IDR arrive as one access unit the way a real H.264
/// RTP stream bundles them.
#[derive(Default)]
struct DemoRfc3984;

impl Rfc3984 for DemoRfc3984 {
    fn depacketize(&mut self, packet: Bytes) -> Result<Vec<Bytes>, Error> {
        let mut out = Vec::new();
        let mut rest = &packet[..];
        while !rest.is_empty() {
            let len = rest[0] as usize;
            rest = &rest[1..];
            out.push(packet.slice(packet.len() - rest.len()..packet.len() - rest.len() + len));
            rest = &rest[len..];
        }
        Ok(out)
    }

    fn packetize(&mut self, nalus: &[Bytes], _timestamp: mkv_filters::Timestamp) -> Result<Vec<Bytes>, Error> {
        Ok(nalus.to_vec())
    }
}

fn aggregate(nalus: &[Bytes]) -> Bytes {
    let mut buf = Vec::new();
    for n in nalus {
        buf.push(n.len() as u8);
        buf.extend_from_slice(n);
    }
    Bytes::from(buf)
}

fn nalu(nal_type: u8, body: &[u8]) -> Bytes {
    let mut v = vec![0x60 | (nal_type & 0x1f)];
    v.extend_from_slice(body);
    Bytes::from(v)
}

fn init_logging() -> mylog::Handle {
    let h = mylog::Builder::new()
        .set_format(
            std::env::var("MKV_FILTERS_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(&std::env::var("MKV_FILTERS_LOG").unwrap_or_else(|_| "info".to_owned()))
        .build();
    h.clone().install().unwrap();
    h
}

fn main() {
    let _h = init_logging();
    if let Err(e) = main_inner() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn main_inner() -> Result<(), Error> {
    let opt = Opt::from_args();
    let rec = Recorder::new(2);
    rec.set_rfc3984(0, Box::new(DemoRfc3984));
    rec.set_input_format(
        0,
        Some(Format::Video { codec: "H264", clock_rate: VIDEO_CLOCK, width: opt.width, height: opt.height }),
    )?;
    rec.set_input_format(1, Some(Format::Audio { codec: "pcmu", clock_rate: AUDIO_CLOCK, channels: 1 }))?;
    rec.open(&opt.out, opt.append)?;
    rec.start()?;

    let mut video_pts: i64 = 0;
    let mut audio_pts: i64 = 0;
    for tick in 0..opt.ticks {
        let ticker_ms = u64::from(tick) * TICK_MS;

        let video_packet = if tick % GOP_TICKS == 0 {
            aggregate(&[nalu(7, &[0x42, 0x00, 0x1e]), nalu(8, &[0xce]), nalu(5, b"idr-payload")])
        } else {
            aggregate(&[nalu(1, b"p-payload")])
        };
        let video_packets = vec![Buffer::single(video_pts, video_packet)];
        video_pts += i64::from(VIDEO_CLOCK) * TICK_MS as i64 / 1000;

        let samples_this_tick = i64::from(AUDIO_CLOCK) * TICK_MS as i64 / 1000;
        let audio_packets = vec![Buffer::single(audio_pts, Bytes::from_static(&[0xffu8; 80]))];
        audio_pts += samples_this_tick;

        rec.tick(ticker_ms, vec![video_packets, audio_packets])?;
    }

    rec.stop()?;
    rec.close()?;
    info!("wrote {:?}", &opt.out);
    Ok(())
}
