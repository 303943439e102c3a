//! Demo CLI: plays a Matroska file back out, tick by tick, logging each
//! access unit it would have sent to its output pin.
//!
//! As with `record.rs`, the pipeline/ticker framework and the downstream
//! consumers of the output pins are external collaborators per
//! `SPEC_FULL.md` §1; this binary just drives [`Player::tick`] in a loop and
//! reports what came out, the way `rtsp/examples/discard.rs` logs packets
//! instead of acting on them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use failure::Error;
use log::{error, info};
use mkv_filters::player::Event;
use mkv_filters::{MediaKind, Player};
use structopt::StructOpt;

#[derive(StructOpt)]
struct Opt {
    /// Input file path.
    #[structopt(long, parse(from_os_str))]
    input: PathBuf,

    /// Simulated ticker interval, in milliseconds.
    #[structopt(long, default_value = "10")]
    interval_ms: u64,

    /// Sleep for `interval_ms` between ticks, to play back at roughly
    /// real-time speed instead of as fast as possible.
    #[structopt(long)]
    realtime: bool,
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
    let player = Player::new(vec![MediaKind::Video, MediaKind::Audio]);
    player.open(&opt.input)?;
    info!("video format: {:?}", player.output_format(0));
    info!("audio format: {:?}", player.output_format(1));
    player.start()?;

    let mut video_count = 0u64;
    let mut audio_count = 0u64;
    loop {
        let tick = player.tick(opt.interval_ms)?;
        video_count += tick.pins[0].len() as u64;
        audio_count += tick.pins[1].len() as u64;
        for buf in &tick.pins[0] {
            info!("video pkt ts={} len={}", buf.timestamp, buf.len());
        }
        for buf in &tick.pins[1] {
            info!("audio pkt ts={} len={}", buf.timestamp, buf.len());
        }
        if tick.events.contains(&Event::Eof) {
            info!("eof after {} video packets, {} audio packets", video_count, audio_count);
            break;
        }
        if opt.realtime {
            std::thread::sleep(Duration::from_millis(opt.interval_ms));
        }
    }
    player.close()?;
    Ok(())
}
