mod control;
mod pipeline;

use std::time::Duration;

use clap::Parser;
use tl_dsp::Placement;

#[derive(Parser, Debug)]
#[command(name = "twinlink")]
#[command(about = "Shared Rx/Tx front-end streaming on one radio")]
struct Cli {
    /// Device: sim:<name>, uri=<iio uri> or serial=<serial>
    #[arg(short = 'd', long, default_value = "sim:demo")]
    device: String,

    /// Rx centre frequency in Hz
    #[arg(long, default_value = "435000000")]
    rx_freq: u64,

    /// Tx centre frequency in Hz
    #[arg(long, default_value = "435000000")]
    tx_freq: u64,

    /// Converter sample rate in Hz, shared by both sides
    #[arg(short = 'r', long, default_value = "2500000")]
    sample_rate: u32,

    /// Rx host decimation, log2 (0-6)
    #[arg(long, default_value = "0")]
    rx_log2: u32,

    /// Tx host interpolation, log2 (0-6)
    #[arg(long, default_value = "0")]
    tx_log2: u32,

    /// Band placement when decimating or interpolating: infra, supra, center
    #[arg(short = 'p', long, default_value = "center")]
    placement: Placement,

    /// Tx test tone offset in Hz
    #[arg(long, default_value = "50000")]
    tone: f64,

    /// Complex samples per hardware transfer (multiple of 64)
    #[arg(long, default_value = "16384")]
    block_size: usize,

    /// Stop after this many seconds
    #[arg(short = 't', long)]
    duration: Option<f64>,

    /// Print statistics every second
    #[arg(long)]
    stats: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.verbose {
        log::info!("twinlink starting on {}", cli.device);
        log::info!("rx {} Hz, tx {} Hz, {} S/s", cli.rx_freq, cli.tx_freq, cli.sample_rate);
    }

    let duration = match cli.duration {
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => {
            eprintln!("invalid duration: {}", secs);
            std::process::exit(1);
        }
        None => None,
    };

    let opts = pipeline::RunOptions {
        device: cli.device,
        rx_frequency: cli.rx_freq,
        tx_frequency: cli.tx_freq,
        sample_rate: cli.sample_rate,
        rx_log2: cli.rx_log2,
        tx_log2: cli.tx_log2,
        placement: cli.placement,
        tone_hz: cli.tone,
        block_size: cli.block_size,
        duration,
        stats_interval: cli.stats.then_some(Duration::from_secs(1)),
    };

    if let Err(e) = pipeline::run(&opts) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
