use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, SendTimeoutError, Sender};
use num_complex::Complex32;

use tl_dsp::spectrum::{Peak, ToneMeter};
use tl_dsp::Placement;
use tl_sdr::{DeviceId, DeviceRegistry, LogicalDevice, SampleBuf, SampleQueue, Side, StreamConfig};

use crate::control::{self, ControlCommand, SideReport};

/// Complex samples per generated Tx block.
const TONE_BLOCK: usize = 4096;
/// FFT size for the Rx tone monitor.
const METER_SIZE: usize = 1024;

pub struct RunOptions {
    pub device: String,
    pub rx_frequency: u64,
    pub tx_frequency: u64,
    pub sample_rate: u32,
    pub rx_log2: u32,
    pub tx_log2: u32,
    pub placement: Placement,
    /// Tx test tone offset (Hz)
    pub tone_hz: f64,
    pub block_size: usize,
    pub duration: Option<Duration>,
    pub stats_interval: Option<Duration>,
}

struct Radio {
    rx: LogicalDevice,
    tx: LogicalDevice,
}

impl Radio {
    fn side(&self, side: Side) -> &LogicalDevice {
        match side {
            Side::Rx => &self.rx,
            Side::Tx => &self.tx,
        }
    }

    fn poll(&self) {
        self.rx.poll_messages();
        self.tx.poll_messages();
    }
}

/// Feed the Tx queue with a continuous complex tone at the current host rate.
/// Returns the number of blocks delivered.
fn spawn_tone(
    queue: Sender<SampleBuf>,
    host_rate: Arc<AtomicU32>,
    tone_hz: f64,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let amplitude = 0.5 * i16::MAX as f32;
        let mut phasor = Complex32::new(1.0, 0.0);
        let mut sent = 0u64;

        while running.load(Ordering::Relaxed) {
            let rate = host_rate.load(Ordering::Relaxed).max(1) as f32;
            let step = Complex32::from_polar(1.0, TAU * tone_hz as f32 / rate);

            let mut data = Vec::with_capacity(TONE_BLOCK * 2);
            for _ in 0..TONE_BLOCK {
                data.push((phasor.re * amplitude) as i16);
                data.push((phasor.im * amplitude) as i16);
                phasor *= step;
            }
            // Keep the phasor on the unit circle
            phasor /= phasor.norm();

            let mut buf = SampleBuf::from_interleaved(data);
            loop {
                match queue.send_timeout(buf, Duration::from_millis(100)) {
                    Ok(()) => {
                        sent += 1;
                        break;
                    }
                    Err(SendTimeoutError::Timeout(b)) => {
                        if !running.load(Ordering::Relaxed) {
                            return sent;
                        }
                        buf = b;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return sent,
                }
            }
        }
        sent
    })
}

fn report(dev: &LogicalDevice, peak: Option<Peak>) -> SideReport {
    let settings = dev.settings();
    let stats = dev.stats();
    let host = dev.sample_rate();
    let peak = if dev.side() == Side::Rx { peak } else { None };
    SideReport {
        side: dev.side().to_string(),
        running: dev.is_running(),
        buddy: dev.has_buddy(),
        center_frequency: settings.center_frequency,
        dev_sample_rate: settings.dev_sample_rate,
        host_sample_rate: host,
        rates: dev.sample_rates().to_string(),
        blocks: stats.blocks,
        samples: stats.samples,
        shortfalls: stats.shortfalls,
        dropped: stats.dropped,
        underflows: stats.underflows,
        degraded: stats.degraded,
        peak_hz: peak.map(|p| p.offset_hz(host)),
        peak_db: peak.map(|p| p.power_db),
    }
}

fn print_status(radio: &Radio, peak: Option<Peak>) {
    for side in [Side::Rx, Side::Tx] {
        match serde_json::to_string(&report(radio.side(side), peak)) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("status encoding: {}", e),
        }
    }
}

/// Handle one control command. Returns false on quit.
fn handle_command(radio: &Radio, cmd: ControlCommand, peak: Option<Peak>) -> bool {
    match cmd {
        ControlCommand::Configure { side, settings } => {
            let dev = radio.side(side);
            let mut wanted = dev.settings();
            let reply = match control::apply_patch(&mut wanted, &settings) {
                Ok(keys) => match dev.apply_settings(&wanted, &keys, false) {
                    Ok(()) => control::ok(&format!("{}: {}", side, dev.settings().debug_string(&keys))),
                    Err(e) => control::error(&e.to_string()),
                },
                Err(e) => control::error(&e),
            };
            println!("{}", reply);
        }
        ControlCommand::Start { side } => match radio.side(side).start() {
            Ok(()) => println!("{}", control::ok(&format!("{} started", side))),
            Err(e) => println!("{}", control::error(&e.to_string())),
        },
        ControlCommand::Stop { side } => match radio.side(side).stop() {
            Ok(()) => println!("{}", control::ok(&format!("{} stopped", side))),
            Err(e) => println!("{}", control::error(&e.to_string())),
        },
        ControlCommand::Calibrate { side } => match radio.side(side).calibrate() {
            Ok(true) => println!("{}", control::ok(&format!("{} calibrated", side))),
            Ok(false) => println!("{}", control::error(&format!("{} calibration failed", side))),
            Err(e) => println!("{}", control::error(&e.to_string())),
        },
        ControlCommand::Status => print_status(radio, peak),
        ControlCommand::Quit => return false,
    }
    true
}

/// Open both sides of one radio, stream until quit or the duration elapses.
pub fn run(opts: &RunOptions) -> Result<(), String> {
    let id = DeviceId::parse(&opts.device).map_err(|e| e.to_string())?;
    let registry = Arc::new(DeviceRegistry::new());
    let config = StreamConfig {
        block_size: opts.block_size,
        ..StreamConfig::default()
    };

    let (rx_out, rx_in) = channel::bounded(64);
    let (tx_out, tx_in) = channel::bounded(16);
    let rx = LogicalDevice::open(&registry, id.clone(), SampleQueue::Rx(rx_out), config.clone())
        .map_err(|e| format!("rx: {}", e))?;
    let tx = LogicalDevice::open(&registry, id, SampleQueue::Tx(tx_in), config).map_err(|e| format!("tx: {}", e))?;
    let radio = Radio { rx, tx };

    for (dev, frequency, log2) in [
        (&radio.rx, opts.rx_frequency, opts.rx_log2),
        (&radio.tx, opts.tx_frequency, opts.tx_log2),
    ] {
        let mut s = dev.settings();
        s.center_frequency = frequency;
        s.dev_sample_rate = opts.sample_rate;
        s.log2_factor = log2;
        s.placement = opts.placement;
        dev.apply_settings(&s, &[], true)
            .map_err(|e| format!("{}: {}", dev.side(), e))?;
    }
    radio.poll();

    let running = Arc::new(AtomicBool::new(true));
    let host_rate = Arc::new(AtomicU32::new(radio.tx.sample_rate()));
    let tone = spawn_tone(tx_out, host_rate.clone(), opts.tone_hz, running.clone());

    let (cmd_tx, cmd_rx) = channel::bounded(16);
    // Blocks on stdin; left detached at exit.
    let _control = control::spawn_stdin_reader(cmd_tx, running.clone());

    radio.rx.start().map_err(|e| format!("rx: {}", e))?;
    radio.tx.start().map_err(|e| format!("tx: {}", e))?;

    let mut meter = ToneMeter::new(METER_SIZE);
    let mut peak: Option<Peak> = None;
    let started = Instant::now();
    let mut last_stats = Instant::now();

    'run: loop {
        match rx_in.recv_timeout(Duration::from_millis(50)) {
            Ok(buf) => {
                if let Some(p) = meter.peak(&buf.data) {
                    peak = Some(p);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        radio.poll();
        host_rate.store(radio.tx.sample_rate(), Ordering::Relaxed);

        while let Ok(cmd) = cmd_rx.try_recv() {
            if !handle_command(&radio, cmd, peak) {
                break 'run;
            }
        }

        if opts.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        if let Some(interval) = opts.stats_interval {
            if last_stats.elapsed() >= interval {
                print_status(&radio, peak);
                last_stats = Instant::now();
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    for side in [Side::Rx, Side::Tx] {
        if let Err(e) = radio.side(side).stop() {
            log::error!("{}: {}", side, e);
        }
    }
    print_status(&radio, peak);
    drop(radio);

    let blocks = tone.join().unwrap_or(0);
    log::info!("tone generator delivered {} blocks", blocks);
    Ok(())
}
