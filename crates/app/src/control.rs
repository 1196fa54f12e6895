// Copyright 2025-2026 CEMAXECUTER LLC

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::Sender;
use serde::Serialize;
use serde_json::{json, Map, Value};

use tl_dsp::Placement;
use tl_sdr::{DeviceSettings, GainMode, SettingKey, Side};

/// Commands dispatched from the stdin control thread to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Field values to change, keyed by setting name
    Configure { side: Side, settings: Map<String, Value> },
    Start { side: Side },
    Stop { side: Side },
    Calibrate { side: Side },
    Status,
    Quit,
}

/// One side's state as printed by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct SideReport {
    pub side: String,
    pub running: bool,
    pub buddy: bool,
    pub center_frequency: u64,
    pub dev_sample_rate: u32,
    pub host_sample_rate: u32,
    pub rates: String,
    pub blocks: u64,
    pub samples: u64,
    pub shortfalls: u64,
    pub dropped: u64,
    pub underflows: u64,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_hz: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_db: Option<f32>,
}

fn response(status: &str, message: &str) -> String {
    json!({ "type": "response", "status": status, "message": message }).to_string()
}

fn parse_side(root: &Value) -> Result<Side, String> {
    root.get("side")
        .and_then(|s| s.as_str())
        .ok_or_else(|| "missing side".to_string())?
        .parse()
}

/// Parse one JSON control line.
pub fn parse_command(line: &str) -> Result<ControlCommand, String> {
    let root: Value = serde_json::from_str(line).map_err(|e| format!("bad json: {}", e))?;
    let cmd = root
        .get("cmd")
        .and_then(|c| c.as_str())
        .ok_or_else(|| "missing cmd".to_string())?;

    match cmd {
        "configure" => {
            let side = parse_side(&root)?;
            let settings = match root.get("settings") {
                Some(Value::Object(m)) if !m.is_empty() => m.clone(),
                _ => return Err("configure requires a non-empty settings object".to_string()),
            };
            Ok(ControlCommand::Configure { side, settings })
        }
        "start" => Ok(ControlCommand::Start {
            side: parse_side(&root)?,
        }),
        "stop" => Ok(ControlCommand::Stop {
            side: parse_side(&root)?,
        }),
        "calibrate" => Ok(ControlCommand::Calibrate {
            side: parse_side(&root)?,
        }),
        "status" => Ok(ControlCommand::Status),
        "quit" => Ok(ControlCommand::Quit),
        other => Err(format!("unknown command '{}'", other)),
    }
}

fn as_u64(key: SettingKey, v: &Value) -> Result<u64, String> {
    v.as_u64()
        .ok_or_else(|| format!("{} must be a non-negative integer", key))
}

fn as_u32(key: SettingKey, v: &Value) -> Result<u32, String> {
    u32::try_from(as_u64(key, v)?).map_err(|_| format!("{} out of range", key))
}

fn as_i64(key: SettingKey, v: &Value) -> Result<i64, String> {
    v.as_i64().ok_or_else(|| format!("{} must be an integer", key))
}

fn as_i32(key: SettingKey, v: &Value) -> Result<i32, String> {
    i32::try_from(as_i64(key, v)?).map_err(|_| format!("{} out of range", key))
}

fn as_bool(key: SettingKey, v: &Value) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be true or false", key))
}

fn as_str(key: SettingKey, v: &Value) -> Result<String, String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| format!("{} must be a string", key))
}

/// Copy the fields named in `patch` onto `settings`. Returns the keys set.
pub fn apply_patch(settings: &mut DeviceSettings, patch: &Map<String, Value>) -> Result<Vec<SettingKey>, String> {
    let mut keys = Vec::with_capacity(patch.len());
    for (name, v) in patch {
        let key: SettingKey = name.parse()?;
        match key {
            SettingKey::CenterFrequency => settings.center_frequency = as_u64(key, v)?,
            SettingKey::DevSampleRate => settings.dev_sample_rate = as_u32(key, v)?,
            SettingKey::Log2Factor => settings.log2_factor = as_u32(key, v)?,
            SettingKey::Placement => settings.placement = as_str(key, v)?.parse::<Placement>()?,
            SettingKey::RfBandwidth => settings.rf_bandwidth = as_u32(key, v)?,
            SettingKey::FirEnable => settings.fir_enable = as_bool(key, v)?,
            SettingKey::FirBandwidth => settings.fir_bandwidth = as_u32(key, v)?,
            SettingKey::FirLog2 => settings.fir_log2 = as_u32(key, v)?,
            SettingKey::FirGain => settings.fir_gain_db = as_i32(key, v)?,
            SettingKey::LoPpmTenths => settings.lo_ppm_tenths = as_i32(key, v)?,
            SettingKey::Antenna => settings.antenna = as_str(key, v)?,
            SettingKey::GainMode => settings.gain_mode = as_str(key, v)?.parse::<GainMode>()?,
            SettingKey::Gain => settings.gain_db = as_i32(key, v)?,
            SettingKey::Attenuation => settings.attenuation_mdb = as_u32(key, v)?,
            SettingKey::HwBbDcBlock => settings.hw_bb_dc_block = as_bool(key, v)?,
            SettingKey::HwRfDcBlock => settings.hw_rf_dc_block = as_bool(key, v)?,
            SettingKey::HwIqCorrection => settings.hw_iq_correction = as_bool(key, v)?,
            SettingKey::TransverterMode => settings.transverter_mode = as_bool(key, v)?,
            SettingKey::TransverterDelta => settings.transverter_delta = as_i64(key, v)?,
            SettingKey::ExtClock => settings.ext_clock = as_bool(key, v)?,
            SettingKey::ExtClockFreq => settings.ext_clock_freq = as_u32(key, v)?,
            SettingKey::NcoEnable => settings.nco_enable = as_bool(key, v)?,
            SettingKey::NcoFrequency => settings.nco_frequency = as_i32(key, v)?,
        }
        keys.push(key);
    }
    Ok(keys)
}

/// Read JSON lines from stdin on a dedicated thread.
///
/// Parse errors are answered on stdout and never reach the pipeline. End of
/// input queues `Quit`.
pub fn spawn_stdin_reader(cmd_tx: Sender<ControlCommand>, running: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if !running.load(Ordering::Relaxed) {
                return;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_command(line) {
                Ok(command) => {
                    if cmd_tx.try_send(command).is_err() {
                        println!("{}", response("error", "command queue full"));
                    }
                }
                Err(e) => println!("{}", response("error", &e)),
            }
        }
        let _ = cmd_tx.send(ControlCommand::Quit);
    })
}

pub fn ok(message: &str) -> String {
    response("ok", message)
}

pub fn error(message: &str) -> String {
    response("error", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_configure() {
        let cmd = parse_command(r#"{"cmd":"configure","side":"rx","settings":{"devSampleRate":2048000}}"#).unwrap();
        match cmd {
            ControlCommand::Configure { side, settings } => {
                assert_eq!(side, Side::Rx);
                assert_eq!(settings.get("devSampleRate"), Some(&json!(2048000)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(
            parse_command(r#"{"cmd":"start","side":"tx"}"#).unwrap(),
            ControlCommand::Start { side: Side::Tx }
        );
        assert_eq!(
            parse_command(r#"{"cmd":"stop","side":"rx"}"#).unwrap(),
            ControlCommand::Stop { side: Side::Rx }
        );
        assert_eq!(
            parse_command(r#"{"cmd":"calibrate","side":"tx"}"#).unwrap(),
            ControlCommand::Calibrate { side: Side::Tx }
        );
        assert_eq!(parse_command(r#"{"cmd":"status"}"#).unwrap(), ControlCommand::Status);
        assert_eq!(parse_command(r#"{"cmd":"quit"}"#).unwrap(), ControlCommand::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("not json").is_err());
        assert!(parse_command(r#"{"side":"rx"}"#).is_err());
        assert!(parse_command(r#"{"cmd":"start"}"#).is_err());
        assert!(parse_command(r#"{"cmd":"start","side":"both"}"#).is_err());
        assert!(parse_command(r#"{"cmd":"configure","side":"rx","settings":{}}"#).is_err());
        assert!(parse_command(r#"{"cmd":"reboot"}"#).is_err());
    }

    #[test]
    fn test_apply_patch() {
        let mut s = DeviceSettings::new(Side::Rx);
        let patch = json!({
            "centerFrequency": 915000000u64,
            "log2Factor": 2,
            "fcPos": "supra",
            "gainMode": "slow_attack",
            "hwIQCorrection": false
        });
        let keys = apply_patch(&mut s, patch.as_object().unwrap()).unwrap();
        assert_eq!(keys.len(), 5);
        assert_eq!(s.center_frequency, 915_000_000);
        assert_eq!(s.log2_factor, 2);
        assert_eq!(s.placement, Placement::Supra);
        assert_eq!(s.gain_mode, GainMode::SlowAttack);
        assert!(!s.hw_iq_correction);
    }

    #[test]
    fn test_apply_patch_clock_and_nco() {
        let mut s = DeviceSettings::new(Side::Tx);
        let patch = json!({
            "extClock": true,
            "extClockFreq": 40000000,
            "ncoEnable": true,
            "ncoFrequency": -250000
        });
        let keys = apply_patch(&mut s, patch.as_object().unwrap()).unwrap();
        assert!(keys.contains(&SettingKey::ExtClock) && keys.contains(&SettingKey::NcoFrequency));
        assert!(s.ext_clock && s.nco_enable);
        assert_eq!(s.ext_clock_freq, 40_000_000);
        assert_eq!(s.nco_frequency, -250_000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_apply_patch_rejects_bad_values() {
        let mut s = DeviceSettings::new(Side::Tx);
        let bad_type = json!({ "devSampleRate": "fast" });
        assert!(apply_patch(&mut s, bad_type.as_object().unwrap()).is_err());
        let bad_key = json!({ "volume": 11 });
        assert!(apply_patch(&mut s, bad_key.as_object().unwrap()).is_err());
        let overflow = json!({ "devSampleRate": 5_000_000_000u64 });
        assert!(apply_patch(&mut s, overflow.as_object().unwrap()).is_err());
    }
}
