//! Built-in simulator for machines that cannot run a native miner.
//!
//! The simulator appends synthetic log lines to the session log at a fixed
//! tick: a pseudo-random hashrate and monotonically increasing share
//! counters. It stops after a bounded duration or when signalled.

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use super::{
    parse_key_values, render_key_values, scale_hashrate, Backend, BackendDescriptor, BackendKind,
    ConfigFormat, LaunchSpec, LaunchTarget, RenderedConfig,
};
use crate::error::SessionResult;
use crate::profile::{mask_wallet, MiningProfile};
use crate::types::{LogSample, WorkerExit};

pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Simulated,
    artifact: None,
    install_dir: "simulated",
    executable: None,
    config_file: "simulator.txt",
};

/// Exit code used when the simulator cannot read its configuration
pub const EXIT_BAD_CONFIG: i32 = 2;
/// Exit code used when the session log cannot be written
pub const EXIT_IO: i32 = 74;

const REJECT_RATIO: f64 = 0.05;

static SPEED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bspeed:\s*([0-9]+(?:\.[0-9]+)?)\s*([kmg]?h/s)").expect("valid regex")
});

static COUNTERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\baccepted=(\d+)\s+rejected=(\d+)").expect("valid regex")
});

/// User-facing simulator knobs, part of the application config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorOptions {
    pub tick_ms: u64,
    pub duration_secs: u64,
    /// Chance of finding a share on each tick
    pub share_probability: f64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            duration_secs: 60 * 60,
            share_probability: 0.1,
            seed: None,
        }
    }
}

/// Everything the simulator thread needs to run
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorSettings {
    pub config_path: PathBuf,
    pub tick: Duration,
    pub duration: Duration,
    pub share_probability: f64,
    pub seed: Option<u64>,
}

pub struct SimulatedBackend {
    options: SimulatorOptions,
}

impl SimulatedBackend {
    pub fn new(options: SimulatorOptions) -> Self {
        Self { options }
    }
}

impl Backend for SimulatedBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &DESCRIPTOR
    }

    fn render_config(
        &self,
        profile: &MiningProfile,
        install_path: &Path,
    ) -> SessionResult<RenderedConfig> {
        let contents = render_key_values(
            "# simulated worker, no real hashing is performed",
            &[
                ("pool", profile.pool.trim().to_string()),
                ("wallet", profile.wallet.trim().to_string()),
                ("worker", profile.worker.trim().to_string()),
                ("algorithm", profile.algorithm.trim().to_string()),
                ("threads", profile.effective_threads().to_string()),
                ("max-cpu-usage", profile.max_cpu_usage.to_string()),
            ],
        );

        Ok(RenderedConfig {
            path: DESCRIPTOR.config_path(install_path),
            format: ConfigFormat::KeyValue,
            contents,
        })
    }

    fn launch_spec(&self, install_path: &Path, config: &RenderedConfig) -> LaunchSpec {
        LaunchSpec {
            target: LaunchTarget::Simulator(SimulatorSettings {
                config_path: config.path.clone(),
                tick: Duration::from_millis(self.options.tick_ms.max(1)),
                duration: Duration::from_secs(self.options.duration_secs),
                share_probability: self.options.share_probability.clamp(0.0, 1.0),
                seed: self.options.seed,
            }),
            args: Vec::new(),
            working_dir: install_path.to_path_buf(),
        }
    }

    fn parse_log_line(&self, line: &str) -> Option<LogSample> {
        let mut sample = LogSample::default();

        if let Some(caps) = SPEED.captures(line) {
            sample.hashrate = caps[1]
                .parse::<f64>()
                .ok()
                .and_then(|value| scale_hashrate(value, &caps[2]));
        }
        if let Some(caps) = COUNTERS.captures(line) {
            sample.accepted = caps[1].parse().ok();
            sample.rejected = caps[2].parse().ok();
        }

        sample.non_empty()
    }
}

/// Run the simulator until its duration elapses or `stop` fires.
///
/// `stop` fires on a message or when its sender is dropped. Returns the exit
/// status the supervisor should record.
pub fn run_simulator<W: Write>(settings: &SimulatorSettings, out: &mut W, stop: &Receiver<()>) -> WorkerExit {
    let config = match fs::read_to_string(&settings.config_path) {
        Ok(text) => parse_key_values(&text),
        Err(e) => {
            error!("Simulator cannot read {}: {}", settings.config_path.display(), e);
            let _ = writeln!(out, "simulator error: cannot read config: {}", e);
            return WorkerExit::failure(EXIT_BAD_CONFIG);
        }
    };

    match simulate(settings, &config, out, stop) {
        Ok(()) => WorkerExit::success(),
        Err(e) => {
            error!("Simulator lost its log: {}", e);
            WorkerExit::failure(EXIT_IO)
        }
    }
}

fn simulate<W: Write>(
    settings: &SimulatorSettings,
    config: &std::collections::BTreeMap<String, String>,
    out: &mut W,
    stop: &Receiver<()>,
) -> io::Result<()> {
    let mut rng = match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let field = |key: &str| config.get(key).map(String::as_str).unwrap_or("?");

    writeln!(
        out,
        "Simulated miner starting | pool {} | worker {} | wallet {} | threads {}",
        field("pool"),
        field("worker"),
        mask_wallet(field("wallet")),
        field("threads"),
    )?;
    out.flush()?;

    let started = Instant::now();
    let mut hashrate: f64 = rng.gen_range(1000.0..=5000.0);
    let mut accepted: u64 = 0;
    let mut rejected: u64 = 0;

    loop {
        match stop.recv_timeout(settings.tick) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Simulator received stop");
                break;
            }
        }

        hashrate = (hashrate * rng.gen_range(0.95..=1.05)).max(1.0);
        if rng.gen_range(0.0..1.0) < settings.share_probability {
            if rng.gen_range(0.0..1.0) < REJECT_RATIO {
                rejected += 1;
            } else {
                accepted += 1;
            }
        }

        writeln!(
            out,
            "[{}] Speed: {:.2} H/s | accepted={} rejected={}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            hashrate,
            accepted,
            rejected
        )?;
        out.flush()?;

        if started.elapsed() >= settings.duration {
            break;
        }
    }

    writeln!(
        out,
        "Simulated miner finished after {}s",
        started.elapsed().as_secs()
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn settings(dir: &Path, duration: Duration) -> SimulatorSettings {
        SimulatorSettings {
            config_path: dir.join("simulator.txt"),
            tick: Duration::from_millis(5),
            duration,
            share_probability: 1.0,
            seed: Some(7),
        }
    }

    fn write_config(dir: &Path) {
        let profile = MiningProfile::new("pool.example:3333", "4BGrZRkV7jgetvovXr67st34LM8qf1rF", "w1");
        let rendered = SimulatedBackend::new(SimulatorOptions::default())
            .render_config(&profile, dir)
            .unwrap();
        fs::write(&rendered.path, rendered.contents).unwrap();
    }

    #[test]
    fn test_runs_for_bounded_duration() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let (_stop_tx, stop_rx) = bounded::<()>(1);

        let mut out = Vec::new();
        let exit = run_simulator(&settings(dir.path(), Duration::from_millis(50)), &mut out, &stop_rx);
        assert!(exit.is_success());

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Simulated miner starting | pool pool.example:3333"));
        assert!(text.contains("4BGrZRkV...LM8qf1rF"));
        assert!(text.trim_end().ends_with('s'));

        let backend = SimulatedBackend::new(SimulatorOptions::default());
        let samples: Vec<LogSample> = text.lines().filter_map(|l| backend.parse_log_line(l)).collect();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.hashrate.unwrap() > 0.0));
        let totals: Vec<u64> = samples
            .iter()
            .map(|s| s.accepted.unwrap() + s.rejected.unwrap())
            .collect();
        assert!(totals.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let (stop_tx, stop_rx) = bounded::<()>(1);
        stop_tx.send(()).unwrap();

        let mut out = Vec::new();
        let exit = run_simulator(&settings(dir.path(), Duration::from_secs(3600)), &mut out, &stop_rx);
        assert!(exit.is_success());
        assert!(String::from_utf8(out).unwrap().contains("finished after 0s"));
    }

    #[test]
    fn test_missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_stop_tx, stop_rx) = bounded::<()>(1);
        let mut out = Vec::new();
        let exit = run_simulator(&settings(dir.path(), Duration::from_millis(10)), &mut out, &stop_rx);
        assert_eq!(exit, WorkerExit::failure(EXIT_BAD_CONFIG));
    }

    #[test]
    fn test_parse_simulator_lines() {
        let backend = SimulatedBackend::new(SimulatorOptions::default());
        let sample = backend
            .parse_log_line("[2026-01-01 00:00:00] Speed: 2345.60 H/s | accepted=3 rejected=1")
            .unwrap();
        assert_eq!(sample.hashrate, Some(2345.6));
        assert_eq!(sample.accepted, Some(3));
        assert_eq!(sample.rejected, Some(1));

        assert_eq!(
            backend.parse_log_line("Simulated miner starting | pool p:1 | worker w1 | wallet 4Abc | threads 4"),
            None
        );
        assert_eq!(backend.parse_log_line("Simulated miner finished after 60s"), None);
    }

    #[test]
    fn test_launch_spec_uses_options() {
        let options = SimulatorOptions {
            tick_ms: 250,
            duration_secs: 5,
            share_probability: 2.0,
            seed: Some(1),
        };
        let backend = SimulatedBackend::new(options);
        let profile = MiningProfile::new("pool.example:3333", "4Abc", "w1");
        let rendered = backend.render_config(&profile, Path::new("/tmp/sim")).unwrap();
        let spec = backend.launch_spec(Path::new("/tmp/sim"), &rendered);

        let LaunchTarget::Simulator(settings) = spec.target else {
            panic!("expected simulator target");
        };
        assert_eq!(settings.tick, Duration::from_millis(250));
        assert_eq!(settings.duration, Duration::from_secs(5));
        assert_eq!(settings.share_probability, 1.0);
        assert_eq!(settings.config_path, Path::new("/tmp/sim/simulator.txt"));
    }
}
