//! SRBMiner-MULTI backend: flat `key = value` config and key=value log tokens.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::{
    fill_template, scale_hashrate, ArchiveFormat, ArtifactSource, Backend, BackendDescriptor,
    BackendKind, ConfigFormat, LaunchSpec, LaunchTarget, RenderedConfig,
};
use crate::error::SessionResult;
use crate::profile::MiningProfile;
use crate::types::LogSample;

pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::SrbMiner,
    artifact: Some(ArtifactSource {
        url: "https://github.com/doktor83/SRBMiner-Multi/releases/download/2.4.7/SRBMiner-Multi-2-4-7-Linux.tar.gz",
        format: ArchiveFormat::TarGz,
        strip_components: 1,
    }),
    install_dir: "srbminer",
    executable: Some("SRBMiner-MULTI"),
    config_file: "config.txt",
};

/// The miner's own log, kept apart from the captured session log
pub const MINER_LOG_FILE: &str = "srbminer.log";

const TEMPLATE: &str = "\
# SRBMiner-MULTI configuration, regenerated for every session
algorithm = {{algorithm}}
pool = {{pool}}
wallet = {{wallet}}
worker = {{worker}}
cpu-threads = {{threads}}
cpu-max-usage = {{max_cpu_usage}}
disable-gpu = true
log-file = {{log_file}}
";

static HASHRATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bhashrate\s*[=:]\s*([0-9]+(?:\.[0-9]+)?)\s*([kmg]?h/s)?").expect("valid regex")
});

static ACCEPTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\baccepted\s*[=:]\s*(\d+)").expect("valid regex"));

static REJECTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\brejected\s*[=:]\s*(\d+)").expect("valid regex"));

static STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bstatus\s*=\s*(?:"([^"]*)"|(\S+))"#).expect("valid regex")
});

/// Map a profile algorithm id to SRBMiner's naming
pub fn algorithm_id(algorithm: &str) -> String {
    match algorithm.trim().to_ascii_lowercase().as_str() {
        "rx/0" | "rx" | "randomx" | "monero" => "randomx".to_string(),
        _ => algorithm.trim().to_string(),
    }
}

pub struct SrbMinerBackend;

impl Backend for SrbMinerBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &DESCRIPTOR
    }

    fn render_config(
        &self,
        profile: &MiningProfile,
        install_path: &Path,
    ) -> SessionResult<RenderedConfig> {
        let contents = fill_template(
            TEMPLATE,
            &[
                ("algorithm", algorithm_id(&profile.algorithm)),
                ("pool", profile.pool.trim().to_string()),
                ("wallet", profile.wallet.trim().to_string()),
                ("worker", profile.worker.trim().to_string()),
                ("threads", profile.effective_threads().to_string()),
                ("max_cpu_usage", profile.max_cpu_usage.to_string()),
                (
                    "log_file",
                    install_path.join(MINER_LOG_FILE).display().to_string(),
                ),
            ],
        )?;

        Ok(RenderedConfig {
            path: DESCRIPTOR.config_path(install_path),
            format: ConfigFormat::KeyValue,
            contents,
        })
    }

    fn launch_spec(&self, install_path: &Path, config: &RenderedConfig) -> LaunchSpec {
        let executable = install_path.join(DESCRIPTOR.executable.unwrap_or("SRBMiner-MULTI"));
        LaunchSpec {
            target: LaunchTarget::Executable(executable),
            args: vec!["--config".to_string(), config.path.display().to_string()],
            working_dir: install_path.to_path_buf(),
        }
    }

    fn parse_log_line(&self, line: &str) -> Option<LogSample> {
        let mut sample = LogSample::default();

        if let Some(caps) = HASHRATE.captures(line) {
            let unit = caps.get(2).map_or("H/s", |m| m.as_str());
            sample.hashrate = caps[1]
                .parse::<f64>()
                .ok()
                .and_then(|value| scale_hashrate(value, unit));
        }
        sample.accepted = ACCEPTED.captures(line).and_then(|c| c[1].parse().ok());
        sample.rejected = REJECTED.captures(line).and_then(|c| c[1].parse().ok());
        sample.status = STATUS
            .captures(line)
            .and_then(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string());

        sample.non_empty()
    }
}
