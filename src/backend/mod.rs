//! Worker backends - one implementation per supported miner
//!
//! This module provides a trait-based abstraction so the session pipeline
//! never branches on the kind of worker it drives:
//! - Native miners that are downloaded and spawned as OS processes
//! - A built-in simulator for machines without mining support
//!
//! Each backend knows where its artifact comes from, how to render a
//! [`MiningProfile`] into its native configuration, how to launch itself and
//! how to read metrics out of its own log lines.

pub mod simulated;
pub mod srbminer;
pub mod xmrig;

pub use simulated::{SimulatedBackend, SimulatorOptions, SimulatorSettings};
pub use srbminer::SrbMinerBackend;
pub use xmrig::XmrigBackend;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use crate::error::{SessionError, SessionResult};
use crate::profile::MiningProfile;
use crate::types::LogSample;

/// Trait for worker backends
pub trait Backend: Send + Sync {
    /// Static description of this backend's artifact and layout
    fn descriptor(&self) -> &'static BackendDescriptor;

    /// Render the profile into this backend's native configuration.
    ///
    /// Must be deterministic for identical inputs and must not leave any
    /// template token unresolved.
    fn render_config(
        &self,
        profile: &MiningProfile,
        install_path: &Path,
    ) -> SessionResult<RenderedConfig>;

    /// Build the invocation that starts the worker
    fn launch_spec(&self, install_path: &Path, config: &RenderedConfig) -> LaunchSpec;

    /// Extract whatever metrics one log line carries.
    ///
    /// Banners, warnings and blank lines yield `None`.
    fn parse_log_line(&self, line: &str) -> Option<LogSample>;
}

/// Supported worker variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// XMRig native miner (JSON configuration)
    Xmrig,
    /// SRBMiner-MULTI native miner (key = value configuration)
    #[value(name = "srbminer")]
    SrbMiner,
    /// In-process simulator producing synthetic metrics
    Simulated,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Xmrig,
        BackendKind::SrbMiner,
        BackendKind::Simulated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Xmrig => "xmrig",
            BackendKind::SrbMiner => "srbminer",
            BackendKind::Simulated => "simulated",
        }
    }

    pub fn descriptor(&self) -> &'static BackendDescriptor {
        match self {
            BackendKind::Xmrig => &xmrig::DESCRIPTOR,
            BackendKind::SrbMiner => &srbminer::DESCRIPTOR,
            BackendKind::Simulated => &simulated::DESCRIPTOR,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SessionError::configuration("backend", format!("unknown backend '{}'", s)))
    }
}

/// Archive formats the provisioner can unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
}

/// Where a backend's executable comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSource {
    pub url: &'static str,
    pub format: ArchiveFormat,
    /// Leading path components dropped while unpacking (release folder)
    pub strip_components: usize,
}

/// Static description of a backend variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// `None` for backends that need nothing downloaded
    pub artifact: Option<ArtifactSource>,
    /// Directory name under the install root
    pub install_dir: &'static str,
    /// Executable file name inside the install directory
    pub executable: Option<&'static str>,
    /// Generated configuration file name inside the install directory
    pub config_file: &'static str,
}

impl BackendDescriptor {
    pub fn install_path(&self, install_root: &Path) -> PathBuf {
        install_root.join(self.install_dir)
    }

    pub fn executable_path(&self, install_path: &Path) -> Option<PathBuf> {
        self.executable.map(|name| install_path.join(name))
    }

    pub fn config_path(&self, install_path: &Path) -> PathBuf {
        install_path.join(self.config_file)
    }
}

/// Serialization format of a rendered configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    KeyValue,
}

/// Backend-specific configuration ready to be written to disk
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedConfig {
    pub path: PathBuf,
    pub format: ConfigFormat,
    pub contents: String,
}

/// What the supervisor actually starts
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchTarget {
    /// External executable spawned as an OS process
    Executable(PathBuf),
    /// Built-in simulator run on a supervised thread
    Simulator(SimulatorSettings),
}

/// Invocation of a worker: program, arguments and working directory
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub target: LaunchTarget,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// Human readable program name for logs
    pub fn program_name(&self) -> String {
        match &self.target {
            LaunchTarget::Executable(path) => path.display().to_string(),
            LaunchTarget::Simulator(_) => "built-in simulator".to_string(),
        }
    }
}

/// Create the backend implementation for `kind`
pub fn create_backend(kind: BackendKind, simulator: &SimulatorOptions) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Xmrig => Arc::new(XmrigBackend),
        BackendKind::SrbMiner => Arc::new(SrbMinerBackend),
        BackendKind::Simulated => Arc::new(SimulatedBackend::new(simulator.clone())),
    }
}

// =============================================================================
// SHARED PARSING HELPERS
// =============================================================================

static HASHRATE_UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([kmg]?)h/s$").expect("valid regex"));

static TEMPLATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").expect("valid regex"));

/// Convert `value` in `unit` (H/s, KH/s, MH/s, GH/s) to H/s
pub fn scale_hashrate(value: f64, unit: &str) -> Option<f64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let caps = HASHRATE_UNIT.captures(unit.trim())?;
    let multiplier = match caps[1].to_ascii_lowercase().as_str() {
        "" => 1.0,
        "k" => 1_000.0,
        "m" => 1_000_000.0,
        "g" => 1_000_000_000.0,
        _ => return None,
    };
    Some(value * multiplier)
}

/// Render flat `key = value` lines
pub(crate) fn render_key_values(header: &str, entries: &[(&str, String)]) -> String {
    let mut out = String::new();
    out.push_str(header);
    out.push('\n');
    for (key, value) in entries {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Parse flat `key = value` text, ignoring comments and blank lines
pub fn parse_key_values(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Substitute `{{name}}` tokens; any token left without a value is an error
pub(crate) fn fill_template(template: &str, values: &[(&str, String)]) -> SessionResult<String> {
    let mut missing = None;
    let filled = TEMPLATE_TOKEN.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match values.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                caps[0].to_string()
            }
        }
    });

    match missing {
        Some(name) => Err(SessionError::configuration(
            name,
            "template placeholder has no value",
        )),
        None => Ok(filled.into_owned()),
    }
}

/// Returns the first `{{token}}` still present in `text`
pub fn find_unresolved_token(text: &str) -> Option<String> {
    TEMPLATE_TOKEN.find(text).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_hashrate_units() {
        assert_eq!(scale_hashrate(1.5, "KH/s"), Some(1_500.0));
        assert_eq!(scale_hashrate(2.0, "mh/s"), Some(2_000_000.0));
        assert_eq!(scale_hashrate(900.0, "H/s"), Some(900.0));
        assert_eq!(scale_hashrate(1.0, "TH/s"), None);
        assert_eq!(scale_hashrate(-1.0, "H/s"), None);
    }

    #[test]
    fn test_key_values_round_trip() {
        let text = render_key_values(
            "# header",
            &[("pool", "pool.example:3333".to_string()), ("wallet", "4Abc".to_string())],
        );
        let parsed = parse_key_values(&text);
        assert_eq!(parsed["pool"], "pool.example:3333");
        assert_eq!(parsed["wallet"], "4Abc");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_fill_template_reports_missing_values() {
        let filled = fill_template("a = {{a}}\n", &[("a", "1".to_string())]).unwrap();
        assert_eq!(filled, "a = 1\n");

        let err = fill_template("a = {{a}}\nb = {{ b }}\n", &[("a", "1".to_string())]).unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_find_unresolved_token() {
        assert_eq!(find_unresolved_token("wallet = {{wallet}}"), Some("{{wallet}}".to_string()));
        assert_eq!(find_unresolved_token("wallet = 4Abc"), None);
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("XMRig".parse::<BackendKind>().unwrap(), BackendKind::Xmrig);
        assert_eq!("srbminer".parse::<BackendKind>().unwrap(), BackendKind::SrbMiner);
        assert!("cpuminer".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_descriptors_are_consistent() {
        for kind in BackendKind::ALL {
            let descriptor = kind.descriptor();
            assert_eq!(descriptor.kind, kind);
            assert_eq!(descriptor.artifact.is_some(), descriptor.executable.is_some());
        }
    }
}
