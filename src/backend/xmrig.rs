//! XMRig backend: hierarchical JSON config, `speed`/`accepted` log lines.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use super::{
    scale_hashrate, ArchiveFormat, ArtifactSource, Backend, BackendDescriptor, BackendKind,
    ConfigFormat, LaunchSpec, LaunchTarget, RenderedConfig,
};
use crate::error::{SessionError, SessionResult};
use crate::profile::MiningProfile;
use crate::types::LogSample;

pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Xmrig,
    artifact: Some(ArtifactSource {
        url: "https://github.com/xmrig/xmrig/releases/download/v6.21.0/xmrig-6.21.0-linux-static-x64.tar.gz",
        format: ArchiveFormat::TarGz,
        strip_components: 1,
    }),
    install_dir: "xmrig",
    executable: Some("xmrig"),
    config_file: "config.json",
};

// `speed 10s/60s/15m 2345.6 2340.1 n/a H/s max 2400.0 H/s`
static SPEED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bspeed\s+\S+\s+(n/a|[0-9.]+)\s+(n/a|[0-9.]+)\s+(n/a|[0-9.]+)\s+([kmg]?h/s)")
        .expect("valid regex")
});

// `accepted (12/1) diff 100001 (45 ms)` / `rejected (12/2) diff 100001 "low difficulty share"`
static SHARE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(accepted|rejected)\s+\((\d+)/(\d+)\)(?:[^"]*"([^"]+)")?"#).expect("valid regex")
});

// `use pool pool.supportxmr.com:3333  1.2.3.4`
static USE_POOL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\buse pool\s+(\S+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XmrigConfig {
    pub autosave: bool,
    /// Reload the file when it changes on disk; off so only a new session reconfigures
    pub watch: bool,
    pub background: bool,
    pub colors: bool,
    #[serde(rename = "print-time")]
    pub print_time: u32,
    pub cpu: CpuSection,
    pub pools: Vec<PoolEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSection {
    pub enabled: bool,
    #[serde(rename = "huge-pages")]
    pub huge_pages: bool,
    #[serde(rename = "max-threads-hint")]
    pub max_threads_hint: u8,
    /// Per algorithm family thread list, one affinity entry (`-1` = any) per thread
    #[serde(flatten)]
    pub threads: BTreeMap<String, Vec<i32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub url: String,
    pub user: String,
    pub pass: String,
    #[serde(rename = "rig-id")]
    pub rig_id: String,
    pub algo: String,
    pub keepalive: bool,
    pub tls: bool,
}

/// Map a profile algorithm id to XMRig's naming
pub fn algorithm_id(algorithm: &str) -> String {
    match algorithm.trim().to_ascii_lowercase().as_str() {
        "randomx" | "rx" | "monero" => "rx/0".to_string(),
        "randomwow" => "rx/wow".to_string(),
        "randomarq" => "rx/arq".to_string(),
        _ => algorithm.trim().to_string(),
    }
}

/// `rx/0` -> `rx`, `cn/r` -> `cn`, `ghostrider` -> `ghostrider`
fn algorithm_family(algo: &str) -> &str {
    algo.split('/').next().unwrap_or(algo)
}

impl XmrigConfig {
    pub fn from_profile(profile: &MiningProfile) -> Self {
        let algo = algorithm_id(&profile.algorithm);
        let mut threads = BTreeMap::new();
        threads.insert(
            algorithm_family(&algo).to_string(),
            vec![-1; profile.effective_threads()],
        );

        Self {
            autosave: false,
            watch: false,
            background: false,
            colors: false,
            print_time: 10,
            cpu: CpuSection {
                enabled: true,
                huge_pages: true,
                max_threads_hint: profile.max_cpu_usage,
                threads,
            },
            pools: vec![PoolEntry {
                url: profile.pool.trim().to_string(),
                user: profile.wallet.trim().to_string(),
                pass: "x".to_string(),
                rig_id: profile.worker.trim().to_string(),
                algo,
                keepalive: true,
                tls: false,
            }],
        }
    }

    /// Number of threads configured for the primary pool's algorithm
    pub fn thread_count(&self) -> Option<usize> {
        let pool = self.pools.first()?;
        self.cpu
            .threads
            .get(algorithm_family(&pool.algo))
            .map(Vec::len)
    }
}

pub struct XmrigBackend;

impl Backend for XmrigBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &DESCRIPTOR
    }

    fn render_config(
        &self,
        profile: &MiningProfile,
        install_path: &Path,
    ) -> SessionResult<RenderedConfig> {
        let config = XmrigConfig::from_profile(profile);
        let contents = serde_json::to_string_pretty(&config)
            .map_err(|e| SessionError::configuration("config.json", e.to_string()))?;

        Ok(RenderedConfig {
            path: DESCRIPTOR.config_path(install_path),
            format: ConfigFormat::Json,
            contents: contents + "\n",
        })
    }

    fn launch_spec(&self, install_path: &Path, config: &RenderedConfig) -> LaunchSpec {
        let executable = install_path.join(DESCRIPTOR.executable.unwrap_or("xmrig"));
        LaunchSpec {
            target: LaunchTarget::Executable(executable),
            args: vec![
                "--config".to_string(),
                config.path.display().to_string(),
                "--no-color".to_string(),
            ],
            working_dir: install_path.to_path_buf(),
        }
    }

    fn parse_log_line(&self, line: &str) -> Option<LogSample> {
        let mut sample = LogSample::default();

        if let Some(caps) = SPEED_LINE.captures(line) {
            // first window that has a value: 10s, then 60s, then 15m
            sample.hashrate = (1..=3)
                .filter_map(|i| caps[i].parse::<f64>().ok())
                .next()
                .and_then(|value| scale_hashrate(value, &caps[4]));
        }

        if let Some(caps) = SHARE_LINE.captures(line) {
            sample.accepted = caps[2].parse().ok();
            sample.rejected = caps[3].parse().ok();
            if &caps[1] == "rejected" {
                sample.status = caps
                    .get(4)
                    .map(|reason| format!("share rejected: {}", reason.as_str()));
            }
        }

        if let Some(caps) = USE_POOL_LINE.captures(line) {
            sample.status = Some(format!("connected to {}", &caps[1]));
        }

        sample.non_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile() -> MiningProfile {
        MiningProfile::new("pool.example:3333", "4AbcWallet", "w1")
            .with_algorithm("randomx")
            .with_threads(4)
            .with_max_cpu_usage(60)
    }

    #[test]
    fn test_render_reproduces_profile() {
        let rendered = XmrigBackend
            .render_config(&profile(), Path::new("/opt/miners/xmrig"))
            .unwrap();
        assert_eq!(rendered.path, Path::new("/opt/miners/xmrig/config.json"));
        assert_eq!(rendered.format, ConfigFormat::Json);

        let parsed: XmrigConfig = serde_json::from_str(&rendered.contents).unwrap();
        let pool = &parsed.pools[0];
        assert_eq!(pool.url, "pool.example:3333");
        assert_eq!(pool.user, "4AbcWallet");
        assert_eq!(pool.rig_id, "w1");
        assert_eq!(pool.algo, "rx/0");
        assert_eq!(parsed.thread_count(), Some(4));
        assert_eq!(parsed.cpu.max_threads_hint, 60);
        assert!(!parsed.watch);
        assert!(rendered.contents.contains(r#""watch": false"#));
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = XmrigBackend.render_config(&profile(), Path::new("/x")).unwrap();
        let b = XmrigBackend.render_config(&profile(), Path::new("/x")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_algorithm_mapping() {
        assert_eq!(algorithm_id("randomx"), "rx/0");
        assert_eq!(algorithm_id("RandomX"), "rx/0");
        assert_eq!(algorithm_id("cn/r"), "cn/r");
        assert_eq!(algorithm_family("rx/0"), "rx");
        assert_eq!(algorithm_family("ghostrider"), "ghostrider");
    }

    #[test]
    fn test_launch_spec_points_at_config() {
        let install = Path::new("/opt/miners/xmrig");
        let rendered = XmrigBackend.render_config(&profile(), install).unwrap();
        let spec = XmrigBackend.launch_spec(install, &rendered);
        assert_eq!(
            spec.target,
            LaunchTarget::Executable(install.join("xmrig"))
        );
        assert_eq!(spec.args[0], "--config");
        assert_eq!(spec.args[1], "/opt/miners/xmrig/config.json");
        assert_eq!(spec.working_dir, install);
    }

    #[test]
    fn test_parse_speed_line() {
        let line = "[2024-05-01 10:00:00.123]  miner    speed 10s/60s/15m 2345.6 2340.1 n/a H/s max 2400.0 H/s";
        let sample = XmrigBackend.parse_log_line(line).unwrap();
        assert_eq!(sample.hashrate, Some(2345.6));
        assert_eq!(sample.accepted, None);
    }

    #[test]
    fn test_parse_speed_line_skips_missing_windows() {
        let line = "[2024-05-01 10:00:00.123]  miner    speed 10s/60s/15m n/a 1.5 n/a kH/s max n/a";
        let sample = XmrigBackend.parse_log_line(line).unwrap();
        assert_eq!(sample.hashrate, Some(1500.0));
    }

    #[test]
    fn test_parse_share_lines() {
        let accepted = "[2024-05-01 10:00:05.456]  cpu      accepted (3/1) diff 100001 (45 ms)";
        let sample = XmrigBackend.parse_log_line(accepted).unwrap();
        assert_eq!(sample.accepted, Some(3));
        assert_eq!(sample.rejected, Some(1));
        assert_eq!(sample.status, None);

        let rejected = r#"[2024-05-01 10:00:06.000]  cpu      rejected (3/2) diff 100001 "low difficulty share" (51 ms)"#;
        let sample = XmrigBackend.parse_log_line(rejected).unwrap();
        assert_eq!(sample.rejected, Some(2));
        assert_eq!(sample.status.as_deref(), Some("share rejected: low difficulty share"));
    }

    #[test]
    fn test_banners_and_blanks_are_ignored() {
        assert_eq!(XmrigBackend.parse_log_line(""), None);
        assert_eq!(
            XmrigBackend.parse_log_line(" * ABOUT        XMRig/6.21.0 gcc/13.2.1 (built for Linux x86-64, 64 bit)"),
            None
        );
        assert_eq!(
            XmrigBackend.parse_log_line("[2024-05-01 10:00:00.000]  randomx  init dataset algo rx/0 (4 threads) seed 5d2a..."),
            None
        );
    }

    #[test]
    fn test_parse_pool_connection_status() {
        let line = "[2024-05-01 10:00:01.000]  net      use pool pool.example:3333  10.0.0.1";
        let sample = XmrigBackend.parse_log_line(line).unwrap();
        assert_eq!(sample.status.as_deref(), Some("connected to pool.example:3333"));
    }
}
