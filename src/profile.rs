//! Unified mining profile supplied by the host application.
//!
//! The profile is backend-agnostic; each backend renders it into its own
//! configuration format. Wallet addresses are treated as opaque strings and
//! only checked against known placeholder values.

use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

pub const DEFAULT_POOL: &str = "pool.supportxmr.com:3333";
pub const DEFAULT_WORKER: &str = "crypto_adventure_worker";
pub const DEFAULT_ALGORITHM: &str = "randomx";
pub const DEFAULT_MAX_CPU_USAGE: u8 = 75;

/// Stand-in values shipped in templates that must never reach a live worker.
pub const PLACEHOLDER_SENTINELS: &[&str] = &[
    "YOUR_WALLET_ADDRESS",
    "YOUR_WALLET_ADDRESS_HERE",
    "set your wallet here",
    "NOT_SET",
    "YOUR_POOL_URL",
    "pool.example.invalid:0",
];

/// Returns true when `value` is one of the known placeholder sentinels.
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    PLACEHOLDER_SENTINELS
        .iter()
        .any(|sentinel| sentinel.eq_ignore_ascii_case(value))
}

/// Mining parameters shared by every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningProfile {
    /// Pool address as `host:port`, optionally prefixed with a scheme
    pub pool: String,
    pub wallet: String,
    /// Worker / rig name reported to the pool
    pub worker: String,
    pub algorithm: String,
    /// Number of CPU threads (0 = auto-detect)
    pub threads: usize,
    /// Upper bound on CPU usage in percent
    pub max_cpu_usage: u8,
}

impl Default for MiningProfile {
    fn default() -> Self {
        Self {
            pool: DEFAULT_POOL.to_string(),
            wallet: PLACEHOLDER_SENTINELS[1].to_string(),
            worker: DEFAULT_WORKER.to_string(),
            algorithm: DEFAULT_ALGORITHM.to_string(),
            threads: 0,
            max_cpu_usage: DEFAULT_MAX_CPU_USAGE,
        }
    }
}

impl MiningProfile {
    pub fn new(pool: impl Into<String>, wallet: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            wallet: wallet.into(),
            worker: worker.into(),
            ..Default::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_cpu_usage(mut self, percent: u8) -> Self {
        self.max_cpu_usage = percent;
        self
    }

    /// Thread count with `0` resolved to the number of logical CPUs
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    /// Wallet shortened to `first8...last8` for banners and logs
    pub fn masked_wallet(&self) -> String {
        mask_wallet(&self.wallet)
    }

    /// Rejects profiles that would start a misconfigured worker.
    pub fn validate(&self) -> SessionResult<()> {
        for (field, value) in [
            ("pool", &self.pool),
            ("wallet", &self.wallet),
            ("worker", &self.worker),
            ("algorithm", &self.algorithm),
        ] {
            if value.trim().is_empty() {
                return Err(SessionError::configuration(field, "must not be empty"));
            }
            if value.chars().any(|c| c.is_control() || c == '"') {
                return Err(SessionError::configuration(
                    field,
                    "must not contain quotes or control characters",
                ));
            }
        }

        for (field, value) in [("wallet", &self.wallet), ("pool", &self.pool)] {
            if is_placeholder(value) {
                return Err(SessionError::configuration(
                    field,
                    format!("'{}' is a placeholder, set a real value", value.trim()),
                ));
            }
        }

        validate_pool_address(&self.pool)?;

        if self.max_cpu_usage == 0 || self.max_cpu_usage > 100 {
            return Err(SessionError::configuration(
                "max_cpu_usage",
                format!("{} is outside 1..=100", self.max_cpu_usage),
            ));
        }

        Ok(())
    }
}

/// Shorten a wallet address to `first8...last8`; short values pass through
pub fn mask_wallet(wallet: &str) -> String {
    let chars: Vec<char> = wallet.chars().collect();
    if chars.len() <= 16 {
        return wallet.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{}...{}", head, tail)
}

fn validate_pool_address(pool: &str) -> SessionResult<()> {
    let address = pool
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(pool)
        .trim();

    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(SessionError::configuration("pool", "expected host:port"));
    };

    if host.is_empty() {
        return Err(SessionError::configuration("pool", "host is empty"));
    }

    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(SessionError::configuration(
            "pool",
            format!("invalid port '{}'", port),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn valid_profile() -> MiningProfile {
        MiningProfile::new("pool.example:3333", "4AbcWallet", "w1")
            .with_algorithm("randomx")
            .with_threads(4)
    }

    #[test]
    fn test_valid_profile_passes() {
        assert!(valid_profile().validate().is_ok());
    }

    #[test]
    fn test_default_profile_is_rejected() {
        let err = MiningProfile::default().validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("wallet"));
    }

    #[test]
    fn test_empty_wallet_and_pool_rejected() {
        let mut profile = valid_profile();
        profile.wallet = "  ".to_string();
        assert!(profile.validate().is_err());

        let mut profile = valid_profile();
        profile.pool.clear();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_placeholder_detection_is_case_insensitive() {
        assert!(is_placeholder("your_wallet_address_here"));
        assert!(is_placeholder(" Set Your Wallet Here "));
        assert!(!is_placeholder("4AbcWallet"));
    }

    #[test]
    fn test_pool_address_forms() {
        assert!(validate_pool_address("pool.example:3333").is_ok());
        assert!(validate_pool_address("stratum+tcp://pool.example:443").is_ok());
        assert!(validate_pool_address("pool.example").is_err());
        assert!(validate_pool_address(":3333").is_err());
        assert!(validate_pool_address("pool.example:0").is_err());
        assert!(validate_pool_address("pool.example:http").is_err());
    }

    #[test]
    fn test_cpu_cap_bounds() {
        assert!(valid_profile().with_max_cpu_usage(0).validate().is_err());
        assert!(valid_profile().with_max_cpu_usage(101).validate().is_err());
        assert!(valid_profile().with_max_cpu_usage(100).validate().is_ok());
    }

    #[test]
    fn test_control_characters_rejected() {
        let mut profile = valid_profile();
        profile.worker = "w1\nwallet = other".to_string();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_effective_threads() {
        assert_eq!(valid_profile().effective_threads(), 4);
        assert_eq!(valid_profile().with_threads(0).effective_threads(), num_cpus::get());
    }

    #[test]
    fn test_masked_wallet() {
        let profile = MiningProfile::new("p:1", "4BGrZRkV7jgetvovXr67st34LM8qf1rF", "w");
        assert_eq!(profile.masked_wallet(), "4BGrZRkV...LM8qf1rF");
        assert_eq!(valid_profile().masked_wallet(), "4AbcWallet");
    }
}
