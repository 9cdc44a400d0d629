use std::{env, path::PathBuf, time::Duration};

use crate::error::{BridgeError, Result};

const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 20_000;
const VERIFY_TIMEOUT_FACTOR: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Android,
    Ios,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::Android
        } else {
            Self::Ios
        }
    }

    /// Purchase `type` the backend expects for receipts from this store.
    pub fn purchase_type(self) -> &'static str {
        match self {
            Self::Android => "PlayStorePurchase",
            Self::Ios => "AppStorePurchase",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "android" => Some(Self::Android),
            "ios" => Some(Self::Ios),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub vendor_id: String,
    pub app_id: String,
    pub is_test_mode: bool,
    pub asset_root: PathBuf,
    pub bind_host: String,
    pub network_timeout: Duration,
    pub disable_transitions: bool,
    pub platform: HostPlatform,
}

impl BridgeConfig {
    pub fn new(vendor_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            app_id: app_id.into(),
            is_test_mode: true,
            asset_root: PathBuf::from("www"),
            bind_host: "127.0.0.1".to_string(),
            network_timeout: Duration::from_millis(DEFAULT_NETWORK_TIMEOUT_MS),
            disable_transitions: false,
            platform: HostPlatform::current(),
        }
    }

    pub fn from_env() -> Self {
        let vendor_id = read_trimmed_env("REWARDS_VENDOR_ID").unwrap_or_default();
        let app_id = read_trimmed_env("REWARDS_APP_ID").unwrap_or_default();

        let is_test_mode = env::var("REWARDS_TEST_MODE")
            .map(|v| !v.trim().eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let asset_root = read_trimmed_env("REWARDS_ASSET_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("www"));

        let bind_host =
            read_trimmed_env("REWARDS_BIND_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let network_timeout = env::var("REWARDS_NETWORK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_NETWORK_TIMEOUT_MS);

        let platform = read_trimmed_env("REWARDS_PLATFORM")
            .and_then(|raw| HostPlatform::parse(&raw))
            .unwrap_or_else(HostPlatform::current);

        Self {
            vendor_id,
            app_id,
            is_test_mode,
            asset_root,
            bind_host,
            network_timeout: Duration::from_millis(network_timeout),
            disable_transitions: parse_bool_env("REWARDS_DISABLE_TRANSITIONS"),
            platform,
        }
    }

    pub fn with_test_mode(mut self, is_test_mode: bool) -> Self {
        self.is_test_mode = is_test_mode;
        self
    }

    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = root.into();
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_disable_transitions(mut self, disable: bool) -> Self {
        self.disable_transitions = disable;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.vendor_id.trim().is_empty() {
            return Err(BridgeError::missing("vendor id"));
        }
        if self.app_id.trim().is_empty() {
            return Err(BridgeError::missing("app id"));
        }
        Ok(())
    }

    pub fn verify_timeout(&self) -> Duration {
        self.network_timeout * VERIFY_TIMEOUT_FACTOR
    }
}

fn read_trimmed_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
