use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub const MAX_DURATION_SECS: u64 = 3600;
pub const MAX_BANDWIDTH_MBPS: f64 = 10_000.0;
pub const MIN_PACKET_SIZE: usize = 64;
pub const MAX_PACKET_SIZE: usize = 9000;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    /// Initial "last configuration" used by `Start` until a client replaces it.
    pub defaults: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

/// Emission engine tunables. These apply to every run and are not part of
/// the per-run configuration a client can change.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub degraded_after_failures: u32,
    pub subscriber_buffer: usize,
    pub max_catch_up_ticks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            snapshot_interval_ms: 1000,
            degraded_after_failures: 64,
            subscriber_buffer: 256,
            max_catch_up_ticks: 5,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=1000).contains(&self.tick_interval_ms) {
            return Err(ValidationError::new(
                "tick_interval_ms",
                "must be between 1 and 1000",
            ));
        }
        if self.snapshot_interval_ms < self.tick_interval_ms {
            return Err(ValidationError::new(
                "snapshot_interval_ms",
                "must not be shorter than tick_interval_ms",
            ));
        }
        if self.degraded_after_failures == 0 {
            return Err(ValidationError::new(
                "degraded_after_failures",
                "must be positive",
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(ValidationError::new("subscriber_buffer", "must be positive"));
        }
        if self.max_catch_up_ticks == 0 {
            return Err(ValidationError::new("max_catch_up_ticks", "must be positive"));
        }
        Ok(())
    }
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    #[default]
    Bell,
    Constant,
    Random,
}

/// Parameters of a single run. Field names follow the JSON the web client
/// already speaks; snake_case aliases are accepted for hand-written TOML.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RunConfig {
    pub pattern: Pattern,
    #[serde(rename = "duration", alias = "duration_secs")]
    pub duration_secs: u64,
    #[serde(rename = "maxBandwidth", alias = "max_bandwidth_mbps")]
    pub max_bandwidth_mbps: f64,
    #[serde(rename = "targetIP", alias = "target_host")]
    pub target_host: String,
    // Wider than u16 so 70000 reaches validation instead of failing the parse.
    #[serde(alias = "target_port")]
    pub target_port: u32,
    #[serde(alias = "bell_peak_ratio")]
    pub bell_peak_ratio: f64,
    #[serde(rename = "packetSize", alias = "packet_size")]
    pub packet_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pattern: Pattern::Bell,
            duration_secs: 60,
            max_bandwidth_mbps: 100.0,
            target_host: "127.0.0.1".to_string(),
            target_port: 8080,
            bell_peak_ratio: 0.5,
            packet_size: 1400,
        }
    }
}

impl RunConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=MAX_DURATION_SECS).contains(&self.duration_secs) {
            return Err(ValidationError::new(
                "duration",
                format!("must be between 1 and {MAX_DURATION_SECS} seconds"),
            ));
        }
        let bw = self.max_bandwidth_mbps;
        if !bw.is_finite() || bw <= 0.0 || bw > MAX_BANDWIDTH_MBPS {
            return Err(ValidationError::new(
                "maxBandwidth",
                format!("must be greater than 0 and at most {MAX_BANDWIDTH_MBPS} Mbps"),
            ));
        }
        validate_host(&self.target_host)?;
        if !(1..=u32::from(u16::MAX)).contains(&self.target_port) {
            return Err(ValidationError::new(
                "targetPort",
                "must be between 1 and 65535",
            ));
        }
        let peak = self.bell_peak_ratio;
        if !peak.is_finite() || !(0.0..=1.0).contains(&peak) {
            return Err(ValidationError::new(
                "bellPeakRatio",
                "must be between 0 and 1",
            ));
        }
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(ValidationError::new(
                "packetSize",
                format!("must be between {MIN_PACKET_SIZE} and {MAX_PACKET_SIZE} bytes"),
            ));
        }
        Ok(())
    }
}

/// Accepts an IP literal or something shaped like a DNS name. Whether the
/// name actually resolves is only known when a run starts.
fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let name = host.strip_suffix('.').unwrap_or(host);
    let well_formed = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::new(
            "targetIP",
            "must be an IP address or a host name",
        ))
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(content)?;
        cfg.engine.validate()?;
        cfg.defaults.validate()?;
        Ok(cfg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ValidationError),
}

/// An out-of-range or malformed field, named the way clients spell it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
