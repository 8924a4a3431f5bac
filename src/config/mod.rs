//! Configuration management for tunnelgate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::netif::TunConfig;

/// Smallest MTU every IPv4 host must accept.
const MIN_MTU: u16 = 576;

/// IPv4 + TCP header bytes without options.
const TCP_IP_OVERHEAD: u16 = 40;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Packet-routing engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// TUN driver configuration.
    #[serde(default)]
    pub tun: TunConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.tun.mtu < MIN_MTU {
            return Err(Error::InvalidConfig(format!(
                "TUN MTU {} below minimum {MIN_MTU}",
                self.tun.mtu
            )));
        }

        Ok(())
    }
}

/// Packet-routing engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// MTU of the virtual interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Depth of the queue used by push-based interface drivers.
    #[serde(default = "default_packet_queue")]
    pub packet_queue: usize,

    /// Drop inbound segments whose transport checksum does not verify.
    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,

    /// TCP handler settings.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP handler settings.
    #[serde(default)]
    pub udp: UdpConfig,

    /// Memory pool limits.
    #[serde(default)]
    pub pools: PoolConfig,
}

fn default_mtu() -> u16 {
    1500
}
fn default_packet_queue() -> usize {
    1024
}
fn default_verify_checksums() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            packet_queue: default_packet_queue(),
            verify_checksums: default_verify_checksums(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            pools: PoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate engine settings.
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU {
            return Err(Error::InvalidConfig(format!(
                "MTU {} below minimum {MIN_MTU}",
                self.mtu
            )));
        }
        if self.tcp.mss == 0 || self.tcp.mss > self.mtu - TCP_IP_OVERHEAD {
            return Err(Error::InvalidConfig(format!(
                "TCP MSS {} does not fit MTU {}",
                self.tcp.mss, self.mtu
            )));
        }
        if self.tcp.window == 0 {
            return Err(Error::InvalidConfig("TCP window must be non-zero".into()));
        }
        if self.packet_queue == 0 {
            return Err(Error::InvalidConfig("packet queue must be non-zero".into()));
        }
        if self.udp.idle_timeout.is_zero() {
            return Err(Error::InvalidConfig("UDP idle timeout must be non-zero".into()));
        }
        if self.pools.tcp_pcbs == 0 || self.pools.udp_pcbs == 0 || self.pools.pbufs == 0 {
            return Err(Error::InvalidConfig("pool sizes must be non-zero".into()));
        }
        Ok(())
    }
}

/// TCP handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Maximum segment size advertised to clients.
    #[serde(default = "default_mss")]
    pub mss: u16,

    /// Receive window in bytes.
    #[serde(default = "default_window")]
    pub window: u16,

    /// Per-connection send buffer for backend writes.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    /// Initial retransmission timeout.
    #[serde(default = "default_rto", with = "humantime_serde")]
    pub rto: Duration,

    /// Retransmission timeout ceiling.
    #[serde(default = "default_max_rto", with = "humantime_serde")]
    pub max_rto: Duration,

    /// Retransmissions before the connection is aborted.
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,

    /// Time spent in TIME_WAIT.
    #[serde(default = "default_time_wait", with = "humantime_serde")]
    pub time_wait: Duration,

    /// Stack timer period while TCP connections exist.
    #[serde(default = "default_timer_interval", with = "humantime_serde")]
    pub timer_interval: Duration,
}

fn default_mss() -> u16 {
    1460
}
fn default_window() -> u16 {
    u16::MAX
}
fn default_send_buffer() -> usize {
    256 * 1024
}
fn default_rto() -> Duration {
    Duration::from_secs(1)
}
fn default_max_rto() -> Duration {
    Duration::from_secs(60)
}
fn default_max_retransmits() -> u32 {
    8
}
fn default_time_wait() -> Duration {
    Duration::from_secs(2)
}
fn default_timer_interval() -> Duration {
    Duration::from_millis(250)
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: default_mss(),
            window: default_window(),
            send_buffer: default_send_buffer(),
            rto: default_rto(),
            max_rto: default_max_rto(),
            max_retransmits: default_max_retransmits(),
            time_wait: default_time_wait(),
            timer_interval: default_timer_interval(),
        }
    }
}

/// UDP handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Inactivity timeout for UDP flows.
    #[serde(default = "default_udp_idle", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Datagrams buffered per flow while the dial is pending.
    #[serde(default = "default_max_pending")]
    pub max_pending_datagrams: usize,
}

fn default_udp_idle() -> Duration {
    Duration::from_secs(30)
}
fn default_max_pending() -> usize {
    64
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_udp_idle(),
            max_pending_datagrams: default_max_pending(),
        }
    }
}

/// Memory pool limits of the embedded stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_tcp_pcbs")]
    pub tcp_pcbs: usize,

    #[serde(default = "default_udp_pcbs")]
    pub udp_pcbs: usize,

    #[serde(default = "default_pbufs")]
    pub pbufs: usize,
}

fn default_tcp_pcbs() -> usize {
    1024
}
fn default_udp_pcbs() -> usize {
    512
}
fn default_pbufs() -> usize {
    4096
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tcp_pcbs: default_tcp_pcbs(),
            udp_pcbs: default_udp_pcbs(),
            pbufs: default_pbufs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path.
    pub file: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let file = match &config.file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("Failed to open log file: {e}")))?,
        ),
        None => None,
    };

    match (config.format.as_str(), file) {
        ("json", Some(file)) => subscriber
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .try_init(),
        ("json", None) => subscriber.with(fmt::layer().json()).try_init(),
        (_, Some(file)) => subscriber
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .try_init(),
        (_, None) => subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init(),
    }
    .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.udp.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.tcp.timer_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            mtu = 1400

            [engine.tcp]
            mss = 1360
            time_wait = "500ms"

            [engine.udp]
            idle_timeout = "2m"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.mtu, 1400);
        assert_eq!(config.engine.tcp.mss, 1360);
        assert_eq!(config.engine.tcp.time_wait, Duration::from_millis(500));
        assert_eq!(config.engine.udp.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.engine.pools.tcp_pcbs, 1024);
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_mss() {
        let mut config = EngineConfig::default();
        config.tcp.mss = 1480;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = EngineConfig::default();
        config.pools.udp_pcbs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnelgate.toml");

        let mut config = Config::default();
        config.engine.udp.max_pending_datagrams = 8;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.engine.udp.max_pending_datagrams, 8);
        assert_eq!(loaded.tun.name, config.tun.name);
    }
}
