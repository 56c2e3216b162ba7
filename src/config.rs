use std::env;
use std::net::{IpAddr, Ipv4Addr};

use crate::bx::pool::{MAX_SUBMISSIONS_PER_WINDOW, MIN_POOL_SIZE, SUBMISSION_WINDOW_SECS};

pub const DEFAULT_PORT: u16 = 7272;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub port: u16,
    pub bind_ip: IpAddr,
    pub coordinator: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            coordinator: format!("127.0.0.1:{}", DEFAULT_PORT),
        }
    }
}

impl NetworkConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = env::var("BLIX_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.port = port;
            }
        }

        if let Ok(bind_ip) = env::var("BLIX_BIND_IP") {
            if let Ok(ip) = bind_ip.parse::<IpAddr>() {
                config.bind_ip = ip;
            }
        }

        if let Ok(coordinator) = env::var("BLIX_COORDINATOR") {
            if !coordinator.trim().is_empty() {
                config.coordinator = coordinator.trim().to_string();
            }
        }

        config
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_pool_size: usize,
    pub submission_window_secs: u64,
    pub submissions_per_window: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: MIN_POOL_SIZE,
            submission_window_secs: SUBMISSION_WINDOW_SECS,
            submissions_per_window: MAX_SUBMISSIONS_PER_WINDOW,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(size) = env::var("BLIX_MIN_POOL_SIZE") {
            if let Ok(size) = size.parse::<usize>() {
                config.min_pool_size = size.max(1);
            }
        }

        if let Ok(window) = env::var("BLIX_SUBMISSION_WINDOW_SECS") {
            if let Ok(window) = window.parse::<u64>() {
                config.submission_window_secs = window.max(1);
            }
        }

        if let Ok(limit) = env::var("BLIX_SUBMISSIONS_PER_WINDOW") {
            if let Ok(limit) = limit.parse::<usize>() {
                config.submissions_per_window = limit.max(1);
            }
        }

        config
    }
}

#[derive(Debug, Clone)]
pub struct MiningConfig {
    pub lanes: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            lanes: num_cpus::get(),
        }
    }
}

impl MiningConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(lanes) = env::var("BLIX_MINING_LANES") {
            if let Ok(lanes) = lanes.parse::<usize>() {
                config.lanes = if lanes == 0 { num_cpus::get() } else { lanes };
            }
        }

        config
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub pool: PoolConfig,
    pub mining: MiningConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            network: NetworkConfig::from_env(),
            pool: PoolConfig::from_env(),
            mining: MiningConfig::from_env(),
        }
    }

    pub fn log_config(&self) {
        log::info!(
            "blix port={} bind={} coordinator={} min_pool={} lanes={}",
            self.network.port,
            self.network.bind_ip,
            self.network.coordinator,
            self.pool.min_pool_size,
            self.mining.lanes
        );
    }
}
