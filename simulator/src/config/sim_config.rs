use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    error::SimulationError,
    monitoring::DEFAULT_MONITORING_INTERVAL,
    pool::{simple::PoolOptions, simple::PowerModel, HostSpec, VirtualImage},
    timer::Time,
};

fn default_units() -> f64 {
    64.
}

fn default_processing_power() -> f64 {
    0.001
}

fn default_host_memory() -> u64 {
    256_000_000_000
}

fn default_boot_time() -> Time {
    89_000
}

fn default_allocation_memory() -> u64 {
    512 * 1024 * 1024
}

fn default_interval() -> Time {
    DEFAULT_MONITORING_INTERVAL
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bytes per tick.
    pub bandwidth: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bandwidth: 1_250_000.,
        }
    }
}

/// Group of identical pools; `count` replicates the group with indexed names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolGroupConfig {
    pub name: String,
    pub count: Option<u32>,
    pub hosts: u32,
    #[serde(default = "default_units")]
    pub units: f64,
    #[serde(default = "default_processing_power")]
    pub processing_power: f64,
    #[serde(default = "default_host_memory")]
    pub memory: u64,
    #[serde(default = "default_boot_time")]
    pub boot_time: Time,
    #[serde(default)]
    pub power: PowerModel,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub name: String,
    pub hosts: Vec<HostSpec>,
    pub options: PoolOptions,
}

impl PoolConfig {
    pub fn from_group_config(group: &PoolGroupConfig, index: Option<u32>) -> Self {
        let name = match index {
            Some(index) => format!("{}-{}", group.name, index),
            None => group.name.clone(),
        };
        let host = HostSpec {
            units: group.units,
            processing_power: group.processing_power,
            memory: group.memory,
        };
        Self {
            name,
            hosts: vec![host; group.hosts as usize],
            options: PoolOptions {
                boot_time: group.boot_time,
                power: group.power,
                storage_bandwidth: group.storage.bandwidth,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub image: VirtualImage,
    #[serde(default = "default_allocation_memory")]
    pub memory: u64,
    /// Per-unit processing power asked for; defaults to the weakest host's.
    pub processing_power: Option<f64>,
    #[serde(default)]
    pub minimum_power: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            image: VirtualImage::default(),
            memory: default_allocation_memory(),
            processing_power: None,
            minimum_power: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_interval")]
    pub interval: Time,
    pub output: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_MONITORING_INTERVAL,
            output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomTraceConfig {
    pub jobs: usize,
    /// Jobs existing in parallel within one batch.
    pub parallel: usize,
    /// Seconds over which submissions of one batch are spread.
    pub max_start_spread: u64,
    pub exec_min: u64,
    pub exec_max: u64,
    pub min_gap: u64,
    pub max_gap: u64,
    pub min_units: u32,
    pub max_units: u32,
    /// Units usable by all jobs of a batch together.
    pub max_total_units: u32,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    pub path: Option<String>,
    pub random: Option<RandomTraceConfig>,
    pub from: Option<usize>,
    pub to: Option<usize>,
    /// Keeps only jobs running at this instant (seconds) in the recorded trace.
    pub running_at: Option<u64>,
    pub ignore_list: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub pools: Vec<PoolGroupConfig>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    pub monitoring: Option<MonitoringConfig>,
    #[serde(default)]
    pub trace: TraceConfig,
    /// Instant (ticks) after which no further jobs are dispatched.
    pub time_limit: Option<Time>,
}

impl SimulationConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SimulationError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_str(&data)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(data: &str) -> Result<Self, SimulationError> {
        let config: SimulationConfig = serde_yaml::from_str(data)?;
        if config.monitoring.as_ref().is_some_and(|m| m.interval == 0) {
            return Err(SimulationError::InvalidConfig(
                "monitoring interval must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    /// Every pool of every group, in declaration order.
    pub fn pool_configs(&self) -> Vec<PoolConfig> {
        let mut pools = Vec::new();
        for group in self.pools.iter() {
            match group.count {
                None | Some(1) => pools.push(PoolConfig::from_group_config(group, None)),
                Some(count) => {
                    for i in 0..count {
                        pools.push(PoolConfig::from_group_config(group, Some(i)));
                    }
                }
            }
        }
        pools
    }

    /// Where the monitoring report goes: the configured output, or the trace
    /// path with a `.converted` suffix.
    pub fn report_path(&self) -> Option<String> {
        let monitoring = self.monitoring.as_ref()?;
        if let Some(output) = &monitoring.output {
            return Some(output.clone());
        }
        Some(match &self.trace.path {
            Some(path) => format!("{}.converted", path),
            None => "random-trace.converted".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = SimulationConfig::from_str(
            "
pools:
  - name: cloud
    count: 2
    hosts: 3
monitoring:
  output: report.csv
trace:
  path: trace.csv
",
        )
        .unwrap();

        let pools = config.pool_configs();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name, "cloud-0");
        assert_eq!(pools[1].hosts.len(), 3);
        assert_eq!(pools[1].hosts[0].units, 64.);
        assert_eq!(pools[0].options, PoolOptions::default());
        assert_eq!(config.dispatcher, DispatcherConfig::default());
        assert_eq!(config.monitoring.as_ref().unwrap().interval, 300_000);
        assert_eq!(config.report_path().as_deref(), Some("report.csv"));
        assert_eq!(config.time_limit, None);
    }

    #[test]
    fn test_report_path_follows_trace() {
        let mut config = SimulationConfig::from_str("pools: []\nmonitoring: {}\ntrace: {path: jobs.csv}\n").unwrap();
        assert_eq!(config.report_path().as_deref(), Some("jobs.csv.converted"));
        config.monitoring = None;
        assert_eq!(config.report_path(), None);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(matches!(
            SimulationConfig::from_str("pools: 12"),
            Err(SimulationError::Config(_))
        ));
    }

    #[test]
    fn test_zero_monitoring_interval_is_rejected() {
        assert!(matches!(
            SimulationConfig::from_str("pools: []\nmonitoring: {interval: 0}\n"),
            Err(SimulationError::InvalidConfig(_))
        ));
        assert!(SimulationConfig::from_str("pools: []\nmonitoring: {interval: 1}\n").is_ok());
    }
}
