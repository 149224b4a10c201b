//! Scenario Configuration
//!
//! One UE, its primary cell and two secondary cells, the behaviour of each
//! simulated radio leg, and the traffic to push through the bearer. Loaded
//! from YAML, or from TOML when the file name ends in `.toml`.

use common::types::{CellId, Earfcn, Rnti};
use layers::nas::{EpsBearer, NasConfig, TrafficFlowTemplate};
use layers::pdcp::PdcpConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level scenario
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioConfig {
    /// NAS settings
    #[serde(default)]
    pub nas: NasConfig,
    /// PDCP settings of the data bearer
    #[serde(default)]
    pub pdcp: PdcpConfig,
    /// Primary leg
    pub primary: LegConfig,
    /// First secondary leg
    pub first_secondary: LegConfig,
    /// Second secondary leg
    pub second_secondary: LegConfig,
    /// Bearers requested before attach
    #[serde(default = "default_bearers")]
    pub bearers: Vec<BearerConfig>,
    /// Traffic profile
    #[serde(default)]
    pub traffic: TrafficConfig,
    /// Simulated time to run, in ms
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Throughput sampling period, in ms
    #[serde(default = "default_stats_period_ms")]
    pub stats_period_ms: u64,
    /// RNG seed for leg delay and loss
    #[serde(default)]
    pub seed: u64,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

fn default_duration_ms() -> u64 {
    5000
}

fn default_stats_period_ms() -> u64 {
    100
}

fn default_bearers() -> Vec<BearerConfig> {
    vec![BearerConfig::default()]
}

/// One simulated radio leg
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LegConfig {
    /// Cell serving the leg
    pub cell_id: u16,
    /// Downlink carrier
    pub earfcn: u32,
    /// RNTI handed out on connection
    pub rnti: u16,
    /// Time from connect request to outcome, in ms
    #[serde(default = "default_connect_latency_ms")]
    pub connect_latency_ms: u64,
    /// Connection attempts that fail before one succeeds
    #[serde(default)]
    pub failed_connects: u32,
    /// Minimum one-way PDU delay, in ms
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Maximum one-way PDU delay, in ms
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Probability of losing a PDU
    #[serde(default)]
    pub loss_probability: f64,
}

fn default_connect_latency_ms() -> u64 {
    20
}

fn default_min_delay_ms() -> u64 {
    5
}

fn default_max_delay_ms() -> u64 {
    15
}

impl LegConfig {
    pub fn cell(&self) -> CellId {
        CellId(self.cell_id)
    }

    pub fn earfcn(&self) -> Earfcn {
        Earfcn(self.earfcn)
    }

    pub fn rnti(&self) -> Rnti {
        Rnti::new(self.rnti)
    }
}

/// Bearer to activate on attach
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BearerConfig {
    #[serde(default)]
    pub bearer: EpsBearer,
    /// Packet filters; empty means match everything
    #[serde(default)]
    pub tft: TrafficFlowTemplate,
}

impl BearerConfig {
    pub fn template(&self) -> TrafficFlowTemplate {
        if self.tft.filters.is_empty() {
            TrafficFlowTemplate::match_all()
        } else {
            self.tft.clone()
        }
    }
}

/// Downlink/uplink traffic pushed once the UE is dual connected
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Downlink packets to send
    pub packets: u32,
    /// Gap between packets, in ms
    pub interval_ms: u64,
    /// Payload size in bytes
    pub packet_size: usize,
    /// Share of downlink PDUs sent over secondary legs
    pub secondary_share: f64,
    /// Send one uplink packet per downlink packet
    pub uplink: bool,
    /// Uplink destination port, used for TFT matching
    pub uplink_port: u16,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            packets: 1000,
            interval_ms: 1,
            packet_size: 1200,
            secondary_share: 0.5,
            uplink: true,
            uplink_port: 9,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// All layers log level
    #[serde(default = "default_log_level")]
    pub all_level: String,
    /// PDCP layer log level
    #[serde(default = "default_log_level")]
    pub pdcp_level: String,
    /// NAS layer log level
    #[serde(default = "default_log_level")]
    pub nas_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            all_level: default_log_level(),
            pdcp_level: default_log_level(),
            nas_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LogConfig {
    /// `EnvFilter` directives for the configured levels
    pub fn directives(&self) -> String {
        format!(
            "{},layers::pdcp={},layers::nas={}",
            self.all_level, self.pdcp_level, self.nas_level
        )
    }
}

impl ScenarioConfig {
    /// Load a scenario from YAML, or TOML for `.toml` files
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let is_toml = path.extension().map_or(false, |ext| ext == "toml");
        let config = if is_toml {
            Self::from_toml_str(&contents)?
        } else {
            Self::from_yaml_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reject scenarios the simulation cannot run
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, leg) in self.legs() {
            if !leg.cell().is_valid() {
                return Err(anyhow::anyhow!("Invalid cell id 0 on {} leg", name));
            }
            if leg.min_delay_ms > leg.max_delay_ms {
                return Err(anyhow::anyhow!(
                    "{} leg: min_delay_ms {} exceeds max_delay_ms {}",
                    name,
                    leg.min_delay_ms,
                    leg.max_delay_ms
                ));
            }
            if !(0.0..=1.0).contains(&leg.loss_probability) {
                return Err(anyhow::anyhow!(
                    "{} leg: loss_probability {} outside [0, 1]",
                    name,
                    leg.loss_probability
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.traffic.secondary_share) {
            return Err(anyhow::anyhow!(
                "secondary_share {} outside [0, 1]",
                self.traffic.secondary_share
            ));
        }
        if self.stats_period_ms == 0 || self.traffic.interval_ms == 0 {
            return Err(anyhow::anyhow!("stats_period_ms and interval_ms must be non-zero"));
        }
        Ok(())
    }

    fn legs(&self) -> [(&'static str, &LegConfig); 3] {
        [
            ("primary", &self.primary),
            ("first secondary", &self.first_secondary),
            ("second secondary", &self.second_secondary),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
nas:
  imsi: 1010123456789
  retry:
    max_attempts: 4
    backoff_ms: 10
pdcp:
  sn_size: 12
  t_reordering: 50
primary:
  cell_id: 1
  earfcn: 100
  rnti: 17
first_secondary:
  cell_id: 2
  earfcn: 2750
  rnti: 18
  loss_probability: 0.01
second_secondary:
  cell_id: 3
  earfcn: 2750
  rnti: 19
traffic:
  packets: 200
log:
  pdcp_level: debug
"#;

    #[test]
    fn test_parse_yaml() {
        let config = ScenarioConfig::from_yaml_str(YAML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.nas.imsi.0, 1010123456789);
        assert_eq!(config.nas.max_bearers, 11);
        assert_eq!(config.nas.retry.max_attempts, Some(4));
        assert_eq!(config.pdcp.sn_size, 12);
        assert!(config.pdcp.enable_reordering);
        assert_eq!(config.first_secondary.cell(), CellId(2));
        assert_eq!(config.primary.connect_latency_ms, 20);
        assert_eq!(config.traffic.packets, 200);
        assert_eq!(config.traffic.interval_ms, 1);
        assert_eq!(config.bearers.len(), 1);
        assert_eq!(config.log.directives(), "info,layers::pdcp=debug,layers::nas=info");
    }

    #[test]
    fn test_parse_toml() {
        let config = ScenarioConfig::from_toml_str(
            r#"
seed = 7
duration_ms = 1000

[primary]
cell_id = 1
earfcn = 100
rnti = 17

[first_secondary]
cell_id = 2
earfcn = 2750
rnti = 18

[second_secondary]
cell_id = 3
earfcn = 2750
rnti = 19
max_delay_ms = 40
"#,
        )
        .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.second_secondary.max_delay_ms, 40);
        assert_eq!(config.pdcp.t_reordering, 100);
    }

    #[test]
    fn test_validate_rejects_bad_leg() {
        let mut config = ScenarioConfig::from_yaml_str(YAML).unwrap();
        config.first_secondary.min_delay_ms = 50;
        assert!(config.validate().is_err());

        let mut config = ScenarioConfig::from_yaml_str(YAML).unwrap();
        config.second_secondary.loss_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_tft_matches_all() {
        let bearer = BearerConfig::default();
        assert_eq!(bearer.template(), TrafficFlowTemplate::match_all());
    }
}
