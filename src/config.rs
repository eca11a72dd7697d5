use std::fs;
use std::path::{Path, PathBuf};

use itertools::iproduct;
use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::types::Time;
use crate::utils::app_config::AppConfig;
use crate::utils::prelude::*;

/// Everything a run needs, deserialized from the layered app config
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimConfig {
    pub output_dir: OutputDir,
    pub experiment: ExperimentConfig,
    pub dataset: DatasetConfig,
    pub topology: TopologyConfig,
    pub network: NetworkConfig,
    pub gateway: GatewayConfig,
    pub policy: PolicyConfig,
    pub until: EndCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCondition {
    NoEvents,
    Time(Time),
}

/// Which of the two placement strategies drives the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum StrategyKind {
    /// decide a node for the head of the queue
    Placement,
    /// decide both the task and the node
    SchedulingAndPlacement,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// used as a prefix of the setup name sent to the decision service
    pub name: String,
    pub strategy: StrategyKind,
    pub episodes: usize,
    pub random_seeds: Vec<u64>,
    /// only tasks allowed by their job's co-scheduling rules are offered to the policy
    #[serde(default = "default_true")]
    pub respect_job_constraints: bool,
    /// dataset directories to sweep over, `dataset.path` when empty
    #[serde(default)]
    pub datasets: Vec<PathBuf>,
    /// fog node counts to sweep over, `topology.fog_nodes` when empty
    #[serde(default)]
    pub fog_nodes: Vec<usize>,
    /// strategy pairs to sweep over, `strategy` with `policy.strategy` when empty
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

/// A placement kind together with the service-side strategy driving it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    pub policy: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetConfig {
    /// directory holding `Jobs.csv` and `Tasks.csv`
    pub path: PathBuf,
    #[serde(default = "default_runtime_scale")]
    pub runtime_scale: f64,
}

/// `[mips, ram, storage, busy power, idle power]` of a device kind
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeFeatures {
    pub mips: f64,
    #[serde(default)]
    pub host_mips: Option<f64>,
    pub ram: f64,
    pub storage: f64,
    pub busy_power: f64,
    pub idle_power: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopologyConfig {
    /// seeds the draw of fog nodes from the catalogue
    pub seed: String,
    pub cloud_nodes: usize,
    pub cloud: NodeFeatures,
    pub fog_nodes: usize,
    pub fog_catalogue: Vec<NodeFeatures>,
    pub gateway: NodeFeatures,
}

/// Latencies in seconds, bandwidths in Mb/s
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub fog_latency: f64,
    pub fog_upload_bandwidth: f64,
    pub fog_download_bandwidth: f64,
    pub cloud_latency: f64,
    pub cloud_upload_bandwidth: f64,
    pub cloud_download_bandwidth: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// MIPS of the machine actually running the decision service
    pub real_mips: f64,
    /// charge the decision service's compute time as simulated time
    pub charge_compute_time: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    pub address: String,
    /// strategy name understood by the decision service, e.g. `TP_FIFO` or `TSP_DRL`
    pub strategy: String,
    pub max_attempts: u32,
    /// upper bound of a single attempt, a silent service counts as a failed attempt after it
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    pub framing: Framing,
    pub priorities_quantity: u8,
    #[serde(default)]
    pub drl: DrlFlags,
}

/// How the decision service frames its responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum Framing {
    /// 2-byte big-endian length, then UTF-8
    LengthPrefixed,
    /// newline terminated
    Line,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DrlFlags {
    pub load_pretrained_model: Option<bool>,
    pub training: Option<bool>,
    pub save_final_model: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_runtime_scale() -> f64 {
    1.0
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputDir(PathBuf);

impl OutputDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Path of `name` inside the output dir, creating the dir on first use
    pub fn file(&self, name: impl AsRef<Path>) -> Result<PathBuf> {
        fs::create_dir_all(&self.0)?;
        Ok(self.0.join(name))
    }
}

impl SimConfig {
    /// One concrete config per point of the sweep, in dataset, fog node count, strategy order.
    ///
    /// Every returned config has its single-valued fields set to the point.
    pub fn setups(&self) -> Vec<SimConfig> {
        let exp = &self.experiment;
        let datasets = axis(&exp.datasets, &self.dataset.path);
        let fog_nodes = axis(&exp.fog_nodes, &self.topology.fog_nodes);
        let strategies = axis(
            &exp.strategies,
            &StrategyConfig {
                kind: exp.strategy,
                policy: self.policy.strategy.clone(),
            },
        );

        iproduct!(datasets, fog_nodes, strategies)
            .map(|(path, fog_nodes, strategy)| {
                let mut cfg = self.clone();
                cfg.dataset.path = path;
                cfg.topology.fog_nodes = fog_nodes;
                cfg.experiment.strategy = strategy.kind;
                cfg.policy.strategy = strategy.policy;
                cfg
            })
            .collect()
    }
}

fn axis<T: Clone>(values: &[T], fallback: &T) -> Vec<T> {
    if values.is_empty() {
        vec![fallback.clone()]
    } else {
        values.to_vec()
    }
}

pub trait AppConfigExt {
    fn sim_config(&self) -> Result<SimConfig>;
}

impl AppConfigExt for AppConfig {
    fn sim_config(&self) -> Result<SimConfig> {
        self.fetch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let out = OutputDir::new(tmp.path().join("nested/results"));
        let file = out.file("results.csv").unwrap();
        assert!(file.parent().unwrap().is_dir());
        assert!(file.ends_with("results.csv"));
    }

    #[test]
    fn attempts_are_always_bounded() {
        let cfg: PolicyConfig = serde_json::from_value(serde_json::json!({
            "address": "127.0.0.1:5000",
            "strategy": "TP_FIFO",
            "max_attempts": 30,
            "framing": "line",
            "priorities_quantity": 5,
        }))
        .unwrap();
        assert_eq!(cfg.attempt_timeout_ms, 30_000);
    }

    fn sim_config() -> SimConfig {
        let mut app = AppConfig::new();
        app.setup().unwrap();
        app.fetch().unwrap()
    }

    #[test]
    fn single_setup_without_sweep() {
        let cfg = sim_config();
        let setups = cfg.setups();
        assert_eq!(setups.len(), 1);
        assert_eq!(setups[0].dataset.path, cfg.dataset.path);
        assert_eq!(setups[0].topology.fog_nodes, cfg.topology.fog_nodes);
        assert_eq!(setups[0].policy.strategy, cfg.policy.strategy);
    }

    #[test]
    fn sweep_order() {
        let mut cfg = sim_config();
        cfg.experiment.datasets = vec!["a".into(), "b".into()];
        cfg.experiment.fog_nodes = vec![5, 10];
        cfg.experiment.strategies = vec![
            StrategyConfig {
                kind: StrategyKind::Placement,
                policy: "TP_FIFO".into(),
            },
            StrategyConfig {
                kind: StrategyKind::SchedulingAndPlacement,
                policy: "TSP_DRL".into(),
            },
        ];

        let points: Vec<_> = cfg
            .setups()
            .into_iter()
            .map(|c| (c.dataset.path, c.topology.fog_nodes, c.experiment.strategy, c.policy.strategy))
            .collect();
        assert_eq!(points.len(), 8);
        assert_eq!(
            points[0],
            (PathBuf::from("a"), 5, StrategyKind::Placement, "TP_FIFO".to_owned())
        );
        assert_eq!(
            points[3],
            (PathBuf::from("a"), 10, StrategyKind::SchedulingAndPlacement, "TSP_DRL".to_owned())
        );
        assert_eq!(points[4].0, PathBuf::from("b"));
    }

    #[test]
    fn strategy_names() {
        assert_eq!(StrategyKind::SchedulingAndPlacement.to_string(), "scheduling_and_placement");
        assert_eq!(Framing::LengthPrefixed.to_string(), "length_prefixed");
    }
}
