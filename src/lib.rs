use std::fmt;
use std::time::Instant;

use itertools::Itertools;

use crate::config::{AppConfigExt, SimConfig};
use crate::dataset::Dataset;
use crate::gateway::Gateway;
use crate::metrics::RunSummary;
use crate::nodes::{NetworkModel, NodeKind, Topology};
use crate::output::{Report, RunInfo};
use crate::policy::{DecisionClient, DecisionCostModel, DecisionPolicy, Request, SetupPayload};
use crate::sim::{run_episode, SimulationContext};
use crate::strategies::Strategy;
use crate::utils::prelude::*;

pub mod config;
pub mod dataset;
pub mod gateway;
pub mod jobs;
pub mod metrics;
pub mod nodes;
pub mod output;
pub mod policy;
pub mod sim;
pub mod strategies;
pub mod types;
pub mod utils;

/// Run the configured experiment against the decision service
pub fn run_sim() -> Result<()> {
    let _g = info_span!("sim").entered();

    let cfg = config().sim_config()?;
    let mut client = DecisionClient::connect(&cfg.policy)?;

    for (info, summary) in run_experiment(&cfg, &mut client)? {
        info!(
            dataset = %info.dataset,
            fog_nodes = info.fog_nodes,
            placement = %info.placement,
            policy = %info.policy,
            seed = info.random_seed,
            episodes = summary.episodes,
            violations = ?summary.violations,
            avg_completion_time = summary.avg_completion_time,
            avg_reward = summary.avg_reward,
            avg_gateway_busy_time = summary.avg_gateway_busy_time,
            "seed done"
        );
    }
    Ok(())
}

/// The whole sweep: every dataset, fog node count and strategy pair, each with every seed.
/// All episodes land in one report.
pub fn run_experiment(cfg: &SimConfig, policy: &mut dyn DecisionPolicy) -> Result<Vec<(RunInfo, RunSummary)>> {
    let setups = cfg.setups();
    let mut report = Report::create(&cfg.output_dir)?;
    let mut summaries = vec![];

    for (idx, setup) in setups.iter().enumerate() {
        let _s = info_span!("setup", n = idx + 1, of = setups.len()).entered();
        info!(
            dataset = %setup.dataset.path.display(),
            fog_nodes = setup.topology.fog_nodes,
            placement = %setup.experiment.strategy,
            policy = %setup.policy.strategy,
            "starting setup"
        );

        let dataset = Dataset::load(&setup.dataset)?;
        let topology = Topology::from_config(&setup.topology)?;
        summaries.extend(run_setup(setup, &dataset, &topology, policy, &mut report)?);
    }
    Ok(summaries)
}

/// Every episode of every seed of one setup. The service is set up once per seed, and told to
/// save its model and move on after each episode.
fn run_setup(
    cfg: &SimConfig,
    dataset: &Dataset,
    topology: &Topology,
    policy: &mut dyn DecisionPolicy,
    report: &mut Report,
) -> Result<Vec<(RunInfo, RunSummary)>> {
    let gateway_mips = topology
        .gateway()
        .map(|g| g.mips)
        .ok_or_else(|| Error::InvalidTopology("the gateway node is missing".into()))?;
    let network = NetworkModel::new(&cfg.network, topology.cloud_datacenter);
    let mut summaries = Vec::with_capacity(cfg.experiment.random_seeds.len());

    for &seed in &cfg.experiment.random_seeds {
        let _s = info_span!("seed", seed).entered();

        let mut ctx = SimulationContext::new(topology.clone(), network, cfg.experiment.respect_job_constraints);
        let strategy = Strategy::new(
            cfg.experiment.strategy,
            DecisionCostModel::new(&cfg.gateway, gateway_mips),
        );
        let mut gateway = Gateway::new(strategy);
        let info = RunInfo {
            dataset: dataset.name.clone(),
            fog_nodes: topology.features_of(NodeKind::Fog).len(),
            placement: cfg.experiment.strategy,
            policy: cfg.policy.strategy.clone(),
            random_seed: seed,
        };

        let setup = SetupPayload::new(cfg, &dataset.name, topology, seed);
        info!(setup = %setup.setup_name, "setting up decision service");
        let ack = policy.request(&Request::Setup { data: setup })?;
        debug!(%ack, "setup acknowledged");

        for episode in 0..cfg.experiment.episodes {
            let _e = info_span!("episode", episode).entered();
            let started = Instant::now();

            ctx.start_episode(episode, dataset);
            gateway.reset();
            let clock = run_episode(&mut ctx, &mut gateway, policy, cfg.until)?;
            let ep = ctx.finish_episode(clock);

            policy.request(&Request::SaveModel {
                episode_number: episode,
            })?;
            policy.request(&Request::NextEpisode)?;
            report.record(&info, ep, gateway.unplaced(), started.elapsed())?;
        }

        summaries.push((info, ctx.metrics.summary()));
    }
    Ok(summaries)
}

/// What the configured dataset and topology turned out to be
#[derive(Debug, Clone, PartialEq)]
pub struct Overview {
    pub dataset: String,
    pub jobs: usize,
    pub tasks: usize,
    pub cloud_nodes: usize,
    pub fog_nodes: usize,
    pub fog_mips: Vec<f64>,
}

impl fmt::Display for Overview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dataset {}: {} jobs, {} tasks", self.dataset, self.jobs, self.tasks)?;
        writeln!(f, "cloud nodes: {}", self.cloud_nodes)?;
        write!(f, "fog nodes: {} {:?}", self.fog_nodes, self.fog_mips)
    }
}

/// Load every dataset and build every topology of the sweep without talking to the decision service
pub fn validate() -> Result<Vec<Overview>> {
    let cfg = config().sim_config()?;

    cfg.setups()
        .iter()
        .unique_by(|c| (c.dataset.path.clone(), c.topology.fog_nodes))
        .map(|setup| -> Result<Overview> {
            let dataset = Dataset::load(&setup.dataset)?;
            let topology = Topology::from_config(&setup.topology)?;

            let fog = topology.features_of(NodeKind::Fog);
            Ok(Overview {
                dataset: dataset.name,
                jobs: dataset.jobs.len(),
                tasks: dataset.tasks.len(),
                cloud_nodes: topology.features_of(NodeKind::Cloud).len(),
                fog_nodes: fog.len(),
                fog_mips: fog.iter().map(|f| f[0]).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::{DatasetConfig, OutputDir, StrategyConfig, StrategyKind};
    use crate::dataset::tests::{job_row, task_row, write_dataset};
    use crate::utils::app_config::AppConfig;

    /// Runs the head of the observation on the first idle node, -1 when all are busy.
    /// Learns the node count and the action shape from the setup.
    #[derive(Default)]
    struct FirstIdle {
        requests: Vec<Request>,
        nodes: usize,
        joint: bool,
    }

    impl DecisionPolicy for FirstIdle {
        fn request(&mut self, req: &Request) -> Result<String> {
            self.requests.push(req.clone());
            match req {
                Request::Setup { data } => {
                    self.nodes = data.fog.len() + data.cloud.iter().count();
                    self.joint = data.strategy.starts_with("TSP");
                    Ok("ok".into())
                }
                Request::AskDecision { data } => {
                    let nodes = &data.state[data.state.len() - 4 * self.nodes..];
                    match nodes.chunks(4).position(|n| n[3] == 0.0) {
                        Some(node) if self.joint => Ok(format!("0.001,20d0,{}", node)),
                        Some(node) => Ok(format!("0.001,20d{}", node)),
                        None => Ok("0.001,20d-1".into()),
                    }
                }
                _ => Ok("ok".into()),
            }
        }
    }

    fn write_tasks(dir: &Path) {
        write_dataset(
            dir,
            &[job_row(1, 0, 2, "[]"), job_row(2, 1, 1, "[]")],
            &[
                task_row(1, 1, 10_000, 0, 30, 5),
                task_row(2, 1, 10_000, 0, 30, 3),
                task_row(1, 2, 10_000, 0, 60, 1),
                // can not finish in time anywhere
                task_row(2, 2, 10_000_000, 0, 1, 2),
            ],
        );
    }

    fn sim_config(dir: &Path) -> SimConfig {
        let mut app = AppConfig::new();
        app.setup().unwrap();
        let mut cfg: SimConfig = app.fetch().unwrap();
        cfg.output_dir = OutputDir::new(dir.join("results"));
        cfg.dataset = DatasetConfig {
            path: dir.to_owned(),
            runtime_scale: 1.0,
        };
        cfg.topology.fog_nodes = 2;
        cfg.experiment.episodes = 2;
        cfg.experiment.random_seeds = vec![1, 2];
        cfg
    }

    #[test]
    fn whole_experiment() {
        let tmp = tempfile::tempdir().unwrap();
        write_tasks(tmp.path());
        let cfg = sim_config(tmp.path());
        let mut policy = FirstIdle::default();

        let summaries = run_experiment(&cfg, &mut policy).unwrap();
        assert_eq!(summaries.len(), 2);
        for (info, s) in &summaries {
            assert_eq!(info.fog_nodes, 2);
            assert_eq!(s.episodes, 2);
            assert_eq!(s.violations, [0, 2, 0, 0, 0]);
            assert!(s.avg_completion_time > 0.0);
        }

        let names: Vec<_> = policy.requests.iter().map(Request::name).collect();
        assert_eq!(names.iter().filter(|n| **n == "setup").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "save_model").count(), 4);
        assert_eq!(names.iter().filter(|n| **n == "next_episode").count(), 4);
        assert_eq!(names[0], "setup");
        assert_eq!(&names[names.len() - 2..], &["save_model", "next_episode"]);

        let report = std::fs::read_to_string(tmp.path().join("results").join("results.csv")).unwrap();
        assert_eq!(report.lines().count(), 1 + 4);
        assert!(tmp.path().join("results").join("reward_seed2_ep1.csv").is_file());
    }

    #[test]
    fn sweep_shares_one_report() {
        let tmp = tempfile::tempdir().unwrap();
        write_tasks(tmp.path());
        let mut cfg = sim_config(tmp.path());
        cfg.experiment.episodes = 1;
        cfg.experiment.random_seeds = vec![3];
        cfg.experiment.fog_nodes = vec![1, 2];
        cfg.experiment.strategies = vec![
            StrategyConfig {
                kind: StrategyKind::Placement,
                policy: "TP_FIFO".into(),
            },
            StrategyConfig {
                kind: StrategyKind::SchedulingAndPlacement,
                policy: "TSP_FIFO".into(),
            },
        ];
        let mut policy = FirstIdle::default();

        let summaries = run_experiment(&cfg, &mut policy).unwrap();
        let points: Vec<_> = summaries
            .iter()
            .map(|(info, _)| (info.fog_nodes, info.placement, info.policy.as_str()))
            .collect();
        assert_eq!(
            points,
            vec![
                (1, StrategyKind::Placement, "TP_FIFO"),
                (1, StrategyKind::SchedulingAndPlacement, "TSP_FIFO"),
                (2, StrategyKind::Placement, "TP_FIFO"),
                (2, StrategyKind::SchedulingAndPlacement, "TSP_FIFO"),
            ]
        );

        let setups: Vec<_> = policy
            .requests
            .iter()
            .filter_map(|r| match r {
                Request::Setup { data } => Some((data.fog.len(), data.strategy.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(setups, vec![(1, "TP_FIFO"), (1, "TSP_FIFO"), (2, "TP_FIFO"), (2, "TSP_FIFO")]);

        let report = std::fs::read_to_string(tmp.path().join("results").join("results.csv")).unwrap();
        let rows: Vec<_> = report.lines().skip(1).collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].contains(",1,placement,TP_FIFO,3,"));
        assert!(rows[3].contains(",2,scheduling_and_placement,TSP_FIFO,3,"));
    }
}
