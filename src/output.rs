use std::fs::File;
use std::time::Duration as WallDuration;

use serde::Serialize;

use crate::config::{OutputDir, StrategyKind};
use crate::metrics::EpisodeMetrics;
use crate::utils::prelude::*;

pub const REPORT_FILE: &str = "results.csv";

/// What a seed run was about, repeated on each of its rows
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub dataset: String,
    pub fog_nodes: usize,
    pub placement: StrategyKind,
    pub policy: String,
    pub random_seed: u64,
}

/// One row of `results.csv`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeRow {
    pub episode: usize,
    pub dataset: String,
    pub fog_nodes: usize,
    pub placement: StrategyKind,
    pub policy: String,
    pub random_seed: u64,
    pub violations_p1: usize,
    pub violations_p2: usize,
    pub violations_p3: usize,
    pub violations_p4: usize,
    pub violations_p5: usize,
    pub sim_clock: f64,
    pub wall_time_secs: f64,
    pub avg_completion_time: f64,
    pub device_energy: f64,
    pub gateway_idle_energy: f64,
    pub gateway_busy_energy: f64,
    pub gateway_total_energy: f64,
    pub avg_gateway_busy_time: f64,
    pub avg_reward: f64,
    pub completed: usize,
    pub unplaced: usize,
}

impl EpisodeRow {
    pub fn new(info: &RunInfo, ep: &EpisodeMetrics, unplaced: usize, wall_time: WallDuration) -> Self {
        let [p1, p2, p3, p4, p5] = ep.violations;
        Self {
            episode: ep.episode,
            dataset: info.dataset.clone(),
            fog_nodes: info.fog_nodes,
            placement: info.placement,
            policy: info.policy.clone(),
            random_seed: info.random_seed,
            violations_p1: p1,
            violations_p2: p2,
            violations_p3: p3,
            violations_p4: p4,
            violations_p5: p5,
            sim_clock: *ep.final_clock,
            wall_time_secs: wall_time.as_secs_f64(),
            avg_completion_time: ep.avg_completion_time(),
            device_energy: ep.device_energy,
            gateway_idle_energy: ep.gateway_energy.idle,
            gateway_busy_energy: ep.gateway_energy.busy,
            gateway_total_energy: ep.gateway_energy.total(),
            avg_gateway_busy_time: ep.avg_gateway_busy_time(),
            avg_reward: ep.avg_reward(),
            completed: ep.completed,
            unplaced,
        }
    }
}

/// The run's report, one row per episode of every seed
pub struct Report {
    dir: OutputDir,
    writer: csv::Writer<File>,
}

impl Report {
    pub fn create(dir: &OutputDir) -> Result<Self> {
        let path = dir.file(REPORT_FILE)?;
        info!(path = %path.display(), "writing report");
        Ok(Self {
            dir: dir.clone(),
            writer: csv::Writer::from_path(path)?,
        })
    }

    /// Append the episode's row and dump its series next to the report
    pub fn record(&mut self, info: &RunInfo, ep: &EpisodeMetrics, unplaced: usize, wall_time: WallDuration) -> Result<()> {
        let row = EpisodeRow::new(info, ep, unplaced, wall_time);
        self.writer.serialize(&row)?;
        self.writer.flush()?;

        let series_name = |what: &str| format!("{}_seed{}_ep{}.csv", what, info.random_seed, ep.episode);
        write_series(
            &self.dir,
            &series_name("completion_time"),
            ep.completion_history.iter().map(|(_, t)| *t),
        )?;
        write_series(&self.dir, &series_name("reward"), ep.rewards.iter().copied())?;
        write_series(
            &self.dir,
            &series_name("gateway_energy"),
            ep.gateway_energy.series.iter().copied(),
        )?;
        debug!(episode = ep.episode, seed = info.random_seed, "episode reported");
        Ok(())
    }
}

/// `index,value` rows of a per-episode history
pub fn write_series(dir: &OutputDir, name: &str, values: impl IntoIterator<Item = f64>) -> Result<()> {
    let mut writer = csv::Writer::from_path(dir.file(name)?)?;
    writer.write_record(&["index", "value"])?;
    for (idx, value) in values.into_iter().enumerate() {
        writer.serialize((idx, value))?;
    }
    writer.flush()?;
    Ok(())
}
