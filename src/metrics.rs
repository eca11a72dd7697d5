use std::collections::BTreeMap;

use crate::nodes::{LinearPowerModel, Topology};
use crate::types::{Duration, Priority, Task, TaskId, Time};
use crate::utils::float::{mean, ratio_or_zero};
use crate::utils::prelude::*;

/// One `(timestamp, compute time, cpu%)` sample of the gateway deciding
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewaySample {
    pub timestamp: Time,
    pub time: Duration,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayEnergy {
    pub idle: f64,
    pub busy: f64,
    /// running total after each sample
    pub series: Vec<f64>,
}

impl GatewayEnergy {
    /// Energy of the gateway reconstructed from its decision samples
    pub fn from_samples(samples: &[GatewaySample], power: &LinearPowerModel, final_clock: Time) -> Self {
        let mut busy = 0.0;
        let mut busy_time = 0.0;
        let mut series = Vec::with_capacity(samples.len());
        for s in samples {
            let idle_so_far = *s.timestamp - busy_time;
            busy_time += *s.time;
            busy += *s.time * power.power(s.cpu_percent / 100.0);
            series.push(busy + idle_so_far * power.static_power());
        }

        Self {
            idle: (*final_clock - busy_time).max(0.0) * power.static_power(),
            busy,
            series,
        }
    }

    pub fn total(&self) -> f64 {
        self.idle + self.busy
    }
}

/// Everything measured during one episode
#[derive(Debug, Clone, Default)]
pub struct EpisodeMetrics {
    pub episode: usize,
    /// indexed by `priority - 1`
    pub violations: [usize; Priority::LEVELS as usize],
    pub violated_tasks: Vec<TaskId>,
    /// `finish - arrival + decision cost` of every released task
    pub completion_history: Vec<(TaskId, f64)>,
    pub rewards: Vec<f64>,
    pub gateway_samples: Vec<GatewaySample>,
    /// sum of `finish - arrival`
    pub total_completion: f64,
    /// sum of `finish - start`
    pub total_running: f64,
    pub completed: usize,
    /// busy seconds per host
    pub device_busy: BTreeMap<usize, f64>,

    pub final_clock: Time,
    pub device_energy: f64,
    pub gateway_energy: GatewayEnergy,
}

impl EpisodeMetrics {
    pub fn new(episode: usize) -> Self {
        Self {
            episode,
            ..Default::default()
        }
    }

    pub fn record_violation(&mut self, task: &Task) {
        self.violations[usize::from(task.priority.0 - 1)] += 1;
        self.violated_tasks.push(task.id);
    }

    pub fn violations_of(&self, priority: Priority) -> usize {
        self.violations[usize::from(priority.0 - 1)]
    }

    pub fn total_violations(&self) -> usize {
        self.violations.iter().sum()
    }

    pub fn record_reward(&mut self, reward: f64) {
        self.rewards.push(reward);
    }

    pub fn record_gateway_sample(&mut self, timestamp: Time, time: Duration, cpu_percent: f64) {
        self.gateway_samples.push(GatewaySample {
            timestamp,
            time,
            cpu_percent,
        });
    }

    pub fn add_device_busy(&mut self, host: usize, running: Duration) {
        *self.device_busy.entry(host).or_default() += *running;
    }

    /// Fold a task that finished by the sweep clock
    pub fn record_completion(&mut self, task: &Task) {
        let finish = match task.finish {
            Some(finish) => finish,
            None => return,
        };
        let start = task.start_processing.unwrap_or(finish);

        self.total_completion += *(finish - task.arrival);
        self.total_running += *(finish - start);
        self.completed += 1;
        self.completion_history
            .push((task.id, *(finish - task.arrival) + *task.decision_cost));
    }

    pub fn avg_completion_time(&self) -> f64 {
        mean(self.completion_history.iter().map(|(_, t)| t))
    }

    pub fn avg_reward(&self) -> f64 {
        mean(&self.rewards)
    }

    pub fn gateway_busy_time(&self) -> f64 {
        self.gateway_samples.iter().map(|s| *s.time).sum()
    }

    pub fn avg_gateway_busy_time(&self) -> f64 {
        ratio_or_zero(self.gateway_busy_time(), self.gateway_samples.len() as f64)
    }

    /// Compute the energy figures once the episode's clock stopped
    fn close(&mut self, final_clock: Time, topology: &Topology) {
        self.final_clock = final_clock;
        self.device_energy = topology
            .candidates()
            .map(|node| {
                // work placed past a time limit is cut off there
                let busy = self
                    .device_busy
                    .get(&node.host)
                    .copied()
                    .unwrap_or_default()
                    .min(*final_clock);
                busy * node.power.power(node.utilization()) + (*final_clock - busy) * node.power.static_power()
            })
            .sum();
        self.gateway_energy = match topology.gateway() {
            Some(gw) => GatewayEnergy::from_samples(&self.gateway_samples, &gw.power, final_clock),
            None => GatewayEnergy::default(),
        };
    }
}

/// Averages over every episode of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub episodes: usize,
    pub violations: [usize; Priority::LEVELS as usize],
    pub avg_completion_time: f64,
    pub avg_reward: f64,
    pub avg_gateway_busy_time: f64,
}

/// Keeps the current episode's metrics and all finished ones of the run
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    finished: Vec<EpisodeMetrics>,
    current: EpisodeMetrics,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn start_episode(&mut self, episode: usize) {
        self.current = EpisodeMetrics::new(episode);
    }

    pub fn current(&self) -> &EpisodeMetrics {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut EpisodeMetrics {
        &mut self.current
    }

    /// Freeze the current episode
    pub fn finish_episode(&mut self, final_clock: Time, topology: &Topology) -> &EpisodeMetrics {
        let mut done = std::mem::take(&mut self.current);
        done.close(final_clock, topology);
        info!(
            episode = done.episode,
            clock = %final_clock,
            completed = done.completed,
            violations = done.total_violations(),
            device_energy = done.device_energy,
            gateway_energy = done.gateway_energy.total(),
            "episode finished"
        );
        self.finished.push(done);
        &self.finished[self.finished.len() - 1]
    }

    pub fn episodes(&self) -> &[EpisodeMetrics] {
        &self.finished
    }

    pub fn summary(&self) -> RunSummary {
        let mut violations = [0; Priority::LEVELS as usize];
        for ep in &self.finished {
            for (total, v) in violations.iter_mut().zip(ep.violations.iter()) {
                *total += v;
            }
        }

        let completions: Vec<f64> = self
            .finished
            .iter()
            .flat_map(|ep| ep.completion_history.iter().map(|(_, t)| *t))
            .collect();
        let rewards: Vec<f64> = self
            .finished
            .iter()
            .flat_map(|ep| ep.rewards.iter().copied())
            .collect();
        let samples: Vec<f64> = self
            .finished
            .iter()
            .flat_map(|ep| ep.gateway_samples.iter().map(|s| *s.time))
            .collect();

        RunSummary {
            episodes: self.finished.len(),
            violations,
            avg_completion_time: mean(&completions),
            avg_reward: mean(&rewards),
            avg_gateway_busy_time: mean(&samples),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::jobs::tests::task;
    use crate::nodes::tests::topology_config;

    fn sample(timestamp: f64, time: f64, cpu: f64) -> GatewaySample {
        GatewaySample {
            timestamp: Time(timestamp),
            time: Duration(time),
            cpu_percent: cpu,
        }
    }

    #[test]
    fn gateway_energy() {
        let power = LinearPowerModel { busy: 135.0, idle: 93.7 };
        let samples = [sample(0.0, 1.0, 50.0), sample(1.0, 1.0, 100.0), sample(5.0, 2.0, 0.0)];
        let energy = GatewayEnergy::from_samples(&samples, &power, Time(10.0));

        let busy = 1.0 * power.power(0.5) + 1.0 * 135.0 + 2.0 * 93.7;
        assert_relative_eq!(energy.busy, busy);
        assert_relative_eq!(energy.idle, (10.0 - 4.0) * 93.7);
        assert_relative_eq!(energy.total(), busy + 6.0 * 93.7);

        assert_eq!(energy.series.len(), 3);
        assert_relative_eq!(energy.series[0], power.power(0.5));
        assert_relative_eq!(energy.series[2], busy + 3.0 * 93.7);
        assert!(energy.series.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn no_samples_means_idle_gateway() {
        let power = LinearPowerModel { busy: 135.0, idle: 93.7 };
        let energy = GatewayEnergy::from_samples(&[], &power, Time(2.0));
        assert_relative_eq!(energy.total(), 2.0 * 93.7);
        assert!(energy.series.is_empty());
    }

    #[test]
    fn completion_folds_both_metrics() {
        let mut m = EpisodeMetrics::new(0);
        let mut t = task(0, 1, 1);
        t.arrival = Time(2.0);
        t.decision_cost = Duration(1.0);
        t.start_processing = Some(Time(4.0));
        t.finish = Some(Time(10.0));
        m.record_completion(&t);

        assert_eq!(m.completed, 1);
        assert_relative_eq!(m.total_completion, 8.0);
        assert_relative_eq!(m.total_running, 6.0);
        assert_eq!(m.completion_history, vec![(TaskId(0), 9.0)]);

        // unfinished tasks are ignored
        m.record_completion(&task(1, 1, 2));
        assert_eq!(m.completed, 1);
    }

    #[test]
    fn violations_by_priority() {
        let mut m = EpisodeMetrics::new(0);
        let mut t = task(3, 1, 1);
        t.priority = Priority(5);
        m.record_violation(&t);
        m.record_violation(&t);
        t.priority = Priority(1);
        m.record_violation(&t);

        assert_eq!(m.violations_of(Priority(5)), 2);
        assert_eq!(m.violations_of(Priority(1)), 1);
        assert_eq!(m.violations_of(Priority(3)), 0);
        assert_eq!(m.total_violations(), 3);
        assert_eq!(m.violated_tasks, vec![TaskId(3); 3]);
    }

    #[test]
    fn device_energy_counts_idle_nodes() {
        let topo = Topology::from_config(&topology_config(0, 2)).unwrap();
        let mut agg = MetricsAggregator::new();
        agg.start_episode(0);
        let host = topo.candidates().next().unwrap().host;
        agg.current_mut().add_device_busy(host, Duration(4.0));
        agg.current_mut().add_device_busy(host, Duration(1.0));

        let ep = agg.finish_episode(Time(10.0), &topo);
        // every node runs at full host speed, so busy power is the peak
        let expected: f64 = topo
            .candidates()
            .map(|n| {
                let busy = if n.host == host { 5.0 } else { 0.0 };
                busy * n.power.busy + (10.0 - busy) * n.power.idle
            })
            .sum();
        assert_relative_eq!(ep.device_energy, expected);
        assert_relative_eq!(ep.gateway_energy.total(), 10.0 * 88.4);
    }

    #[test]
    fn busy_time_is_capped_by_the_clock() {
        let topo = Topology::from_config(&topology_config(0, 1)).unwrap();
        let node = topo.candidates().next().unwrap();
        let mut agg = MetricsAggregator::new();
        agg.start_episode(0);
        agg.current_mut().add_device_busy(node.host, Duration(30.0));
        agg.current_mut()
            .record_gateway_sample(Time::ZERO, Duration(12.0), 100.0);

        let ep = agg.finish_episode(Time(10.0), &topo);
        assert_relative_eq!(ep.device_energy, 10.0 * node.power.power(node.utilization()));
        assert_eq!(ep.gateway_energy.idle, 0.0);
    }

    #[test]
    fn run_summary_spans_episodes() {
        let topo = Topology::from_config(&topology_config(0, 1)).unwrap();
        let mut agg = MetricsAggregator::new();

        agg.start_episode(0);
        agg.current_mut().record_reward(1.0);
        agg.current_mut()
            .record_gateway_sample(Time::ZERO, Duration(2.0), 10.0);
        agg.finish_episode(Time(5.0), &topo);

        agg.start_episode(1);
        agg.current_mut().record_reward(-0.5);
        agg.current_mut().record_reward(0.0);
        agg.current_mut()
            .record_gateway_sample(Time::ZERO, Duration(4.0), 10.0);
        let mut t = task(0, 1, 1);
        t.priority = Priority(2);
        agg.current_mut().record_violation(&t);
        agg.finish_episode(Time(5.0), &topo);

        let summary = agg.summary();
        assert_eq!(summary.episodes, 2);
        assert_eq!(summary.violations, [0, 1, 0, 0, 0]);
        assert_relative_eq!(summary.avg_reward, 0.5 / 3.0);
        assert_relative_eq!(summary.avg_gateway_busy_time, 3.0);
        assert_relative_eq!(summary.avg_completion_time, 0.0);
        assert_eq!(agg.episodes()[1].episode, 1);
    }
}
