use std::collections::VecDeque;
use std::convert::TryFrom;

use crate::config::StrategyKind;
use crate::nodes::NodeId;
use crate::policy::{DecisionCostModel, DecisionPolicy, DecisionResult, Request};
use crate::sim::SimulationContext;
use crate::types::{Duration, Priority, TaskId, Time};
use crate::utils::prelude::*;

/// What a decision did to the pending queue
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// the task leaves the queue for `node`, arriving there after the decision cost plus `transfer`
    Assigned {
        task: TaskId,
        node: NodeId,
        transfer: Duration,
    },
    /// the task can not make its deadline on the chosen node and is given up
    Dropped { task: TaskId },
    /// the policy picked a busy node while others are idle, nothing moves
    Rejected { node: NodeId },
    /// no node can take any task right now
    NoCapacity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub outcome: Outcome,
    /// simulated gateway time spent deciding
    pub cost: Duration,
}

impl Decision {
    pub fn all_nodes_busy(&self) -> bool {
        self.outcome == Outcome::NoCapacity
    }

    /// the task that left the queue, if any
    pub fn task(&self) -> Option<TaskId> {
        match self.outcome {
            Outcome::Assigned { task, .. } | Outcome::Dropped { task } => Some(task),
            Outcome::Rejected { .. } | Outcome::NoCapacity => None,
        }
    }
}

/// Asks the policy where (and for scheduling-and-placement also which) task runs next.
///
/// Both kinds share one contract, they only differ in which tasks are observed and how the
/// action is read: placement-only sends the first eligible task and reads `[node]`,
/// scheduling-and-placement sends every eligible task and reads `[task, node]`.
#[derive(Debug)]
pub struct Strategy {
    kind: StrategyKind,
    cost_model: DecisionCostModel,
    /// id of the next decision, restarts every episode
    seq: u64,
}

impl Strategy {
    pub fn new(kind: StrategyKind, cost_model: DecisionCostModel) -> Self {
        Self {
            kind,
            cost_model,
            seq: 0,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn reset(&mut self) {
        self.seq = 0;
    }

    /// Run one decision cycle at `now` over the pending queue.
    ///
    /// Returns `None` when no queued task is eligible, in which case the policy is not asked.
    /// The caller removes the decided task from the queue.
    #[instrument(
        level = "debug",
        skip(self, pending, ctx, policy),
        fields(kind = %self.kind, seq = self.seq, pending.len = pending.len())
    )]
    pub fn decide(
        &mut self,
        pending: &VecDeque<TaskId>,
        ctx: &mut SimulationContext,
        policy: &mut dyn DecisionPolicy,
        now: Time,
    ) -> Result<Option<Decision>> {
        ctx.release_finished(now);

        let eligible: Vec<TaskId> = pending
            .iter()
            .copied()
            .filter(|&id| !ctx.respect_job_constraints || ctx.jobs.can_run(ctx.task(id)))
            .collect();
        let offered = match self.kind {
            StrategyKind::Placement => &eligible[..eligible.len().min(1)],
            StrategyKind::SchedulingAndPlacement => &eligible[..],
        };
        if offered.is_empty() {
            debug!("no eligible task");
            return Ok(None);
        }

        let nodes = ctx.topology.candidate_ids();
        let state = observation(offered, &nodes, ctx, now);
        let raw = policy.request(&Request::ask_decision(self.seq, state.clone()))?;
        let result = DecisionResult::parse(&raw, &self.cost_model)?;
        ctx.metrics
            .current_mut()
            .record_gateway_sample(now, result.cost, result.cpu_percent);

        let no_capacity = Decision {
            outcome: Outcome::NoCapacity,
            cost: result.cost,
        };
        if result.no_capacity() {
            debug!(cost = %result.cost, "no node can take a task");
            return Ok(Some(no_capacity));
        }

        let (task, node) = self.resolve(&result.action, offered, &nodes)?;
        if !ctx.topology.node(node).is_idle() {
            if !ctx.topology.any_candidate_idle() {
                warn!(%task, %node, "policy chose a busy node, every node is busy");
                return Ok(Some(no_capacity));
            }
            warn!(%task, %node, "policy chose a busy node, nothing is placed");
            return Ok(Some(Decision {
                outcome: Outcome::Rejected { node },
                cost: result.cost,
            }));
        }

        let (outcome, reward) = place(ctx, task, node, now, result.cost);
        self.feedback(ctx, policy, reward, state)?;

        Ok(Some(Decision {
            outcome,
            cost: result.cost,
        }))
    }

    /// Map the action onto the offered tasks and the candidate nodes
    fn resolve(&self, action: &[i64], offered: &[TaskId], nodes: &[NodeId]) -> Result<(TaskId, NodeId)> {
        let invalid = || Error::InvalidAction {
            action: action.to_vec(),
            candidates: nodes.len(),
        };
        let pick = |idx: i64, len: usize| usize::try_from(idx).ok().filter(|&i| i < len);

        let (task_idx, node_idx) = match (self.kind, action) {
            (StrategyKind::Placement, [node, ..]) => (0, *node),
            (StrategyKind::SchedulingAndPlacement, [task, node, ..]) => {
                (pick(*task, offered.len()).ok_or_else(invalid)?, *node)
            }
            _ => return Err(invalid()),
        };
        let node_idx = pick(node_idx, nodes.len()).ok_or_else(invalid)?;
        Ok((offered[task_idx], nodes[node_idx]))
    }

    /// Reward the decision just taken and let the policy learn from the previous one
    fn feedback(
        &mut self,
        ctx: &mut SimulationContext,
        policy: &mut dyn DecisionPolicy,
        reward: f64,
        state: Vec<f64>,
    ) -> Result<()> {
        ctx.metrics.current_mut().record_reward(reward);

        let ack = policy.request(&Request::save_reward(self.seq, reward))?;
        debug!(seq = self.seq, reward, %ack, "reward saved");
        if self.seq > 0 {
            let ack = policy.request(&Request::retrain(self.seq - 1, state))?;
            debug!(seq = self.seq - 1, %ack, "retrained");
        }
        self.seq += 1;
        Ok(())
    }
}

/// Bind `task` to `node` unless it would miss its deadline there. Returns the outcome and its reward.
fn place(ctx: &mut SimulationContext, id: TaskId, node_id: NodeId, now: Time, cost: Duration) -> (Outcome, f64) {
    let node = ctx.topology.node(node_id);
    let task = &ctx.tasks[id.0];
    let transfer = ctx.network.transfer_delay(node.datacenter, task.storage);
    let running = node.running_time(task.length);
    let host = node.host;

    let start = now + cost + transfer;
    let violated = start + running > task.deadline;
    let reward = reward(task.priority, running, task.max_window(), violated);

    if violated {
        debug!(%task, node = %node_id, expected = %(start + running), reward, "deadline would be missed, dropping");
        ctx.metrics.current_mut().record_violation(task);
        return (Outcome::Dropped { task: id }, reward);
    }

    debug!(%task, node = %node_id, %start, %running, reward, "task placed");
    ctx.topology.node_mut(node_id).mark_busy();
    ctx.jobs.add_running(task);
    ctx.metrics.current_mut().add_device_busy(host, running);

    let task = ctx.task_mut(id);
    task.node = Some(node_id);
    task.decision_cost = cost;
    task.start_processing = Some(start);
    ctx.running.push(id);

    (
        Outcome::Assigned {
            task: id,
            node: node_id,
            transfer,
        },
        reward,
    )
}

/// `[(length, memory, storage, arrival, deadline, priority) per task, clock, (mips, ram, storage, busy) per node]`
fn observation(tasks: &[TaskId], nodes: &[NodeId], ctx: &SimulationContext, now: Time) -> Vec<f64> {
    let mut state = Vec::with_capacity(tasks.len() * 6 + 1 + nodes.len() * 4);
    for &id in tasks {
        let t = ctx.task(id);
        state.extend_from_slice(&[
            t.length,
            t.memory,
            t.storage,
            *t.arrival,
            *t.deadline,
            f64::from(t.priority.0),
        ]);
    }
    state.push(*now);
    for &id in nodes {
        let n = ctx.topology.node(id);
        let busy = if n.is_idle() { 0.0 } else { 1.0 };
        state.extend_from_slice(&[n.mips, n.ram, n.storage, busy]);
    }
    state
}

/// Scores a decision by how much of the task's window its execution takes.
///
/// A missed deadline is always `<= 0`, a met one is `>= 0` as long as the execution fits the window.
pub fn reward(priority: Priority, running: Duration, window: Duration, violated: bool) -> f64 {
    // a task without slack uses all of it
    let used = if *window > 0.0 { *running / *window } else { 1.0 };
    if violated {
        -priority.weight() * used.min(1.0)
    } else {
        priority.weight() * (1.0 - used)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::jobs::tests::task;
    use crate::jobs::{Job, JobConstraintTracker};
    use crate::nodes::tests::{features, topology_config};
    use crate::nodes::{NetworkModel, Topology};
    use crate::policy::tests::ScriptedPolicy;
    use crate::types::{JobId, Task};

    /// `fog_nodes` nodes of 10 MIPS behind a 0.05s link
    pub(crate) fn context(fog_nodes: usize) -> SimulationContext {
        let mut cfg = topology_config(0, fog_nodes);
        cfg.fog_catalogue = vec![features(10.0)];
        let topology = Topology::from_config(&cfg).unwrap();
        let network = NetworkModel {
            fog_latency: 0.05,
            fog_upload: 125.0,
            cloud_latency: 0.1,
            cloud_upload: 25.0,
            cloud_datacenter: None,
        };
        let mut ctx = SimulationContext::new(topology, network, true);
        ctx.metrics.start_episode(0);
        ctx
    }

    /// length 100, priority 5, arriving at 0, moving no data
    pub(crate) fn urgent_task(id: usize, deadline: f64) -> Task {
        let mut t = task(id, 1, id as u64 + 1);
        t.priority = Priority(5);
        t.storage = 0.0;
        t.deadline = Time(deadline);
        t
    }

    /// costs are taken as is
    pub(crate) fn strategy(kind: StrategyKind) -> Strategy {
        Strategy::new(
            kind,
            DecisionCostModel {
                real_mips: 1.0,
                simulated_mips: 1.0,
                charge_compute_time: true,
            },
        )
    }

    fn queue(ids: &[usize]) -> VecDeque<TaskId> {
        ids.iter().copied().map(TaskId).collect()
    }

    #[test]
    fn reward_formula() {
        let p5 = Priority(5);
        assert_relative_eq!(reward(p5, Duration(10.0), Duration(50.0), false), 0.8);
        assert_relative_eq!(reward(p5, Duration(10.0), Duration(5.0), true), -1.0);
        assert_relative_eq!(reward(Priority(2), Duration(1.0), Duration(4.0), true), -0.1);
        assert_relative_eq!(reward(p5, Duration(1.0), Duration::ZERO, false), 0.0);

        for level in Priority::all() {
            assert!(reward(level, Duration(3.0), Duration(2.0), true) <= 0.0);
            assert!(reward(level, Duration(2.0), Duration(3.0), false) >= 0.0);
        }
    }

    #[test]
    fn feasible_task_is_placed() {
        let mut ctx = context(1);
        ctx.tasks = vec![urgent_task(0, 50.0)];
        let mut policy = ScriptedPolicy::new(vec!["1,10d0"]);
        let mut s = strategy(StrategyKind::Placement);

        let d = s
            .decide(&queue(&[0]), &mut ctx, &mut policy, Time::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(d.cost, Duration(1.0));
        match d.outcome {
            Outcome::Assigned { task, node, transfer } => {
                assert_eq!(task, TaskId(0));
                assert_eq!(node, NodeId(0));
                assert_relative_eq!(*transfer, 0.05);
            }
            other => panic!("unexpected {:?}", other),
        }

        let t = ctx.task(TaskId(0));
        assert_eq!(t.node, Some(NodeId(0)));
        assert_eq!(t.decision_cost, Duration(1.0));
        let start = t.start_processing.unwrap();
        assert_relative_eq!(*start, 1.05);
        assert_relative_eq!(*(start + ctx.topology.node(NodeId(0)).running_time(t.length)), 11.05);

        assert!(!ctx.topology.node(NodeId(0)).is_idle());
        assert_eq!(ctx.running, vec![TaskId(0)]);
        let ep = ctx.metrics.current();
        assert_relative_eq!(ep.rewards[0], 0.8);
        assert_eq!(ep.total_violations(), 0);
        assert_relative_eq!(ep.device_busy[&0], 10.0);
        assert_eq!(ep.gateway_samples.len(), 1);

        assert_eq!(policy.sent("save_reward"), vec![&Request::save_reward(0, ep.rewards[0])]);
        assert!(policy.sent("retrain").is_empty());
        assert_eq!(s.seq(), 1);
    }

    #[test]
    fn infeasible_task_is_dropped() {
        let mut ctx = context(1);
        ctx.tasks = vec![urgent_task(0, 5.0)];
        let mut policy = ScriptedPolicy::new(vec!["1,10d0"]);
        let mut s = strategy(StrategyKind::Placement);

        let d = s
            .decide(&queue(&[0]), &mut ctx, &mut policy, Time::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(d.outcome, Outcome::Dropped { task: TaskId(0) });
        assert_eq!(d.task(), Some(TaskId(0)));

        let ep = ctx.metrics.current();
        assert_relative_eq!(ep.rewards[0], -1.0);
        assert_eq!(ep.violations_of(Priority(5)), 1);
        assert_eq!(ep.violated_tasks, vec![TaskId(0)]);
        assert!(ctx.topology.node(NodeId(0)).is_idle());
        assert!(ctx.running.is_empty());
        assert_eq!(ctx.task(TaskId(0)).node, None);
    }

    #[test]
    fn no_capacity_charges_cost_only() {
        let mut ctx = context(2);
        ctx.tasks = vec![urgent_task(0, 50.0)];
        let mut policy = ScriptedPolicy::new(vec!["2,30d-1"]);
        let mut s = strategy(StrategyKind::Placement);

        let d = s
            .decide(&queue(&[0]), &mut ctx, &mut policy, Time(4.0))
            .unwrap()
            .unwrap();
        assert!(d.all_nodes_busy());
        assert_eq!(d.task(), None);
        assert_eq!(d.cost, Duration(2.0));

        assert!(policy.sent("save_reward").is_empty());
        assert_eq!(s.seq(), 0);
        let ep = ctx.metrics.current();
        assert!(ep.rewards.is_empty());
        assert_eq!(ep.gateway_samples[0].timestamp, Time(4.0));
        assert!(ctx.topology.any_candidate_idle());
    }

    #[test]
    fn busy_node_choice_is_rejected() {
        let mut ctx = context(2);
        ctx.tasks = vec![urgent_task(0, 50.0)];
        ctx.topology.node_mut(NodeId(0)).mark_busy();
        let mut policy = ScriptedPolicy::new(vec!["1,10d0", "1,10d0"]);
        let mut s = strategy(StrategyKind::Placement);

        // node 1 is still idle, so this is not over-subscription
        let d = s
            .decide(&queue(&[0]), &mut ctx, &mut policy, Time::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(d.outcome, Outcome::Rejected { node: NodeId(0) });
        assert!(!d.all_nodes_busy());
        assert_eq!(d.task(), None);
        assert_eq!(d.cost, Duration(1.0));
        assert!(ctx.running.is_empty());
        assert!(policy.sent("save_reward").is_empty());
        assert_eq!(s.seq(), 0);

        ctx.topology.node_mut(NodeId(1)).mark_busy();
        let d = s
            .decide(&queue(&[0]), &mut ctx, &mut policy, Time::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(d.outcome, Outcome::NoCapacity);
        assert!(d.all_nodes_busy());
    }

    #[test]
    fn observation_layout() {
        let mut ctx = context(2);
        ctx.tasks = vec![urgent_task(0, 50.0), urgent_task(1, 60.0)];
        ctx.topology.node_mut(NodeId(1)).mark_busy();
        let mut policy = ScriptedPolicy::new(vec!["1,0d-1"]);
        let mut s = strategy(StrategyKind::Placement);
        s.decide(&queue(&[0, 1]), &mut ctx, &mut policy, Time(3.0)).unwrap();

        let state = match policy.sent("ask_decision")[0] {
            Request::AskDecision { data } => data.state.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            state,
            vec![
                100.0, 1.0, 0.0, 0.0, 50.0, 5.0, // head task
                3.0, // clock
                10.0, 4096.0, 131072.0, 0.0, // idle node
                10.0, 4096.0, 131072.0, 1.0, // busy node
            ]
        );
    }

    #[test]
    fn scheduling_and_placement_can_pick_any_task() {
        let mut ctx = context(2);
        ctx.tasks = vec![urgent_task(0, 50.0), urgent_task(1, 50.0)];
        let mut policy = ScriptedPolicy::new(vec!["0.5,0d1,1"]);
        let mut s = strategy(StrategyKind::SchedulingAndPlacement);

        let d = s
            .decide(&queue(&[0, 1]), &mut ctx, &mut policy, Time::ZERO)
            .unwrap()
            .unwrap();
        assert!(matches!(
            d.outcome,
            Outcome::Assigned { task: TaskId(1), node: NodeId(1), .. }
        ));
        assert!(ctx.topology.node(NodeId(0)).is_idle());

        match policy.sent("ask_decision")[0] {
            Request::AskDecision { data } => assert_eq!(data.state.len(), 2 * 6 + 1 + 2 * 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn out_of_range_actions_are_fatal() {
        let mut ctx = context(2);
        ctx.tasks = vec![urgent_task(0, 50.0)];

        let mut policy = ScriptedPolicy::new(vec!["1,0d7"]);
        let res = strategy(StrategyKind::Placement).decide(&queue(&[0]), &mut ctx, &mut policy, Time::ZERO);
        assert!(matches!(res, Err(Error::InvalidAction { candidates: 2, .. })));

        // a lone index is not a `[task, node]` pair
        let mut policy = ScriptedPolicy::new(vec!["1,0d0"]);
        let res = strategy(StrategyKind::SchedulingAndPlacement).decide(
            &queue(&[0]),
            &mut ctx,
            &mut policy,
            Time::ZERO,
        );
        assert!(matches!(res, Err(Error::InvalidAction { .. })));
    }

    #[test]
    fn job_constraints_filter_candidates() {
        let mut ctx = context(2);
        let mut blocked = task(1, 1, 2);
        blocked.storage = 0.0;
        let mut other = task(2, 2, 1);
        other.storage = 0.0;
        ctx.tasks = vec![task(0, 1, 1), blocked, other];
        ctx.jobs = JobConstraintTracker::new(vec![Job::new(JobId(1), 1, vec![])]);
        let running = ctx.task(TaskId(0)).clone();
        ctx.jobs.add_running(&running);

        let mut policy = ScriptedPolicy::new(vec!["0,0d0"]);
        let mut s = strategy(StrategyKind::Placement);
        let d = s
            .decide(&queue(&[1, 2]), &mut ctx, &mut policy, Time::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(d.task(), Some(TaskId(2)));

        // only the blocked task is left, the policy is not asked
        let res = s.decide(&queue(&[1]), &mut ctx, &mut policy, Time::ZERO).unwrap();
        assert!(res.is_none());
        assert_eq!(policy.sent("ask_decision").len(), 1);

        ctx.respect_job_constraints = false;
        policy.decisions.push_back("0,0d1".into());
        let d = s.decide(&queue(&[1]), &mut ctx, &mut policy, Time::ZERO).unwrap();
        assert_eq!(d.and_then(|d| d.task()), Some(TaskId(1)));
    }

    #[test]
    fn rewards_then_delayed_retrain() {
        let mut ctx = context(3);
        ctx.tasks = (0..3).map(|i| urgent_task(i, 50.0)).collect();
        let mut policy = ScriptedPolicy::new(vec!["0,0d0", "0,0d1", "0,0d2"]);
        let mut s = strategy(StrategyKind::Placement);

        let mut pending = queue(&[0, 1, 2]);
        while let Some(d) = s.decide(&pending, &mut ctx, &mut policy, Time::ZERO).unwrap() {
            pending.retain(|&id| Some(id) != d.task());
        }

        let ids: Vec<(&str, u64)> = policy
            .requests
            .iter()
            .map(|r| match r {
                Request::AskDecision { data } | Request::Retrain { data } => (r.name(), data.action_id),
                Request::SaveReward { data } => (r.name(), data.action_id),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            ids,
            vec![
                ("ask_decision", 0),
                ("save_reward", 0),
                ("ask_decision", 1),
                ("save_reward", 1),
                ("retrain", 0),
                ("ask_decision", 2),
                ("save_reward", 2),
                ("retrain", 1),
            ]
        );
        assert_eq!(ctx.running.len(), 3);

        s.reset();
        assert_eq!(s.seq(), 0);
    }
}
