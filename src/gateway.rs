use std::collections::VecDeque;
use std::mem;

use parse_display::Display;

use crate::policy::DecisionPolicy;
use crate::sim::{msg, Kernel, Message, SimulationContext, Target};
use crate::strategies::{Outcome, Strategy};
use crate::types::{Duration, TaskId};
use crate::utils::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum GatewayState {
    /// no decision in flight
    Idle,
    /// paying the simulated cost of a decision, the wake is already scheduled
    Deciding,
}

/// Admission point of every task: queues arrivals and runs one decision at a time
#[derive(Debug)]
pub struct Gateway {
    state: GatewayState,
    pending: VecDeque<TaskId>,
    /// the last decision found no node able to take a task
    all_nodes_busy: bool,
    /// capacity was freed while deciding
    recheck: bool,
    strategy: Strategy,
}

impl Gateway {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            state: GatewayState::Idle,
            pending: VecDeque::new(),
            all_nodes_busy: false,
            recheck: false,
            strategy,
        }
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn pending(&self) -> &VecDeque<TaskId> {
        &self.pending
    }

    /// tasks still queued, they never got a node
    pub fn unplaced(&self) -> usize {
        self.pending.len()
    }

    /// Back to the initial state for a new episode
    pub fn reset(&mut self) {
        self.state = GatewayState::Idle;
        self.pending.clear();
        self.all_nodes_busy = false;
        self.recheck = false;
        self.strategy.reset();
    }

    pub fn handle(
        &mut self,
        message: Message,
        ctx: &mut SimulationContext,
        policy: &mut dyn DecisionPolicy,
        kernel: &mut dyn Kernel,
    ) -> Result<()> {
        let now = kernel.now();
        trace!(%now, state = %self.state, %message, pending.len = self.pending.len(), "gateway");

        match message {
            Message::TaskArrival(msg::TaskArrival { task }) => {
                self.pending.push_back(task);
                if self.state == GatewayState::Idle && ctx.topology.any_candidate_idle() {
                    self.decide(ctx, policy, kernel)?;
                }
            }
            Message::GatewayWake(_) => {
                self.state = GatewayState::Idle;
                let recheck = mem::take(&mut self.recheck);
                if !self.all_nodes_busy || recheck {
                    self.decide(ctx, policy, kernel)?;
                }
            }
            Message::DecisionDue(_) => {
                if self.state == GatewayState::Idle {
                    self.decide(ctx, policy, kernel)?;
                } else {
                    self.recheck = true;
                }
            }
            Message::TaskFinished(msg::TaskFinished { task, node }) => {
                ctx.task_mut(task).finish = Some(now);
                ctx.topology.node_mut(node).mark_idle();
                debug!(%now, %task, %node, "node released");
                if self.state == GatewayState::Idle {
                    kernel.schedule(Target::Gateway, Duration::ZERO, msg::DecisionDue.into());
                } else {
                    self.recheck = true;
                }
            }
            Message::TaskSubmit(_) => warn!(%message, "gateway ignores message"),
        }
        Ok(())
    }

    /// One decision cycle, a no-op when no queued task can be decided on
    fn decide(
        &mut self,
        ctx: &mut SimulationContext,
        policy: &mut dyn DecisionPolicy,
        kernel: &mut dyn Kernel,
    ) -> Result<()> {
        let now = kernel.now();
        let decision = match self.strategy.decide(&self.pending, ctx, policy, now)? {
            Some(decision) => decision,
            None => return Ok(()),
        };

        self.recheck = false;
        self.all_nodes_busy = decision.all_nodes_busy();
        if let Some(task) = decision.task() {
            self.pending.retain(|&id| id != task);
        }
        if let Outcome::Assigned { task, node, transfer } = decision.outcome {
            let dc = ctx.topology.node(node).datacenter;
            kernel.schedule(
                Target::Datacenter(dc),
                decision.cost + transfer,
                msg::TaskSubmit { task, node }.into(),
            );
        }
        kernel.schedule(Target::Gateway, decision.cost, msg::GatewayWake.into());
        self.state = GatewayState::Deciding;
        Ok(())
    }
}
