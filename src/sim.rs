use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

use educe::Educe;
use parse_display::Display;

use crate::config::EndCondition;
use crate::dataset::Dataset;
use crate::gateway::Gateway;
use crate::jobs::JobConstraintTracker;
use crate::metrics::{EpisodeMetrics, MetricsAggregator};
use crate::nodes::{DatacenterId, NetworkModel, Topology};
use crate::policy::DecisionPolicy;
use crate::types::{Duration, Task, TaskId, Time};
use crate::utils::prelude::*;

pub mod msg {
    use parse_display::Display;

    use crate::nodes::NodeId;
    use crate::types::TaskId;

    /// A task shows up at the gateway
    #[derive(Debug, Clone, Display)]
    #[display("TaskArrival({task})")]
    pub struct TaskArrival {
        pub task: TaskId,
    }

    /// The decision window of the gateway elapsed
    #[derive(Debug, Clone, Display)]
    #[display("GatewayWake")]
    pub struct GatewayWake;

    /// Capacity was freed, the queue should be looked at again
    #[derive(Debug, Clone, Display)]
    #[display("DecisionDue")]
    pub struct DecisionDue;

    /// A placed task reaches its node's datacenter
    #[derive(Debug, Clone, Display)]
    #[display("TaskSubmit({task} -> {node})")]
    pub struct TaskSubmit {
        pub task: TaskId,
        pub node: NodeId,
    }

    /// A node finished its task
    #[derive(Debug, Clone, Display)]
    #[display("TaskFinished({task} @ {node})")]
    pub struct TaskFinished {
        pub task: TaskId,
        pub node: NodeId,
    }
}

/// Who an event is delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Target {
    #[display("gateway")]
    Gateway,
    #[display("{0}")]
    Datacenter(DatacenterId),
}

/// Events ordered by time, ties broken by insertion order
#[derive(Debug, Clone, Display, Educe)]
#[educe(PartialEq, Eq, PartialOrd, Ord)]
#[display("@{time} #{seq} -> {target} {message}")]
pub struct Event {
    pub time: Time,
    pub seq: u64,
    #[educe(PartialEq(ignore), PartialOrd(ignore), Ord(ignore))]
    pub target: Target,
    #[educe(PartialEq(ignore), PartialOrd(ignore), Ord(ignore))]
    pub message: Message,
}

macro_rules! define_message {
    ( $( $msg:ident ),+ ) => {

        #[derive(Debug, Clone)]
        pub enum Message {
            $(
                $msg(msg::$msg)
            ),+
        }

        impl fmt::Display for Message {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(
                        Message::$msg(inner) => inner.fmt(f)
                    ),+
                }
            }
        }

        $(
            impl From<msg::$msg> for Message {
                fn from(v: msg::$msg) -> Self {
                    Self::$msg(v)
                }
            }
        )+
    };
}

define_message![TaskArrival, GatewayWake, DecisionDue, TaskSubmit, TaskFinished];

/// The narrow view components get of the simulation kernel
pub trait Kernel {
    fn now(&self) -> Time;
    fn schedule(&mut self, target: Target, delay: Duration, message: Message);
}

/// Future events of one episode and the clock
#[derive(Debug, Default)]
pub struct EventQueue {
    now: Time,
    seq: u64,
    future: BinaryHeap<Reverse<Event>>,
    processed: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Schedule at an absolute time, which must not be in the past
    pub fn push_at(&mut self, time: Time, target: Target, message: Message) {
        let time = if time < self.now {
            warn!(now = %self.now, %time, %message, "event in the past, delivering now");
            self.now
        } else {
            time
        };
        let event = Event {
            time,
            seq: self.seq,
            target,
            message,
        };
        self.seq += 1;
        trace!(%event, "push event");
        self.future.push(Reverse(event));
    }

    /// Next event, advancing the clock to it
    pub fn pop(&mut self, until: EndCondition) -> Option<Event> {
        let next = self.future.peek().map(|Reverse(e)| e.time)?;
        if let EndCondition::Time(limit) = until {
            if next > limit {
                return None;
            }
        }
        let Reverse(event) = self.future.pop()?;
        self.now = event.time;
        self.processed += 1;
        Some(event)
    }

    /// Move the clock forward without handling anything
    pub fn advance_to(&mut self, time: Time) {
        if time > self.now {
            self.now = time;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.future.is_empty()
    }

    pub fn len(&self) -> usize {
        self.future.len()
    }

    pub fn processed(&self) -> usize {
        self.processed
    }
}

impl Kernel for EventQueue {
    fn now(&self) -> Time {
        self.now
    }

    fn schedule(&mut self, target: Target, delay: Duration, message: Message) {
        self.push_at(self.now + delay, target, message);
    }
}

/// State shared by the gateway, the strategies, the tracker and the metrics for one run
#[derive(Debug)]
pub struct SimulationContext {
    /// the episode's task arena, indexed by `TaskId`
    pub tasks: Vec<Task>,
    pub topology: Topology,
    pub jobs: JobConstraintTracker,
    pub network: NetworkModel,
    pub metrics: MetricsAggregator,
    /// placed tasks not yet released
    pub running: Vec<TaskId>,
    pub respect_job_constraints: bool,
}

impl SimulationContext {
    pub fn new(topology: Topology, network: NetworkModel, respect_job_constraints: bool) -> Self {
        Self {
            tasks: vec![],
            topology,
            jobs: Default::default(),
            network,
            metrics: MetricsAggregator::new(),
            running: vec![],
            respect_job_constraints,
        }
    }

    /// Fresh tasks, jobs and idle nodes for the next episode
    pub fn start_episode(&mut self, episode: usize, dataset: &Dataset) {
        self.tasks = dataset.tasks.clone();
        self.jobs = JobConstraintTracker::new(dataset.jobs.iter().cloned());
        self.topology.reset();
        self.running.clear();
        self.metrics.start_episode(episode);
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0]
    }

    /// Release every running task that finished by `now`, returns how many were released
    pub fn release_finished(&mut self, now: Time) -> usize {
        let Self {
            tasks,
            jobs,
            metrics,
            running,
            ..
        } = self;

        let before = running.len();
        running.retain(|id| {
            let task = &tasks[id.0];
            if task.is_finished_by(now) {
                jobs.remove_running(task);
                metrics.current_mut().record_completion(task);
                false
            } else {
                true
            }
        });
        let released = before - running.len();
        if released > 0 {
            debug!(%now, released, still_running = running.len(), "released finished tasks");
        }
        released
    }

    /// Final sweep and energy accounting of the episode
    pub fn finish_episode(&mut self, clock: Time) -> &EpisodeMetrics {
        self.release_finished(clock);
        self.metrics.finish_episode(clock, &self.topology)
    }
}

/// Runs the task on the node: it finishes after `length / mips`
fn run_on_datacenter(
    dc: DatacenterId,
    message: Message,
    ctx: &mut SimulationContext,
    kernel: &mut dyn Kernel,
) {
    match message {
        Message::TaskSubmit(msg::TaskSubmit { task, node }) => {
            let running = ctx.topology.node(node).running_time(ctx.task(task).length);
            debug!(%dc, %task, %node, %running, "task started");
            kernel.schedule(Target::Gateway, running, msg::TaskFinished { task, node }.into());
        }
        other => warn!(%dc, message = %other, "datacenter ignores message"),
    }
}

/// Run one episode until the end condition, returns the final clock
pub fn run_episode(
    ctx: &mut SimulationContext,
    gateway: &mut Gateway,
    policy: &mut dyn DecisionPolicy,
    until: EndCondition,
) -> Result<Time> {
    let mut queue = EventQueue::new();

    // pump in arrivals as events ahead of time
    for task in &ctx.tasks {
        queue.push_at(task.arrival, Target::Gateway, msg::TaskArrival { task: task.id }.into());
    }

    while let Some(event) = queue.pop(until) {
        trace!(%event, "handling event");
        match event.target {
            Target::Gateway => gateway.handle(event.message, ctx, policy, &mut queue)?,
            Target::Datacenter(dc) => run_on_datacenter(dc, event.message, ctx, &mut queue),
        }
    }

    // a time limit is simulated up to the limit, even when nothing happens near it
    if let EndCondition::Time(limit) = until {
        queue.advance_to(limit);
    }

    info!(
        clock = %queue.now(),
        events = queue.processed(),
        left = queue.len(),
        "episode simulated"
    );
    Ok(queue.now())
}
