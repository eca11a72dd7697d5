use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Deref, Sub};

use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::nodes::NodeId;
use crate::utils::float::total_cmp;

/// A time point in simulation
#[derive(Debug, Clone, Copy, PartialEq, Default, Display, Serialize, Deserialize)]
#[display("{0:.3}")]
pub struct Time(pub f64);

/// A duration of time in simulation
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Display, Serialize, Deserialize)]
#[display("{0:.3}")]
pub struct Duration(pub f64);

impl Time {
    pub const ZERO: Time = Time(0.0);
}

impl Duration {
    pub const ZERO: Duration = Duration(0.0);
}

// events are ordered by time, so Time needs a total order
impl Eq for Time {}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        total_cmp(&self.0, &other.0)
    }
}

impl Deref for Time {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for Duration {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Self::Output {
        Time(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration(self.0 + rhs.0)
    }
}

impl Sub for Time {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        Duration(self.0 - rhs.0)
    }
}

/// Index of a task in the episode's task arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[display("T{0}")]
pub struct TaskId(pub usize);

/// Job id as found in the dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[display("J{0}")]
pub struct JobId(pub u64);

/// Task priority, 1 (lowest) to 5 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[display("P{0}")]
pub struct Priority(pub u8);

impl Priority {
    pub const LEVELS: u8 = 5;

    pub fn new(level: u8) -> Option<Self> {
        if (1..=Self::LEVELS).contains(&level) {
            Some(Self(level))
        } else {
            None
        }
    }

    pub fn all() -> impl Iterator<Item = Priority> {
        (1..=Self::LEVELS).map(Priority)
    }

    /// `priority / 5`, the reward weight
    pub fn weight(self) -> f64 {
        f64::from(self.0) / f64::from(Self::LEVELS)
    }
}

/// A unit of work with a deadline
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub job: JobId,
    /// task id inside the dataset, the one co-scheduling groups refer to
    pub local_id: u64,
    pub priority: Priority,
    pub arrival: Time,
    /// deadline, absolute
    pub deadline: Time,
    /// compute demand in million instructions
    pub length: f64,
    pub memory: f64,
    /// storage demand, also the amount of data moved to the node
    pub storage: f64,

    pub node: Option<NodeId>,
    pub decision_cost: Duration,
    pub start_processing: Option<Time>,
    pub finish: Option<Time>,
}

impl Task {
    /// The slack the task originally had
    pub fn max_window(&self) -> Duration {
        self.deadline - self.arrival
    }

    pub fn is_finished_by(&self, time: Time) -> bool {
        self.finish.map(|f| f <= time).unwrap_or(false)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task({}, {}, {}, @{}<{:.2}<{})",
            self.id, self.job, self.priority, self.arrival, self.length, self.deadline
        )
    }
}
