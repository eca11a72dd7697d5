use std::collections::HashMap;

use crate::types::{JobId, Task, TaskId};
use crate::utils::prelude::*;

/// Co-scheduling rules of one job
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub max_parallel: usize,
    /// groups of dataset-local task ids that may run together
    pub groups: Vec<Vec<u64>>,
    /// running tasks as `(arena id, dataset-local id)`
    running: Vec<(TaskId, u64)>,
}

impl Job {
    pub fn new(id: JobId, max_parallel: usize, groups: Vec<Vec<u64>>) -> Self {
        Self {
            id,
            max_parallel,
            groups,
            running: vec![],
        }
    }

    pub fn running(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.running.iter().map(|(id, _)| *id)
    }

    fn can_run(&self, local_id: u64) -> bool {
        if self.running.len() >= self.max_parallel {
            return false;
        }
        match self.groups.iter().find(|g| g.contains(&local_id)) {
            // grouped tasks only join a running set made of their own group
            Some(group) => self
                .running
                .iter()
                .all(|(_, running)| group.contains(running)),
            None => true,
        }
    }
}

/// Tracks which tasks of each job are running
#[derive(Debug, Default)]
pub struct JobConstraintTracker {
    jobs: HashMap<JobId, Job>,
}

impl JobConstraintTracker {
    pub fn new(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: jobs.into_iter().map(|j| (j.id, j)).collect(),
        }
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Tasks of unknown jobs are unconstrained
    pub fn can_run(&self, task: &Task) -> bool {
        self.jobs
            .get(&task.job)
            .map(|job| job.can_run(task.local_id))
            .unwrap_or(true)
    }

    pub fn add_running(&mut self, task: &Task) {
        if let Some(job) = self.jobs.get_mut(&task.job) {
            if job.running.iter().any(|(id, _)| *id == task.id) {
                return;
            }
            if job.running.len() >= job.max_parallel {
                warn!(%task, job.max_parallel, "job is already at its parallelism cap");
            }
            job.running.push((task.id, task.local_id));
        }
    }

    pub fn remove_running(&mut self, task: &Task) {
        if let Some(job) = self.jobs.get_mut(&task.job) {
            job.running.retain(|(id, _)| *id != task.id);
        }
    }
}
