use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};

use crate::config::DatasetConfig;
use crate::jobs::Job;
use crate::types::{Duration, JobId, Priority, Task, TaskId, Time};
use crate::utils::prelude::*;

const JOBS_FILE: &str = "Jobs.csv";
const TASKS_FILE: &str = "Tasks.csv";

// column indices
const JOB_ID: usize = 1;
const JOB_SUBMISSION: usize = 5;
const JOB_MAX_PARALLEL: usize = 19;
const JOB_GROUPS: usize = 21;

const TASK_ID: usize = 1;
const TASK_JOB: usize = 2;
const TASK_LENGTH: usize = 3;
const TASK_MEMORY: usize = 4;
const TASK_STORAGE: usize = 5;
const TASK_SUBMISSION: usize = 7;
const TASK_DEADLINE: usize = 9;
const TASK_PRIORITY: usize = 17;

/// Jobs and their tasks, tasks in arrival order of the file
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub jobs: Vec<Job>,
    pub tasks: Vec<Task>,
}

impl Dataset {
    /// Read `Jobs.csv` and `Tasks.csv` from the configured directory
    pub fn load(cfg: &DatasetConfig) -> Result<Self> {
        let _s = info_span!("dataset", path = %cfg.path.display()).entered();

        let jobs_path = cfg.path.join(JOBS_FILE);
        let tasks_path = cfg.path.join(TASKS_FILE);
        let job_rows = read_rows(&jobs_path)?;
        let task_rows = read_rows(&tasks_path)?;

        let mut jobs = Vec::with_capacity(job_rows.len());
        let mut tasks = Vec::with_capacity(task_rows.len());
        let mut task_rows = task_rows.into_iter().enumerate().peekable();
        let mut job_offset = 0.0;

        for (row, record) in job_rows.iter().enumerate() {
            let field = Field::new(&jobs_path, row, record);
            let id = JobId(field.parse(JOB_ID)?);
            job_offset += field.parse::<f64>(JOB_SUBMISSION)?;

            let groups: Vec<Vec<u64>> = serde_json::from_str(field.get(JOB_GROUPS)?)
                .map_err(|e| field.error(format!("co-scheduling groups: {}", e)))?;
            jobs.push(Job::new(id, field.parse(JOB_MAX_PARALLEL)?, groups));

            while let Some((row, record)) = task_rows.peek() {
                let field = Field::new(&tasks_path, *row, record);
                if JobId(field.parse(TASK_JOB)?) != id {
                    break;
                }

                let arrival = Time(job_offset + field.parse::<f64>(TASK_SUBMISSION)?);
                let level = field.parse(TASK_PRIORITY)?;
                let priority = Priority::new(level)
                    .ok_or_else(|| field.error(format!("priority {} is outside 1..={}", level, Priority::LEVELS)))?;

                tasks.push(Task {
                    id: TaskId(tasks.len()),
                    job: id,
                    local_id: field.parse(TASK_ID)?,
                    priority,
                    arrival,
                    deadline: arrival + Duration(field.parse(TASK_DEADLINE)?),
                    length: field.parse::<f64>(TASK_LENGTH)? * cfg.runtime_scale,
                    memory: field.parse(TASK_MEMORY)?,
                    storage: field.parse(TASK_STORAGE)?,
                    node: None,
                    decision_cost: Duration::ZERO,
                    start_processing: None,
                    finish: None,
                });
                task_rows.next();
            }
        }

        if let Some((row, record)) = task_rows.next() {
            let field = Field::new(&tasks_path, row, &record);
            return Err(field.error(format!(
                "task of job {} does not follow its job row",
                field.get(TASK_JOB)?
            )));
        }

        let name = cfg
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cfg.path.display().to_string());
        info!(%name, jobs = jobs.len(), tasks = tasks.len(), "dataset loaded");

        Ok(Self { name, jobs, tasks })
    }
}

fn read_rows(path: &Path) -> Result<Vec<StringRecord>> {
    if !path.is_file() {
        return Err(Error::malformed_dataset(path, "file not found"));
    }
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Typed access to the cells of one row
struct Field<'a> {
    path: &'a Path,
    row: usize,
    record: &'a StringRecord,
}

impl<'a> Field<'a> {
    fn new(path: &'a Path, row: usize, record: &'a StringRecord) -> Self {
        Self { path, row, record }
    }

    fn get(&self, column: usize) -> Result<&'a str> {
        self.record
            .get(column)
            .map(str::trim)
            .ok_or_else(|| self.error(format!("missing column {}", column)))
    }

    fn parse<T>(&self, column: usize) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(column)?;
        raw.parse()
            .map_err(|e: T::Err| self.error(format!("column {} `{}`: {}", column, raw, e)))
    }

    fn error(&self, reason: String) -> Error {
        // +2 for the header and 1-based rows
        Error::malformed_dataset(
            PathBuf::from(self.path),
            format!("row {}: {}", self.row + 2, reason),
        )
    }
}
