use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use rustc_hash::FxHashSet;

use crate::{error::SimulationError, job::Job};

use super::generator::TraceGenerator;

pub trait JobFilter {
    fn accept(&self, job: &Job) -> bool;
}

/// Drops jobs listed as `IGNORED` in a previous run's log. Only lines whose
/// last word is `IGNORED` count; the job id is their second word.
pub struct IgnoreFilter {
    ids: FxHashSet<String>,
}

impl IgnoreFilter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SimulationError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, SimulationError> {
        let mut ids = FxHashSet::default();
        for line in reader.lines() {
            let line = line?;
            let words = line.split(' ').collect::<Vec<_>>();
            if words.len() >= 2 && words.last() == Some(&"IGNORED") {
                ids.insert(words[1].to_string());
            }
        }
        Ok(Self { ids })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl JobFilter for IgnoreFilter {
    fn accept(&self, job: &Job) -> bool {
        !self.ids.contains(&job.id)
    }
}

/// Keeps jobs that were running at `instant` (seconds) in the recorded trace.
pub struct RunningAt {
    pub instant: u64,
}

impl JobFilter for RunningAt {
    fn accept(&self, job: &Job) -> bool {
        let start = job.submit_time + job.queue_time;
        start <= self.instant && self.instant < start + job.exec_time
    }
}

pub struct FilteredTrace {
    inner: Box<dyn TraceGenerator>,
    filters: Vec<Box<dyn JobFilter>>,
}

impl FilteredTrace {
    pub fn new(inner: Box<dyn TraceGenerator>) -> Self {
        Self {
            inner,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn JobFilter>) -> Self {
        self.filters.push(filter);
        self
    }
}

impl TraceGenerator for FilteredTrace {
    fn get_jobs(&mut self) -> Result<Vec<Job>, SimulationError> {
        let mut jobs = self.inner.get_jobs()?;
        let before = jobs.len();
        jobs.retain(|job| self.filters.iter().all(|f| f.accept(job)));
        log::info!("trace filters kept {} of {} jobs", jobs.len(), before);
        Ok(jobs)
    }
}
