use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::SimulationError, job::Job};

use super::generator::TraceGenerator;

#[derive(Debug, Serialize, Deserialize)]
struct TraceRecord {
    id: String,
    submit: i64,
    queue: i64,
    exec: i64,
    nprocs: i64,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    executable: Option<String>,
}

/// Reads `id,submit,queue,exec,nprocs[,user,executable]` records, keeping the
/// ones whose position falls in `[from, to)`.
pub struct CsvTraceReader {
    path: PathBuf,
    from: usize,
    to: Option<usize>,
}

impl CsvTraceReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            from: 0,
            to: None,
        }
    }

    pub fn with_range(mut self, from: usize, to: Option<usize>) -> Self {
        self.from = from;
        self.to = to;
        self
    }
}

impl TraceGenerator for CsvTraceReader {
    fn get_jobs(&mut self) -> Result<Vec<Job>, SimulationError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)?;

        let mut jobs = Vec::new();
        for (index, record) in reader.deserialize().enumerate() {
            if self.to.is_some_and(|to| index >= to) {
                break;
            }
            let record: TraceRecord = record?;
            if index < self.from {
                continue;
            }
            if record.submit < 0 || record.exec < 0 {
                log::warn!(
                    "{}: job {} has no usable submit/exec time, skipped",
                    self.path.display(),
                    record.id
                );
                continue;
            }

            let mut job = Job::new(
                record.id,
                record.submit as u64,
                record.queue.max(0) as u64,
                record.exec as u64,
                record.nprocs.max(1) as u32,
            );
            job.user = record.user.filter(|u| !u.is_empty());
            job.executable = record.executable.filter(|e| !e.is_empty());
            jobs.push(job);
        }

        log::info!("{}: loaded {} jobs", self.path.display(), jobs.len());
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn trace_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_reads_records_in_range() {
        let file = trace_file(
            "id,submit,queue,exec,nprocs,user,executable
a,0,1,10,4,alice,sim
b,5,0,20,0,,
c,7,2,30,2,bob,
d,9,0,40,1,bob,ls
",
        );

        let jobs = CsvTraceReader::new(file.path()).get_jobs().unwrap();
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[0].user.as_deref(), Some("alice"));
        assert_eq!(jobs[1].requested_units, 1);
        assert_eq!(jobs[1].user, None);

        let jobs = CsvTraceReader::new(file.path())
            .with_range(1, Some(3))
            .get_jobs()
            .unwrap();
        let ids = jobs.iter().map(|j| j.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(jobs[1].exec_time, 30);
        assert_eq!(jobs[1].due_time(), 7000);
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        let file = trace_file("id,submit,queue,exec,nprocs\na,zero,0,1,1\n");
        assert!(matches!(
            CsvTraceReader::new(file.path()).get_jobs(),
            Err(SimulationError::Csv(_))
        ));
    }
}
