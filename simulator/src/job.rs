use serde::{Deserialize, Serialize};

use crate::timer::Time;

/// One entry of a job trace. Trace times are whole seconds; the outcome
/// fields are filled in by the simulation in ticks and are set at most once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub submit_time: u64,
    /// Queueing time recorded in the trace.
    pub queue_time: u64,
    pub exec_time: u64,
    pub requested_units: u32,
    pub user: Option<String>,
    pub executable: Option<String>,

    #[serde(skip)]
    queue_delay: Option<Time>,
    #[serde(skip)]
    ran: bool,
    #[serde(skip)]
    stop_delay: Option<Time>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        submit_time: u64,
        queue_time: u64,
        exec_time: u64,
        requested_units: u32,
    ) -> Self {
        Self {
            id: id.into(),
            submit_time,
            queue_time,
            exec_time,
            requested_units,
            user: None,
            executable: None,
            queue_delay: None,
            ran: false,
            stop_delay: None,
        }
    }

    /// Instant at which the job's submission becomes actionable.
    pub fn due_time(&self) -> Time {
        self.submit_time * 1000
    }

    pub fn queue_delay(&self) -> Option<Time> {
        self.queue_delay
    }

    pub fn ran(&self) -> bool {
        self.ran
    }

    pub fn stop_delay(&self) -> Option<Time> {
        self.stop_delay
    }

    pub(crate) fn mark_started(&mut self, now: Time) {
        debug_assert!(self.queue_delay.is_none(), "job {} started twice", self.id);
        if self.queue_delay.is_none() {
            self.queue_delay = Some(now.saturating_sub(self.due_time()));
        }
    }

    pub(crate) fn mark_completed(&mut self, now: Time) {
        debug_assert!(!self.ran, "job {} completed twice", self.id);
        if !self.ran {
            self.ran = true;
            self.stop_delay = Some(now.saturating_sub(self.due_time()));
        }
    }
}
