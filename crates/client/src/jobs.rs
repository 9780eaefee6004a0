//! Generation job tracking
//!
//! Folds the envelopes of one channel into per-job state keyed by
//! `requestId` (or `id`). The fold itself is a pure function so it can be
//! tested without a store.

use std::collections::BTreeMap;
use std::sync::Arc;

use genstream_protocol::{Envelope, EnvelopeKind};
use parking_lot::Mutex;
use serde::Serialize;

use crate::handler::EventHandler;

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running { progress: Option<f64> },
    Completed { url: Option<String> },
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running { .. } => "running",
            JobState::Completed { .. } => "completed",
            JobState::Failed { .. } => "failed",
        }
    }

    fn progress(&self) -> Option<f64> {
        match self {
            JobState::Running { progress } => *progress,
            JobState::Completed { .. } => Some(100.0),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Next state for a job after `envelope`, or `None` if it does not change.
/// Terminal states never change and progress never moves backwards.
pub fn next_state(current: &JobState, envelope: &Envelope) -> Option<JobState> {
    if current.is_terminal() {
        return None;
    }

    let next = match &envelope.kind {
        EnvelopeKind::Progress => JobState::Running {
            progress: max_progress(current.progress(), envelope.progress_percent()),
        },
        EnvelopeKind::Status => match envelope.status.as_deref() {
            Some("completed" | "succeeded" | "done") => JobState::Completed {
                url: envelope.url.clone(),
            },
            Some("failed" | "error" | "cancelled") => JobState::Failed {
                error: envelope
                    .error_message()
                    .unwrap_or_else(|| "generation failed".to_string()),
            },
            Some("pending" | "queued") if *current == JobState::Pending => JobState::Pending,
            _ => JobState::Running {
                progress: max_progress(current.progress(), envelope.progress_percent()),
            },
        },
        EnvelopeKind::Finish | EnvelopeKind::Completed => JobState::Completed {
            url: envelope.url.clone(),
        },
        EnvelopeKind::Error => JobState::Failed {
            error: envelope
                .error_message()
                .unwrap_or_else(|| "unknown error".to_string()),
        },
        EnvelopeKind::Connected | EnvelopeKind::Other(_) => return None,
    };

    (next != *current).then_some(next)
}

fn max_progress(current: Option<f64>, incoming: Option<f64>) -> Option<f64> {
    match (current, incoming) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

// ---------------------------------------------------------------------------
// JobTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub key: String,
    #[serde(flatten)]
    pub state: JobState,
    /// Envelopes that changed this job.
    pub updates: u64,
}

/// Shared job table. Clones observe the same jobs.
#[derive(Debug, Clone, Default)]
pub struct JobTracker {
    jobs: Arc<Mutex<BTreeMap<String, Job>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one envelope. Returns the job's new state if it changed.
    pub fn observe(&self, envelope: &Envelope) -> Option<JobState> {
        let key = envelope.job_key()?;
        let mut jobs = self.jobs.lock();
        let job = jobs.entry(key.to_string()).or_insert_with(|| Job {
            key: key.to_string(),
            state: JobState::Pending,
            updates: 0,
        });
        let next = next_state(&job.state, envelope)?;
        job.state = next.clone();
        job.updates += 1;
        Some(next)
    }

    /// A handler that feeds this tracker.
    pub fn handler(&self) -> EventHandler {
        let tracker = self.clone();
        EventHandler::from_fn(move |envelope| {
            tracker.observe(envelope);
        })
    }

    pub fn get(&self, key: &str) -> Option<Job> {
        self.jobs.lock().get(key).cloned()
    }

    /// All jobs ordered by key.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
