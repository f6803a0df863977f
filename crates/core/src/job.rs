//! Job entity and its lifecycle state machine.
//!
//! A job moves along `QUEUED -> STARTING -> STARTED -> FINISHED`, with
//! `KILLED` reachable from every non-terminal state. Terminal jobs can be
//! re-queued through [`Job::retried`]. Every mutation goes through a typed
//! transition so the store can apply it under one serializable transaction.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::resources::ResourceQuantity;

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Starting,
    Started,
    Finished,
    Killed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Starting => "STARTING",
            JobState::Started => "STARTED",
            JobState::Finished => "FINISHED",
            JobState::Killed => "KILLED",
        }
    }

    /// Whether this state can never be left by a broker event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Killed)
    }

    /// STARTING or STARTED: the job occupies cluster resources.
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Starting | JobState::Started)
    }

    /// The forward edges of the lifecycle graph. Re-queueing a terminal job
    /// is a separate, explicit operation and intentionally not listed here.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Starting)
                | (Starting, Started)
                | (Starting, Finished)
                | (Started, Finished)
                | (Queued, Killed)
                | (Starting, Killed)
                | (Started, Killed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "STARTING" => Ok(JobState::Starting),
            "STARTED" => Ok(JobState::Started),
            "FINISHED" => Ok(JobState::Finished),
            "KILLED" => Ok(JobState::Killed),
            other => Err(DomainError::Validation(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// A single execution request within an application.
///
/// Unknown JSON fields are preserved through `extra` so the persisted blob
/// stays forward-compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub appid: String,
    pub name: String,
    pub cmd: String,
    /// Lower value means more urgent.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Broker task identifier; assigned when the job leaves the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub state: JobState,
    pub resources: ResourceQuantity,
    /// Sandbox URL, when the broker reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Broker-supplied reason for a kill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub retry: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Create a freshly queued job. The id must be unique and monotonic;
    /// it is assigned by the caller at enqueue time.
    pub fn new(
        id: i64,
        appid: impl Into<String>,
        name: impl Into<String>,
        cmd: impl Into<String>,
        priority: i32,
        resources: ResourceQuantity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            appid: appid.into(),
            name: name.into(),
            cmd: cmd.into(),
            priority,
            tags: BTreeSet::new(),
            task_id: None,
            state: JobState::Queued,
            resources,
            url: None,
            exit_code: None,
            reason: None,
            retry: 0,
            scheduled: Some(now),
            started: None,
            finished: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// QUEUED -> STARTING: the planner picked this job for an offer.
    pub fn starting(
        &mut self,
        task_id: String,
        url: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_transition(JobState::Starting)?;
        self.task_id = Some(task_id);
        self.url = url;
        self.started = Some(now);
        self.state = JobState::Starting;
        Ok(())
    }

    /// STARTING -> STARTED: the broker confirmed the task is running.
    pub fn started(&mut self, url: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_transition(JobState::Started)?;
        if url.is_some() {
            self.url = url;
        }
        if self.started.is_none() {
            self.started = Some(now);
        }
        self.state = JobState::Started;
        Ok(())
    }

    /// STARTING|STARTED -> FINISHED: the task ran to completion.
    pub fn finished(&mut self, exit_code: i32, now: DateTime<Utc>) -> Result<()> {
        self.ensure_transition(JobState::Finished)?;
        self.exit_code = Some(exit_code);
        self.finished = Some(now);
        self.state = JobState::Finished;
        Ok(())
    }

    /// Any non-terminal state -> KILLED.
    pub fn killed(&mut self, reason: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_transition(JobState::Killed)?;
        self.reason = reason;
        self.finished = Some(now);
        self.state = JobState::Killed;
        Ok(())
    }

    /// FINISHED|KILLED -> QUEUED: re-queue a terminal job for another run.
    /// Bumps the retry counter and clears everything the previous run set.
    pub fn retried(&mut self) -> Result<()> {
        if !self.state.is_terminal() {
            return Err(DomainError::illegal_transition(self.state, JobState::Queued));
        }
        self.retry += 1;
        self.task_id = None;
        self.url = None;
        self.exit_code = None;
        self.reason = None;
        self.started = None;
        self.finished = None;
        self.state = JobState::Queued;
        Ok(())
    }

    /// STARTING -> QUEUED: compensation when the broker rejected the launch.
    /// Not part of the forward lifecycle graph.
    pub fn revert_launch(&mut self) -> Result<()> {
        if self.state != JobState::Starting {
            return Err(DomainError::illegal_transition(self.state, JobState::Queued));
        }
        self.task_id = None;
        self.url = None;
        self.started = None;
        self.state = JobState::Queued;
        Ok(())
    }

    fn ensure_transition(&self, next: JobState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::illegal_transition(self.state, next))
        }
    }
}

/// A typed lifecycle transition, applied by the store inside a single
/// serializable transaction. This replaces passing closures into the
/// persistence layer.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    Starting {
        task_id: String,
        url: Option<String>,
    },
    Started {
        url: Option<String>,
    },
    Finished {
        exit_code: i32,
    },
    Killed {
        reason: Option<String>,
    },
    Retried,
    RevertLaunch,
}

impl JobTransition {
    /// Apply this transition to `job`, stamping `now` where the lifecycle
    /// requires a timestamp. On error the job is left untouched.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) -> Result<()> {
        match self {
            JobTransition::Starting { task_id, url } => {
                job.starting(task_id.clone(), url.clone(), now)
            }
            JobTransition::Started { url } => job.started(url.clone(), now),
            JobTransition::Finished { exit_code } => job.finished(*exit_code, now),
            JobTransition::Killed { reason } => job.killed(reason.clone(), now),
            JobTransition::Retried => job.retried(),
            JobTransition::RevertLaunch => job.revert_launch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job() -> Job {
        Job::new(
            1,
            "app1",
            "test-job",
            "echo hello",
            0,
            ResourceQuantity::new(2, 512),
            Utc::now(),
        )
    }

    #[test]
    fn full_lifecycle_to_finished() {
        let mut job = queued_job();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.task_id.is_none());

        job.starting("task-1".to_string(), None, Utc::now()).unwrap();
        assert_eq!(job.state, JobState::Starting);
        assert_eq!(job.task_id.as_deref(), Some("task-1"));
        assert!(job.started.is_some());

        job.started(Some("http://sandbox".to_string()), Utc::now())
            .unwrap();
        assert_eq!(job.state, JobState::Started);
        assert_eq!(job.url.as_deref(), Some("http://sandbox"));

        job.finished(0, Utc::now()).unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.exit_code, Some(0));
        assert!(job.finished.is_some());
        assert!(job.is_terminal());
    }

    #[test]
    fn killed_from_every_non_terminal_state() {
        let mut queued = queued_job();
        queued.killed(Some("by admin".to_string()), Utc::now()).unwrap();
        assert_eq!(queued.state, JobState::Killed);
        assert!(queued.finished.is_some());

        let mut starting = queued_job();
        starting.starting("t".to_string(), None, Utc::now()).unwrap();
        starting.killed(None, Utc::now()).unwrap();
        assert_eq!(starting.state, JobState::Killed);

        let mut started = queued_job();
        started.starting("t".to_string(), None, Utc::now()).unwrap();
        started.started(None, Utc::now()).unwrap();
        started.killed(None, Utc::now()).unwrap();
        assert_eq!(started.state, JobState::Killed);
    }

    #[test]
    fn illegal_transitions_leave_state_unchanged() {
        let mut job = queued_job();

        // Cannot report STARTED or FINISHED straight from the queue.
        assert!(job.started(None, Utc::now()).is_err());
        assert!(job.finished(0, Utc::now()).is_err());
        assert_eq!(job.state, JobState::Queued);
        assert!(job.exit_code.is_none());

        job.starting("t".to_string(), None, Utc::now()).unwrap();
        job.finished(1, Utc::now()).unwrap();

        // Terminal jobs reject everything but an explicit retry.
        assert!(job.started(None, Utc::now()).is_err());
        assert!(job.killed(None, Utc::now()).is_err());
        assert_eq!(job.state, JobState::Finished);
    }

    #[test]
    fn retried_clears_previous_run() {
        let mut job = queued_job();
        job.starting("t".to_string(), Some("url".to_string()), Utc::now())
            .unwrap();
        job.started(None, Utc::now()).unwrap();
        job.finished(42, Utc::now()).unwrap();

        job.retried().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry, 1);
        assert!(job.task_id.is_none());
        assert!(job.url.is_none());
        assert!(job.exit_code.is_none());
        assert!(job.started.is_none());
        assert!(job.finished.is_none());
    }

    #[test]
    fn retried_rejects_non_terminal_jobs() {
        let mut job = queued_job();
        assert!(job.retried().is_err());
        job.starting("t".to_string(), None, Utc::now()).unwrap();
        assert!(job.retried().is_err());
        assert_eq!(job.retry, 0);
    }

    #[test]
    fn revert_launch_only_from_starting() {
        let mut job = queued_job();
        assert!(job.revert_launch().is_err());

        job.starting("t".to_string(), None, Utc::now()).unwrap();
        job.revert_launch().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.task_id.is_none());
        assert!(job.started.is_none());

        job.starting("t2".to_string(), None, Utc::now()).unwrap();
        job.started(None, Utc::now()).unwrap();
        assert!(job.revert_launch().is_err());
    }

    #[test]
    fn transitions_apply_through_the_typed_enum() {
        let mut job = queued_job();
        JobTransition::Starting {
            task_id: "t".to_string(),
            url: None,
        }
        .apply(&mut job, Utc::now())
        .unwrap();
        JobTransition::Started { url: None }
            .apply(&mut job, Utc::now())
            .unwrap();
        JobTransition::Finished { exit_code: 0 }
            .apply(&mut job, Utc::now())
            .unwrap();
        assert_eq!(job.state, JobState::Finished);

        let err = JobTransition::Started { url: None }
            .apply(&mut job, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::illegal_transition(JobState::Finished, JobState::Started)
        );
    }

    #[test]
    fn state_parses_and_displays_symmetrically() {
        for state in [
            JobState::Queued,
            JobState::Starting,
            JobState::Started,
            JobState::Finished,
            JobState::Killed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<JobState>().is_err());
    }

    #[test]
    fn json_round_trip_preserves_unknown_fields() {
        let encoded = serde_json::json!({
            "id": 7,
            "appid": "app1",
            "name": "n",
            "cmd": "true",
            "priority": 3,
            "state": "QUEUED",
            "resources": {"cpu": 1, "memMB": 128, "gpu": 0, "ports": 0},
            "attributes": {"rack": "r13"},
            "grace_period": 30
        });

        let job: Job = serde_json::from_value(encoded.clone()).unwrap();
        assert_eq!(job.extra["attributes"]["rack"], "r13");
        assert_eq!(job.extra["grace_period"], 30);

        let reencoded = serde_json::to_value(&job).unwrap();
        assert_eq!(reencoded["attributes"], encoded["attributes"]);
        assert_eq!(reencoded["grace_period"], encoded["grace_period"]);

        let decoded: Job = serde_json::from_value(reencoded).unwrap();
        assert_eq!(decoded, job);
    }
}
