use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Status of a capture job as persisted and reported by `/stats`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Success,
    #[serde(rename = "fail")]
    #[strum(serialize = "fail")]
    Failed,
}

/// Lifecycle state of a job. Each variant carries exactly the data valid for
/// it, so a record can only ever be `(Pending, "", [])`, `(Success, "", bytes)`
/// or `(Failed, message, [])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Success { payload: Vec<u8> },
    Failed { message: String },
}

/// A capture job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: Uuid,
    pub state: JobState,
    /// Set once at creation; the only eviction criterion.
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// New pending record with a fresh v4 identifier. The creation time is
    /// kept at millisecond precision, the resolution the store persists.
    pub fn pending() -> Self {
        Self::pending_at(Uuid::new_v4(), Utc::now().trunc_subsecs(3))
    }

    pub fn pending_at(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: JobState::Pending,
            created_at,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Success { .. } => JobStatus::Success,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Error text; empty unless the job failed.
    pub fn message(&self) -> &str {
        match &self.state {
            JobState::Failed { message } => message,
            _ => "",
        }
    }

    /// Image bytes; empty unless the job succeeded.
    pub fn payload(&self) -> &[u8] {
        match &self.state {
            JobState::Success { payload } => payload,
            _ => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, JobState::Pending)
    }

    /// Transition `Pending -> Success`. The payload must not be empty.
    pub fn succeed(&mut self, payload: Vec<u8>) -> Result<(), JobError> {
        if payload.is_empty() {
            return Err(JobError::EmptyPayload { id: self.id });
        }
        self.transition(JobState::Success { payload })
    }

    /// Transition `Pending -> Failed`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobState::Failed {
            message: message.into(),
        })
    }

    fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if self.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id: self.id,
                status: self.status(),
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {id} is already terminal ({status})")]
    AlreadyTerminal { id: Uuid, status: JobStatus },

    #[error("job {id} cannot succeed without image bytes")]
    EmptyPayload { id: Uuid },
}
