use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::coding::Coding;
use crate::errors::CodingError;
use crate::store::{Id, Model};

/// The lifecycle status of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The job is waiting to be claimed.
    Enqueued,
    /// The job has been claimed by a worker and is executing.
    Dequeued,
    /// The job completed successfully. Terminal.
    Completed,
    /// The last attempt failed; the job will be retried once it becomes
    /// available again.
    Failed,
    /// The job has been cancelled. Terminal.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

/// A single entry in a job's append-only event log.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The job status after the event.
    pub status: JobStatus,
    /// An optional human readable reason.
    pub reason: String,
    /// The job progress at the time of the event.
    pub progress: f64,
}

/// The durable representation of a queued unit of work.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Job {
    /// The unique job id, assigned on creation.
    #[serde(rename = "_id")]
    pub id: Id,
    /// The task name, selecting the handler and payload schema.
    pub name: String,
    /// An optional label used together with a period for deduplicated
    /// enqueueing.
    pub label: String,
    /// The encoded payload.
    pub data: Vec<u8>,
    /// The current lifecycle status.
    pub status: JobStatus,
    /// When the job was created.
    pub created: DateTime<Utc>,
    /// The earliest time the job may be claimed.
    pub available: DateTime<Utc>,
    /// When the current or last attempt started.
    pub started: Option<DateTime<Utc>>,
    /// When the last attempt ended.
    pub ended: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished: Option<DateTime<Utc>>,
    /// The number of executed attempts.
    pub attempts: u32,
    /// The reported progress in `[0, 1]`.
    pub progress: f64,
    /// The ordered event log.
    pub events: Vec<JobEvent>,
    /// The encoded handler result, if any.
    pub result: Option<Vec<u8>>,
}

impl Model for Job {
    const COLLECTION: &'static str = "jobs";

    fn id(&self) -> Id {
        self.id
    }
}

impl Job {
    /// Create a freshly enqueued job.
    pub(crate) fn enqueued(
        name: String,
        label: String,
        data: Vec<u8>,
        now: DateTime<Utc>,
        available: DateTime<Utc>,
    ) -> Job {
        Job {
            id: Id::new(),
            name,
            label,
            data,
            status: JobStatus::Enqueued,
            created: now,
            available,
            started: None,
            ended: None,
            finished: None,
            attempts: 0,
            progress: 0.0,
            events: vec![JobEvent {
                timestamp: now,
                status: JobStatus::Enqueued,
                reason: String::new(),
                progress: 0.0,
            }],
            result: None,
        }
    }

    /// Append an event reflecting the current state.
    pub(crate) fn log(&mut self, timestamp: DateTime<Utc>, reason: impl Into<String>) {
        self.events.push(JobEvent {
            timestamp,
            status: self.status,
            reason: reason.into(),
            progress: self.progress,
        });
    }

    /// Decode the handler result using the given coding.
    pub fn decode_result<R: DeserializeOwned>(
        &self,
        coding: Coding,
    ) -> Result<Option<R>, CodingError> {
        match &self.result {
            Some(data) => Ok(Some(coding.unmarshal(data)?)),
            None => Ok(None),
        }
    }
}

/// The trait implemented by typed job payloads with a static task name.
///
/// Payloads for dynamically named tasks are enqueued through
/// [`Blueprint::named`](crate::Blueprint::named) instead.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The unique task name. This must be unique per queue.
    const NAME: &'static str;

    /// The payload coding used for this task.
    const CODING: Coding = Coding::Json;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_field_names() {
        let now = Utc::now();
        let mut job = Job::enqueued("test".into(), "label".into(), vec![1, 2], now, now);
        job.result = Some(vec![3]);

        let value = serde_json::to_value(&job).unwrap();
        let object = value.as_object().unwrap();

        for field in [
            "_id",
            "name",
            "label",
            "data",
            "status",
            "created",
            "available",
            "started",
            "ended",
            "finished",
            "attempts",
            "progress",
            "events",
            "result",
        ] {
            assert!(object.contains_key(field), "missing field {field:?}");
        }

        assert_eq!(object["status"], "enqueued");

        let event = value["events"][0].as_object().unwrap();
        for field in ["timestamp", "status", "reason", "progress"] {
            assert!(event.contains_key(field), "missing event field {field:?}");
        }
    }

    #[test]
    fn status_strings() {
        for (status, repr) in [
            (JobStatus::Enqueued, "\"enqueued\""),
            (JobStatus::Dequeued, "\"dequeued\""),
            (JobStatus::Completed, "\"completed\""),
            (JobStatus::Failed, "\"failed\""),
            (JobStatus::Cancelled, "\"cancelled\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), repr);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Enqueued.is_terminal());
        assert!(!JobStatus::Dequeued.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }
}
