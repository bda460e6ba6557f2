//! Request and response shapes of the management operations.
//!
//! Everything is camelCase on the wire so the same documents work for a JSON
//! API and the command line.

use std::{collections::BTreeMap, path::PathBuf};

use ferry_common::operator;
use ferry_delivery::SchedulerStatus;
use ferry_queue::{Envelope, JobId, MessageBody, RelayJob};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// A relay job as submitted for queueing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub envelopes: Vec<EnvelopeRequest>,

    /// Delivery protocol; the queue's default when absent.
    #[serde(default)]
    pub protocol: Option<String>,

    /// Local mailbox to deliver into instead of relaying.
    #[serde(default)]
    pub mailbox: Option<String>,
}

/// One envelope. The message comes either inline as `body` or from a file at
/// `bodyPath`, which is moved into the queue's body store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeRequest {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_path: Option<PathBuf>,
}

impl EnvelopeRequest {
    pub fn into_envelope(self) -> Result<Envelope> {
        let body = match (self.body, self.body_path) {
            (Some(text), None) => MessageBody::Inline(text.into_bytes()),
            (None, Some(path)) => MessageBody::Stored(path),
            (Some(_), Some(_)) => {
                return Err(ControlError::InvalidRequest(
                    "envelope has both `body` and `bodyPath`".into(),
                ));
            }
            (None, None) => {
                return Err(ControlError::InvalidRequest(
                    "envelope needs `body` or `bodyPath`".into(),
                ));
            }
        };

        Ok(Envelope::new(self.sender, self.recipients, body))
    }
}

/// The jobs a delete, retry or bounce applies to: `{"id": ..}` or
/// `{"ids": [..]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetIds {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ids: Option<Vec<String>>,
}

impl TargetIds {
    #[must_use]
    pub fn one(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ids: None,
        }
    }

    #[must_use]
    pub fn many<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Parsed, de-duplicated ids in request order. Strings that are not job
    /// ids cannot name a queued job, so they are dropped.
    pub fn resolve(&self) -> Result<Vec<JobId>> {
        if self.id.is_none() && self.ids.is_none() {
            return Err(ControlError::MissingTarget);
        }

        let mut resolved: Vec<JobId> = Vec::new();
        for raw in self.id.iter().chain(self.ids.iter().flatten()) {
            match raw.parse::<JobId>() {
                Ok(id) if !resolved.contains(&id) => resolved.push(id),
                Ok(_) => {}
                Err(_) => operator!(level = DEBUG, "Ignoring malformed job id {raw:?}"),
            }
        }

        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ListQuery {
    /// 1-based.
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Queued,
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeSummary {
    pub sender: String,
    pub recipients: Vec<String>,
    /// `None` for a body that has not been written to the store.
    pub body_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub protocol: String,
    pub mailbox: Option<String>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<u64>,
    pub enqueued_at: u64,
    pub envelopes: Vec<EnvelopeSummary>,
}

impl From<&RelayJob> for JobSummary {
    fn from(job: &RelayJob) -> Self {
        Self {
            id: job.id.to_string(),
            protocol: job.protocol.clone(),
            mailbox: job.mailbox.clone(),
            attempt_count: job.attempt_count,
            last_attempt_at: job.last_attempt_at,
            enqueued_at: job.enqueued_at,
            envelopes: job
                .payload
                .iter()
                .map(|envelope| EnvelopeSummary {
                    sender: envelope.sender.clone(),
                    recipients: envelope.recipients.clone(),
                    body_path: envelope.body.path().map(PathBuf::from),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub status: Status,
    pub queue_size: usize,
    /// The job as queued.
    pub session: JobSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
    pub items: Vec<JobSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub status: Status,
    pub deleted_count: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub status: Status,
    pub retried_count: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BounceResponse {
    pub status: Status,
    pub bounced_count: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub queue_size: usize,
    /// Attempt count to number of jobs.
    pub retry_histogram: BTreeMap<u32, usize>,
    pub scheduler: SchedulerStatus,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn targets_accept_either_form() {
        let id = JobId::generate();

        let single: TargetIds = serde_json::from_value(json!({ "id": id.to_string() })).unwrap();
        assert_eq!(single.resolve().unwrap(), vec![id]);

        let many: TargetIds =
            serde_json::from_value(json!({ "ids": [id.to_string(), id.to_string()] })).unwrap();
        assert_eq!(many.resolve().unwrap(), vec![id]);

        let neither: TargetIds = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(neither.resolve(), Err(ControlError::MissingTarget)));
    }

    #[test]
    fn malformed_ids_are_dropped() {
        let targets = TargetIds::many(["not-a-ulid", ""]);
        assert_eq!(targets.resolve().unwrap(), Vec::<JobId>::new());
    }

    #[test]
    fn envelope_needs_exactly_one_body() {
        let both = EnvelopeRequest {
            body: Some("x".into()),
            body_path: Some("/tmp/x.eml".into()),
            ..EnvelopeRequest::default()
        };
        assert!(matches!(both.into_envelope(), Err(ControlError::InvalidRequest(_))));
        assert!(matches!(
            EnvelopeRequest::default().into_envelope(),
            Err(ControlError::InvalidRequest(_))
        ));
    }

    #[test]
    fn enqueue_request_is_camel_case() {
        let request: EnqueueRequest = serde_json::from_value(json!({
            "protocol": "lmtp",
            "mailbox": "inbox",
            "envelopes": [{
                "sender": "a@example.org",
                "recipients": ["b@example.com"],
                "bodyPath": "/var/spool/incoming/1.eml",
            }],
        }))
        .unwrap();

        assert_eq!(request.protocol.as_deref(), Some("lmtp"));
        let envelope = request.envelopes[0].clone().into_envelope().unwrap();
        assert_eq!(
            envelope.body,
            MessageBody::Stored(PathBuf::from("/var/spool/incoming/1.eml"))
        );
    }

    #[test]
    fn status_is_upper_case() {
        assert_eq!(serde_json::to_value(Status::Queued).unwrap(), json!("QUEUED"));
        assert_eq!(serde_json::to_value(Status::Ok).unwrap(), json!("OK"));
    }
}
