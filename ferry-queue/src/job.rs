//! The relay job record and its envelopes.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Protocol used when a job does not name one.
pub const DEFAULT_PROTOCOL: &str = "esmtp";

/// Stable handle for a queued job.
///
/// A ULID, so ids sort by creation time and never collide in practice. It is
/// assigned once at creation and survives manual retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(ulid::Ulid);

impl JobId {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ulid::Ulid::from_string(s.trim()).map(Self)
    }
}

impl Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where an envelope's message content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Content still in memory. Never persisted in queue state; the body
    /// store swaps it for [`MessageBody::Stored`] before a job is queued.
    Inline(Vec<u8>),
    /// Content already written to disk.
    Stored(PathBuf),
}

impl MessageBody {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Inline(_) => None,
            Self::Stored(path) => Some(path),
        }
    }
}

/// One sender, its recipients, and the message they receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Reverse path. Empty for the null sender (`MAIL FROM:<>`).
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: MessageBody,
}

impl Envelope {
    #[must_use]
    pub fn new(sender: impl Into<String>, recipients: Vec<String>, body: MessageBody) -> Self {
        Self {
            sender: sender.into(),
            recipients,
            body,
        }
    }

    /// `true` for `MAIL FROM:<>`, which must never be bounced.
    #[must_use]
    pub fn has_null_sender(&self) -> bool {
        let sender = self.sender.trim();
        sender.is_empty() || sender == "<>"
    }

    fn validate(&self, index: usize) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(QueueError::InvalidJob(format!(
                "envelope {index} has no recipients"
            )));
        }

        if !self.has_null_sender() {
            check_address(&self.sender).map_err(|reason| {
                QueueError::InvalidJob(format!("envelope {index} sender: {reason}"))
            })?;
        }

        for recipient in &self.recipients {
            check_address(recipient).map_err(|reason| {
                QueueError::InvalidJob(format!("envelope {index} recipient: {reason}"))
            })?;
        }

        if let MessageBody::Stored(path) = &self.body
            && path.as_os_str().is_empty()
        {
            return Err(QueueError::InvalidJob(format!(
                "envelope {index} has an empty body path"
            )));
        }

        Ok(())
    }
}

/// Exactly one mailbox, e.g. `user@example.com` or `Name <user@example.com>`.
fn check_address(address: &str) -> std::result::Result<(), String> {
    let parsed = mailparse::addrparse(address).map_err(|e| format!("{address:?}: {e}"))?;

    match parsed.extract_single_info() {
        Some(info) if info.addr.contains('@') => Ok(()),
        _ => Err(format!("{address:?} is not a single mailbox")),
    }
}

/// A pending relay of one or more envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayJob {
    pub id: JobId,
    pub payload: Vec<Envelope>,
    /// Delivery route, matched case-insensitively.
    pub protocol: String,
    /// Destination mailbox for local delivery routes.
    pub mailbox: Option<String>,
    /// Delivery attempts made so far, automatic and manual.
    pub attempt_count: u32,
    /// Epoch seconds of the latest attempt.
    pub last_attempt_at: Option<u64>,
    /// Epoch seconds at creation.
    pub enqueued_at: u64,
    /// Set by a manual retry: the next tick ignores the backoff wait.
    #[serde(default)]
    pub forced: bool,
}

impl RelayJob {
    #[must_use]
    pub fn new(payload: Vec<Envelope>, protocol: impl Into<String>, enqueued_at: u64) -> Self {
        Self {
            id: JobId::generate(),
            payload,
            protocol: protocol.into(),
            mailbox: None,
            attempt_count: 0,
            last_attempt_at: None,
            enqueued_at,
            forced: false,
        }
    }

    #[must_use]
    pub fn with_mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }

    /// Structural checks. Does not touch the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.payload.is_empty() {
            return Err(QueueError::InvalidJob("job has no envelopes".into()));
        }

        if self.protocol.trim().is_empty() {
            return Err(QueueError::InvalidJob("protocol must not be empty".into()));
        }

        if let Some(mailbox) = &self.mailbox
            && mailbox.trim().is_empty()
        {
            return Err(QueueError::InvalidJob("mailbox must not be empty".into()));
        }

        self.payload
            .iter()
            .enumerate()
            .try_for_each(|(index, envelope)| envelope.validate(index))
    }

    /// Validation for queue state: bodies must already be on disk.
    pub(crate) fn validate_for_queue(&self) -> Result<()> {
        self.validate()?;

        if self
            .payload
            .iter()
            .any(|envelope| matches!(envelope.body, MessageBody::Inline(_)))
        {
            return Err(QueueError::InvalidJob(
                "message bodies must be stored before queueing".into(),
            ));
        }

        Ok(())
    }

    /// The attempt transition used by the worker after a failed delivery.
    pub fn record_attempt(&mut self, now: u64) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.forced = false;
    }

    /// The attempt transition used by an operator retry.
    pub fn force_retry(&mut self, now: u64) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.forced = true;
    }

    pub fn body_paths(&self) -> impl Iterator<Item = &Path> {
        self.payload.iter().filter_map(|envelope| envelope.body.path())
    }

    #[must_use]
    pub fn recipient_count(&self) -> usize {
        self.payload.iter().map(|e| e.recipients.len()).sum()
    }
}

/// Number of jobs per attempt count, ordered by attempt count.
#[must_use]
pub fn retry_histogram<'a>(jobs: impl IntoIterator<Item = &'a RelayJob>) -> BTreeMap<u32, usize> {
    jobs.into_iter().fold(BTreeMap::new(), |mut histogram, job| {
        *histogram.entry(job.attempt_count).or_default() += 1;
        histogram
    })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn stored(sender: &str, recipients: &[&str]) -> Envelope {
        Envelope::new(
            sender,
            recipients.iter().map(ToString::to_string).collect(),
            MessageBody::Stored(PathBuf::from("/var/spool/ferry/queue/abc.eml")),
        )
    }

    #[test]
    fn id_round_trips_through_text() {
        let id = JobId::generate();
        let parsed: JobId = id.to_string().parse().expect("valid ulid");
        assert_eq!(parsed, id);
        assert!("../etc/passwd".parse::<JobId>().is_err());
    }

    #[test]
    fn new_job_starts_fresh() {
        let job = RelayJob::new(vec![stored("a@example.com", &["b@example.org"])], "esmtp", 7);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.last_attempt_at, None);
        assert_eq!(job.enqueued_at, 7);
        assert!(!job.forced);
        assert!(job.validate_for_queue().is_ok());
    }

    #[test]
    fn rejects_empty_payload() {
        let job = RelayJob::new(vec![], "esmtp", 0);
        assert!(matches!(job.validate(), Err(QueueError::InvalidJob(_))));
    }

    #[test]
    fn rejects_envelope_without_recipients() {
        let job = RelayJob::new(vec![stored("a@example.com", &[])], "esmtp", 0);
        let err = job.validate().expect_err("no recipients");
        assert!(err.to_string().contains("no recipients"));
    }

    #[test]
    fn rejects_garbage_addresses() {
        let job = RelayJob::new(vec![stored("a@example.com", &["not an address"])], "esmtp", 0);
        assert!(job.validate().is_err());

        let job = RelayJob::new(
            vec![stored("a@example.com", &["a@example.com, b@example.com"])],
            "esmtp",
            0,
        );
        assert!(job.validate().is_err(), "lists are not a single mailbox");
    }

    #[test]
    fn accepts_null_sender_and_display_names() {
        let job = RelayJob::new(
            vec![
                stored("", &["Someone <someone@example.org>"]),
                stored("<>", &["x@example.org"]),
            ],
            "esmtp",
            0,
        );
        assert!(job.validate().is_ok());
        assert!(job.payload.iter().all(Envelope::has_null_sender));
    }

    #[test]
    fn inline_bodies_are_not_queueable() {
        let job = RelayJob::new(
            vec![Envelope::new(
                "a@example.com",
                vec!["b@example.org".into()],
                MessageBody::Inline(b"Subject: hi\r\n\r\nbody".to_vec()),
            )],
            "esmtp",
            0,
        );
        assert!(job.validate().is_ok());
        assert!(job.validate_for_queue().is_err());
    }

    #[test]
    fn rejects_blank_protocol() {
        let job = RelayJob::new(vec![stored("a@example.com", &["b@example.org"])], "  ", 0);
        assert!(job.validate().is_err());
    }

    #[test]
    fn attempt_transitions() {
        let mut job = RelayJob::new(vec![stored("a@example.com", &["b@example.org"])], "esmtp", 0);

        job.force_retry(10);
        assert_eq!((job.attempt_count, job.last_attempt_at, job.forced), (1, Some(10), true));

        job.record_attempt(20);
        assert_eq!((job.attempt_count, job.last_attempt_at, job.forced), (2, Some(20), false));
    }

    #[test]
    fn histogram_counts_by_attempt() {
        let base = RelayJob::new(vec![stored("a@example.com", &["b@example.org"])], "esmtp", 0);
        let jobs: Vec<RelayJob> = [0, 0, 1, 2, 2, 2]
            .into_iter()
            .map(|attempts| RelayJob {
                id: JobId::generate(),
                attempt_count: attempts,
                ..base.clone()
            })
            .collect();

        let histogram = retry_histogram(&jobs);
        assert_eq!(histogram, BTreeMap::from([(0, 2), (1, 1), (2, 3)]));
        assert!(retry_histogram(&Vec::<RelayJob>::new()).is_empty());
    }
}
