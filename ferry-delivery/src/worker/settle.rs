//! Turning one attempt's result into the job's next state.

use std::{collections::HashSet, path::PathBuf};

use ferry_queue::{Envelope, RelayJob};

use crate::{
    agent::{DeliveryReport, EnvelopeOutcome},
    error::DeliveryError,
};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Every envelope went through; the job leaves the queue.
    Delivered { bodies: Vec<PathBuf> },
    /// Something is still pending. `remaining` holds the envelopes to try
    /// again, narrowed to their failed recipients; `bodies` are the bodies of
    /// envelopes that no longer need them.
    Retry {
        remaining: Vec<Envelope>,
        bodies: Vec<PathBuf>,
        reason: String,
    },
}

pub(crate) fn settle(job: &RelayJob, result: Result<DeliveryReport, DeliveryError>) -> Settlement {
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            return Settlement::Retry {
                remaining: job.payload.clone(),
                bodies: Vec::new(),
                reason: err.to_string(),
            };
        }
    };

    let mut remaining = Vec::new();
    let mut bodies = Vec::new();
    let mut reasons = Vec::new();

    for (index, envelope) in job.payload.iter().enumerate() {
        match report.outcome(index) {
            Some(EnvelopeOutcome::Delivered) => {
                bodies.extend(envelope.body.path().map(PathBuf::from));
            }
            Some(EnvelopeOutcome::Failed { recipients, reason }) => {
                reasons.push(reason.clone());
                remaining.push(narrow(envelope, recipients));
            }
            None => {
                reasons.push(format!("no outcome reported for envelope {index}"));
                remaining.push(envelope.clone());
            }
        }
    }

    if remaining.is_empty() {
        return Settlement::Delivered { bodies };
    }

    Settlement::Retry {
        remaining,
        bodies,
        reason: reasons.join("; "),
    }
}

/// Keep only the recipients that failed. An empty or unrecognised failure
/// list keeps them all.
fn narrow(envelope: &Envelope, failed: &[String]) -> Envelope {
    let failed: HashSet<String> = failed.iter().map(|r| r.to_ascii_lowercase()).collect();
    let recipients: Vec<String> = envelope
        .recipients
        .iter()
        .filter(|r| failed.contains(&r.to_ascii_lowercase()))
        .cloned()
        .collect();

    if recipients.is_empty() {
        return envelope.clone();
    }

    Envelope {
        recipients,
        ..envelope.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ferry_queue::MessageBody;
    use pretty_assertions::assert_eq;

    use super::*;

    fn envelope(body: &str, recipients: &[&str]) -> Envelope {
        Envelope::new(
            "a@example.org",
            recipients.iter().map(ToString::to_string).collect(),
            MessageBody::Stored(Path::new("/var/spool/ferry/queue").join(body)),
        )
    }

    fn job() -> RelayJob {
        RelayJob::new(
            vec![
                envelope("one.eml", &["b@example.com", "c@example.com"]),
                envelope("two.eml", &["d@example.com"]),
            ],
            "esmtp",
            0,
        )
    }

    #[test]
    fn full_success() {
        let job = job();
        assert_eq!(
            settle(&job, Ok(DeliveryReport::delivered(2))),
            Settlement::Delivered {
                bodies: vec![
                    PathBuf::from("/var/spool/ferry/queue/one.eml"),
                    PathBuf::from("/var/spool/ferry/queue/two.eml"),
                ]
            }
        );
    }

    #[test]
    fn whole_attempt_error_keeps_everything() {
        let job = job();
        let settlement = settle(&job, Err(DeliveryError::Temporary("421 try later".into())));
        assert_eq!(
            settlement,
            Settlement::Retry {
                remaining: job.payload.clone(),
                bodies: vec![],
                reason: "Temporary failure: 421 try later".into(),
            }
        );
    }

    #[test]
    fn partial_delivery_drops_delivered_and_narrows_failed() {
        let job = job();
        let report = DeliveryReport::from_outcomes(vec![
            EnvelopeOutcome::Failed {
                recipients: vec!["C@example.com".into()],
                reason: "452 mailbox full".into(),
            },
            EnvelopeOutcome::Delivered,
        ]);

        let Settlement::Retry {
            remaining,
            bodies,
            reason,
        } = settle(&job, Ok(report))
        else {
            panic!("expected retry");
        };

        assert_eq!(remaining, vec![envelope("one.eml", &["c@example.com"])]);
        assert_eq!(bodies, vec![PathBuf::from("/var/spool/ferry/queue/two.eml")]);
        assert_eq!(reason, "452 mailbox full");
    }

    #[test]
    fn short_report_fails_the_rest() {
        let job = job();
        let Settlement::Retry { remaining, .. } =
            settle(&job, Ok(DeliveryReport::delivered(1)))
        else {
            panic!("expected retry");
        };
        assert_eq!(remaining, vec![job.payload[1].clone()]);
    }

    #[test]
    fn unknown_failed_recipients_keep_all() {
        let env = envelope("one.eml", &["b@example.com"]);
        assert_eq!(narrow(&env, &["zzz@example.com".into()]), env);
    }
}
