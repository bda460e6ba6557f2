//! Hand messages to a local program, the way `sendmail -i` or `dovecot-lda`
//! accept mail on stdin.

use std::{path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use ferry_common::relay;
use ferry_queue::{Envelope, MessageBody, RelayJob};
use serde::Deserialize;
use tokio::{
    io::AsyncWriteExt,
    process::{ChildStdin, Command},
    time::timeout,
};

use super::{DeliveryAgent, DeliveryReport, EnvelopeOutcome};
use crate::error::DeliveryError;

/// `sysexits.h` code for "try again later".
const EX_TEMPFAIL: i32 = 75;

const fn default_timeout_secs() -> u64 {
    300
}

/// Runs `program` once per envelope, or once per recipient when an argument
/// mentions `{recipient}`, writing the message to its stdin.
///
/// Argument placeholders: `{sender}`, `{recipient}`, `{mailbox}` (the job's
/// mailbox, else the recipient) and `{recipients}`, which must stand alone
/// and expands to one argument per recipient.
#[derive(Debug, Clone, Deserialize)]
pub struct PipeAgent {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Per invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl PipeAgent {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout_secs: default_timeout_secs(),
        }
    }

    fn per_recipient(&self) -> bool {
        self.args.iter().any(|arg| arg.contains("{recipient}"))
    }

    fn expand(&self, sender: &str, recipients: &[String], mailbox: Option<&str>) -> Vec<String> {
        let first = recipients.first().map_or("", String::as_str);
        let mailbox = mailbox.unwrap_or(first);

        let mut expanded = Vec::with_capacity(self.args.len() + recipients.len());
        for arg in &self.args {
            if arg == "{recipients}" {
                expanded.extend(recipients.iter().cloned());
            } else {
                expanded.push(
                    arg.replace("{sender}", sender)
                        .replace("{recipient}", first)
                        .replace("{mailbox}", mailbox),
                );
            }
        }
        expanded
    }

    async fn run(&self, args: Vec<String>, content: &[u8]) -> Result<(), DeliveryError> {
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin and drain the output together, under one deadline.
        let stdin = child.stdin.take();
        let (fed, output) = timeout(Duration::from_secs(self.timeout_secs), async {
            tokio::join!(feed(stdin, content), child.wait_with_output())
        })
        .await
        .map_err(|_| DeliveryError::Timeout(self.timeout_secs))?;
        let output = output?;

        if output.status.success() {
            // Exiting cleanly without taking the whole message is not a delivery.
            return fed.map_err(|err| {
                DeliveryError::Temporary(format!(
                    "{} did not read the message: {err}",
                    self.program.display()
                ))
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let reason = format!(
            "{} exited with {}{}",
            self.program.display(),
            output.status,
            if stderr.is_empty() {
                String::new()
            } else {
                format!(": {stderr}")
            }
        );

        Err(if output.status.code() == Some(EX_TEMPFAIL) {
            DeliveryError::Temporary(reason)
        } else {
            DeliveryError::Permanent(reason)
        })
    }

    async fn deliver_envelope(&self, envelope: &Envelope, mailbox: Option<&str>) -> EnvelopeOutcome {
        let content = match &envelope.body {
            MessageBody::Stored(path) => match tokio::fs::read(path).await {
                Ok(content) => content,
                Err(err) => {
                    return EnvelopeOutcome::failed(format!(
                        "cannot read body {}: {err}",
                        path.display()
                    ));
                }
            },
            MessageBody::Inline(content) => content.clone(),
        };

        let sender = envelope.sender.trim_matches(['<', '>']);

        if !self.per_recipient() {
            let args = self.expand(sender, &envelope.recipients, mailbox);
            return match self.run(args, &content).await {
                Ok(()) => EnvelopeOutcome::Delivered,
                Err(err) => EnvelopeOutcome::failed(err.to_string()),
            };
        }

        let mut refused = Vec::new();
        let mut reasons = Vec::new();
        for recipient in &envelope.recipients {
            let args = self.expand(sender, std::slice::from_ref(recipient), mailbox);
            if let Err(err) = self.run(args, &content).await {
                relay!(level = DEBUG, "{} refused {recipient}: {err}", self.program.display());
                refused.push(recipient.clone());
                reasons.push(err.to_string());
            }
        }

        if refused.is_empty() {
            EnvelopeOutcome::Delivered
        } else {
            EnvelopeOutcome::Failed {
                recipients: refused,
                reason: reasons.join("; "),
            }
        }
    }
}

async fn feed(stdin: Option<ChildStdin>, content: &[u8]) -> std::io::Result<()> {
    if let Some(mut stdin) = stdin {
        stdin.write_all(content).await?;
        stdin.shutdown().await?;
    }
    Ok(())
}

#[async_trait]
impl DeliveryAgent for PipeAgent {
    async fn deliver(&self, job: &RelayJob) -> Result<DeliveryReport, DeliveryError> {
        let mut outcomes = Vec::with_capacity(job.payload.len());
        for envelope in &job.payload {
            outcomes.push(self.deliver_envelope(envelope, job.mailbox.as_deref()).await);
        }
        Ok(DeliveryReport::from_outcomes(outcomes))
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn job(dir: &tempfile::TempDir, recipients: &[&str]) -> RelayJob {
        let body = dir.path().join("body.eml");
        std::fs::write(&body, b"Subject: hi\r\n\r\nhello\r\n").unwrap();
        RelayJob::new(
            vec![Envelope::new(
                "<a@example.org>",
                recipients.iter().map(ToString::to_string).collect(),
                MessageBody::Stored(body),
            )],
            "esmtp",
            0,
        )
    }

    fn shell(script: &str) -> PipeAgent {
        PipeAgent::new("/bin/sh", vec!["-c".into(), script.into(), "sh".into()])
    }

    #[test]
    fn placeholders_expand() {
        let agent = PipeAgent::new(
            "/usr/sbin/sendmail",
            vec!["-f".into(), "{sender}".into(), "--".into(), "{recipients}".into()],
        );
        assert_eq!(
            agent.expand("a@x", &["b@y".into(), "c@z".into()], None),
            vec!["-f", "a@x", "--", "b@y", "c@z"]
        );

        let lda = PipeAgent::new("/usr/lib/dovecot/dovecot-lda", vec!["-d".into(), "{mailbox}".into()]);
        assert_eq!(lda.expand("a@x", &["b@y".into()], Some("inbox-b")), vec!["-d", "inbox-b"]);
        assert_eq!(lda.expand("a@x", &["b@y".into()], None), vec!["-d", "b@y"]);
        assert!(!lda.per_recipient());
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Process spawning not supported in MIRI")]
    async fn successful_exit_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("sink");
        let agent = shell(&format!("cat > {}", sink.display()));

        let report = agent.deliver(&job(&dir, &["b@example.com"])).await.unwrap();
        assert_eq!(report, DeliveryReport::delivered(1));
        assert_eq!(std::fs::read(&sink).unwrap(), b"Subject: hi\r\n\r\nhello\r\n");
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Process spawning not supported in MIRI")]
    async fn failing_exit_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let agent = shell("cat > /dev/null; echo 'mailbox full' >&2; exit 75");

        let report = agent.deliver(&job(&dir, &["b@example.com"])).await.unwrap();
        match report.outcome(0) {
            Some(EnvelopeOutcome::Failed { recipients, reason }) => {
                assert!(recipients.is_empty());
                assert!(reason.contains("mailbox full"), "{reason}");
                assert!(reason.starts_with("Temporary"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Process spawning not supported in MIRI")]
    async fn per_recipient_runs_narrow_failures() {
        let dir = tempfile::tempdir().unwrap();
        let agent = PipeAgent::new(
            "/bin/sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; case "$1" in bad@*) exit 1;; esac"#.into(),
                "sh".into(),
                "{recipient}".into(),
            ],
        );

        let report = agent
            .deliver(&job(&dir, &["good@example.com", "bad@example.com"]))
            .await
            .unwrap();
        assert!(matches!(
            report.outcome(0),
            Some(EnvelopeOutcome::Failed { recipients, .. }) if recipients == &vec!["bad@example.com".to_string()]
        ));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Process spawning not supported in MIRI")]
    async fn program_ignoring_its_input_times_out() {
        let mut agent = shell("sleep 30");
        agent.timeout_secs = 1;
        let content = vec![b'x'; 1024 * 1024];

        let started = std::time::Instant::now();
        let result = agent.run(Vec::new(), &content).await;

        assert!(matches!(result, Err(DeliveryError::Timeout(1))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Process spawning not supported in MIRI")]
    async fn large_message_is_fed_while_output_drains() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("sink");
        let agent = shell(&format!("cat > {}; head -c 262144 /dev/zero >&2", sink.display()));
        let content = vec![b'x'; 1024 * 1024];

        agent.run(Vec::new(), &content).await.unwrap();
        assert_eq!(std::fs::metadata(&sink).unwrap().len(), 1024 * 1024);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Process spawning not supported in MIRI")]
    async fn missing_program_fails_the_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let agent = PipeAgent::new(dir.path().join("no-such-binary"), vec![]);

        let report = agent.deliver(&job(&dir, &["b@example.com"])).await.unwrap();
        assert!(matches!(report.outcome(0), Some(EnvelopeOutcome::Failed { .. })));
    }
}
