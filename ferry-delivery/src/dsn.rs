//! Delivery Status Notifications (RFC 3464) for jobs that gave up.
//!
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── text/plain              human-readable explanation
//! ├── message/delivery-status per-message and per-recipient fields
//! └── text/rfc822-headers     original headers, at most 1 KiB
//! ```

use std::{fmt::Write as _, sync::Arc};

use async_trait::async_trait;
use ferry_common::{relay, time};
use ferry_queue::{BodyStore, DEFAULT_PROTOCOL, Envelope, MessageBody, RelayJob, RelayQueue};
use serde::Deserialize;

use crate::{bounce::BounceHandler, error::DeliveryError};

const HEADER_LIMIT: usize = 1024;

/// Status reported for recipients of an exhausted job: delivery time expired.
const EXHAUSTED_STATUS: &str = "4.4.7";

/// Notifications travel with an empty reverse path.
const NULL_SENDER: &str = "";

fn default_reporting_mta() -> String {
    "localhost".to_string()
}

fn default_postmaster() -> String {
    "mailer-daemon@localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DsnConfig {
    /// Off by default: exhausted and bounced jobs are simply dropped.
    #[serde(default)]
    pub enabled: bool,

    /// Hostname written to `Reporting-MTA`.
    #[serde(default = "default_reporting_mta")]
    pub reporting_mta: String,

    /// Header sender of notifications. The envelope sender is always the
    /// null reverse path so a notification is never itself bounced.
    #[serde(default = "default_postmaster")]
    pub postmaster: String,
}

impl Default for DsnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reporting_mta: default_reporting_mta(),
            postmaster: default_postmaster(),
        }
    }
}

/// Queues one notification per envelope of a bounced job, addressed to the
/// envelope's sender. Envelopes from the null sender are skipped so a
/// notification can never bounce back into another one.
#[derive(Debug)]
pub struct DsnBounces {
    config: DsnConfig,
    queue: Arc<RelayQueue>,
    bodies: Arc<BodyStore>,
}

impl DsnBounces {
    #[must_use]
    pub const fn new(config: DsnConfig, queue: Arc<RelayQueue>, bodies: Arc<BodyStore>) -> Self {
        Self {
            config,
            queue,
            bodies,
        }
    }
}

#[async_trait]
impl BounceHandler for DsnBounces {
    async fn bounce(&self, job: &RelayJob) -> Result<(), DeliveryError> {
        let now = time::epoch_seconds();

        for envelope in job.payload.iter().filter(|e| !e.has_null_sender()) {
            let headers = original_headers(envelope).await;
            let message = generate_dsn(&self.config, job, envelope, &headers, now);

            let notification = RelayJob::new(
                vec![Envelope::new(
                    NULL_SENDER,
                    vec![bare_address(&envelope.sender)],
                    MessageBody::Inline(message.into_bytes()),
                )],
                DEFAULT_PROTOCOL,
                now,
            );

            let (_, queued) = self.bodies.admit(&self.queue, notification).await?;
            relay!(
                level = INFO,
                "Queued delivery status notification {} to {} for job {}",
                queued.id,
                envelope.sender,
                job.id
            );
        }

        Ok(())
    }
}

fn bare_address(address: &str) -> String {
    mailparse::addrparse(address)
        .ok()
        .and_then(|list| list.extract_single_info())
        .map_or_else(|| address.trim_matches(['<', '>', ' ']).to_string(), |info| info.addr)
}

async fn original_headers(envelope: &Envelope) -> String {
    let content = match &envelope.body {
        MessageBody::Inline(content) => content.clone(),
        MessageBody::Stored(path) => match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(_) => return String::from("(No message data available)"),
        },
    };

    let end = content
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(content.len())
        .min(HEADER_LIMIT);

    String::from_utf8_lossy(&content[..end]).into_owned()
}

/// Build the complete notification message for one envelope of `job`.
#[must_use]
pub fn generate_dsn(
    config: &DsnConfig,
    job: &RelayJob,
    envelope: &Envelope,
    original_headers: &str,
    now: u64,
) -> String {
    let boundary = format!("----=_Part_{}", ulid::Ulid::new());
    let recipients = envelope.recipients.join(", ");

    let human_readable = format!(
        "This is the mail system at host {mta}.\r\n\
        \r\n\
        I'm sorry to have to inform you that your message could not\r\n\
        be delivered to one or more recipients.\r\n\
        \r\n\
        {recipients}: delivery abandoned after {attempts} attempt(s)\r\n\
        \r\n\
        Message details:\r\n\
        - Original sender: {sender}\r\n\
        - Queued at: {queued}\r\n\
        - Protocol: {protocol}\r\n",
        mta = config.reporting_mta,
        attempts = job.attempt_count,
        sender = envelope.sender,
        queued = time::format_epoch(job.enqueued_at),
        protocol = job.protocol,
    );

    let mut status = format!("Reporting-MTA: dns; {}\r\n", config.reporting_mta);
    let _ = write!(status, "Arrival-Date: {}\r\n", time::rfc2822(job.enqueued_at));
    for recipient in &envelope.recipients {
        let _ = write!(
            status,
            "\r\nFinal-Recipient: rfc822; {recipient}\r\n\
            Action: failed\r\n\
            Status: {EXHAUSTED_STATUS}\r\n\
            Diagnostic-Code: x-ferry; delivery abandoned after {} attempt(s)\r\n",
            job.attempt_count
        );
        if let Some(last) = job.last_attempt_at {
            let _ = write!(status, "Last-Attempt-Date: {}\r\n", time::rfc2822(last));
        }
    }

    format!(
        "From: Mail Delivery System <{postmaster}>\r\n\
        To: {to}\r\n\
        Subject: Delivery Status Notification (Failure)\r\n\
        Date: {date}\r\n\
        Auto-Submitted: auto-replied\r\n\
        MIME-Version: 1.0\r\n\
        Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
        \r\n\
        This is a multi-part message in MIME format.\r\n\
        \r\n\
        --{boundary}\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        Content-Transfer-Encoding: 7bit\r\n\
        \r\n\
        {human_readable}\r\n\
        --{boundary}\r\n\
        Content-Type: message/delivery-status\r\n\
        Content-Transfer-Encoding: 7bit\r\n\
        \r\n\
        {status}\r\n\
        --{boundary}\r\n\
        Content-Type: text/rfc822-headers\r\n\
        Content-Transfer-Encoding: 7bit\r\n\
        \r\n\
        {original_headers}\r\n\
        --{boundary}--\r\n",
        postmaster = config.postmaster,
        to = envelope.sender,
        date = time::rfc2822(now),
    )
}
