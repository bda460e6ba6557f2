//! Configuration loading and end-to-end wiring of a ferry instance.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;

use ferry::Ferry;
use ferry_control::{EnqueueRequest, EnvelopeRequest, ListQuery};
use ferry_delivery::PipeAgent;
use ferry_queue::{QueueConfig, QueueError};
use pretty_assertions::assert_eq;

fn ferry_in(dir: &Path) -> Ferry {
    Ferry {
        queue: QueueConfig {
            path: dir.join("relay-queue.bin"),
            storage: dir.to_path_buf(),
            ..QueueConfig::default()
        },
        ..Ferry::default()
    }
}

fn request() -> EnqueueRequest {
    EnqueueRequest {
        envelopes: vec![EnvelopeRequest {
            sender: "a@example.org".into(),
            recipients: vec!["b@example.com".into()],
            body: Some("Subject: hi\r\n\r\nHello\r\n".into()),
            body_path: None,
        }],
        ..EnqueueRequest::default()
    }
}

#[test]
fn shipped_config_parses() {
    let content =
        std::fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join("ferry.config.ron"))
            .unwrap();
    let ferry: Ferry = ron::from_str(&content).unwrap();

    assert_eq!(ferry.router().protocols(), vec!["esmtp", "lda"]);
    assert_eq!(ferry.retry.total_retries, 30);
    assert_eq!(ferry.queue.default_protocol, "esmtp");
}

#[tokio::test]
#[cfg_attr(miri, ignore = "File I/O not supported in MIRI")]
async fn one_instance_per_queue() {
    let dir = tempfile::tempdir().unwrap();
    let ferry = ferry_in(dir.path());

    let running = ferry.assemble().unwrap();
    let err = ferry.assemble().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<QueueError>(),
        Some(QueueError::AlreadyOpen(_))
    ));

    drop(running);
    assert!(ferry.assemble().is_ok());
}

#[cfg(unix)]
#[tokio::test]
#[cfg_attr(miri, ignore = "Process spawning not supported in MIRI")]
async fn queued_job_is_delivered_through_its_route() {
    let dir = tempfile::tempdir().unwrap();
    let sink = dir.path().join("delivered.eml");

    let mut ferry = ferry_in(dir.path());
    ferry.routes.insert(
        "esmtp".into(),
        PipeAgent::new(
            "/bin/sh",
            vec![
                "-c".into(),
                format!("cat > {}", sink.display()),
            ],
        ),
    );

    let assembly = ferry.assemble().unwrap();
    assembly.service.enqueue(request()).await.unwrap();
    assert_eq!(assembly.service.list(ListQuery::default()).total, 1);

    let summary = assembly.worker.tick().await;
    assert_eq!(summary.delivered, 1);
    assert!(assembly.queue.is_empty());
    assert_eq!(
        std::fs::read_to_string(&sink).unwrap(),
        "Subject: hi\r\n\r\nHello\r\n"
    );
}

#[tokio::test]
#[cfg_attr(miri, ignore = "File I/O not supported in MIRI")]
async fn unrouted_protocol_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let assembly = ferry_in(dir.path()).assemble().unwrap();

    let queued = assembly.service.enqueue(request()).await.unwrap();
    let summary = assembly.worker.tick().await;

    assert_eq!(summary.retried, 1);
    let job = assembly
        .queue
        .get(&queued.session.id.parse().unwrap())
        .unwrap();
    assert_eq!(job.attempt_count, 1);
}
