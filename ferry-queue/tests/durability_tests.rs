//! Restart and concurrency behaviour of the relay queue store.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{collections::HashSet, sync::Arc};

use ferry_queue::{BodyStore, Envelope, JobId, MessageBody, QueueError, RelayJob, RelayQueue};
use pretty_assertions::assert_eq;

fn inline_job(subject: &str) -> RelayJob {
    RelayJob::new(
        vec![Envelope::new(
            "sender@example.org",
            vec!["rcpt@example.com".into()],
            MessageBody::Inline(format!("Subject: {subject}\r\n\r\nHello\r\n").into_bytes()),
        )],
        "esmtp",
        1_700_000_000,
    )
}

/// Enqueue three jobs, drop the store, and reopen it on the same location.
#[tokio::test]
#[cfg_attr(miri, ignore = "File I/O not supported in MIRI")]
async fn reopened_store_lists_the_same_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("relay-queue.bin");
    let bodies = BodyStore::open(dir.path().join("queue")).unwrap();

    let before = {
        let queue = RelayQueue::open(&location).unwrap();
        for subject in ["one", "two", "three"] {
            bodies.admit(&queue, inline_job(subject)).await.unwrap();
        }
        let second = queue.snapshot()[1].id;
        queue
            .update(&second, |job| job.record_attempt(1_700_000_060))
            .await
            .unwrap();
        queue.snapshot()
    };

    let queue = RelayQueue::open(&location).unwrap();
    let after = queue.snapshot();

    assert_eq!(after, before);
    assert_eq!(
        after.iter().map(|j| j.attempt_count).collect::<Vec<_>>(),
        vec![0, 1, 0]
    );
    assert!(after.iter().flat_map(RelayJob::body_paths).all(|p| p.exists()));
}

#[tokio::test]
#[cfg_attr(miri, ignore = "File I/O not supported in MIRI")]
async fn location_is_exclusive_while_open() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("relay-queue.bin");

    let queue = RelayQueue::open(&location).unwrap();
    assert!(matches!(
        RelayQueue::open(&location),
        Err(QueueError::AlreadyOpen(_))
    ));

    drop(queue);
    RelayQueue::open(&location).expect("released on drop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[cfg_attr(miri, ignore = "File I/O not supported in MIRI")]
async fn concurrent_enqueues_lose_nothing() {
    const WRITERS: usize = 32;

    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("relay-queue.bin");
    let queue = Arc::new(RelayQueue::open(&location).unwrap());
    let bodies = Arc::new(BodyStore::open(dir.path().join("queue")).unwrap());

    let handles: Vec<_> = (0..WRITERS)
        .map(|n| {
            let queue = Arc::clone(&queue);
            let bodies = Arc::clone(&bodies);
            tokio::spawn(async move {
                let (_, job) = bodies
                    .admit(&queue, inline_job(&format!("message {n}")))
                    .await
                    .unwrap();
                job.id
            })
        })
        .collect();

    let mut submitted = HashSet::new();
    for handle in handles {
        assert!(submitted.insert(handle.await.unwrap()));
    }

    assert_eq!(queue.len(), WRITERS);
    let listed: HashSet<JobId> = queue.snapshot().into_iter().map(|j| j.id).collect();
    assert_eq!(listed, submitted);

    drop(queue);
    let reopened = RelayQueue::open(&location).unwrap();
    assert_eq!(reopened.len(), WRITERS);
}

/// A job removed between a worker's snapshot and its write-back must stay
/// removed.
#[tokio::test]
#[cfg_attr(miri, ignore = "File I/O not supported in MIRI")]
async fn replace_after_delete_does_not_resurrect() {
    let dir = tempfile::tempdir().unwrap();
    let queue = RelayQueue::open(dir.path().join("relay-queue.bin")).unwrap();
    let bodies = BodyStore::open(dir.path().join("queue")).unwrap();
    let (_, job) = bodies.admit(&queue, inline_job("doomed")).await.unwrap();

    let mut in_flight = queue.snapshot().remove(0);
    queue.remove_by_id(&job.id).await.unwrap();

    in_flight.record_attempt(1_700_000_060);
    assert!(!queue.replace(&job.id, in_flight).await.unwrap());
    assert!(queue.is_empty());

    drop(queue);
    let reopened = RelayQueue::open(dir.path().join("relay-queue.bin")).unwrap();
    assert!(reopened.is_empty());
}
