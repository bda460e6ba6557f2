use std::{collections::HashMap, sync::Arc, sync::LazyLock};

use ferry_common::{Signal, internal, logging, tracing};
use ferry_control::{ControlConfig, QueueService};
use ferry_delivery::{
    BounceHandler, DeliveryRouter, DiscardBounces, DsnBounces, DsnConfig, PipeAgent, RetryPolicy,
    RetryWorker, WorkerConfig,
};
use ferry_queue::{BodyStore, QueueConfig, RelayQueue};
use ferry_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast;

/// Everything a ferry instance is configured with, as read from
/// `ferry.config.ron`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Ferry {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, alias = "bounces")]
    pub bounce: DsnConfig,
    #[serde(default)]
    pub control: ControlConfig,

    /// Delivery agent per protocol name.
    #[serde(default, alias = "route")]
    pub routes: HashMap<String, PipeAgent>,
    /// Agent for protocols without a route.
    #[serde(default)]
    pub fallback: Option<PipeAgent>,
}

/// The running parts of an instance, wired together.
#[derive(Debug)]
pub struct Assembly {
    pub queue: Arc<RelayQueue>,
    pub bodies: Arc<BodyStore>,
    pub worker: Arc<RetryWorker>,
    pub service: QueueService,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Ferry {
    #[must_use]
    pub fn router(&self) -> DeliveryRouter {
        let router = self
            .routes
            .iter()
            .fold(DeliveryRouter::new(), |router, (protocol, agent)| {
                router.route(protocol, Arc::new(agent.clone()))
            });

        match &self.fallback {
            Some(agent) => router.fallback(Arc::new(agent.clone())),
            None => router,
        }
    }

    fn bounces(&self, queue: &Arc<RelayQueue>, bodies: &Arc<BodyStore>) -> Arc<dyn BounceHandler> {
        if self.bounce.enabled {
            Arc::new(DsnBounces::new(
                self.bounce.clone(),
                Arc::clone(queue),
                Arc::clone(bodies),
            ))
        } else {
            Arc::new(DiscardBounces)
        }
    }

    /// Open the queue and build the worker and management service on top
    /// of it. The worker is not started.
    ///
    /// # Errors
    ///
    /// Fails if the queue or body directory cannot be opened, including when
    /// another process holds the queue.
    pub fn assemble(&self) -> anyhow::Result<Assembly> {
        let (queue, bodies) = self.queue.open()?;
        let (queue, bodies) = (Arc::new(queue), Arc::new(bodies));
        let bounces = self.bounces(&queue, &bodies);

        let worker = Arc::new(
            RetryWorker::new(
                self.worker.clone(),
                self.retry.clone(),
                Arc::clone(&queue),
                Arc::clone(&bodies),
                Arc::new(self.router()),
            )
            .with_bounces(Arc::clone(&bounces)),
        );

        let service = QueueService::new(
            self.control.clone(),
            self.queue.default_protocol.clone(),
            Arc::clone(&queue),
            Arc::clone(&bodies),
            worker.handle(),
        )
        .with_bounces(bounces);

        Ok(Assembly {
            queue,
            bodies,
            worker,
            service,
        })
    }

    /// Run the retry worker until shutdown.
    ///
    /// # Errors
    ///
    /// This function will return an error if the queue cannot be opened or
    /// the signal handlers cannot be installed.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        if self.routes.is_empty() && self.fallback.is_none() {
            internal!(
                level = WARN,
                "No delivery routes configured; every attempt will fail and be retried"
            );
        }

        let assembly = self.assemble()?;
        internal!(
            level = INFO,
            "Relay queue {} open with {} job(s)",
            assembly.queue.path().display(),
            assembly.queue.len()
        );

        let ret = tokio::select! {
            () = assembly.worker.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                Ok(())
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}
