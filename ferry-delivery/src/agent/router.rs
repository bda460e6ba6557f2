use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use ferry_queue::RelayJob;

use super::{DeliveryAgent, DeliveryReport};
use crate::error::DeliveryError;

/// Dispatches each job to the agent registered for its protocol.
#[derive(Clone, Default)]
pub struct DeliveryRouter {
    routes: HashMap<String, Arc<dyn DeliveryAgent>>,
    fallback: Option<Arc<dyn DeliveryAgent>>,
}

impl fmt::Debug for DeliveryRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryRouter")
            .field("protocols", &self.protocols())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl DeliveryRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` for `protocol` (case-insensitive), replacing any
    /// earlier registration.
    #[must_use]
    pub fn route(mut self, protocol: &str, agent: Arc<dyn DeliveryAgent>) -> Self {
        self.routes.insert(protocol.to_ascii_lowercase(), agent);
        self
    }

    /// Agent for protocols with no explicit route.
    #[must_use]
    pub fn fallback(mut self, agent: Arc<dyn DeliveryAgent>) -> Self {
        self.fallback = Some(agent);
        self
    }

    /// Registered protocols, sorted.
    #[must_use]
    pub fn protocols(&self) -> Vec<&str> {
        let mut protocols: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        protocols.sort_unstable();
        protocols
    }

    fn agent_for(&self, protocol: &str) -> Option<&Arc<dyn DeliveryAgent>> {
        self.routes
            .get(&protocol.to_ascii_lowercase())
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl DeliveryAgent for DeliveryRouter {
    async fn deliver(&self, job: &RelayJob) -> Result<DeliveryReport, DeliveryError> {
        let agent = self
            .agent_for(&job.protocol)
            .ok_or_else(|| DeliveryError::UnsupportedProtocol(job.protocol.clone()))?;

        agent.deliver(job).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use ferry_queue::{Envelope, MessageBody};

    use super::*;
    use crate::agent::EnvelopeOutcome;

    struct Fixed(EnvelopeOutcome);

    #[async_trait]
    impl DeliveryAgent for Fixed {
        async fn deliver(&self, job: &RelayJob) -> Result<DeliveryReport, DeliveryError> {
            Ok(DeliveryReport::from_outcomes(vec![
                self.0.clone();
                job.payload.len()
            ]))
        }
    }

    fn job(protocol: &str) -> RelayJob {
        RelayJob::new(
            vec![Envelope::new(
                "a@example.org",
                vec!["b@example.com".into()],
                MessageBody::Stored(PathBuf::from("/var/spool/ferry/queue/x.eml")),
            )],
            protocol,
            0,
        )
    }

    #[tokio::test]
    async fn routes_case_insensitively() {
        let router = DeliveryRouter::new()
            .route("ESMTP", Arc::new(Fixed(EnvelopeOutcome::Delivered)))
            .route("dovecot-lda", Arc::new(Fixed(EnvelopeOutcome::failed("full"))));

        let report = router.deliver(&job("esmtp")).await.unwrap();
        assert_eq!(report, DeliveryReport::delivered(1));

        let report = router.deliver(&job("Dovecot-LDA")).await.unwrap();
        assert_eq!(report.outcome(0), Some(&EnvelopeOutcome::failed("full")));
        assert_eq!(router.protocols(), vec!["dovecot-lda", "esmtp"]);
    }

    #[tokio::test]
    async fn unknown_protocol_without_fallback_fails() {
        let router = DeliveryRouter::new().route("esmtp", Arc::new(Fixed(EnvelopeOutcome::Delivered)));

        let err = router.deliver(&job("lmtp")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::UnsupportedProtocol(p) if p == "lmtp"));
    }

    #[tokio::test]
    async fn fallback_catches_unrouted_protocols() {
        let router = DeliveryRouter::new().fallback(Arc::new(Fixed(EnvelopeOutcome::Delivered)));
        assert!(router.deliver(&job("lmtp")).await.is_ok());
    }
}
