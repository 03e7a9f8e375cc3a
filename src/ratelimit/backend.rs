//! Admission control trait exposed to the request pipeline.

use async_trait::async_trait;

/// The single question the request pipeline asks of the rate limiter.
///
/// The pipeline extracts the identity and remote address from the inbound
/// request and turns `false` into a throttling response; implementations know
/// nothing about the transport.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Whether a request from this caller may proceed.
    async fn allow_request(&self, identity: Option<&str>, remote_address: Option<&str>) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ratelimit::{RateLimiter, RateLimiterConfig};
    use crate::store::MemoryStore;

    /// What a pipeline does with the answer.
    async fn status_for(gate: &dyn AdmissionControl, identity: Option<&str>) -> u16 {
        if gate.allow_request(identity, Some("192.168.1.1")).await {
            200
        } else {
            429
        }
    }

    #[tokio::test]
    async fn test_pipeline_sees_throttling() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            RateLimiterConfig::new(2.0, 0.5),
        )
        .unwrap();
        let gate: Arc<dyn AdmissionControl> = Arc::new(limiter);

        assert_eq!(status_for(gate.as_ref(), Some("alice")).await, 200);
        assert_eq!(status_for(gate.as_ref(), Some("alice")).await, 200);
        assert_eq!(status_for(gate.as_ref(), Some("alice")).await, 429);

        // Anonymous traffic from the same address has its own bucket
        assert_eq!(status_for(gate.as_ref(), None).await, 200);
    }
}
