//! The traffic seam.
//!
//! During an incremental replacement the controller tells a publisher
//! which instances of a traffic-serving service should receive requests,
//! and waits for the publisher to confirm before it removes anything.

use async_trait::async_trait;

use berth_compose::ServiceId;

use crate::control_plane::ObservedInstance;
use crate::error::TrafficError;

#[async_trait]
pub trait TrafficPublisher: Send + Sync {
    /// Route traffic of `service` to exactly `instances`. Returns once the
    /// new routing is live.
    async fn publish(
        &self,
        service: ServiceId,
        instances: &[ObservedInstance],
    ) -> Result<(), TrafficError>;
}
