//! Driver-facing action facade.
//!
//! Implements the capture-validate-send flow for every mutating driver
//! operation: acquire a validated position, attempt an immediate send when
//! the device looks online, and fall back to the offline queue when the
//! device is offline or the send fails. Mock-location suspicion rides along
//! in the validated position; the UI asks the driver to confirm before
//! calling the action method, so nothing here blocks on it.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::ApiClient;
use crate::error::TerminalError;
use crate::gps::{self, GpsError, PositionSource, ValidatedPosition};
use crate::net::NetworkObserver;
use crate::queue::{ActionType, OfflineQueue, QueuedAction};

/// How a driver action was dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Applied immediately against the dispatch server.
    Sent { response: Value },
    /// Persisted locally; the sync engine will replay it.
    Queued { action: QueuedAction },
}

impl ActionOutcome {
    pub fn was_queued(&self) -> bool {
        matches!(self, ActionOutcome::Queued { .. })
    }
}

/// Entry point for delivery execution on the driver terminal.
#[derive(Clone)]
pub struct DriverActions {
    queue: OfflineQueue,
    api: ApiClient,
    observer: NetworkObserver,
}

impl DriverActions {
    pub fn new(queue: OfflineQueue, api: ApiClient, observer: NetworkObserver) -> Self {
        Self {
            queue,
            api,
            observer,
        }
    }

    /// Acquire a fresh, validated position from the platform source.
    /// Acquisition failures surface directly; the caller decides how to
    /// present mock-location warnings before proceeding.
    pub async fn capture_position<S: PositionSource>(
        &self,
        source: &S,
    ) -> Result<ValidatedPosition, GpsError> {
        gps::acquire_validated(source).await
    }

    /// Mark a delivery as picked up / in transit.
    pub async fn start_delivery(
        &self,
        delivery_id: &str,
        position: &ValidatedPosition,
    ) -> Result<ActionOutcome, TerminalError> {
        let payload = serde_json::json!({
            "status": "in_transit",
            "gps": position.to_payload(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.submit_or_queue(
            ActionType::DeliveryStatus,
            &format!("/api/driver/deliveries/{delivery_id}/start"),
            payload,
        )
        .await
    }

    /// Mark a delivery as delivered, optionally linking an already-uploaded
    /// proof photo.
    pub async fn complete_delivery(
        &self,
        delivery_id: &str,
        position: &ValidatedPosition,
        proof_photo_id: Option<&str>,
    ) -> Result<ActionOutcome, TerminalError> {
        let payload = serde_json::json!({
            "status": "delivered",
            "gps": position.to_payload(),
            "proof_photo_id": proof_photo_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.submit_or_queue(
            ActionType::DeliveryStatus,
            &format!("/api/driver/deliveries/{delivery_id}/complete"),
            payload,
        )
        .await
    }

    /// Link a proof-of-delivery photo to a delivery after the fact.
    pub async fn attach_proof(
        &self,
        delivery_id: &str,
        photo_id: &str,
    ) -> Result<ActionOutcome, TerminalError> {
        let payload = serde_json::json!({
            "photo_id": photo_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.submit_or_queue(
            ActionType::ProofUpload,
            &format!("/api/driver/deliveries/{delivery_id}/proof"),
            payload,
        )
        .await
    }

    /// Mark a delivery as failed with a reason (recipient absent, refused,
    /// address not found, ...).
    pub async fn fail_delivery(
        &self,
        delivery_id: &str,
        position: &ValidatedPosition,
        reason: &str,
    ) -> Result<ActionOutcome, TerminalError> {
        let payload = serde_json::json!({
            "status": "failed",
            "reason": reason,
            "gps": position.to_payload(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.submit_or_queue(
            ActionType::FailedDelivery,
            &format!("/api/driver/deliveries/{delivery_id}/fail"),
            payload,
        )
        .await
    }

    /// Submit a petty-cash request (fuel, parking, toll). Position is
    /// optional: these can be filed from anywhere.
    pub async fn submit_petty_cash(
        &self,
        amount: f64,
        description: &str,
        position: Option<&ValidatedPosition>,
    ) -> Result<ActionOutcome, TerminalError> {
        let payload = serde_json::json!({
            "amount": amount,
            "description": description,
            "gps": position.map(ValidatedPosition::to_payload),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.submit_or_queue(ActionType::PettyCash, "/api/driver/petty-cash", payload)
            .await
    }

    /// Send a live location ping.
    pub async fn push_location(
        &self,
        position: &ValidatedPosition,
    ) -> Result<ActionOutcome, TerminalError> {
        let payload = serde_json::json!({
            "gps": position.to_payload(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.submit_or_queue(ActionType::LocationUpdate, "/api/driver/location", payload)
            .await
    }

    /// Immediate send when online, queue fallback otherwise. Every action
    /// here replays as a POST; PUT/PATCH actions would come through the
    /// queue API directly.
    async fn submit_or_queue(
        &self,
        action_type: ActionType,
        endpoint: &str,
        payload: Value,
    ) -> Result<ActionOutcome, TerminalError> {
        if !self.observer.is_online() {
            debug!(
                action_type = action_type.as_str(),
                endpoint, "device offline; queueing action"
            );
            let action = self.queue.enqueue(action_type, endpoint, "POST", payload)?;
            return Ok(ActionOutcome::Queued { action });
        }

        let send_key = Uuid::new_v4().to_string();
        match self.api.replay("POST", endpoint, &payload, &send_key).await {
            Ok(response) => Ok(ActionOutcome::Sent { response }),
            Err(e) => {
                warn!(
                    action_type = action_type.as_str(),
                    endpoint,
                    error = %e,
                    "immediate send failed; falling back to offline queue"
                );
                let action = self.queue.enqueue(action_type, endpoint, "POST", payload)?;
                Ok(ActionOutcome::Queued { action })
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
