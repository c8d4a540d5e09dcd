//! Webhook intake: verify, derive the dedup key, insert once.
//!
//! Intake never waits for delivery. A verified request costs one
//! `check_and_insert`; a rejected one costs nothing beyond the MAC.

use std::sync::Arc;

use bytes::Bytes;
use hookline_core::{Clock, CoreError, DedupKey, EventState, EventStore, InsertOutcome};
use hookline_delivery::DispatchQueue;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::crypto::{SignatureError, SignatureVerifier};

/// Signature header name.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Optional sender-assigned event id header.
///
/// The MAC does not cover this header. A captured request resent under a
/// new event id is a new event to intake; configure a replay window so such
/// a copy is only accepted while its timestamp is fresh.
pub const EVENT_ID_HEADER: &str = "x-webhook-event-id";

/// Optional unix timestamp header.
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// One inbound webhook as seen by intake.
#[derive(Debug, Clone, Default)]
pub struct InboundWebhook {
    /// Raw request body, exactly as received.
    pub body: Bytes,
    /// Value of the signature header.
    pub signature: Option<String>,
    /// Value of the event id header.
    pub event_id: Option<String>,
    /// Value of the timestamp header.
    pub timestamp: Option<String>,
}

/// What intake did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// First sighting of the key; the event is queued for delivery.
    Accepted(DedupKey),
    /// The key was seen before; nothing was stored.
    Duplicate {
        /// Key of the existing record.
        key: DedupKey,
        /// Its state at lookup time.
        state: EventState,
    },
    /// Signature verification failed; the store was not touched.
    Rejected(SignatureError),
}

/// Accepts webhooks into the idempotency store.
#[derive(Clone)]
pub struct IntakeService {
    verifier: SignatureVerifier,
    store: Arc<dyn EventStore>,
    queue: DispatchQueue,
    clock: Arc<dyn Clock>,
}

impl IntakeService {
    /// Creates an intake service that wakes `queue` on new events.
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<dyn EventStore>,
        queue: DispatchQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { verifier, store, queue, clock }
    }

    /// Verifies and records one webhook.
    ///
    /// # Errors
    ///
    /// Returns the store error when the insert fails. Signature failures
    /// are an [`IntakeOutcome::Rejected`], not an error.
    #[instrument(
        name = "intake",
        skip_all,
        fields(dedup_key = tracing::field::Empty, bytes = webhook.body.len())
    )]
    pub async fn receive(&self, webhook: InboundWebhook) -> Result<IntakeOutcome, CoreError> {
        let now = self.clock.now();

        if let Err(reason) = self.verifier.verify(
            &webhook.body,
            webhook.signature.as_deref(),
            webhook.timestamp.as_deref(),
            now,
        ) {
            warn!(error = %reason, "rejecting webhook");
            return Ok(IntakeOutcome::Rejected(reason));
        }

        let key = dedup_key_for(webhook.event_id.as_deref(), &webhook.body);
        tracing::Span::current().record("dedup_key", key.as_str());

        match self.store.check_and_insert(&key, webhook.body, now).await? {
            InsertOutcome::Created(_) => {
                info!("webhook accepted");
                self.queue.notify();
                Ok(IntakeOutcome::Accepted(key))
            },
            InsertOutcome::Duplicate(state) => {
                debug!(state = %state, "duplicate webhook acknowledged");
                Ok(IntakeOutcome::Duplicate { key, state })
            },
        }
    }
}

/// Key for a webhook: the sender's event id when present, otherwise the
/// SHA-256 of the body.
pub fn dedup_key_for(event_id: Option<&str>, body: &[u8]) -> DedupKey {
    match event_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => DedupKey::new(id),
        None => DedupKey::from_digest(&hex::encode(Sha256::digest(body))),
    }
}
