//! C8 Trigger Ingest — turns a validated external event into
//! `TRIGGER_FIRED`.
//!
//! Two concrete ingest paths share one contract: webhook HMAC
//! (`handle_webhook`, this module) and Gmail push (`gmail` submodule).
//! Both simply publish `EventKind::TriggerFired`; the dispatch from that
//! event to an actual task run lives in [`TriggerDispatcher`] below: a
//! background task draining its own bus subscription rather than a callback invoked
//! inline from the HTTP handler, so a slow/failing task run can never
//! block the webhook response.

pub mod gmail;

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use aoc_domain::entities::{RunTrigger, ThreadType, TriggerType};
use aoc_domain::error::{Error, Result};
use aoc_domain::event::EventKind;

use crate::bus::EventBus;
use crate::repos::TriggerRepo;
use crate::task_runner::{TaskRunner, TaskTrigger};

type HmacSha256 = Hmac<Sha256>;

/// Validates and publishes webhook deliveries. Gmail push lives in
/// [`gmail::GmailIngest`], which additionally needs watch state and a
/// [`gmail::GmailClient`].
pub struct WebhookIngest {
    triggers: Arc<TriggerRepo>,
    bus: Arc<EventBus>,
    max_body_bytes: usize,
}

impl WebhookIngest {
    pub fn new(triggers: Arc<TriggerRepo>, bus: Arc<EventBus>, max_body_bytes: usize) -> Self {
        Self { triggers, bus, max_body_bytes }
    }

    /// Validate one webhook delivery and publish `TRIGGER_FIRED` on
    /// success. `signature_header` is the raw `X-Signature` value;
    /// `raw_body` is the exact bytes the signature was computed over —
    /// the caller must pass the body before any JSON reformatting.
    pub fn handle_webhook(&self, trigger_id: Uuid, signature_header: &str, raw_body: &[u8]) -> Result<()> {
        if raw_body.len() > self.max_body_bytes {
            return Err(Error::PayloadTooLarge(format!(
                "webhook body of {} bytes exceeds the {}-byte limit",
                raw_body.len(),
                self.max_body_bytes
            )));
        }

        let trigger = self.triggers.get(trigger_id)?;
        if trigger.kind != TriggerType::Webhook {
            return Err(Error::InvalidArgument("trigger is not a webhook trigger".into()));
        }

        verify_hmac(&trigger.secret, raw_body, signature_header)?;

        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|e| Error::InvalidArgument(format!("malformed JSON body: {e}")))?;

        self.bus.publish(EventKind::TriggerFired {
            trigger_id: trigger.id,
            agent_id: trigger.agent_id,
            payload,
        });
        Ok(())
    }
}

/// `hex(HMAC-SHA256(secret, body))`, compared in constant time.
fn verify_hmac(secret: &str, body: &[u8], signature_header: &str) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Invariant(format!("invalid HMAC key: {e}")))?;
    mac.update(body);
    let expected_hex = hex::encode(mac.finalize().into_bytes());

    let provided = signature_header.trim();
    let matches = expected_hex.len() == provided.len()
        && bool::from(expected_hex.as_bytes().ct_eq(provided.as_bytes()));
    if matches {
        Ok(())
    } else {
        Err(Error::Unauthorized("webhook signature mismatch".into()))
    }
}

/// Subscribes to the event bus and turns every `TRIGGER_FIRED` into a
/// task-runner dispatch. One dedicated background task, same shape as
/// [`crate::hub::Hub::spawn`].
pub struct TriggerDispatcher {
    triggers: Arc<TriggerRepo>,
    task_runner: Arc<TaskRunner>,
    bus: Arc<EventBus>,
}

impl TriggerDispatcher {
    pub fn new(triggers: Arc<TriggerRepo>, task_runner: Arc<TaskRunner>, bus: Arc<EventBus>) -> Self {
        Self { triggers, task_runner, bus }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(EventKind::TriggerFired { trigger_id, agent_id, payload }) => {
                        self.dispatch(trigger_id, agent_id, payload).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "trigger dispatcher lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn dispatch(&self, trigger_id: Uuid, agent_id: Uuid, payload: Value) {
        let trigger_kind = self.triggers.get(trigger_id).map(|t| t.kind).unwrap_or(TriggerType::Webhook);
        let (thread_type, run_trigger) = match trigger_kind {
            TriggerType::Webhook => (ThreadType::Webhook, RunTrigger::Webhook),
            TriggerType::Email => (ThreadType::Email, RunTrigger::Email),
        };
        let task_override = serde_json::to_string_pretty(&payload).ok();
        let trigger = TaskTrigger::New { thread_type, trigger: run_trigger, task_override };

        match self.task_runner.execute_agent_task(agent_id, trigger).await {
            Ok(_) => {}
            Err(Error::Conflict(_)) => {
                tracing::debug!(%agent_id, %trigger_id, "agent already running, trigger dropped");
            }
            Err(e) => {
                tracing::warn!(%agent_id, %trigger_id, error = %e, "trigger-driven task dispatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_domain::entities::Trigger;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_trigger(agent_id: Uuid, secret: &str) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            agent_id,
            kind: TriggerType::Webhook,
            secret: secret.to_string(),
            config: Value::Null,
            last_message_key: None,
            history_id: None,
            watch_expiry: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn ingest(dir: &std::path::Path) -> (WebhookIngest, Arc<TriggerRepo>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let triggers = Arc::new(TriggerRepo::load(dir, bus.clone()).unwrap());
        (WebhookIngest::new(triggers.clone(), bus.clone(), 128 * 1024), triggers, bus)
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_publishes_trigger_fired() {
        let dir = tempdir().unwrap();
        let (ingest, triggers, bus) = ingest(dir.path());
        let agent_id = Uuid::new_v4();
        let trigger = triggers.create(sample_trigger(agent_id, "s3cr3t")).unwrap();

        let mut rx = bus.subscribe();
        let body = serde_json::to_vec(&json!({"hello": "world"})).unwrap();
        let sig = sign("s3cr3t", &body);

        ingest.handle_webhook(trigger.id, &sig, &body).unwrap();

        match rx.try_recv().unwrap() {
            EventKind::TriggerFired { trigger_id, agent_id: a, .. } => {
                assert_eq!(trigger_id, trigger.id);
                assert_eq!(a, agent_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let dir = tempdir().unwrap();
        let (ingest, triggers, _bus) = ingest(dir.path());
        let trigger = triggers.create(sample_trigger(Uuid::new_v4(), "s3cr3t")).unwrap();

        let body = b"{}";
        let result = ingest.handle_webhook(trigger.id, "deadbeef", body);
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    #[test]
    fn oversized_body_is_rejected_before_hmac() {
        let dir = tempdir().unwrap();
        let (_ingest, triggers, bus) = ingest(dir.path());
        let trigger = triggers.create(sample_trigger(Uuid::new_v4(), "s3cr3t")).unwrap();

        let small = WebhookIngest::new(triggers, bus, 8);
        let body = vec![b'a'; 200];
        let result = small.handle_webhook(trigger.id, "irrelevant", &body);
        assert!(matches!(result, Err(Error::PayloadTooLarge(_))));
    }

    #[test]
    fn unknown_trigger_is_not_found() {
        let dir = tempdir().unwrap();
        let (ingest, _triggers, _bus) = ingest(dir.path());
        let result = ingest.handle_webhook(Uuid::new_v4(), "x", b"{}");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn malformed_json_is_rejected_even_with_a_correct_signature() {
        let dir = tempdir().unwrap();
        let (ingest, triggers, _bus) = ingest(dir.path());
        let trigger = triggers.create(sample_trigger(Uuid::new_v4(), "s3cr3t")).unwrap();

        let body = b"not json";
        let sig = sign("s3cr3t", body);
        let result = ingest.handle_webhook(trigger.id, &sig, body);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
