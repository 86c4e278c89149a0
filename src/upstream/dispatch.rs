//! Routing a request across nodes and credentials.
//!
//! The dispatcher composes the four control-plane components: membership
//! picks candidate nodes, the breaker registry isolates failing nodes, the
//! pool supplies a keep-alive connection, and the rotation manager supplies
//! the credential. Pre-call rejections (open circuit, pool backpressure) move
//! on to the next candidate; an upstream failure is reported to both the
//! breaker and the rotation manager and returned to the caller.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cluster::{MembershipTracker, Node};
use crate::credentials::{Credential, CredentialRotationManager, FailureInfo, KeyModelPair};
use crate::error::{AppError, Result};
use crate::reliability::{node_key, BreakerRegistry};
use crate::upstream::client::HttpConnector;
use crate::upstream::pool::ConnectionPool;

/// A chat completion request to route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Model to run; the active credential's model when absent.
    #[serde(default)]
    pub model: Option<String>,
    pub body: Value,
}

/// Where a request ran and what came back.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub node_id: String,
    pub model: String,
    pub credential_index: Option<usize>,
    pub response: Value,
}

/// Result of one slot in a fan-out.
#[derive(Debug)]
pub struct FanOutResult {
    pub index: usize,
    pub model: String,
    pub result: Result<DispatchOutcome>,
}

/// Routes inference requests.
pub struct InferenceDispatcher {
    membership: Arc<MembershipTracker>,
    breakers: Arc<BreakerRegistry>,
    pool: ConnectionPool<HttpConnector>,
    credentials: Arc<CredentialRotationManager>,
}

fn with_model(mut body: Value, model: &str) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert("model".to_string(), Value::String(model.to_string()));
    }
    body
}

impl InferenceDispatcher {
    pub fn new(
        membership: Arc<MembershipTracker>,
        breakers: Arc<BreakerRegistry>,
        pool: ConnectionPool<HttpConnector>,
        credentials: Arc<CredentialRotationManager>,
    ) -> Self {
        Self {
            membership,
            breakers,
            pool,
            credentials,
        }
    }

    /// Run `request` on the best available node with the active credential.
    #[instrument(skip(self, request), fields(model = ?request.model))]
    pub async fn dispatch(&self, request: InferenceRequest) -> Result<DispatchOutcome> {
        let model = request
            .model
            .unwrap_or_else(|| self.credentials.get_current_model());

        let candidates = self.membership.candidates_for_model(&model);
        if candidates.is_empty() {
            return Err(AppError::NoCapacity { model });
        }
        self.credentials.ensure_available()?;

        let credential_index = (!self.credentials.is_empty()).then(|| self.credentials.current_index());
        let credential = self.credentials.get_current();
        let body = with_model(request.body, &model);

        match self
            .try_candidates(&candidates, &model, &body, credential.as_ref(), credential_index)
            .await
        {
            Ok(outcome) => {
                self.credentials.report_success();
                Ok(outcome)
            }
            Err(e) if e.counts_as_endpoint_failure() => {
                let rotated = self.credentials.report_failure(&FailureInfo::from(&e));
                warn!(model = %model, error = %e, rotated, "Upstream call failed");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Drive every (credential, model) slot concurrently with the same body.
    ///
    /// Each slot's outcome is recorded against that slot; the active pointer
    /// is left alone.
    pub async fn fan_out(&self, body: &Value) -> Vec<FanOutResult> {
        let pairs = self.credentials.get_all_key_model_pairs();
        debug!(slots = pairs.len(), "Fanning out request");

        let calls = pairs.into_iter().map(|pair| async move {
            let result = self.dispatch_pair(&pair, body).await;
            match &result {
                Ok(_) => self.credentials.report_outcome_for(pair.index, None),
                Err(e) if e.counts_as_endpoint_failure() => self
                    .credentials
                    .report_outcome_for(pair.index, Some(&FailureInfo::from(e))),
                Err(_) => {}
            }
            FanOutResult {
                index: pair.index,
                model: pair.model,
                result,
            }
        });
        join_all(calls).await
    }

    async fn dispatch_pair(&self, pair: &KeyModelPair, body: &Value) -> Result<DispatchOutcome> {
        let candidates = self.membership.candidates_for_model(&pair.model);
        if candidates.is_empty() {
            return Err(AppError::NoCapacity {
                model: pair.model.clone(),
            });
        }
        let body = with_model(body.clone(), &pair.model);
        self.try_candidates(&candidates, &pair.model, &body, Some(&pair.credential), Some(pair.index))
            .await
    }

    async fn try_candidates(
        &self,
        candidates: &[Node],
        model: &str,
        body: &Value,
        credential: Option<&Credential>,
        credential_index: Option<usize>,
    ) -> Result<DispatchOutcome> {
        let mut last_error = None;
        for node in candidates {
            match self.call_node(node, body, credential).await {
                Ok(response) => {
                    return Ok(DispatchOutcome {
                        node_id: node.id.clone(),
                        model: model.to_string(),
                        credential_index,
                        response,
                    })
                }
                Err(e) if !e.counts_as_endpoint_failure() => {
                    debug!(node_id = %node.id, error = %e, "Node unavailable, trying next candidate");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::NoCapacity {
            model: model.to_string(),
        }))
    }

    async fn call_node(&self, node: &Node, body: &Value, credential: Option<&Credential>) -> Result<Value> {
        let breaker = self.breakers.get_or_create(&node_key(&node.id), None);
        let base_url = node.base_url();
        breaker
            .execute(self.pool.with_connection(&base_url, |client| async move {
                client.chat_completion(body, credential).await
            }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterMessage, MembershipConfig, MessageKind};
    use crate::credentials::{CredentialSlot, CredentialSource, RotationConfig};
    use crate::reliability::{CircuitBreakerConfig, Scheduler};
    use crate::upstream::pool::PoolConfig;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        dispatcher: InferenceDispatcher,
        membership: Arc<MembershipTracker>,
        breakers: Arc<BreakerRegistry>,
        credentials: Arc<CredentialRotationManager>,
    }

    async fn harness(keys: &[(&str, &str)]) -> Harness {
        let membership = MembershipTracker::new(MembershipConfig::default());
        let breakers = Arc::new(BreakerRegistry::new(
            CircuitBreakerConfig::default(),
            Scheduler::new(),
        ));
        let pool = ConnectionPool::new(
            HttpConnector::default(),
            PoolConfig {
                min_size: 0,
                ..Default::default()
            },
            Scheduler::new(),
        )
        .await
        .unwrap();
        let slots = keys
            .iter()
            .enumerate()
            .map(|(i, (key, model))| CredentialSlot {
                credential: Credential::new(*key),
                model: Some(model.to_string()),
                source: CredentialSource::Config,
                entry: i + 1,
            })
            .collect();
        let credentials = Arc::new(CredentialRotationManager::new(slots, RotationConfig::default()));

        Harness {
            dispatcher: InferenceDispatcher::new(
                Arc::clone(&membership),
                Arc::clone(&breakers),
                pool,
                Arc::clone(&credentials),
            ),
            membership,
            breakers,
            credentials,
        }
    }

    /// Register `server` as an online node; larger `age_ms` means higher latency.
    fn register(membership: &MembershipTracker, server: &MockServer, models: &[&str], age_ms: i64) -> String {
        let addr = server.address();
        let node_id = format!("{}:{}", addr.ip(), addr.port());
        let mut message = ClusterMessage::new(MessageKind::Announce, node_id.clone(), json!({ "models": models }));
        message.timestamp -= age_ms;
        membership.handle_message(&message);
        node_id
    }

    async fn chat_server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({"id": "cmpl"})))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_dispatch_uses_active_credential_and_model() {
        let h = harness(&[("sk-first-key-aaaa", "llama3")]).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-first-key-aaaa"))
            .and(body_partial_json(json!({"model": "llama3"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ok"})))
            .expect(1)
            .mount(&server)
            .await;
        let node_id = register(&h.membership, &server, &["llama3"], 0);

        let outcome = h
            .dispatcher
            .dispatch(InferenceRequest {
                model: None,
                body: json!({"messages": []}),
            })
            .await
            .unwrap();
        assert_eq!(outcome.node_id, node_id);
        assert_eq!(outcome.credential_index, Some(0));
        assert_eq!(outcome.response["id"], "ok");
    }

    #[tokio::test]
    async fn test_no_online_node_is_no_capacity() {
        let h = harness(&[("sk-first-key-aaaa", "llama3")]).await;
        let err = h
            .dispatcher
            .dispatch(InferenceRequest {
                model: Some("qwen".to_string()),
                body: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoCapacity { model } if model == "qwen"));
    }

    #[tokio::test]
    async fn test_open_circuit_falls_through_to_next_node() {
        let h = harness(&[("sk-first-key-aaaa", "llama3")]).await;
        let fast = chat_server(200).await;
        let slow = chat_server(200).await;
        let fast_id = register(&h.membership, &fast, &["llama3"], 0);
        let slow_id = register(&h.membership, &slow, &["llama3"], 5_000);

        h.breakers.get_or_create(&node_key(&fast_id), None).trip();

        let outcome = h
            .dispatcher
            .dispatch(InferenceRequest {
                model: None,
                body: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(outcome.node_id, slow_id);
    }

    #[tokio::test]
    async fn test_every_circuit_open_returns_circuit_open() {
        let h = harness(&[]).await;
        let server = chat_server(200).await;
        let node_id = register(&h.membership, &server, &["default"], 0);
        h.breakers.get_or_create(&node_key(&node_id), None).trip();

        let err = h
            .dispatcher
            .dispatch(InferenceRequest {
                model: None,
                body: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_rotates_credential_and_counts_against_breaker() {
        let h = harness(&[("sk-first-key-aaaa", "llama3"), ("sk-second-key-bbbb", "llama3")]).await;
        let server = chat_server(429).await;
        let node_id = register(&h.membership, &server, &["llama3"], 0);

        let err = h
            .dispatcher
            .dispatch(InferenceRequest {
                model: None,
                body: json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.upstream_status(), Some(429));
        assert_eq!(h.credentials.current_index(), 1);
        assert_eq!(
            h.breakers.get(&node_key(&node_id)).unwrap().failure_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_exhausted_credentials_report_retry_after() {
        let h = harness(&[("sk-first-key-aaaa", "llama3")]).await;
        let server = chat_server(200).await;
        register(&h.membership, &server, &["llama3"], 0);
        h.credentials.report_failure(&FailureInfo::new(Some(429), "quota"));

        let err = h
            .dispatcher
            .dispatch(InferenceRequest {
                model: None,
                body: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AllCredentialsCooling { .. }));
        assert!(err.retry_after().is_some());
    }

    #[tokio::test]
    async fn test_fan_out_drives_every_slot() {
        let h = harness(&[("sk-first-key-aaaa", "llama3"), ("sk-second-key-bbbb", "qwen")]).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "llama3"})))
            .and(header("authorization", "Bearer sk-first-key-aaaa"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "qwen"})))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        register(&h.membership, &server, &["llama3", "qwen"], 0);

        let results = h.dispatcher.fan_out(&json!({"messages": []})).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].result.as_ref().unwrap().response["id"], "a");
        assert_eq!(results[1].model, "qwen");
        assert_eq!(
            results[1].result.as_ref().unwrap_err().upstream_status(),
            Some(503)
        );

        // Fan-out records per slot but never moves the active pointer.
        assert_eq!(h.credentials.current_index(), 0);
        assert_eq!(h.credentials.get_keys_in_cooldown_count(), 1);
    }
}
