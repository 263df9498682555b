//! Integration tests for `LlmRouter` — capability-gated fallback across a
//! registry of fake providers, without requiring any real network calls.

use aoc_domain::capability::{LlmCapabilities, ToolSupport};
use aoc_domain::config::{FallbackConfig, RoleConfig};
use aoc_domain::error::{Error, Result};
use aoc_domain::stream::{BoxStream, StreamEvent};
use aoc_providers::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider, LlmRouter, ProviderRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A provider double whose behavior is scripted by the test.
struct FakeProvider {
    id: String,
    capabilities: LlmCapabilities,
    behavior: FakeBehavior,
    calls: AtomicUsize,
}

#[derive(Clone)]
enum FakeBehavior {
    Succeed,
    Fail(fn() -> Error),
}

impl FakeProvider {
    fn new(id: &str, capabilities: LlmCapabilities, behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            capabilities,
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for FakeProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            FakeBehavior::Succeed => Ok(ChatResponse {
                content: format!("hello from {}", self.id),
                tool_calls: Vec::new(),
                usage: None,
                model: req.model.unwrap_or_default(),
                finish_reason: Some("stop".to_string()),
            }),
            FakeBehavior::Fail(make_err) => Err(make_err()),
        }
    }

    async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        unimplemented!("not exercised by these tests")
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        unimplemented!("not exercised by these tests")
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

fn tool_capable() -> LlmCapabilities {
    LlmCapabilities {
        supports_tools: ToolSupport::Basic,
        ..LlmCapabilities::default()
    }
}

fn no_tools() -> LlmCapabilities {
    LlmCapabilities::default()
}

fn role_config(model: &str, require_tools: bool, fallbacks: Vec<FallbackConfig>) -> RoleConfig {
    RoleConfig {
        model: model.to_string(),
        require_tools,
        require_json: false,
        require_streaming: false,
        fallbacks,
    }
}

fn router_with(
    providers: Vec<Arc<FakeProvider>>,
    roles: HashMap<String, RoleConfig>,
) -> LlmRouter {
    let mut registry_providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    let mut role_models = HashMap::new();
    for p in providers {
        registry_providers.insert(p.id.clone(), p.clone() as Arc<dyn LlmProvider>);
    }
    for (name, cfg) in &roles {
        role_models.insert(name.clone(), cfg.model.clone());
    }
    let registry = ProviderRegistry::from_providers(registry_providers, role_models);
    LlmRouter::new(registry, roles, 5_000)
}

fn executor_role() -> aoc_domain::capability::ModelRole {
    aoc_domain::capability::ModelRole::Executor
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Primary model success
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn primary_model_success_never_touches_fallback() {
    let primary = FakeProvider::new("openai", tool_capable(), FakeBehavior::Succeed);
    let fallback = FakeProvider::new("anthropic", tool_capable(), FakeBehavior::Succeed);

    let mut roles = HashMap::new();
    roles.insert(
        "executor".to_string(),
        role_config(
            "openai/gpt-4o",
            true,
            vec![FallbackConfig { model: "anthropic/claude-sonnet-4-5".into(), require_tools: true, require_json: false }],
        ),
    );

    let router = router_with(vec![primary.clone(), fallback.clone()], roles);
    let resp = router
        .chat_for_role(executor_role(), ChatRequest::default())
        .await
        .expect("primary should succeed");

    assert_eq!(resp.content, "hello from openai");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability-gated fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn primary_lacking_required_capability_falls_back() {
    // Primary advertises no tool support even though the role requires it.
    let primary = FakeProvider::new("cheap", no_tools(), FakeBehavior::Succeed);
    let fallback = FakeProvider::new("capable", tool_capable(), FakeBehavior::Succeed);

    let mut roles = HashMap::new();
    roles.insert(
        "executor".to_string(),
        role_config(
            "cheap/small-model",
            true,
            vec![FallbackConfig { model: "capable/big-model".into(), require_tools: true, require_json: false }],
        ),
    );

    let router = router_with(vec![primary.clone(), fallback.clone()], roles);
    let resp = router
        .chat_for_role(executor_role(), ChatRequest::default())
        .await
        .expect("should fall back to capable provider");

    assert_eq!(resp.content, "hello from capable");
    assert_eq!(primary.call_count(), 0, "incapable primary must never be called");
    assert_eq!(fallback.call_count(), 1);
}

#[tokio::test]
async fn fallback_that_also_lacks_capability_is_skipped() {
    let primary = FakeProvider::new("incapable-1", no_tools(), FakeBehavior::Succeed);
    let incapable_fallback = FakeProvider::new("incapable-2", no_tools(), FakeBehavior::Succeed);
    let capable_fallback = FakeProvider::new("capable", tool_capable(), FakeBehavior::Succeed);

    let mut roles = HashMap::new();
    roles.insert(
        "executor".to_string(),
        role_config(
            "incapable-1/m",
            true,
            vec![
                FallbackConfig { model: "incapable-2/m".into(), require_tools: true, require_json: false },
                FallbackConfig { model: "capable/m".into(), require_tools: true, require_json: false },
            ],
        ),
    );

    let router = router_with(
        vec![primary, incapable_fallback.clone(), capable_fallback.clone()],
        roles,
    );
    let resp = router
        .chat_for_role(executor_role(), ChatRequest::default())
        .await
        .expect("should skip the incapable fallback and use the capable one");

    assert_eq!(resp.content, "hello from capable");
    assert_eq!(incapable_fallback.call_count(), 0);
    assert_eq!(capable_fallback.call_count(), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retriable vs. non-retriable errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn retriable_primary_error_falls_through_to_fallback() {
    let primary = FakeProvider::new(
        "flaky",
        tool_capable(),
        FakeBehavior::Fail(|| Error::Timeout("flaky timed out".into())),
    );
    let fallback = FakeProvider::new("steady", tool_capable(), FakeBehavior::Succeed);

    let mut roles = HashMap::new();
    roles.insert(
        "executor".to_string(),
        role_config(
            "flaky/m",
            true,
            vec![FallbackConfig { model: "steady/m".into(), require_tools: true, require_json: false }],
        ),
    );

    let router = router_with(vec![primary.clone(), fallback.clone()], roles);
    let resp = router
        .chat_for_role(executor_role(), ChatRequest::default())
        .await
        .expect("timeout should be retriable and fall through");

    assert_eq!(resp.content, "hello from steady");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);
}

#[tokio::test]
async fn non_retriable_primary_error_returns_immediately_without_fallback() {
    let primary = FakeProvider::new(
        "broken",
        tool_capable(),
        FakeBehavior::Fail(|| Error::InvalidArgument("malformed request".into())),
    );
    let fallback = FakeProvider::new("never-called", tool_capable(), FakeBehavior::Succeed);

    let mut roles = HashMap::new();
    roles.insert(
        "executor".to_string(),
        role_config(
            "broken/m",
            true,
            vec![FallbackConfig { model: "never-called/m".into(), require_tools: true, require_json: false }],
        ),
    );

    let router = router_with(vec![primary.clone(), fallback.clone()], roles);
    let err = router
        .chat_for_role(executor_role(), ChatRequest::default())
        .await
        .expect_err("non-retriable error must propagate without trying fallback");

    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exhausted fallback chain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn all_models_failing_returns_router_error() {
    let primary = FakeProvider::new(
        "down-1",
        tool_capable(),
        FakeBehavior::Fail(|| Error::Timeout("down-1 timed out".into())),
    );
    let fallback = FakeProvider::new(
        "down-2",
        tool_capable(),
        FakeBehavior::Fail(|| Error::Timeout("down-2 timed out".into())),
    );

    let mut roles = HashMap::new();
    roles.insert(
        "executor".to_string(),
        role_config(
            "down-1/m",
            true,
            vec![FallbackConfig { model: "down-2/m".into(), require_tools: true, require_json: false }],
        ),
    );

    let router = router_with(vec![primary.clone(), fallback.clone()], roles);
    let err = router
        .chat_for_role(executor_role(), ChatRequest::default())
        .await
        .expect_err("exhausting all fallbacks must error");

    match err {
        Error::Provider { provider, message } => {
            assert_eq!(provider, "router");
            assert!(message.contains("executor"));
        }
        other => panic!("expected Error::Provider, got {other:?}"),
    }
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);
}

#[tokio::test]
async fn missing_role_config_is_a_config_error() {
    let router = router_with(vec![], HashMap::new());
    let err = router
        .chat_for_role(executor_role(), ChatRequest::default())
        .await
        .expect_err("role with no config must error");

    assert!(matches!(err, Error::Config(_)));
}
