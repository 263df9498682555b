//! C5 Run Executor — drives one `call_model` / `call_tools` loop for a
//! thread and persists the new messages it produces.
//!
//! Same streaming-event translation and parallel tool dispatch via
//! `join_all` as a conventional turn loop, but every persisted write goes
//! through `aoc_sessions::ThreadStore` and every emitted event goes
//! through the shared [`crate::bus::EventBus`] instead of a private
//! per-turn broadcast channel. There is no quota, compaction, memory,
//! workspace, or skill-context machinery here — this loop is just
//! model-call, tool-call, repeat.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;

use aoc_domain::entities::{Agent, Message as EntityMessage, MessageRole, Thread};
use aoc_domain::error::{Error, Result};
use aoc_domain::event::{EventKind, StreamChunkType};
use aoc_domain::stream::{StreamEvent, Usage};
use aoc_domain::tool::{ContentPart, Message as WireMessage, MessageContent, Role, ToolCall, ToolDefinition};
use aoc_providers::{ChatRequest, ProviderRegistry};
use aoc_sessions::ThreadStore;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::cancel::CancelToken;
use crate::tools::ToolRegistry;

/// Hard ceiling on `call_model` -> `call_tools` iterations within one
/// turn, guarding against a model that never stops requesting tools.
const MAX_TOOL_LOOPS: usize = 25;
const MODEL_CALL_RETRIES: usize = 2;
const MODEL_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

pub enum RunMode {
    SingleTurn,
    TaskRun,
}

pub struct RunOptions {
    pub stream_tokens: bool,
    pub mode: RunMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { stream_tokens: true, mode: RunMode::SingleTurn }
    }
}

pub struct RunExecutor {
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    threads: Arc<ThreadStore>,
    bus: Arc<EventBus>,
}

struct ModelTurn {
    content: String,
    tool_calls: Vec<ToolCall>,
    #[allow(dead_code)]
    usage: Option<Usage>,
}

impl RunExecutor {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        threads: Arc<ThreadStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self { providers, tools, threads, bus }
    }

    /// Execute one turn/run of `agent` over `thread`, returning the new
    /// messages it produced (never a re-send of already-persisted ones).
    pub async fn run_thread(
        &self,
        agent: &Agent,
        thread: &Thread,
        options: RunOptions,
        cancel: CancelToken,
    ) -> Result<Vec<EntityMessage>> {
        let history = self.threads.list_messages(thread.id, None, None)?;
        if history.first().map(|m| m.role != MessageRole::System).unwrap_or(true) {
            return Err(Error::Invariant("thread is missing its leading system message".into()));
        }

        let (provider_id, model_name) = split_model_ref(&agent.model)?;
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| Error::Unavailable(format!("no provider registered for '{provider_id}'")))?;
        let tool_defs = self.tools.definitions_for_agent(&agent.allowed_tools);

        let mut wire_messages: Vec<WireMessage> = history.iter().map(to_wire_message).collect();
        let mut new_messages: Vec<EntityMessage> = Vec::new();

        self.bus.publish(EventKind::StreamStart { thread_id: thread.id });

        for _loop_idx in 0..MAX_TOOL_LOOPS {
            if cancel.is_cancelled() {
                self.bus.publish(EventKind::StreamEnd { thread_id: thread.id });
                return Err(Error::Cancelled);
            }

            let req = ChatRequest {
                messages: wire_messages.clone(),
                tools: tool_defs.clone(),
                temperature: Some(agent.temperature),
                max_tokens: None,
                json_mode: false,
                model: Some(model_name.to_string()),
            };

            let turn = self
                .call_model_with_retry(provider.as_ref(), req, thread.id, options.stream_tokens, &cancel)
                .await?;

            let tool_calls_json = if turn.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_value(&turn.tool_calls).map_err(|e| Error::Storage(e.to_string()))?)
            };
            let assistant_msg = EntityMessage::assistant(thread.id, turn.content.clone(), tool_calls_json.clone());
            self.threads.append_messages(thread.id, vec![assistant_msg.clone()])?;
            new_messages.push(assistant_msg.clone());
            self.bus.publish(EventKind::AssistantId { thread_id: thread.id, message_id: assistant_msg.id });

            wire_messages.push(assistant_wire_message(&turn.content, &turn.tool_calls));

            if turn.tool_calls.is_empty() {
                break;
            }

            if cancel.is_cancelled() {
                self.bus.publish(EventKind::StreamEnd { thread_id: thread.id });
                return Err(Error::Cancelled);
            }

            let results = join_all(
                turn.tool_calls
                    .iter()
                    .map(|call| self.tools.invoke(&call.tool_name, call.arguments.clone())),
            )
            .await;

            let mut tool_messages = Vec::with_capacity(results.len());
            for (call, (content, _is_error)) in turn.tool_calls.iter().zip(results.into_iter()) {
                let tool_msg = EntityMessage::tool_output(
                    thread.id,
                    assistant_msg.id,
                    call.tool_name.clone(),
                    call.call_id.clone(),
                    content.clone(),
                );
                self.bus.publish(EventKind::StreamChunk {
                    thread_id: thread.id,
                    chunk_type: StreamChunkType::ToolOutput,
                    content: content.clone(),
                    tool_name: Some(call.tool_name.clone()),
                    tool_call_id: Some(call.call_id.clone()),
                    message_id: Some(tool_msg.id),
                });
                wire_messages.push(WireMessage::tool_result(call.call_id.clone(), content));
                tool_messages.push(tool_msg);
            }
            self.threads.append_messages(thread.id, tool_messages.clone())?;
            new_messages.extend(tool_messages);
        }

        self.bus.publish(EventKind::StreamEnd { thread_id: thread.id });
        Ok(new_messages)
    }

    async fn call_model_with_retry(
        &self,
        provider: &(dyn aoc_providers::LlmProvider),
        req: ChatRequest,
        thread_id: Uuid,
        stream_tokens: bool,
        cancel: &CancelToken,
    ) -> Result<ModelTurn> {
        let mut attempt = 0;
        loop {
            let result = if stream_tokens {
                self.call_model_streaming(provider, req.clone(), thread_id, cancel).await
            } else {
                self.call_model_once(provider, req.clone(), thread_id).await
            };

            match result {
                Ok(turn) => return Ok(turn),
                Err(_e) if attempt < MODEL_CALL_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(MODEL_RETRY_BASE_DELAY * 2u32.pow(attempt as u32 - 1)).await;
                }
                Err(e) => return Err(Error::Unavailable(format!("model unavailable after {attempt} retries: {e}"))),
            }
        }
    }

    async fn call_model_once(
        &self,
        provider: &(dyn aoc_providers::LlmProvider),
        req: ChatRequest,
        thread_id: Uuid,
    ) -> Result<ModelTurn> {
        let resp = provider.chat(req).await?;
        if !resp.content.is_empty() {
            self.bus.publish(EventKind::StreamChunk {
                thread_id,
                chunk_type: StreamChunkType::AssistantMessage,
                content: resp.content.clone(),
                tool_name: None,
                tool_call_id: None,
                message_id: None,
            });
        }
        Ok(ModelTurn { content: resp.content, tool_calls: resp.tool_calls, usage: resp.usage })
    }

    async fn call_model_streaming(
        &self,
        provider: &(dyn aoc_providers::LlmProvider),
        req: ChatRequest,
        thread_id: Uuid,
        cancel: &CancelToken,
    ) -> Result<ModelTurn> {
        let mut stream = provider.chat_stream(req).await?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match event? {
                StreamEvent::Token { text } => {
                    content.push_str(&text);
                    self.bus.publish(EventKind::StreamChunk {
                        thread_id,
                        chunk_type: StreamChunkType::AssistantToken,
                        content: text,
                        tool_name: None,
                        tool_call_id: None,
                        message_id: None,
                    });
                }
                StreamEvent::ToolCallFinished { call_id, tool_name, arguments } => {
                    tool_calls.push(ToolCall { call_id, tool_name, arguments });
                }
                StreamEvent::ToolCallStarted { .. } | StreamEvent::ToolCallDelta { .. } => {}
                StreamEvent::Done { usage: u, .. } => {
                    usage = u;
                    break;
                }
                StreamEvent::Error { message } => return Err(Error::Provider { provider: provider.provider_id().to_string(), message }),
            }
        }

        Ok(ModelTurn { content, tool_calls, usage })
    }
}

fn split_model_ref(model_ref: &str) -> Result<(&str, &str)> {
    model_ref
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("agent model '{model_ref}' must be 'provider/model'")))
}

fn to_wire_message(m: &EntityMessage) -> WireMessage {
    match m.role {
        MessageRole::System => WireMessage::system(m.content.clone()),
        MessageRole::User => WireMessage::user(m.content.clone()),
        MessageRole::Assistant => {
            let tool_calls: Vec<ToolCall> = m
                .tool_calls
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            assistant_wire_message(&m.content, &tool_calls)
        }
        MessageRole::Tool => WireMessage::tool_result(
            m.tool_call_id.clone().unwrap_or_default(),
            m.content.clone(),
        ),
    }
}

fn assistant_wire_message(content: &str, tool_calls: &[ToolCall]) -> WireMessage {
    if tool_calls.is_empty() {
        return WireMessage::assistant(content.to_string());
    }
    let mut parts = Vec::with_capacity(tool_calls.len() + 1);
    if !content.is_empty() {
        parts.push(ContentPart::Text { text: content.to_string() });
    }
    for call in tool_calls {
        parts.push(ContentPart::ToolUse {
            id: call.call_id.clone(),
            name: call.tool_name.clone(),
            input: call.arguments.clone(),
        });
    }
    WireMessage { role: Role::Assistant, content: MessageContent::Parts(parts) }
}

/// Tool names an agent exposes, used by callers building agent-facing
/// summaries; kept here since it's a thin wrapper over the registry.
pub fn describe_tools(defs: &[ToolDefinition]) -> HashSet<String> {
    defs.iter().map(|d| d.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_domain::entities::{AgentStatus, ThreadType};
    use aoc_domain::stream::BoxStream;
    use async_trait::async_trait;
    use regex::RegexSet;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::collections::HashSet as StdHashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// A scripted [`aoc_providers::LlmProvider`] that hands back one
    /// `ChatResponse` per call, advancing through a fixed script.
    struct ScriptedProvider {
        responses: std::sync::Mutex<Vec<aoc_providers::ChatResponse>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<aoc_providers::ChatResponse>) -> Arc<Self> {
            Arc::new(Self { responses: std::sync::Mutex::new(responses), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl aoc_providers::LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: ChatRequest) -> Result<aoc_providers::ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(Error::Provider { provider: "scripted".into(), message: "script exhausted".into() });
            }
            Ok(responses.remove(0))
        }

        async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            unimplemented!("run_thread uses non-streaming calls in these tests")
        }

        async fn embeddings(
            &self,
            _req: aoc_providers::EmbeddingsRequest,
        ) -> Result<aoc_providers::EmbeddingsResponse> {
            unimplemented!("not exercised here")
        }

        fn capabilities(&self) -> &aoc_domain::capability::LlmCapabilities {
            static CAPS: std::sync::OnceLock<aoc_domain::capability::LlmCapabilities> = std::sync::OnceLock::new();
            CAPS.get_or_init(aoc_domain::capability::LlmCapabilities::default)
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    fn plain_response(content: &str) -> aoc_providers::ChatResponse {
        aoc_providers::ChatResponse {
            content: content.to_string(),
            tool_calls: Vec::new(),
            usage: None,
            model: "scripted-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    fn tool_call_response(tool_name: &str, call_id: &str, arguments: Value) -> aoc_providers::ChatResponse {
        aoc_providers::ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall { call_id: call_id.to_string(), tool_name: tool_name.to_string(), arguments }],
            usage: None,
            model: "scripted-model".to_string(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }

    fn test_agent() -> Agent {
        let now = chrono::Utc::now();
        Agent {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "tester".into(),
            system_instructions: "You are a test agent.".into(),
            task_instructions: String::new(),
            model: "scripted/scripted-model".into(),
            temperature: 0.5,
            schedule: None,
            status: AgentStatus::Idle,
            last_run_at: None,
            next_run_at: None,
            last_error: None,
            config: Value::Null,
            allowed_tools: StdHashSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn harness(provider: Arc<dyn aoc_providers::LlmProvider>) -> (RunExecutor, Arc<ThreadStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let threads = Arc::new(ThreadStore::load(tmp.path()).unwrap());

        let mut providers = HashMap::new();
        providers.insert("scripted".to_string(), provider);
        let registry = Arc::new(ProviderRegistry::from_providers(providers, HashMap::new()));

        let processes = Arc::new(aoc_tools::ProcessManager::new(Default::default()));
        let mcp = Arc::new(aoc_mcp_client::McpManager::empty());
        let tools = Arc::new(crate::tools::ToolRegistry::new(processes, mcp, RegexSet::new(Vec::<String>::new()).unwrap()));

        let bus = Arc::new(EventBus::new());
        let executor = RunExecutor::new(registry, tools, threads.clone(), bus);
        (executor, threads, tmp)
    }

    #[tokio::test]
    async fn single_turn_with_no_tool_calls_persists_one_assistant_message() {
        let provider = ScriptedProvider::new(vec![plain_response("hello there")]);
        let (executor, threads, _tmp) = harness(provider);

        let agent = test_agent();
        let thread = threads
            .create_thread_with_system_message(&agent, ThreadType::Chat, "test thread")
            .unwrap();
        threads.append_messages(thread.id, vec![EntityMessage::user(thread.id, "hi")]).unwrap();

        let new_messages = executor
            .run_thread(&agent, &thread, RunOptions { stream_tokens: false, mode: RunMode::SingleTurn }, CancelToken::new())
            .await
            .unwrap();

        assert_eq!(new_messages.len(), 1);
        assert_eq!(new_messages[0].role, MessageRole::Assistant);
        assert_eq!(new_messages[0].content, "hello there");

        let persisted = threads.list_messages(thread.id, None, None).unwrap();
        // system + user + assistant
        assert_eq!(persisted.len(), 3);
    }

    #[tokio::test]
    async fn tool_call_loop_appends_assistant_and_tool_messages_then_stops() {
        let provider = ScriptedProvider::new(vec![
            tool_call_response("get_current_time", "call-1", json!({})),
            plain_response("done"),
        ]);
        let (executor, threads, _tmp) = harness(provider);

        let mut agent = test_agent();
        agent.allowed_tools = StdHashSet::new();
        let thread = threads
            .create_thread_with_system_message(&agent, ThreadType::Chat, "test thread")
            .unwrap();
        threads.append_messages(thread.id, vec![EntityMessage::user(thread.id, "what time is it?")]).unwrap();

        let new_messages = executor
            .run_thread(&agent, &thread, RunOptions { stream_tokens: false, mode: RunMode::SingleTurn }, CancelToken::new())
            .await
            .unwrap();

        // assistant (tool call) + tool output + assistant (final) == 3
        assert_eq!(new_messages.len(), 3);
        assert_eq!(new_messages[0].role, MessageRole::Assistant);
        assert_eq!(new_messages[1].role, MessageRole::Tool);
        assert_eq!(new_messages[1].tool_name.as_deref(), Some("get_current_time"));
        assert_eq!(new_messages[2].role, MessageRole::Assistant);
        assert_eq!(new_messages[2].content, "done");
    }

    #[tokio::test]
    async fn missing_leading_system_message_is_an_invariant_error() {
        // Write a thread's transcript directly (bypassing
        // `create_thread_with_system_message`) so its first message is a
        // user message, then load it through the normal store API.
        let tmp = TempDir::new().unwrap();
        let threads_dir = tmp.path().join("threads");
        std::fs::create_dir_all(&threads_dir).unwrap();

        let agent = test_agent();
        let thread = aoc_domain::entities::Thread {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            title: "orphan".into(),
            thread_type: ThreadType::Chat,
            agent_state: Value::Null,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        std::fs::write(
            threads_dir.join(format!("{}.json", thread.id)),
            serde_json::to_string(&thread).unwrap(),
        )
        .unwrap();
        let log = aoc_sessions::transcript::TranscriptLog::new(&threads_dir, thread.id);
        log.append(&EntityMessage::user(thread.id, "no system message here")).unwrap();

        let threads = Arc::new(ThreadStore::load(tmp.path()).unwrap());
        let provider = ScriptedProvider::new(vec![plain_response("unreachable")]);
        let mut providers = HashMap::new();
        providers.insert("scripted".to_string(), provider as Arc<dyn aoc_providers::LlmProvider>);
        let registry = Arc::new(ProviderRegistry::from_providers(providers, HashMap::new()));
        let processes = Arc::new(aoc_tools::ProcessManager::new(Default::default()));
        let mcp = Arc::new(aoc_mcp_client::McpManager::empty());
        let tools = Arc::new(crate::tools::ToolRegistry::new(processes, mcp, RegexSet::new(Vec::<String>::new()).unwrap()));
        let bus = Arc::new(EventBus::new());
        let executor = RunExecutor::new(registry, tools, threads.clone(), bus);

        let result = executor
            .run_thread(&agent, &thread, RunOptions { stream_tokens: false, mode: RunMode::SingleTurn }, CancelToken::new())
            .await;

        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[tokio::test]
    async fn cancelled_before_first_model_call_returns_cancelled_error() {
        let provider = ScriptedProvider::new(vec![plain_response("unreachable")]);
        let (executor, threads, _tmp) = harness(provider);

        let agent = test_agent();
        let thread = threads
            .create_thread_with_system_message(&agent, ThreadType::Chat, "test thread")
            .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();

        let result = executor
            .run_thread(&agent, &thread, RunOptions { stream_tokens: false, mode: RunMode::SingleTurn }, cancel)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
