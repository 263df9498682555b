use serde::Serialize;

/// Structured trace events emitted across the orchestration core.
///
/// These are logged via `tracing` as a single JSON-encoded field rather than
/// a full span tree; dashboards and log pipelines grep on `trace_event`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    RunStarted {
        run_id: String,
        agent_id: String,
        thread_id: String,
        trigger: String,
    },
    RunFinished {
        run_id: String,
        status: String,
        duration_ms: u64,
    },
    LlmRequest {
        provider: String,
        model: String,
        role: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    LlmFallback {
        from_provider: String,
        from_model: String,
        to_provider: String,
        to_model: String,
        reason: String,
    },
    ToolInvoked {
        tool_name: String,
        call_id: String,
        duration_ms: u64,
        is_error: bool,
    },
    ScheduleTick {
        due_count: usize,
    },
    TriggerFired {
        trigger_id: String,
        trigger_type: String,
        agent_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "trace_event");
    }
}

/// Current time in milliseconds since the Unix epoch, for envelope `ts` fields.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
