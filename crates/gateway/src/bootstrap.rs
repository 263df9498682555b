//! `AppState` construction and background-task spawning extracted from
//! `main.rs`, so `serve` and the `doctor`/`config` CLI subcommands share
//! one boot path.

use std::sync::Arc;

use anyhow::Context;
use regex::RegexSet;
use sha2::{Digest, Sha256};

use aoc_domain::config::{Config, ConfigSeverity};
use aoc_mcp_client::McpManager;
use aoc_providers::ProviderRegistry;
use aoc_sessions::ThreadStore;
use aoc_tools::ProcessManager;

use crate::bus::EventBus;
use crate::cancel::CancelMap;
use crate::executor::RunExecutor;
use crate::hub::Hub;
use crate::locks::AgentLockMap;
use crate::repos::{AgentRepo, CanvasRepo, RunRepo, TriggerRepo, UserRepo, WorkflowExecutionRepo, WorkflowRepo};
use crate::scheduler::Scheduler;
use crate::state::AppState;
use crate::task_runner::TaskRunner;
use crate::tools::ToolRegistry;
use crate::triggers::gmail::{GmailIngest, HttpGmailClient};
use crate::triggers::{TriggerDispatcher, WebhookIngest};
use crate::workflow_engine::WorkflowEngine;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`]. Shared by `serve` and the diagnostic CLI subcommands.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let data_dir = &config.storage.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    // ── Event bus (C2) ───────────────────────────────────────────────
    let bus = Arc::new(EventBus::new());

    // ── Repositories (C1) ────────────────────────────────────────────
    let agents = Arc::new(AgentRepo::load(data_dir, bus.clone()).context("loading agents")?);
    let runs = Arc::new(RunRepo::load(data_dir, bus.clone()).context("loading runs")?);
    let triggers = Arc::new(TriggerRepo::load(data_dir, bus.clone()).context("loading triggers")?);
    let users = Arc::new(UserRepo::load(data_dir, bus.clone()).context("loading users")?);
    let canvas = Arc::new(CanvasRepo::load(data_dir).context("loading canvas layouts")?);
    let workflows = Arc::new(WorkflowRepo::load(data_dir).context("loading workflows")?);
    let executions =
        Arc::new(WorkflowExecutionRepo::load(data_dir, bus.clone()).context("loading workflow executions")?);
    let threads = Arc::new(ThreadStore::load(data_dir).context("loading threads")?);
    tracing::info!(
        agents = agents.list_all().len(),
        threads = threads.thread_count(),
        "repositories loaded"
    );

    // ── Concurrency control ──────────────────────────────────────────
    let locks = Arc::new(AgentLockMap::new());
    let cancels = Arc::new(CancelMap::new());

    // ── Tools (C4) ─────────────────────────────────────────────────────
    let processes = Arc::new(ProcessManager::new(config.tools.exec.clone()));
    let mcp = if config.mcp.servers.is_empty() {
        tracing::info!("no MCP servers configured");
        Arc::new(McpManager::empty())
    } else {
        tracing::info!(count = config.mcp.servers.len(), "initializing MCP servers");
        Arc::new(McpManager::from_config(&config.mcp).await)
    };
    if mcp.tool_count() > 0 {
        tracing::info!(servers = mcp.server_count(), tools = mcp.tool_count(), "MCP tools discovered");
    }
    let denied_commands = RegexSet::new(&config.tools.exec_security.denied_patterns)
        .context("invalid regex in tools.exec_security.denied_patterns")?;
    let tools = Arc::new(ToolRegistry::new(processes.clone(), mcp.clone(), denied_commands));

    // ── LLM providers (C5) ────────────────────────────────────────────
    let llm = Arc::new(ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?);
    if llm.is_empty() {
        tracing::warn!("no LLM providers initialized — agent runs will fail until auth is configured");
    } else {
        tracing::info!(providers = llm.len(), "LLM provider registry ready");
    }

    let executor = Arc::new(RunExecutor::new(llm.clone(), tools.clone(), threads.clone(), bus.clone()));

    // Platform timezone cron expressions are evaluated in (base spec
    // §4.7), shared by the scheduler's tick loop and the task runner's
    // post-finalize `next_run_at` recompute so both agree.
    let scheduler_tz = crate::scheduler::cron::parse_tz(&config.scheduler.timezone);
    tracing::info!(timezone = %config.scheduler.timezone, "scheduler timezone resolved");

    // ── Task runner (C6) ──────────────────────────────────────────────
    let task_runner = Arc::new(
        TaskRunner::new(
            agents.clone(),
            runs.clone(),
            threads.clone(),
            bus.clone(),
            locks.clone(),
            cancels.clone(),
            executor,
        )
        .with_timezone(scheduler_tz),
    );

    // ── Scheduler (C7) ─────────────────────────────────────────────────
    let scheduler = Arc::new(
        Scheduler::new(agents.clone(), task_runner.clone(), config.scheduler.tick_interval_sec)
            .with_timezone(scheduler_tz),
    );
    scheduler.load_from_storage().context("loading agent schedules")?;

    // ── Workflow engine (C9) ──────────────────────────────────────────
    let workflow_engine = Arc::new(WorkflowEngine::new(
        workflows.clone(),
        executions.clone(),
        tools.clone(),
        task_runner.clone(),
        runs.clone(),
        threads.clone(),
    ));

    // ── Trigger ingest (C8) ───────────────────────────────────────────
    let webhook_ingest = Arc::new(WebhookIngest::new(
        triggers.clone(),
        bus.clone(),
        config.triggers.webhook_max_bytes,
    ));
    let trigger_dispatcher = Arc::new(TriggerDispatcher::new(triggers.clone(), task_runner.clone(), bus.clone()));

    let gmail_ingest = match (std::env::var("AOC_GMAIL_ACCESS_TOKEN"), std::env::var("AOC_GMAIL_PUSH_AUDIENCE")) {
        (Ok(access_token), Ok(expected_audience)) if !access_token.is_empty() && !expected_audience.is_empty() => {
            let http = reqwest::Client::new();
            let client = Arc::new(HttpGmailClient::new(http, access_token));
            tracing::info!("Gmail push ingest enabled");
            Some(Arc::new(GmailIngest::new(triggers.clone(), bus.clone(), client, expected_audience)))
        }
        _ => {
            tracing::info!("Gmail push ingest disabled (AOC_GMAIL_ACCESS_TOKEN / AOC_GMAIL_PUSH_AUDIENCE not set)");
            None
        }
    };

    // ── Realtime hub (C3) ──────────────────────────────────────────────
    let hub = Hub::spawn(bus.clone());

    // ── Security tokens (read once, hash for constant-time compare) ──
    let api_token_hash = read_token_hash(&config.server.api_token_env, "API");
    let admin_token_hash = read_token_hash(&config.admin.token_env, "admin");

    let jarvis_jwt_secret = Arc::new(
        std::env::var(&config.jarvis.jwt_secret_env)
            .unwrap_or_else(|_| {
                tracing::warn!(
                    env_var = %config.jarvis.jwt_secret_env,
                    "Jarvis JWT secret not set — using an ephemeral random secret for this process"
                );
                uuid::Uuid::new_v4().to_string()
            })
            .into_bytes(),
    );
    let jarvis_device_secret = std::env::var(&config.jarvis.device_secret_env)
        .ok()
        .filter(|s| !s.is_empty())
        .map(Arc::new);
    if jarvis_device_secret.is_none() {
        tracing::warn!(
            env_var = %config.jarvis.device_secret_env,
            "Jarvis device secret not set — /api/jarvis/auth will reject every request"
        );
    }
    let jarvis_session_ttl_sec = config.jarvis.session_ttl_sec as i64;

    Ok(AppState {
        config,
        llm,
        processes,
        mcp,
        tools,
        agents,
        runs,
        triggers,
        users,
        canvas,
        workflows,
        executions,
        threads,
        bus,
        hub,
        locks,
        cancels,
        task_runner,
        scheduler,
        workflow_engine,
        webhook_ingest,
        trigger_dispatcher,
        gmail_ingest,
        api_token_hash,
        admin_token_hash,
        jarvis_jwt_secret,
        jarvis_device_secret,
        jarvis_session_ttl_sec,
    })
}

/// Spawn the long-running background tokio tasks. Call after
/// [`build_app_state`] when running the HTTP server; one-shot CLI
/// commands skip this.
pub fn spawn_background_tasks(state: &AppState) {
    state.scheduler.clone().spawn();
    state.trigger_dispatcher.clone().spawn();
    if let Some(gmail) = &state.gmail_ingest {
        gmail.clone().spawn_renewal_tick(state.config.triggers.gmail_watch_renew_sec);
    }
    tracing::info!("background tasks spawned");
}

fn read_token_hash(env_var: &str, label: &str) -> Option<Vec<u8>> {
    match std::env::var(env_var) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var = %env_var, "{label} bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(env_var = %env_var, "{label} bearer-token auth DISABLED — set {env_var} to enable");
            None
        }
    }
}
