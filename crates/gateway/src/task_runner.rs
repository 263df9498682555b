//! C6 Task Runner — the S0-S6 state machine that turns a trigger into
//! a `Run`, invoking C5 under the per-agent lock.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use aoc_domain::entities::{
    Agent, AgentStatus, Run, RunStatus, RunTrigger, Thread, ThreadType, RUN_TEXT_TRUNCATE_CHARS,
};
use aoc_domain::entities::truncate_chars;
use aoc_domain::error::{Error, Result};
use aoc_domain::event::EventKind;
use aoc_sessions::ThreadStore;

use crate::bus::EventBus;
use crate::cancel::CancelMap;
use crate::executor::{RunExecutor, RunMode, RunOptions};
use crate::locks::AgentLockMap;
use crate::repos::{AgentRepo, RunRepo};

pub struct TaskRunnerOutcome {
    pub run_id: Uuid,
    pub thread_id: Uuid,
}

/// What the caller of `execute_agent_task` wants the run to actually do.
pub enum TaskTrigger {
    /// Reuse an existing chat thread, appending nothing extra — the
    /// caller already appended the user's message.
    Chat { thread_id: Uuid },
    /// Create a fresh thread of the given type and seed it with a single
    /// user message (`task_override` or the agent's own instructions).
    New { thread_type: ThreadType, trigger: RunTrigger, task_override: Option<String> },
}

pub struct TaskRunner {
    agents: Arc<AgentRepo>,
    runs: Arc<RunRepo>,
    threads: Arc<ThreadStore>,
    bus: Arc<EventBus>,
    locks: Arc<AgentLockMap>,
    cancels: Arc<CancelMap>,
    executor: Arc<RunExecutor>,
    timezone: chrono_tz::Tz,
}

impl TaskRunner {
    pub fn new(
        agents: Arc<AgentRepo>,
        runs: Arc<RunRepo>,
        threads: Arc<ThreadStore>,
        bus: Arc<EventBus>,
        locks: Arc<AgentLockMap>,
        cancels: Arc<CancelMap>,
        executor: Arc<RunExecutor>,
    ) -> Self {
        Self { agents, runs, threads, bus, locks, cancels, executor, timezone: chrono_tz::UTC }
    }

    /// Set the timezone used to recompute `next_run_at` after a scheduled
    /// run finishes (base spec §4.7). Defaults to UTC; must match the
    /// `Scheduler`'s own `with_timezone` so a finalize and the next tick
    /// agree on the same cron evaluation.
    pub fn with_timezone(mut self, timezone: chrono_tz::Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub async fn execute_agent_task(
        &self,
        agent_id: Uuid,
        trigger: TaskTrigger,
    ) -> Result<TaskRunnerOutcome> {
        // S0: acquire the per-agent lock, non-blocking.
        let Some(_guard) = self.locks.try_acquire(agent_id) else {
            return Err(Error::Conflict(format!("agent {agent_id} already has a run in progress")));
        };

        let agent = self.agents.get(agent_id)?;

        // S1: mark running.
        let agent = self.agents.update(agent_id, |a| a.status = AgentStatus::Running)?;

        // S2: resolve the thread for this trigger.
        let (thread, run_trigger) = self.resolve_thread(&agent, trigger)?;

        // S3: create the Run, transition to running.
        let run = self.runs.create(Run::new(agent.id, thread.id, run_trigger))?;
        let since = Utc::now();
        self.runs.transition(run.id, RunStatus::Running, |_| {})?;
        let cancel = self.cancels.register(run.id);

        // S4: invoke C5.
        let options = RunOptions { stream_tokens: true, mode: RunMode::TaskRun };
        let outcome = self.executor.run_thread(&agent, &thread, options, cancel).await;
        self.cancels.remove(run.id);

        match outcome {
            Ok(_new_messages) => self.finalize_success(&agent, run.id, thread.id, since)?,
            Err(Error::Cancelled) => self.finalize_failure(&agent, run.id, "cancelled".to_string())?,
            Err(e) => self.finalize_failure(&agent, run.id, e.to_string())?,
        }

        Ok(TaskRunnerOutcome { run_id: run.id, thread_id: thread.id })
    }

    /// S0-S3 synchronously, then S4-S6 in a spawned task — the shape the
    /// direct-dispatch endpoints want
    /// (`POST /api/agents/{id}/task`, `/api/jarvis/dispatch`): the caller
    /// gets `{run_id, thread_id}` back as soon as the `Run` exists and
    /// immediately observes `Busy` on lock contention, without blocking on
    /// the full agent turn. Progress after that is only observable via
    /// `RUN_UPDATED`/`STREAM_*` events on the `agent:{id}`/`thread:{id}`
    /// topics — the same way a WS `send_message` dispatch already worked.
    pub fn dispatch(self: Arc<Self>, agent_id: Uuid, trigger: TaskTrigger) -> Result<TaskRunnerOutcome> {
        let Some(guard) = self.locks.try_acquire(agent_id) else {
            return Err(Error::Conflict(format!("agent {agent_id} already has a run in progress")));
        };

        let agent = self.agents.get(agent_id)?;
        let agent = self.agents.update(agent_id, |a| a.status = AgentStatus::Running)?;
        let (thread, run_trigger) = self.resolve_thread(&agent, trigger)?;

        let run = self.runs.create(Run::new(agent.id, thread.id, run_trigger))?;
        let since = Utc::now();
        self.runs.transition(run.id, RunStatus::Running, |_| {})?;
        let cancel = self.cancels.register(run.id);

        let run_id = run.id;
        let thread_id = thread.id;
        let this = self.clone();

        tokio::spawn(async move {
            let options = RunOptions { stream_tokens: true, mode: RunMode::TaskRun };
            let outcome = this.executor.run_thread(&agent, &thread, options, cancel).await;
            this.cancels.remove(run_id);

            let result = match outcome {
                Ok(_new_messages) => this.finalize_success(&agent, run_id, thread_id, since),
                Err(Error::Cancelled) => this.finalize_failure(&agent, run_id, "cancelled".to_string()),
                Err(e) => this.finalize_failure(&agent, run_id, e.to_string()),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, %run_id, "failed to finalize dispatched run");
            }
            drop(guard);
        });

        Ok(TaskRunnerOutcome { run_id, thread_id })
    }

    fn resolve_thread(&self, agent: &Agent, trigger: TaskTrigger) -> Result<(Thread, RunTrigger)> {
        match trigger {
            TaskTrigger::Chat { thread_id } => {
                let thread = self.threads.get_thread_for_agent(thread_id, agent.id)?;
                Ok((thread, RunTrigger::Manual))
            }
            TaskTrigger::New { thread_type, trigger, task_override } => {
                let thread = self.threads.create_thread_with_system_message(agent, thread_type, agent.name.clone())?;
                let task_text = task_override.unwrap_or_else(|| agent.task_instructions.clone());
                let user_msg = aoc_domain::entities::Message::user(thread.id, task_text);
                self.threads.append_messages(thread.id, vec![user_msg])?;
                Ok((thread, trigger))
            }
        }
    }

    fn finalize_success(&self, agent: &Agent, run_id: Uuid, thread_id: Uuid, since: chrono::DateTime<Utc>) -> Result<()> {
        let summary = self
            .threads
            .first_assistant_message_after(thread_id, since)?
            .map(|m| truncate_chars(&m.content, RUN_TEXT_TRUNCATE_CHARS));

        self.runs.transition(run_id, RunStatus::Success, |r| r.summary = summary)?;

        let next_run_at = agent
            .schedule
            .as_deref()
            .and_then(|cron| crate::scheduler::next_occurrence(cron, self.timezone).ok());

        self.agents.update(agent.id, |a| {
            a.status = AgentStatus::Idle;
            a.last_run_at = Some(Utc::now());
            a.last_error = None;
            a.next_run_at = next_run_at;
        })?;
        Ok(())
    }

    fn finalize_failure(&self, agent: &Agent, run_id: Uuid, error: String) -> Result<()> {
        let truncated = truncate_chars(&error, RUN_TEXT_TRUNCATE_CHARS);
        self.runs.transition(run_id, RunStatus::Failed, |r| r.error = Some(truncated.clone()))?;
        self.agents.update(agent.id, |a| {
            a.status = AgentStatus::Error;
            a.last_error = Some(truncated.clone());
        })?;
        Ok(())
    }

    /// External cancellation entry point, called from the API layer.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        self.cancels.cancel(run_id)
    }
}

/// Re-emit an `AGENT_UPDATED` event manually for callers that bypass
/// `AgentRepo::update` (none in this codebase today, kept since S1's
/// publish is a discrete step in the state machine).
pub fn publish_agent_updated(bus: &EventBus, agent: &Agent) {
    bus.publish(EventKind::AgentUpdated { agent_id: agent.id, agent: agent.clone() });
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_domain::config::LlmConfig;
    use aoc_domain::entities::AgentStatus;
    use aoc_mcp_client::McpManager;
    use aoc_providers::ProviderRegistry;
    use aoc_tools::ProcessManager;
    use regex::RegexSet;
    use serde_json::Value;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn sample_agent(owner_id: Uuid) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            owner_id,
            name: "greeter".into(),
            system_instructions: "be nice".into(),
            task_instructions: "say hi".into(),
            model: "openai/gpt-4o".into(),
            temperature: 0.7,
            schedule: None,
            status: AgentStatus::Idle,
            last_run_at: None,
            next_run_at: None,
            last_error: None,
            config: Value::Null,
            allowed_tools: HashSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn build_runner(dir: &std::path::Path) -> (Arc<TaskRunner>, Arc<AgentRepo>) {
        let bus = Arc::new(EventBus::new());
        let agents = Arc::new(AgentRepo::load(dir, bus.clone()).unwrap());
        let runs = Arc::new(RunRepo::load(dir, bus.clone()).unwrap());
        let threads = Arc::new(ThreadStore::load(dir).unwrap());
        let locks = Arc::new(AgentLockMap::new());
        let cancels = Arc::new(CancelMap::new());
        let processes = Arc::new(ProcessManager::new(Default::default()));
        let mcp = Arc::new(McpManager::empty());
        let denied = RegexSet::new(Vec::<String>::new()).unwrap();
        let tools = Arc::new(crate::tools::ToolRegistry::new(processes, mcp, denied));
        let providers = Arc::new(ProviderRegistry::from_config(&LlmConfig::default()).unwrap());
        let executor = Arc::new(RunExecutor::new(providers, tools, threads.clone(), bus.clone()));
        let runner = Arc::new(TaskRunner::new(agents.clone(), runs, threads, bus, locks, cancels, executor));
        (runner, agents)
    }

    #[tokio::test]
    async fn busy_agent_rejects_second_concurrent_task() {
        let dir = tempdir().unwrap();
        let (runner, agents) = build_runner(dir.path());
        let agent = agents.create(sample_agent(Uuid::new_v4())).unwrap();

        let _guard = runner.locks.try_acquire(agent.id).unwrap();
        let result = runner
            .execute_agent_task(agent.id, TaskTrigger::New {
                thread_type: ThreadType::Scheduled,
                trigger: RunTrigger::Schedule,
                task_override: None,
            })
            .await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn dispatch_returns_ids_immediately_and_busy_is_synchronous() {
        let dir = tempdir().unwrap();
        let (runner, agents) = build_runner(dir.path());
        let agent = agents.create(sample_agent(Uuid::new_v4())).unwrap();

        let outcome = runner
            .clone()
            .dispatch(agent.id, TaskTrigger::New {
                thread_type: ThreadType::Manual,
                trigger: RunTrigger::Api,
                task_override: None,
            })
            .unwrap();
        assert_ne!(outcome.run_id, Uuid::nil());
        assert_ne!(outcome.thread_id, Uuid::nil());

        // The lock is held by the just-spawned run, so a second dispatch
        // for the same agent observes `Busy` without waiting for the
        // first run to finish (there is no live model in tests, so the
        // first run will itself fail shortly after — but this assertion
        // must hold regardless of that timing).
        let second = runner.clone().dispatch(agent.id, TaskTrigger::New {
            thread_type: ThreadType::Manual,
            trigger: RunTrigger::Api,
            task_override: None,
        });
        assert!(matches!(second, Err(Error::Conflict(_))));
    }
}
