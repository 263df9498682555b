//! C7 Scheduler — ticks over [`AgentRepo::due_for_schedule`] and hands
//! each due agent to the C6 task runner.
//!
//! A poll-and-dispatch tick loop paired with the timezone-aware cron
//! matcher/next-occurrence engine kept as the [`cron`] submodule. A
//! separate `Schedule` entity with its own digest/delivery machinery has
//! no counterpart here — agents carry their own `schedule`/`next_run_at`
//! fields directly (see `AgentRepo`), so there is no separate schedule
//! entity to store.

pub mod cron;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use aoc_domain::entities::{Agent, RunTrigger, ThreadType};
use aoc_domain::error::{Error, Result};

use crate::repos::AgentRepo;
use crate::task_runner::{TaskRunner, TaskTrigger};

/// Compute the next occurrence of a 5-field cron expression after now, in
/// the given timezone.
///
/// Used both by the scheduler itself (registering/refreshing an agent's
/// `next_run_at`) and by the task runner (recomputing `next_run_at` after
/// a scheduled run finishes) — both pass the same platform-configured
/// `SchedulerConfig::timezone`.
pub fn next_occurrence(expr: &str, tz: chrono_tz::Tz) -> Result<DateTime<Utc>> {
    validate_cron(expr)?;
    cron::cron_next_tz(expr, &Utc::now(), tz)
        .ok_or_else(|| Error::InvalidArgument(format!("cron '{expr}' has no future occurrence")))
}

/// Reject a cron expression that isn't a syntactically valid 5-field
/// string before it's ever handed to the evaluator.
pub fn validate_cron(expr: &str) -> Result<()> {
    if cron::is_valid(expr) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "cron '{expr}' must be a 5-field expression (minute hour day month weekday)"
        )))
    }
}

/// Drives the periodic schedule tick and the one-off register/refresh
/// calls made from the agent API handlers when an agent's `schedule`
/// field changes.
pub struct Scheduler {
    agents: Arc<AgentRepo>,
    task_runner: Arc<TaskRunner>,
    tick_interval: std::time::Duration,
    timezone: chrono_tz::Tz,
}

impl Scheduler {
    pub fn new(agents: Arc<AgentRepo>, task_runner: Arc<TaskRunner>, tick_interval_sec: u64) -> Self {
        Self {
            agents,
            task_runner,
            tick_interval: std::time::Duration::from_secs(tick_interval_sec),
            timezone: chrono_tz::UTC,
        }
    }

    /// Set the timezone cron expressions are evaluated in (base spec
    /// §4.7). Defaults to UTC; the gateway's bootstrap wires in
    /// `SchedulerConfig::timezone` via `cron::parse_tz`.
    pub fn with_timezone(mut self, timezone: chrono_tz::Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Recompute `next_run_at` for every agent with a schedule at startup,
    /// so a crash between a schedule write and the first tick doesn't
    /// strand an agent with a stale or missing `next_run_at`. An agent
    /// whose cron no longer parses is logged and left unscheduled rather
    /// than failing startup.
    pub fn load_from_storage(&self) -> Result<()> {
        for agent in self.agents.list_all() {
            let Some(cron_expr) = agent.schedule.clone() else { continue };
            if agent.next_run_at.is_some() {
                continue;
            }
            match next_occurrence(&cron_expr, self.timezone) {
                Ok(next) => {
                    self.agents.update(agent.id, |a| a.next_run_at = Some(next))?;
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, cron = %cron_expr, error = %e, "invalid schedule on load, agent left unscheduled");
                }
            }
        }
        Ok(())
    }

    /// Called by the agent API after creating/updating an agent with a
    /// non-empty `schedule`. Validates the cron and stores the next
    /// occurrence; the caller should reject the write if this errors.
    pub fn schedule_agent(&self, agent_id: Uuid, cron_expr: &str) -> Result<Agent> {
        let next = next_occurrence(cron_expr, self.timezone)?;
        self.agents.update(agent_id, |a| {
            a.schedule = Some(cron_expr.to_string());
            a.next_run_at = Some(next);
        })
    }

    /// Called when an agent's `schedule` is cleared.
    pub fn unschedule_agent(&self, agent_id: Uuid) -> Result<Agent> {
        self.agents.update(agent_id, |a| {
            a.schedule = None;
            a.next_run_at = None;
        })
    }

    /// Spawn the periodic tick loop on the current runtime, returning its
    /// handle so the caller can hold/abort it.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    /// One scheduler tick: dispatch every due agent. Each dispatch runs on
    /// its own task so a long-running agent never delays the rest of the
    /// due set or the next tick.
    async fn tick(&self) {
        let now = Utc::now();
        let due = self.agents.due_for_schedule(now);
        if due.is_empty() {
            return;
        }
        tracing::debug!(due_count = due.len(), "scheduler tick");
        for agent in due {
            let task_runner = self.task_runner.clone();
            let agent_id = agent.id;
            tokio::spawn(async move {
                let trigger = TaskTrigger::New {
                    thread_type: ThreadType::Scheduled,
                    trigger: RunTrigger::Schedule,
                    task_override: None,
                };
                match task_runner.execute_agent_task(agent_id, trigger).await {
                    Ok(_) => {}
                    Err(Error::Conflict(_)) => {
                        tracing::debug!(%agent_id, "scheduled agent already running, skipping this tick");
                    }
                    Err(e) => {
                        tracing::warn!(%agent_id, error = %e, "scheduled task dispatch failed");
                    }
                }
            });
        }
    }
}
