use anyhow::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use super::error::{ForgeError, ForgeResult};
use super::runner::ForgeRunner;
use super::types::{AgentStatus, RunType, StartRunOptions};
use crate::core::store::types::AgentProfile;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub timezone: Tz,
    /// Minutes after local midnight during which a tick may start runs.
    pub trigger_window_minutes: u32,
    pub tick_cron: String,
    pub enabled: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            trigger_window_minutes: 10,
            tick_cron: "0 * * * * *".to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub date: String,
    pub in_window: bool,
    pub already_ticked: bool,
    pub started: Vec<StartedEntry>,
    pub rejected: Vec<String>,
    pub not_due: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedEntry {
    pub agent_id: String,
    pub run_id: String,
}

/// Daily cadence trigger. Acts only inside the window after local midnight
/// and only once per calendar date.
#[derive(Clone)]
pub struct ForgeScheduler {
    runner: ForgeRunner,
    settings: SchedulerSettings,
    last_tick_date: Arc<Mutex<Option<NaiveDate>>>,
}

/// Whole days between the last scheduled date and today; `None` if never run
/// or the stored date is unreadable.
fn days_since(last: Option<&str>, today: NaiveDate) -> Option<i64> {
    let last = NaiveDate::parse_from_str(last?, "%Y-%m-%d").ok()?;
    Some((today - last).num_days())
}

pub fn is_due(profile: &AgentProfile, today: NaiveDate) -> bool {
    match days_since(profile.last_scheduled_run_date.as_deref(), today) {
        None => true,
        Some(days) => days >= profile.cadence_days.max(1),
    }
}

impl ForgeScheduler {
    pub fn new(runner: ForgeRunner, settings: SchedulerSettings) -> Self {
        Self {
            runner,
            settings,
            last_tick_date: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// One timer tick at `now`. Concurrent ticks are serialized.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let local = now.with_timezone(&self.settings.timezone);
        let today = local.date_naive();
        let minutes = local.hour() * 60 + local.minute();
        let mut report = TickReport {
            date: today.format("%Y-%m-%d").to_string(),
            in_window: minutes < self.settings.trigger_window_minutes,
            ..Default::default()
        };
        if !report.in_window {
            return Ok(report);
        }

        let mut last = self.last_tick_date.lock().await;
        if *last == Some(today) {
            report.already_ticked = true;
            return Ok(report);
        }

        info!("Scheduler tick for {} ({})", report.date, self.settings.timezone);
        let agents = self.runner.store().list_agents().await?;
        for profile in agents {
            // A `running` agent may hold a stale lease; the lock decides.
            if profile.status == AgentStatus::Inactive {
                continue;
            }
            if !is_due(&profile, today) {
                report.not_due.push(profile.id);
                continue;
            }
            let opts = StartRunOptions {
                run_type: Some(RunType::Scheduled),
                requested_by: Some("scheduler".to_string()),
                ..Default::default()
            };
            match self
                .runner
                .start_run_for(&profile.id, opts, Some(report.date.clone()))
                .await
            {
                Ok(started) if started.accepted => {
                    // Only an accepted start consumes the day.
                    if let Err(e) = self
                        .runner
                        .store()
                        .mark_scheduled(&profile.id, &report.date)
                        .await
                    {
                        error!("Recording scheduled date for agent {} failed: {}", profile.id, e);
                        report.errors.push(format!("{}: {}", profile.id, e));
                    }
                    report.started.push(StartedEntry {
                        agent_id: profile.id,
                        run_id: started.run.id,
                    });
                }
                Ok(_) => report.rejected.push(profile.id),
                Err(e) => {
                    warn!("Scheduled start for agent {} failed: {}", profile.id, e);
                    report.errors.push(format!("{}: {}", profile.id, e));
                }
            }
        }
        *last = Some(today);
        info!(
            "Scheduler tick {} started {} run(s), {} rejected, {} not due",
            report.date,
            report.started.len(),
            report.rejected.len(),
            report.not_due.len()
        );
        Ok(report)
    }

    /// Start runs now regardless of cadence, for one agent or every agent
    /// that is not inactive. Lock contention still rejects.
    pub async fn process_now(&self, agent_id: Option<&str>, requested_by: &str) -> ForgeResult<TickReport> {
        let store = self.runner.store();
        let agents = match agent_id {
            Some(id) => vec![
                store
                    .get_agent(id)
                    .await?
                    .ok_or_else(|| ForgeError::AgentNotFound(id.to_string()))?,
            ],
            None => store
                .list_agents()
                .await?
                .into_iter()
                .filter(|a| a.status != AgentStatus::Inactive)
                .collect(),
        };

        let today = Utc::now().with_timezone(&self.settings.timezone).date_naive();
        let mut report = TickReport {
            date: today.format("%Y-%m-%d").to_string(),
            in_window: true,
            ..Default::default()
        };
        for profile in agents {
            let opts = StartRunOptions {
                run_type: Some(RunType::Scheduled),
                requested_by: Some(requested_by.to_string()),
                ..Default::default()
            };
            let started = self
                .runner
                .start_run_for(&profile.id, opts, Some(report.date.clone()))
                .await?;
            if started.accepted {
                report.started.push(StartedEntry {
                    agent_id: profile.id,
                    run_id: started.run.id,
                });
            } else {
                report.rejected.push(profile.id);
            }
        }
        Ok(report)
    }

    /// Register the periodic tick on the daemon's job scheduler.
    pub async fn install(&self, jobs: &JobScheduler) -> Result<()> {
        if !self.settings.enabled {
            info!("Scheduler disabled; no tick job installed");
            return Ok(());
        }
        let scheduler = self.clone();
        let job = Job::new_async(self.settings.tick_cron.as_str(), move |_uuid, mut _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                match scheduler.tick(Utc::now()).await {
                    Ok(report) if report.in_window => debug!("Tick: {:?}", report),
                    Ok(_) => {}
                    Err(e) => error!("Scheduler tick failed: {}", e),
                }
            })
        })?;
        jobs.add(job).await?;
        info!(
            "Scheduler tick installed ({}, window {}m, tz {})",
            self.settings.tick_cron, self.settings.trigger_window_minutes, self.settings.timezone
        );
        Ok(())
    }
}
