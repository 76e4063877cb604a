use anyhow::Result;
use chrono::Utc;
use std::time::Duration;

use super::services::ForgeServices;
use super::{RunCommandArgs, TickCommandArgs};
use crate::core::forge::{RunStatus, StartRunOptions, TickReport};
use crate::core::store::ForgeStore;
use crate::core::store::types::RunRecord;
use crate::core::terminal::{self, GuideSection};

const RUN_POLL: Duration = Duration::from_millis(500);

fn print_run_summary(run: &RunRecord) {
    let mut section = GuideSection::new(&format!("Run {}", run.id))
        .status("Agent", &run.agent_id)
        .status("Status", run.status.as_str())
        .status("Iterations", &run.iteration.to_string())
        .status("Self-tests", &run.self_test_count.to_string());
    if let Some(version) = run.published_version {
        section = section.status("Published version", &version.to_string());
    }
    if let Some(decision) = run.metadata["decision"].as_str() {
        section = section.status("Last decision", decision);
    }
    if let Some(err) = &run.error {
        section = section.status("Error", err);
    }
    section.print();

    match run.status {
        RunStatus::Completed | RunStatus::CompletedDryRun | RunStatus::CompletedNoPublish => {
            terminal::print_success("Run finished.")
        }
        RunStatus::NeedsReview => terminal::print_warn("Run needs review before anything ships."),
        RunStatus::RejectedConcurrent => {
            terminal::print_warn("Another run holds this agent's lock.")
        }
        _ => terminal::print_error("Run did not complete."),
    }
}

/// One foreground run; returns once the run is terminal.
pub(crate) async fn run_once(services: &ForgeServices, args: RunCommandArgs) -> Result<()> {
    let opts = StartRunOptions {
        dry_run: args.dry_run,
        max_iterations: args.max_iterations,
        requested_by: Some("cli".to_string()),
        ..Default::default()
    };
    terminal::print_info(&format!(
        "Starting {}run for agent {}...",
        if args.dry_run { "dry " } else { "" },
        args.agent
    ));
    let run = services.runner.run_to_completion(&args.agent, opts).await?;
    print_run_summary(&run);
    Ok(())
}

async fn wait_until_terminal(store: &ForgeStore, run_id: &str) -> Result<Option<RunRecord>> {
    loop {
        match store.get_run(run_id).await? {
            Some(run) if run.status.is_terminal() => return Ok(Some(run)),
            Some(_) => tokio::time::sleep(RUN_POLL).await,
            None => return Ok(None),
        }
    }
}

fn print_tick_report(report: &TickReport) {
    let mut section = GuideSection::new(&format!("Scheduler tick {}", report.date))
        .status("In window", if report.in_window { "yes" } else { "no" })
        .status("Started", &report.started.len().to_string())
        .status("Rejected", &report.rejected.len().to_string())
        .status("Not due", &report.not_due.len().to_string());
    if report.already_ticked {
        section = section.info("Already ticked today.");
    }
    for err in &report.errors {
        section = section.text(err);
    }
    section.print();
}

/// One scheduler pass now. `--force` bypasses the window and cadence.
/// Waits for the runs it started so the process can exit cleanly.
pub(crate) async fn tick_once(services: &ForgeServices, args: TickCommandArgs) -> Result<()> {
    let report = if args.force {
        services
            .scheduler
            .process_now(args.agent.as_deref(), "cli")
            .await?
    } else {
        services.scheduler.tick(Utc::now()).await?
    };
    print_tick_report(&report);
    if !report.in_window && !args.force {
        terminal::print_info("Outside the trigger window; use --force to start runs anyway.");
    }

    for entry in &report.started {
        if let Some(run) = wait_until_terminal(&services.store, &entry.run_id).await? {
            print_run_summary(&run);
        }
    }
    Ok(())
}
