use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;

use intake_core::models::Job;
use intake_core::recalc::{RecalcSummary, RecalculationParams};
use intake_core::service::IntakeService;

use super::helpers::format_progress;

/// Queue a recalculation job for a survey and run it.
pub(crate) async fn cmd_recalc(
    svc: IntakeService,
    survey_id: &str,
    mode: &str,
    sync_fields: bool,
    json: bool,
) -> Result<()> {
    let params = RecalculationParams {
        survey_id: survey_id.to_string(),
        mode: mode.to_string(),
        sync_fields,
    };
    let job = svc.queue_recalculation(&params)?;
    if !json {
        eprintln!("Queued job {}", job.id);
    }
    cmd_job_run(svc, &job.id, json).await
}

/// Run a job on the blocking pool, streaming progress back to the terminal.
pub(crate) async fn cmd_job_run(svc: IntakeService, job_id: &str, json: bool) -> Result<()> {
    let (svc, result) = run_with_progress(svc, job_id, !json).await?;
    let summary = result?;
    let job = svc.get_job(job_id)?;
    print_outcome(&job, &summary, json)
}

async fn run_with_progress(
    svc: IntakeService,
    job_id: &str,
    show_progress: bool,
) -> Result<(IntakeService, Result<RecalcSummary>)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<f64>();
    let id = job_id.to_string();

    let handle = tokio::task::spawn_blocking(move || {
        // A closed receiver only means nobody is watching any more.
        let mut forward = |fraction: f64| {
            let _ = tx.send(fraction);
        };
        let result = svc.run_job(&id, &mut forward).map_err(anyhow::Error::from);
        (svc, result)
    });

    while let Some(fraction) = rx.recv().await {
        if show_progress {
            eprint!("\rRecalculating... {:>4}", format_progress(fraction));
            let _ = std::io::stderr().flush();
        }
    }
    if show_progress {
        eprintln!();
    }

    handle.await.context("Recalculation task panicked")
}

fn print_outcome(job: &Job, summary: &RecalcSummary, json: bool) -> Result<()> {
    #[derive(Serialize)]
    struct Outcome<'a> {
        job: &'a Job,
        summary: &'a RecalcSummary,
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&Outcome { job, summary })?);
    } else {
        println!("{summary}");
    }
    Ok(())
}
