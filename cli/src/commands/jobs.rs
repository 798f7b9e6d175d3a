use anyhow::Result;

use intake_core::service::IntakeService;

use super::helpers::{format_progress, job_status, print_job_table};

pub(crate) fn cmd_jobs_list(svc: &IntakeService, limit: i64, json: bool) -> Result<()> {
    let jobs = svc.list_jobs(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else if jobs.is_empty() {
        eprintln!("No jobs yet.");
    } else {
        print_job_table(&jobs);
    }
    Ok(())
}

pub(crate) fn cmd_jobs_show(svc: &IntakeService, id: &str, json: bool) -> Result<()> {
    let job = svc.get_job(id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("Job {}", job.id);
    println!("  Type:      {}", job.job_type);
    println!("  Status:    {}", job_status(&job));
    println!("  Params:    {}", job.params);
    if let Some(progress) = job.progress {
        println!("  Progress:  {}", format_progress(progress));
    }
    println!("  Created:   {}", job.created_at);
    if let Some(started) = &job.started_at {
        println!("  Started:   {started}");
    }
    if let Some(completed) = &job.completed_at {
        println!("  Completed: {completed}");
    }
    if let Some(message) = &job.message {
        println!("  Message:   {message}");
    }
    Ok(())
}
