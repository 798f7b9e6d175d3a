use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use intake_core::models::{CompositionRecord, Food, Job, Survey};

pub(crate) fn print_survey_table(surveys: &[Survey]) {
    #[derive(Tabled)]
    struct SurveyRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Locale")]
        locale: String,
        #[tabled(rename = "Created")]
        created: String,
    }

    let rows: Vec<SurveyRow> = surveys
        .iter()
        .map(|s| SurveyRow {
            id: s.id.clone(),
            name: truncate(&s.name, 40),
            locale: s.locale.clone(),
            created: short_timestamp(&s.created_at),
        })
        .collect();

    println!("{}", Table::new(&rows).with(Style::rounded()));
}

pub(crate) fn print_food_table(foods: &[Food]) {
    #[derive(Tabled)]
    struct FoodRow {
        #[tabled(rename = "Code")]
        code: String,
        #[tabled(rename = "Locale")]
        locale: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Nutrient record")]
        record: String,
    }

    let rows: Vec<FoodRow> = foods
        .iter()
        .map(|f| FoodRow {
            code: f.code.clone(),
            locale: f.locale.clone(),
            name: truncate(&f.name, 35),
            record: f
                .nutrient_record
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
        })
        .collect();

    println!("{}", Table::new(&rows).with(Style::rounded()));
}

pub(crate) fn print_record(record: &CompositionRecord) {
    #[derive(Tabled)]
    struct ValueRow {
        #[tabled(rename = "Kind")]
        kind: &'static str,
        #[tabled(rename = "Key")]
        key: String,
        #[tabled(rename = "Value")]
        value: String,
    }

    println!("{} {}", record.key, record.name);
    if let Some(local) = &record.local_name {
        println!("  Local name: {local}");
    }

    let rows: Vec<ValueRow> = record
        .nutrients
        .iter()
        .map(|(id, rate)| ValueRow {
            kind: "nutrient /100g",
            key: id.clone(),
            value: format!("{rate}"),
        })
        .chain(record.fields.iter().map(|(name, value)| ValueRow {
            kind: "field",
            key: name.clone(),
            value: truncate(value, 40),
        }))
        .collect();

    if rows.is_empty() {
        println!("  (no nutrients or fields)");
        return;
    }
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(2)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_job_table(jobs: &[Job]) {
    #[derive(Tabled)]
    struct JobRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Type")]
        job_type: String,
        #[tabled(rename = "Status")]
        status: &'static str,
        #[tabled(rename = "Progress")]
        progress: String,
        #[tabled(rename = "Created")]
        created: String,
        #[tabled(rename = "Message")]
        message: String,
    }

    let rows: Vec<JobRow> = jobs
        .iter()
        .map(|j| JobRow {
            id: j.id.clone(),
            job_type: j.job_type.clone(),
            status: job_status(j),
            progress: j.progress.map_or_else(|| "-".to_string(), format_progress),
            created: short_timestamp(&j.created_at),
            message: truncate(j.message.as_deref().unwrap_or(""), 50),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

/// Parse repeated `KEY=VALUE` arguments. A later key overrides an earlier one.
pub(crate) fn parse_assignments(args: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            bail!("Expected KEY=VALUE, got '{arg}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Missing key in '{arg}'");
        }
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

pub(crate) fn parse_nutrient_rates(args: &[String]) -> Result<BTreeMap<String, f64>> {
    parse_assignments(args)?
        .into_iter()
        .map(|(id, raw)| {
            let rate = raw
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Invalid rate for nutrient {id}: '{raw}'"))?;
            Ok((id, rate))
        })
        .collect()
}

pub(crate) fn job_status(job: &Job) -> &'static str {
    match (job.started_at.is_some(), job.successful) {
        (_, Some(true)) => "succeeded",
        (_, Some(false)) => "failed",
        (true, None) => "running",
        (false, None) => "queued",
    }
}

pub(crate) fn format_progress(fraction: f64) -> String {
    format!("{:.0}%", fraction.clamp(0.0, 1.0) * 100.0)
}

/// `2024-06-15T12:34:56.789+01:00` -> `2024-06-15 12:34`
fn short_timestamp(ts: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map_or_else(|_| ts.to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
