use std::path::Path;

use anyhow::{Context, Result, bail};

use intake_core::models::{NewCompositionRecord, RecordKey};
use intake_core::service::IntakeService;

use super::helpers::{parse_assignments, parse_nutrient_rates, print_record};

pub(crate) fn cmd_table_import(
    svc: &IntakeService,
    table_id: &str,
    path: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let csv_data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let summary = svc.import_table_csv(table_id, &csv_data, dry_run)?;

    if summary.rows_parsed == 0 {
        if json {
            println!(
                "{}",
                serde_json::json!({ "error": "No rows found in CSV file" })
            );
        } else {
            eprintln!("No rows found in CSV file.");
        }
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "dry_run": dry_run,
                "table_id": table_id,
                "rows_parsed": summary.rows_parsed,
                "records_created": summary.records_created,
                "records_updated": summary.records_updated,
            })
        );
    } else if dry_run {
        println!("Dry run, no changes made.\n");
        println!("  Rows parsed:       {}", summary.rows_parsed);
        println!("  Records to create: {}", summary.records_created);
        println!("  Records to update: {}", summary.records_updated);
    } else {
        println!("Imported nutrient table {table_id}.\n");
        println!("  Rows parsed:     {}", summary.rows_parsed);
        println!("  Records created: {}", summary.records_created);
        println!("  Records updated: {}", summary.records_updated);
    }

    Ok(())
}

/// Create or replace one record. The given nutrients and fields become the
/// record's complete sets.
#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_table_set(
    svc: &IntakeService,
    table_id: &str,
    record_code: &str,
    name: &str,
    local_name: Option<&str>,
    nutrients: &[String],
    fields: &[String],
    json: bool,
) -> Result<()> {
    let record = svc.save_record(&NewCompositionRecord {
        key: RecordKey::new(table_id, record_code),
        name: name.to_string(),
        local_name: local_name.map(str::to_string),
        nutrients: parse_nutrient_rates(nutrients)?,
        fields: parse_assignments(fields)?,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("Saved nutrient table record {}", record.key);
        print_record(&record);
        eprintln!("Run `intake recalc` to apply the change to existing submissions.");
    }
    Ok(())
}

pub(crate) fn cmd_table_show(
    svc: &IntakeService,
    table_id: &str,
    record_code: &str,
    json: bool,
) -> Result<()> {
    let key = RecordKey::new(table_id, record_code);
    let Some(record) = svc.get_record(&key)? else {
        bail!("Nutrient table record {key} not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(())
}

pub(crate) fn cmd_table_delete(
    svc: &IntakeService,
    table_id: &str,
    record_code: &str,
    json: bool,
) -> Result<()> {
    let key = RecordKey::new(table_id, record_code);
    if !svc.delete_record(&key)? {
        bail!("Nutrient table record {key} not found");
    }

    if json {
        println!("{}", serde_json::json!({ "record": key, "deleted": true }));
    } else {
        println!("Deleted nutrient table record {key}");
        eprintln!("Foods mapped to it keep their mapping; run `intake recalc` to clear stale values.");
    }
    Ok(())
}
