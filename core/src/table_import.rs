use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::db::Database;
use crate::models::{NewCompositionRecord, RecordKey, validate_code, validate_composition_record};

const NUTRIENT_PREFIX: &str = "N:";
const FIELD_PREFIX: &str = "F:";

/// A single record parsed from a nutrient table CSV.
#[derive(Debug, Clone)]
pub struct TableRow {
    pub record_code: String,
    pub name: String,
    pub local_name: Option<String>,
    pub nutrients: BTreeMap<String, f64>,
    pub fields: BTreeMap<String, String>,
}

/// Summary of what a table import would do / did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableImportSummary {
    pub rows_parsed: usize,
    pub records_created: usize,
    pub records_updated: usize,
}

enum Column {
    Nutrient(String),
    Field(String),
}

/// Parse a nutrient table CSV from any reader.
///
/// Expected header:
/// `Record ID,Name,Local Name,N:<nutrient type>,...,F:<field>,...`
///
/// `N:` columns hold units per 100 g, `F:` columns hold text. A blank cell
/// means the record does not define that nutrient or field. Other columns
/// are ignored.
pub fn parse_table_csv<R: Read>(reader: R) -> Result<Vec<TableRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    let col =
        |name: &str| -> Option<usize> { headers.iter().position(|h| h.eq_ignore_ascii_case(name)) };

    let idx_code = col("Record ID").context("Missing required column: Record ID")?;
    let idx_name = col("Name").context("Missing required column: Name")?;
    let idx_local = col("Local Name");

    let mut columns = Vec::new();
    for (i, header) in headers.iter().enumerate() {
        if let Some(id) = header.strip_prefix(NUTRIENT_PREFIX) {
            if id.trim().is_empty() {
                bail!("Column {} has an empty nutrient type id", i + 1);
            }
            columns.push((i, Column::Nutrient(id.trim().to_string())));
        } else if let Some(name) = header.strip_prefix(FIELD_PREFIX) {
            if name.trim().is_empty() {
                bail!("Column {} has an empty field name", i + 1);
            }
            columns.push((i, Column::Field(name.trim().to_string())));
        }
    }

    let mut rows = Vec::new();

    for (line_num, result) in rdr.records().enumerate() {
        let line = line_num + 2;
        let record = result.with_context(|| format!("Failed to parse CSV row {line}"))?;

        let record_code = record.get(idx_code).unwrap_or("").to_string();
        if record_code.is_empty() {
            continue; // skip blank rows
        }
        let name = record.get(idx_name).unwrap_or("").to_string();
        let local_name = idx_local
            .and_then(|i| record.get(i))
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let mut nutrients = BTreeMap::new();
        let mut fields = BTreeMap::new();
        for (i, column) in &columns {
            let value = record.get(*i).unwrap_or("");
            if value.is_empty() {
                continue;
            }
            match column {
                Column::Nutrient(id) => {
                    let rate: f64 = value.parse().with_context(|| {
                        format!("Row {line}: nutrient {id} value '{value}' is not a number")
                    })?;
                    nutrients.insert(id.clone(), rate);
                }
                Column::Field(field) => {
                    fields.insert(field.clone(), value.to_string());
                }
            }
        }

        rows.push(TableRow {
            record_code,
            name,
            local_name,
            nutrients,
            fields,
        });
    }

    Ok(rows)
}

/// Import parsed rows into nutrient table `table_id`, replacing the
/// nutrients and fields of records that already exist.
///
/// Every row is validated before anything is written. When `dry_run` is
/// true, no data is written.
pub fn import_table(
    db: &Database,
    table_id: &str,
    rows: &[TableRow],
    dry_run: bool,
) -> Result<TableImportSummary> {
    validate_code("Nutrient table id", table_id)?;

    let records: Vec<NewCompositionRecord> = rows
        .iter()
        .map(|row| NewCompositionRecord {
            key: RecordKey::new(table_id, &row.record_code),
            name: row.name.clone(),
            local_name: row.local_name.clone(),
            nutrients: row.nutrients.clone(),
            fields: row.fields.clone(),
        })
        .collect();
    for record in &records {
        validate_composition_record(record)?;
    }

    let mut summary = TableImportSummary {
        rows_parsed: rows.len(),
        ..TableImportSummary::default()
    };

    for record in &records {
        let created = if dry_run {
            db.get_composition_record(&record.key)?.is_none()
        } else {
            db.upsert_composition_record(record)?.1
        };
        if created {
            summary.records_created += 1;
        } else {
            summary.records_updated += 1;
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CSV: &str = "\
Record ID,Name,Local Name,N:1,N:2,N:3,F:brand,F:source
101,Apple raw,,52,0.3,14,,McCance
102,Bread white,Pão branco,265,9,49,Hovis,
103,Water,,0,,,,
";

    #[test]
    fn test_parse_table_csv_basic() {
        let rows = parse_table_csv(SAMPLE_CSV.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].record_code, "101");
        assert_eq!(rows[0].name, "Apple raw");
        assert!(rows[0].local_name.is_none());
        assert!((rows[0].nutrients["1"] - 52.0).abs() < f64::EPSILON);
        assert!((rows[0].nutrients["2"] - 0.3).abs() < f64::EPSILON);
        assert_eq!(rows[0].fields.len(), 1);
        assert_eq!(rows[0].fields["source"], "McCance");

        assert_eq!(rows[1].local_name.as_deref(), Some("Pão branco"));
        assert_eq!(rows[1].fields["brand"], "Hovis");

        // Blank cells are undefined, explicit zero is a value
        assert_eq!(rows[2].nutrients.len(), 1);
        assert_eq!(rows[2].nutrients["1"], 0.0);
        assert!(rows[2].fields.is_empty());
    }

    #[test]
    fn test_parse_table_csv_missing_required_column() {
        let bad_csv = "Name,N:1\nApple,52\n";
        let result = parse_table_csv(bad_csv.as_bytes());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Record ID"));
    }

    #[test]
    fn test_parse_table_csv_bad_number() {
        let csv = "Record ID,Name,N:1\n101,Apple,lots\n";
        let err = parse_table_csv(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Row 2"));
    }

    #[test]
    fn test_parse_table_csv_skips_blank_rows() {
        let csv = "\
Record ID,Name,N:1
101,Apple,52
,,
102,Pear,57
";
        let rows = parse_table_csv(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_import_table_dry_run() {
        let db = Database::open_in_memory().unwrap();
        let rows = parse_table_csv(SAMPLE_CSV.as_bytes()).unwrap();

        let summary = import_table(&db, "NDNS", &rows, true).unwrap();
        assert_eq!(summary.rows_parsed, 3);
        assert_eq!(summary.records_created, 3);
        assert_eq!(summary.records_updated, 0);

        // Dry run should not have created any records
        assert!(
            db.get_composition_record(&RecordKey::new("NDNS", "101"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_import_table_then_update() {
        let db = Database::open_in_memory().unwrap();
        let rows = parse_table_csv(SAMPLE_CSV.as_bytes()).unwrap();
        let s1 = import_table(&db, "NDNS", &rows, false).unwrap();
        assert_eq!(s1.records_created, 3);

        let csv = "\
Record ID,Name,N:1
101,Apple raw,60
104,Pear,57
";
        let rows = parse_table_csv(csv.as_bytes()).unwrap();
        let s2 = import_table(&db, "NDNS", &rows, false).unwrap();
        assert_eq!(s2.records_created, 1);
        assert_eq!(s2.records_updated, 1);

        // Nutrient and field sets are replaced, not merged
        let apple = db
            .get_composition_record(&RecordKey::new("NDNS", "101"))
            .unwrap()
            .unwrap();
        assert_eq!(apple.nutrients, BTreeMap::from([("1".to_string(), 60.0)]));
        assert!(apple.fields.is_empty());
    }

    #[test]
    fn test_import_table_rejects_negative_rate() {
        let db = Database::open_in_memory().unwrap();
        let csv = "Record ID,Name,N:1\n101,Apple,52\n102,Pear,-1\n";
        let rows = parse_table_csv(csv.as_bytes()).unwrap();
        assert!(import_table(&db, "NDNS", &rows, false).is_err());

        // Validation runs before any write
        assert!(
            db.get_composition_record(&RecordKey::new("NDNS", "101"))
                .unwrap()
                .is_none()
        );
    }
}
