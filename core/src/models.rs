use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

// --- Reference data ---

/// Identity of a food composition record: `(nutrient table, record code)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub nutrient_table_id: String,
    pub record_code: String,
}

impl RecordKey {
    pub fn new(nutrient_table_id: impl Into<String>, record_code: impl Into<String>) -> Self {
        Self {
            nutrient_table_id: nutrient_table_id.into(),
            record_code: record_code.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.nutrient_table_id, self.record_code)
    }
}

/// A row of a food composition table. Nutrient values are units per 100g,
/// keyed by nutrient type id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionRecord {
    pub key: RecordKey,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
    pub nutrients: BTreeMap<String, f64>,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NewCompositionRecord {
    pub key: RecordKey,
    pub name: String,
    pub local_name: Option<String>,
    pub nutrients: BTreeMap<String, f64>,
    pub fields: BTreeMap<String, String>,
}

/// Lookup key for a food in a given locale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FoodKey {
    pub code: String,
    pub locale: String,
}

impl FoodKey {
    pub fn new(code: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            locale: locale.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Food {
    pub id: i64,
    pub code: String,
    pub locale: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nutrient_record: Option<RecordKey>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewFood {
    pub code: String,
    pub locale: String,
    pub name: String,
}

// --- Surveys and submissions ---

#[derive(Debug, Clone, Serialize)]
pub struct Survey {
    pub id: String,
    pub name: String,
    pub locale: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewSurvey {
    pub id: String,
    pub name: String,
    pub locale: String,
}

/// A food recorded in a past submission, with its denormalized nutrient
/// snapshot. Only the recalculation engine rewrites `nutrients`, `fields`
/// and the nutrient table identifiers after capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionFood {
    pub id: i64,
    pub meal_id: i64,
    pub code: String,
    pub english_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
    pub locale: String,
    pub nutrient_table_id: String,
    pub nutrient_table_code: String,
    pub serving_weight: f64,
    pub leftovers_weight: f64,
    pub nutrients: BTreeMap<String, f64>,
    pub fields: BTreeMap<String, String>,
}

impl SubmissionFood {
    #[must_use]
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.nutrient_table_id, &self.nutrient_table_code)
    }

    #[must_use]
    pub fn food_key(&self) -> FoodKey {
        FoodKey::new(&self.code, &self.locale)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionMeal {
    pub id: i64,
    pub name: String,
    pub foods: Vec<SubmissionFood>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: String,
    pub survey_id: String,
    pub submitted_at: String,
    pub meals: Vec<SubmissionMeal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubmission {
    pub meals: Vec<NewSubmissionMeal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubmissionMeal {
    pub name: String,
    pub foods: Vec<NewSubmissionFood>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmissionFood {
    pub code: String,
    /// Defaults to the survey locale.
    #[serde(default)]
    pub locale: Option<String>,
    pub serving_weight: f64,
    #[serde(default)]
    pub leftovers_weight: f64,
}

/// A submission food with its nutrient snapshot already computed, ready to
/// be stored.
#[derive(Debug, Clone)]
pub struct CapturedFood {
    pub code: String,
    pub english_name: String,
    pub local_name: Option<String>,
    pub locale: String,
    pub nutrient_table_id: String,
    pub nutrient_table_code: String,
    pub serving_weight: f64,
    pub leftovers_weight: f64,
    pub nutrients: BTreeMap<String, f64>,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CapturedMeal {
    pub name: String,
    pub foods: Vec<CapturedFood>,
}

/// Candidate state written back for one submission food.
#[derive(Debug, Clone, PartialEq)]
pub struct FoodUpdate {
    pub id: i64,
    pub nutrient_table_id: String,
    pub nutrient_table_code: String,
    pub nutrients: BTreeMap<String, f64>,
    pub fields: BTreeMap<String, String>,
}

// --- Jobs ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    SurveyNutrientsRecalculation,
}

impl JobType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::SurveyNutrientsRecalculation => "SurveyNutrientsRecalculation",
        }
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SurveyNutrientsRecalculation" => Ok(JobType::SurveyNutrientsRecalculation),
            _ => bail!("Unknown job type '{s}'"),
        }
    }
}

/// Persisted job record, used by the host to report progress and outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

// --- Validation ---

/// Validate an identifier-like value (codes, table ids, survey slugs).
pub fn validate_code(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{kind} must not be empty");
    }
    if value.len() > 64 {
        bail!("{kind} '{value}' is longer than 64 characters");
    }
    if value.chars().any(char::is_whitespace) {
        bail!("{kind} '{value}' must not contain whitespace");
    }
    Ok(())
}

/// Locales look like `en_GB` or `pt-BR`.
pub fn validate_locale(locale: &str) -> Result<()> {
    let valid = !locale.is_empty()
        && locale.len() <= 16
        && locale
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        bail!("Invalid locale '{locale}'. Use a tag like 'en_GB'");
    }
    Ok(())
}

pub fn validate_portion(serving_weight: f64, leftovers_weight: f64) -> Result<()> {
    if !serving_weight.is_finite() || serving_weight <= 0.0 {
        bail!("servingWeight must be greater than 0");
    }
    if !leftovers_weight.is_finite() || leftovers_weight < 0.0 {
        bail!("leftoversWeight must not be negative");
    }
    if leftovers_weight > serving_weight {
        bail!("leftoversWeight ({leftovers_weight}) must not exceed servingWeight ({serving_weight})");
    }
    Ok(())
}

pub fn validate_composition_record(record: &NewCompositionRecord) -> Result<()> {
    validate_code("Nutrient table id", &record.key.nutrient_table_id)?;
    validate_code("Record code", &record.key.record_code)?;
    if record.name.trim().is_empty() {
        bail!("Record {} must have a name", record.key);
    }
    for (nutrient_type, rate) in &record.nutrients {
        if !rate.is_finite() || *rate < 0.0 {
            bail!(
                "Record {}: nutrient {nutrient_type} must be a non-negative number (got {rate})",
                record.key
            );
        }
    }
    Ok(())
}

pub fn validate_new_submission(submission: &NewSubmission) -> Result<()> {
    if submission.meals.is_empty() {
        bail!("Submission must contain at least one meal");
    }
    for meal in &submission.meals {
        if meal.name.trim().is_empty() {
            bail!("Meal name must not be empty");
        }
        for food in &meal.foods {
            validate_code("Food code", &food.code)?;
            if let Some(locale) = &food.locale {
                validate_locale(locale)?;
            }
            validate_portion(food.serving_weight, food.leftovers_weight)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> NewCompositionRecord {
        NewCompositionRecord {
            key: RecordKey::new("NDNS", "101"),
            name: "Apple, raw".to_string(),
            local_name: None,
            nutrients: BTreeMap::from([("1".to_string(), 52.0)]),
            fields: BTreeMap::from([("brand".to_string(), "generic".to_string())]),
        }
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code("Food code", "APPL").is_ok());
        assert!(validate_code("Food code", "").is_err());
        assert!(validate_code("Food code", "   ").is_err());
        assert!(validate_code("Food code", "AP PL").is_err());
        assert!(validate_code("Food code", &"X".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_locale() {
        assert!(validate_locale("en_GB").is_ok());
        assert!(validate_locale("pt-BR").is_ok());
        assert!(validate_locale("").is_err());
        assert!(validate_locale("en GB").is_err());
    }

    #[test]
    fn test_validate_portion() {
        assert!(validate_portion(100.0, 0.0).is_ok());
        assert!(validate_portion(100.0, 100.0).is_ok());
        assert!(validate_portion(0.0, 0.0).is_err());
        assert!(validate_portion(100.0, -1.0).is_err());
        assert!(validate_portion(100.0, 150.0).is_err());
        assert!(validate_portion(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_validate_composition_record() {
        assert!(validate_composition_record(&sample_record()).is_ok());

        let mut unnamed = sample_record();
        unnamed.name = " ".to_string();
        assert!(validate_composition_record(&unnamed).is_err());

        let mut negative = sample_record();
        negative.nutrients.insert("2".to_string(), -3.0);
        let err = validate_composition_record(&negative).unwrap_err();
        assert!(err.to_string().contains("nutrient 2"));
    }

    #[test]
    fn test_validate_new_submission() {
        let submission: NewSubmission = serde_json::from_str(
            r#"{"meals":[{"name":"Breakfast","foods":[{"code":"APPL","servingWeight":150}]}]}"#,
        )
        .unwrap();
        assert!(validate_new_submission(&submission).is_ok());
        assert_eq!(submission.meals[0].foods[0].leftovers_weight, 0.0);
        assert!(submission.meals[0].foods[0].locale.is_none());

        let empty = NewSubmission { meals: vec![] };
        assert!(validate_new_submission(&empty).is_err());
    }

    #[test]
    fn test_job_type_round_trip() {
        let t: JobType = "SurveyNutrientsRecalculation".parse().unwrap();
        assert_eq!(t, JobType::SurveyNutrientsRecalculation);
        assert!("SurveyDataExport".parse::<JobType>().is_err());
    }

    #[test]
    fn test_record_key_display() {
        assert_eq!(RecordKey::new("NDNS", "101").to_string(), "NDNS/101");
    }
}
