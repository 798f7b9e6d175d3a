//! Survey nutrient recalculation.
//!
//! Walks every food recorded in a survey's submissions in pages of
//! [`BATCH_SIZE`], reconciles each one against the live food composition
//! data (see [`crate::reconcile`]), writes back the ones that changed and
//! reports progress once per page.
//!
//! Runs are not atomic: pages already written stay written if a later page
//! fails. They are idempotent instead, so a failed run can simply be
//! repeated.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{CompositionRecord, FoodKey, FoodUpdate, RecordKey, SubmissionFood};
use crate::reconcile::{
    RecalculationMode, RecalculationPolicy, ReferenceLookup, UnknownMode, reconcile,
};

/// Maximum number of submission foods loaded and written at once.
pub const BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum RecalcError {
    #[error("Unknown recalculation mode '{0}'. Must be one of: none, values-only, values-and-codes")]
    UnknownMode(String),

    #[error("Invalid recalculation parameters: {0}")]
    InvalidParams(String),

    #[error("Survey '{0}' not found")]
    SurveyNotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<UnknownMode> for RecalcError {
    fn from(UnknownMode(mode): UnknownMode) -> Self {
        RecalcError::UnknownMode(mode)
    }
}

/// Job parameters, as persisted on the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationParams {
    pub survey_id: String,
    pub mode: String,
    #[serde(default)]
    pub sync_fields: bool,
}

impl RecalculationParams {
    pub fn new(survey_id: impl Into<String>, mode: RecalculationMode, sync_fields: bool) -> Self {
        Self {
            survey_id: survey_id.into(),
            mode: mode.as_str().to_string(),
            sync_fields,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, RecalcError> {
        serde_json::from_value(value.clone()).map_err(|e| RecalcError::InvalidParams(e.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "surveyId": self.survey_id,
            "mode": self.mode,
            "syncFields": self.sync_fields,
        })
    }

    pub fn policy(&self) -> Result<RecalculationPolicy, RecalcError> {
        let mode: RecalculationMode = self.mode.parse()?;
        Ok(RecalculationPolicy::new(mode, self.sync_fields))
    }
}

/// Progress sink supplied by the job host. Receives the fraction of records
/// processed so far, in `(0, 1]`.
pub trait JobProgress {
    fn report_progress(&mut self, fraction: f64) -> anyhow::Result<()>;
}

impl<F: FnMut(f64)> JobProgress for F {
    fn report_progress(&mut self, fraction: f64) -> anyhow::Result<()> {
        self(fraction);
        Ok(())
    }
}

/// Persistence used by a recalculation run.
pub trait RecalcStore {
    fn survey_exists(&self, survey_id: &str) -> anyhow::Result<bool>;
    fn count_survey_foods(&self, survey_id: &str) -> anyhow::Result<u64>;
    fn survey_foods_page(
        &self,
        survey_id: &str,
        after_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<SubmissionFood>>;
    fn records_by_key(
        &self,
        keys: &[RecordKey],
    ) -> anyhow::Result<HashMap<RecordKey, CompositionRecord>>;
    fn records_by_mapping(
        &self,
        foods: &[FoodKey],
    ) -> anyhow::Result<HashMap<FoodKey, CompositionRecord>>;
    fn write_food_updates(&self, updates: &[FoodUpdate]) -> anyhow::Result<()>;
}

impl RecalcStore for Database {
    fn survey_exists(&self, survey_id: &str) -> anyhow::Result<bool> {
        Database::survey_exists(self, survey_id)
    }

    fn count_survey_foods(&self, survey_id: &str) -> anyhow::Result<u64> {
        Database::count_survey_foods(self, survey_id)
    }

    fn survey_foods_page(
        &self,
        survey_id: &str,
        after_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<SubmissionFood>> {
        Database::survey_foods_page(self, survey_id, after_id, limit)
    }

    fn records_by_key(
        &self,
        keys: &[RecordKey],
    ) -> anyhow::Result<HashMap<RecordKey, CompositionRecord>> {
        Database::records_by_key(self, keys)
    }

    fn records_by_mapping(
        &self,
        foods: &[FoodKey],
    ) -> anyhow::Result<HashMap<FoodKey, CompositionRecord>> {
        Database::records_by_mapping(self, foods)
    }

    fn write_food_updates(&self, updates: &[FoodUpdate]) -> anyhow::Result<()> {
        Database::write_food_updates(self, updates)
    }
}

/// Running counts for one recalculation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecalcSummary {
    pub total: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl RecalcSummary {
    pub fn record(&mut self, changed: bool) {
        self.total += 1;
        if changed {
            self.updated += 1;
        } else {
            self.skipped += 1;
        }
    }
}

impl fmt::Display for RecalcSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {}, Updated: {}, Skipped: {}",
            self.total, self.updated, self.skipped
        )
    }
}

/// Recalculate every submission food in a survey.
///
/// Fails before touching any record if the mode is unknown or the survey
/// does not exist. Store failures abort the run at the current page.
#[allow(clippy::cast_precision_loss)]
pub fn recalculate_survey<S: RecalcStore + ?Sized>(
    store: &S,
    params: &RecalculationParams,
    progress: &mut dyn JobProgress,
) -> Result<RecalcSummary, RecalcError> {
    let policy = params.policy()?;
    let survey_id = params.survey_id.as_str();

    if !store.survey_exists(survey_id)? {
        return Err(RecalcError::SurveyNotFound(survey_id.to_string()));
    }

    let expected = store.count_survey_foods(survey_id)?;
    info!(
        survey_id,
        mode = %policy.mode(),
        sync_fields = params.sync_fields,
        records = expected,
        "Recalculating survey nutrients"
    );

    let mut summary = RecalcSummary::default();
    if expected == 0 {
        return Ok(summary);
    }

    let mut after_id = 0;
    loop {
        let page = store.survey_foods_page(survey_id, after_id, BATCH_SIZE)?;
        let Some(last) = page.last() else {
            break;
        };
        after_id = last.id;

        let lookup = load_references(store, policy, &page)?;
        let mut updates = Vec::new();
        let mut unresolved = 0;
        for food in &page {
            let reference = lookup.resolve(food);
            if reference.is_none() && policy != RecalculationPolicy::Skip {
                unresolved += 1;
            }
            let reconciled = reconcile(policy, food, reference);
            summary.record(reconciled.changed);
            if reconciled.changed {
                updates.push(reconciled.update);
            }
        }

        if unresolved > 0 {
            warn!(
                survey_id,
                unresolved, "Reference data missing; clearing nutrients and fields"
            );
        }
        if !updates.is_empty() {
            store.write_food_updates(&updates)?;
        }
        debug!(
            survey_id,
            page_size = page.len(),
            updated = updates.len(),
            unresolved,
            "Recalculated page"
        );

        // New submissions may arrive mid-run; never report past completion.
        let fraction = (summary.total as f64 / expected as f64).min(1.0);
        progress.report_progress(fraction)?;

        if page.len() < BATCH_SIZE {
            break;
        }
    }

    info!(survey_id, %summary, "Survey nutrient recalculation finished");
    Ok(summary)
}

fn load_references<S: RecalcStore + ?Sized>(
    store: &S,
    policy: RecalculationPolicy,
    page: &[SubmissionFood],
) -> anyhow::Result<ReferenceLookup> {
    match policy {
        RecalculationPolicy::Skip => Ok(ReferenceLookup::Empty),
        RecalculationPolicy::ValuesOnly { .. } => {
            let keys: BTreeSet<RecordKey> = page.iter().map(SubmissionFood::record_key).collect();
            let keys: Vec<RecordKey> = keys.into_iter().collect();
            Ok(ReferenceLookup::ByRecord(store.records_by_key(&keys)?))
        }
        RecalculationPolicy::ValuesAndCodes { .. } => {
            let foods: BTreeSet<FoodKey> = page.iter().map(SubmissionFood::food_key).collect();
            let foods: Vec<FoodKey> = foods.into_iter().collect();
            Ok(ReferenceLookup::ByMapping(store.records_by_mapping(&foods)?))
        }
    }
}
