use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::db::Database;
use crate::models::{
    CapturedFood, CapturedMeal, CompositionRecord, Food, Job, JobType, NewCompositionRecord,
    NewFood, NewSubmission, NewSurvey, RecordKey, Submission, Survey, validate_code,
    validate_composition_record, validate_locale, validate_new_submission,
};
use crate::nutrients::amounts_for_record;
use crate::recalc::{
    JobProgress, RecalcError, RecalcSummary, RecalculationParams, recalculate_survey,
};
use crate::table_import::{self, TableImportSummary};

/// Mirrors engine progress onto the persisted job record before passing it
/// on to the caller.
struct JobRecordProgress<'a> {
    db: &'a Database,
    job_id: &'a str,
    forward: &'a mut dyn JobProgress,
}

impl JobProgress for JobRecordProgress<'_> {
    fn report_progress(&mut self, fraction: f64) -> Result<()> {
        self.db.set_job_progress(self.job_id, fraction)?;
        self.forward.report_progress(fraction)
    }
}

pub struct IntakeService {
    db: Database,
}

impl IntakeService {
    pub fn new(db_path: &Path) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self { db })
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db })
    }

    // --- Surveys ---

    pub fn create_survey(&self, survey: &NewSurvey) -> Result<Survey> {
        validate_code("Survey id", &survey.id)?;
        validate_locale(&survey.locale)?;
        if survey.name.trim().is_empty() {
            bail!("Survey name must not be empty");
        }
        self.db.insert_survey(survey)
    }

    pub fn get_survey(&self, id: &str) -> Result<Option<Survey>> {
        self.db.get_survey(id)
    }

    pub fn list_surveys(&self) -> Result<Vec<Survey>> {
        self.db.list_surveys()
    }

    // --- Foods and mappings ---

    pub fn add_food(&self, food: &NewFood) -> Result<Food> {
        validate_code("Food code", &food.code)?;
        validate_locale(&food.locale)?;
        if food.name.trim().is_empty() {
            bail!("Food name must not be empty");
        }
        self.db.insert_food(food)
    }

    pub fn get_food(&self, code: &str, locale: &str) -> Result<Option<Food>> {
        self.db.get_food(code, locale)
    }

    pub fn list_foods(&self, locale: Option<&str>) -> Result<Vec<Food>> {
        self.db.list_foods(locale)
    }

    pub fn delete_food(&self, code: &str, locale: &str) -> Result<bool> {
        self.db.delete_food(code, locale)
    }

    pub fn map_food(&self, code: &str, locale: &str, key: &RecordKey) -> Result<Food> {
        self.db.set_food_mapping(code, locale, key)
    }

    pub fn unmap_food(&self, code: &str, locale: &str) -> Result<bool> {
        self.db.clear_food_mapping(code, locale)
    }

    // --- Composition records ---

    pub fn save_record(&self, record: &NewCompositionRecord) -> Result<CompositionRecord> {
        validate_composition_record(record)?;
        let (stored, _) = self.db.upsert_composition_record(record)?;
        Ok(stored)
    }

    pub fn get_record(&self, key: &RecordKey) -> Result<Option<CompositionRecord>> {
        self.db.get_composition_record(key)
    }

    pub fn delete_record(&self, key: &RecordKey) -> Result<bool> {
        self.db.delete_composition_record(key)
    }

    pub fn import_table_csv(
        &self,
        table_id: &str,
        csv_data: &str,
        dry_run: bool,
    ) -> Result<TableImportSummary> {
        let rows = table_import::parse_table_csv(csv_data.as_bytes())?;
        table_import::import_table(&self.db, table_id, &rows, dry_run)
    }

    // --- Submissions ---

    /// Store a completed recall, snapshotting each food's nutrients from the
    /// record its food is currently mapped to.
    pub fn submit_recall(&self, survey_id: &str, submission: &NewSubmission) -> Result<Submission> {
        let survey = self
            .db
            .get_survey(survey_id)?
            .with_context(|| format!("Survey '{survey_id}' not found"))?;
        validate_new_submission(submission)?;

        let mut meals = Vec::with_capacity(submission.meals.len());
        for meal in &submission.meals {
            let mut foods = Vec::with_capacity(meal.foods.len());
            for entry in &meal.foods {
                let locale = entry.locale.as_deref().unwrap_or(&survey.locale);
                let food = self
                    .db
                    .get_food(&entry.code, locale)?
                    .with_context(|| format!("Food {} ({locale}) not found", entry.code))?;
                foods.push(self.capture_food(&food, entry.serving_weight, entry.leftovers_weight)?);
            }
            meals.push(CapturedMeal {
                name: meal.name.clone(),
                foods,
            });
        }

        let stored = self.db.insert_submission(&survey.id, &meals)?;
        info!(survey_id, submission_id = %stored.id, "Stored submission");
        Ok(stored)
    }

    fn capture_food(
        &self,
        food: &Food,
        serving_weight: f64,
        leftovers_weight: f64,
    ) -> Result<CapturedFood> {
        let mut captured = CapturedFood {
            code: food.code.clone(),
            english_name: food.name.clone(),
            local_name: None,
            locale: food.locale.clone(),
            nutrient_table_id: String::new(),
            nutrient_table_code: String::new(),
            serving_weight,
            leftovers_weight,
            nutrients: BTreeMap::new(),
            fields: BTreeMap::new(),
        };

        let Some(key) = &food.nutrient_record else {
            return Ok(captured);
        };
        captured.nutrient_table_id.clone_from(&key.nutrient_table_id);
        captured.nutrient_table_code.clone_from(&key.record_code);

        match self.db.get_composition_record(key)? {
            Some(record) => {
                captured.local_name = record.local_name.clone();
                captured.nutrients = amounts_for_record(&record, serving_weight, leftovers_weight);
                captured.fields = record.fields;
            }
            None => warn!(
                code = %food.code,
                locale = %food.locale,
                record = %key,
                "Food is mapped to a missing nutrient table record"
            ),
        }
        Ok(captured)
    }

    pub fn get_submission(&self, id: &str) -> Result<Submission> {
        self.db.get_submission(id)
    }

    // --- Jobs ---

    /// Validate recalculation parameters and persist a job for them.
    pub fn queue_recalculation(&self, params: &RecalculationParams) -> Result<Job, RecalcError> {
        params.policy()?;
        if !self.db.survey_exists(&params.survey_id)? {
            return Err(RecalcError::SurveyNotFound(params.survey_id.clone()));
        }
        let job = self
            .db
            .create_job(JobType::SurveyNutrientsRecalculation, &params.to_json())?;
        info!(job_id = %job.id, survey_id = %params.survey_id, "Queued recalculation");
        Ok(job)
    }

    /// Run a queued job to completion, recording its outcome on the job.
    ///
    /// Engine errors are returned as-is after the job has been marked failed.
    pub fn run_job(
        &self,
        job_id: &str,
        progress: &mut dyn JobProgress,
    ) -> Result<RecalcSummary, RecalcError> {
        let job = self.db.get_job(job_id)?;
        self.db.start_job(job_id)?;
        info!(job_id, job_type = %job.job_type, "Job started");

        let mut tracker = JobRecordProgress {
            db: &self.db,
            job_id,
            forward: progress,
        };
        let result = self.execute(&job, &mut tracker);

        match &result {
            Ok(summary) => {
                self.db.complete_job(job_id, true, &summary.to_string())?;
                info!(job_id, %summary, "Job completed");
            }
            Err(e) => {
                if let Err(store_err) = self.db.complete_job(job_id, false, &e.to_string()) {
                    warn!(job_id, error = %store_err, "Failed to record job failure");
                }
                error!(job_id, error = %e, "Job failed");
            }
        }
        result
    }

    fn execute(&self, job: &Job, progress: &mut dyn JobProgress) -> Result<RecalcSummary, RecalcError> {
        let job_type: JobType = job
            .job_type
            .parse()
            .map_err(|e: anyhow::Error| RecalcError::InvalidParams(e.to_string()))?;
        match job_type {
            JobType::SurveyNutrientsRecalculation => {
                let params = RecalculationParams::from_json(&job.params)?;
                recalculate_survey(&self.db, &params, progress)
            }
        }
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.db.get_job(id)
    }

    pub fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        self.db.list_jobs(limit)
    }
}
