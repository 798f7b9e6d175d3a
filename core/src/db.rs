use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Local;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::models::{
    CapturedMeal, CompositionRecord, Food, FoodKey, FoodUpdate, Job, JobType,
    NewCompositionRecord, NewFood, NewSurvey, RecordKey, Submission, SubmissionFood,
    SubmissionMeal, Survey,
};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS surveys (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    locale TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS nutrient_table_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    nutrient_table_id TEXT NOT NULL,
                    record_code TEXT NOT NULL,
                    name TEXT NOT NULL,
                    local_name TEXT,
                    updated_at TEXT NOT NULL,
                    UNIQUE (nutrient_table_id, record_code)
                );

                CREATE TABLE IF NOT EXISTS nutrient_table_record_nutrients (
                    record_id INTEGER NOT NULL REFERENCES nutrient_table_records(id) ON DELETE CASCADE,
                    nutrient_type_id TEXT NOT NULL,
                    units_per_100g REAL NOT NULL,
                    PRIMARY KEY (record_id, nutrient_type_id)
                );

                CREATE TABLE IF NOT EXISTS nutrient_table_record_fields (
                    record_id INTEGER NOT NULL REFERENCES nutrient_table_records(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (record_id, name)
                );

                CREATE TABLE IF NOT EXISTS foods (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    code TEXT NOT NULL,
                    locale TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (code, locale)
                );

                -- Points at a record by key rather than by row id: the record
                -- may be deleted independently of the mapping.
                CREATE TABLE IF NOT EXISTS food_nutrient_mappings (
                    food_id INTEGER PRIMARY KEY REFERENCES foods(id) ON DELETE CASCADE,
                    nutrient_table_id TEXT NOT NULL,
                    record_code TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS survey_submissions (
                    id TEXT PRIMARY KEY,
                    survey_id TEXT NOT NULL REFERENCES surveys(id),
                    submitted_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS survey_submission_meals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    submission_id TEXT NOT NULL REFERENCES survey_submissions(id) ON DELETE CASCADE,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS survey_submission_foods (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    meal_id INTEGER NOT NULL REFERENCES survey_submission_meals(id) ON DELETE CASCADE,
                    code TEXT NOT NULL,
                    english_name TEXT NOT NULL,
                    local_name TEXT,
                    locale TEXT NOT NULL,
                    nutrient_table_id TEXT NOT NULL DEFAULT '',
                    nutrient_table_code TEXT NOT NULL DEFAULT '',
                    serving_weight REAL NOT NULL,
                    leftovers_weight REAL NOT NULL DEFAULT 0,
                    nutrients TEXT NOT NULL DEFAULT '{}',
                    fields TEXT NOT NULL DEFAULT '{}'
                );

                CREATE INDEX IF NOT EXISTS idx_submissions_survey ON survey_submissions(survey_id);
                CREATE INDEX IF NOT EXISTS idx_submission_meals_submission ON survey_submission_meals(submission_id);
                CREATE INDEX IF NOT EXISTS idx_submission_foods_meal ON survey_submission_foods(meal_id);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    job_type TEXT NOT NULL,
                    params TEXT NOT NULL,
                    progress REAL,
                    successful INTEGER,
                    message TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn json_column<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
        let text: String = row.get(idx)?;
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn survey_from_row(row: &rusqlite::Row) -> rusqlite::Result<Survey> {
        Ok(Survey {
            id: row.get(0)?,
            name: row.get(1)?,
            locale: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    // Expects columns:
    // 0: f.id, 1: f.code, 2: f.locale, 3: f.name, 4: f.created_at, 5: f.updated_at,
    // 6: m.nutrient_table_id, 7: m.record_code
    fn food_from_row(row: &rusqlite::Row) -> rusqlite::Result<Food> {
        let table: Option<String> = row.get(6)?;
        let record: Option<String> = row.get(7)?;
        Ok(Food {
            id: row.get(0)?,
            code: row.get(1)?,
            locale: row.get(2)?,
            name: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            nutrient_record: table.zip(record).map(|(t, r)| RecordKey::new(t, r)),
        })
    }

    // Expects columns: 0: id, 1: nutrient_table_id, 2: record_code, 3: name, 4: local_name
    fn record_from_row(row: &rusqlite::Row) -> rusqlite::Result<(i64, CompositionRecord)> {
        Ok((
            row.get(0)?,
            CompositionRecord {
                key: RecordKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
                name: row.get(3)?,
                local_name: row.get(4)?,
                nutrients: BTreeMap::new(),
                fields: BTreeMap::new(),
            },
        ))
    }

    // Expects columns in the order of SUBMISSION_FOOD_COLUMNS.
    fn submission_food_from_row(row: &rusqlite::Row) -> rusqlite::Result<SubmissionFood> {
        Ok(SubmissionFood {
            id: row.get(0)?,
            meal_id: row.get(1)?,
            code: row.get(2)?,
            english_name: row.get(3)?,
            local_name: row.get(4)?,
            locale: row.get(5)?,
            nutrient_table_id: row.get(6)?,
            nutrient_table_code: row.get(7)?,
            serving_weight: row.get(8)?,
            leftovers_weight: row.get(9)?,
            nutrients: Self::json_column(row, 10)?,
            fields: Self::json_column(row, 11)?,
        })
    }

    fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        Ok(Job {
            id: row.get(0)?,
            job_type: row.get(1)?,
            params: Self::json_column(row, 2)?,
            progress: row.get(3)?,
            successful: row.get(4)?,
            message: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    // --- Surveys ---

    pub fn insert_survey(&self, survey: &NewSurvey) -> Result<Survey> {
        let now = Local::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO surveys (id, name, locale, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![survey.id, survey.name, survey.locale, now],
            )
            .with_context(|| format!("Failed to create survey '{}'", survey.id))?;
        self.get_survey(&survey.id)?
            .with_context(|| format!("Survey '{}' not found", survey.id))
    }

    pub fn get_survey(&self, id: &str) -> Result<Option<Survey>> {
        let survey = self
            .conn
            .query_row(
                "SELECT id, name, locale, created_at FROM surveys WHERE id = ?1",
                params![id],
                Self::survey_from_row,
            )
            .optional()?;
        Ok(survey)
    }

    pub fn list_surveys(&self) -> Result<Vec<Survey>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, locale, created_at FROM surveys ORDER BY id")?;
        let surveys = stmt
            .query_map([], Self::survey_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(surveys)
    }

    pub fn survey_exists(&self, id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM surveys WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // --- Composition records ---

    /// Insert a record, or replace the name and full nutrient/field sets of an
    /// existing one. Returns the stored record and whether it was created.
    pub fn upsert_composition_record(
        &self,
        record: &NewCompositionRecord,
    ) -> Result<(CompositionRecord, bool)> {
        let now = Local::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM nutrient_table_records WHERE nutrient_table_id = ?1 AND record_code = ?2",
                params![record.key.nutrient_table_id, record.key.record_code],
                |row| row.get(0),
            )
            .optional()?;

        let record_id = if let Some(id) = existing {
            tx.execute(
                "UPDATE nutrient_table_records SET name = ?1, local_name = ?2, updated_at = ?3 WHERE id = ?4",
                params![record.name, record.local_name, now, id],
            )?;
            tx.execute(
                "DELETE FROM nutrient_table_record_nutrients WHERE record_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM nutrient_table_record_fields WHERE record_id = ?1",
                params![id],
            )?;
            id
        } else {
            tx.execute(
                "INSERT INTO nutrient_table_records (nutrient_table_id, record_code, name, local_name, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.key.nutrient_table_id,
                    record.key.record_code,
                    record.name,
                    record.local_name,
                    now,
                ],
            )?;
            tx.last_insert_rowid()
        };

        {
            let mut stmt = tx.prepare(
                "INSERT INTO nutrient_table_record_nutrients (record_id, nutrient_type_id, units_per_100g)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (nutrient_type, rate) in &record.nutrients {
                stmt.execute(params![record_id, nutrient_type, rate])?;
            }
            let mut stmt = tx.prepare(
                "INSERT INTO nutrient_table_record_fields (record_id, name, value) VALUES (?1, ?2, ?3)",
            )?;
            for (name, value) in &record.fields {
                stmt.execute(params![record_id, name, value])?;
            }
        }
        tx.commit()?;

        let stored = self
            .get_composition_record(&record.key)?
            .with_context(|| format!("Record {} not found", record.key))?;
        Ok((stored, existing.is_none()))
    }

    pub fn get_composition_record(&self, key: &RecordKey) -> Result<Option<CompositionRecord>> {
        let mut records = self.records_by_key(std::slice::from_ref(key))?;
        Ok(records.remove(key))
    }

    pub fn delete_composition_record(&self, key: &RecordKey) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM nutrient_table_records WHERE nutrient_table_id = ?1 AND record_code = ?2",
            params![key.nutrient_table_id, key.record_code],
        )?;
        Ok(rows > 0)
    }

    /// Load the records with the given keys. Keys with no record are absent
    /// from the result.
    pub fn records_by_key(&self, keys: &[RecordKey]) -> Result<HashMap<RecordKey, CompositionRecord>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let clause = vec!["(nutrient_table_id = ? AND record_code = ?)"; keys.len()].join(" OR ");
        let args: Vec<&str> = keys
            .iter()
            .flat_map(|k| [k.nutrient_table_id.as_str(), k.record_code.as_str()])
            .collect();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, nutrient_table_id, record_code, name, local_name
             FROM nutrient_table_records WHERE {clause}"
        ))?;
        let mut by_id: HashMap<i64, CompositionRecord> = stmt
            .query_map(params_from_iter(args), Self::record_from_row)?
            .collect::<Result<_, _>>()?;
        self.attach_components(&mut by_id)?;
        Ok(by_id.into_values().map(|r| (r.key.clone(), r)).collect())
    }

    /// Resolve foods to the record their current mapping points at. A food
    /// is absent from the result if it does not exist, has no mapping, or
    /// its mapping points at a record that does not exist.
    pub fn records_by_mapping(
        &self,
        foods: &[FoodKey],
    ) -> Result<HashMap<FoodKey, CompositionRecord>> {
        if foods.is_empty() {
            return Ok(HashMap::new());
        }
        let clause = vec!["(f.code = ? AND f.locale = ?)"; foods.len()].join(" OR ");
        let args: Vec<&str> = foods
            .iter()
            .flat_map(|k| [k.code.as_str(), k.locale.as_str()])
            .collect();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT r.id, r.nutrient_table_id, r.record_code, r.name, r.local_name, f.code, f.locale
             FROM foods f
             JOIN food_nutrient_mappings m ON m.food_id = f.id
             JOIN nutrient_table_records r
               ON r.nutrient_table_id = m.nutrient_table_id AND r.record_code = m.record_code
             WHERE {clause}"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                let (id, record) = Self::record_from_row(row)?;
                let food = FoodKey::new(row.get::<_, String>(5)?, row.get::<_, String>(6)?);
                Ok((food, id, record))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut by_id: HashMap<i64, CompositionRecord> = rows
            .iter()
            .map(|(_, id, record)| (*id, record.clone()))
            .collect();
        self.attach_components(&mut by_id)?;

        Ok(rows
            .into_iter()
            .filter_map(|(food, id, _)| by_id.get(&id).map(|r| (food, r.clone())))
            .collect())
    }

    fn attach_components(&self, records: &mut HashMap<i64, CompositionRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = records.keys().copied().collect();
        let placeholders = vec!["?"; ids.len()].join(", ");

        let mut stmt = self.conn.prepare(&format!(
            "SELECT record_id, nutrient_type_id, units_per_100g
             FROM nutrient_table_record_nutrients WHERE record_id IN ({placeholders})"
        ))?;
        let nutrients = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, nutrient_type, rate) in nutrients {
            if let Some(record) = records.get_mut(&id) {
                record.nutrients.insert(nutrient_type, rate);
            }
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT record_id, name, value
             FROM nutrient_table_record_fields WHERE record_id IN ({placeholders})"
        ))?;
        let fields = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, name, value) in fields {
            if let Some(record) = records.get_mut(&id) {
                record.fields.insert(name, value);
            }
        }
        Ok(())
    }

    // --- Foods and mappings ---

    pub fn insert_food(&self, food: &NewFood) -> Result<Food> {
        let now = Local::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO foods (code, locale, name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![food.code, food.locale, food.name, now, now],
            )
            .with_context(|| format!("Failed to add food {} ({})", food.code, food.locale))?;
        self.get_food(&food.code, &food.locale)?
            .context("Food not found")
    }

    pub fn get_food(&self, code: &str, locale: &str) -> Result<Option<Food>> {
        let food = self
            .conn
            .query_row(
                "SELECT f.id, f.code, f.locale, f.name, f.created_at, f.updated_at,
                        m.nutrient_table_id, m.record_code
                 FROM foods f
                 LEFT JOIN food_nutrient_mappings m ON m.food_id = f.id
                 WHERE f.code = ?1 AND f.locale = ?2",
                params![code, locale],
                Self::food_from_row,
            )
            .optional()?;
        Ok(food)
    }

    pub fn list_foods(&self, locale: Option<&str>) -> Result<Vec<Food>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.code, f.locale, f.name, f.created_at, f.updated_at,
                    m.nutrient_table_id, m.record_code
             FROM foods f
             LEFT JOIN food_nutrient_mappings m ON m.food_id = f.id
             WHERE ?1 IS NULL OR f.locale = ?1
             ORDER BY f.locale, f.code",
        )?;
        let foods = stmt
            .query_map(params![locale], Self::food_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(foods)
    }

    pub fn delete_food(&self, code: &str, locale: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM foods WHERE code = ?1 AND locale = ?2",
            params![code, locale],
        )?;
        Ok(rows > 0)
    }

    /// Point a food at a composition record, replacing any previous mapping.
    pub fn set_food_mapping(&self, code: &str, locale: &str, key: &RecordKey) -> Result<Food> {
        let food = self
            .get_food(code, locale)?
            .with_context(|| format!("Food {code} ({locale}) not found"))?;
        if self.get_composition_record(key)?.is_none() {
            bail!("Nutrient table record {key} not found");
        }
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO food_nutrient_mappings (food_id, nutrient_table_id, record_code, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(food_id) DO UPDATE SET
                nutrient_table_id = excluded.nutrient_table_id,
                record_code = excluded.record_code,
                updated_at = excluded.updated_at",
            params![food.id, key.nutrient_table_id, key.record_code, now],
        )?;
        self.conn.execute(
            "UPDATE foods SET updated_at = ?1 WHERE id = ?2",
            params![now, food.id],
        )?;
        self.get_food(code, locale)?.context("Food not found")
    }

    pub fn clear_food_mapping(&self, code: &str, locale: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM food_nutrient_mappings
             WHERE food_id = (SELECT id FROM foods WHERE code = ?1 AND locale = ?2)",
            params![code, locale],
        )?;
        Ok(rows > 0)
    }

    // --- Submissions ---

    pub fn insert_submission(&self, survey_id: &str, meals: &[CapturedMeal]) -> Result<Submission> {
        let now = Local::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO survey_submissions (id, survey_id, submitted_at) VALUES (?1, ?2, ?3)",
            params![id, survey_id, now],
        )
        .with_context(|| format!("Failed to store submission for survey '{survey_id}'"))?;

        for meal in meals {
            tx.execute(
                "INSERT INTO survey_submission_meals (submission_id, name) VALUES (?1, ?2)",
                params![id, meal.name],
            )?;
            let meal_id = tx.last_insert_rowid();
            let mut stmt = tx.prepare(
                "INSERT INTO survey_submission_foods (meal_id, code, english_name, local_name, locale,
                    nutrient_table_id, nutrient_table_code, serving_weight, leftovers_weight,
                    nutrients, fields)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for food in &meal.foods {
                stmt.execute(params![
                    meal_id,
                    food.code,
                    food.english_name,
                    food.local_name,
                    food.locale,
                    food.nutrient_table_id,
                    food.nutrient_table_code,
                    food.serving_weight,
                    food.leftovers_weight,
                    serde_json::to_string(&food.nutrients)?,
                    serde_json::to_string(&food.fields)?,
                ])?;
            }
        }
        tx.commit()?;
        self.get_submission(&id)
    }

    pub fn get_submission(&self, id: &str) -> Result<Submission> {
        let (survey_id, submitted_at): (String, String) = self
            .conn
            .query_row(
                "SELECT survey_id, submitted_at FROM survey_submissions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Submission not found")?;

        let mut stmt = self.conn.prepare(
            "SELECT id, name FROM survey_submission_meals WHERE submission_id = ?1 ORDER BY id",
        )?;
        let meal_rows = stmt
            .query_map(params![id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUBMISSION_FOOD_COLUMNS} FROM survey_submission_foods sf
             WHERE sf.meal_id = ?1 ORDER BY sf.id"
        ))?;
        let mut meals = Vec::with_capacity(meal_rows.len());
        for (meal_id, name) in meal_rows {
            let foods = stmt
                .query_map(params![meal_id], Self::submission_food_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            meals.push(SubmissionMeal {
                id: meal_id,
                name,
                foods,
            });
        }

        Ok(Submission {
            id: id.to_string(),
            survey_id,
            submitted_at,
            meals,
        })
    }

    pub fn get_submission_food(&self, id: i64) -> Result<SubmissionFood> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SUBMISSION_FOOD_COLUMNS} FROM survey_submission_foods sf WHERE sf.id = ?1"
                ),
                params![id],
                Self::submission_food_from_row,
            )
            .context("Submission food not found")
    }

    pub fn count_survey_foods(&self, survey_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM survey_submission_foods sf
             JOIN survey_submission_meals m ON sf.meal_id = m.id
             JOIN survey_submissions s ON m.submission_id = s.id
             WHERE s.survey_id = ?1",
            params![survey_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Next page of a survey's submission foods with `id > after_id`, in id
    /// order.
    pub fn survey_foods_page(
        &self,
        survey_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SubmissionFood>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUBMISSION_FOOD_COLUMNS}
             FROM survey_submission_foods sf
             JOIN survey_submission_meals m ON sf.meal_id = m.id
             JOIN survey_submissions s ON m.submission_id = s.id
             WHERE s.survey_id = ?1 AND sf.id > ?2
             ORDER BY sf.id
             LIMIT ?3"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let foods = stmt
            .query_map(
                params![survey_id, after_id, limit],
                Self::submission_food_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(foods)
    }

    /// Write back recalculated foods. All updates commit together or not at
    /// all.
    pub fn write_food_updates(&self, updates: &[FoodUpdate]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE survey_submission_foods
                 SET nutrient_table_id = ?1, nutrient_table_code = ?2, nutrients = ?3, fields = ?4
                 WHERE id = ?5",
            )?;
            for update in updates {
                let rows = stmt.execute(params![
                    update.nutrient_table_id,
                    update.nutrient_table_code,
                    serde_json::to_string(&update.nutrients)?,
                    serde_json::to_string(&update.fields)?,
                    update.id,
                ])?;
                if rows == 0 {
                    bail!("Submission food {} no longer exists", update.id);
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- Jobs ---

    pub fn create_job(&self, job_type: JobType, params: &serde_json::Value) -> Result<Job> {
        let now = Local::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO jobs (id, job_type, params, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, job_type.as_str(), serde_json::to_string(params)?, now],
        )?;
        self.get_job(&id)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.conn
            .query_row(
                "SELECT id, job_type, params, progress, successful, message, created_at,
                        started_at, completed_at
                 FROM jobs WHERE id = ?1",
                params![id],
                Self::job_from_row,
            )
            .with_context(|| format!("Job '{id}' not found"))
    }

    pub fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_type, params, progress, successful, message, created_at,
                    started_at, completed_at
             FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let jobs = stmt
            .query_map(params![limit], Self::job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn start_job(&self, id: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        let rows = self.conn.execute(
            "UPDATE jobs SET started_at = ?1, progress = 0, successful = NULL, message = NULL,
                completed_at = NULL
             WHERE id = ?2",
            params![now, id],
        )?;
        if rows == 0 {
            bail!("Job '{id}' not found");
        }
        Ok(())
    }

    pub fn set_job_progress(&self, id: &str, progress: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET progress = ?1 WHERE id = ?2",
            params![progress, id],
        )?;
        Ok(())
    }

    pub fn complete_job(&self, id: &str, successful: bool, message: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE jobs SET successful = ?1, message = ?2, completed_at = ?3,
                progress = CASE WHEN ?1 THEN 1 ELSE progress END
             WHERE id = ?4",
            params![successful, message, now, id],
        )?;
        Ok(())
    }
}

const SUBMISSION_FOOD_COLUMNS: &str = "sf.id, sf.meal_id, sf.code, sf.english_name, sf.local_name, \
     sf.locale, sf.nutrient_table_id, sf.nutrient_table_code, sf.serving_weight, \
     sf.leftovers_weight, sf.nutrients, sf.fields";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CapturedFood;

    fn sample_record(code: &str) -> NewCompositionRecord {
        NewCompositionRecord {
            key: RecordKey::new("NDNS", code),
            name: format!("Record {code}"),
            local_name: None,
            nutrients: BTreeMap::from([("1".to_string(), 52.0), ("2".to_string(), 0.3)]),
            fields: BTreeMap::from([("sub_group".to_string(), "fruit".to_string())]),
        }
    }

    fn sample_survey(db: &Database) -> Survey {
        db.insert_survey(&NewSurvey {
            id: "demo".to_string(),
            name: "Demo survey".to_string(),
            locale: "en_GB".to_string(),
        })
        .unwrap()
    }

    fn captured(code: &str) -> CapturedFood {
        CapturedFood {
            code: code.to_string(),
            english_name: format!("Food {code}"),
            local_name: None,
            locale: "en_GB".to_string(),
            nutrient_table_id: "NDNS".to_string(),
            nutrient_table_code: "101".to_string(),
            serving_weight: 150.0,
            leftovers_weight: 10.0,
            nutrients: BTreeMap::from([("1".to_string(), 72.8)]),
            fields: BTreeMap::from([("sub_group".to_string(), "fruit".to_string())]),
        }
    }

    #[test]
    fn test_insert_and_get_survey() {
        let db = Database::open_in_memory().unwrap();
        let survey = sample_survey(&db);
        assert_eq!(survey.id, "demo");
        assert_eq!(survey.locale, "en_GB");

        assert!(db.survey_exists("demo").unwrap());
        assert!(!db.survey_exists("missing").unwrap());
        assert!(db.get_survey("missing").unwrap().is_none());
        assert_eq!(db.list_surveys().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_survey_rejected() {
        let db = Database::open_in_memory().unwrap();
        sample_survey(&db);
        let err = db
            .insert_survey(&NewSurvey {
                id: "demo".to_string(),
                name: "Again".to_string(),
                locale: "en_GB".to_string(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("demo"));
    }

    #[test]
    fn test_upsert_composition_record() {
        let db = Database::open_in_memory().unwrap();
        let (record, created) = db.upsert_composition_record(&sample_record("101")).unwrap();
        assert!(created);
        assert_eq!(record.nutrients.len(), 2);
        assert_eq!(record.fields["sub_group"], "fruit");

        let mut changed = sample_record("101");
        changed.nutrients.remove("2");
        changed.nutrients.insert("3".to_string(), 9.5);
        changed.fields.clear();
        let (record, created) = db.upsert_composition_record(&changed).unwrap();
        assert!(!created);
        assert_eq!(
            record.nutrients,
            BTreeMap::from([("1".to_string(), 52.0), ("3".to_string(), 9.5)])
        );
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_delete_composition_record() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_composition_record(&sample_record("101")).unwrap();
        let key = RecordKey::new("NDNS", "101");
        assert!(db.delete_composition_record(&key).unwrap());
        assert!(db.get_composition_record(&key).unwrap().is_none());
        assert!(!db.delete_composition_record(&key).unwrap());
    }

    #[test]
    fn test_records_by_key_skips_missing() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_composition_record(&sample_record("101")).unwrap();
        db.upsert_composition_record(&sample_record("102")).unwrap();

        let keys = vec![
            RecordKey::new("NDNS", "101"),
            RecordKey::new("NDNS", "102"),
            RecordKey::new("NDNS", "999"),
            RecordKey::new("OTHER", "101"),
        ];
        let records = db.records_by_key(&keys).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[&keys[1]].nutrients["1"], 52.0);
        assert!(db.records_by_key(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_food_mapping_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_composition_record(&sample_record("101")).unwrap();
        let food = db
            .insert_food(&NewFood {
                code: "APPL".to_string(),
                locale: "en_GB".to_string(),
                name: "Apple".to_string(),
            })
            .unwrap();
        assert!(food.nutrient_record.is_none());

        let key = RecordKey::new("NDNS", "101");
        let mapped = db.set_food_mapping("APPL", "en_GB", &key).unwrap();
        assert_eq!(mapped.nutrient_record, Some(key.clone()));

        let food_key = FoodKey::new("APPL", "en_GB");
        let resolved = db.records_by_mapping(&[food_key.clone()]).unwrap();
        assert_eq!(resolved[&food_key].key, key);

        assert!(db.clear_food_mapping("APPL", "en_GB").unwrap());
        assert!(db.records_by_mapping(&[food_key]).unwrap().is_empty());
        assert!(!db.clear_food_mapping("APPL", "en_GB").unwrap());
    }

    #[test]
    fn test_mapping_to_missing_record_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_food(&NewFood {
            code: "APPL".to_string(),
            locale: "en_GB".to_string(),
            name: "Apple".to_string(),
        })
        .unwrap();
        let err = db
            .set_food_mapping("APPL", "en_GB", &RecordKey::new("NDNS", "404"))
            .unwrap_err();
        assert!(err.to_string().contains("NDNS/404"));
        assert!(
            db.set_food_mapping("PEAR", "en_GB", &RecordKey::new("NDNS", "404"))
                .is_err()
        );
    }

    #[test]
    fn test_dangling_mapping_resolves_to_nothing() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_composition_record(&sample_record("101")).unwrap();
        db.insert_food(&NewFood {
            code: "APPL".to_string(),
            locale: "en_GB".to_string(),
            name: "Apple".to_string(),
        })
        .unwrap();
        let key = RecordKey::new("NDNS", "101");
        db.set_food_mapping("APPL", "en_GB", &key).unwrap();
        db.delete_composition_record(&key).unwrap();

        // Mapping row survives but no longer resolves
        let food = db.get_food("APPL", "en_GB").unwrap().unwrap();
        assert_eq!(food.nutrient_record, Some(key));
        assert!(
            db.records_by_mapping(&[FoodKey::new("APPL", "en_GB")])
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_delete_food_removes_mapping() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_composition_record(&sample_record("101")).unwrap();
        db.insert_food(&NewFood {
            code: "APPL".to_string(),
            locale: "en_GB".to_string(),
            name: "Apple".to_string(),
        })
        .unwrap();
        db.set_food_mapping("APPL", "en_GB", &RecordKey::new("NDNS", "101"))
            .unwrap();

        assert!(db.delete_food("APPL", "en_GB").unwrap());
        assert!(db.get_food("APPL", "en_GB").unwrap().is_none());
        assert!(db.list_foods(None).unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_get_submission() {
        let db = Database::open_in_memory().unwrap();
        sample_survey(&db);
        let submission = db
            .insert_submission(
                "demo",
                &[CapturedMeal {
                    name: "Lunch".to_string(),
                    foods: vec![captured("APPL"), captured("PEAR")],
                }],
            )
            .unwrap();

        assert_eq!(submission.survey_id, "demo");
        assert_eq!(submission.meals.len(), 1);
        let foods = &submission.meals[0].foods;
        assert_eq!(foods.len(), 2);
        assert_eq!(foods[0].code, "APPL");
        assert_eq!(foods[0].nutrients["1"], 72.8);
        assert_eq!(foods[0].fields["sub_group"], "fruit");
        assert_eq!(foods[1].serving_weight, 150.0);
        assert_eq!(foods[1].leftovers_weight, 10.0);
    }

    #[test]
    fn test_submission_for_unknown_survey_rejected() {
        let db = Database::open_in_memory().unwrap();
        let result = db.insert_submission(
            "missing",
            &[CapturedMeal {
                name: "Lunch".to_string(),
                foods: vec![captured("APPL")],
            }],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_survey_foods_paging() {
        let db = Database::open_in_memory().unwrap();
        sample_survey(&db);
        db.insert_survey(&NewSurvey {
            id: "other".to_string(),
            name: "Other".to_string(),
            locale: "en_GB".to_string(),
        })
        .unwrap();
        let foods: Vec<CapturedFood> = (0..5).map(|i| captured(&format!("F{i}"))).collect();
        db.insert_submission(
            "demo",
            &[CapturedMeal {
                name: "Dinner".to_string(),
                foods,
            }],
        )
        .unwrap();
        db.insert_submission(
            "other",
            &[CapturedMeal {
                name: "Dinner".to_string(),
                foods: vec![captured("X")],
            }],
        )
        .unwrap();

        assert_eq!(db.count_survey_foods("demo").unwrap(), 5);
        assert_eq!(db.count_survey_foods("other").unwrap(), 1);

        let first = db.survey_foods_page("demo", 0, 3).unwrap();
        assert_eq!(first.len(), 3);
        let second = db
            .survey_foods_page("demo", first.last().unwrap().id, 3)
            .unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|f| f.id > first[2].id));
        let third = db
            .survey_foods_page("demo", second.last().unwrap().id, 3)
            .unwrap();
        assert!(third.is_empty());
    }

    #[test]
    fn test_write_food_updates() {
        let db = Database::open_in_memory().unwrap();
        sample_survey(&db);
        let submission = db
            .insert_submission(
                "demo",
                &[CapturedMeal {
                    name: "Lunch".to_string(),
                    foods: vec![captured("APPL")],
                }],
            )
            .unwrap();
        let id = submission.meals[0].foods[0].id;

        db.write_food_updates(&[FoodUpdate {
            id,
            nutrient_table_id: "NDNS".to_string(),
            nutrient_table_code: "202".to_string(),
            nutrients: BTreeMap::from([("1".to_string(), 0.1 + 0.2)]),
            fields: BTreeMap::new(),
        }])
        .unwrap();

        let food = db.get_submission_food(id).unwrap();
        assert_eq!(food.nutrient_table_code, "202");
        // Floats survive the JSON column exactly
        assert_eq!(food.nutrients["1"].to_bits(), (0.1_f64 + 0.2).to_bits());
        assert!(food.fields.is_empty());
    }

    #[test]
    fn test_write_food_updates_is_atomic() {
        let db = Database::open_in_memory().unwrap();
        sample_survey(&db);
        let submission = db
            .insert_submission(
                "demo",
                &[CapturedMeal {
                    name: "Lunch".to_string(),
                    foods: vec![captured("APPL")],
                }],
            )
            .unwrap();
        let id = submission.meals[0].foods[0].id;

        let update = |id| FoodUpdate {
            id,
            nutrient_table_id: "NDNS".to_string(),
            nutrient_table_code: "101".to_string(),
            nutrients: BTreeMap::new(),
            fields: BTreeMap::new(),
        };
        let result = db.write_food_updates(&[update(id), update(id + 1000)]);
        assert!(result.is_err());

        // First update rolled back with the failing one
        let food = db.get_submission_food(id).unwrap();
        assert_eq!(food.nutrients["1"], 72.8);
    }

    #[test]
    fn test_job_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let params = serde_json::json!({ "surveyId": "demo", "mode": "values-only" });
        let job = db
            .create_job(JobType::SurveyNutrientsRecalculation, &params)
            .unwrap();
        assert_eq!(job.job_type, "SurveyNutrientsRecalculation");
        assert_eq!(job.params, params);
        assert!(job.started_at.is_none());
        assert!(job.successful.is_none());

        db.start_job(&job.id).unwrap();
        db.set_job_progress(&job.id, 0.5).unwrap();
        let running = db.get_job(&job.id).unwrap();
        assert!(running.started_at.is_some());
        assert_eq!(running.progress, Some(0.5));

        db.complete_job(&job.id, true, "Total: 2, Updated: 1, Skipped: 1")
            .unwrap();
        let done = db.get_job(&job.id).unwrap();
        assert_eq!(done.successful, Some(true));
        assert_eq!(done.progress, Some(1.0));
        assert_eq!(
            done.message.as_deref(),
            Some("Total: 2, Updated: 1, Skipped: 1")
        );
        assert!(done.completed_at.is_some());

        assert_eq!(db.list_jobs(10).unwrap().len(), 1);
        assert!(db.get_job("missing").is_err());
        assert!(db.start_job("missing").is_err());
    }

    #[test]
    fn test_failed_job_keeps_progress() {
        let db = Database::open_in_memory().unwrap();
        let job = db
            .create_job(
                JobType::SurveyNutrientsRecalculation,
                &serde_json::json!({}),
            )
            .unwrap();
        db.start_job(&job.id).unwrap();
        db.set_job_progress(&job.id, 0.25).unwrap();
        db.complete_job(&job.id, false, "disk I/O error").unwrap();

        let failed = db.get_job(&job.id).unwrap();
        assert_eq!(failed.successful, Some(false));
        assert_eq!(failed.progress, Some(0.25));
    }
}
