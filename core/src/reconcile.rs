//! Reference resolution and per-record reconciliation for nutrient
//! recalculation.
//!
//! A [`RecalculationPolicy`] selects both how the authoritative composition
//! record is found for a historical food and how its stored nutrients and
//! fields are merged with that record. Every function here is pure; loading
//! the reference data and writing results back is done by [`crate::recalc`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::models::{CompositionRecord, FoodKey, FoodUpdate, RecordKey, SubmissionFood};
use crate::nutrients::{amounts_for_record, nutrient_amount};

/// Consistency mode requested for a recalculation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecalculationMode {
    /// Leave every record untouched.
    None,
    /// Refresh values from the record currently referenced by the food.
    ValuesOnly,
    /// Re-resolve the food's mapping, then refresh values and identifiers.
    ValuesAndCodes,
}

impl RecalculationMode {
    pub const ALL: [RecalculationMode; 3] = [
        RecalculationMode::None,
        RecalculationMode::ValuesOnly,
        RecalculationMode::ValuesAndCodes,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RecalculationMode::None => "none",
            RecalculationMode::ValuesOnly => "values-only",
            RecalculationMode::ValuesAndCodes => "values-and-codes",
        }
    }
}

impl fmt::Display for RecalculationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for a mode string that is not one of [`RecalculationMode::ALL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl FromStr for RecalculationMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecalculationMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

/// The `(mode, sync_fields)` matrix as one value.
///
/// With `sync_fields` off only keys already stored on the food are
/// refreshed; with it on the stored key sets are replaced by the record's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecalculationPolicy {
    Skip,
    ValuesOnly { sync_fields: bool },
    ValuesAndCodes { sync_fields: bool },
}

impl RecalculationPolicy {
    #[must_use]
    pub fn new(mode: RecalculationMode, sync_fields: bool) -> Self {
        match mode {
            RecalculationMode::None => RecalculationPolicy::Skip,
            RecalculationMode::ValuesOnly => RecalculationPolicy::ValuesOnly { sync_fields },
            RecalculationMode::ValuesAndCodes => {
                RecalculationPolicy::ValuesAndCodes { sync_fields }
            }
        }
    }

    #[must_use]
    pub fn mode(self) -> RecalculationMode {
        match self {
            RecalculationPolicy::Skip => RecalculationMode::None,
            RecalculationPolicy::ValuesOnly { .. } => RecalculationMode::ValuesOnly,
            RecalculationPolicy::ValuesAndCodes { .. } => RecalculationMode::ValuesAndCodes,
        }
    }
}

/// Reference data loaded for one page of foods.
///
/// The variant mirrors the resolution strategy: by the identifiers stored on
/// the food, or by the food's current mapping.
#[derive(Debug, Default)]
pub enum ReferenceLookup {
    #[default]
    Empty,
    ByRecord(HashMap<RecordKey, CompositionRecord>),
    ByMapping(HashMap<FoodKey, CompositionRecord>),
}

impl ReferenceLookup {
    /// The record that is authoritative for `food` now, or `None` if any link
    /// in the chain has gone away.
    #[must_use]
    pub fn resolve(&self, food: &SubmissionFood) -> Option<&CompositionRecord> {
        match self {
            ReferenceLookup::Empty => None,
            ReferenceLookup::ByRecord(records) => records.get(&food.record_key()),
            ReferenceLookup::ByMapping(records) => records.get(&food.food_key()),
        }
    }
}

/// Result of reconciling one food.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub update: FoodUpdate,
    pub changed: bool,
}

/// Compute the new state of `food` under `policy`, given the resolved
/// reference record (or its absence).
#[must_use]
pub fn reconcile(
    policy: RecalculationPolicy,
    food: &SubmissionFood,
    reference: Option<&CompositionRecord>,
) -> Reconciled {
    match policy {
        RecalculationPolicy::Skip => Reconciled {
            update: current_state(food),
            changed: false,
        },
        RecalculationPolicy::ValuesOnly { sync_fields } => {
            reconcile_values_only(food, reference, sync_fields)
        }
        RecalculationPolicy::ValuesAndCodes { sync_fields } => {
            reconcile_values_and_codes(food, reference, sync_fields)
        }
    }
}

fn reconcile_values_only(
    food: &SubmissionFood,
    reference: Option<&CompositionRecord>,
    sync_fields: bool,
) -> Reconciled {
    let update = match reference {
        None => cleared(food),
        Some(record) => {
            let (nutrients, fields) = refresh(food, record, sync_fields);
            FoodUpdate {
                id: food.id,
                nutrient_table_id: food.nutrient_table_id.clone(),
                nutrient_table_code: food.nutrient_table_code.clone(),
                nutrients,
                fields,
            }
        }
    };
    compare(food, update)
}

fn reconcile_values_and_codes(
    food: &SubmissionFood,
    reference: Option<&CompositionRecord>,
    sync_fields: bool,
) -> Reconciled {
    let update = match reference {
        None => cleared(food),
        Some(record) => {
            let (nutrients, fields) = refresh(food, record, sync_fields);
            FoodUpdate {
                id: food.id,
                nutrient_table_id: record.key.nutrient_table_id.clone(),
                nutrient_table_code: record.key.record_code.clone(),
                nutrients,
                fields,
            }
        }
    };
    compare(food, update)
}

fn current_state(food: &SubmissionFood) -> FoodUpdate {
    FoodUpdate {
        id: food.id,
        nutrient_table_id: food.nutrient_table_id.clone(),
        nutrient_table_code: food.nutrient_table_code.clone(),
        nutrients: food.nutrients.clone(),
        fields: food.fields.clone(),
    }
}

// Reference lost: nothing authoritative to replace the identifiers with,
// so they stay as stored.
fn cleared(food: &SubmissionFood) -> FoodUpdate {
    FoodUpdate {
        nutrients: BTreeMap::new(),
        fields: BTreeMap::new(),
        ..current_state(food)
    }
}

fn refresh(
    food: &SubmissionFood,
    record: &CompositionRecord,
    sync_fields: bool,
) -> (BTreeMap<String, f64>, BTreeMap<String, String>) {
    if sync_fields {
        return (
            amounts_for_record(record, food.serving_weight, food.leftovers_weight),
            record.fields.clone(),
        );
    }

    // Existing keys only: a nutrient missing from the record is zeroed and a
    // missing field is blanked, but neither key is dropped.
    let nutrients = food
        .nutrients
        .keys()
        .map(|id| {
            let amount = record.nutrients.get(id).map_or(0.0, |rate| {
                nutrient_amount(*rate, food.serving_weight, food.leftovers_weight)
            });
            (id.clone(), amount)
        })
        .collect();
    let fields = food
        .fields
        .keys()
        .map(|name| (name.clone(), record.fields.get(name).cloned().unwrap_or_default()))
        .collect();
    (nutrients, fields)
}

fn compare(food: &SubmissionFood, update: FoodUpdate) -> Reconciled {
    let changed = update.nutrients != food.nutrients
        || update.fields != food.fields
        || update.nutrient_table_id != food.nutrient_table_id
        || update.nutrient_table_code != food.nutrient_table_code;
    Reconciled { update, changed }
}
