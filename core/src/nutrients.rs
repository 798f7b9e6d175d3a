use std::collections::BTreeMap;

use crate::models::CompositionRecord;

/// Net consumed weight in grams.
#[must_use]
pub fn portion_weight(serving_weight: f64, leftovers_weight: f64) -> f64 {
    serving_weight - leftovers_weight
}

/// Absolute nutrient amount for a portion, given the per-100g rate.
///
/// Shared by submission capture and recalculation: both must produce
/// bit-identical results for identical inputs, so the expression order
/// here must not change.
#[must_use]
pub fn nutrient_amount(units_per_100g: f64, serving_weight: f64, leftovers_weight: f64) -> f64 {
    units_per_100g * portion_weight(serving_weight, leftovers_weight) / 100.0
}

/// Amounts for every nutrient type defined on `record`.
#[must_use]
pub fn amounts_for_record(
    record: &CompositionRecord,
    serving_weight: f64,
    leftovers_weight: f64,
) -> BTreeMap<String, f64> {
    record
        .nutrients
        .iter()
        .map(|(id, rate)| {
            (
                id.clone(),
                nutrient_amount(*rate, serving_weight, leftovers_weight),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKey;

    #[test]
    fn test_amount_full_portion() {
        assert_eq!(nutrient_amount(75.0, 100.0, 0.0), 75.0);
    }

    #[test]
    fn test_amount_with_leftovers() {
        // 120 units/100g, 250g served, 50g left = 200g eaten
        assert!((nutrient_amount(120.0, 250.0, 50.0) - 240.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_amount_zero_rate() {
        assert_eq!(nutrient_amount(0.0, 300.0, 10.0), 0.0);
    }

    #[test]
    fn test_amount_is_reproducible() {
        let a = nutrient_amount(13.37, 187.3, 12.9);
        let b = nutrient_amount(13.37, 187.3, 12.9);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_amounts_for_record() {
        let record = CompositionRecord {
            key: RecordKey::new("NDNS", "101"),
            name: "Apple".to_string(),
            local_name: None,
            nutrients: BTreeMap::from([("1".to_string(), 52.0), ("2".to_string(), 0.3)]),
            fields: BTreeMap::new(),
        };
        let amounts = amounts_for_record(&record, 200.0, 0.0);
        assert_eq!(amounts.len(), 2);
        assert!((amounts["1"] - 104.0).abs() < f64::EPSILON);
        assert!((amounts["2"] - 0.6).abs() < 1e-12);
    }
}
