use std::path::Path;

use anyhow::{Context, Result};

use intake_core::models::NewSubmission;
use intake_core::nutrients::portion_weight;
use intake_core::service::IntakeService;

pub(crate) fn cmd_submit(svc: &IntakeService, survey_id: &str, path: &Path, json: bool) -> Result<()> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let recall: NewSubmission = serde_json::from_str(&data)
        .with_context(|| format!("Invalid submission JSON in {}", path.display()))?;

    let submission = svc.submit_recall(survey_id, &recall)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&submission)?);
        return Ok(());
    }

    println!("Stored submission {} for survey {}", submission.id, submission.survey_id);
    for meal in &submission.meals {
        println!("  {} ({} foods)", meal.name, meal.foods.len());
        for food in &meal.foods {
            let source = if food.nutrient_table_code.is_empty() {
                "no nutrient data".to_string()
            } else {
                format!(
                    "{}/{}, {} nutrients",
                    food.nutrient_table_id,
                    food.nutrient_table_code,
                    food.nutrients.len()
                )
            };
            println!(
                "    {} {} {:.1}g ({source})",
                food.code,
                food.english_name,
                portion_weight(food.serving_weight, food.leftovers_weight)
            );
        }
    }
    Ok(())
}
