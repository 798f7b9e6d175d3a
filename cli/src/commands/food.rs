use anyhow::{Result, bail};

use intake_core::models::{NewFood, RecordKey};
use intake_core::service::IntakeService;

use super::helpers::print_food_table;

pub(crate) fn cmd_food_add(
    svc: &IntakeService,
    code: &str,
    name: &str,
    locale: &str,
    json: bool,
) -> Result<()> {
    let food = svc.add_food(&NewFood {
        code: code.to_string(),
        locale: locale.to_string(),
        name: name.to_string(),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&food)?);
    } else {
        println!("Added food {} ({}): {}", food.code, food.locale, food.name);
    }
    Ok(())
}

pub(crate) fn cmd_food_list(svc: &IntakeService, locale: Option<&str>, json: bool) -> Result<()> {
    let foods = svc.list_foods(locale)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&foods)?);
    } else if foods.is_empty() {
        eprintln!("No foods found.");
    } else {
        print_food_table(&foods);
    }
    Ok(())
}

pub(crate) fn cmd_food_show(svc: &IntakeService, code: &str, locale: &str, json: bool) -> Result<()> {
    let Some(food) = svc.get_food(code, locale)? else {
        bail!("Food {code} ({locale}) not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&food)?);
    } else {
        print_food_table(std::slice::from_ref(&food));
        if food.nutrient_record.is_none() {
            eprintln!("Not mapped. Use `intake food map` to link a nutrient table record.");
        }
    }
    Ok(())
}

pub(crate) fn cmd_food_map(
    svc: &IntakeService,
    code: &str,
    locale: &str,
    table_id: &str,
    record_code: &str,
    json: bool,
) -> Result<()> {
    let food = svc.map_food(code, locale, &RecordKey::new(table_id, record_code))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&food)?);
    } else {
        println!("Mapped {} ({}) to {table_id}/{record_code}", food.code, food.locale);
    }
    Ok(())
}

pub(crate) fn cmd_food_unmap(svc: &IntakeService, code: &str, locale: &str, json: bool) -> Result<()> {
    let removed = svc.unmap_food(code, locale)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "code": code, "locale": locale, "unmapped": removed })
        );
    } else if removed {
        println!("Removed nutrient mapping for {code} ({locale})");
    } else {
        eprintln!("{code} ({locale}) had no nutrient mapping.");
    }
    Ok(())
}

pub(crate) fn cmd_food_delete(svc: &IntakeService, code: &str, locale: &str, json: bool) -> Result<()> {
    if !svc.delete_food(code, locale)? {
        bail!("Food {code} ({locale}) not found");
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "code": code, "locale": locale, "deleted": true })
        );
    } else {
        println!("Deleted food {code} ({locale})");
    }
    Ok(())
}
