use anyhow::{Result, bail};

use intake_core::models::NewSurvey;
use intake_core::service::IntakeService;

use super::helpers::print_survey_table;

pub(crate) fn cmd_survey_create(
    svc: &IntakeService,
    id: &str,
    name: &str,
    locale: &str,
    json: bool,
) -> Result<()> {
    let survey = svc.create_survey(&NewSurvey {
        id: id.to_string(),
        name: name.to_string(),
        locale: locale.to_string(),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&survey)?);
    } else {
        println!("Created survey {} ({}, {})", survey.id, survey.name, survey.locale);
    }
    Ok(())
}

pub(crate) fn cmd_survey_list(svc: &IntakeService, json: bool) -> Result<()> {
    let surveys = svc.list_surveys()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&surveys)?);
    } else if surveys.is_empty() {
        eprintln!("No surveys yet. Create one with `intake survey create`.");
    } else {
        print_survey_table(&surveys);
    }
    Ok(())
}

pub(crate) fn cmd_survey_show(svc: &IntakeService, id: &str, json: bool) -> Result<()> {
    let Some(survey) = svc.get_survey(id)? else {
        bail!("Survey '{id}' not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&survey)?);
    } else {
        print_survey_table(std::slice::from_ref(&survey));
    }
    Ok(())
}
