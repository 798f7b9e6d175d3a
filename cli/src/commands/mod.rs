mod food;
mod helpers;
mod jobs;
mod recalc;
mod submit;
mod survey;
mod table;

pub(crate) use food::{
    cmd_food_add, cmd_food_delete, cmd_food_list, cmd_food_map, cmd_food_show, cmd_food_unmap,
};
pub(crate) use jobs::{cmd_jobs_list, cmd_jobs_show};
pub(crate) use recalc::{cmd_job_run, cmd_recalc};
pub(crate) use submit::cmd_submit;
pub(crate) use survey::{cmd_survey_create, cmd_survey_list, cmd_survey_show};
pub(crate) use table::{cmd_table_delete, cmd_table_import, cmd_table_set, cmd_table_show};
