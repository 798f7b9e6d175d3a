mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_food_add, cmd_food_delete, cmd_food_list, cmd_food_map, cmd_food_show, cmd_food_unmap,
    cmd_job_run, cmd_jobs_list, cmd_jobs_show, cmd_recalc, cmd_submit, cmd_survey_create,
    cmd_survey_list, cmd_survey_show, cmd_table_delete, cmd_table_import, cmd_table_set,
    cmd_table_show,
};
use crate::config::Config;
use intake_core::service::IntakeService;

#[derive(Parser)]
#[command(
    name = "intake",
    version,
    about = "Dietary recall survey admin and nutrient recalculation host"
)]
struct Cli {
    /// Database file (default: per-user data directory)
    #[arg(long, global = true, env = "INTAKE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage surveys
    Survey {
        #[command(subcommand)]
        command: SurveyCommands,
    },
    /// Manage foods and their nutrient table mappings
    Food {
        #[command(subcommand)]
        command: FoodCommands,
    },
    /// Manage nutrient table records
    Table {
        #[command(subcommand)]
        command: TableCommands,
    },
    /// Store a completed recall from a JSON file
    Submit {
        /// Survey ID
        survey: String,
        /// Submission JSON: {"meals": [{"name", "foods": [{"code", "servingWeight", ...}]}]}
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recalculate stored nutrient values for every submission in a survey
    Recalc {
        /// Survey ID
        survey: String,
        /// Recalculation mode: none, values-only, values-and-codes
        #[arg(long, default_value = "values-only")]
        mode: String,
        /// Make nutrient and field key sets match the reference record exactly
        #[arg(long)]
        sync_fields: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and run background jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
enum SurveyCommands {
    /// Create a survey
    Create {
        /// Survey ID (slug, no whitespace)
        id: String,
        /// Display name
        name: String,
        /// Default locale for foods in this survey
        #[arg(long, default_value = "en_GB")]
        locale: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List surveys
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one survey
    Show {
        /// Survey ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum FoodCommands {
    /// Add a food to the locale food database
    Add {
        /// Food code
        code: String,
        /// English name
        name: String,
        /// Food locale
        #[arg(long, default_value = "en_GB")]
        locale: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List foods
    List {
        /// Only foods in this locale
        #[arg(long)]
        locale: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one food and its mapping
    Show {
        /// Food code
        code: String,
        /// Food locale
        #[arg(long, default_value = "en_GB")]
        locale: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Point a food at a nutrient table record
    Map {
        /// Food code
        code: String,
        /// Nutrient table ID
        table: String,
        /// Record ID within the table
        record: String,
        /// Food locale
        #[arg(long, default_value = "en_GB")]
        locale: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a food's nutrient table mapping
    Unmap {
        /// Food code
        code: String,
        /// Food locale
        #[arg(long, default_value = "en_GB")]
        locale: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a food and its mapping
    Delete {
        /// Food code
        code: String,
        /// Food locale
        #[arg(long, default_value = "en_GB")]
        locale: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TableCommands {
    /// Import or update records from a CSV file
    Import {
        /// Nutrient table ID
        table: String,
        /// CSV with header `Record ID,Name,Local Name,N:<nutrient>...,F:<field>...`
        file: PathBuf,
        /// Preview without writing
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create or replace a single record
    Set {
        /// Nutrient table ID
        table: String,
        /// Record ID within the table
        record: String,
        /// English name
        name: String,
        /// Name in the table's own language
        #[arg(long)]
        local_name: Option<String>,
        /// Nutrient rate per 100 g as NUTRIENT_ID=VALUE (repeatable)
        #[arg(long = "nutrient", value_name = "ID=VALUE")]
        nutrients: Vec<String>,
        /// Descriptive field as NAME=VALUE (repeatable)
        #[arg(long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a record's nutrients and fields
    Show {
        /// Nutrient table ID
        table: String,
        /// Record ID within the table
        record: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a record
    Delete {
        /// Nutrient table ID
        table: String,
        /// Record ID within the table
        record: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List recent jobs, newest first
    List {
        /// Maximum number of jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one job
    Show {
        /// Job ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run (or re-run) a job
    Run {
        /// Job ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.db)?;
    debug!(db = %config.db_path.display(), "Opening database");
    let svc = IntakeService::new(&config.db_path)?;

    match cli.command {
        Commands::Survey { command } => match command {
            SurveyCommands::Create {
                id,
                name,
                locale,
                json,
            } => cmd_survey_create(&svc, &id, &name, &locale, json),
            SurveyCommands::List { json } => cmd_survey_list(&svc, json),
            SurveyCommands::Show { id, json } => cmd_survey_show(&svc, &id, json),
        },
        Commands::Food { command } => match command {
            FoodCommands::Add {
                code,
                name,
                locale,
                json,
            } => cmd_food_add(&svc, &code, &name, &locale, json),
            FoodCommands::List { locale, json } => cmd_food_list(&svc, locale.as_deref(), json),
            FoodCommands::Show { code, locale, json } => cmd_food_show(&svc, &code, &locale, json),
            FoodCommands::Map {
                code,
                table,
                record,
                locale,
                json,
            } => cmd_food_map(&svc, &code, &locale, &table, &record, json),
            FoodCommands::Unmap { code, locale, json } => {
                cmd_food_unmap(&svc, &code, &locale, json)
            }
            FoodCommands::Delete { code, locale, json } => {
                cmd_food_delete(&svc, &code, &locale, json)
            }
        },
        Commands::Table { command } => match command {
            TableCommands::Import {
                table,
                file,
                dry_run,
                json,
            } => cmd_table_import(&svc, &table, &file, dry_run, json),
            TableCommands::Set {
                table,
                record,
                name,
                local_name,
                nutrients,
                fields,
                json,
            } => cmd_table_set(
                &svc,
                &table,
                &record,
                &name,
                local_name.as_deref(),
                &nutrients,
                &fields,
                json,
            ),
            TableCommands::Show {
                table,
                record,
                json,
            } => cmd_table_show(&svc, &table, &record, json),
            TableCommands::Delete {
                table,
                record,
                json,
            } => cmd_table_delete(&svc, &table, &record, json),
        },
        Commands::Submit { survey, file, json } => cmd_submit(&svc, &survey, &file, json),
        Commands::Recalc {
            survey,
            mode,
            sync_fields,
            json,
        } => cmd_recalc(svc, &survey, &mode, sync_fields, json).await,
        Commands::Jobs { command } => match command {
            JobCommands::List { limit, json } => cmd_jobs_list(&svc, limit, json),
            JobCommands::Show { id, json } => cmd_jobs_show(&svc, &id, json),
            JobCommands::Run { id, json } => cmd_job_run(svc, &id, json).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_recalc_defaults() {
        let cli = Cli::try_parse_from(["intake", "recalc", "demo"]).unwrap();
        match cli.command {
            Commands::Recalc {
                survey,
                mode,
                sync_fields,
                json,
            } => {
                assert_eq!(survey, "demo");
                assert_eq!(mode, "values-only");
                assert!(!sync_fields);
                assert!(!json);
            }
            _ => panic!("expected recalc"),
        }
    }

    #[test]
    fn test_parse_recalc_flags_and_global_db() {
        let cli = Cli::try_parse_from([
            "intake",
            "recalc",
            "demo",
            "--mode",
            "values-and-codes",
            "--sync-fields",
            "--db",
            "/tmp/other.db",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/other.db")));
        assert!(matches!(
            cli.command,
            Commands::Recalc { ref mode, sync_fields: true, .. } if mode == "values-and-codes"
        ));
    }

    #[test]
    fn test_parse_food_map() {
        let cli = Cli::try_parse_from([
            "intake", "food", "map", "APPL", "NDNS", "101", "--locale", "pt_BR", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Food {
                command:
                    FoodCommands::Map {
                        code,
                        table,
                        record,
                        locale,
                        json,
                    },
            } => {
                assert_eq!(
                    (code.as_str(), table.as_str(), record.as_str()),
                    ("APPL", "NDNS", "101")
                );
                assert_eq!(locale, "pt_BR");
                assert!(json);
            }
            _ => panic!("expected food map"),
        }
    }

    #[test]
    fn test_parse_table_set_repeated_values() {
        let cli = Cli::try_parse_from([
            "intake",
            "table",
            "set",
            "NDNS",
            "101",
            "Apple",
            "--nutrient",
            "1=52",
            "--nutrient",
            "2=0.3",
            "--field",
            "brand=Orchard",
        ])
        .unwrap();
        match cli.command {
            Commands::Table {
                command:
                    TableCommands::Set {
                        table,
                        record,
                        name,
                        local_name,
                        nutrients,
                        fields,
                        json,
                    },
            } => {
                assert_eq!(
                    (table.as_str(), record.as_str(), name.as_str()),
                    ("NDNS", "101", "Apple")
                );
                assert_eq!(local_name, None);
                assert_eq!(nutrients, ["1=52", "2=0.3"]);
                assert_eq!(fields, ["brand=Orchard"]);
                assert!(!json);
            }
            _ => panic!("expected table set"),
        }
    }

    #[test]
    fn test_parse_show_commands() {
        let cli = Cli::try_parse_from(["intake", "survey", "show", "demo", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Survey { command: SurveyCommands::Show { ref id, json: true } } if id == "demo"
        ));

        let cli = Cli::try_parse_from(["intake", "food", "show", "APPL"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Food { command: FoodCommands::Show { ref code, ref locale, json: false } }
                if code == "APPL" && locale == "en_GB"
        ));
    }

    #[test]
    fn test_parse_rejects_missing_args() {
        assert!(Cli::try_parse_from(["intake", "table", "import", "NDNS"]).is_err());
        assert!(Cli::try_parse_from(["intake", "submit", "demo"]).is_err());
        assert!(Cli::try_parse_from(["intake", "table", "set", "NDNS", "101"]).is_err());
    }
}
