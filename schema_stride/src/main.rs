//! schema_stride command line

use anyhow::Context;
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Select};
use std::process::ExitCode;

use schema_stride::config::{self, DEFAULT_CONFIG_FILE};
use schema_stride::schema::RenameCandidate;
use schema_stride::utils::logging;
use schema_stride::{
    ApplyMode, Confirmer, DeclineAll, Error, GenerateOutcome, RenameDecision, Result, StrideClient,
};

#[derive(Parser, Debug)]
#[command(name = "schema_stride", version, about = "Rename-aware schema migrations for Rust models")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the next migration from model changes
    Generate {
        /// Write a data migration with a placeholder handler to register
        #[arg(long)]
        empty: bool,

        #[arg(short, long)]
        name: Option<String>,

        /// Exit with status 1 if a migration would be written, without writing it
        #[arg(long)]
        check: bool,

        /// Never prompt; renames and risky changes are declined
        #[arg(long)]
        no_input: bool,

        /// Migrations directory
        #[arg(long)]
        location: Option<String>,

        /// Paths scanned for models, replacing `models.paths`
        #[arg(long, num_args = 1..)]
        models: Vec<String>,
    },
    /// Apply or unapply migrations up to TARGET
    Apply {
        /// Migration name or unique prefix; `zero` unapplies everything
        target: Option<String>,

        /// Print the SQL instead of running it
        #[arg(long)]
        sql: bool,

        /// Record migrations as applied without running them
        #[arg(long)]
        fake: bool,

        #[arg(long)]
        location: Option<String>,
    },
}

/// Interactive prompts on the terminal
struct PromptConfirmer {
    theme: ColorfulTheme,
}

impl PromptConfirmer {
    fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

fn interrupted(e: dialoguer::Error) -> Error {
    Error::Cancelled(format!("prompt interrupted: {}", e))
}

impl Confirmer for PromptConfirmer {
    fn confirm_field_rename(
        &mut self,
        model: &str,
        old_field: &str,
        candidates: &[RenameCandidate],
    ) -> Result<RenameDecision> {
        let mut items: Vec<String> = candidates
            .iter()
            .map(|c| format!("{} (score {:.0})", c.name, c.score))
            .collect();
        items.push("Not a rename".to_string());

        let selection = Select::with_theme(&self.theme)
            .with_prompt(format!("Was {}.{} renamed?", model, old_field))
            .items(&items)
            .default(0)
            .interact_opt()
            .map_err(interrupted)?;

        match selection {
            None => Err(Error::Cancelled("rename prompt dismissed".to_string())),
            Some(i) if i == candidates.len() => Ok(RenameDecision::Skip),
            Some(0) => Ok(RenameDecision::Accept),
            Some(i) => Ok(RenameDecision::Pick(i)),
        }
    }

    fn confirm_risky_alters(&mut self, offenders: &[String]) -> Result<bool> {
        println!("These fields become NOT NULL without a default; existing NULLs will make the migration fail:");
        for offender in offenders {
            println!("  - {}", offender);
        }
        Confirm::with_theme(&self.theme)
            .with_prompt("Generate the migration anyway?")
            .default(false)
            .interact()
            .map_err(interrupted)
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config))?;

    if cli.verbose {
        let logging_config = config.logging.clone().unwrap_or_default();
        logging::init_with_level(&logging_config, tracing::Level::DEBUG)?;
    } else {
        logging::init_logging(&config.logging)?;
    }

    match cli.command {
        Command::Generate {
            empty,
            name,
            check,
            no_input,
            location,
            models,
        } => {
            if let Some(location) = location {
                config.migrations.directory = location;
            }
            if !models.is_empty() {
                config.models.paths = models;
            }

            let client = StrideClient::new(config);
            let mut options = client.generate_options();
            options.empty = empty;
            options.name = name;
            options.check = check;

            let mut prompt = PromptConfirmer::new();
            let mut decline = DeclineAll;
            let confirmer: &mut dyn Confirmer = if no_input { &mut decline } else { &mut prompt };
            match client.generate(&options, confirmer)? {
                GenerateOutcome::NoChanges => println!("No changes detected"),
                GenerateOutcome::Written { path, operations, .. } => {
                    println!("Created {} ({} operations)", path.display(), operations)
                }
                GenerateOutcome::Pending { name, operations } => {
                    println!("Would create {} ({} operations)", name, operations);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::Apply {
            target,
            sql,
            fake,
            location,
        } => {
            let mode = match (sql, fake) {
                (true, true) => {
                    return Err(Error::ConfigError("--sql and --fake cannot be combined".to_string()).into())
                }
                (true, false) => ApplyMode::SqlPreview,
                (false, true) => ApplyMode::Fake,
                (false, false) => ApplyMode::Apply,
            };
            if let Some(location) = location {
                config.migrations.directory = location;
            }

            let client = StrideClient::new(config);
            let report = client.apply(target.as_deref(), mode).await?;
            if mode == ApplyMode::SqlPreview {
                for line in &report.preview {
                    println!("{}", line);
                }
            } else if report.is_empty() {
                println!("No migrations to apply");
            } else {
                for name in &report.applied {
                    println!("Applied {}", name);
                }
                for name in &report.unapplied {
                    println!("Unapplied {}", name);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
