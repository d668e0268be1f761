//! # Command Line Interface
//!
//! Operator commands for database management and for inspecting and driving the
//! engine directly against the configured database.

use crate::config::{load_config, AppConfig};
use crate::domain::{ActorContext, ApprovalRequestId, FolderTarget, ProjectId, RequestStatus, SecretImportId, SecretPath};
use crate::observability::{init_logging, log_config_info};
use crate::services::{SecretEngine, SecretReadOptions};
use crate::storage::{
    create_pool, list_applied_migrations, migration_status, run_migrations, validate_migrations,
    AppliedMigration, ApprovalRequestFilter, MigrationState, MigrationStatus,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "vaultline")]
#[command(about = "Vaultline secret engine tooling")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Database URL override
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Database management commands
    Database {
        #[command(subcommand)]
        command: DatabaseCommands,
    },

    /// Read secrets as an actor sees them
    Secrets {
        #[command(subcommand)]
        command: SecretCommands,
    },

    /// Replicated import maintenance
    Imports {
        #[command(subcommand)]
        command: ImportCommands,
    },

    /// Approval request review
    Requests {
        #[command(subcommand)]
        command: RequestCommands,
    },
}

#[derive(Subcommand)]
pub enum DatabaseCommands {
    /// Run pending migrations
    Migrate {
        /// Only report whether migrations are pending
        #[arg(long)]
        dry_run: bool,
    },

    /// Show migration status
    Status,

    /// List all applied migrations
    List,

    /// Validate database schema
    Validate,
}

/// Project and actor a command runs as.
#[derive(Args, Clone)]
pub struct ActorArgs {
    /// Project id
    #[arg(long)]
    pub project: String,

    /// Acting user id
    #[arg(long, default_value = "cli")]
    pub actor: String,

    /// Organization id of the acting user
    #[arg(long, default_value = "cli")]
    pub org: String,
}

impl ActorArgs {
    fn project_id(&self) -> ProjectId {
        ProjectId::from_string(self.project.clone())
    }

    fn actor(&self) -> ActorContext {
        ActorContext::user(self.actor.clone(), self.org.clone()).with_auth_method("cli")
    }

    fn target(&self, environment: &str, path: &str) -> anyhow::Result<FolderTarget> {
        Ok(FolderTarget::new(self.project_id(), environment, SecretPath::parse(path)?))
    }
}

#[derive(Subcommand)]
pub enum SecretCommands {
    /// Show one secret
    Get {
        #[command(flatten)]
        who: ActorArgs,
        /// Environment slug
        #[arg(short, long)]
        environment: String,
        /// Folder path
        #[arg(short, long, default_value = "/")]
        path: String,
        /// Secret key
        key: String,
        /// Historic version to show
        #[arg(long)]
        version: Option<i64>,
        /// Expand references
        #[arg(long)]
        expand: bool,
        /// Mask values
        #[arg(long)]
        hide_values: bool,
    },

    /// List the effective secrets of a folder
    List {
        #[command(flatten)]
        who: ActorArgs,
        #[arg(short, long)]
        environment: String,
        #[arg(short, long, default_value = "/")]
        path: String,
        /// Include every descendant folder
        #[arg(short, long)]
        recursive: bool,
        #[arg(long)]
        expand: bool,
        #[arg(long)]
        hide_values: bool,
    },

    /// Show the reference tree of one secret
    Tree {
        #[command(flatten)]
        who: ActorArgs,
        #[arg(short, long)]
        environment: String,
        #[arg(short, long, default_value = "/")]
        path: String,
        key: String,
        #[arg(long)]
        hide_values: bool,
    },
}

#[derive(Subcommand)]
pub enum ImportCommands {
    /// Copy source secrets into replicated imports
    Resync {
        /// Project id
        #[arg(long)]
        project: String,
        /// Replicated import to resync
        #[arg(conflicts_with = "all", required_unless_present = "all")]
        import_id: Option<String>,
        /// Resync every replicated import of the project
        #[arg(long)]
        all: bool,
        /// Keep running, resyncing every N seconds (defaults to the configured interval)
        #[arg(long, requires = "all")]
        watch: bool,
        #[arg(long, requires = "watch")]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum RequestCommands {
    /// List approval requests
    List {
        #[command(flatten)]
        who: ActorArgs,
        /// Environment slug
        #[arg(short, long)]
        environment: Option<String>,
        /// open, approved, rejected or applied
        #[arg(short, long)]
        status: Option<RequestStatus>,
    },

    /// Approve a request; it is applied once the threshold is reached
    Approve {
        #[command(flatten)]
        who: ActorArgs,
        request_id: String,
    },

    /// Reject a request
    Reject {
        #[command(flatten)]
        who: ActorArgs,
        request_id: String,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if cli.verbose {
        config.observability.log_level = "debug".to_string();
    }
    if init_logging(&config.observability).is_err() {
        // Subscriber already set elsewhere (e.g. integration tests); ignore.
    }
    log_config_info(&config);

    match cli.command {
        Commands::Database { command } => handle_database_command(command, &config).await,
        Commands::Secrets { command } => {
            let engine = SecretEngine::from_config(&config).await?;
            handle_secret_command(command, &engine).await
        }
        Commands::Imports { command } => {
            let engine = SecretEngine::from_config(&config).await?;
            handle_import_command(command, &engine, &config).await
        }
        Commands::Requests { command } => {
            let engine = SecretEngine::from_config(&config).await?;
            handle_request_command(command, &engine).await
        }
    }
}

/// Handle database management commands
async fn handle_database_command(command: DatabaseCommands, config: &AppConfig) -> anyhow::Result<()> {
    let mut database = config.database.clone();
    database.auto_migrate = false;
    let pool = create_pool(&database).await?;

    match command {
        DatabaseCommands::Migrate { dry_run } => {
            if dry_run {
                let pending: Vec<_> = migration_status(&pool)
                    .await?
                    .into_iter()
                    .filter(|s| s.state == MigrationState::Pending)
                    .collect();
                if pending.is_empty() {
                    println!("No pending migrations");
                } else {
                    println!("Would apply:");
                    for status in pending {
                        println!("  {} {}", status.version, status.name);
                    }
                }
            } else {
                println!("Running database migrations...");
                let ran = run_migrations(&pool).await?;
                println!("{}", format!("Applied {} migration(s)", ran).green());
            }
        }

        DatabaseCommands::Status => {
            let statuses = migration_status(&pool).await?;
            print_status_table(&statuses);
            if statuses.iter().any(|s| s.state != MigrationState::Applied) {
                std::process::exit(1);
            }
        }

        DatabaseCommands::List => {
            let migrations = list_applied_migrations(&pool).await?;
            if migrations.is_empty() {
                println!("No migrations have been applied");
            } else {
                println!("Applied migrations:");
                print_migrations_table(&migrations);
            }
        }

        DatabaseCommands::Validate => {
            println!("Validating database schema...");
            if validate_migrations(&pool).await? {
                println!("{}", "Database schema validation passed".green());
            } else {
                println!("{}", "Database schema validation failed".red());
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn handle_secret_command(command: SecretCommands, engine: &SecretEngine) -> anyhow::Result<()> {
    match command {
        SecretCommands::Get { who, environment, path, key, version, expand, hide_values } => {
            let options = SecretReadOptions {
                recursive: false,
                expand_references: expand,
                view_secret_value: !hide_values,
            };
            let view = engine
                .get_secret_by_key(&who.actor(), &who.target(&environment, &path)?, &key, version, options)
                .await?;
            print_json(&view)
        }

        SecretCommands::List { who, environment, path, recursive, expand, hide_values } => {
            let options =
                SecretReadOptions { recursive, expand_references: expand, view_secret_value: !hide_values };
            let views =
                engine.get_effective_secrets(&who.actor(), &who.target(&environment, &path)?, options).await?;
            print_json(&views)
        }

        SecretCommands::Tree { who, environment, path, key, hide_values } => {
            let tree = engine
                .get_reference_tree(&who.actor(), &who.target(&environment, &path)?, &key, !hide_values)
                .await?;
            print_json(&tree)
        }
    }
}

async fn handle_import_command(
    command: ImportCommands,
    engine: &SecretEngine,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let ImportCommands::Resync { project, import_id, all, watch, interval } = command;
    let project_id = ProjectId::from_string(project);

    if !all {
        let import_id = import_id.context("An import id or --all is required")?;
        let summary =
            engine.resync_replicated_import(&project_id, &SecretImportId::from_string(import_id)).await?;
        return print_json(&summary);
    }

    if !watch {
        return resync_all_once(engine, &project_id).await;
    }

    let period = interval
        .map(Duration::from_secs)
        .or_else(|| config.replication.auto_resync_interval())
        .context("--watch needs --interval or replication.auto_resync_interval_seconds")?;
    info!(project_id = %project_id, interval_seconds = period.as_secs(), "Starting replicated import resync loop");

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = resync_all_once(engine, &project_id).await {
                    error!(error = %e, "Replicated import resync pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping replicated import resync loop");
                return Ok(());
            }
        }
    }
}

async fn resync_all_once(engine: &SecretEngine, project_id: &ProjectId) -> anyhow::Result<()> {
    let results = engine.resync_all_replications(project_id).await?;
    let mut failures = 0;
    for result in results {
        match result {
            Ok(summary) => println!(
                "{} import {} created={} updated={} deleted={}",
                "ok".green(),
                summary.import_id.map(|id| id.to_string()).unwrap_or_default(),
                summary.created,
                summary.updated,
                summary.deleted
            ),
            Err(e) => {
                failures += 1;
                println!("{} {}", "failed".red(), e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} replicated import(s) failed to resync", failures);
    }
    Ok(())
}

async fn handle_request_command(command: RequestCommands, engine: &SecretEngine) -> anyhow::Result<()> {
    match command {
        RequestCommands::List { who, environment, status } => {
            let project_id = who.project_id();
            let environment_id = match environment {
                Some(slug) => Some(engine.get_environment(&project_id, &slug).await?.id),
                None => None,
            };
            let filter = ApprovalRequestFilter { environment_id, status, ..Default::default() };
            let requests = engine.list_requests(&project_id, &filter).await?;
            print_json(&requests)
        }

        RequestCommands::Approve { who, request_id } => {
            let request = engine
                .approve_request(&who.actor(), &who.project_id(), &ApprovalRequestId::from_string(request_id))
                .await?;
            println!("Request {} is {}", request.id, request.status);
            Ok(())
        }

        RequestCommands::Reject { who, request_id } => {
            let request = engine
                .reject_request(&who.actor(), &who.project_id(), &ApprovalRequestId::from_string(request_id))
                .await?;
            println!("Request {} is {}", request.id, request.status);
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(data: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{}", json);
    Ok(())
}

/// Print migrations in a formatted table
fn print_migrations_table(migrations: &[AppliedMigration]) {
    println!();
    println!("{:<15} {:<50} {:<25} {:<10}", "Version", "Name", "Applied On", "Time (ms)");
    println!("{}", "-".repeat(100));

    for migration in migrations {
        println!(
            "{:<15} {:<50} {:<25} {:<10}",
            migration.version,
            truncate_string(&migration.name, 48),
            migration.installed_on.format("%Y-%m-%d %H:%M:%S"),
            migration.execution_time_ms
        );
    }
}

fn print_status_table(statuses: &[MigrationStatus]) {
    println!("{:<15} {:<50} {:<10}", "Version", "Name", "State");
    println!("{}", "-".repeat(75));

    for status in statuses {
        let state = match status.state {
            MigrationState::Applied => "applied".green().to_string(),
            MigrationState::Pending => "pending".yellow().to_string(),
            MigrationState::Modified => "modified".red().to_string(),
            MigrationState::Unknown => "unknown".red().to_string(),
        };
        println!("{:<15} {:<50} {}", status.version, truncate_string(&status.name, 48), state);
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
