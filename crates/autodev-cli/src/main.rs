mod config;
mod job_cmds;
mod serve_cmd;
mod task_cmds;
mod webhook;

use clap::{Parser, Subcommand};

use autodev_db::pool;

use config::ServiceConfig;

#[derive(Parser)]
#[command(
    name = "autodev",
    about = "Autonomous issue-to-PR engine: plans, codes, tests, reviews, and opens pull requests"
)]
struct Cli {
    /// Database URL (overrides the DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an autodev config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/autodev")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the autodev database (requires config file or env vars)
    DbInit,
    /// Run the webhook and API server
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Batch job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Show a task and its event log
    Show {
        /// Task ID
        task_id: String,
    },
    /// Drive a task one step forward
    Process {
        /// Task ID
        task_id: String,
    },
    /// Reject a task awaiting human review, with feedback
    Reject {
        /// Task ID
        task_id: String,
        /// Review feedback routed into the next coding pass
        feedback: String,
    },
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Create a job from issue numbers
    Create {
        /// Repository (owner/repo)
        repo: String,
        /// Comma-separated issue numbers (1-10)
        issues: String,
    },
    /// Run a pending job to completion
    Run {
        /// Job ID
        job_id: String,
        /// Maximum concurrent tasks
        #[arg(long, default_value_t = 2)]
        max_parallel: usize,
        /// Stop on the first failed task
        #[arg(long)]
        stop_on_error: bool,
    },
    /// Show a job and its tasks
    Show {
        /// Job ID (omit to list recent jobs)
        job_id: Option<String>,
    },
    /// Cancel a pending or running job
    Cancel {
        /// Job ID
        job_id: String,
    },
}

/// Execute the `autodev init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let secret = config::generate_webhook_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        webhook: config::WebhookSection {
            secret: Some(secret.clone()),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  webhook.secret = {}...{}", &secret[..8], &secret[56..]);
    println!();
    println!("Next: run `autodev db-init` to create and migrate the database,");
    println!("then point your GitHub webhook at POST /webhooks/github with that secret.");

    Ok(())
}

/// Execute the `autodev db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ServiceConfig::resolve(cli_db_url)?;

    println!("Initializing autodev database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("autodev db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = ServiceConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                serve_cmd::run_serve(db_pool.clone(), &bind, port, resolved.webhook_secret).await;
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = ServiceConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = task_cmds::run_task_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Job { command } => {
            let resolved = ServiceConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = job_cmds::run_job_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
