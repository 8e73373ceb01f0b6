//! # Main — CLI Entry Point
//!
//! Routes subcommands to the orchestrator server or to thin HTTP clients
//! for operators. Shared concerns handled here: `.env` loading, structured
//! logging (JSON when `LOG_FORMAT=json`), and configuration assembly.
//!
//! ## Subcommands
//!
//! - `serve` — run the orchestrator (API, heartbeats, sweeper, coordinator)
//! - `device list|evict` — inspect or evict fleet devices
//! - `job submit|list|show|cancel` — manage training jobs
//! - `model put|stat|fetch` — move model artifacts in and out of the store

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use edgeorchestra::config::OrchestratorConfig;

#[derive(Parser)]
#[command(name = "edgeorchestra", about = "Federated-learning orchestrator for edge fleets")]
struct Cli {
    /// Orchestrator URL for client subcommands (device/job/model)
    #[arg(long, env = "EDGEORCHESTRA_URL", default_value = "http://localhost:8080")]
    server: String,

    /// API key presented as x-api-key (and required by `serve` when set)
    #[arg(long, env = "EDGEORCHESTRA_API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator server
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// PostgreSQL connection URL
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        /// Redis URL for cross-replica liveness (optional)
        #[arg(long, env = "REDIS_URL")]
        redis_url: Option<String>,
        /// Directory for content-addressed model blobs
        #[arg(long, default_value = "./models")]
        blob_dir: PathBuf,
        /// Expected worker heartbeat interval in seconds
        #[arg(long, default_value_t = 5)]
        heartbeat_interval_s: u64,
        /// Missed heartbeats before a device is swept offline
        #[arg(long, default_value_t = 3)]
        miss_threshold: u32,
        /// Default round submission deadline in seconds
        #[arg(long, default_value_t = 300)]
        round_timeout_s: u64,
        /// Grace period past the deadline before a round is forced closed
        #[arg(long, default_value_t = 60)]
        round_grace_s: u64,
        /// Default minimum submissions to aggregate a round
        #[arg(long, default_value_t = 1)]
        quorum_min: usize,
        /// Battery level floor for round eligibility
        #[arg(long, default_value_t = 0.30)]
        battery_floor: f64,
        /// Thermal pressure ceiling for round eligibility
        #[arg(long, default_value_t = 0.70)]
        thermal_ceiling: f64,
        /// Model download chunk size in bytes
        #[arg(long, default_value_t = 1_048_576)]
        chunk_size_bytes: usize,
        /// Seconds an unreferenced model blob survives before GC
        #[arg(long, default_value_t = 86_400)]
        blob_retention_s: u64,
    },
    /// Inspect or evict fleet devices
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Manage training jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Move model artifacts in and out of the store
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum DeviceAction {
    /// List registered devices
    List {
        /// Filter by status (online, offline, training, error)
        #[arg(long)]
        status: Option<String>,
    },
    /// Send a shutdown command and unregister the device
    Evict {
        /// Device id
        id: String,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new training job
    Submit {
        /// Model architecture identifier (must match worker capabilities)
        #[arg(long)]
        architecture: String,
        /// Content id of the uploaded initial model
        #[arg(long)]
        model_id: String,
        /// Number of federated rounds to run
        #[arg(long)]
        rounds: u32,
        /// Minimum submissions per round
        #[arg(long)]
        quorum: Option<u32>,
        /// Per-round submission deadline in seconds
        #[arg(long)]
        round_timeout_s: Option<u64>,
    },
    /// List jobs
    List,
    /// Show a job and its rounds
    Show {
        /// Job id
        id: String,
    },
    /// Cancel a running job
    Cancel {
        /// Job id
        id: String,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Upload a model file, printing its content id
    Put {
        /// Path to the model file
        file: PathBuf,
    },
    /// Show size and pin count for a stored model
    Stat {
        /// Model content id
        id: String,
    },
    /// Download a model via the chunked stream and verify its digest
    Fetch {
        /// Model content id
        id: String,
        /// Output path
        #[arg(long)]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Structured logging: LOG_FORMAT=json for K8s, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let args = Cli::parse();
    match args.command {
        Commands::Serve {
            port,
            database_url,
            redis_url,
            blob_dir,
            heartbeat_interval_s,
            miss_threshold,
            round_timeout_s,
            round_grace_s,
            quorum_min,
            battery_floor,
            thermal_ceiling,
            chunk_size_bytes,
            blob_retention_s,
        } => {
            let config = OrchestratorConfig {
                heartbeat_interval_s,
                miss_threshold,
                round_timeout_s,
                round_grace_s,
                quorum_min,
                battery_floor,
                thermal_ceiling,
                chunk_size_bytes,
                blob_retention_s,
                blob_dir,
                api_key: args.api_key,
                ..Default::default()
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(edgeorchestra::server::run(
                port,
                &database_url,
                redis_url.as_deref(),
                config,
            ))
        }
        Commands::Device { action } => {
            let client = cli::Client::new(&args.server, args.api_key.as_deref());
            match action {
                DeviceAction::List { status } => cli::run_device_list(&client, status.as_deref()),
                DeviceAction::Evict { id } => cli::run_device_evict(&client, &id),
            }
        }
        Commands::Job { action } => {
            let client = cli::Client::new(&args.server, args.api_key.as_deref());
            match action {
                JobAction::Submit {
                    architecture,
                    model_id,
                    rounds,
                    quorum,
                    round_timeout_s,
                } => cli::run_job_submit(
                    &client,
                    &architecture,
                    &model_id,
                    rounds,
                    quorum,
                    round_timeout_s,
                ),
                JobAction::List => cli::run_job_list(&client),
                JobAction::Show { id } => cli::run_job_show(&client, &id),
                JobAction::Cancel { id } => cli::run_job_cancel(&client, &id),
            }
        }
        Commands::Model { action } => {
            let client = cli::Client::new(&args.server, args.api_key.as_deref());
            match action {
                ModelAction::Put { file } => cli::run_model_put(&client, &file),
                ModelAction::Stat { id } => cli::run_model_stat(&client, &id),
                ModelAction::Fetch { id, out } => cli::run_model_fetch(&client, &id, &out),
            }
        }
    }
}
