use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "drover")]
#[command(version, about = "Durable task orchestrator driving LLM provider CLIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP gateway
    Gateway {
        /// Port to serve on (overrides QUEUE_API_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Start a phase-runner worker loop
    Worker {
        /// Provider adapter to drive
        #[arg(long, default_value = "claude")]
        provider: String,

        /// Forward provider stream records to the event log during execute
        #[arg(long)]
        stream_job_logs: bool,

        /// Process exactly one task, then exit
        #[arg(long)]
        once: bool,
    },
    /// Open the store and apply the schema
    #[command(name = "db:migrate")]
    DbMigrate,
    /// Print per-status counts and the most recent events
    Status,
    /// List tasks
    #[command(name = "tasks:list")]
    TasksList {
        #[arg(long)]
        status: Option<String>,
    },
    /// Create a task
    #[command(name = "tasks:create")]
    TasksCreate {
        #[arg(long)]
        prompt: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long = "type")]
        task_type: Option<String>,

        /// auto, lean, or full
        #[arg(long)]
        mode: Option<String>,

        /// 1 (highest) to 5
        #[arg(long)]
        priority: Option<i64>,

        /// Success criteria handed to the verify phase
        #[arg(long = "success")]
        success_criteria: Option<String>,
    },
    /// Show one task with its attempts
    #[command(name = "tasks:show")]
    TasksShow { id: String },
    /// Print recent events, oldest first
    #[command(name = "events:tail")]
    EventsTail {
        #[arg(long, default_value = "20")]
        limit: i64,

        #[arg(long)]
        task_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Gateway { port } => cmd::cmd_gateway(*port).await?,
        Commands::Worker {
            provider,
            stream_job_logs,
            once,
        } => cmd::cmd_worker(provider, *stream_job_logs, *once).await?,
        Commands::DbMigrate => cmd::cmd_migrate()?,
        Commands::Status => cmd::cmd_status()?,
        Commands::TasksList { status } => cmd::cmd_tasks_list(status.as_deref())?,
        Commands::TasksCreate {
            prompt,
            title,
            task_type,
            mode,
            priority,
            success_criteria,
        } => cmd::cmd_tasks_create(
            prompt,
            title.as_deref(),
            task_type.as_deref(),
            mode.as_deref(),
            *priority,
            success_criteria.as_deref(),
        )?,
        Commands::TasksShow { id } => cmd::cmd_tasks_show(id)?,
        Commands::EventsTail { limit, task_id } => {
            cmd::cmd_events_tail(*limit, task_id.as_deref())?
        }
    }
    Ok(())
}
