//! Courier CLI - submit email jobs and inspect queues

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::sync::Arc;
use tabled::{Table, Tabled};

use courier_core::application::email::SEND_EMAIL_JOB;
use courier_core::application::{FlowComposer, QueueRegistry, EMAIL_QUEUE};
use courier_core::domain::{Backoff, FlowJob, FlowNode, Job, JobOptions, JobState};
use courier_core::port::{Broker, BrokerConfig};
use courier_infra_sqlite::SqliteBroker;

const DEFAULT_DB_PATH: &str = "~/.courier/queue.db";

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier email worker CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Queue database shared with the worker
    #[arg(long, env = "COURIER_DB_PATH", default_value = DEFAULT_DB_PATH)]
    db_path: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an email for the worker
    Send {
        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: String,

        /// Plain-text body
        #[arg(long)]
        text: String,

        /// Target queue
        #[arg(short, long, env = "COURIER_EMAIL_QUEUE", default_value = EMAIL_QUEUE)]
        queue: String,

        #[command(flatten)]
        options: JobArgs,
    },

    /// Enqueue an arbitrary job
    Enqueue {
        /// Queue name
        #[arg(short, long)]
        queue: String,

        /// Job name
        #[arg(short, long)]
        name: String,

        /// Payload as JSON string
        #[arg(long)]
        payload: String,

        #[command(flatten)]
        options: JobArgs,
    },

    /// Submit a parent/children flow described in a JSON file
    Flow {
        /// Path to the flow JSON
        file: String,
    },

    /// Show job counts per state
    Stats {
        #[arg(short, long, default_value = EMAIL_QUEUE)]
        queue: String,
    },

    /// Show one job
    Job {
        /// Job ID
        job_id: String,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Total attempts, including the first
    #[arg(long)]
    attempts: Option<u32>,

    /// Base backoff between attempts (milliseconds)
    #[arg(long)]
    backoff_ms: Option<u64>,

    /// Use a fixed instead of an exponential backoff
    #[arg(long, requires = "backoff_ms")]
    fixed_backoff: bool,

    /// Delay before the first attempt (milliseconds)
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Priority (higher = claimed first)
    #[arg(short, long)]
    priority: Option<i32>,
}

impl JobArgs {
    fn into_options(self) -> JobOptions {
        let backoff = self.backoff_ms.map(|ms| {
            if self.fixed_backoff {
                Backoff::fixed(ms)
            } else {
                Backoff::exponential(ms)
            }
        });

        JobOptions {
            attempts: self.attempts,
            backoff,
            delay_ms: self.delay_ms,
            priority: self.priority,
            ..JobOptions::default()
        }
    }
}

#[derive(Tabled)]
struct EnqueueRow {
    job_id: String,
    name: String,
    queue: String,
}

#[derive(Tabled)]
struct CountRow {
    state: String,
    count: i64,
}

#[derive(Tabled)]
struct FlowRow {
    job_id: String,
    name: String,
    queue: String,
    depth: usize,
}

fn flow_rows(flow: &FlowJob, depth: usize, rows: &mut Vec<FlowRow>) {
    rows.push(FlowRow {
        job_id: flow.id.clone(),
        name: flow.name.clone(),
        queue: flow.queue.clone(),
        depth,
    });
    for child in &flow.children {
        flow_rows(child, depth + 1, rows);
    }
}

fn colored_state(state: JobState) -> String {
    match state {
        JobState::Completed => state.as_str().green().to_string(),
        JobState::Failed => state.as_str().red().to_string(),
        JobState::Active => state.as_str().cyan().to_string(),
        _ => state.as_str().yellow().to_string(),
    }
}

fn print_job(job: &Job) {
    println!("  {} {}", "ID:".bold(), job.id);
    println!("  {} {}", "Name:".bold(), job.name);
    println!("  {} {}", "Queue:".bold(), job.queue);
    println!("  {} {}", "State:".bold(), colored_state(job.state));
    println!(
        "  {} {}/{}",
        "Attempts:".bold(),
        job.attempts_made,
        job.max_attempts()
    );
    if let Some(parent) = &job.parent_id {
        println!("  {} {}", "Parent:".bold(), parent);
    }
    if job.pending_children > 0 {
        println!("  {} {}", "Pending children:".bold(), job.pending_children);
    }
    if let Some(reason) = &job.failed_reason {
        println!("  {} {}", "Failed reason:".bold(), reason.red());
    }
    if let Some(value) = &job.return_value {
        println!("  {} {}", "Return value:".bold(), value);
    }
    println!("  {} {}", "Payload:".bold(), job.payload.as_value());
}

async fn connect(db_path: &str) -> Result<Arc<SqliteBroker>> {
    let db_path = shellexpand::tilde(db_path).into_owned();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
    }
    let broker = SqliteBroker::connect(&BrokerConfig::new(format!("sqlite://{}", db_path)))
        .await
        .with_context(|| format!("Failed to open queue database {}", db_path))?;
    Ok(Arc::new(broker))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let broker = connect(&cli.db_path).await?;
    let registry = QueueRegistry::new(broker.clone());

    match cli.command {
        Commands::Send {
            to,
            subject,
            text,
            queue,
            options,
        } => {
            let payload = json!({ "to": to, "subject": subject, "text": text });
            let job_id = registry
                .enqueue(&queue, SEND_EMAIL_JOB, payload, Some(options.into_options()))
                .await?;

            println!("{}", "✓ Email queued".green().bold());
            println!();
            let row = EnqueueRow {
                job_id,
                name: SEND_EMAIL_JOB.to_string(),
                queue,
            };
            println!("{}", Table::new(vec![row]));
        }

        Commands::Enqueue {
            queue,
            name,
            payload,
            options,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Invalid JSON payload")?;
            let job_id = registry
                .enqueue(&queue, name.clone(), payload, Some(options.into_options()))
                .await?;

            println!("{}", "✓ Job enqueued successfully".green().bold());
            println!();
            println!("{}", Table::new(vec![EnqueueRow { job_id, name, queue }]));
        }

        Commands::Flow { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Cannot read {}", file))?;
            let flow: FlowNode = serde_json::from_str(&raw).context("Invalid flow JSON")?;

            let composer = FlowComposer::new(broker.clone());
            let flow_job = composer.add(flow).await?;

            println!("{}", "✓ Flow submitted".green().bold());
            println!();
            let mut rows = Vec::new();
            flow_rows(&flow_job, 0, &mut rows);
            println!("{}", Table::new(rows));
        }

        Commands::Stats { queue } => {
            let counts = registry.get_or_create_queue(&queue)?.job_counts().await?;

            println!("{}", format!("Queue {}", queue).cyan().bold());
            println!();
            let rows: Vec<_> = JobState::ALL
                .iter()
                .map(|state| CountRow {
                    state: state.as_str().to_string(),
                    count: counts.get(*state),
                })
                .collect();
            println!("{}", Table::new(rows));
            println!("  {} {}", "Total:".bold(), counts.total());
        }

        Commands::Job { job_id } => match broker.get_job(&job_id).await? {
            Some(job) => {
                println!("{}", format!("Job {}", job.id).cyan().bold());
                println!();
                print_job(&job);

                if job.state == JobState::Waiting || job.state.is_finished() {
                    let values = broker.children_values(&job.id).await?;
                    if !values.is_empty() {
                        println!();
                        println!("  {}", "Children results:".bold());
                        for (child_id, value) in values {
                            println!("    {} {}", child_id, value);
                        }
                    }
                }
            }
            None => {
                println!("{}", format!("✗ Job {} not found", job_id).red());
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_send_arguments() {
        let cli = Cli::try_parse_from([
            "courier",
            "--db-path",
            "/tmp/q.db",
            "send",
            "--to",
            "a@b.com",
            "--subject",
            "Hello",
            "--text",
            "World",
            "--attempts",
            "3",
            "--backoff-ms",
            "1000",
        ])
        .unwrap();

        let Commands::Send { to, options, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(to, "a@b.com");

        let options = options.into_options();
        assert_eq!(options.max_attempts(), 3);
        assert_eq!(options.backoff, Some(Backoff::exponential(1000)));
    }

    #[test]
    fn test_fixed_backoff_requires_backoff_ms() {
        let result = Cli::try_parse_from([
            "courier", "enqueue", "-q", "q", "-n", "job", "--payload", "{}", "--fixed-backoff",
        ]);
        assert!(result.is_err());
    }
}
