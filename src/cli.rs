//! Embeddable command-line surface.
//!
//! Workflow and activity bodies are host code, so the CLI ships as a function
//! the host binary calls with its configured engine:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register_workflow("onboard", onboard_body);
//!     registry.register_activity("send_email", send_email);
//!
//!     let pool = PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//!     let store = PostgresStore::new(pool);
//!     store.migrate().await?;
//!
//!     durable::cli::run(Engine::new(Arc::new(store), registry)).await
//! }
//! ```

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::engine::Engine;
use crate::persistence::store::ExecutionStore;
use crate::worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "durable")]
#[command(about = "Durable workflow engine control")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the worker loop (timeout sweeps, activities, workflow steps)
    Worker {
        /// Poll interval in seconds
        #[arg(long, default_value_t = 0.5)]
        tick: f64,

        /// Max tasks per tick stage
        #[arg(long, default_value_t = 10)]
        batch: usize,

        /// Number of loop iterations to run (for testing)
        #[arg(long)]
        iterations: Option<u64>,

        /// Max concurrently running activities
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Start a workflow; prints the execution id
    Start {
        /// Registered workflow name
        workflow: String,

        /// JSON object of workflow inputs
        #[arg(long, default_value = "{}")]
        input: String,

        /// Workflow timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Send a signal to an execution
    Signal {
        execution_id: Uuid,

        /// Signal name
        name: String,

        /// JSON signal payload
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Cancel an execution and its children
    Cancel {
        execution_id: Uuid,

        #[arg(long)]
        reason: Option<String>,

        /// Leave queued activity tasks in place
        #[arg(long)]
        keep_queued: bool,
    },

    /// Query an execution; prints the query result JSON
    Status {
        execution_id: Uuid,

        /// Query name (default: the built-in status query)
        #[arg(long, default_value = "status")]
        query: String,

        /// JSON query payload
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

fn parse_json(flag: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON for --{flag}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Parse process arguments and dispatch against the engine.
pub async fn run<S: ExecutionStore>(engine: Engine<S>) -> anyhow::Result<()> {
    run_with(engine, Cli::parse()).await
}

/// Dispatch an already-parsed command against the engine.
pub async fn run_with<S: ExecutionStore>(engine: Engine<S>, cli: Cli) -> anyhow::Result<()> {
    init_tracing();

    match cli.command {
        Command::Worker {
            tick,
            batch,
            iterations,
            concurrency,
        } => {
            let mut config = WorkerConfig::default()
                .with_tick(Duration::from_secs_f64(tick))
                .with_batch(batch)
                .with_concurrency(concurrency);
            config.iterations = iterations;

            let worker = Worker::new(engine, config);
            tokio::select! {
                result = worker.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal, draining");
                    worker.drain().await;
                }
            }
        }

        Command::Start {
            workflow,
            input,
            timeout,
        } => {
            let input = parse_json("input", &input)?;
            if !input.is_object() {
                bail!("workflow input must be a JSON object");
            }
            let id = engine
                .start_workflow(&workflow, input, timeout.map(Duration::from_secs_f64))
                .await?;
            println!("{id}");
        }

        Command::Signal {
            execution_id,
            name,
            input,
        } => {
            let payload = parse_json("input", &input)?;
            engine.signal_workflow(execution_id, &name, payload).await?;
        }

        Command::Cancel {
            execution_id,
            reason,
            keep_queued,
        } => {
            engine
                .cancel_workflow(execution_id, reason, !keep_queued)
                .await?;
        }

        Command::Status {
            execution_id,
            query,
            input,
        } => {
            let payload = parse_json("input", &input)?;
            let result = engine.query_workflow(execution_id, &query, payload).await?;
            println!("{}", serde_json::to_string(&result)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_flags() {
        let cli = Cli::parse_from([
            "durable",
            "worker",
            "--tick",
            "0.01",
            "--batch",
            "50",
            "--iterations",
            "10",
        ]);
        match cli.command {
            Command::Worker {
                tick,
                batch,
                iterations,
                concurrency,
            } => {
                assert_eq!(tick, 0.01);
                assert_eq!(batch, 50);
                assert_eq!(iterations, Some(10));
                assert_eq!(concurrency, 4);
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn parses_start_with_input() {
        let cli = Cli::parse_from([
            "durable",
            "start",
            "onboard",
            "--input",
            r#"{"user_id": 7}"#,
        ]);
        match cli.command {
            Command::Start {
                workflow, input, ..
            } => {
                assert_eq!(workflow, "onboard");
                assert_eq!(
                    parse_json("input", &input).unwrap(),
                    serde_json::json!({"user_id": 7})
                );
            }
            _ => panic!("expected start command"),
        }
    }

    #[test]
    fn rejects_bad_json() {
        assert!(parse_json("input", "{not json").is_err());
    }
}
