use clap::{Parser, Subcommand};
use procflow::actions::builtin::{AssignHandler, LogHandler};
use procflow::actions::http::HttpHandler;
use procflow::graph::loader::load_process_from_yaml;
use procflow::runtime::engine::ProcessEngine;
use procflow::runtime::redis_storage::RedisVariableStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an instance of a process definition file and run it until
    /// every token waits or the instance completes
    Run {
        /// Path to the process YAML file
        file: PathBuf,

        /// Initial process variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Redis URL for the variable-store projection
        #[arg(long)]
        redis: Option<String>,
    },

    /// Compile a process definition file and report problems
    Validate {
        /// Path to the process YAML file
        file: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("invalid key=value: '{}'", s))?;
    let value = serde_json::from_str(value).unwrap_or(serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let process = load_process_from_yaml(&file.to_string_lossy())?;
            let graph = procflow::graph::Compiler::new().compile(process, 1)?;
            info!(process = %graph.id, activities = graph.activities().count(), "definition is valid");
        }
        Commands::Run { file, vars, redis } => {
            info!("Loading process from: {:?}", file);
            let process = load_process_from_yaml(&file.to_string_lossy())?;

            let mut engine = ProcessEngine::new();
            if let Some(url) = redis {
                let client = redis::Client::open(url)?;
                engine = engine.with_variable_store(Arc::new(RedisVariableStore::new(client)));
            }
            engine.register_handler(Arc::new(LogHandler));
            engine.register_handler(Arc::new(AssignHandler));
            engine.register_handler(Arc::new(HttpHandler::new()));

            let definition_id = process.id.clone();
            engine.register_process(process)?;

            let initial: HashMap<_, _> = vars.into_iter().collect();
            let instance = engine.start_process(&definition_id, initial).await?;

            if engine.instance_exists(instance) {
                let tasks = engine.tasks(instance).await?;
                info!(instance = %instance, "instance is waiting");
                for task in tasks {
                    info!(activity = %task.activity_id, execution = %task.execution_id, "waiting task");
                }
            } else {
                info!(instance = %instance, "instance completed");
            }
        }
    }

    Ok(())
}
