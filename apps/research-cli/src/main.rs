use anyhow::Context;
use clap::{Parser, Subcommand};
use durable_research::providers::Provider;
use durable_research::providers::sqlite::SqliteProvider;
use durable_research::research::{self, ResearchActivities, ResearchConfig, ResearchReport, ResearchState};
use durable_research::{Client, ClientError, OrchestrationStatus, Runtime};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "research-cli", version, about = "Iterative arXiv research on a durable runtime")]
struct Cli {
    /// SQLite database holding instance history and queues
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start research on a topic and, unless --nowait, host a worker until it finishes
    Research {
        /// Topic to research
        topic: String,
        /// Maximum number of search iterations (1-10)
        #[arg(short, long, default_value_t = 3)]
        iterations: u32,
        /// Seconds to wait for the report
        #[arg(short, long, default_value_t = 300)]
        timeout: u64,
        /// Only schedule the instance; a separate `worker` runs it
        #[arg(long)]
        nowait: bool,
    },
    /// Show the status of a research instance
    Status {
        /// Instance id printed by `research`
        instance_id: String,
    },
    /// Cancel a research instance
    Cancel {
        /// Instance id printed by `research`
        instance_id: String,
    },
    /// List research instances and their status
    List {
        /// Include paper-research sub-orchestrations
        #[arg(long)]
        all: bool,
    },
    /// Host the research runtime until interrupted
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before tracing and clap so RUST_LOG and DATABASE_URL can come from .env
    dotenvy::dotenv().ok();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();

    let cli = Cli::parse();
    let mut config = ResearchConfig::from_env().context("loading configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let store: Arc<dyn Provider> = Arc::new(
        SqliteProvider::new(&config.database_url, None)
            .await
            .with_context(|| format!("opening {}", config.database_url))?,
    );
    let client = Client::new(Arc::clone(&store));

    match cli.command {
        Command::Research {
            topic,
            iterations,
            timeout,
            nowait,
        } => {
            let state = ResearchState::new(topic.clone(), iterations.clamp(1, 10));
            let instance_id = client
                .schedule_new_orchestration(research::ITERATIVE_RESEARCH.name(), serde_json::to_string(&state)?)
                .await?;
            println!("Researching: {topic}");
            println!("Instance ID: {instance_id}");

            if nowait {
                println!("Research scheduled; check progress with: research-cli status {instance_id}");
                return Ok(());
            }

            let rt = start_runtime(&config, Arc::clone(&store)).await?;
            let outcome = client
                .wait_for_orchestration(&instance_id, Duration::from_secs(timeout))
                .await;
            rt.shutdown().await;

            match outcome {
                Ok(status) => print_status(&status)?,
                Err(ClientError::Timeout { .. }) => {
                    println!("Timed out after {timeout}s; the instance keeps running under any worker");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Status { instance_id } => {
            let status = client.get_orchestration_status(&instance_id).await?;
            print_status(&status)?;
        }
        Command::Cancel { instance_id } => {
            client.cancel_instance(&instance_id, "canceled from cli").await?;
            println!("Cancellation requested for {instance_id}");
        }
        Command::List { all } => {
            let mut shown = 0;
            for instance_id in client.list_all_instances().await? {
                if !all && instance_id.contains("::sub::") {
                    continue;
                }
                let status = client.get_orchestration_status(&instance_id).await?;
                println!("{instance_id}\t{}", status_label(&status));
                shown += 1;
            }
            if shown == 0 {
                println!("No research instances");
            }
        }
        Command::Worker => {
            let rt = start_runtime(&config, store).await?;
            tracing::info!("Worker running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            rt.shutdown().await;
        }
    }
    Ok(())
}

async fn start_runtime(config: &ResearchConfig, store: Arc<dyn Provider>) -> anyhow::Result<Arc<Runtime>> {
    let activities = ResearchActivities::from_config(config)
        .context("building research collaborators")?
        .registry();
    Ok(Runtime::start_with_store(store, Arc::new(activities), research::orchestration_registry()).await)
}

fn status_label(status: &OrchestrationStatus) -> &'static str {
    match status {
        OrchestrationStatus::NotFound => "not found",
        OrchestrationStatus::Running => "running",
        OrchestrationStatus::Completed { .. } => "completed",
        OrchestrationStatus::Failed { .. } => "failed",
        OrchestrationStatus::Terminated { .. } => "terminated",
    }
}

fn print_status(status: &OrchestrationStatus) -> anyhow::Result<()> {
    match status {
        OrchestrationStatus::NotFound => println!("Instance not found"),
        OrchestrationStatus::Running => println!("Status: Running"),
        OrchestrationStatus::Completed { output } => {
            let report: ResearchReport = serde_json::from_str(output).context("decoding research report")?;
            println!("Status: Completed");
            println!("Topic: {}", report.topic);
            println!("Iterations: {}", report.iterations);
            println!("Findings: {}", report.findings_count);
            println!();
            println!("{}", report.report);
        }
        OrchestrationStatus::Failed { details } => println!("Status: Failed ({})", details.display_message()),
        OrchestrationStatus::Terminated { reason } => println!("Status: Terminated ({reason})"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_falls_back_to_dotenv_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "DATABASE_URL=sqlite:from-dotenv.db?mode=rwc\n").unwrap();
        dotenvy::from_path_override(&env_file).unwrap();

        let cli = Cli::try_parse_from(["research-cli", "status", "abc"]).unwrap();
        assert_eq!(cli.database_url.as_deref(), Some("sqlite:from-dotenv.db?mode=rwc"));

        let cli = Cli::try_parse_from(["research-cli", "--database-url", "sqlite::memory:", "worker"]).unwrap();
        assert_eq!(cli.database_url.as_deref(), Some("sqlite::memory:"));
    }

    #[test]
    fn list_hides_sub_orchestrations_unless_asked() {
        let cli = Cli::try_parse_from(["research-cli", "list"]).unwrap();
        assert!(matches!(cli.command, Command::List { all: false }));
        let cli = Cli::try_parse_from(["research-cli", "list", "--all"]).unwrap();
        assert!(matches!(cli.command, Command::List { all: true }));
        assert_eq!(status_label(&OrchestrationStatus::Running), "running");
    }
}
