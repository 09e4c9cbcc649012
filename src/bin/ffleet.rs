//! Operator CLI for the control plane.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use ffleet::domain::{Classification, EngineKind, Job, Priority, QueueClass};
use ffleet::worker::client::MasterClient;

#[derive(Debug, Parser)]
#[command(name = "ffleet", version, about = "Transcoding control plane CLI")]
struct Cli {
    #[arg(long, env = "FFLEET_MASTER_URL", default_value = "http://127.0.0.1:7300", global = true)]
    master_url: String,

    #[arg(long, env = "FFLEET_API_KEY", global = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Jobs(JobsCommand),
    #[command(subcommand)]
    Nodes(NodesCommand),
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    /// Submit a transcoding job.
    Submit {
        #[arg(long)]
        scenario: String,
        #[arg(long, value_parser = parse_engine)]
        engine: Option<EngineKind>,
        #[arg(long, value_parser = parse_queue)]
        queue: Option<QueueClass>,
        #[arg(long, value_parser = parse_priority)]
        priority: Option<Priority>,
        #[arg(long, value_parser = parse_classification)]
        classification: Option<Classification>,
        /// Media duration in seconds.
        #[arg(long)]
        duration: Option<f64>,
        /// Target bitrate, e.g. 2M or 800k.
        #[arg(long)]
        bitrate: Option<String>,
        /// Output resolution, e.g. 1920x1080.
        #[arg(long)]
        resolution: Option<String>,
        /// Output codec (h264, h265, av1).
        #[arg(long)]
        codec: Option<String>,
    },
    /// List all jobs.
    List,
    /// Show one job; --follow polls until it is terminal.
    Status {
        selector: String,
        #[arg(long)]
        follow: bool,
    },
    /// Fetch the engine logs of a job.
    Logs { selector: String },
    Pause { selector: String },
    Resume { selector: String },
    Cancel { selector: String },
    Retry { selector: String },
}

#[derive(Debug, Subcommand)]
enum NodesCommand {
    /// List registered worker nodes.
    List,
    /// Show one node in full.
    Describe { node_id: String },
    /// Remove an idle node from the registry.
    Remove { node_id: String },
}

fn parse_engine(s: &str) -> Result<EngineKind, String> {
    EngineKind::parse(s).ok_or_else(|| format!("unknown engine: {s}"))
}

fn parse_queue(s: &str) -> Result<QueueClass, String> {
    QueueClass::parse(s).ok_or_else(|| format!("unknown queue: {s}"))
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    Priority::parse(s).ok_or_else(|| format!("unknown priority: {s}"))
}

fn parse_classification(s: &str) -> Result<Classification, String> {
    Classification::parse(s).ok_or_else(|| format!("unknown classification: {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = MasterClient::new(&cli.master_url, cli.api_key.clone())?;

    match cli.command {
        Command::Jobs(cmd) => jobs(&client, cmd).await,
        Command::Nodes(cmd) => nodes(&client, cmd).await,
    }
}

async fn jobs(client: &MasterClient, cmd: JobsCommand) -> anyhow::Result<()> {
    match cmd {
        JobsCommand::Submit {
            scenario,
            engine,
            queue,
            priority,
            classification,
            duration,
            bitrate,
            resolution,
            codec,
        } => {
            let mut req = ffleet::domain::JobRequest::for_scenario(scenario);
            if let Some(engine) = engine {
                req.engine = engine;
            }
            if let Some(queue) = queue {
                req.queue = queue;
            }
            if let Some(priority) = priority {
                req.priority = priority;
            }
            req.classification = classification;
            if let Some(duration) = duration {
                req.parameters.insert("duration".into(), json!(duration));
            }
            if let Some(bitrate) = bitrate {
                req.parameters.insert("bitrate".into(), json!(bitrate));
            }
            if let Some(resolution) = resolution {
                req.parameters.insert("resolution".into(), json!(resolution));
            }
            if let Some(codec) = codec {
                req.parameters.insert("codec".into(), json!(codec));
            }
            let job = client.submit_job(&req).await.context("submitting job")?;
            println!("submitted job #{} ({})", job.sequence_number, job.job_id);
            Ok(())
        }
        JobsCommand::List => {
            let jobs = client.list_jobs().await?;
            print_job_header();
            for job in &jobs.jobs {
                print_job_row(job);
            }
            println!("{} job(s)", jobs.count);
            Ok(())
        }
        JobsCommand::Status { selector, follow } => {
            loop {
                let job = client.get_job(&selector).await?;
                print_job_detail(&job);
                if !follow || job.status.is_terminal() {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
                println!();
            }
        }
        JobsCommand::Logs { selector } => {
            let logs = client.job_logs(&selector).await?;
            println!("{logs}");
            Ok(())
        }
        JobsCommand::Pause { selector } => action(client, &selector, "pause").await,
        JobsCommand::Resume { selector } => action(client, &selector, "resume").await,
        JobsCommand::Cancel { selector } => action(client, &selector, "cancel").await,
        JobsCommand::Retry { selector } => action(client, &selector, "retry").await,
    }
}

async fn action(client: &MasterClient, selector: &str, verb: &str) -> anyhow::Result<()> {
    let job = client
        .job_action(selector, verb)
        .await
        .with_context(|| format!("{verb} failed"))?;
    println!(
        "job #{} is now {}",
        job.sequence_number,
        job.status.as_str()
    );
    Ok(())
}

async fn nodes(client: &MasterClient, cmd: NodesCommand) -> anyhow::Result<()> {
    match cmd {
        NodesCommand::List => {
            let nodes = client.list_nodes().await?;
            println!(
                "{:<38} {:<20} {:<9} {:<8} {:>7}  {}",
                "NODE", "ADDRESS", "STATUS", "TYPE", "THREADS", "GPU"
            );
            for node in &nodes.nodes {
                println!(
                    "{:<38} {:<20} {:<9} {:<8} {:>7}  {}",
                    node.node_id,
                    node.address,
                    node.status.as_str(),
                    node.node_type.as_str(),
                    node.capabilities.cpu_threads,
                    node.capabilities
                        .gpu_type
                        .as_deref()
                        .unwrap_or(if node.capabilities.has_gpu { "yes" } else { "-" }),
                );
            }
            println!("{} node(s)", nodes.count);
            Ok(())
        }
        NodesCommand::Describe { node_id } => {
            let node = client.get_node(&node_id).await?;
            println!("{}", serde_json::to_string_pretty(&node)?);
            Ok(())
        }
        NodesCommand::Remove { node_id } => {
            client.remove_node(&node_id).await.context("remove failed")?;
            println!("node {node_id} removed");
            Ok(())
        }
    }
}

fn print_job_header() {
    println!(
        "{:>5} {:<24} {:<10} {:<8} {:<8} {:>9} {:>6}",
        "SEQ", "SCENARIO", "STATUS", "QUEUE", "PRIORITY", "PROGRESS", "RETRY"
    );
}

fn print_job_row(job: &Job) {
    println!(
        "{:>5} {:<24} {:<10} {:<8} {:<8} {:>8}% {:>6}",
        job.sequence_number,
        truncated(&job.scenario, 24),
        job.status.as_str(),
        job.queue.as_str(),
        job.priority.as_str(),
        job.progress,
        job.retry_count,
    );
}

fn print_job_detail(job: &Job) {
    println!("job #{} ({})", job.sequence_number, job.job_id);
    println!("  scenario:  {}", job.scenario);
    println!("  status:    {} ({}%)", job.status.as_str(), job.progress);
    println!(
        "  placement: queue={} priority={} engine={}",
        job.queue.as_str(),
        job.priority.as_str(),
        job.engine.as_str()
    );
    if !job.node_id.is_empty() {
        println!("  node:      {}", job.node_id);
    }
    println!("  retries:   {}/{}", job.retry_count, job.max_retries);
    if let Some(error) = &job.error {
        println!("  error:     {error}");
    }
    if let Some(reason) = job.failure_reason {
        println!("  failure:   {}", reason.as_str());
    }
    if let Some(compliant) = job.platform_sla_compliant {
        match &job.platform_sla_reason {
            Some(reason) => println!("  sla:       compliant={compliant} ({reason})"),
            None => println!("  sla:       compliant={compliant}"),
        }
    }
}

fn truncated(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
