use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;

mod cli;

use cli::Cli;
use cli::commands::{Commands, ProjectCommands, ProtocolCommands, StepCommands};
use protoflow::config::Config;
use protoflow::context::AppContext;
use protoflow::domain::{EventRecord, JobStatus, NewProject, NewProtocolRun, ProtocolRun, ProtocolStatus, StepRun, StepStatus};
use protoflow::reconcile::{CiSignal, CiTarget};
use protoflow::spec::parse_spec;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("protoflow")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("protoflow.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, ctx: &AppContext) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Project { command } => handle_project_command(command, ctx),
        Commands::Protocol { command } => handle_protocol_command(command, ctx).await,
        Commands::Step { command } => handle_step_command(command, ctx).await,
        Commands::Events { protocol } => handle_events_command(*protocol, ctx),
        Commands::Jobs { status } => handle_jobs_command(*status, ctx),
        Commands::Webhook {
            provider,
            branch,
            run_id,
            status,
            step,
        } => {
            let target = match (run_id, branch) {
                (Some(id), _) => CiTarget::RunId(*id),
                (None, Some(branch)) => CiTarget::Branch(branch.clone()),
                (None, None) => eyre::bail!("webhook needs --branch or --run-id"),
            };
            let mut signal = CiSignal::new(*provider, target, status.clone());
            signal.step_run_id = *step;
            let outcome = ctx.reconciler.reconcile(&signal).await?;
            println!("{} {}", "Reconciled:".green(), outcome);
            Ok(())
        }
        Commands::Worker { workers } => handle_worker_command(*workers, ctx).await,
    }
}

fn handle_project_command(command: &ProjectCommands, ctx: &AppContext) -> Result<()> {
    match command {
        ProjectCommands::Add {
            name,
            git_url,
            base_branch,
            engine,
            qa_policy,
        } => {
            let mut new = NewProject::new(name, git_url).with_base_branch(base_branch);
            if let Some(engine) = engine {
                new = new.with_engine(engine);
            }
            if let Some(policy) = qa_policy {
                new = new.with_qa_policy(*policy);
            }
            let project = ctx.orchestrator.create_project(new)?;
            println!("{} {} ({})", "Created project".green(), project.id, project.name.bold());
        }
        ProjectCommands::List => {
            let projects = ctx.store.list_projects()?;
            if projects.is_empty() {
                println!("{}", "No projects".dimmed());
            }
            for project in projects {
                println!(
                    "{:>4}  {}  {}  qa={}  engine={}",
                    project.id,
                    project.name.bold(),
                    project.git_url.dimmed(),
                    project.default_qa_policy,
                    project.default_engine_id.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

async fn handle_protocol_command(command: &ProtocolCommands, ctx: &AppContext) -> Result<()> {
    let orch = &ctx.orchestrator;
    match command {
        ProtocolCommands::Create {
            project,
            name,
            spec,
            root,
            description,
            base_branch,
        } => {
            let project = ctx.store.project(*project)?;
            let branch = base_branch.clone().unwrap_or_else(|| project.base_branch.clone());
            let mut new = NewProtocolRun::new(project.id, name, branch);
            if let Some(path) = spec {
                let text = fs::read_to_string(path).with_context(|| format!("Failed to read spec {}", path.display()))?;
                new = new.with_spec(parse_spec(&text)?);
            }
            if let Some(root) = root {
                new = new.with_protocol_root(root);
            }
            if let Some(description) = description {
                new = new.with_description(description);
            }
            let run = orch.create_protocol_run(new)?;
            println!("{} {} ({})", "Created protocol".green(), run.id, run.protocol_name.bold());
        }
        ProtocolCommands::List { project } => {
            let runs = ctx.store.list_protocol_runs(*project)?;
            if runs.is_empty() {
                println!("{}", "No protocol runs".dimmed());
            }
            for run in runs {
                print_protocol(&run);
            }
        }
        ProtocolCommands::Show { id } => {
            let run = ctx.store.protocol_run(*id)?;
            print_protocol(&run);
            if let Some(hash) = &run.spec_hash {
                println!("      spec {}", hash.dimmed());
            }
            for step in ctx.store.list_step_runs(run.id)? {
                print_step(&step);
            }
        }
        ProtocolCommands::Start { id, expect } => {
            let run = orch.start(*id, *expect).await?;
            println!("{} {}", "Started:".green(), protocol_line(&run));
        }
        ProtocolCommands::Next { id, expect } => match orch.run_next_step(*id, *expect).await? {
            Some(step) => println!("{} {}", "Running:".green(), step_line(&step)),
            None => println!("{}", "No steps left to run".yellow()),
        },
        ProtocolCommands::Pause { id, expect } => {
            let run = orch.pause(*id, *expect)?;
            println!("{} {}", "Paused:".yellow(), protocol_line(&run));
        }
        ProtocolCommands::Resume { id, expect } => {
            let run = orch.resume(*id, *expect).await?;
            println!("{} {}", "Resumed:".green(), protocol_line(&run));
        }
        ProtocolCommands::Cancel { id, expect } => {
            let run = orch.cancel(*id, *expect)?;
            println!("{} {}", "Cancelled:".red(), protocol_line(&run));
        }
        ProtocolCommands::Retry { id, expect } => {
            let step = orch.retry_latest(*id, *expect).await?;
            println!("{} {}", "Retrying:".green(), step_line(&step));
        }
    }
    Ok(())
}

async fn handle_step_command(command: &StepCommands, ctx: &AppContext) -> Result<()> {
    let orch = &ctx.orchestrator;
    let (label, step) = match command {
        StepCommands::Run { id, expect } => ("Running:", orch.run_step(*id, *expect).await?),
        StepCommands::Qa { id, expect } => ("QA:", orch.run_qa(*id, *expect).await?),
        StepCommands::Approve { id, expect } => ("Approved:", orch.approve(*id, *expect).await?),
    };
    println!("{} {}", label.green(), step_line(&step));
    Ok(())
}

fn handle_events_command(protocol: Option<i64>, ctx: &AppContext) -> Result<()> {
    for event in ctx.store.list_events(protocol)? {
        print_event(&event);
    }
    Ok(())
}

fn handle_jobs_command(status: Option<JobStatus>, ctx: &AppContext) -> Result<()> {
    let stats = ctx.queue().stats()?;
    println!(
        "{} queued={} started={} finished={} failed={}",
        ctx.queue().name().bold(),
        stats.queued,
        stats.started,
        stats.finished,
        stats.failed.to_string().red()
    );
    for job in ctx.queue().list_jobs(status)? {
        let error = job.last_error.as_deref().unwrap_or("");
        println!(
            "{}  {:<9} {:<24} attempt {}/{}  {}",
            job.id.dimmed(),
            job.status,
            job.idempotency_key,
            job.attempt,
            job.max_attempts,
            error.red()
        );
    }
    Ok(())
}

async fn handle_worker_command(workers: Option<usize>, ctx: &AppContext) -> Result<()> {
    let recovered = ctx.recover_interrupted()?;
    if recovered > 0 {
        println!("{} {} interrupted job(s)", "Requeued".yellow(), recovered);
    }
    let Some(pool) = ctx.start_workers(workers) else {
        println!(
            "{}",
            "Inline queue backend runs jobs immediately; set queue.backend: durable to use workers".yellow()
        );
        return Ok(());
    };
    println!("{} {} worker(s); ctrl-c to stop", "Started".green(), pool.worker_count());
    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    println!("{}", "Stopping workers...".cyan());
    pool.stop().await;
    Ok(())
}

fn colored_protocol_status(status: ProtocolStatus) -> ColoredString {
    match status {
        ProtocolStatus::Completed => status.as_str().green(),
        ProtocolStatus::Running | ProtocolStatus::Planning | ProtocolStatus::Planned => status.as_str().cyan(),
        ProtocolStatus::Paused | ProtocolStatus::Blocked => status.as_str().yellow(),
        ProtocolStatus::Failed | ProtocolStatus::Cancelled => status.as_str().red(),
        ProtocolStatus::Pending => status.as_str().normal(),
    }
}

fn colored_step_status(status: StepStatus) -> ColoredString {
    match status {
        StepStatus::Completed => status.as_str().green(),
        StepStatus::Running | StepStatus::NeedsQa => status.as_str().cyan(),
        StepStatus::Blocked => status.as_str().yellow(),
        StepStatus::Failed | StepStatus::Cancelled => status.as_str().red(),
        StepStatus::Pending => status.as_str().normal(),
    }
}

fn protocol_line(run: &ProtocolRun) -> String {
    format!("{} {} [{}]", run.id, run.protocol_name.bold(), colored_protocol_status(run.status))
}

fn step_line(step: &StepRun) -> String {
    format!("{} {} [{}]", step.id, step.step_name.bold(), colored_step_status(step.status))
}

fn print_protocol(run: &ProtocolRun) {
    println!(
        "{:>4}  {:<28} {:<10} project {}  base {}",
        run.id,
        run.protocol_name.bold(),
        colored_protocol_status(run.status),
        run.project_id,
        run.base_branch
    );
}

fn print_step(step: &StepRun) {
    println!(
        "      {:>2}. {:<28} {:<10} qa={} loops={} retries={}",
        step.step_index,
        step.step_name,
        colored_step_status(step.status),
        step.qa_policy,
        step.runtime_state.loop_count,
        step.retries
    );
    if let Some(error) = &step.runtime_state.last_error {
        println!("          {}", error.red());
    }
}

fn print_event(event: &EventRecord) {
    let when = chrono::DateTime::from_timestamp_millis(event.created_at)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    let scope = match (event.protocol_run_id, event.step_run_id) {
        (Some(p), Some(s)) => format!("{}/{}", p, s),
        (Some(p), None) => p.to_string(),
        _ => "-".to_string(),
    };
    println!(
        "{}  {:<7} {:<30} {}",
        when.dimmed(),
        scope,
        event.event_type.cyan(),
        event.message
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    let ctx = AppContext::open(config).context("Failed to open protoflow state")?;

    // Run the main application logic
    run_application(&cli, &ctx).await.context("Application failed")?;

    Ok(())
}
