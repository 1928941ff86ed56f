//! Compose Sequencer CLI
//!
//! Usage:
//!   compose_sequencer
//!   compose_sequencer -p demo up docker-compose.yml docker-compose.override.yml
//!   compose_sequencer up docker-compose.yml --default-timeout 120
//!   compose_sequencer up docker-compose.yml -a api:1.4.2 -a worker:1.4.2
//!   compose_sequencer up docker-compose.yml --dry-run
//!   compose_sequencer -p demo rm -f

use compose_sequencer::config::override_document;
use compose_sequencer::{
    remove_project, Command, ComposeProject, DependencyGraph, DockerCompose, Executor,
    ExecutorError, Interpolator, RemoveError, RmArgs, SequencerArgs, SequencerConfig, UpArgs,
};
use indexmap::IndexMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::watch;

/// Exit code for configuration errors
const CONFIG_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let args: SequencerArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    let code = match args.command() {
        Command::Up(up) => run_up(&args, &up).await,
        Command::Rm(rm) => run_rm(&args, &rm).await,
    };
    std::process::exit(code);
}

fn docker(args: &SequencerArgs, files: Vec<PathBuf>) -> DockerCompose {
    let runtime = DockerCompose::new(files).with_docker_binary(&args.docker);
    match &args.project_name {
        Some(name) => runtime.with_project_name(name),
        None => runtime,
    }
}

async fn run_up(args: &SequencerArgs, up: &UpArgs) -> i32 {
    // Load compose files
    let files = up.compose_files();
    log::info!(
        "Loading compose files: {}",
        files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let project = match ComposeProject::load(&files, &Interpolator::from_env()) {
        Ok(project) => project,
        Err(e) => {
            log::error!("Failed to load compose files: {}", e);
            return CONFIG_ERROR;
        }
    };

    // Validate only mode
    if up.validate {
        return match DependencyGraph::build(&project) {
            Ok(graph) => {
                println!("Compose project is valid");
                println!("  Files: {}", project.files.len());
                println!("  Services: {}", project.services.len());
                println!(
                    "  With readiness conditions: {}",
                    project.conditioned_services().count()
                );
                println!("  Start order: {}", graph.names().join(", "));
                0
            }
            Err(e) => {
                log::error!("Invalid compose project: {}", e);
                CONFIG_ERROR
            }
        };
    }

    // Image overrides go into an extra compose file merged last. It is
    // deleted when `override_file` drops at the end of the run.
    let overrides = project.image_overrides(&up.app_version);
    let override_file = match write_overrides(&overrides) {
        Ok(file) => file,
        Err(e) => {
            log::error!("Failed to write image overrides: {}", e);
            return CONFIG_ERROR;
        }
    };
    let mut runtime_files = project.files.clone();
    if let Some(file) = &override_file {
        runtime_files.push(file.path().to_path_buf());
    }

    let config = SequencerConfig {
        default_timeout: up.default_timeout,
        ..Default::default()
    };
    let mut executor = Executor::new(project, Arc::new(docker(args, runtime_files)), config);

    // Dry run mode
    if up.dry_run {
        return match executor.plan() {
            Ok(plan) => {
                println!("{}", plan);
                for (service, image) in &overrides {
                    println!("Image override: {} -> {}", service, image);
                }
                0
            }
            Err(e) => {
                log::error!("Failed to generate start plan: {}", e);
                e.exit_code()
            }
        };
    }

    let order = match executor.start_order() {
        Ok(order) => order,
        Err(e) => {
            log::error!("{}", e);
            return e.exit_code();
        }
    };
    println!("Services will be started in the following order: {:?}", order);
    log::info!(
        "{} of {} services have readiness conditions",
        executor.project().conditioned_services().count(),
        order.len()
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, aborting startup...");
        let _ = shutdown_tx.send(());
    }) {
        log::warn!("Failed to set Ctrl+C handler: {}", e);
    }

    if let Err(e) = executor.launch(shutdown_rx).await {
        report(&executor, &e);
        for (service, status) in executor.status() {
            log::debug!("[{}] {}", service, status);
        }
        return e.exit_code();
    }

    log::info!("Compose sequencer exiting");
    0
}

async fn run_rm(args: &SequencerArgs, rm: &RmArgs) -> i32 {
    let runtime = docker(args, Vec::new());

    let removed = remove_project(&runtime, rm.force, |container| {
        println!("Removing {}: done", container.name);
    })
    .await;

    match removed {
        Ok(containers) => {
            if containers.is_empty() {
                println!("No containers to remove");
            }
            0
        }
        Err(RemoveError::StillRunning(names)) => {
            println!(
                "The following containers are still running. Specify -f to force stop them. No action taken"
            );
            for name in &names {
                println!("  {}", name);
            }
            1
        }
        Err(e) => {
            log::error!("{}", e);
            e.exit_code()
        }
    }
}

/// Write the image override compose file, if there is anything to override
fn write_overrides(overrides: &IndexMap<String, String>) -> std::io::Result<Option<NamedTempFile>> {
    if overrides.is_empty() {
        return Ok(None);
    }
    for (service, image) in overrides {
        log::info!("[{}] Using image {}", service, image);
    }

    let document = override_document(overrides).map_err(std::io::Error::other)?;
    let mut file = tempfile::Builder::new()
        .prefix("compose_sequencer-")
        .suffix(".yml")
        .tempfile()?;
    file.write_all(document.as_bytes())?;
    file.flush()?;
    Ok(Some(file))
}

fn report(executor: &Executor, error: &ExecutorError) {
    match error {
        ExecutorError::NotReady { service, verdict } => {
            eprintln!("Service '{}' failed ({}): {}", service, verdict.outcome, verdict.message);
        }
        ExecutorError::Interrupted => eprintln!("Startup interrupted"),
        e => match e.service() {
            Some(service) => eprintln!("Service '{}' failed: {}", service, e),
            None => eprintln!("{}", e),
        },
    }
    if let Some(service) = error.service() {
        match executor.dependents_of(service) {
            Ok(held) if !held.is_empty() => {
                eprintln!("Not started, waiting on '{}': {}", service, held.join(", "))
            }
            _ => {}
        }
    }
    log::error!("Startup aborted: {}", error);
}
