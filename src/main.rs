use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use devdeck_lib::assistant::{AssistantSessionManager, ClaudeCliEngine};
use devdeck_lib::hub::{EventHub, DEFAULT_LOG_CAPACITY};
use devdeck_lib::procs::ProcessSupervisor;
use devdeck_lib::server::{self, ServerAppState};
use devdeck_lib::shutdown::{register_signal_handlers, ShutdownState};

/// Devdeck - local dashboard backend for dev servers and AI assistant runs
#[derive(Parser, Debug)]
#[command(name = "devdeck")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to bind the server to
    #[arg(long, env = "DEVDECK_PORT", default_value = "3420")]
    port: u16,

    /// Address to bind the server to
    #[arg(long, env = "DEVDECK_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Allowed CORS origin (repeatable); all origins are allowed if unset
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Log entries retained per process or session
    #[arg(long, env = "DEVDECK_LOG_CAPACITY", default_value_t = DEFAULT_LOG_CAPACITY)]
    log_capacity: usize,

    /// Seconds between SIGTERM and SIGKILL when stopping a process
    #[arg(long, env = "DEVDECK_STOP_GRACE_SECS", default_value = "3")]
    stop_grace_secs: u64,
}

fn main() {
    let cli = Cli::parse();

    env_logger::init();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    rt.block_on(async {
        let shutdown_state = ShutdownState::new();
        if let Err(e) = register_signal_handlers(shutdown_state.clone()) {
            log::warn!("Failed to register signal handlers: {}", e);
        }

        let hub = Arc::new(EventHub::new(cli.log_capacity));
        let supervisor = Arc::new(ProcessSupervisor::with_grace(
            hub.clone(),
            Duration::from_secs(cli.stop_grace_secs),
        ));

        let engine = match ClaudeCliEngine::resolve() {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                // The process control plane still works without an engine;
                // assistant executes will fail fast at spawn time instead
                log::warn!("{}; assistant sessions will be unavailable", e);
                Arc::new(ClaudeCliEngine::unresolved())
            }
        };
        let assistant = Arc::new(AssistantSessionManager::new(hub.clone(), engine));

        let cors_origins = if cli.cors_origins.is_empty() {
            None
        } else {
            Some(cli.cors_origins.clone())
        };

        let state = ServerAppState::new(
            hub,
            supervisor.clone(),
            assistant.clone(),
            shutdown_state.clone(),
        );

        if let Err(e) = server::run_server(cli.port, &cli.bind, state, cors_origins).await {
            eprintln!("Server error: {}", e);
            std::process::exit(1);
        }

        // Server loop ended; bring everything down before exiting
        log::info!("Stopping supervised processes and assistant sessions...");
        supervisor.stop_all().await;
        let terminated = assistant.terminate_all();
        if terminated > 0 {
            log::info!("Terminated {} assistant sessions", terminated);
        }
        shutdown_state.mark_cleanup_complete();
    });
}
