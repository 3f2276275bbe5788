//! voxbot - a real-time voice-agent orchestrator.
//!
//! Audio in over a realtime transport, VAD → streaming STT →
//! retrieval-grounded LLM → streaming TTS, audio back out, with barge-in.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxbot::agent::AgentStore;
use voxbot::config;
use voxbot::providers::ProviderRegistry;
use voxbot::server::{self, AppState};
use voxbot::session::{SessionManager, SessionNotice};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "voxbot", about = "voxbot - Voice Agent Orchestrator", version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator (control surface + media transport).
    Serve {
        /// Override the configured port.
        #[arg(short, long)]
        port: Option<u16>,
        /// Verbose logging.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Run one text turn against an agent and print the reply.
    Text {
        /// Agent id from the configuration.
        #[arg(short, long, default_value = "default")]
        agent: String,
        /// The user message.
        #[arg(short, long)]
        message: String,
    },
    /// Show configuration and agent summary.
    Status,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "voxbot=debug,info" } else { "voxbot=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_manager(cfg: &config::Config) -> Arc<SessionManager> {
    let registry = Arc::new(ProviderRegistry::builtin(reqwest::Client::new()));
    let agents = AgentStore::new(cfg.agents.clone());
    SessionManager::new(registry, agents, cfg.orchestrator.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, verbose } => {
            init_tracing(verbose);
            let mut cfg = config::load_config(None);
            if let Some(port) = port {
                cfg.server.port = port;
            }
            let state = AppState { manager: build_manager(&cfg) };
            server::serve(state, &cfg.server).await?;
        }
        Commands::Text { agent, message } => {
            init_tracing(false);
            let cfg = config::load_config(None);
            let manager = build_manager(&cfg);
            run_text_turn(&manager, &agent, &message).await?;
        }
        Commands::Status => {
            let cfg = config::load_config(None);
            println!("voxbot {}", VERSION);
            println!("config: {}", config::get_config_path().display());
            println!("server: {}:{}", cfg.server.host, cfg.server.port);
            println!("agents:");
            let mut ids: Vec<_> = cfg.agents.keys().collect();
            ids.sort();
            for id in ids {
                if let Some(agent) = cfg.agents.get(id) {
                    println!(
                        "  {} (stt={}, llm={}, tts={}, retrieval={})",
                        id,
                        agent.stt.adapter,
                        agent.llm.adapter,
                        agent.tts.adapter,
                        agent
                            .retrieval
                            .as_ref()
                            .map(|r| r.adapter.as_str())
                            .unwrap_or("-"),
                    );
                }
            }
        }
    }

    Ok(())
}

/// Create a session, feed one text turn, stream the reply to stdout, and
/// tear the session down.
async fn run_text_turn(
    manager: &Arc<SessionManager>,
    agent: &str,
    message: &str,
) -> anyhow::Result<()> {
    let handle = manager.create_session(agent).await?;
    let mut notices = handle.subscribe();
    manager.post_text(&handle.id, message.to_string()).await;

    loop {
        match notices.recv().await {
            Ok(SessionNotice::AssistantDelta { text }) => {
                print!("{}", text);
                use std::io::Write;
                std::io::stdout().flush().ok();
            }
            Ok(SessionNotice::TurnCompleted { .. }) => {
                println!();
                break;
            }
            Ok(SessionNotice::Fault { kind, detail }) => {
                if !matches!(
                    kind,
                    voxbot::errors::FaultKind::RetrievalFailed
                        | voxbot::errors::FaultKind::RetrievalTimeout
                ) {
                    eprintln!("error: {} ({})", kind, detail);
                    break;
                }
            }
            Ok(SessionNotice::Closed) | Err(_) => break,
            Ok(_) => {}
        }
    }

    manager.close_session(&handle.id).await;
    Ok(())
}
