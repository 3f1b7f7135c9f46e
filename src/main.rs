use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::info;

use complaintflow::config::ServerSettings;
use complaintflow::context::Duplex;
use complaintflow::envelope::{ClientEnvelope, ServerEnvelope};
use complaintflow::flow::FlowError;
use complaintflow::gateway::{AnthropicGateway, Gateway, GatewayConfig, OllamaGateway};
use complaintflow::logger::init_tracing;
use complaintflow::node::NodeError;
use complaintflow::nodes::complaint_flow;
use complaintflow::registry::TaskRegistry;
use complaintflow::server::{AppState, run_server};
use complaintflow::topics::StaticTopicStore;
use complaintflow::FlowContext;

#[derive(Parser, Debug)]
#[command(name = "complaintflow", about = "Citizen complaint intake service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP/WebSocket server
    Run(RunArgs),

    /// Interactive complaint conversation on the terminal
    Chat(ChatArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Anthropic,
    Ollama,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Listen address, e.g. 0.0.0.0:8000
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Directory for the rolling log file; console-only when unset
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::Anthropic)]
    backend: Backend,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, value_enum, default_value_t = Backend::Anthropic)]
    backend: Backend,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn build_gateway(backend: Backend) -> anyhow::Result<Arc<dyn Gateway>> {
    Ok(match backend {
        Backend::Anthropic => Arc::new(AnthropicGateway::new(GatewayConfig::from_env()?)?),
        Backend::Ollama => Arc::new(OllamaGateway::from_env()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run(RunArgs {
        addr: None,
        log_level: None,
        log_dir: None,
        backend: Backend::Anthropic,
    })) {
        Commands::Run(args) => {
            let mut settings = ServerSettings::from_env()?;
            if let Some(addr) = args.addr {
                settings.addr = addr;
            }
            if let Some(level) = args.log_level {
                settings.log_level = level;
            }
            if let Some(dir) = args.log_dir {
                settings.log_dir = Some(dir);
            }

            let _guard = init_tracing(&settings.log_level, settings.log_dir.as_deref())?;
            info!(backend = ?args.backend, "starting server");

            let gateway = build_gateway(args.backend)?;
            let state = AppState::new(gateway, StaticTopicStore::with_defaults())?;
            run_server(settings.addr, state).await
        }
        Commands::Chat(args) => {
            let _guard = init_tracing(&args.log_level, None)?;
            let gateway = build_gateway(args.backend)?;
            chat(gateway).await
        }
    }
}

/// [`Duplex`] over the terminal: one line in is one message, streamed
/// fragments print as they arrive.
struct StdioTransport {
    stdin: Mutex<BufReader<Stdin>>,
}

impl StdioTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { stdin: Mutex::new(BufReader::new(tokio::io::stdin())) })
    }
}

#[async_trait]
impl Duplex for StdioTransport {
    async fn recv(&self) -> Result<ClientEnvelope, NodeError> {
        print!("> ");
        std::io::stdout().flush().ok();

        let mut line = String::new();
        let read = {
            let mut stdin = self.stdin.lock().await;
            stdin
                .read_line(&mut line)
                .await
                .map_err(|e| NodeError::ConnectionFailed(e.to_string()))?
        };
        if read == 0 {
            return Err(NodeError::ConnectionFailed("stdin closed".into()));
        }

        let line = line.trim();
        if line == "/quit" {
            return Ok(ClientEnvelope::Interrupt);
        }
        Ok(ClientEnvelope::Message { content: line.to_string() })
    }

    async fn send(&self, envelope: ServerEnvelope) -> Result<(), NodeError> {
        let mut stdout = std::io::stdout();
        match envelope {
            ServerEnvelope::Connection { message } => println!("{message}"),
            ServerEnvelope::StreamChunk { content } => {
                print!("{content}");
                stdout.flush().ok();
            }
            ServerEnvelope::StreamComplete { .. } => println!(),
            ServerEnvelope::Metadata { complaint_topic, complaint_metadata } => {
                println!("\n[{complaint_topic}] {complaint_metadata}");
            }
            ServerEnvelope::Error { message } => eprintln!("error: {message}"),
            ServerEnvelope::MessageReceived { .. } | ServerEnvelope::Start { .. } => {}
        }
        Ok(())
    }
}

async fn chat(gateway: Arc<dyn Gateway>) -> anyhow::Result<()> {
    let flow = complaint_flow(gateway)?;
    let transport = StdioTransport::new();
    transport
        .send(ServerEnvelope::connection(
            "Describe your complaint. /quit to leave.",
        ))
        .await
        .ok();

    loop {
        let mut ctx =
            FlowContext::new(TaskRegistry::new_task_id()).with_transport(transport.clone());
        match flow.run(&mut ctx).await {
            Ok(()) => {
                if ctx.final_summary.is_none() {
                    // interrupted before a summary was produced
                    return Ok(());
                }
            }
            Err(FlowError::Node { source: NodeError::ConnectionFailed(_), .. }) => {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
    }
}
