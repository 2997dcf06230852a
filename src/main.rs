//! Entry point: configuration, collaborator wiring, interactive session.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use toolgate::agent::{Engine, EngineConfig};
use toolgate::checkpoint::ThreadStore;
use toolgate::config::Config;
use toolgate::display;
use toolgate::driver::EngineDriver;
use toolgate::llm::OpenAiClient;
use toolgate::registry::{RegistryClient, RegistryQuery, ToolGateway};
use toolgate::session::{SessionLoop, SessionOptions};

/// Terminal chat agent with gated tool execution.
#[derive(Debug, Parser)]
#[command(name = "toolgate", version, about)]
struct Args {
    /// Print turn statistics and extra diagnostics.
    #[arg(short, long)]
    verbose: bool,

    /// Extra config file, applied on top of the user and project files.
    #[arg(long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    if let Err(e) = run() {
        display::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let registry = Arc::new(RegistryClient::new(&config.registry)?);
    let tools = registry.fetch_tools(&RegistryQuery {
        toolkits: config.registry.toolkits.clone(),
        tools: config.registry.tools.clone(),
        limit: config.registry.limit,
        user_id: config.user_id.clone(),
    })?;

    let llm = OpenAiClient::new(&config.llm.base_url, config.llm.resolve_api_key()?)?;
    let store = Arc::new(ThreadStore::new());
    let engine = Arc::new(Engine::new(
        Box::new(llm),
        Arc::clone(&registry) as Arc<dyn ToolGateway>,
        tools.clone(),
        store,
        EngineConfig {
            model: config.model.clone(),
            user_id: config.user_id.clone(),
            system_prompt: config.system_prompt(),
            max_steps: config.llm.max_steps,
            confirm_tools: config.agent.confirm_tools.clone(),
        },
    ));
    let driver = EngineDriver::new(engine);

    display::banner(&config.model, tools.len());

    let options = SessionOptions {
        // One conversation per process; state is keyed by this id for the
        // process lifetime.
        thread_id: uuid::Uuid::new_v4().to_string(),
        history_path: dirs::home_dir().map(|home| home.join(".toolgate").join("history")),
        verbose: args.verbose,
    };
    SessionLoop::new(&driver, registry.as_ref(), options).run()?;

    display::farewell();
    Ok(())
}
