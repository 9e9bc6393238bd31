//! Thin CLI wrapper over the orchestration engine (§6). Parses a positional
//! kickoff prompt plus a generic `--flag`/`--flag=value` bag, wires up the
//! chat driver, memory, guard, tool executor, and scheduler, then runs the
//! scheduler to completion or until interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use conclave_core::{
    Agent, DriverConfig, DriverSummarizer, GuardConfig, GuardRail, Inbox, Memory, MemoryConfig,
    NullUserBridge, PersonaMode, ProcessSandbox, RunId, SafeConfirmingSandbox, SandboxFileWriter,
    Scheduler, SchedulerConfig, ToolExecutor, UserBridge,
};
use conclave_llm::{Property, Schema, ToolDefinition};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `EX_NOUSER` from sysexits.h, repurposed here: no kickoff prompt entrypoint.
const EXIT_ENTRYPOINT_MISSING: i32 = 66;
const EXIT_USER_QUIT: i32 = 130;

/// Parsed CLI input: the positional kickoff prompt plus a generic flag bag
/// (§6: `--<flag>` and `--<flag>=<value>` parsed as booleans/strings).
struct Args {
    prompt: Option<String>,
    flags: HashMap<String, String>,
}

impl Args {
    fn parse(argv: impl Iterator<Item = String>) -> Self {
        let mut prompt = None;
        let mut flags = HashMap::new();

        for arg in argv {
            if let Some(rest) = arg.strip_prefix("--") {
                match rest.split_once('=') {
                    Some((key, value)) => {
                        flags.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        flags.insert(rest.to_string(), "true".to_string());
                    }
                }
            } else if prompt.is_none() {
                prompt = Some(arg);
            }
        }

        Self { prompt, flags }
    }

    fn flag_bool(&self, key: &str) -> bool {
        self.flags
            .get(key)
            .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
            .unwrap_or(false)
    }

    fn flag_str(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }
}

/// stdin-backed user bridge: reads interjection lines, prints prompts/asks
/// to stderr.
struct StdinUserBridge;

#[async_trait::async_trait]
impl UserBridge for StdinUserBridge {
    async fn read_line(&self) -> Option<String> {
        let mut reader = BufReader::new(tokio::io::stdin());
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end().to_string()),
            Err(_) => None,
        }
    }

    async fn ask(&self, prompt: &str) {
        eprintln!("{prompt}");
    }
}

fn init_logging(args: &Args, session_dir: &PathBuf) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let debug = args.flag_bool("debug")
        || std::env::var("DEBUG").is_ok_and(|v| v == "1")
        || std::env::var("ORG_DEBUG").is_ok_and(|v| v == "1");
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = session_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "conclave.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        None
    }
}

fn sh_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "sh".to_string(),
        description: "Run a shell command and capture stdout/stderr/exit code.".to_string(),
        parameters: Schema::Object {
            description: None,
            properties: vec![Property {
                name: "cmd".to_string(),
                schema: Schema::String {
                    description: Some("the command to run via `sh -c`".to_string()),
                    enumeration: None,
                },
            }],
            required: vec!["cmd".to_string()],
        },
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = Args::parse(argv.into_iter());

    let session_dir = PathBuf::from(
        std::env::var("ORG_SESSION_DIR").unwrap_or_else(|_| ".org".to_string()),
    );
    let _log_guard = init_logging(&args, &session_dir);

    let run_id = args
        .flag_str("run-id")
        .map(|s| RunId(s.to_string()))
        .unwrap_or_else(RunId::from_env);
    info!(run_id = %run_id.0, "conclave starting");

    // ORG_UI_MODE is accepted and stored for contract compatibility (§6.1);
    // both `tmux` and `rich` resolve to the same plain-line renderer.
    let _ui_mode = std::env::var("ORG_UI_MODE").unwrap_or_else(|_| "rich".to_string());

    let Some(prompt) = args.prompt.clone() else {
        error!("no kickoff prompt given; pass one as the first argument");
        return EXIT_ENTRYPOINT_MISSING;
    };

    match build_and_run(&args, &session_dir, prompt).await {
        Ok(()) => 0,
        Err(e) if e.to_string().contains("user quit") => EXIT_USER_QUIT,
        Err(e) => {
            error!(error = %e, "conclave exited with an error");
            1
        }
    }
}

async fn build_and_run(args: &Args, session_dir: &PathBuf, prompt: String) -> Result<()> {
    let safe_mode = args.flag_bool("safe") || std::env::var("SAFE_MODE").is_ok_and(|v| v == "1");
    let persona_mode = PersonaMode::from_env_str(
        &std::env::var("ORG_DYNAMIC_MEMORY").unwrap_or_else(|_| "off".to_string()),
    )
    .unwrap_or_default();

    let agent_ids: Vec<String> = args
        .flag_str("agents")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .filter(|ids: &Vec<String>| !ids.is_empty())
        .unwrap_or_else(|| vec!["assistant".to_string()]);

    let model_id = args
        .flag_str("model")
        .map(str::to_string)
        .or_else(|| std::env::var("OPENAI_MODEL").ok())
        .unwrap_or_else(|| "gpt-4o-mini".to_string());

    let provider = conclave_llm_openai::from_env();

    let mut memory_config = MemoryConfig::default();
    memory_config.persona_mode = persona_mode;
    let memory_config = memory_config.validated();
    let guard_config = GuardConfig::from_max_tool_hops(SchedulerConfig::default().max_tools);
    let scheduler_config = SchedulerConfig::default().validated();

    let mut agents = Vec::with_capacity(agent_ids.len());
    for id in &agent_ids {
        let driver = Arc::new(provider.model(&model_id));
        let summarizer = Arc::new(DriverSummarizer::new(driver.clone()));
        let memory = Memory::with_summarizer(id, "BASE", memory_config.clone(), summarizer);
        let guard = GuardRail::new(guard_config.clone());
        let agent = Agent::new(
            id.clone(),
            memory,
            guard,
            DriverConfig {
                driver,
                tools: vec![sh_tool_definition()],
            },
        );
        agents.push(Arc::new(agent));
    }

    let cwd = std::env::current_dir().context("reading current directory")?;
    let tool_executor: Arc<ToolExecutor> = if safe_mode {
        Arc::new(ToolExecutor::new(SafeConfirmingSandbox::new(ProcessSandbox::new(cwd))))
    } else {
        Arc::new(ToolExecutor::new(ProcessSandbox::new(cwd)))
    };
    let file_writer = Arc::new(SandboxFileWriter::new(session_dir.join("work")));

    let inbox = Arc::new(Inbox::new());
    let cancel = CancellationToken::new();
    let user_bridge: Arc<dyn UserBridge> = if scheduler_config.prompt_enabled {
        Arc::new(StdinUserBridge)
    } else {
        Arc::new(NullUserBridge)
    };

    let scheduler = Arc::new(Scheduler::new(
        agents,
        inbox,
        tool_executor,
        file_writer,
        scheduler_config,
        user_bridge,
        cancel.clone(),
    ));
    scheduler.kickoff(prompt);

    let run_scheduler = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::select! {
        _ = run_scheduler => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, stopping");
            scheduler.stop();
            bail!("user quit");
        }
    }

    Ok(())
}
