use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keysign_core::{init, CommandDispatcher, CommandResult, Config, KeyStoreBackend, KeysignCommand};
use serde_json::Value;
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "keysign")]
#[command(about = "Per-identity key management and payload signing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Load configuration from a JSON file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Set data directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Keep keys in memory only (lost on exit)
    #[arg(long)]
    memory: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive mode: one `<action> [json args]` per line
    Shell,
    /// Generate a key pair for an identity unless a valid one exists
    GenKey {
        uid: String,
    },
    /// Print an identity's public key as PEM
    PublicKey {
        uid: String,
    },
    /// Sign a JSON object payload as an identity
    Sign {
        uid: String,
        /// Payload JSON, or @file to read it from a file
        payload: String,
        /// Modification time in ms since the epoch (defaults to now)
        #[arg(short, long)]
        last_modified: Option<i64>,
    },
    /// Verify a signature packet
    Verify {
        /// Packet JSON, or @file
        packet: String,
        /// PEM public key text, or @file
        public_key: String,
        /// Identity the packet must be signed by
        signer: String,
    },
    /// Run a raw bridge action with a JSON argument array
    Exec {
        action: String,
        /// JSON array of arguments
        #[arg(default_value = "[]")]
        args: String,
    },
    /// Write the effective configuration to a file
    SaveConfig {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    // Create config
    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir.into();
    }
    if cli.memory {
        config.key_store = KeyStoreBackend::Memory;
    }

    info!("Starting keysign with data directory: {}", config.data_dir.display());

    if let Some(Commands::SaveConfig { path }) = &cli.command {
        config.save_to_file(path)?;
        println!("💾 Configuration written to {}", path.display());
        return Ok(());
    }

    let dispatcher = init(&config)?;

    match cli.command {
        Some(Commands::Shell) | None => run_interactive_mode(dispatcher).await,
        Some(Commands::GenKey { uid }) => run(&dispatcher, "genKeyPairIfNecessary", vec![Value::String(uid)]).await,
        Some(Commands::PublicKey { uid }) => run(&dispatcher, "getPublicKey", vec![Value::String(uid)]).await,
        Some(Commands::Sign {
            uid,
            payload,
            last_modified,
        }) => {
            let payload: Value = serde_json::from_str(&read_arg(&payload)?).context("payload is not valid JSON")?;
            let last_modified = last_modified.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
            run(&dispatcher, "sign", vec![Value::String(uid), payload, Value::from(last_modified)]).await
        }
        Some(Commands::Verify {
            packet,
            public_key,
            signer,
        }) => {
            let args = vec![
                Value::String(read_arg(&packet)?),
                Value::String(read_arg(&public_key)?),
                Value::String(signer),
            ];
            run(&dispatcher, "verify", args).await
        }
        Some(Commands::Exec { action, args }) => run(&dispatcher, &action, parse_args(&args)?).await,
        Some(Commands::SaveConfig { .. }) => Ok(()),
    }
}

/// Literal text, or the contents of a file when prefixed with `@`.
fn read_arg(value: &str) -> Result<String> {
    match value.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path)),
        None => Ok(value.to_string()),
    }
}

fn parse_args(text: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(text).context("arguments are not valid JSON")? {
        Value::Array(args) => Ok(args),
        other => Ok(vec![other]),
    }
}

async fn run(dispatcher: &CommandDispatcher, action: &str, args: Vec<Value>) -> Result<()> {
    let result = dispatcher.execute_async(action.to_string(), args).await;
    print_result(&result);
    match result {
        CommandResult::Success(_) => Ok(()),
        CommandResult::Error { code, message } => Err(anyhow::anyhow!("{}: {}", code, message)),
    }
}

fn print_result(result: &CommandResult) {
    match result {
        CommandResult::Success(Value::String(text)) => println!("{}", text),
        CommandResult::Success(value) => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()))
        }
        CommandResult::Error { code, message } => println!("❌ {}: {}", code, message),
    }
}

async fn run_interactive_mode(dispatcher: CommandDispatcher) -> Result<()> {
    println!("🔐 keysign - per-identity signing keys");
    println!("Type help for actions, quit to exit\n");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    print!("> ");
    io::stdout().flush()?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();

        match line {
            "" => {}
            "quit" | "exit" => break,
            "help" => println!("{}", KeysignCommand::help_text()),
            _ => {
                let (action, rest) = line.split_once(char::is_whitespace).unwrap_or((line, "[]"));
                match parse_args(rest.trim()) {
                    Ok(args) => print_result(&dispatcher.execute_async(action.to_string(), args).await),
                    Err(e) => println!("❌ {}", e),
                }
            }
        }

        print!("> ");
        io::stdout().flush()?;
    }

    println!("👋 Goodbye!");
    Ok(())
}
