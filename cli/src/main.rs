use std::fs;
use std::io::{self, Read};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use classboard::config::env_parse;
use classboard::model::ClassData;
use classboard::{
    ConfigError, ConnectRequest, EmitError, GenerationResult, NewNode, Position, RelationKind, SessionEvent,
    SessionHandle, SyncConfig, WsConnector, spawn_session,
};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_JOIN_WAIT_MS: u64 = 15_000;
const DEFAULT_STATE_WAIT_MS: u64 = 2_000;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session error: {0}")]
    Session(#[from] EmitError),
    #[error("timed out waiting to join room {0}")]
    JoinTimeout(String),
    #[error("unknown relationship kind: {0}")]
    UnknownKind(String),
    #[error("failed to read {path}: {source}")]
    Input { path: String, source: io::Error },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

#[derive(Parser, Debug)]
#[command(name = "classboard-cli", about = "Join a class-diagram room and edit it from the terminal")]
struct Cli {
    #[arg(long, env = "CLASSBOARD_SERVER_URL", default_value = classboard::config::DEFAULT_SERVER_URL)]
    server_url: String,

    #[arg(long, env = "CLASSBOARD_ROOM_ID")]
    room: String,

    #[arg(long, env = "CLASSBOARD_USER_NAME")]
    user_name: String,

    #[arg(long, env = "CLASSBOARD_USER_ID")]
    user_id: Option<String>,

    #[arg(long, env = "CLASSBOARD_USER_EMAIL")]
    user_email: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print roster and diagram changes until interrupted.
    Watch,
    /// Add a class node.
    AddClass(AddClassArgs),
    /// Draw a relationship between two nodes.
    Connect(ConnectArgs),
    /// Delete nodes or edges by id.
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Merge a generation result (JSON) into the diagram.
    Import {
        #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
        input: String,
    },
    /// Persist the current diagram and wait for the server's answer.
    Save,
}

#[derive(Args, Debug)]
struct AddClassArgs {
    #[arg(long)]
    name: String,
    #[arg(long = "attr")]
    attributes: Vec<String>,
    #[arg(long = "method")]
    methods: Vec<String>,
    #[arg(long, default_value_t = 0.0)]
    x: f64,
    #[arg(long, default_value_t = 0.0)]
    y: f64,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
    #[arg(long, default_value = "Association")]
    kind: String,
    #[arg(long, help = "Cardinality such as 1:* (source:target)")]
    cardinality: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config_from(&cli)?;
    let room = config.room_id.clone();
    let handle = spawn_session(config.clone(), WsConnector::new(config.server_url.clone()));

    let join_wait = Duration::from_millis(env_parse("CLASSBOARD_CLI_JOIN_WAIT_MS", DEFAULT_JOIN_WAIT_MS));
    tokio::time::timeout(join_wait, handle.wait_joined())
        .await
        .map_err(|_| CliError::JoinTimeout(room.clone()))??;
    info!(%room, "joined");
    settle_initial_state(&handle).await;

    let result = match cli.command {
        Command::Watch => run_watch(&handle).await,
        Command::AddClass(args) => run_add_class(&handle, args).await,
        Command::Connect(args) => run_connect(&handle, args).await,
        Command::Delete { ids } => handle.delete_elements(ids).map_err(CliError::from),
        Command::Import { input } => run_import(&handle, &input).await,
        Command::Save => run_save(&handle).await,
    };

    // Give queued frames a moment to reach the socket before stopping.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown();
    result
}

fn config_from(cli: &Cli) -> Result<SyncConfig, CliError> {
    let overrides = [
        ("CLASSBOARD_SERVER_URL", Some(cli.server_url.clone())),
        ("CLASSBOARD_ROOM_ID", Some(cli.room.clone())),
        ("CLASSBOARD_USER_NAME", Some(cli.user_name.clone())),
        ("CLASSBOARD_USER_ID", cli.user_id.clone()),
        ("CLASSBOARD_USER_EMAIL", cli.user_email.clone()),
    ];
    let config = SyncConfig::from_lookup(|key| match overrides.iter().find(|(k, _)| *k == key) {
        Some((_, value)) => value.clone(),
        None => std::env::var(key).ok(),
    })?;
    Ok(config)
}

/// Wait briefly for the room's initial state so edits land on top of it.
async fn settle_initial_state(handle: &SessionHandle) {
    let wait = Duration::from_millis(env_parse("CLASSBOARD_CLI_STATE_WAIT_MS", DEFAULT_STATE_WAIT_MS));
    let mut view = handle.watch();
    if tokio::time::timeout(wait, view.wait_for(|v| v.revision > 0)).await.is_err() {
        warn!("no initial state received; continuing with an empty diagram");
    }
}

async fn run_watch(handle: &SessionHandle) -> Result<(), CliError> {
    let mut events = handle.subscribe();
    print_summary(handle);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { .. }) => print_summary(handle),
                Ok(SessionEvent::RosterChanged { users }) => {
                    let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
                    println!("users: {}", names.join(", "));
                }
                Ok(other) => eprintln!("{other:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch lagged behind session events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_summary(handle: &SessionHandle) {
    let view = handle.view();
    let classes: Vec<&str> = view.nodes.iter().filter_map(|n| n.data.class_name()).collect();
    println!(
        "rev {} | {} nodes, {} edges | {}",
        view.revision,
        view.nodes.len(),
        view.edges.len(),
        classes.join(", ")
    );
}

async fn run_add_class(handle: &SessionHandle, args: AddClassArgs) -> Result<(), CliError> {
    let mut data = ClassData::named(args.name);
    data.attributes = args.attributes;
    data.methods = args.methods;
    let id = handle.add_node(NewNode::Class(data), Position::new(args.x, args.y)).await?;
    println!("{id}");
    Ok(())
}

async fn run_connect(handle: &SessionHandle, args: ConnectArgs) -> Result<(), CliError> {
    let kind: RelationKind =
        serde_json::from_value(Value::String(args.kind.clone())).map_err(|_| CliError::UnknownKind(args.kind))?;
    let id = handle
        .connect(ConnectRequest { source: args.source, target: args.target, kind, cardinality: args.cardinality })
        .await?;
    println!("{id}");
    Ok(())
}

async fn run_import(handle: &SessionHandle, input: &str) -> Result<(), CliError> {
    let raw = read_input(input)?;
    let result: GenerationResult = serde_json::from_str(&raw)?;
    let outcome = handle.apply_generated(result).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.success {
        Ok(())
    } else {
        Err(CliError::Failed(outcome.error.unwrap_or_else(|| "import failed".to_owned())))
    }
}

async fn run_save(handle: &SessionHandle) -> Result<(), CliError> {
    let outcome = handle.save_state().await;
    println!("{}", serde_json::to_string(&outcome)?);
    if outcome.success {
        Ok(())
    } else {
        Err(CliError::Failed(outcome.error.unwrap_or_else(|| "save failed".to_owned())))
    }
}

fn read_input(path: &str) -> Result<String, CliError> {
    let to_error = |source| CliError::Input { path: path.to_owned(), source };
    if path == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).map_err(to_error)?;
        Ok(buf)
    } else {
        fs::read_to_string(path).map_err(to_error)
    }
}
