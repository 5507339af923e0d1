use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use frames::protocol::STATUS_SNAPSHOT;
use frames::{Frame, Status};
use futures_util::{SinkExt, StreamExt};
use relay::client::reconnect::{self, ReconnectPolicy};
use relay::client::{ClientConfig, ClientError, ClientEvent, WorkspaceClient};
use relay::config::{DEFAULT_HOST, DEFAULT_PORT, RelayConfig, WorkspaceIdentity};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("frame decode failed: {0}")]
    Decode(#[from] frames::CodecError),
    #[error("timed out waiting for websocket frame")]
    Timeout,
    #[error("hub returned error for {syscall}: {message}")]
    ServerError { syscall: String, message: String },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{task} task failed: {reason}")]
    Task { task: &'static str, reason: String },
}

#[derive(Parser, Debug)]
#[command(name = "relay-cli", about = "Inspect and drive a local board relay hub")]
struct Cli {
    #[arg(long, env = "RELAY_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = 15_000, help = "Query deadline in milliseconds, never below the hub query timeout")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the hub health endpoint.
    Health,
    /// Dump every board, card and registered workspace.
    Storage,
    /// Relay one operation to a board and print its result.
    Query(QueryArgs),
    /// Register as a workspace and print hub broadcasts, reconnecting on loss.
    Watch,
    /// Stream the read-only status channel.
    Status,
}

#[derive(Args, Debug)]
struct QueryArgs {
    board_id: String,
    operation: String,
    #[arg(help = "Positional arguments; each is parsed as JSON, else taken as a string")]
    args: Vec<String>,
}

#[derive(Debug, Clone)]
struct CliContext {
    addr: SocketAddr,
    timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let host: IpAddr = cli.host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let ctx = CliContext { addr: SocketAddr::new(host, cli.port), timeout: Duration::from_millis(cli.timeout_ms) };

    match cli.command {
        Command::Health => run_get(&ctx, "/health").await,
        Command::Storage => run_get(&ctx, "/storage").await,
        Command::Query(args) => run_query(&ctx, args).await,
        Command::Watch => run_watch(&ctx).await,
        Command::Status => run_status(&ctx).await,
    }
}

async fn run_get(ctx: &CliContext, path: &str) -> Result<(), CliError> {
    let client = reqwest::Client::builder().timeout(ctx.timeout).no_proxy().build()?;
    let response = client.get(format!("http://{}{path}", ctx.addr)).send().await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);
    if !status.is_success() {
        return Err(CliError::ServerError { syscall: format!("HTTP {}", status.as_u16()), message: value.to_string() });
    }
    print_json(&value)
}

async fn run_query(ctx: &CliContext, args: QueryArgs) -> Result<(), CliError> {
    let client = WorkspaceClient::new(client_config(ctx));
    let _session = client.connect().await?;
    let values = args.args.iter().map(|raw| parse_arg(raw)).collect();
    let result = client.query(&args.board_id, &args.operation, values).await;
    client.disconnect();
    print_json(&json!({ "result": result? }))
}

async fn run_watch(ctx: &CliContext) -> Result<(), CliError> {
    let client = WorkspaceClient::new(client_config(ctx));
    let mut events = client.subscribe();
    let (stop_tx, stop) = watch::channel(false);
    let maintain = tokio::spawn({
        let client = client.clone();
        async move { reconnect::maintain(&client, ReconnectPolicy::default(), stop).await }
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Hub(event)) => {
                    eprintln!("{}", event.syscall());
                    print_json(&event.to_frame().data)?;
                }
                Ok(ClientEvent::State(state)) => eprintln!("state: {state:?}"),
                Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => eprintln!("skipped {n} events"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if maintain.is_finished() {
            break;
        }
    }

    stop_tx.send_replace(true);
    match maintain.await {
        Ok(result) => result.map_err(CliError::from),
        Err(e) => Err(CliError::Task { task: "watch", reason: e.to_string() }),
    }
}

async fn run_status(ctx: &CliContext) -> Result<(), CliError> {
    let (mut stream, _) = connect_async(format!("ws://{}/ws/status", ctx.addr))
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))?;

    let req = Frame::request(STATUS_SNAPSHOT, json!({}));
    stream
        .send(Message::Text(frames::encode_json(&req)?.into()))
        .await
        .map_err(|error| CliError::WsConnect(Box::new(error)))?;

    let snapshot = tokio::time::timeout(ctx.timeout, recv_next(&mut stream)).await.map_err(|_| CliError::Timeout)??;
    print_frame(&snapshot)?;

    loop {
        let frame = tokio::select! {
            frame = recv_next(&mut stream) => frame?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        print_frame(&frame)?;
    }
}

fn print_frame(frame: &Frame) -> Result<(), CliError> {
    if frame.status == Status::Error {
        return Err(CliError::ServerError {
            syscall: frame.syscall.clone(),
            message: frame.error_message().unwrap_or("unknown error").to_owned(),
        });
    }
    eprintln!("{}", frame.syscall);
    print_json(&frame.data)
}

async fn recv_next(
    stream: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Result<Frame, CliError> {
    loop {
        let Some(message) = stream.next().await else {
            return Err(CliError::WsClosed);
        };
        match message.map_err(|error| CliError::WsConnect(Box::new(error)))? {
            Message::Text(text) => return frames::decode_json(text.as_str()).map_err(CliError::from),
            Message::Binary(bytes) => return frames::decode_frame(&bytes).map_err(CliError::from),
            Message::Close(_) => return Err(CliError::WsClosed),
            _ => {}
        }
    }
}

fn client_config(ctx: &CliContext) -> ClientConfig {
    let mut identity = WorkspaceIdentity::from_root(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    identity.workspace_id = format!("cli-{}", Uuid::new_v4());
    identity.name = "relay-cli".to_owned();
    ClientConfig {
        addr: ctx.addr,
        registration: identity.registration(),
        query_timeout: query_deadline(ctx.timeout, RelayConfig::from_env().query_timeout),
        ping_interval: Duration::from_secs(30),
        codec: frames::WireCodec::Protobuf,
    }
}

/// Never wait less than the hub waits on the board.
fn query_deadline(requested: Duration, hub_timeout: Duration) -> Duration {
    requested.max(hub_timeout)
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
