//! Console front end for the push client.
//!
//! Prints log lines, status changes, notifications and order messages, and
//! reads `connect`, `disconnect`, `toggle` and `quit` from stdin. Ctrl-C and
//! `quit` both shut the client down and exit only after teardown finishes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pushlink::config::{AppConfig, DEFAULT_CONFIG_FILE};
use pushlink::{ClientEvent, ConnectionHandle, PushClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pushlink", about = "Self-healing push server websocket client")]
struct Args {
    /// Path to the settings file carrying the AppSettings section.
    #[arg(long, env = "PUSHLINK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Start idle instead of connecting immediately.
    #[arg(long)]
    no_autoconnect: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", path = %args.config.display(), error = %err);
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(event = "config_loaded", websocket_url = %config.websocket_url, bind_url = %config.bind_url);

    let connection = match PushClient::new(config).start() {
        Ok(connection) => connection,
        Err(err) => {
            eprintln!("failed to start client: {err}");
            return ExitCode::FAILURE;
        }
    };
    let (handle, mut events) = connection.split();

    if !args.no_autoconnect {
        if let Err(err) = handle.connect() {
            eprintln!("failed to connect: {err}");
            return ExitCode::FAILURE;
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(event) = events.recv() => render(&event),
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(err) = handle.shutdown().await {
        eprintln!("shutdown failed: {err}");
    }
    while let Ok(event) = events.try_recv() {
        render(&event);
    }
    ExitCode::SUCCESS
}

/// Returns false when the user asked to quit.
async fn run_command(handle: &ConnectionHandle, command: &str) -> bool {
    let result = match command {
        "" => Ok(()),
        "connect" => handle.connect(),
        "disconnect" => handle.disconnect().await,
        "toggle" => handle.toggle().await,
        "status" => {
            println!("status: {}", handle.state().label());
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            println!("unknown command {other:?}; try connect, disconnect, toggle, status, quit");
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("{command} failed: {err}");
    }
    true
}

fn render(event: &ClientEvent) {
    match event {
        ClientEvent::Log(line) => println!("{} {}", line.time(), line.text),
        ClientEvent::Status(state) => println!("== status: {}", state.label()),
        ClientEvent::Notification { title, message } => println!("[{title}] {message}"),
        ClientEvent::Message(text) => println!(">> {text}"),
        ClientEvent::Liveness { remaining } => {
            println!("== status: connected (heartbeat: {}s)", remaining.as_secs())
        }
    }
}
