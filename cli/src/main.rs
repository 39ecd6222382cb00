//! CLI frontend for the air-purifier CoAP client core. `status`,
//! `status-observe`, `set K=V...` are backed by [`airctrl_core::Client`];
//! `discover`, `device-info`, `setup` are named for CLI-surface parity with
//! the device-management tooling this client is part of, but they are
//! separate orchestration tools and print a notice instead of running here.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_stream::StreamExt;

use airctrl_core::{Client, DEFAULT_PORT, DEFAULT_RETRY_COUNT};

#[derive(Parser)]
#[command(name = "airctrl", about = "Control a networked air-purifier appliance")]
struct Cli {
    /// Enable debug-level logging for this crate and the CoAP transport.
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Get status of device.
    Status {
        #[arg(short = 'H', long)]
        host: String,
        #[arg(short = 'P', long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Output status as JSON.
        #[arg(short = 'J', long)]
        json: bool,
    },
    /// Observe status of device.
    StatusObserve {
        #[arg(short = 'H', long)]
        host: String,
        #[arg(short = 'P', long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(short = 'J', long)]
        json: bool,
    },
    /// Set value of device.
    Set {
        #[arg(short = 'H', long)]
        host: String,
        #[arg(short = 'P', long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Key-value pairs to set, e.g. `power=true`.
        #[arg(value_name = "K=V", required = true)]
        values: Vec<String>,
        /// Encode bare values as integers instead of strings.
        #[arg(short = 'I', long = "int")]
        value_as_int: bool,
    },
    /// Discover air purifiers on the network (out of scope for this core).
    Discover,
    /// Get comprehensive device information (out of scope for this core).
    DeviceInfo {
        #[arg(short = 'H', long)]
        host: String,
    },
    /// Interactive setup wizard for Home Assistant integration (out of scope).
    Setup,
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(level).compact().init();
}

fn parse_set_value(raw: &str, value_as_int: bool) -> Result<Value> {
    match raw {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ if value_as_int => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| anyhow!("cannot encode value '{raw}' as int")),
        _ => Ok(Value::String(raw.to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Command::Discover => {
            println!("discover is not implemented by this client; run the network discovery tool instead");
            return Ok(());
        }
        Command::Setup => {
            println!("setup is not implemented by this client; run the setup wizard instead");
            return Ok(());
        }
        Command::DeviceInfo { host } => {
            println!(
                "device-info is not implemented by this client; run the device classifier instead (host={host})"
            );
            return Ok(());
        }
        _ => {}
    }

    run_device_command(cli.command).await
}

/// Runs a command that needs a live client, guaranteeing `shutdown()` is
/// called on every exit path — including `Ctrl-C` — the way `cli.py`'s
/// `try/finally` around `client.shutdown()` does.
async fn run_device_command(command: Command) -> Result<()> {
    let (host, port) = match &command {
        Command::Status { host, port, .. }
        | Command::StatusObserve { host, port, .. }
        | Command::Set { host, port, .. } => (host.clone(), *port),
        Command::Discover | Command::Setup | Command::DeviceInfo { .. } => unreachable!(),
    };

    let client = Client::create(&host, port)
        .await
        .with_context(|| format!("failed to open CoAP endpoint to {host}:{port}"))?;

    let outcome = tokio::select! {
        result = dispatch(&client, command) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    client.shutdown().await;
    outcome
}

async fn dispatch(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Status { json, .. } => {
            let (status, max_age) = client.get_status().await?;
            print_status(&status, json);
            if !json {
                println!("max_age = {max_age}");
            }
            Ok(())
        }
        Command::StatusObserve { json, .. } => {
            let mut stream = Box::pin(client.observe_status().await?);
            while let Some(status) = stream.next().await {
                print_status(&status, json);
            }
            Ok(())
        }
        Command::Set {
            values,
            value_as_int,
            ..
        } => {
            let mut data = Map::new();
            for entry in &values {
                let (key, raw_value) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected K=V, got '{entry}'"))?;
                data.insert(key.to_string(), parse_set_value(raw_value, value_as_int)?);
            }
            if !data.is_empty() {
                let ok = client
                    .set_control_values(&data, DEFAULT_RETRY_COUNT, true)
                    .await?;
                if !ok {
                    return Err(anyhow!("device rejected the write after retrying"));
                }
            }
            Ok(())
        }
        Command::Discover | Command::Setup | Command::DeviceInfo { .. } => unreachable!(),
    }
}

fn print_status(status: &Map<String, Value>, json: bool) {
    if json {
        match serde_json::to_string_pretty(status) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => eprintln!("failed to render status as JSON: {e}"),
        }
    } else {
        println!("{}", Value::Object(status.clone()));
    }
}
