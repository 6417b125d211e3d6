use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use pico_fbw_serial::device::PortMonitor;
use pico_fbw_serial::{
    ConfigProtocol, DeviceSession, NativeTransport, PollingPortMonitor, SessionConfig, SessionEvent,
    SessionEventKind,
};

/// fbw-link - talk to a pico-fbw flight controller over its serial API
#[derive(Parser, Debug)]
#[command(name = "fbw-link", version, about, long_about = None)]
struct Args {
    /// JSON session config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port to use instead of searching by vendor id
    #[arg(short, long)]
    port: Option<String>,

    /// USB vendor id to search for (hex, e.g. 2e8a)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports matching the vendor filter
    List {
        /// Show every port, not just matching ones
        #[arg(long)]
        all: bool,
    },
    /// Check the device answers
    Ping,
    /// Print device information
    Info,
    /// Print the configuration, or a single value
    GetConfig { section: Option<String>, key: Option<String> },
    /// Change one configuration value and verify it
    SetConfig {
        section: String,
        key: String,
        value: String,
        /// Persist the change to flash immediately
        #[arg(long)]
        save: bool,
    },
    /// Persist staged changes to flash and verify them
    SaveConfig,
    /// Send a raw command and print the response payload
    Send {
        command: String,
        #[arg(long)]
        write_delay_ms: Option<u64>,
        #[arg(long)]
        read_timeout_ms: Option<u64>,
    },
    /// Stay connected and report plug/unplug events
    Watch,
}

fn parse_hex_u16(s: &str) -> std::result::Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port.filter.port_name = Some(port.clone());
    }
    if let Some(vid) = args.vid {
        config.port.filter.vendor_id = Some(vid);
    }
    if let Some(baud) = args.baud {
        config.port.baud_rate = baud;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config = load_config(&args)?;

    if let Command::List { all } = args.command {
        let ports = if all {
            NativeTransport::list_ports()?
        } else {
            NativeTransport::discover_devices(&config.port.filter)?
        };
        if ports.is_empty() {
            warn!("No ports found matching {:?}", config.port.filter);
        }
        for port in ports {
            println!(
                "{}\t{}\t{}",
                port.port_name,
                port.vid.map(|v| format!("{:04x}", v)).unwrap_or_else(|| "-".into()),
                port.product.unwrap_or_default()
            );
        }
        return Ok(());
    }

    let session = Arc::new(DeviceSession::with_config(Arc::new(NativeTransport::new()), config));
    let device = session.open_default().await.context("Failed to open device")?;
    info!("Using {}", device.port_name);
    session.ping().await?;

    let protocol = ConfigProtocol::new(session.clone());
    let outcome = run_command(&args.command, &session, &protocol).await;
    session.close().await;
    outcome
}

async fn run_command(command: &Command, session: &Arc<DeviceSession>, protocol: &ConfigProtocol) -> Result<()> {
    match command {
        Command::List { .. } => {}
        Command::Ping => println!("PONG"),
        Command::Info => {
            let info = protocol.get_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::GetConfig { section, key } => match (section, key) {
            (Some(section), Some(key)) => {
                println!("{}", protocol.get_config_value(section, key).await?);
            }
            (Some(section), None) => {
                let config = protocol.get_config().await?;
                let found = config
                    .section(section)
                    .with_context(|| format!("No section named {}", section))?;
                println!("{}", serde_json::to_string_pretty(found)?);
            }
            _ => {
                let config = protocol.get_config().await?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
        Command::SetConfig { section, key, value, save } => {
            protocol.set_config_value(section, key, value, *save).await?;
            if !save {
                info!("Change staged; run with --save to persist it");
            }
        }
        Command::SaveConfig => {
            let staged = protocol.get_config().await?;
            protocol.save_config(&staged).await?;
        }
        Command::Send { command, write_delay_ms, read_timeout_ms } => {
            let write_delay = write_delay_ms.map(Duration::from_millis).unwrap_or_else(|| session.write_delay());
            let read_timeout = read_timeout_ms.map(Duration::from_millis).unwrap_or_else(|| session.read_timeout());
            let response = session.send_command(command, write_delay, read_timeout).await?;
            println!("{}", response);
        }
        Command::Watch => watch(session).await?,
    }
    Ok(())
}

async fn watch(session: &Arc<DeviceSession>) -> Result<()> {
    let mut monitor = PollingPortMonitor::new(Duration::from_millis(session.config().monitor_poll_ms));
    let events = monitor
        .get_receiver()
        .context("Port monitor receiver unavailable")?;
    monitor.start().await?;
    let watcher = session.spawn_hardware_watch(events);

    session.add_listener(SessionEventKind::Disconnect, |_| warn!("Device disconnected"));
    let mut updates = session.subscribe();
    info!("Watching for device changes, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(SessionEvent::Connected { port_name, reopened: true }) => {
                    info!("Reconnected on {}", port_name);
                    if let Err(e) = session.ping().await {
                        warn!("Device not answering after reconnect: {}", e);
                    }
                }
                Ok(event) => info!("{:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} event(s)", n),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    monitor.stop().await?;
    watcher.abort();
    Ok(())
}
