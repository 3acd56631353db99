//! Labwire command-line interface
//!
//! Inspects models, probes transports and manages the configuration file.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use labwire::config::{self, ConfigStore, GlobalSettings};
use labwire::transport::{bluetooth, serial};
use labwire::{logging, DeviceHandle, Workbench};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Line ending appended to probe payloads
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LineEnding {
    /// CR+LF
    Crlf,
    /// LF only
    Lf,
    /// CR only
    Cr,
    /// No line ending
    None,
}

impl LineEnding {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Crlf => b"\r\n",
            Self::Lf => b"\n",
            Self::Cr => b"\r",
            Self::None => b"",
        }
    }
}

/// Labwire CLI
#[derive(Parser, Debug)]
#[command(name = "labwire", version, about = "Model-driven device graphs for hardware-in-the-loop testing", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user location)
    #[arg(short, long, env = "LABWIRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a model and print the device graph
    Inspect {
        /// Model file
        model: PathBuf,
    },

    /// Connect one transport of a model, send a payload and print the reply
    Probe {
        /// Model file
        model: PathBuf,

        /// Transport name
        transport: String,

        /// Payload to send
        payload: String,

        /// Payload is hex
        #[arg(long)]
        hex: bool,

        /// Line ending appended to text payloads
        #[arg(long, value_enum, default_value_t = LineEnding::Lf)]
        line_ending: LineEnding,

        /// Reply timeout (ms)
        #[arg(long, default_value = "1000")]
        timeout: u64,
    },

    /// List registered device and transport types
    Types,

    /// List available serial ports
    ListPorts,

    /// Scan for Bluetooth LE devices
    BleScan {
        /// Scan duration (seconds)
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write missing defaults to the configuration file
    Init,
    /// Print the configuration file path
    Path,
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(config::default_config_path)
}

fn read_store(path: Option<&Path>) -> anyhow::Result<ConfigStore> {
    match path {
        Some(path) if path.exists() => ConfigStore::load(path)
            .with_context(|| format!("Failed to read configuration {}", path.display())),
        _ => Ok(ConfigStore::new()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = config_path(&cli);
    let store = read_store(path.as_deref())?;
    let mut settings = GlobalSettings::from_store(&store)?;
    if cli.verbose {
        settings.logging.level = "debug".to_string();
    } else if cli.quiet {
        settings.logging.level = "error".to_string();
    }
    let _guard = logging::init(&settings.logging)?;

    tracing::debug!("Starting {} v{}", labwire::NAME, labwire::VERSION);

    match &cli.command {
        Commands::Inspect { model } => {
            let bench = Workbench::with_config(store)?;
            let device = bench.load_file(model)?;
            print_device(&cli, &device)?;
        }
        Commands::Probe {
            model,
            transport,
            payload,
            hex,
            line_ending,
            timeout,
        } => {
            let bench = Workbench::with_config(store)?;
            let device = bench.load_file(model)?;
            let data = if *hex {
                hex::decode(payload.replace(' ', "")).context("Payload is not valid hex")?
            } else {
                let mut data = payload.as_bytes().to_vec();
                data.extend_from_slice(line_ending.as_bytes());
                data
            };
            probe(&cli, &device, transport, &data, Duration::from_millis(*timeout))?;
        }
        Commands::Types => {
            let bench = Workbench::with_config(store)?;
            list_types(&cli, &bench)?;
        }
        Commands::ListPorts => list_ports(&cli)?,
        Commands::BleScan { duration } => ble_scan(&cli, Duration::from_secs(*duration))?,
        Commands::Config { action } => handle_config(&cli, action, path, store, &settings)?,
    }

    Ok(())
}

fn print_device(cli: &Cli, device: &DeviceHandle) -> anyhow::Result<()> {
    let transports: Vec<_> = device
        .transports()
        .iter()
        .map(|node| {
            serde_json::json!({
                "name": node.name(),
                "type": node.type_name(),
                "kind": node.kind().to_string(),
                "uid": node.uid(),
                "duid": node.duid(),
                "endpoint": node.connection_info(),
            })
        })
        .collect();

    match cli.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "uid": device.uid(),
                "type": device.type_name(),
                "fields": device.fields(),
                "transports": transports,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("{} [{}] uid={}", device.name(), device.type_name(), device.uid());
            println!("  id: {}", device.id());
            println!("  model: {}", device.model());
            println!("  description: {}", device.description());
            for (key, value) in &device.fields().extra {
                let value = serde_yaml::to_string(value)?;
                println!("  {key}: {}", value.trim());
            }
            for node in device.transports() {
                println!(
                    "  - {} [{}] uid={} -> {}",
                    node.name(),
                    node.type_name(),
                    node.uid().map_or_else(|| "?".to_string(), |u| u.to_string()),
                    node.connection_info()
                );
            }
        }
    }
    Ok(())
}

fn probe(cli: &Cli, device: &DeviceHandle, name: &str, data: &[u8], timeout: Duration) -> anyhow::Result<()> {
    let transport = device.transport(name)?;
    transport.connect()?;
    let sent = transport.write(data)?;
    let reply = transport.read_timeout(Some(timeout))?;
    if let Err(e) = transport.disconnect() {
        tracing::warn!(error = %e, "Disconnect failed");
    }

    match cli.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "transport": name,
                "sent": sent,
                "received": reply.len(),
                "text": String::from_utf8_lossy(&reply),
                "hex": hex::encode_upper(&reply),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if reply.is_empty() {
                if !cli.quiet {
                    println!("No reply within {} ms", timeout.as_millis());
                }
            } else if reply.iter().all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace()) {
                println!("{}", String::from_utf8_lossy(&reply).trim_end());
            } else {
                println!("{}", hex::encode_upper(&reply));
            }
        }
    }
    Ok(())
}

fn list_types(cli: &Cli, bench: &Workbench) -> anyhow::Result<()> {
    let types = bench.capabilities().describe();
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&types)?),
        OutputFormat::Text => {
            for info in &types {
                let caps: Vec<String> = info.capabilities.all().iter().map(|c| format!("{c:?}")).collect();
                println!("{:<10} {:<9} {}", info.name, info.kind, caps.join(", "));
            }
        }
    }
    Ok(())
}

fn list_ports(cli: &Cli) -> anyhow::Result<()> {
    let ports = serial::list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            for port in &ports {
                println!("{} [{:?}]", port.port_name, port.port_type);
            }
        }
    }
    Ok(())
}

fn ble_scan(cli: &Cli, duration: Duration) -> anyhow::Result<()> {
    if !cli.quiet && cli.format == OutputFormat::Text {
        println!("Scanning for {} s...", duration.as_secs());
    }
    let devices = bluetooth::discover(duration)?;

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = devices
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "name": d.name,
                        "address": d.address,
                        "rssi": d.rssi,
                        "services": d.services,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            for device in &devices {
                let rssi = device.rssi.map_or_else(|| "?".to_string(), |r| r.to_string());
                println!("{} {} rssi={rssi}", device.address, device.name);
            }
        }
    }
    Ok(())
}

fn handle_config(
    cli: &Cli,
    action: &ConfigAction,
    path: Option<PathBuf>,
    mut store: ConfigStore,
    settings: &GlobalSettings,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Path => match path {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("No configuration directory available on this platform"),
        },
        ConfigAction::Show => {
            settings.apply_defaults(&mut store)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(settings)?),
                OutputFormat::Text => print!("{}", store.dumps()?),
            }
        }
        ConfigAction::Init => {
            let path = path.context("No configuration directory available on this platform")?;
            if cli.config.is_none() {
                config::init_directories()?;
            }
            let mut store = ConfigStore::open(&path)?;
            let added = GlobalSettings::from_store(&store)?.apply_defaults(&mut store)?;
            store.save()?;
            if !cli.quiet {
                println!("{}: {added} entries added", path.display());
            }
        }
    }
    Ok(())
}
