//! keyswap - Exclusive single-device key remapper
//!
//! Grabs one physical input device, rewrites configured key codes, and
//! re-emits the stream through a virtual uinput device.

mod config;
mod device;
mod pipeline;
mod remap;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use device::{enumerate_devices, SourceDevice, VirtualDevice};
use pipeline::Pipeline;
use remap::RemapPolicy;

/// keyswap - exclusive key remapping via evdev and uinput
#[derive(Parser)]
#[command(name = "keyswap")]
#[command(author = "Keyswap Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Grab an input device and re-emit it with remapped keys", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grab a device and run the remap loop
    Run {
        /// Physical device to grab (overrides config)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// uinput control node (overrides config)
        #[arg(short, long)]
        uinput: Option<PathBuf>,
    },

    /// List input devices on the system
    List,

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Run { device, uinput } => {
            run_pipeline(config, device, uinput)?;
        }
        Commands::List => {
            list_devices()?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config();
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_system_info();
        }
    }

    Ok(())
}

/// Run the remap pipeline until the terminate key, a signal, or an error.
fn run_pipeline(
    config: Config,
    device_override: Option<PathBuf>,
    uinput_override: Option<PathBuf>,
) -> anyhow::Result<()> {
    let device_path = device_override.unwrap_or_else(|| config.device.path.clone());
    let uinput_path = uinput_override.unwrap_or_else(|| config.device.uinput_path.clone());

    // Draining must also run when systemd or the terminal kills us,
    // otherwise the physical device stays grabbed by a dead process.
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;

    // Lifecycle order: open the source, build the virtual device from its
    // capabilities, and only then let the pipeline grab.
    let source = SourceDevice::open(&device_path)
        .with_context(|| format!("failed to open source device {}", device_path.display()))?;
    let sink = VirtualDevice::create_from(&source, &uinput_path, &config.device.virtual_name)
        .context("failed to create virtual device")?;

    let policy = RemapPolicy::new(&config.remap.rules);
    if policy.is_empty() {
        tracing::warn!("No remap rules configured; events pass through unchanged");
    }
    for rule in &config.remap.rules {
        if !source.capabilities().has_key(rule.source) {
            tracing::warn!(
                "Source device does not advertise key code {}; rule {} -> {} will never match",
                rule.source,
                rule.source,
                rule.target
            );
        }
    }

    println!("\n========================================");
    println!("  keyswap running");
    println!("========================================");
    println!("  Device:  {} ({})", device_path.display(), source.name());
    println!("  Virtual: {}", config.device.virtual_name);
    println!("  Rules:   {}", policy.len());
    println!("========================================");
    println!(
        "\nPress the terminate key (code {}) or Ctrl+C to stop.\n",
        config.remap.terminate_key
    );

    let mut pipeline = Pipeline::new(
        source,
        sink,
        policy,
        config.remap.terminate_key,
        &config.pipeline,
        shutdown,
    );

    pipeline.run().context("remap pipeline failed")?;

    println!("Stopped cleanly after {} events.", pipeline.forwarded());
    Ok(())
}

/// List input devices with their human-readable names.
fn list_devices() -> anyhow::Result<()> {
    let devices = enumerate_devices().context("failed to enumerate /dev/input")?;

    if devices.is_empty() {
        println!("No input devices found. Make sure you're in the 'input' group.");
        return Ok(());
    }

    println!("Input devices:");
    for (path, name) in devices {
        if name.is_empty() {
            println!("  {}", path.display());
        } else {
            println!("  {}  ({})", path.display(), name);
        }
    }
    Ok(())
}

/// Print system information
fn print_system_info() {
    println!("keyswap System Information");
    println!("==========================\n");

    println!("Requirements:");
    println!("  - User must be in 'input' group: sudo usermod -aG input $USER");
    println!("  - uinput module must be loaded: sudo modprobe uinput");

    let uinput_ok = std::path::Path::new("/dev/uinput").exists();
    println!(
        "\n/dev/uinput present: {}",
        if uinput_ok { "yes" } else { "no" }
    );

    match enumerate_devices() {
        Ok(devices) => println!("Input devices found: {}", devices.len()),
        Err(e) => println!("Input devices found: error ({})", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["keyswap", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_run_with_device_override() {
        let cli = Cli::try_parse_from(["keyswap", "run", "--device", "/dev/input/event3"]).unwrap();
        match cli.command {
            Commands::Run { device, .. } => {
                assert_eq!(device, Some(PathBuf::from("/dev/input/event3")));
            }
            _ => panic!("expected run subcommand"),
        }
    }
}
