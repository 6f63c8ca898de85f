use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use midiprobe_transport::{
    config, registry, LoopbackBackend, MidiBackend, MidirBackend, ParamKey, SessionConfig,
};
use tracing_subscriber::EnvFilter;

mod console;
mod session;

use console::Console;
use session::{Scenario, Session};

#[derive(Parser)]
#[command(author, version, about = "Timing and resilience checks for MIDI endpoints")]
struct Cli {
    /// Output latency in milliseconds. Prompted for when omitted.
    #[arg(short = 'l', long)]
    latency: Option<u32>,
    /// Client name handed to the driver (ALSA only).
    #[arg(short = 'c', long)]
    client: Option<String>,
    /// Port name handed to the driver (ALSA only).
    #[arg(short = 'p', long)]
    port: Option<String>,
    /// Manufacturer name handed to the driver (CoreMIDI only).
    #[arg(short = 'm', long)]
    manufacturer: Option<String>,
    /// Enable debug logging.
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Session settings file. Defaults to the per-user config directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Store the effective settings for the next run.
    #[arg(long)]
    save: bool,
    /// Run against an in-memory loopback instead of real devices.
    #[arg(long)]
    loopback: bool,
    /// Scenario number (1-7). Prompted for when omitted.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=7))]
    scenario: Option<u8>,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => config::load_from(path),
            None => config::load(),
        };
        if let Some(latency) = self.latency {
            config.latency_ms = latency;
        }
        config.verbose |= self.verbose;
        let overrides = [
            (ParamKey::ClientName, &self.client),
            (ParamKey::PortName, &self.port),
            (ParamKey::Manufacturer, &self.manufacturer),
        ];
        for (key, value) in overrides {
            if let Some(value) = value {
                config.params.retain(|(existing, _)| *existing != key);
                config.params.push((key, value.clone()));
            }
        }
        config
            .open_params()
            .context("too many driver parameters; at most two of -c, -p and -m may be given")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = cli.session_config()?;

    let default_filter = if config.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init()
        .ok();
    registry::install_panic_hook();

    for (key, value) in &config.params {
        println!("{key} will be {value}");
    }
    if cfg!(target_pointer_width = "64") {
        println!("Apparently this is a 64-bit machine.");
    } else if cfg!(target_pointer_width = "32") {
        println!("Apparently this is a 32-bit machine.");
    }

    let mut console = Console::stdin();
    if cli.latency.is_none() {
        let latency = console.prompt_number("Latency in ms: ")?;
        config.latency_ms = u32::try_from(latency).context("latency must not be negative")?;
    }
    println!("Latency will be {}", config.latency_ms);
    if cli.save {
        config::save(&config);
    }

    println!("begin midiprobe test...");
    let scenario = match cli.scenario {
        Some(choice) => Scenario::from_choice(i64::from(choice)),
        None => None,
    };
    let scenario = match scenario {
        Some(scenario) => scenario,
        None => prompt_scenario(&mut console)?,
    };

    let mut backend: Box<dyn MidiBackend> = if cli.loopback {
        Box::new(loopback_with_player(scenario))
    } else {
        Box::new(MidirBackend::new().context("failed to enumerate MIDI endpoints")?)
    };

    Session::new(backend.as_mut(), config, console).run(scenario)?;
    Ok(())
}

fn prompt_scenario(console: &mut Console) -> Result<Scenario> {
    println!("enter your choice...");
    for scenario in Scenario::ALL {
        println!("    {}: {}", scenario.choice(), scenario.label());
    }
    loop {
        let choice = console.prompt_number("")?;
        match Scenario::from_choice(choice) {
            Some(scenario) => return Ok(scenario),
            None => println!("got {choice} (invalid input)"),
        }
    }
}

/// Loopback pair with a background player feeding the input side.
fn loopback_with_player(scenario: Scenario) -> LoopbackBackend {
    let backend = LoopbackBackend::new(midiprobe_transport::clock::start());
    if scenario.uses_input() {
        let player = backend.clone();
        let spawned = thread::Builder::new()
            .name("midiprobe-loopback-player".into())
            .spawn(move || play_scale(&player));
        if let Err(err) = spawned {
            tracing::warn!(?err, "failed to start loopback player");
        }
    }
    backend
}

fn play_scale(backend: &LoopbackBackend) {
    const SCALE: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];
    for note in SCALE.iter().cycle().take(64) {
        thread::sleep(Duration::from_millis(250));
        backend.inject(&[0xFE]);
        backend.inject(&[0xF8]);
        backend.inject(&[0x90, *note, 100]);
        thread::sleep(Duration::from_millis(100));
        backend.inject(&[0x90, *note, 0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_flags_override_saved_params() {
        let cli = Cli::parse_from([
            "midiprobe",
            "-l",
            "250",
            "-c",
            "probe",
            "-p",
            "out",
            "--config",
            "/nonexistent/session.json",
        ]);
        let config = cli.session_config().unwrap();
        assert_eq!(config.latency_ms, 250);
        assert_eq!(
            config.params,
            vec![
                (ParamKey::ClientName, "probe".to_string()),
                (ParamKey::PortName, "out".to_string()),
            ]
        );
    }

    #[test]
    fn three_driver_params_are_rejected() {
        let cli = Cli::parse_from([
            "midiprobe",
            "-c",
            "a",
            "-p",
            "b",
            "-m",
            "c",
            "--config",
            "/nonexistent/session.json",
        ]);
        assert!(cli.session_config().is_err());
    }

    #[test]
    fn scenario_flag_is_range_checked() {
        assert!(Cli::try_parse_from(["midiprobe", "--scenario", "8"]).is_err());
        assert!(Cli::try_parse_from(["midiprobe", "--scenario", "5"]).is_ok());
    }
}
