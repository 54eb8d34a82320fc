use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use handclap_lib::audio::detector::ClapDetector;
use handclap_lib::audio::{list_input_devices, CpalBackend};
use handclap_lib::bridge::transport::HttpTransport;
use handclap_lib::bridge::{BridgeClient, PairingOutcome};
use handclap_lib::config::AppConfig;
use handclap_lib::paths::AppPaths;
use handclap_lib::shell::{relay_claps, RelayEnd};
use handclap_lib::storage::{FileStore, KeyValueStore, MemoryStore};
use handclap_lib::validation::{
    validate_bridge_address, validate_device_name, validate_sensitivity_percent,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(
    name = "handclap",
    version,
    about = "Clap your hands to switch your lights on and off"
)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "HANDCLAP_CONFIG")]
    config: Option<PathBuf>,

    /// Keep config and bridge credentials under this directory instead
    #[arg(long, env = "HANDCLAP_HOME")]
    home: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the bridge connection and its lights
    Status,
    /// Look up the bridge address through the discovery service
    Discover,
    /// Use a bridge address entered by hand
    SetIp {
        /// Host or IP of the bridge, e.g. 192.168.1.20
        address: String,
    },
    /// Pair with the bridge; press its link button first
    Pair {
        /// How many times to ask while the link button is not pressed
        #[arg(long, default_value = "10")]
        attempts: u32,
        /// Wait between attempts
        #[arg(long, default_value = "3000")]
        interval_ms: u64,
    },
    /// List the lights known to the bridge
    Lights,
    /// Toggle every light once
    Toggle,
    /// Listen to the microphone and toggle the lights on each clap
    Listen {
        /// Loudness threshold in percent (0-100)
        #[arg(long)]
        sensitivity: Option<u32>,
        /// Minimum time between two claps
        #[arg(long)]
        cooldown_ms: Option<u64>,
        /// Input device to use instead of the default one
        #[arg(long)]
        device: Option<String>,
    },
    /// Forget the paired bridge
    Reset,
    /// List audio input devices
    Devices,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let paths = match cli.home {
        Some(root) => AppPaths::rooted_at(root),
        None => AppPaths::new()?,
    };
    paths.ensure_directories()?;

    let config_path = cli.config.unwrap_or_else(|| paths.config_file());
    let config = AppConfig::load_or_create(&config_path)?;
    log::debug!("Using config {}", config_path.display());

    if let Command::Devices = cli.command {
        return print_devices();
    }

    let mut bridge = build_bridge(&paths, &config)?;

    match cli.command {
        Command::Status => status(&mut bridge).await,
        Command::Discover => match bridge.discover_bridge().await {
            Some(ip) => {
                println!("Found bridge at {}", ip);
                Ok(())
            }
            None => bail!("No bridge found. Enter its address with `handclap set-ip <ADDRESS>`"),
        },
        Command::SetIp { address } => {
            let address = validate_bridge_address(&address)?;
            bridge.set_bridge_ip(address.as_str());
            println!("Bridge address set to {}", address);
            Ok(())
        }
        Command::Pair {
            attempts,
            interval_ms,
        } => pair(&mut bridge, attempts, Duration::from_millis(interval_ms)).await,
        Command::Lights => {
            if !bridge.is_connected() {
                bail!("Not connected to a bridge. Run `handclap pair` first");
            }
            print_lights(&mut bridge).await
        }
        Command::Toggle => {
            if !bridge.is_connected() {
                bail!("Not connected to a bridge. Run `handclap pair` first");
            }
            if bridge.toggle_all_lights().await {
                Ok(())
            } else {
                bail!("Failed to toggle lights")
            }
        }
        Command::Listen {
            sensitivity,
            cooldown_ms,
            device,
        } => listen(&mut bridge, &config, sensitivity, cooldown_ms, device).await,
        Command::Reset => {
            bridge.reset();
            println!("Bridge connection forgotten");
            Ok(())
        }
        Command::Devices => Ok(()),
    }
}

fn build_bridge(paths: &AppPaths, config: &AppConfig) -> Result<BridgeClient> {
    let transport =
        HttpTransport::new(config.bridge.request_timeout()).context("Failed to set up HTTP")?;

    let store: Box<dyn KeyValueStore> = match FileStore::open(paths.bridge_store_file()) {
        Ok(store) => Box::new(store),
        Err(e) => {
            log::warn!(
                "Bridge credentials unavailable ({:#}); they will not be remembered",
                e
            );
            Box::new(MemoryStore::new())
        }
    };

    Ok(BridgeClient::new(
        config.bridge.clone(),
        Arc::new(transport),
        store,
    ))
}

async fn status(bridge: &mut BridgeClient) -> Result<()> {
    match bridge.bridge_ip() {
        Some(ip) => println!("Bridge address: {}", ip),
        None => println!("Bridge address: not set"),
    }

    if bridge.is_connected() {
        println!("Paired: yes");
        print_lights(bridge).await?;
    } else {
        println!("Paired: no");
    }
    Ok(())
}

async fn print_lights(bridge: &mut BridgeClient) -> Result<()> {
    let lights = bridge
        .try_get_lights()
        .await
        .context("Could not fetch lights from the bridge")?;
    if lights.is_empty() {
        println!("No lights found");
        return Ok(());
    }
    for light in &lights {
        println!(
            "  [{}] {} ({})",
            light.id,
            light.name,
            if light.is_on() { "on" } else { "off" }
        );
    }
    Ok(())
}

async fn pair(bridge: &mut BridgeClient, attempts: u32, interval: Duration) -> Result<()> {
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match bridge.create_user().await {
            PairingOutcome::Paired(_) => {
                println!(
                    "Paired with bridge at {}",
                    bridge.bridge_ip().unwrap_or("?")
                );
                if let Err(e) = print_lights(bridge).await {
                    log::warn!("{:#}", e);
                }
                return Ok(());
            }
            PairingOutcome::LinkButtonNotPressed => {
                println!(
                    "Press the link button on your bridge ({}/{})",
                    attempt, attempts
                );
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
            PairingOutcome::Failed => {
                bail!("Could not pair with the bridge. Check its address with `handclap status`")
            }
        }
    }

    bail!("The link button was not pressed after {} attempts", attempts)
}

async fn listen(
    bridge: &mut BridgeClient,
    config: &AppConfig,
    sensitivity: Option<u32>,
    cooldown_ms: Option<u64>,
    device: Option<String>,
) -> Result<()> {
    let mut detector_config = config.detector.clone();
    if let Some(name) = device {
        detector_config.device_name = Some(validate_device_name(&name)?);
    }

    let backend = Arc::new(CpalBackend::new(detector_config.device_name.clone()));
    let mut detector = ClapDetector::new(backend, &detector_config);

    if let Some(percent) = sensitivity {
        let percent = validate_sensitivity_percent(percent)?;
        detector.set_threshold(percent as f32 / 100.0);
    }
    if let Some(ms) = cooldown_ms {
        detector.set_cooldown_period(ms);
    }

    if bridge.is_connected() {
        let lights = bridge.get_lights().await;
        log::info!("{} light(s) ready", lights.len());
    } else {
        log::warn!("Not connected to a bridge; claps will be heard but nothing will switch");
    }

    let (clap_tx, mut clap_rx) = mpsc::unbounded_channel::<()>();
    let started = detector.start(move || {
        let _ = clap_tx.send(());
    });
    if !started.success {
        return Err(anyhow!(started
            .message
            .unwrap_or_else(|| "Could not start listening".to_string())));
    }

    println!(
        "Listening for claps (threshold {:.2}, cooldown {} ms). Press Ctrl-C to stop.",
        detector.threshold(),
        detector.cooldown_period().as_millis()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let end = relay_claps(bridge, &mut clap_rx, shutdown).await;
    detector.stop();

    match end {
        RelayEnd::Shutdown => Ok(()),
        // The worker dropped its handler: it gave up on the microphone
        RelayEnd::DetectorStopped => {
            Err(anyhow!("Clap detection stopped unexpectedly; see the log above"))
        }
    }
}

fn print_devices() -> Result<()> {
    let devices = list_input_devices().context("Failed to list input devices")?;
    if devices.is_empty() {
        println!("No input devices found");
    }
    for device in devices {
        println!(
            "{}{} [{}] {} ch, {:?} Hz",
            if device.is_default { "* " } else { "  " },
            device.name,
            device.host,
            device.max_channels,
            device.sample_rates
        );
    }
    Ok(())
}
