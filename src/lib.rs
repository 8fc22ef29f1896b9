pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod meter;
pub mod packet_buffer;
pub mod protocol;
pub mod services;
pub mod store;
pub mod stream;

use clap::Parser;
use env_logger::Env;

use crate::capture::{CaptureSource, DeviceSelector};
use crate::cli::Args;
use crate::config::{get_config_path, load_config};
use crate::meter::Meter;

pub fn run() -> Result<(), String> {
    let args = Args::parse();
    let config_path = get_config_path(args.config.as_deref());
    let loaded = load_config(&config_path);

    // RUST_LOG wins over the configured level
    let level = loaded.as_ref().map(|c| c.log_level.as_str()).unwrap_or("info");
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let config = loaded.map_err(|e| e.to_string())?;
    log::info!("Loaded config from {}", config_path.display());

    if args.list_devices {
        let devices = CaptureSource::list_devices().map_err(|e| e.to_string())?;
        let json = serde_json::to_string_pretty(&devices).map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(());
    }

    let selector: DeviceSelector = match args.device.as_deref() {
        Some(device) => device.parse(),
        None => config.device.parse(),
    }
    .map_err(|_| "error: invalid device".to_string())?;

    let meter = Meter::new(config);
    if let Err(e) = meter.start(&selector) {
        // The REPL stays usable; `switch` can retry
        log::error!("Capture did not start: {}", e);
    }

    let notices = meter.notices();
    std::thread::spawn(move || {
        for notice in notices.iter() {
            match serde_json::to_string(&notice) {
                Ok(json) => log::info!("{}", json),
                Err(e) => log::warn!("Unprintable notice {:?}: {}", notice, e),
            }
        }
    });

    let result = cli::run_repl(&meter);
    meter.stop();
    result
}
