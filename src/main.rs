use melty_controller::domain::control::{ControlLoop, ControlSettings, RadiusLimits};
use melty_controller::domain::settings::{
    JsonPreferenceStore, MemoryPreferenceStore, PreferenceStore, SettingsService,
};
use melty_controller::infrastructure::bluetooth::connection::ConnectionConfig;
use melty_controller::infrastructure::bluetooth::simulated::SimulatedTransport;
use melty_controller::infrastructure::bluetooth::LinkService;
use melty_controller::infrastructure::logging;
use melty_controller::infrastructure::sensor::sample_channel;
use melty_controller::presentation::app::ConsoleApp;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            eprintln!("Failed to write default settings: {}", e);
        }
    }
    let settings = settings_service.get().clone();

    let base_dir = settings_service.path().parent().unwrap_or(Path::new("."));
    let _logging_guard = logging::init_logger(&settings.log_settings, base_dir)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Melty Controller");

    let preferences: Box<dyn PreferenceStore> = match JsonPreferenceStore::new() {
        Ok(store) => Box::new(store),
        Err(e) => {
            warn!("Preferences unavailable, not persisting: {}", e);
            Box::new(MemoryPreferenceStore::default())
        }
    };
    let limits = RadiusLimits::from(&settings);
    let control_settings = Arc::new(Mutex::new(ControlSettings::load(
        preferences.as_ref(),
        limits,
    )));

    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (link_service, link) = LinkService::new(
        |events| SimulatedTransport::new(&settings, events),
        ConnectionConfig::from(&settings),
        app_tx,
    )
    .map_err(|e| {
        error!("{}", e);
        e
    })?;
    let link_task = tokio::spawn(link_service.run(shutdown_rx.clone()));

    let (sensor, samples) = sample_channel();
    let control = ControlLoop::new(
        control_settings.clone(),
        samples,
        link.clone(),
        preferences,
        limits,
        Duration::from_millis(settings.tick_interval_ms.max(1)),
        Duration::from_millis(settings.heartbeat_interval_ms),
    );
    let outputs = control.subscribe();
    let control_task = tokio::spawn(control.run(shutdown_rx));

    let app = ConsoleApp::new(control_settings, link, sensor, app_rx, outputs);
    let stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = app.run(stdin) => {
            if let Err(e) = result {
                error!("Console failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(link_task, control_task);
    info!("Melty Controller stopped");
    Ok(())
}
