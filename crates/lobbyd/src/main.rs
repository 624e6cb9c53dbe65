use anyhow::{Context, Result};
use lobby_core::overlay::OverlayStyle;
use lobby_vision::OnnxVision;
use lobbyd::activation::Activation;
use lobbyd::config::Config;
use lobbyd::dbus_interface::{watch_disconnects, LobbyService};
use lobbyd::directory::Directory;
use lobbyd::settings::SettingsStore;
use lobbyd::transport::DeviceSources;
use lobbyd::vision::spawn_vision;
use lobbyd::{Runtime, RuntimeParts, BUS_NAME, OBJECT_PATH};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lobbyd starting");

    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let settings = SettingsStore::load(&config.settings_path)
        .with_context(|| format!("loading settings from {}", config.settings_path.display()))?;
    let directory = Directory::open(&config.db_path)
        .await
        .with_context(|| format!("opening directory at {}", config.db_path.display()))?;
    let activation = Activation::load(&config.state_path)
        .with_context(|| format!("loading activation state from {}", config.state_path.display()))?;

    let model = OnnxVision::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let vision = spawn_vision(model)?;

    let style = match &config.font_path {
        Some(path) => OverlayStyle::default()
            .with_font_file(path)
            .with_context(|| format!("loading font {}", path.display()))?,
        None => {
            tracing::warn!("LOBBY_FONT_PATH not set; overlay boxes are drawn without labels");
            OverlayStyle::default()
        }
    };

    let runtime = Runtime::start(RuntimeParts {
        settings,
        directory,
        activation,
        vision,
        sources: Arc::new(DeviceSources),
        style,
    })
    .await?;

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, LobbyService::new(Arc::clone(&runtime)))?
        .build()
        .await
        .context("registering on D-Bus")?;
    let watcher = watch_disconnects(&connection, Arc::clone(&runtime))
        .await
        .context("watching bus clients")?;

    tracing::info!(bus = BUS_NAME, system_bus = config.system_bus, "lobbyd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("lobbyd shutting down");
    watcher.abort();
    runtime.shutdown();

    Ok(())
}
