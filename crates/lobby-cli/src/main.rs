use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lobby_hw::{Camera, FrameSource, NetworkSource};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lobby", about = "Lobby recognition daemon CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a reference photo
    Enroll {
        /// Image file holding exactly one face
        image: PathBuf,
        #[arg(short, long)]
        name: String,
        /// Shown under the name on the displays
        #[arg(short, long, default_value = "")]
        title: String,
        /// Person id; generated when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Remove an enrolled person
    Delete { id: String },
    /// Detect and match faces in an image without announcing anyone
    Detect { image: PathBuf },
    /// List enrolled people
    List,
    /// Start detection
    Start {
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Stop detection
    Stop {
        /// Stop even while displays or sessions are connected
        #[arg(short, long)]
        force: bool,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Show daemon and detection status
    Status,
    /// Show the most recent recognition
    Latest,
    /// Check admin credentials
    Login {
        id: String,
        #[arg(short, long)]
        password: String,
    },
    /// Show or change the camera source
    Camera {
        #[command(subcommand)]
        source: Option<CameraCommand>,
    },
    /// Grab one frame from a camera source
    TestCamera {
        /// Open the device from this process instead of asking the daemon
        #[arg(long)]
        direct: bool,
        /// Local device index (/dev/videoN)
        #[arg(long, conflicts_with = "url")]
        device: Option<u32>,
        /// Network stream URL
        #[arg(long)]
        url: Option<String>,
        /// Save the grabbed frame (direct mode only)
        #[arg(long, requires = "direct")]
        save: Option<PathBuf>,
    },
    /// List local V4L2 capture devices
    Devices,
    /// Change display theming
    Theme(ThemeArgs),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum CameraCommand {
    /// Local camera 0
    Default,
    /// Local camera by index
    Device { index: u32 },
    /// Network stream
    Network { url: String },
    /// Frames only from interactive sessions
    Push,
}

#[derive(clap::Args, Debug, Default)]
struct ThemeArgs {
    /// Seconds a recognition stays on screen
    #[arg(long)]
    timer: Option<u32>,
    #[arg(long)]
    background_color: Option<String>,
    #[arg(long)]
    font_color: Option<String>,
    #[arg(long)]
    font_family: Option<String>,
    /// small, medium or large
    #[arg(long)]
    font_size: Option<String>,
    /// Background image path on the display host
    #[arg(long)]
    background_image: Option<String>,
    #[arg(long)]
    use_background_image: Option<bool>,
}

#[zbus::proxy(
    interface = "io.lobby.Lobby1",
    default_service = "io.lobby.Lobby1",
    default_path = "/io/lobby/Lobby1"
)]
trait Lobby {
    async fn enroll(&self, id: &str, name: &str, title: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn delete_person(&self, id: &str) -> zbus::Result<bool>;
    async fn list_people(&self) -> zbus::Result<String>;
    async fn detect_image(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn start_detection(&self, actor: &str) -> zbus::Result<String>;
    async fn stop_detection(&self, actor: &str, force: bool) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn poll_latest_recognition(&self) -> zbus::Result<String>;
    async fn login(&self, id: &str, password: &str) -> zbus::Result<String>;
    async fn get_settings(&self) -> zbus::Result<String>;
    async fn set_camera(&self, camera: &str) -> zbus::Result<String>;
    async fn set_display(&self, display: &str) -> zbus::Result<String>;
    async fn test_camera(&self, camera: &str) -> zbus::Result<String>;
}

fn camera_json(command: &CameraCommand) -> Value {
    match command {
        CameraCommand::Default => serde_json::json!({ "source": "default" }),
        CameraCommand::Device { index } => serde_json::json!({ "source": "device", "device_index": index }),
        CameraCommand::Network { url } => serde_json::json!({ "source": "network", "url": url }),
        CameraCommand::Push => serde_json::json!({ "source": "push" }),
    }
}

/// Overlay the given theme fields onto the current display settings.
fn apply_theme(display: &mut Value, theme: &ThemeArgs) -> Result<()> {
    let Some(fields) = display.as_object_mut() else {
        bail!("daemon returned malformed display settings");
    };
    if let Some(timer) = theme.timer {
        fields.insert("timer".into(), timer.into());
    }
    let strings = [
        ("background_color", &theme.background_color),
        ("font_color", &theme.font_color),
        ("font_family", &theme.font_family),
        ("font_size", &theme.font_size),
        ("background_image", &theme.background_image),
    ];
    for (key, value) in strings {
        if let Some(value) = value {
            fields.insert(key.into(), value.clone().into());
        }
    }
    if let Some(use_image) = theme.use_background_image {
        fields.insert("use_background_image".into(), use_image.into());
    }
    Ok(())
}

fn print_json(json: &str) -> Result<()> {
    let value: Value = serde_json::from_str(json).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Grab a single frame without going through the daemon.
fn direct_test(device: Option<u32>, url: Option<String>, save: Option<PathBuf>) -> Result<()> {
    let mut source: Box<dyn FrameSource> = match url {
        Some(url) => Box::new(NetworkSource::open(&url, Duration::from_secs(5))?),
        None => Box::new(Camera::open(device.unwrap_or(0))?),
    };
    println!("Opened {}", source.describe());

    let frame = source.read_frame()?;
    println!("Camera working: {}x{}", frame.width(), frame.height());

    if let Some(path) = save {
        frame
            .save(&path)
            .with_context(|| format!("saving frame to {}", path.display()))?;
        println!("Frame saved to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Commands that never touch the daemon.
    match &cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for device in devices {
                println!("{}  {}  ({})", device.path, device.name, device.driver);
            }
            return Ok(());
        }
        Commands::TestCamera {
            direct: true,
            device,
            url,
            save,
        } => {
            let (device, url, save) = (*device, url.clone(), save.clone());
            return tokio::task::spawn_blocking(move || direct_test(device, url, save)).await?;
        }
        _ => {}
    }

    let connection = if cli.system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    let proxy = LobbyProxy::new(&connection)
        .await
        .context("lobbyd is not reachable on D-Bus")?;
    tracing::debug!(system = cli.system, "connected to lobbyd");

    match cli.command {
        Commands::Enroll { image, name, title, id } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let reply = proxy.enroll(id.as_deref().unwrap_or(""), &name, &title, bytes).await?;
            print_json(&reply)?;
        }
        Commands::Delete { id } => {
            if proxy.delete_person(&id).await? {
                println!("Deleted {id}");
            } else {
                bail!("no person with id {id}");
            }
        }
        Commands::List => print_json(&proxy.list_people().await?)?,
        Commands::Detect { image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            print_json(&proxy.detect_image(bytes).await?)?;
        }
        Commands::Start { actor } => print_json(&proxy.start_detection(&actor).await?)?,
        Commands::Stop { force, actor } => print_json(&proxy.stop_detection(&actor, force).await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Latest => print_json(&proxy.poll_latest_recognition().await?)?,
        Commands::Login { id, password } => print_json(&proxy.login(&id, &password).await?)?,
        Commands::Camera { source } => match source {
            Some(source) => {
                let reply = proxy.set_camera(&camera_json(&source).to_string()).await?;
                let settings: Value = serde_json::from_str(&reply)?;
                println!("{}", serde_json::to_string_pretty(&settings["camera"])?);
            }
            None => {
                let settings: Value = serde_json::from_str(&proxy.get_settings().await?)?;
                println!("{}", serde_json::to_string_pretty(&settings["camera"])?);
            }
        },
        Commands::TestCamera { device, url, .. } => {
            let camera = match (device, url) {
                (Some(index), _) => camera_json(&CameraCommand::Device { index }).to_string(),
                (None, Some(url)) => camera_json(&CameraCommand::Network { url }).to_string(),
                (None, None) => String::new(),
            };
            print_json(&proxy.test_camera(&camera).await?)?;
        }
        Commands::Theme(theme) => {
            let settings: Value = serde_json::from_str(&proxy.get_settings().await?)?;
            let mut display = settings["display"].clone();
            apply_theme(&mut display, &theme)?;
            let reply: Value = serde_json::from_str(&proxy.set_display(&display.to_string()).await?)?;
            println!("{}", serde_json::to_string_pretty(&reply["display"])?);
        }
        // Handled before connecting.
        Commands::Devices => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_json_matches_settings_shape() {
        assert_eq!(
            camera_json(&CameraCommand::Device { index: 2 }),
            serde_json::json!({ "source": "device", "device_index": 2 })
        );
        assert_eq!(camera_json(&CameraCommand::Default)["source"], "default");
    }

    #[test]
    fn test_theme_only_overrides_given_fields() {
        let mut display = serde_json::json!({
            "timer": 5,
            "background_color": "#FFE8D4",
            "font_color": "#032F5C",
        });
        let theme = ThemeArgs {
            timer: Some(8),
            font_color: Some("#000000".into()),
            ..ThemeArgs::default()
        };
        apply_theme(&mut display, &theme).unwrap();
        assert_eq!(display["timer"], 8);
        assert_eq!(display["font_color"], "#000000");
        assert_eq!(display["background_color"], "#FFE8D4");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["lobby", "stop", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Stop { force: true, .. }));

        let cli = Cli::try_parse_from(["lobby", "camera", "network", "rtsp://cam/1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Camera { source: Some(CameraCommand::Network { .. }) }
        ));
        assert!(Cli::try_parse_from(["lobby", "test-camera", "--save", "x.png"]).is_err());

        let cli = Cli::try_parse_from(["lobby", "detect", "visitor.jpg"]).unwrap();
        assert!(matches!(cli.command, Commands::Detect { image } if image == PathBuf::from("visitor.jpg")));
    }
}
