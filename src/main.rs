//! epaper-frame: convert photos and manage a BLE e-paper photo frame.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use epaper_frame as frame;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use frame::config::FrameConfig;
use frame::{ColorMode, FrameError, FrameSession, Orientation, SessionEvent, UploadRequest, UploadState};

/// Convert photos for an e-paper frame and manage it over Bluetooth LE.
#[derive(Parser)]
#[command(name = "epaper-frame", version)]
struct Cli {
    /// Config file (defaults to the per-user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List nearby frames
    Scan,
    /// Dither an image offline and write the packed buffer
    Convert {
        image: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        preview: Option<PathBuf>,
        #[command(flatten)]
        opts: ImageOpts,
    },
    /// Talk to a frame
    Device {
        /// Peripheral id or address, as printed by `scan`
        #[arg(long)]
        id: String,
        #[command(subcommand)]
        action: DeviceAction,
    },
}

#[derive(Subcommand)]
enum DeviceAction {
    /// Storage and panel info
    Info,
    /// Images stored on the frame
    List,
    /// Show an image now
    Show { name: String },
    Next,
    Prev,
    Delete { name: String },
    DeleteAll,
    /// Slideshow settings
    Settings,
    Slideshow { state: Toggle },
    Interval { minutes: u32 },
    Restart,
    Sleep,
    /// Drop a half-finished upload
    Cancel,
    /// Dither an image and upload it
    Upload {
        image: PathBuf,
        /// Name on the frame (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        opts: ImageOpts,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Color,
    Bw,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrientationArg {
    Horizontal,
    Vertical,
}

#[derive(clap::Args)]
struct ImageOpts {
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long, value_enum)]
    orientation: Option<OrientationArg>,
}

impl ImageOpts {
    fn resolve(&self, config: &FrameConfig) -> (ColorMode, Orientation) {
        let mode = match self.mode {
            Some(ModeArg::Color) => ColorMode::Color,
            Some(ModeArg::Bw) => ColorMode::BlackWhite,
            None => config.image.color_mode,
        };
        let orientation = match self.orientation {
            Some(OrientationArg::Horizontal) => Orientation::Horizontal,
            Some(OrientationArg::Vertical) => Orientation::Vertical,
            None => config.image.orientation,
        };
        (mode, orientation)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("error: {e}");
            if let Some((sent, total)) = e.upload_offset() {
                let percent = if total == 0 { 0 } else { sent * 100 / total };
                eprintln!("stopped at {sent}/{total} bytes ({percent}%)");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> frame::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config_path = cli.config.clone().unwrap_or_else(FrameConfig::default_path);
    tracing::debug!("config path: {}", config_path.display());
    let config = FrameConfig::load(&config_path)?;

    match cli.command {
        Command::Scan => {
            let found = frame::scan(&config.ble).await?;
            if found.is_empty() {
                println!("No frames found. Is the frame awake and advertising?");
            }
            for (i, f) in found.iter().enumerate() {
                println!(
                    "  {}) id={} addr={} name={:?} rssi={:?}",
                    i + 1,
                    f.id,
                    f.address,
                    f.name,
                    f.rssi
                );
            }
            Ok(())
        }
        Command::Convert {
            image,
            out,
            preview,
            opts,
        } => {
            let (mode, orientation) = opts.resolve(&config);
            let processed = frame::encode_from_path(&image, mode, orientation)?;
            std::fs::write(&out, &processed.packed)?;
            println!("wrote {} bytes to {}", processed.packed.len(), out.display());
            if let Some(path) = preview {
                processed.save_preview(&path)?;
                println!("preview saved to {}", path.display());
            }
            Ok(())
        }
        Command::Device { id, action } => {
            let connected = frame::connect(&id, &config.ble).await?;
            connected.session.add_listener(|event| {
                if let SessionEvent::Disconnected = event {
                    tracing::warn!("frame dropped the connection");
                }
            });
            let result = run_action(&connected.session, action, &config).await;
            if let Err(e) = connected.disconnect().await {
                tracing::warn!("disconnect failed: {e}");
            }
            result
        }
    }
}

async fn run_action(session: &FrameSession, action: DeviceAction, config: &FrameConfig) -> frame::Result<()> {
    match action {
        DeviceAction::Info => {
            let info = session.get_info().await?;
            println!("panel:   {}x{}", info.width, info.height);
            println!("images:  {}/{}", info.image_count, info.max_images);
            println!(
                "storage: {} used, {} free, {} total (bytes)",
                info.used_bytes, info.free_bytes, info.total_bytes
            );
        }
        DeviceAction::List => {
            let images = session.list_images().await?;
            if images.is_empty() {
                println!("(no images)");
            }
            for name in images {
                println!("{name}");
            }
        }
        DeviceAction::Show { name } => session.display_image(&name).await?,
        DeviceAction::Next => session.next_image().await?,
        DeviceAction::Prev => session.prev_image().await?,
        DeviceAction::Delete { name } => session.delete_image(&name).await?,
        DeviceAction::DeleteAll => session.delete_all().await?,
        DeviceAction::Settings => {
            let s = session.get_settings().await?;
            println!("slideshow: {}", if s.slideshow_enabled { "on" } else { "off" });
            println!("interval:  {} min", s.interval_minutes);
            println!("random:    {}", if s.random_order { "yes" } else { "no" });
            println!("showing:   {}", s.current_image_name);
        }
        DeviceAction::Slideshow { state } => session.set_slideshow(matches!(state, Toggle::On)).await?,
        DeviceAction::Interval { minutes } => session.set_interval(minutes).await?,
        DeviceAction::Restart => session.restart().await?,
        DeviceAction::Sleep => session.sleep_now().await?,
        DeviceAction::Cancel => session.cancel_upload().await?,
        DeviceAction::Upload { image, name, opts } => {
            let (mode, orientation) = opts.resolve(config);
            let processed = frame::encode_from_path(&image, mode, orientation)?;
            let name = match name {
                Some(name) => name,
                None => default_name(&image)?,
            };
            let request = UploadRequest::new(&name, processed.packed)?;
            session
                .upload(request, |p| match p.state {
                    UploadState::Transferring => {
                        eprint!("\r{:>3}% {}/{} bytes", p.percent(), p.sent, p.total)
                    }
                    UploadState::Done => eprintln!("\rupload complete          "),
                    _ => {}
                })
                .await?;
            println!("uploaded {name}");
        }
    }
    Ok(())
}

fn default_name(path: &Path) -> frame::Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| format!("{stem}.bin"))
        .ok_or_else(|| FrameError::InvalidName(path.display().to_string()))
}
