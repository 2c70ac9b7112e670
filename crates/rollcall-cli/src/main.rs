use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{BackendReport, IdentityId};
use rollcall_hw::Camera;
use rollcalld::backend::{SessionBackend, SessionSource};
use rollcalld::store::EmbeddingStore;
use rollcalld::Config;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the session the backend currently reports as active
    Status,
    /// Ask the backend to stop a session
    Stop {
        /// Class id of the session to stop
        class_id: String,
    },
    /// Show which student ids have enrolled faces
    Roster {
        /// Student ids to look up
        #[arg(required = true)]
        ids: Vec<IdentityId>,
    },
    /// Run camera diagnostics
    Test {
        /// Capture device (defaults to ROLLCALL_CAMERA_DEVICE)
        #[arg(short, long)]
        device: Option<String>,
        /// Save the captured frame as JPEG
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Status => {
            let backend = SessionBackend::new(&config.api_base, config.http_timeout())?;
            let report = backend
                .get_active_session()
                .await
                .with_context(|| format!("querying {}", config.api_base))?;
            match report {
                BackendReport::Inactive => println!("No active session"),
                BackendReport::ActiveUnidentified => {
                    println!("A session is active but the backend did not name its class")
                }
                BackendReport::Active(active) => {
                    println!("Active session: {}", active.session_id);
                    println!("  roster:     {} students", active.roster.len());
                    println!(
                        "  start time: {}",
                        active.start_time.as_deref().unwrap_or("(not set)")
                    );
                }
            }
        }
        Commands::Stop { class_id } => {
            let backend = SessionBackend::new(&config.api_base, config.http_timeout())?;
            backend
                .notify_session_stopped(&class_id)
                .await
                .with_context(|| format!("stopping session {class_id}"))?;
            println!("Stop requested for session {class_id}");
        }
        Commands::Roster { ids } => {
            let store = EmbeddingStore::open(&config.db_path)
                .with_context(|| format!("opening {}", config.db_path.display()))?;
            let wanted: HashSet<IdentityId> = ids.iter().cloned().collect();
            let roster = store.load_roster(&wanted)?;

            let counts: HashMap<&str, usize> = roster
                .bank
                .iter()
                .map(|(id, embeddings)| (id.as_str(), embeddings.len()))
                .collect();

            for id in &ids {
                let name = roster
                    .profiles
                    .get(id)
                    .map(|p| p.display_name(id))
                    .unwrap_or_else(|| "-".to_string());
                match counts.get(id.as_str()) {
                    Some(n) => println!("{id:<16} {name:<32} {n} embeddings"),
                    None => println!("{id:<16} {name:<32} NOT ENROLLED"),
                }
            }
            println!("{}/{} enrolled", roster.bank.len(), wanted.len());
        }
        Commands::Test { device, save } => {
            println!("Running camera diagnostics...");
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in &devices {
                println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }

            let device = device.unwrap_or(config.camera_device);
            let camera = Camera::open(&device).with_context(|| format!("opening {device}"))?;
            let frame = camera.capture_frame()?;
            println!(
                "Captured {}x{} frame #{} from {device} ({:?}), mean brightness {:.1}",
                frame.width(),
                frame.height(),
                frame.sequence,
                camera.pixel_format(),
                frame.avg_brightness()
            );

            if let Some(path) = save {
                frame
                    .image
                    .save_with_format(&path, image::ImageFormat::Jpeg)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Saved frame to {}", path.display());
            }
        }
    }

    Ok(())
}
