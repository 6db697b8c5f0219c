//! `bountyscan`: operator CLI over the face scan library.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bounty_core::MATCH_THRESHOLD;
use bountyscan::controller::ScanEvent;
use bountyscan::replay::{load_recording, ReplayCamera, ReplayDetector};
use bountyscan::{
    complete_profile, dashboard_gate, reconcile_orphans, spawn_engine, Config, FaceVectorStore,
    FileSessionStorage, IdentityResolver, ProfileFields, ProfileStore, ScanController,
    SessionManager, SqliteStore,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "bountyscan", about = "Face scan onboarding tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full scan against a recorded landmark stream
    Scan {
        /// JSON Lines recording, one array of detections per frame
        #[arg(long)]
        frames: PathBuf,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
        /// Simulate a refused camera permission prompt
        #[arg(long)]
        deny_camera: bool,
    },
    /// Inspect or complete user profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Evaluate the dashboard gate for a user id
    Gate { user_id: Option<String> },
    /// Inspect or clear the local session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Create pending profiles for enrolled faces that have none
    Reconcile,
    /// Print store and session status as JSON
    Status,
}

#[derive(Subcommand)]
enum ProfileAction {
    Show {
        user_id: Uuid,
        /// Count the email address as verified by the sign-in provider
        #[arg(long)]
        email_verified: bool,
    },
    /// Submit the identity form
    Complete {
        user_id: Uuid,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        organization: String,
        #[arg(long, default_value = "")]
        role: String,
        #[arg(long, default_value = "")]
        location: String,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    tracing::debug!(db = %config.db_path.display(), policy = %config.profile_policy, "config loaded");

    match cli.command {
        Command::Scan {
            frames,
            timeout_secs,
            deny_camera,
        } => cmd_scan(&config, frames, Duration::from_secs(timeout_secs), deny_camera).await,
        Command::Profile { action } => cmd_profile(&config, action).await,
        Command::Gate { user_id } => cmd_gate(&config, user_id.as_deref()).await,
        Command::Session { action } => cmd_session(&config, action),
        Command::Reconcile => cmd_reconcile(&config).await,
        Command::Status => cmd_status(&config).await,
    }
}

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

fn sessions(config: &Config) -> SessionManager {
    SessionManager::new(Arc::new(FileSessionStorage::new(&config.session_path)))
}

async fn cmd_scan(
    config: &Config,
    frames: PathBuf,
    timeout: Duration,
    deny_camera: bool,
) -> Result<()> {
    let recording = Arc::new(
        load_recording(&frames)
            .with_context(|| format!("failed to load recording {}", frames.display()))?,
    );
    if recording.is_empty() {
        bail!("recording {} has no frames", frames.display());
    }

    let camera = if deny_camera {
        ReplayCamera::denied(recording.clone())
    } else {
        ReplayCamera::new(recording.clone())
    };
    let engine = spawn_engine(Box::new(camera), Box::new(ReplayDetector::new(recording)))
        .context("failed to start detection engine")?;

    let store = open_store(config).await?;
    let resolver = IdentityResolver::new(
        store.clone(),
        store,
        sessions(config),
        config.profile_policy,
    );

    let (controller, handle, mut events) =
        ScanController::new(Arc::new(engine), Arc::new(resolver), config.scan_settings());

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::Line(line) => println!("{line}"),
                ScanEvent::Status(status) => eprintln!("[{status}]"),
                ScanEvent::Progress(p) => eprintln!("[progress {p}%]"),
                ScanEvent::Fatal(_) | ScanEvent::Reset { .. } | ScanEvent::Resolved(_) => {}
            }
        }
    });

    let mut scan = tokio::spawn(controller.run());
    let outcome = match tokio::time::timeout(timeout, &mut scan).await {
        Ok(joined) => joined.context("scan task failed")?,
        Err(_) => {
            handle.shutdown();
            scan.await.context("scan task failed")?;
            printer.await.ok();
            bail!("scan timed out after {}s", timeout.as_secs());
        }
    };
    printer.await.ok();

    match outcome {
        Some(resolution) => {
            println!("{}", resolution.route);
            Ok(())
        }
        None => bail!("scan stopped without resolving an identity"),
    }
}

async fn cmd_profile(config: &Config, action: ProfileAction) -> Result<()> {
    let store = open_store(config).await?;
    match action {
        ProfileAction::Show {
            user_id,
            email_verified,
        } => {
            let profile = store
                .get(user_id)
                .await
                .context("profile lookup failed")?
                .with_context(|| format!("no profile for {user_id}"))?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            println!(
                "complete ({}): {}",
                config.profile_policy,
                profile.is_complete(config.profile_policy)
            );
            println!("completion: {}%", profile.completion(email_verified));
        }
        ProfileAction::Complete {
            user_id,
            full_name,
            email,
            phone,
            organization,
            role,
            location,
        } => {
            let fields = ProfileFields {
                full_name,
                email,
                phone,
                organization,
                role,
                location,
            };
            let profile = complete_profile(store.as_ref(), user_id, fields)
                .await
                .context("identity form rejected")?;
            println!("profile {} is {}", profile.user_id, profile.account.status.as_str());
        }
    }
    Ok(())
}

async fn cmd_gate(config: &Config, user_id: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let route = dashboard_gate(
        user_id,
        &sessions(config),
        store.as_ref(),
        config.profile_policy,
    )
    .await;
    println!("{route}");
    Ok(())
}

fn cmd_session(config: &Config, action: SessionAction) -> Result<()> {
    let sessions = sessions(config);
    match action {
        SessionAction::Show => match sessions.current().context("failed to read session")? {
            Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
            None => println!("no session"),
        },
        SessionAction::Clear => {
            sessions.clear().context("failed to clear session")?;
            println!("session cleared");
        }
    }
    Ok(())
}

async fn cmd_reconcile(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let repaired = reconcile_orphans(store.as_ref(), store.as_ref())
        .await
        .context("reconciliation failed")?;
    if repaired.is_empty() {
        println!("no orphaned face vectors");
    }
    for user_id in repaired {
        println!("created pending profile for {user_id}");
    }
    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let faces = store.count_faces().await.context("failed to count faces")?;
    let profiles = store
        .count_profiles()
        .await
        .context("failed to count profiles")?;
    let session = sessions(config).current().ok().flatten();

    let status = serde_json::json!({
        "dbPath": config.db_path.display().to_string(),
        "sessionPath": config.session_path.display().to_string(),
        "faces": faces,
        "profiles": profiles,
        "profilePolicy": config.profile_policy.to_string(),
        "matchThreshold": MATCH_THRESHOLD,
        "session": session,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
