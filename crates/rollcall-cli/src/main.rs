use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod setup;

#[zbus::proxy(
    interface = "org.freedesktop.Rollcall1",
    default_service = "org.freedesktop.Rollcall1",
    default_path = "/org/freedesktop/Rollcall1"
)]
trait Rollcall {
    async fn enroll(&self, name: &str, reference: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn mark_attendance(&self, reference: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn mark_attendance_sequence(
        &self,
        reference: &str,
        frames: Vec<Vec<u8>>,
    ) -> zbus::Result<String>;
    async fn history(&self, reference: &str, limit: u32) -> zbus::Result<String>;
    async fn daily_report(&self, date: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, reference: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-verified attendance", version)]
struct Cli {
    /// Talk to a daemon on the session bus (development mode).
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the ONNX model files.
    Setup {
        /// Target directory (default: system or user model directory).
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Enroll an identity from a face image.
    Enroll {
        /// Display name.
        name: String,
        /// External identifier attendance is keyed on (roll number, badge ID).
        reference: String,
        /// Path to the face image.
        image: PathBuf,
    },
    /// Mark attendance. One image runs the eyes-closed check; three or more
    /// run blink-count liveness over the sequence.
    Mark {
        reference: String,
        /// Capture frames in temporal order.
        #[arg(num_args = 1.., required = true)]
        images: Vec<PathBuf>,
    },
    /// Show attendance history for an identity.
    History {
        reference: String,
        #[arg(long, default_value_t = 30)]
        limit: u32,
    },
    /// Show everyone who attended on a date (default: today).
    Report {
        /// Date as YYYY-MM-DD.
        #[arg(long, default_value = "")]
        date: String,
    },
    /// List enrolled identities.
    List,
    /// Remove an identity and its attendance history.
    Remove { reference: String },
    /// Show daemon status.
    Status,
}

fn read_image(path: &PathBuf) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

/// Re-serialize a JSON reply for the terminal; fall back to the raw string.
fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default()),
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let Cli { session, command } = Cli::parse();

    // Setup needs no daemon.
    let command = match command {
        Command::Setup { model_dir } => return setup::run(model_dir),
        other => other,
    };

    let connection = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to the bus — is rollcalld running?")?;
    let proxy = RollcallProxy::new(&connection).await?;

    match command {
        Command::Setup { .. } => unreachable!("handled above"),
        Command::Enroll {
            name,
            reference,
            image,
        } => {
            let id = proxy
                .enroll(&name, &reference, read_image(&image)?)
                .await
                .context("enroll failed")?;
            println!("enrolled {name} ({reference}): {id}");
        }
        Command::Mark { reference, images } => {
            let frames: Vec<Vec<u8>> = images
                .iter()
                .map(read_image)
                .collect::<Result<Vec<_>>>()?;
            let reply = if frames.len() == 1 {
                proxy
                    .mark_attendance(&reference, frames.into_iter().next().unwrap())
                    .await
            } else if frames.len() >= 3 {
                proxy.mark_attendance_sequence(&reference, frames).await
            } else {
                bail!(
                    "blink detection needs at least 3 frames (got {}); pass 1 or 3+ images",
                    frames.len()
                );
            }
            .context("attendance attempt failed")?;
            print_json(&reply);
        }
        Command::History { reference, limit } => {
            print_json(&proxy.history(&reference, limit).await?);
        }
        Command::Report { date } => {
            print_json(&proxy.daily_report(&date).await?);
        }
        Command::List => {
            print_json(&proxy.list_identities().await?);
        }
        Command::Remove { reference } => {
            if proxy.remove_identity(&reference).await? {
                println!("removed {reference}");
            } else {
                println!("{reference} not found");
            }
        }
        Command::Status => {
            print_json(&proxy.status().await?);
        }
    }

    Ok(())
}
