use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medface_core::IdentityKey;
use medface_engine::Config;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "medface", about = "medface biometric identity resolution CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) an identity from a reference photo
    Enroll {
        /// Photo showing exactly one face
        #[arg(short, long)]
        photo: PathBuf,
        /// Identity key; a random one is generated when omitted
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Resolve the face in a photo to an enrolled identity
    Verify {
        #[arg(short, long)]
        photo: PathBuf,
    },
    /// Remove an enrolled identity
    Remove {
        /// Identity key to remove
        key: String,
    },
    /// List enrolled identities
    List,
    /// Show engine configuration and enrollment count
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    tracing::debug!(db = %config.db_path.display(), workers = config.workers, "configuration loaded");
    let engine = medface_engine::start(&config).context("starting engine")?;

    match cli.command {
        Commands::Enroll { photo, key } => {
            let key = key.map(IdentityKey::from).unwrap_or_else(IdentityKey::generate);
            let image = read_photo(&photo)?;
            let record = engine.enroll(key, image).await?;
            print_json(&serde_json::json!({
                "identity_key": record.identity_key,
                "enrolled_at": record.enrolled_at,
            }))?;
        }
        Commands::Verify { photo } => {
            let image = read_photo(&photo)?;
            let result = engine.verify(image).await?;
            print_json(&result)?;
            if !result.is_match() {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Remove { key } => {
            let removed = engine.remove(&IdentityKey::from(key.as_str()))?;
            print_json(&serde_json::json!({ "identity_key": key, "removed": removed }))?;
        }
        Commands::List => {
            let records: Vec<_> = engine
                .list()?
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "identity_key": r.identity_key,
                        "enrolled_at": r.enrolled_at,
                    })
                })
                .collect();
            print_json(&records)?;
        }
        Commands::Status => {
            let mut status = serde_json::to_value(engine.status()?)?;
            status["db_path"] = config.db_path.display().to_string().into();
            status["encrypted"] = config.store_key.is_some().into();
            print_json(&status)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading photo {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
