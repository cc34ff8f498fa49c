use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use selfie_capture::{avatar_key, Config, SqliteAvatarStore, StillImage};
use tracing_subscriber::EnvFilter;

mod setup;

#[derive(Parser)]
#[command(name = "selfie", version, about = "Selfie capture: models, avatars, configuration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the landmark model files listed in a manifest
    Setup {
        /// Model manifest (default: $SELFIE_MODEL_MANIFEST)
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Target directory (default: $SELFIE_MODEL_DIR or the data directory)
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Check installed model files against a manifest
    VerifyModels {
        #[arg(long)]
        manifest: Option<PathBuf>,
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Commit an image file as a user's avatar (not liveness-verified)
    Attach {
        #[arg(long)]
        user: String,
        /// Image in any supported format; re-encoded as JPEG
        file: PathBuf,
    },
    /// Show a user's current avatar
    Avatar {
        #[arg(long)]
        user: String,
        /// Write the stored JPEG to this path
        #[arg(long)]
        export: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Setup {
            manifest,
            model_dir,
        } => {
            let manifest = manifest_path(manifest, &config)?;
            let dir = model_dir.unwrap_or_else(|| setup::model_dir_for(&config));
            tokio::task::spawn_blocking(move || setup::run(&manifest, &dir)).await??;
        }
        Command::VerifyModels {
            manifest,
            model_dir,
        } => {
            let manifest = manifest_path(manifest, &config)?;
            let dir = model_dir.unwrap_or_else(|| setup::model_dir_for(&config));
            let count = setup::verify(&manifest, &dir)?;
            println!("{count} model(s) verified in {}", dir.display());
        }
        Command::Attach { user, file } => attach(&config, &user, &file).await?,
        Command::Avatar { user, export, json } => {
            show_avatar(&config, &user, export, json).await?
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn manifest_path(arg: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    match arg.or_else(|| config.model_manifest.clone()) {
        Some(path) => Ok(path),
        None => bail!("no model manifest: pass --manifest or set SELFIE_MODEL_MANIFEST"),
    }
}

async fn attach(config: &Config, user: &str, file: &std::path::Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let quality = config.jpeg_quality;
    let still = tokio::task::spawn_blocking(move || StillImage::from_file_bytes(&bytes, quality))
        .await?
        .with_context(|| format!("{} is not a supported image", file.display()))?;

    let store = SqliteAvatarStore::open(&config.db_path, &config.public_base_url).await?;
    let key = avatar_key(user, &uuid::Uuid::new_v4());
    let public_ref = store.put_blob(&key, still.jpeg).await?;
    store.set_avatar_ref(user, &public_ref).await?;

    tracing::info!(user, %public_ref, width = still.width, height = still.height, "avatar attached");
    println!("{public_ref}");
    Ok(())
}

async fn show_avatar(
    config: &Config,
    user: &str,
    export: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let store = SqliteAvatarStore::open(&config.db_path, &config.public_base_url).await?;
    let Some(avatar) = store.avatar_for(user).await? else {
        bail!("no avatar for user {user}");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&avatar)?);
    } else {
        println!("user:    {}", avatar.user_id);
        println!("avatar:  {}", avatar.public_ref);
        println!("updated: {}", avatar.updated_at);
    }

    if let Some(path) = export {
        let Some(key) = store.key_for_ref(&avatar.public_ref) else {
            bail!("avatar {} is not held in this store", avatar.public_ref);
        };
        let Some(bytes) = store.get_blob(key).await? else {
            bail!("avatar blob {key} is missing");
        };
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("exported to {}", path.display());
    }

    Ok(())
}
