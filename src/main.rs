use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medimg_ingest::{
    catalog::Catalog,
    config::Config,
    enums::{Axis, ImageType},
    ingest::{IngestRequest, Ingestor, UploadedFile},
    record::Linkage,
    repository::{RecordStore, SqliteRecordStore},
    storage::{FilesystemBlobStore, KeyGenerator, PublicUrls, StorageSink},
};

/// Ingest medical images and browse the stored slices
#[derive(Parser, Debug)]
#[command(name = "medimg-ingest")]
#[command(version)]
struct Args {
    /// TOML configuration file; defaults apply when absent
    #[arg(short, long, env = "MEDIMG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect, slice, store and record one file
    Ingest {
        file: PathBuf,

        /// Display name; the file stem when omitted
        #[arg(long)]
        name: Option<String>,

        /// X-ray, CT, MRI, PET, US or Other
        #[arg(long = "type", default_value = "Other")]
        image_type: ImageType,

        #[arg(long)]
        creator: i64,

        #[arg(long)]
        patient: Option<i64>,

        #[arg(long)]
        department: Option<i64>,

        #[arg(long = "case")]
        case_id: Option<i64>,

        #[arg(long)]
        note: Option<String>,
    },

    /// Show the source and preview URLs of a record
    Preview {
        id: i64,

        /// x, y or z; volumes default to z
        #[arg(long)]
        axis: Option<Axis>,
    },

    /// List the roots a creator has ingested
    List {
        #[arg(long)]
        creator: i64,
    },

    /// Replace or clear the note on a root
    Note {
        id: i64,

        #[arg(long)]
        creator: i64,

        /// Clears the note when omitted
        text: Option<String>,
    },

    /// Delete a root and its generated slices
    Delete {
        id: i64,

        #[arg(long)]
        creator: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store: Arc<dyn RecordStore> = Arc::new(
        SqliteRecordStore::open(&config.database_path)
            .await
            .context("Failed to open image database")?,
    );

    match args.command {
        Command::Ingest {
            file,
            name,
            image_type,
            creator,
            patient,
            department,
            case_id,
            note,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = name.unwrap_or_else(|| display_name(&file));
            info!("Ingesting {} ({} bytes)", file.display(), bytes.len());

            let blobs = FilesystemBlobStore::new(config.storage.root.clone());
            let sink = StorageSink::new(Arc::new(blobs), KeyGenerator::new(config.storage.key_prefix.clone()));
            let ingestor = Ingestor::new(sink, store, config.ingest_settings());
            let filename = file.file_name().map(|n| n.to_string_lossy().into_owned());

            let graph = ingestor
                .ingest(IngestRequest {
                    file: Some(UploadedFile::new(bytes, filename)),
                    name,
                    image_type,
                    creator_id: creator,
                    linkage: Linkage {
                        patient_id: patient,
                        department_id: department,
                        case_id,
                    },
                    note,
                })
                .await?;
            print_json(&graph)
        }
        Command::Preview { id, axis } => print_json(&catalog(&config, store).preview(id, axis).await?),
        Command::List { creator } => print_json(&catalog(&config, store).list_roots(creator).await?),
        Command::Note { id, creator, text } => {
            print_json(&catalog(&config, store).update_note(id, creator, text.as_deref()).await?)
        }
        Command::Delete { id, creator } => {
            let removed = catalog(&config, store).delete_root(id, creator).await?;
            print_json(&serde_json::json!({ "id": id, "removed": removed }))
        }
    }
}

fn catalog(config: &Config, store: Arc<dyn RecordStore>) -> Catalog {
    Catalog::new(store, PublicUrls::new(config.storage.public_base_url.clone()))
}

/// File name without any of its extensions (`head.nii.gz` → `head`).
fn display_name(path: &Path) -> String {
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    match file_name.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_owned(),
        _ => file_name,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
