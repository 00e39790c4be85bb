use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::detector::FaceDetector;
use rollcall_core::embedder::FaceEmbedder;
use rollcall_core::gallery::Gallery;
use rollcall_core::types::Embedding;
use rollcall_core::Frame;
use rollcall_session::attendance::late_label;
use rollcall_session::cooldown::CooldownEngine;
use rollcall_session::session::{RegistrationContext, Registrar, Session};
use rollcall_session::stream::{FrameSource, StreamConfig, StreamController};
use rollcall_session::tracker::Tracker;
use rollcall_session::Config;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Camera-based attendance tracking CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an identity from a face photo
    Register {
        /// Identity name
        identity: String,
        /// Path to an image containing one face
        image: PathBuf,
    },
    /// Remove a registered identity
    Remove { identity: String },
    /// List registered identities
    List,
    /// Run an attendance session over a directory of frames
    Watch {
        /// Directory of image frames, processed in sorted order
        frames: PathBuf,
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
        Commands::Register { identity, image } => register(&config, &identity, &image),
        Commands::Remove { identity } => remove(&config, &identity),
        Commands::List => list(&config),
        Commands::Watch { frames } => watch(&config, &frames).await,
    }
}

/// The gallery snapshot lives as a plain JSON map next to the models.
fn gallery_path(config: &Config) -> PathBuf {
    config.model_dir.join("../gallery.json")
}

fn load_gallery(config: &Config) -> Result<Arc<Gallery>> {
    let gallery = Arc::new(Gallery::new(config.similarity_threshold));
    let path = gallery_path(config);
    if path.exists() {
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let entries: HashMap<String, Vec<f32>> = serde_json::from_str(&data)?;
        for (identity, values) in entries {
            gallery.register(&identity, Embedding::from_raw(values));
        }
    }
    Ok(gallery)
}

fn persist(config: &Config, gallery: &Gallery) -> Result<()> {
    let mut snapshot: HashMap<String, Vec<f32>> = HashMap::new();
    for identity in gallery.identities() {
        if let Some(embedding) = gallery.embedding_of(&identity) {
            snapshot.insert(identity, embedding.values);
        }
    }

    let path = gallery_path(config);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
    Ok(())
}

fn load_frame(path: &Path) -> Result<Frame> {
    let img = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_luma8();
    Ok(Frame::new(
        img.as_raw().clone(),
        img.width(),
        img.height(),
    ))
}

fn register(config: &Config, identity: &str, image: &Path) -> Result<()> {
    let frame = load_frame(image)?;

    let mut detector = FaceDetector::load(&config.scrfd_model_path(), config.detector_config())?;
    let detections = detector.detect(&frame)?;
    let Some(face) = detections.first() else {
        bail!("no face detected in {}", image.display());
    };
    let Some(landmarks) = face.landmarks else {
        bail!("detected face has no landmarks; cannot align for registration");
    };

    let embedder = FaceEmbedder::load(&config.arcface_model_path())?;
    let gallery = load_gallery(config)?;
    let mut registrar = Registrar::new(embedder, Arc::clone(&gallery));

    registrar.register(
        identity,
        &RegistrationContext {
            frame,
            bbox: face.bbox.clone(),
            landmarks,
        },
    )?;

    persist(config, &gallery)?;
    println!("registered {identity} ({} identities total)", gallery.len());
    Ok(())
}

fn remove(config: &Config, identity: &str) -> Result<()> {
    let gallery = load_gallery(config)?;
    if !gallery.remove(identity) {
        bail!("identity not registered: {identity}");
    }
    persist(config, &gallery)?;
    println!("removed {identity}");
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let gallery = load_gallery(config)?;
    let mut identities = gallery.identities();
    identities.sort();
    if identities.is_empty() {
        println!("no identities registered");
    }
    for identity in identities {
        println!("{identity}");
    }
    Ok(())
}

/// Frame source reading images from a directory in sorted order.
struct DirFrameSource {
    paths: Vec<PathBuf>,
    cursor: usize,
}

impl DirFrameSource {
    fn new(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        if paths.is_empty() {
            bail!("no frames found in {}", dir.display());
        }
        Ok(Self { paths, cursor: 0 })
    }
}

impl FrameSource for DirFrameSource {
    async fn next_frame(&mut self, skip: u32) -> Option<Frame> {
        self.cursor += skip as usize;
        while self.cursor < self.paths.len() {
            let path = &self.paths[self.cursor];
            self.cursor += 1;
            match load_frame(path) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping undecodable frame");
                }
            }
        }
        None
    }
}

async fn watch(config: &Config, frames: &Path) -> Result<()> {
    let gallery = load_gallery(config)?;
    if gallery.is_empty() {
        bail!("gallery is empty — register identities first");
    }

    let engine = rollcall_session::spawn_engine(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        config.fas_model_path().as_deref(),
        config.detector_config(),
    )?;

    let source = DirFrameSource::new(frames)?;
    let mut session = Session::new(
        Arc::clone(&gallery),
        Tracker::default(),
        CooldownEngine::new(
            config.cooldown,
            config.non_logging_statuses.clone(),
            &config.source_label,
        ),
    );

    let mut controller = StreamController::new(source, engine, StreamConfig::default());
    controller.wait_ready().await?;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<rollcall_session::AttendanceEvent>(64);
    let scheduled_start = config.scheduled_start;
    let grace = config.late_grace_minutes;

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_value(&event).expect("event serializes");
            if let Some(start) = scheduled_start {
                let label = late_label(event.timestamp, start, grace);
                line["late"] = serde_json::to_value(label).expect("label serializes");
            }
            println!("{line}");
        }
    });

    controller.run(&mut session, tx).await?;
    printer.await?;

    tracing::info!(fps = controller.fps(), "session finished");
    Ok(())
}
