use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facelens_core::frame_loop::{annotate, Thresholds};
use facelens_core::perception::frame_from_encoded;
use facelens_core::render::render;
use facelens_core::{
    DefaultFetcher, Fetcher, GalleryBuilder, MatcherCache, ModelRegistry, ModelSet, Perception, RasterSurface, Surface,
};
use facelens_infer::OnnxPerception;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facelens", about = "facelens live face annotation tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Fetch and check the perception models
    Models {
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Enroll reference images and report the result
    Gallery {
        #[command(flatten)]
        models: ModelArgs,
        #[command(flatten)]
        gallery: GalleryArgs,
    },
    /// Detect, match and caption the faces in a still image
    Annotate {
        /// Image to annotate
        input: PathBuf,
        /// Where to write the annotated PNG
        #[arg(short, long, default_value = "annotated.png")]
        output: PathBuf,
        #[arg(long, default_value_t = 0.6)]
        distance_threshold: f32,
        #[arg(long, default_value_t = 0.5)]
        smile_threshold: f32,
        #[command(flatten)]
        models: ModelArgs,
        #[command(flatten)]
        gallery: GalleryArgs,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Directory or base URL holding the ONNX models
    #[arg(long, default_value = "models")]
    models: String,
    /// Skip the expression model (no face will be classified as smiling)
    #[arg(long)]
    no_expressions: bool,
}

#[derive(Args)]
struct GalleryArgs {
    /// Labels to enroll, comma separated
    #[arg(long, value_delimiter = ',')]
    labels: Vec<String>,
    /// Directory or base URL holding `{label}.{ext}` reference images
    #[arg(long, default_value = "labeled_images")]
    references: String,
    #[arg(long, default_value = "jpg")]
    ext: String,
    #[arg(long, default_value_t = 0.5)]
    min_confidence: f32,
}

struct Loaded {
    perception: Arc<OnnxPerception>,
    fetcher: Arc<DefaultFetcher>,
    models: Arc<ModelSet>,
}

async fn load_models(args: &ModelArgs) -> Result<Loaded> {
    let perception = Arc::new(OnnxPerception::new(!args.no_expressions));
    let fetcher = Arc::new(DefaultFetcher::new());
    let artifacts = perception.required_artifacts();
    let models = ModelRegistry::global()
        .load(&args.models, &artifacts, fetcher.as_ref())
        .await?;
    models.require(&artifacts)?;
    tracing::info!(
        locator = models.locator(),
        artifacts = artifacts.len(),
        bytes = models.total_bytes(),
        "models loaded"
    );
    Ok(Loaded {
        perception,
        fetcher,
        models,
    })
}

fn matcher_cache(loaded: &Loaded, gallery: &GalleryArgs, distance_threshold: f32) -> MatcherCache {
    let fetcher: Arc<dyn Fetcher> = loaded.fetcher.clone();
    let builder = GalleryBuilder::new(
        fetcher,
        loaded.perception.clone(),
        gallery.references.clone(),
        gallery.ext.clone(),
        gallery.min_confidence,
    );
    MatcherCache::new(builder, gallery.labels.clone(), distance_threshold)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = facelens_hw::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{:<14} {:<32} {} ({})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Models { models } => {
            let loaded = load_models(&models).await?;
            for name in loaded.models.names() {
                let bytes = loaded.models.artifact(name).map_or(0, <[u8]>::len);
                println!("{name:<28} {bytes:>12} bytes");
            }
            println!("{} bytes total from {}", loaded.models.total_bytes(), loaded.models.locator());
        }
        Commands::Gallery { models, gallery } => {
            let loaded = load_models(&models).await?;
            let cache = matcher_cache(&loaded, &gallery, 0.6);
            let report = cache.prepare_gallery(&loaded.models).await;
            tracing::info!(
                added = report.added.len(),
                skipped = report.skipped.len(),
                "gallery built"
            );
            let snapshot = cache.gallery().await;

            let summary = serde_json::json!({
                "added": report.added,
                "skipped": report
                    .skipped
                    .iter()
                    .map(|(label, reason)| serde_json::json!({ "label": label, "reason": reason }))
                    .collect::<Vec<_>>(),
                "descriptors": snapshot
                    .iter()
                    .map(|(label, d)| (label.to_string(), d.len()))
                    .collect::<std::collections::BTreeMap<_, _>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Annotate {
            input,
            output,
            distance_threshold,
            smile_threshold,
            models,
            gallery,
        } => {
            let loaded = load_models(&models).await?;
            let bytes = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let frame = frame_from_encoded(&bytes).with_context(|| format!("decoding {}", input.display()))?;

            let thresholds = Thresholds {
                min_confidence: gallery.min_confidence,
                distance: distance_threshold,
                smile: smile_threshold,
            };
            let observations = loaded
                .perception
                .detect(&loaded.models, &frame, thresholds.min_confidence)
                .await?;
            let matcher = matcher_cache(&loaded, &gallery, distance_threshold)
                .get_or_build(&loaded.models)
                .await;
            tracing::debug!(faces = observations.len(), input = %input.display(), "detection finished");
            let faces = annotate(
                observations,
                Some(matcher.as_ref()),
                frame.geometry(),
                frame.geometry(),
                &thresholds,
            );

            let mut overlay = RasterSurface::new();
            overlay.attach(frame.geometry());
            render(&mut overlay, &faces);

            let mut base = image::open(&input)?.to_rgba8();
            image::imageops::overlay(&mut base, overlay.image(), 0, 0);
            base.save_with_format(&output, image::ImageFormat::Png)
                .with_context(|| format!("writing {}", output.display()))?;

            for face in &faces {
                println!(
                    "{:<20} {:<8} distance={:.3} box=({:.0},{:.0} {:.0}x{:.0})",
                    face.label.as_str(),
                    face.matched.display_label(),
                    face.matched.distance,
                    face.bbox.x,
                    face.bbox.y,
                    face.bbox.width,
                    face.bbox.height
                );
            }
            println!("{} face(s) → {}", faces.len(), output.display());
        }
    }

    Ok(())
}
