use arena_vision::{
    config::VisionSettings,
    debug::{DebugChannel, DebugImage, DebugSink},
    frame::{Frame, FrameQueue},
    pipeline::{PipelineOutput, VisionPipeline},
    state::{PoseBuffer, VehicleState},
};
use chrono::{DateTime, TimeDelta, Utc};
use clap::Parser;
use image::ImageReader;
use nalgebra::Vector3;
use std::{
    error::Error,
    fs::File,
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{error, info, warn};
use uom::si::{angle::degree, f64::Angle};

/// Run the estimators over a sequence of still images taken from a fixed
/// vehicle state.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Images to process, in capture order.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Settings as written by the `params` binary. Defaults are used if
    /// omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera height above the floor in meters.
    #[arg(long, default_value_t = 1.5)]
    altitude: f64,

    /// Vehicle heading in degrees.
    #[arg(long, default_value_t = 0.0)]
    yaw: f64,

    #[arg(long, default_value_t = 0.0)]
    x: f64,

    #[arg(long, default_value_t = 0.0)]
    y: f64,

    /// Time between consecutive images in milliseconds.
    #[arg(long, default_value_t = 100)]
    interval: i64,

    /// Optional path to write CSV output to.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory to write debug images to. Enables every debug channel.
    #[arg(long)]
    debug_dir: Option<PathBuf>,
}

/// Saves every debug image as a PNG named after its channel and stamp.
struct DirectorySink {
    dir: PathBuf,
}

impl DebugSink for DirectorySink {
    fn publish(&self, channel: DebugChannel, stamp: DateTime<Utc>, image: DebugImage) {
        let path = self
            .dir
            .join(format!("{}_{}.png", channel.name(), stamp.timestamp_millis()));
        let result = match image {
            DebugImage::Gray(image) => image.save(&path),
            DebugImage::Rgb(image) => image.save(&path),
        };
        if let Err(e) = result {
            warn!(err = e.to_string(), path = %path.display(), "failed to write debug image");
        }
    }
}

fn read_settings(path: &Path) -> Result<VisionSettings, Box<dyn Error>> {
    let mut file = File::open(path)?;
    let mut serialized = String::new();
    file.read_to_string(&mut serialized)?;
    Ok(serde_json::from_str(&serialized)?)
}

fn csv_row(image: &str, stamp: DateTime<Utc>, output: &PipelineOutput) -> String {
    let pose = match &output.pose {
        Ok(p) => format!(
            "{:.4},{:.4},{:.3},{:.3}",
            p.position.x,
            p.position.y,
            p.yaw.get::<degree>(),
            p.confidence
        ),
        Err(_) => ",,,".to_string(),
    };
    let velocity = match &output.velocity {
        Ok(v) => format!("{:.4},{:.4},{:.5}", v.velocity.x, v.velocity.y, v.variance),
        Err(_) => ",,".to_string(),
    };
    let blobs = output.blobs.as_ref().map_or(0, |b| b.len());
    format!(
        "{},{},{},{},{}\n",
        image,
        stamp.timestamp_millis(),
        pose,
        velocity,
        blobs
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    // Register an event subscriber that prints events to STDOUT.
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => read_settings(path)?,
        None => VisionSettings::default(),
    };
    if args.debug_dir.is_some() {
        settings.grid.debug_edges = true;
        settings.grid.debug_lines = true;
        settings.flow.debug_vectors = true;
        settings.blob.debug_hsv_slice = true;
        settings.blob.debug_contours = true;
    }

    let start = Utc::now();
    let stamps: Vec<DateTime<Utc>> = (0..args.images.len() as i64)
        .map(|i| start + TimeDelta::milliseconds(i * args.interval))
        .collect();

    // Every frame sees the same vehicle state.
    let poses = Arc::new(PoseBuffer::new(stamps.len()));
    for stamp in &stamps {
        poses.record(VehicleState::level(
            *stamp,
            Vector3::new(args.x, args.y, args.altitude),
            Angle::new::<degree>(args.yaw),
        ));
    }

    let mut pipeline = VisionPipeline::new(&settings, poses)?;
    if let Some(dir) = &args.debug_dir {
        std::fs::create_dir_all(dir)?;
        pipeline = pipeline.with_debug_sink(Arc::new(DirectorySink { dir: dir.clone() }));
    }

    let mut writer: Box<dyn Write> = match &args.output {
        Some(path_buf) => Box::new(BufWriter::new(File::create(path_buf)?)),
        None => Box::new(BufWriter::new(std::io::stdout())),
    };
    writer.write_all(b"image,stamp_ms,x,y,yaw_deg,confidence,vx,vy,velocity_variance,blobs\n")?;

    let queue = FrameQueue::new(args.images.len());
    for (path, stamp) in args.images.iter().zip(&stamps) {
        let image = ImageReader::open(path)?.decode()?.into_rgb8();
        queue.push(Frame::new(image, *stamp));
    }
    info!(frames = queue.len(), "decoded input images");

    let names: Vec<String> = args
        .images
        .iter()
        .map(|p| p.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string())
        .collect();
    let mut rows = Vec::new();
    let processed = pipeline.drain(&queue, |frame, output| {
        let index = stamps.iter().position(|s| *s == frame.stamp()).unwrap_or_default();
        rows.push(csv_row(&names[index], frame.stamp(), &output));
    });

    for row in rows {
        writer.write_all(row.as_bytes())?;
    }
    match writer.flush() {
        Ok(()) => info!(processed, "wrote results as csv"),
        Err(e) => error!(err = e.to_string(), "failed to write results as csv"),
    }
    Ok(())
}
