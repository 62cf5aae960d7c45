use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

use bonecap::animation::AnimationStore;
use bonecap::calibration::{CalibrationRecord, CalibrationStore};
use bonecap::config::Config;
use bonecap::pipeline::CaptureContext;
use bonecap::pose::{Landmark, Pose};
use bonecap::reconstruction::{BackProjector, Triangulator};

const CONFIG_PATH: &str = "config.toml";

/// Reconstruct 3D joints from recorded landmarks and store them as an animation.
///
/// One landmark file gives the monocular (depth heuristic) path; a second
/// camera and landmark file switch to stereo triangulation.
#[derive(Parser)]
#[command(name = "reconstruct")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Camera key (reference camera in stereo mode)
    #[arg(long)]
    camera: String,

    /// JSON array over frames: null or the provider's full landmark list
    #[arg(long)]
    landmarks: PathBuf,

    #[arg(long, requires = "right_landmarks")]
    right_camera: Option<String>,

    #[arg(long, requires = "right_camera")]
    right_landmarks: Option<PathBuf>,

    /// Image width (default from config)
    #[arg(long)]
    width: Option<u32>,

    /// Image height (default from config)
    #[arg(long)]
    height: Option<u32>,

    /// Session identifier (default: derived from the start time)
    #[arg(long)]
    id: Option<String>,
}

/// フレームごとのポーズ（検出なしのフレームは None）
fn load_poses(path: &Path) -> Result<Vec<Option<Pose>>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let frames: Vec<Option<Vec<Landmark>>> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;

    frames
        .into_iter()
        .enumerate()
        .map(|(i, frame)| match frame {
            Some(all) => match Pose::from_provider(&all) {
                Some(pose) => Ok(Some(pose)),
                None => bail!("{}: frame {} has only {} landmarks", path.display(), i, all.len()),
            },
            None => Ok(None),
        })
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config);
    let image_size = (
        cli.width.unwrap_or(config.reconstruction.image_width),
        cli.height.unwrap_or(config.reconstruction.image_height),
    );
    let calibrations = CalibrationStore::new(&config.calibration.store_dir);

    let left = load_poses(&cli.landmarks)?;
    let mut skipped = 0usize;

    let (mut ctx, frames) = match (&cli.right_camera, &cli.right_landmarks) {
        (Some(right_camera), Some(right_landmarks)) => {
            let right = load_poses(right_landmarks)?;
            if left.len() != right.len() {
                bail!("landmark files differ in length ({} vs {} frames)", left.len(), right.len());
            }
            let left_record = calibrations
                .load(&cli.camera)
                .with_context(|| format!("camera '{}' has no intrinsic calibration", cli.camera))?;
            let right_record = calibrations
                .load(right_camera)
                .with_context(|| format!("camera '{}' has no intrinsic calibration", right_camera))?;
            let stereo = calibrations
                .load_extrinsics(&cli.camera)
                .with_context(|| format!("camera '{}' has no stereo calibration", cli.camera))?;

            println!("=== ステレオ復元: {} + {} ===", cli.camera, right_camera);
            let triangulator = Triangulator::from_calibration(
                left_record.intrinsics,
                right_record.intrinsics,
                &stereo.extrinsics,
                image_size,
            )
            .with_config(&config.reconstruction);
            let frames: Vec<_> = left.into_iter().zip(right).map(|(l, r)| l.zip(r)).collect();
            (CaptureContext::stereo(triangulator).with_config(&config), Frames::Stereo(frames))
        }
        _ => {
            let record = match calibrations.load(&cli.camera) {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    tracing::warn!("camera '{}' is not calibrated, using default intrinsics", cli.camera);
                    CalibrationRecord::fallback()
                }
                Err(e) => return Err(e.into()),
            };

            println!("=== 単眼復元: {} ===", cli.camera);
            let projector = BackProjector::from_config(&config.reconstruction);
            (
                CaptureContext::monocular(projector, record.intrinsics, image_size).with_config(&config),
                Frames::Monocular(left),
            )
        }
    };

    ctx.start_recording()?;
    match frames {
        Frames::Monocular(frames) => {
            for pose in frames {
                match pose {
                    Some(pose) => {
                        ctx.process_monocular(&pose)?;
                    }
                    None => skipped += 1,
                }
            }
        }
        Frames::Stereo(frames) => {
            for pair in frames {
                match pair {
                    Some((l, r)) => {
                        ctx.process_stereo(&l, &r)?;
                    }
                    None => skipped += 1,
                }
            }
        }
    }
    let session = ctx.stop_recording().context("recording was not active")?;

    let store = AnimationStore::from_config(&config.recording);
    let id = store.write(&session, cli.id.as_deref())?;
    println!("  フレーム: {} (ポーズなし {} フレームをスキップ)", session.len(), skipped);
    println!("  保存: {}", id);

    Ok(())
}

enum Frames {
    Monocular(Vec<Option<Pose>>),
    Stereo(Vec<Option<(Pose, Pose)>>),
}
