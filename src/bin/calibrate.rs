use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use bonecap::calibration::{
    CalibrationSource, CalibrationStore, ChessboardObservation, MonocularCalibrator, StereoCalibrator,
};
use bonecap::config::Config;

const CONFIG_PATH: &str = "config.toml";

#[derive(Parser)]
#[command(name = "calibrate")]
#[command(about = "Camera calibration from chessboard corner observations")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Intrinsics and distortion of one camera
    Intrinsics {
        /// Camera key in the calibration store
        #[arg(long)]
        camera: String,

        /// JSON array of corner observations
        #[arg(long)]
        observations: PathBuf,

        #[arg(long, default_value_t = 640)]
        width: u32,

        #[arg(long, default_value_t = 480)]
        height: u32,

        /// Recompute even if a stored calibration exists
        #[arg(long)]
        force: bool,
    },

    /// Rotation and translation between two calibrated cameras
    Stereo {
        /// Reference camera (result is stored under this key)
        #[arg(long)]
        left: String,

        #[arg(long)]
        right: String,

        #[arg(long)]
        left_observations: PathBuf,

        #[arg(long)]
        right_observations: PathBuf,
    },
}

fn load_observations(path: &Path) -> Result<Vec<ChessboardObservation>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
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

    match cli.command {
        Commands::Intrinsics {
            camera,
            observations,
            width,
            height,
            force,
        } => {
            let observations = load_observations(&observations)?;
            let (rows, cols) = (config.calibration.board_rows, config.calibration.board_cols);
            let found = observations
                .iter()
                .filter(|o| o.is_valid() && o.has_grid(rows, cols))
                .count();
            println!("=== 内部パラメータ: {} ===", camera);
            println!("  画像: {} 枚 ({}x{} ボード検出 {} 枚)", observations.len(), rows, cols, found);

            let calibrator = MonocularCalibrator::from_config(&config.calibration);
            let cal = if force {
                calibrator.recalibrate(&camera, (width, height), &observations)?
            } else {
                calibrator.calibrate(&camera, (width, height), &observations)?
            };

            let intr = &cal.record.intrinsics;
            match cal.source {
                CalibrationSource::Stored => println!("  保存済みの結果を使用 (--force で再計算)"),
                CalibrationSource::Computed => {
                    println!("  保存先: {}", calibrator.store().root().display())
                }
                CalibrationSource::Fallback => println!("  ボード未検出のためデフォルト値 (保存しません)"),
            }
            println!("  fx={:.2} fy={:.2} cx={:.2} cy={:.2}", intr.fx, intr.fy, intr.cx, intr.cy);
            println!("  歪み係数: {:?}", intr.distortion);
            println!("  再投影誤差: {:.4} px", cal.record.reprojection_error);
        }
        Commands::Stereo {
            left,
            right,
            left_observations,
            right_observations,
        } => {
            let store = CalibrationStore::new(&config.calibration.store_dir);
            let left_record = store
                .load(&left)
                .with_context(|| format!("camera '{}' has no intrinsic calibration", left))?;
            let right_record = store
                .load(&right)
                .with_context(|| format!("camera '{}' has no intrinsic calibration", right))?;

            let left_obs = load_observations(&left_observations)?;
            let right_obs = load_observations(&right_observations)?;

            println!("=== ステレオ: {} - {} ===", left, right);
            let cal = StereoCalibrator::from_config(&config.calibration).calibrate(
                &left_record.intrinsics,
                &right_record.intrinsics,
                &left_obs,
                &right_obs,
            )?;
            store.save_extrinsics(&left, &cal)?;

            let t = &cal.extrinsics.translation;
            println!("  使用ペア: {} / {}", cal.pairs_used, left_obs.len());
            println!("  T = [{:.4}, {:.4}, {:.4}] (baseline {:.4})", t.x, t.y, t.z, cal.extrinsics.baseline());
            println!("  再投影誤差: {:.4} px", cal.reprojection_error);
        }
    }

    Ok(())
}
