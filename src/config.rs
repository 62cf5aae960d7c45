use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// チェスボード内部交点の行数
    #[serde(default = "default_board_rows")]
    pub board_rows: usize,
    /// チェスボード内部交点の列数
    #[serde(default = "default_board_cols")]
    pub board_cols: usize,
    /// マス辺長（モデル座標の単位）
    #[serde(default = "default_square_size")]
    pub square_size: f64,
    /// キャリブレーション結果の保存先ディレクトリ
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    /// ステレオキャリブレーションに必要な同期ペア数の下限
    #[serde(default = "default_min_stereo_pairs")]
    pub min_stereo_pairs: usize,
    /// LM最適化の反復上限
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_board_rows() -> usize { 4 }
fn default_board_cols() -> usize { 7 }
fn default_square_size() -> f64 { 1.0 }
fn default_store_dir() -> String { "calibration".to_string() }
fn default_min_stereo_pairs() -> usize { 3 }
fn default_max_iterations() -> usize { 100 }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            board_rows: default_board_rows(),
            board_cols: default_board_cols(),
            square_size: default_square_size(),
            store_dir: default_store_dir(),
            min_stereo_pairs: default_min_stereo_pairs(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconstructionConfig {
    /// 単眼復元の基準深度（メートル）
    #[serde(default = "default_reference_depth")]
    pub reference_depth: f64,
    /// 相対深度に掛ける経験的スケール
    #[serde(default = "default_depth_scale")]
    pub depth_scale: f64,
    /// ステレオ三角測量に使うランドマークの可視度閾値
    #[serde(default = "default_visibility_threshold")]
    pub visibility_threshold: f64,
    /// ステレオ三角測量の再投影誤差上限（ピクセル）。超えた関節は捨てる
    #[serde(default = "default_max_reprojection_error")]
    pub max_reprojection_error: f64,
    #[serde(default = "default_image_width")]
    pub image_width: u32,
    #[serde(default = "default_image_height")]
    pub image_height: u32,
}

fn default_reference_depth() -> f64 { 1.0 }
fn default_depth_scale() -> f64 { 0.5 }
fn default_visibility_threshold() -> f64 { 0.5 }
fn default_max_reprojection_error() -> f64 { 75.0 }
fn default_image_width() -> u32 { 720 }
fn default_image_height() -> u32 { 720 }

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            reference_depth: default_reference_depth(),
            depth_scale: default_depth_scale(),
            visibility_threshold: default_visibility_threshold(),
            max_reprojection_error: default_max_reprojection_error(),
            image_width: default_image_width(),
            image_height: default_image_height(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    /// アニメーションJSONの出力先
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// 可視ランドマーク比率がこれを下回ると警告
    #[serde(default = "default_visibility_warning_ratio")]
    pub visibility_warning_ratio: f64,
}

fn default_output_dir() -> String { "animations".to_string() }
fn default_visibility_warning_ratio() -> f64 { 0.9 }

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            visibility_warning_ratio: default_visibility_warning_ratio(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// 設定ファイルが無い・壊れている場合はデフォルト値
    ///
    /// ファイルが有るのに読めない場合は警告を出す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) if path.exists() => {
                tracing::warn!("ignoring config, using defaults: {:#}", e);
                Self::default()
            }
            Err(e) => {
                tracing::debug!("using default config: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
