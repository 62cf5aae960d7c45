use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{CalibrationRecord, CameraIntrinsics, StereoCalibration, StereoExtrinsics};
use crate::error::StoreError;
use crate::persist::{read_json, validate_key, write_atomic};

/// 保存フォーマットのバージョン
pub const FORMAT_VERSION: u32 = 1;

// --- 保存フォーマット ---

/// `<key>.json`
#[derive(Debug, Serialize, Deserialize)]
struct IntrinsicsFile {
    version: u32,
    camera: String,
    /// 内部パラメータ行列 K (row-major 3x3)
    intrinsic_matrix: [f64; 9],
    /// 歪み係数 [k1, k2, p1, p2, k3]
    dist_coeffs: [f64; 5],
    reprojection_error: f64,
}

/// `<key>.stereo.json`
#[derive(Debug, Serialize, Deserialize)]
struct ExtrinsicsFile {
    version: u32,
    /// 回転行列 R (row-major 3x3)
    rotation: [f64; 9],
    translation: [f64; 3],
    reprojection_error: f64,
    pairs_used: usize,
}

/// カメラごとのキャリブレーション結果をディレクトリに保存する
///
/// 書き込みは一時ファイル + rename で行うので、読み手が書きかけの内容を見ることはない。
/// 同じキーへの保存を並行して行わないこと。
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    root: PathBuf,
}

impl CalibrationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn intrinsics_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }

    fn extrinsics_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.stereo.json", key))
    }

    pub fn contains(&self, key: &str) -> bool {
        validate_key(key).is_ok() && self.intrinsics_path(key).is_file()
    }

    pub fn load(&self, key: &str) -> Result<CalibrationRecord, StoreError> {
        validate_key(key)?;
        let path = self.intrinsics_path(key);
        let file: IntrinsicsFile = read_versioned(&path, key, "calibration")?;
        Ok(CalibrationRecord {
            intrinsics: CameraIntrinsics::from_row_major(&file.intrinsic_matrix, file.dist_coeffs),
            reprojection_error: file.reprojection_error,
        })
    }

    pub fn save(&self, key: &str, record: &CalibrationRecord) -> Result<(), StoreError> {
        validate_key(key)?;
        let file = IntrinsicsFile {
            version: FORMAT_VERSION,
            camera: key.to_string(),
            intrinsic_matrix: record.intrinsics.to_row_major(),
            dist_coeffs: record.intrinsics.distortion,
            reprojection_error: record.reprojection_error,
        };
        let path = self.intrinsics_path(key);
        write_json(&path, &file)?;
        tracing::info!("saved calibration for '{}' to {}", key, path.display());
        Ok(())
    }

    /// ステレオ外部パラメータ（key は基準カメラ）
    pub fn load_extrinsics(&self, key: &str) -> Result<StereoCalibration, StoreError> {
        validate_key(key)?;
        let path = self.extrinsics_path(key);
        let file: ExtrinsicsFile = read_versioned(&path, key, "stereo calibration")?;
        Ok(StereoCalibration {
            extrinsics: StereoExtrinsics::new(
                Matrix3::from_row_slice(&file.rotation),
                Vector3::from(file.translation),
            ),
            reprojection_error: file.reprojection_error,
            pairs_used: file.pairs_used,
        })
    }

    pub fn save_extrinsics(&self, key: &str, calibration: &StereoCalibration) -> Result<(), StoreError> {
        validate_key(key)?;
        let r = &calibration.extrinsics.rotation;
        let t = &calibration.extrinsics.translation;
        let file = ExtrinsicsFile {
            version: FORMAT_VERSION,
            rotation: [
                r[(0, 0)], r[(0, 1)], r[(0, 2)],
                r[(1, 0)], r[(1, 1)], r[(1, 2)],
                r[(2, 0)], r[(2, 1)], r[(2, 2)],
            ],
            translation: [t.x, t.y, t.z],
            reprojection_error: calibration.reprojection_error,
            pairs_used: calibration.pairs_used,
        };
        let path = self.extrinsics_path(key);
        write_json(&path, &file)?;
        tracing::info!("saved stereo calibration for '{}' to {}", key, path.display());
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, json.as_bytes())
}

/// バージョンを先に確認してから本体をパースする
fn read_versioned<T: serde::de::DeserializeOwned>(
    path: &Path,
    key: &str,
    kind: &'static str,
) -> Result<T, StoreError> {
    let value: serde_json::Value = read_json(path, key)?;
    let found = value
        .get("version")
        .and_then(|v| v.as_u64())
        .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX));
    if found != FORMAT_VERSION {
        return Err(StoreError::IncompatibleVersion {
            kind,
            found,
            expected: FORMAT_VERSION,
        });
    }
    serde_json::from_value(value).map_err(|source| StoreError::Format {
        path: path.to_path_buf(),
        source,
    })
}
