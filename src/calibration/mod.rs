//! カメラキャリブレーション
//!
//! - 単眼: チェスボード観測 → 内部パラメータ + 歪み係数 (`MonocularCalibrator`)
//! - ステレオ: 同期ペア観測 → カメラ間の R, T (`StereoCalibrator`)
//! - 永続化: `CalibrationStore`

pub mod board;
pub mod distortion;
pub mod homography;
pub mod intrinsics;
mod optim;
pub mod stereo;
pub mod store;

use nalgebra::{Matrix3, Matrix3x4, Vector3};

pub use board::{detect_observations, model_points, ChessboardObservation, CornerDetector};
pub use intrinsics::{Calibration, CalibrationSource, MonocularCalibrator};
pub use stereo::{StereoCalibration, StereoCalibrator};
pub use store::CalibrationStore;

/// 歪み係数 [k1, k2, p1, p2, k3]
pub type Distortion = [f64; 5];

/// キャリブレーション無しで使う近似値（一般的なWebカメラ 640x480 相当）
pub const FALLBACK_FOCAL: f64 = 800.0;
pub const FALLBACK_PRINCIPAL_POINT: (f64, f64) = (320.0, 240.0);
pub const FALLBACK_DISTORTION: Distortion = [0.1, -0.2, 0.0, 0.0, 0.0];

/// 内部パラメータ（焦点距離・主点・歪み係数）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub distortion: Distortion,
}

impl CameraIntrinsics {
    /// 歪みなし
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            distortion: [0.0; 5],
        }
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    /// 内部パラメータ行列 K
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// K (row-major 3x3)
    pub fn to_row_major(&self) -> [f64; 9] {
        [self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0]
    }

    pub fn from_row_major(k: &[f64; 9], distortion: Distortion) -> Self {
        Self {
            fx: k[0],
            fy: k[4],
            cx: k[2],
            cy: k[5],
            distortion,
        }
    }

    /// fx > 0, fy > 0 かつ全て有限
    pub fn is_valid(&self) -> bool {
        let finite = [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .chain(self.distortion.iter())
            .all(|v| v.is_finite());
        finite && self.fx > 0.0 && self.fy > 0.0
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|&d| d != 0.0)
    }
}

/// 単眼キャリブレーション結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRecord {
    pub intrinsics: CameraIntrinsics,
    /// RMS再投影誤差（ピクセル）
    pub reprojection_error: f64,
}

impl CalibrationRecord {
    pub fn new(intrinsics: CameraIntrinsics, reprojection_error: f64) -> Self {
        Self {
            intrinsics,
            reprojection_error,
        }
    }

    /// 画像が無い・ボード未検出の時の固定値
    pub fn fallback() -> Self {
        let (cx, cy) = FALLBACK_PRINCIPAL_POINT;
        Self {
            intrinsics: CameraIntrinsics::new(FALLBACK_FOCAL, FALLBACK_FOCAL, cx, cy)
                .with_distortion(FALLBACK_DISTORTION),
            reprojection_error: 0.0,
        }
    }
}

/// カメラ1座標系の点 X1 をカメラ2座標系へ: X2 = R * X1 + T
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl StereoExtrinsics {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// カメラ1を原点とした射影行列 (P1 = K1[I|0], P2 = K2[R|T])
    pub fn projection_matrices(
        &self,
        left: &CameraIntrinsics,
        right: &CameraIntrinsics,
    ) -> (Matrix3x4<f64>, Matrix3x4<f64>) {
        let p1 = projection_matrix(left, &Matrix3::identity(), &Vector3::zeros());
        let p2 = projection_matrix(right, &self.rotation, &self.translation);
        (p1, p2)
    }

    /// カメラ間距離（ベースライン長）
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }
}

/// P = K * [R | t]
pub fn projection_matrix(
    intrinsics: &CameraIntrinsics,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
) -> Matrix3x4<f64> {
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    rt.set_column(3, translation);
    intrinsics.matrix() * rt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsics_row_major_roundtrip() {
        let intr = CameraIntrinsics::new(812.5, 799.25, 330.1, 241.7)
            .with_distortion([0.01, -0.02, 0.001, 0.0, 0.003]);
        let k = intr.to_row_major();
        assert_eq!(CameraIntrinsics::from_row_major(&k, intr.distortion), intr);
        assert_eq!(intr.matrix()[(0, 2)], 330.1);
        assert_eq!(intr.matrix()[(1, 1)], 799.25);
    }

    #[test]
    fn test_intrinsics_validity() {
        assert!(CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0).is_valid());
        assert!(!CameraIntrinsics::new(0.0, 800.0, 320.0, 240.0).is_valid());
        assert!(!CameraIntrinsics::new(800.0, -1.0, 320.0, 240.0).is_valid());
        assert!(!CameraIntrinsics::new(f64::NAN, 800.0, 320.0, 240.0).is_valid());
    }

    #[test]
    fn test_fallback_is_fixed() {
        let a = CalibrationRecord::fallback();
        let b = CalibrationRecord::fallback();
        assert_eq!(a, b);
        assert_eq!(a.intrinsics.fx, 800.0);
        assert_eq!(a.intrinsics.cy, 240.0);
        assert_eq!(a.intrinsics.distortion, [0.1, -0.2, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_projection_matrices_reference_camera() {
        let intr = CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0);
        let extr = StereoExtrinsics::new(Matrix3::identity(), Vector3::new(-0.5, 0.0, 0.0));
        let (p1, p2) = extr.projection_matrices(&intr, &intr);
        assert_eq!(p1.fixed_view::<3, 3>(0, 0).into_owned(), intr.matrix());
        assert_eq!(p1.column(3).norm(), 0.0);
        assert!((p2[(0, 3)] - (-400.0)).abs() < 1e-12);
        assert!((extr.baseline() - 0.5).abs() < 1e-12);
    }
}
