use nalgebra::{DVector, Matrix3, Point2, Quaternion, Rotation3, UnitQuaternion, Vector3, Vector4};

use super::board::{matches_board, ChessboardObservation};
use super::distortion::{project_point, undistort_normalized};
use super::homography::{dlt_homography, planar_pose};
use super::intrinsics::{BoardView, BEHIND_CAMERA_PENALTY};
use super::optim::{minimize, params_to_pose, pose_to_params, rms_pixel_error, Residuals};
use super::{CameraIntrinsics, StereoExtrinsics};
use crate::config::CalibrationConfig;
use crate::error::CalibrationError;

/// ステレオキャリブレーション結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoCalibration {
    pub extrinsics: StereoExtrinsics,
    /// 両カメラを合わせた RMS 再投影誤差（ピクセル）
    pub reprojection_error: f64,
    pub pairs_used: usize,
}

/// 同期撮影したペア1組（ボード座標は共通）
struct StereoPair {
    left: BoardView,
    right: Vec<Point2<f64>>,
}

/// 2台のカメラ間の R, T を求める（内部パラメータは固定）
#[derive(Debug, Clone)]
pub struct StereoCalibrator {
    min_pairs: usize,
    board: Option<(usize, usize)>,
    square_size: f64,
    max_iterations: usize,
}

impl Default for StereoCalibrator {
    fn default() -> Self {
        Self::new()
    }
}

impl StereoCalibrator {
    pub fn new() -> Self {
        Self {
            min_pairs: 3,
            board: None,
            square_size: 1.0,
            max_iterations: 100,
        }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new()
            .with_min_pairs(config.min_stereo_pairs)
            .with_board(config.board_rows, config.board_cols)
            .with_square_size(config.square_size)
            .with_max_iterations(config.max_iterations)
    }

    pub fn with_min_pairs(mut self, min_pairs: usize) -> Self {
        self.min_pairs = min_pairs.max(1);
        self
    }

    pub fn with_board(mut self, rows: usize, cols: usize) -> Self {
        self.board = Some((rows, cols));
        self
    }

    pub fn with_square_size(mut self, square_size: f64) -> Self {
        self.square_size = square_size;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// インデックスで対応付けた観測列からカメラ1→カメラ2の変換を推定
    ///
    /// どちらか一方でも検出に失敗したペアは丸ごと捨てる。
    pub fn calibrate(
        &self,
        left_intrinsics: &CameraIntrinsics,
        right_intrinsics: &CameraIntrinsics,
        left: &[ChessboardObservation],
        right: &[ChessboardObservation],
    ) -> Result<StereoCalibration, CalibrationError> {
        if left.len() != right.len() {
            return Err(CalibrationError::MismatchedObservations {
                left: left.len(),
                right: right.len(),
            });
        }

        let pairs: Vec<StereoPair> = left
            .iter()
            .zip(right)
            .filter_map(|(l, r)| {
                let pair = if l.same_grid(r) && matches_board(l, self.board) && matches_board(r, self.board) {
                    BoardView::from_observation(l, self.square_size)
                        .zip(r.image_points())
                        .map(|(left, right)| StereoPair { left, right })
                } else {
                    None
                };
                if pair.is_none() {
                    tracing::debug!("discarding pair {} / {}", l.image_id, r.image_id);
                }
                pair
            })
            .collect();

        if pairs.len() < self.min_pairs {
            return Err(CalibrationError::InsufficientPairs {
                found: pairs.len(),
                required: self.min_pairs,
            });
        }

        // --- 初期値: ペアごとの相対姿勢を平均 ---
        let mut board_poses = Vec::with_capacity(pairs.len());
        let mut relative = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            let (r1, t1) = board_pose(left_intrinsics, &pair.left, &pair.left.image)?;
            let (r2, t2) = board_pose(right_intrinsics, &pair.left, &pair.right)?;
            let r = r2 * r1.inverse();
            relative.push((r, t2 - r * t1));
            board_poses.push((r1, t1));
        }
        let (r0, t0) = average_pose(&relative);

        let mut x0 = pose_to_params(&r0, &t0).to_vec();
        for (r, t) in &board_poses {
            x0.extend_from_slice(&pose_to_params(r, t));
        }
        let x0 = DVector::from_vec(x0);

        let residual_count: usize = pairs.iter().map(|p| 4 * p.right.len()).sum();
        if residual_count < x0.len() {
            return Err(CalibrationError::Degenerate(format!(
                "{} residuals cannot constrain {} parameters",
                residual_count,
                x0.len()
            )));
        }

        // --- LM: 相対姿勢 + 各ボード姿勢 ---
        let problem = StereoProblem {
            pairs: &pairs,
            left: left_intrinsics,
            right: right_intrinsics,
        };
        let initial_error = rms_pixel_error(&problem.residuals(&x0));
        let solution = minimize(&problem, x0.clone(), self.max_iterations);
        let refined_error = rms_pixel_error(&problem.residuals(&solution.params));
        tracing::debug!(
            "stereo LM: {} evaluations, converged={}, error {:.4} -> {:.4} px",
            solution.evaluations,
            solution.converged,
            initial_error,
            refined_error
        );

        let (params, error) = if refined_error.is_finite() && refined_error <= initial_error {
            (solution.params, refined_error)
        } else {
            (x0, initial_error)
        };
        if !error.is_finite() {
            return Err(CalibrationError::Degenerate("non-finite stereo reprojection error".into()));
        }

        let (r, t) = params_to_pose(&params.as_slice()[..6]);
        let calibration = StereoCalibration {
            extrinsics: StereoExtrinsics::new(*r.matrix(), t),
            reprojection_error: error,
            pairs_used: pairs.len(),
        };
        tracing::info!(
            "stereo calibrated from {}/{} pairs: baseline={:.4} error={:.4} px",
            pairs.len(),
            left.len(),
            calibration.extrinsics.baseline(),
            error
        );
        Ok(calibration)
    }
}

/// 歪みを除いた正規化座標でホモグラフィを作り、K = I でボード姿勢を求める
fn board_pose(
    intr: &CameraIntrinsics,
    board: &BoardView,
    image: &[Point2<f64>],
) -> Result<(Rotation3<f64>, Vector3<f64>), CalibrationError> {
    let normalized: Vec<Point2<f64>> = image
        .iter()
        .map(|p| {
            let (x, y) = undistort_normalized(intr, p.x, p.y);
            Point2::new(x, y)
        })
        .collect();
    let h = dlt_homography(&board.planar_model(), &normalized)?;
    planar_pose(&Matrix3::identity(), &h)
}

/// 回転はクォータニオン平均（符号を先頭に揃えて和を正規化）、並進は算術平均
fn average_pose(poses: &[(Rotation3<f64>, Vector3<f64>)]) -> (Rotation3<f64>, Vector3<f64>) {
    let first = UnitQuaternion::from_rotation_matrix(&poses[0].0);
    let mut q_sum = Vector4::zeros();
    let mut t_sum = Vector3::zeros();
    for (r, t) in poses {
        let q = UnitQuaternion::from_rotation_matrix(r);
        q_sum += if q.coords.dot(&first.coords) < 0.0 { -q.coords } else { q.coords };
        t_sum += t;
    }
    let q = UnitQuaternion::from_quaternion(Quaternion::from(q_sum));
    (q.to_rotation_matrix(), t_sum / poses.len() as f64)
}

struct StereoProblem<'a> {
    pairs: &'a [StereoPair],
    left: &'a CameraIntrinsics,
    right: &'a CameraIntrinsics,
}

impl Residuals for StereoProblem<'_> {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let p = params.as_slice();
        let (r, t) = params_to_pose(&p[..6]);
        let mut out = Vec::new();
        let mut push = |projected: Option<Point2<f64>>, observed: &Point2<f64>| match projected {
            Some(q) => {
                out.push(q.x - observed.x);
                out.push(q.y - observed.y);
            }
            None => {
                out.push(BEHIND_CAMERA_PENALTY);
                out.push(BEHIND_CAMERA_PENALTY);
            }
        };
        for (i, pair) in self.pairs.iter().enumerate() {
            let offset = 6 * (i + 1);
            let (rb, tb) = params_to_pose(&p[offset..offset + 6]);
            for ((model, obs_left), obs_right) in pair.left.model.iter().zip(&pair.left.image).zip(&pair.right) {
                let x1 = rb * model.coords + tb;
                let x2 = r * x1 + t;
                push(project_point(self.left, &x1), obs_left);
                push(project_point(self.right, &x2), obs_right);
            }
        }
        DVector::from_vec(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::board::model_points;

    const ROWS: usize = 4;
    const COLS: usize = 7;

    fn rig() -> (CameraIntrinsics, CameraIntrinsics, StereoExtrinsics) {
        let left = CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0).with_distortion([0.02, -0.01, 0.0, 0.0, 0.0]);
        let right = CameraIntrinsics::new(780.0, 785.0, 315.0, 245.0);
        let extr = StereoExtrinsics::new(
            *Rotation3::from_euler_angles(0.02, -0.12, 0.01).matrix(),
            Vector3::new(-2.0, 0.05, 0.3),
        );
        (left, right, extr)
    }

    fn board_poses() -> Vec<(Rotation3<f64>, Vector3<f64>)> {
        vec![
            (Rotation3::from_euler_angles(0.2, 0.1, 0.05), Vector3::new(-2.0, -2.0, 12.0)),
            (Rotation3::from_euler_angles(-0.15, 0.25, -0.1), Vector3::new(-1.0, -3.0, 14.0)),
            (Rotation3::from_euler_angles(0.1, -0.2, 0.2), Vector3::new(-1.5, -1.0, 11.0)),
            (Rotation3::from_euler_angles(-0.2, -0.1, 0.0), Vector3::new(-0.5, -3.0, 13.0)),
        ]
    }

    fn observations() -> (Vec<ChessboardObservation>, Vec<ChessboardObservation>) {
        let (left, right, extr) = rig();
        let model = model_points(ROWS, COLS, 1.0);
        let mut l_obs = Vec::new();
        let mut r_obs = Vec::new();
        for (i, (rb, tb)) in board_poses().iter().enumerate() {
            let mut l = Vec::new();
            let mut r = Vec::new();
            for p in &model {
                let x1 = rb * p.coords + tb;
                let x2 = extr.rotation * x1 + extr.translation;
                let a = project_point(&left, &x1).unwrap();
                let b = project_point(&right, &x2).unwrap();
                l.push([a.x, a.y]);
                r.push([b.x, b.y]);
            }
            l_obs.push(ChessboardObservation::found(format!("left{}", i), ROWS, COLS, l));
            r_obs.push(ChessboardObservation::found(format!("right{}", i), ROWS, COLS, r));
        }
        (l_obs, r_obs)
    }

    #[test]
    fn test_recovers_extrinsics() {
        let (left, right, truth) = rig();
        let (l_obs, r_obs) = observations();
        let cal = StereoCalibrator::new().calibrate(&left, &right, &l_obs, &r_obs).unwrap();
        assert_eq!(cal.pairs_used, 4);
        assert!((cal.extrinsics.translation - truth.translation).norm() < 1e-4);
        let r_err = Rotation3::from_matrix_unchecked(cal.extrinsics.rotation)
            .angle_to(&Rotation3::from_matrix_unchecked(truth.rotation));
        assert!(r_err < 1e-5, "rotation error {}", r_err);
        assert!(cal.reprojection_error < 1e-3);
    }

    #[test]
    fn test_mismatched_lengths() {
        let (left, right, _) = rig();
        let (l_obs, mut r_obs) = observations();
        r_obs.pop();
        let err = StereoCalibrator::new().calibrate(&left, &right, &l_obs, &r_obs).unwrap_err();
        assert!(matches!(err, CalibrationError::MismatchedObservations { left: 4, right: 3 }));
    }

    #[test]
    fn test_pairs_with_failed_side_are_discarded() {
        let (left, right, _) = rig();
        let (mut l_obs, mut r_obs) = observations();
        l_obs[0] = ChessboardObservation::not_found("left0", ROWS, COLS);
        r_obs[2] = ChessboardObservation::not_found("right2", ROWS, COLS);

        let err = StereoCalibrator::new().calibrate(&left, &right, &l_obs, &r_obs).unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientPairs { found: 2, required: 3 }));

        let cal = StereoCalibrator::new()
            .with_min_pairs(2)
            .calibrate(&left, &right, &l_obs, &r_obs)
            .unwrap();
        assert_eq!(cal.pairs_used, 2);
    }

    #[test]
    fn test_pairs_of_other_boards_are_discarded() {
        let (left, right, _) = rig();
        let (mut l_obs, mut r_obs) = observations();
        l_obs.push(ChessboardObservation::found("left-big", 5, 8, vec![[300.0, 200.0]; 40]));
        r_obs.push(ChessboardObservation::found("right-big", 5, 8, vec![[310.0, 210.0]; 40]));

        let cal = StereoCalibrator::new()
            .with_board(ROWS, COLS)
            .calibrate(&left, &right, &l_obs, &r_obs)
            .unwrap();
        assert_eq!(cal.pairs_used, 4);

        let err = StereoCalibrator::new()
            .with_board(5, 8)
            .calibrate(&left, &right, &l_obs, &r_obs)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientPairs { found: 1, required: 3 }));
    }

    #[test]
    fn test_empty_input_is_insufficient() {
        let (left, right, _) = rig();
        let err = StereoCalibrator::new().calibrate(&left, &right, &[], &[]).unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientPairs { found: 0, .. }));
    }

    #[test]
    fn test_average_pose_handles_quaternion_sign() {
        let r = Rotation3::from_euler_angles(0.1, 0.2, 0.3);
        let poses = vec![(r, Vector3::new(1.0, 0.0, 0.0)), (r, Vector3::new(3.0, 0.0, 0.0))];
        let (avg, t) = average_pose(&poses);
        assert!(avg.angle_to(&r) < 1e-6);
        assert_eq!(t, Vector3::new(2.0, 0.0, 0.0));
    }
}
