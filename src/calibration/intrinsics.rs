use nalgebra::{DVector, Point2, Point3};

use super::board::{matches_board, model_points, ChessboardObservation};
use super::distortion::project_point;
use super::homography::{centered_intrinsics, dlt_homography, planar_pose, zhang_intrinsics};
use super::optim::{minimize, params_to_pose, pose_to_params, rms_pixel_error, Residuals};
use super::{CalibrationRecord, CalibrationStore, CameraIntrinsics};
use crate::config::CalibrationConfig;
use crate::error::{CalibrationError, StoreError};

/// カメラ後方に回った点の残差（ピクセル）
pub(crate) const BEHIND_CAMERA_PENALTY: f64 = 1e4;

/// 内部パラメータ9個: fx, fy, cx, cy, k1, k2, p1, p2, k3
const INTRINSIC_PARAMS: usize = 9;

/// キャリブレーション結果の出所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationSource {
    /// 保存済みの結果をそのまま返した
    Stored,
    /// 観測から計算して保存した
    Computed,
    /// 有効な観測が無く固定値を返した（保存しない）
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub record: CalibrationRecord,
    pub source: CalibrationSource,
}

/// ボード1枚分の対応点（モデル座標 ↔ 画像座標）
#[derive(Debug, Clone)]
pub(crate) struct BoardView {
    pub model: Vec<Point3<f64>>,
    pub image: Vec<Point2<f64>>,
}

impl BoardView {
    pub fn from_observation(obs: &ChessboardObservation, square_size: f64) -> Option<Self> {
        let image = obs.image_points()?;
        Some(Self {
            model: model_points(obs.grid_rows, obs.grid_cols, square_size),
            image,
        })
    }

    /// z=0 平面上の (x, y)
    pub fn planar_model(&self) -> Vec<Point2<f64>> {
        self.model.iter().map(|p| Point2::new(p.x, p.y)).collect()
    }
}

pub struct MonocularCalibrator {
    store: CalibrationStore,
    board: Option<(usize, usize)>,
    square_size: f64,
    max_iterations: usize,
}

impl MonocularCalibrator {
    pub fn new(store: CalibrationStore) -> Self {
        Self {
            store,
            board: None,
            square_size: 1.0,
            max_iterations: 100,
        }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(CalibrationStore::new(&config.store_dir))
            .with_board(config.board_rows, config.board_cols)
            .with_square_size(config.square_size)
            .with_max_iterations(config.max_iterations)
    }

    /// 想定するボードの内部交点数。格子サイズの違う観測は使わない
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

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// カメラ `key` の内部パラメータを求める
    ///
    /// 保存済みならそれを返す。画像が無い、またはどの画像でもボードが
    /// 見つからない場合は固定の近似値を返す（エラーにはしない）。
    /// 計算した結果は返す前に保存する。
    pub fn calibrate(
        &self,
        key: &str,
        image_size: (u32, u32),
        observations: &[ChessboardObservation],
    ) -> Result<Calibration, CalibrationError> {
        match self.store.load(key) {
            Ok(record) => {
                tracing::info!(
                    "using stored calibration for '{}' (error {:.4} px)",
                    key,
                    record.reprojection_error
                );
                return Ok(Calibration {
                    record,
                    source: CalibrationSource::Stored,
                });
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e @ (StoreError::IncompatibleVersion { .. } | StoreError::Format { .. })) => {
                tracing::warn!("stored calibration for '{}' is unusable ({}), recalibrating", key, e);
            }
            Err(e) => return Err(e.into()),
        }
        self.recalibrate(key, image_size, observations)
    }

    /// 保存済みの結果を無視して計算し直す
    pub fn recalibrate(
        &self,
        key: &str,
        image_size: (u32, u32),
        observations: &[ChessboardObservation],
    ) -> Result<Calibration, CalibrationError> {
        if observations.is_empty() {
            tracing::warn!("no calibration images for '{}', using default intrinsics", key);
            return Ok(fallback());
        }

        let views: Vec<BoardView> = observations
            .iter()
            .filter(|obs| matches_board(obs, self.board))
            .filter_map(|obs| {
                let view = BoardView::from_observation(obs, self.square_size);
                if view.is_none() {
                    tracing::debug!("skipping {}: chessboard not detected", obs.image_id);
                }
                view
            })
            .collect();

        if views.is_empty() {
            tracing::warn!(
                "chessboard not found in any of {} images for '{}', using default intrinsics",
                observations.len(),
                key
            );
            return Ok(fallback());
        }

        let record = solve_intrinsics(&views, image_size, self.max_iterations)?;
        self.store.save(key, &record)?;
        tracing::info!(
            "calibrated '{}' from {}/{} images: fx={:.2} fy={:.2} cx={:.2} cy={:.2} error={:.4} px",
            key,
            views.len(),
            observations.len(),
            record.intrinsics.fx,
            record.intrinsics.fy,
            record.intrinsics.cx,
            record.intrinsics.cy,
            record.reprojection_error
        );

        Ok(Calibration {
            record,
            source: CalibrationSource::Computed,
        })
    }
}

fn fallback() -> Calibration {
    Calibration {
        record: CalibrationRecord::fallback(),
        source: CalibrationSource::Fallback,
    }
}

// --- 最適化 ---

struct IntrinsicsProblem<'a> {
    views: &'a [BoardView],
}

fn params_to_intrinsics(p: &[f64]) -> CameraIntrinsics {
    CameraIntrinsics::new(p[0], p[1], p[2], p[3]).with_distortion([p[4], p[5], p[6], p[7], p[8]])
}

impl Residuals for IntrinsicsProblem<'_> {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let p = params.as_slice();
        let intr = params_to_intrinsics(p);
        let mut out = Vec::new();
        for (i, view) in self.views.iter().enumerate() {
            let offset = INTRINSIC_PARAMS + 6 * i;
            let (r, t) = params_to_pose(&p[offset..offset + 6]);
            for (model, observed) in view.model.iter().zip(&view.image) {
                match project_point(&intr, &(r * model.coords + t)) {
                    Some(q) => {
                        out.push(q.x - observed.x);
                        out.push(q.y - observed.y);
                    }
                    None => {
                        out.push(BEHIND_CAMERA_PENALTY);
                        out.push(BEHIND_CAMERA_PENALTY);
                    }
                }
            }
        }
        DVector::from_vec(out)
    }
}

/// 有効なボード観測から内部パラメータと歪み係数を推定する
///
/// 線形初期値（ホモグラフィ + Zhang法）を LM で全ビュー同時に詰める。
pub(crate) fn solve_intrinsics(
    views: &[BoardView],
    image_size: (u32, u32),
    max_iterations: usize,
) -> Result<CalibrationRecord, CalibrationError> {
    let homographies = views
        .iter()
        .map(|v| dlt_homography(&v.planar_model(), &v.image))
        .collect::<Result<Vec<_>, _>>()?;

    let initial = if homographies.len() >= 3 {
        zhang_intrinsics(&homographies, image_size).unwrap_or_else(|e| {
            tracing::debug!("Zhang initialization failed ({}), assuming centered principal point", e);
            centered_intrinsics(&homographies, image_size)
        })
    } else {
        centered_intrinsics(&homographies, image_size)
    };

    let k = initial.matrix();
    let mut x0 = vec![initial.fx, initial.fy, initial.cx, initial.cy, 0.0, 0.0, 0.0, 0.0, 0.0];
    for h in &homographies {
        let (r, t) = planar_pose(&k, h)?;
        x0.extend_from_slice(&pose_to_params(&r, &t));
    }
    let x0 = DVector::from_vec(x0);

    let residual_count: usize = views.iter().map(|v| 2 * v.image.len()).sum();
    if residual_count < x0.len() {
        return Err(CalibrationError::Degenerate(format!(
            "{} residuals cannot constrain {} parameters",
            residual_count,
            x0.len()
        )));
    }

    let problem = IntrinsicsProblem { views };
    let initial_error = rms_pixel_error(&problem.residuals(&x0));
    let solution = minimize(&problem, x0.clone(), max_iterations);
    let refined_error = rms_pixel_error(&problem.residuals(&solution.params));
    tracing::debug!(
        "intrinsics LM: {} evaluations, converged={}, error {:.4} -> {:.4} px",
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

    let intrinsics = params_to_intrinsics(params.as_slice());
    if !intrinsics.is_valid() || !error.is_finite() {
        return Err(CalibrationError::Degenerate(
            "optimization produced invalid intrinsics".into(),
        ));
    }
    Ok(CalibrationRecord::new(intrinsics, error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Rotation3, Vector3};

    const ROWS: usize = 4;
    const COLS: usize = 7;

    fn board_poses() -> Vec<(Rotation3<f64>, Vector3<f64>)> {
        vec![
            (Rotation3::from_euler_angles(0.2, 0.1, 0.05), Vector3::new(-3.0, -2.0, 12.0)),
            (Rotation3::from_euler_angles(-0.15, 0.25, -0.1), Vector3::new(-1.0, -3.0, 14.0)),
            (Rotation3::from_euler_angles(0.1, -0.3, 0.2), Vector3::new(-2.0, -1.0, 10.0)),
            (Rotation3::from_euler_angles(-0.25, -0.1, 0.0), Vector3::new(-1.5, -3.5, 13.0)),
            (Rotation3::from_euler_angles(0.3, 0.2, -0.15), Vector3::new(-2.5, -2.5, 11.0)),
        ]
    }

    fn observe(intr: &CameraIntrinsics, id: usize, r: &Rotation3<f64>, t: &Vector3<f64>) -> ChessboardObservation {
        let corners = model_points(ROWS, COLS, 1.0)
            .iter()
            .map(|p| {
                let q = project_point(intr, &(r * p.coords + t)).unwrap();
                [q.x, q.y]
            })
            .collect();
        ChessboardObservation::found(format!("img{}", id), ROWS, COLS, corners)
    }

    fn observations(intr: &CameraIntrinsics) -> Vec<ChessboardObservation> {
        board_poses()
            .iter()
            .enumerate()
            .map(|(i, (r, t))| observe(intr, i, r, t))
            .collect()
    }

    fn calibrator(dir: &tempfile::TempDir) -> MonocularCalibrator {
        MonocularCalibrator::new(CalibrationStore::new(dir.path()))
    }

    #[test]
    fn test_recovers_pinhole_intrinsics() {
        let dir = tempfile::tempdir().unwrap();
        let truth = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        let cal = calibrator(&dir).calibrate("cam0", (640, 480), &observations(&truth)).unwrap();
        assert_eq!(cal.source, CalibrationSource::Computed);
        let intr = cal.record.intrinsics;
        assert!((intr.fx - 800.0).abs() < 0.5, "fx = {}", intr.fx);
        assert!((intr.fy - 790.0).abs() < 0.5, "fy = {}", intr.fy);
        assert!((intr.cx - 330.0).abs() < 0.5, "cx = {}", intr.cx);
        assert!((intr.cy - 245.0).abs() < 0.5, "cy = {}", intr.cy);
        assert!(cal.record.reprojection_error < 1e-3);
    }

    #[test]
    fn test_refines_distortion() {
        let dir = tempfile::tempdir().unwrap();
        let truth = CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0).with_distortion([0.05, 0.0, 0.0, 0.0, 0.0]);
        let cal = calibrator(&dir).calibrate("cam0", (640, 480), &observations(&truth)).unwrap();
        assert!(cal.record.reprojection_error < 0.05, "error = {}", cal.record.reprojection_error);
        assert!((cal.record.intrinsics.fx - 800.0).abs() < 2.0);
    }

    #[test]
    fn test_result_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let truth = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        let calibrator = calibrator(&dir);
        let first = calibrator.calibrate("cam0", (640, 480), &observations(&truth)).unwrap();
        assert_eq!(calibrator.store().load("cam0").unwrap(), first.record);

        // 2回目は観測を無視して保存済みの値を返す
        let second = calibrator.calibrate("cam0", (640, 480), &[]).unwrap();
        assert_eq!(second.source, CalibrationSource::Stored);
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn test_no_images_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = calibrator(&dir);
        let a = calibrator.calibrate("cam0", (640, 480), &[]).unwrap();
        let b = calibrator.calibrate("cam0", (640, 480), &[]).unwrap();
        assert_eq!(a.source, CalibrationSource::Fallback);
        assert_eq!(a.record, CalibrationRecord::fallback());
        assert_eq!(a, b);
        // フォールバックは保存しない
        assert!(calibrator.store().load("cam0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_no_detections_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let obs = vec![
            ChessboardObservation::not_found("a", ROWS, COLS),
            ChessboardObservation::not_found("b", ROWS, COLS),
        ];
        let cal = calibrator(&dir).calibrate("cam0", (640, 480), &obs).unwrap();
        assert_eq!(cal.source, CalibrationSource::Fallback);
        assert_eq!(cal.record, CalibrationRecord::fallback());
    }

    #[test]
    fn test_failed_detections_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let truth = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        let mut obs = observations(&truth);
        obs.insert(1, ChessboardObservation::not_found("blurry", ROWS, COLS));
        obs.push(ChessboardObservation::found("partial", ROWS, COLS, vec![[1.0, 1.0]; 5]));
        let cal = calibrator(&dir).calibrate("cam0", (640, 480), &obs).unwrap();
        assert_eq!(cal.source, CalibrationSource::Computed);
        assert!((cal.record.intrinsics.fx - 800.0).abs() < 0.5);
    }

    #[test]
    fn test_observations_of_other_boards_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let truth = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        let mut obs = observations(&truth);
        // 行列を入れ替えた申告はコーナー数が合っていても別のボード
        obs.push(ChessboardObservation::found("rotated", COLS, ROWS, vec![[320.0, 240.0]; ROWS * COLS]));

        let cal = calibrator(&dir)
            .with_board(ROWS, COLS)
            .calibrate("cam0", (640, 480), &obs)
            .unwrap();
        assert_eq!(cal.source, CalibrationSource::Computed);
        assert!((cal.record.intrinsics.fx - 800.0).abs() < 0.5);

        // 想定外のボードしか無ければフォールバック
        let cal = calibrator(&dir)
            .with_board(5, 8)
            .recalibrate("cam1", (640, 480), &observations(&truth))
            .unwrap();
        assert_eq!(cal.source, CalibrationSource::Fallback);
    }

    #[test]
    fn test_incompatible_stored_record_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cam0.json"), r#"{"version": 0}"#).unwrap();
        let truth = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        let cal = calibrator(&dir).calibrate("cam0", (640, 480), &observations(&truth)).unwrap();
        assert_eq!(cal.source, CalibrationSource::Computed);
    }

    #[test]
    fn test_recalibrate_ignores_stored_record() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = calibrator(&dir);
        calibrator.store().save("cam0", &CalibrationRecord::fallback()).unwrap();
        let truth = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        let cal = calibrator.recalibrate("cam0", (640, 480), &observations(&truth)).unwrap();
        assert_eq!(cal.source, CalibrationSource::Computed);
        assert_eq!(calibrator.store().load("cam0").unwrap(), cal.record);
    }

    #[test]
    fn test_too_few_corners_is_degenerate() {
        let views = vec![BoardView {
            model: model_points(2, 2, 1.0),
            image: vec![
                Point2::new(300.0, 200.0),
                Point2::new(340.0, 200.0),
                Point2::new(300.0, 240.0),
                Point2::new(340.0, 241.0),
            ],
        }];
        let err = solve_intrinsics(&views, (640, 480), 100).unwrap_err();
        assert!(matches!(err, CalibrationError::Degenerate(_)));
    }
}
