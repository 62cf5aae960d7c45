use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, RowVector4, Vector3, Vector4};

use crate::calibration::distortion::undistort_pixel;
use crate::calibration::{projection_matrix, CameraIntrinsics, StereoExtrinsics};
use crate::config::ReconstructionConfig;
use crate::pose::{Landmark, Pose};

use super::{BodyPoint3D, BodyPoints};

/// 再投影誤差の既定上限（ピクセル）
pub const DEFAULT_MAX_REPROJECTION_ERROR: f64 = 75.0;

/// カメラ1台分の射影情報（射影行列 P = K[R|t]）
#[derive(Debug, Clone, PartialEq)]
pub struct CameraProjection {
    pub projection: Matrix3x4<f64>,
    /// 歪み補正用
    pub intrinsics: CameraIntrinsics,
    pub image_width: u32,
    pub image_height: u32,
}

impl CameraProjection {
    pub fn from_pose(
        intrinsics: CameraIntrinsics,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
        image_size: (u32, u32),
    ) -> Self {
        Self {
            projection: projection_matrix(&intrinsics, rotation, translation),
            intrinsics,
            image_width: image_size.0,
            image_height: image_size.1,
        }
    }

    /// 基準カメラ（原点・回転なし）
    pub fn reference(intrinsics: CameraIntrinsics, image_size: (u32, u32)) -> Self {
        Self::from_pose(intrinsics, &Matrix3::identity(), &Vector3::zeros(), image_size)
    }

    /// 3D点を（歪みなしの）ピクセル座標へ
    pub fn project(&self, point: &Vector3<f64>) -> Option<Point2<f64>> {
        let p = self.projection * point.push(1.0);
        if p.z.abs() < f64::EPSILON {
            return None;
        }
        Some(Point2::new(p.x / p.z, p.y / p.z))
    }

    /// 正規化座標(0-1)→歪みピクセル座標→歪み補正ピクセル座標
    pub fn undistorted_pixel(&self, landmark: &Landmark) -> (f64, f64) {
        let (u, v) = landmark.to_pixel(self.image_width, self.image_height);
        undistort_pixel(&self.intrinsics, u, v)
    }
}

/// 2視点のDLT三角測量
///
/// 各視点 (x, y) について y·P[2] − P[1] と P[0] − x·P[2] の2行を積み、
/// 正規方程式 AᵀA の最小固有値に対応する固有ベクトルを同次座標解とする。
/// 無限遠点（同次座標の第4成分が 0）のときだけ None。
pub fn triangulate_point(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    pt1: (f64, f64),
    pt2: (f64, f64),
) -> Option<Vector3<f64>> {
    let mut ata = Matrix4::zeros();
    for (p, (x, y)) in [(p1, pt1), (p2, pt2)] {
        let rows: [RowVector4<f64>; 2] = [
            y * p.row(2) - p.row(1),
            p.row(0) - x * p.row(2),
        ];
        for row in rows {
            ata += row.transpose() * row;
        }
    }

    let eigen = ata.symmetric_eigen();
    let mut min_idx = 0;
    for i in 1..4 {
        if eigen.eigenvalues[i].abs() < eigen.eigenvalues[min_idx].abs() {
            min_idx = i;
        }
    }
    let x: Vector4<f64> = eigen.eigenvectors.column(min_idx).into_owned();

    let w = x[3];
    if w.abs() < f64::EPSILON {
        return None;
    }
    Some(Vector3::new(x[0] / w, x[1] / w, x[2] / w))
}

/// 同期した2視点のポーズからの三角測量
///
/// 両方の視点で可視度が閾値以上の関節だけを対象にし、
/// 再投影誤差が上限を超えた関節は捨てる。
#[derive(Debug, Clone)]
pub struct Triangulator {
    pub left: CameraProjection,
    pub right: CameraProjection,
    pub visibility_threshold: f64,
    pub max_reprojection_error: f64,
}

impl Triangulator {
    pub fn new(left: CameraProjection, right: CameraProjection) -> Self {
        Self {
            left,
            right,
            visibility_threshold: 0.5,
            max_reprojection_error: DEFAULT_MAX_REPROJECTION_ERROR,
        }
    }

    /// キャリブレーション結果から構築（カメラ1が原点: P1 = K1[I|0], P2 = K2[R|T]）
    pub fn from_calibration(
        left: CameraIntrinsics,
        right: CameraIntrinsics,
        extrinsics: &StereoExtrinsics,
        image_size: (u32, u32),
    ) -> Self {
        Self::new(
            CameraProjection::reference(left, image_size),
            CameraProjection::from_pose(right, &extrinsics.rotation, &extrinsics.translation, image_size),
        )
    }

    pub fn with_visibility_threshold(mut self, threshold: f64) -> Self {
        self.visibility_threshold = threshold;
        self
    }

    pub fn with_max_reprojection_error(mut self, pixels: f64) -> Self {
        self.max_reprojection_error = pixels;
        self
    }

    pub fn with_config(self, config: &ReconstructionConfig) -> Self {
        self.with_visibility_threshold(config.visibility_threshold)
            .with_max_reprojection_error(config.max_reprojection_error)
    }

    pub fn triangulate_pose(&self, left: &Pose, right: &Pose) -> BodyPoints {
        let mut points = BodyPoints::new();
        for ((joint, l), (_, r)) in left.iter().zip(right.iter()) {
            if !l.is_valid(self.visibility_threshold) || !r.is_valid(self.visibility_threshold) {
                continue;
            }
            let pt1 = self.left.undistorted_pixel(l);
            let pt2 = self.right.undistorted_pixel(r);
            match triangulate_point(&self.left.projection, &self.right.projection, pt1, pt2) {
                Some(p) => {
                    let err = self.reprojection_error(&p, pt1, pt2);
                    if err > self.max_reprojection_error {
                        tracing::debug!("{} rejected: reprojection error {:.1} px", joint.name(), err);
                        continue;
                    }
                    let visibility = (l.visibility + r.visibility) / 2.0;
                    points.insert(joint, BodyPoint3D::from_position(&p, visibility));
                }
                None => tracing::debug!("{} triangulated to a point at infinity", joint.name()),
            }
        }
        points
    }

    /// 3D点を両カメラに再投影した時の最大誤差（ピクセル）
    pub fn reprojection_error(&self, point: &Vector3<f64>, pt1: (f64, f64), pt2: (f64, f64)) -> f64 {
        [(&self.left, pt1), (&self.right, pt2)]
            .into_iter()
            .map(|(cam, (u, v))| match cam.project(point) {
                Some(q) => ((q.x - u).powi(2) + (q.y - v).powi(2)).sqrt(),
                None => f64::INFINITY,
            })
            .fold(0.0, f64::max)
    }
}
