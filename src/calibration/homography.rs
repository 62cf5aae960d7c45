//! 線形初期値: 平面ホモグラフィ、Zhang法による K 推定、H からのボード姿勢

use nalgebra::{DMatrix, Matrix3, Point2, Rotation3, SVector, Vector3};

use super::CameraIntrinsics;
use crate::error::CalibrationError;

/// 対称行列 AᵀA の最小固有値に対応する固有ベクトル（= A の最小特異ベクトル）
fn null_vector(a: &DMatrix<f64>) -> nalgebra::DVector<f64> {
    let ata = a.transpose() * a;
    let eigen = ata.symmetric_eigen();
    let mut min_idx = 0;
    for i in 1..eigen.eigenvalues.len() {
        if eigen.eigenvalues[i].abs() < eigen.eigenvalues[min_idx].abs() {
            min_idx = i;
        }
    }
    eigen.eigenvectors.column(min_idx).into_owned()
}

/// 重心を原点、平均距離を √2 に揃える相似変換（Hartley正規化）
fn normalization(points: &[Point2<f64>]) -> Result<Matrix3<f64>, CalibrationError> {
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (mx, my) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mx).powi(2) + (p.y - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if !(mean_dist > 1e-12) {
        return Err(CalibrationError::Degenerate("coincident points".into()));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0))
}

fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// 正規化DLTで x' ~ H x となる H を推定（H[2,2] = 1 に正規化）
pub fn dlt_homography(world: &[Point2<f64>], image: &[Point2<f64>]) -> Result<Matrix3<f64>, CalibrationError> {
    let n = world.len();
    if n < 4 || image.len() != n {
        return Err(CalibrationError::Degenerate(format!(
            "homography needs >= 4 correspondences, got {}",
            n.min(image.len())
        )));
    }

    let t_world = normalization(world)?;
    let t_image = normalization(image)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in world.iter().zip(image).enumerate() {
        let w = apply(&t_world, pw);
        let m = apply(&t_image, pi);
        let (x, y, u, v) = (w.x, w.y, m.x, m.y);

        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h = null_vector(&a);
    let h_norm = Matrix3::from_row_slice(h.as_slice());

    let t_image_inv = t_image
        .try_inverse()
        .ok_or_else(|| CalibrationError::Degenerate("singular normalization".into()))?;
    let mut h_mat = t_image_inv * h_norm * t_world;

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    if h_mat.iter().any(|v| !v.is_finite()) {
        return Err(CalibrationError::Degenerate("non-finite homography".into()));
    }
    Ok(h_mat)
}

/// 画像中心を原点・長辺を1に揃える変換（K推定の数値安定化用）
fn image_normalization(image_size: (u32, u32)) -> (Matrix3<f64>, f64, f64, f64) {
    let (w, h) = (image_size.0 as f64, image_size.1 as f64);
    let s = 1.0 / w.max(h).max(1.0);
    let (ux, uy) = (w / 2.0, h / 2.0);
    let n = Matrix3::new(s, 0.0, -s * ux, 0.0, s, -s * uy, 0.0, 0.0, 1.0);
    (n, s, ux, uy)
}

/// Zhang法の v_ij(H)
fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Zhang法の閉形式解で K を推定（歪みなし・スキュー無視）
///
/// 3ビュー以上必要。
pub fn zhang_intrinsics(homographies: &[Matrix3<f64>], image_size: (u32, u32)) -> Result<CameraIntrinsics, CalibrationError> {
    let m = homographies.len();
    if m < 3 {
        return Err(CalibrationError::Degenerate(format!("Zhang init needs >= 3 views, got {}", m)));
    }
    let (n, s, ux, uy) = image_normalization(image_size);

    let mut v = DMatrix::<f64>::zeros(2 * m, 6);
    for (k, h) in homographies.iter().enumerate() {
        let h = n * h;
        let v11 = v_ij(&h, 0, 0);
        let v22 = v_ij(&h, 1, 1);
        let v12 = v_ij(&h, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let mut b = null_vector(&v);
    // b は符号不定。B は正定値なので B11 > 0 に揃える
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if !(denom > 0.0) || !(b11 > 0.0) {
        return Err(CalibrationError::Degenerate("image of absolute conic is not positive definite".into()));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if !(lambda / b11 > 0.0) {
        return Err(CalibrationError::Degenerate("invalid sign for lambda".into()));
    }
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let intr = CameraIntrinsics::new(alpha / s, beta / s, u0 / s + ux, v0 / s + uy);
    if !intr.is_valid() {
        return Err(CalibrationError::Degenerate("Zhang init produced invalid intrinsics".into()));
    }
    Ok(intr)
}

/// 主点を画像中心・fx = fy と仮定した焦点距離の推定
///
/// ビュー数が少ない場合や Zhang 法が破綻した場合の初期値。
pub fn centered_intrinsics(homographies: &[Matrix3<f64>], image_size: (u32, u32)) -> CameraIntrinsics {
    let (n, s, ux, uy) = image_normalization(image_size);

    // B = diag(w, w, 1), w = 1/f^2 について a*w + c = 0 を最小二乗
    let mut num = 0.0;
    let mut den = 0.0;
    for h in homographies {
        let h = n * h;
        let rows = [
            (h[(0, 0)] * h[(0, 1)] + h[(1, 0)] * h[(1, 1)], h[(2, 0)] * h[(2, 1)]),
            (
                h[(0, 0)].powi(2) + h[(1, 0)].powi(2) - h[(0, 1)].powi(2) - h[(1, 1)].powi(2),
                h[(2, 0)].powi(2) - h[(2, 1)].powi(2),
            ),
        ];
        for (a, c) in rows {
            num += a * c;
            den += a * a;
        }
    }

    let w = if den > 0.0 { -num / den } else { 0.0 };
    let f_norm = if w > 0.0 && w.is_finite() {
        1.0 / w.sqrt()
    } else {
        // 拘束が弱い（正対ボード等）: 画角約53°を仮定
        1.0
    };
    let f = f_norm / s;
    CameraIntrinsics::new(f, f, ux, uy)
}

/// ホモグラフィ H（ボード平面→画像）と K からボード姿勢 (R, t) を求める
///
/// 戻り値はボード座標→カメラ座標の変換。ボードがカメラ前方 (t.z > 0) になるよう符号を選ぶ。
pub fn planar_pose(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<(Rotation3<f64>, Vector3<f64>), CalibrationError> {
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| CalibrationError::Degenerate("K is not invertible".into()))?;

    let k_inv_h1 = k_inv * h.column(0);
    let k_inv_h2 = k_inv * h.column(1);
    let k_inv_h3 = k_inv * h.column(2);

    let norm = (k_inv_h1.norm() + k_inv_h2.norm()) * 0.5;
    if !(norm > 0.0) {
        return Err(CalibrationError::Degenerate("degenerate homography".into()));
    }
    let mut lambda = 1.0 / norm;
    if (lambda * k_inv_h3).z < 0.0 {
        lambda = -lambda;
    }

    let r1 = lambda * k_inv_h1;
    let r2 = lambda * k_inv_h2;
    let r3 = r1.cross(&r2);
    let r_approx = Matrix3::from_columns(&[r1, r2, r3]);

    // SO(3) へ射影
    let svd = r_approx.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(CalibrationError::Degenerate("SVD failed".into())),
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }

    Ok((Rotation3::from_matrix_unchecked(r), lambda * k_inv_h3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::distortion::project_point;
    use crate::calibration::model_points;
    use approx::assert_relative_eq;

    fn board_views(intr: &CameraIntrinsics) -> Vec<(Vec<Point2<f64>>, Vec<Point2<f64>>, Rotation3<f64>, Vector3<f64>)> {
        let poses = [
            (Rotation3::from_euler_angles(0.2, 0.1, 0.05), Vector3::new(-3.0, -2.0, 12.0)),
            (Rotation3::from_euler_angles(-0.15, 0.25, -0.1), Vector3::new(-1.0, -3.0, 14.0)),
            (Rotation3::from_euler_angles(0.1, -0.3, 0.2), Vector3::new(-2.0, -1.0, 10.0)),
            (Rotation3::from_euler_angles(-0.25, -0.1, 0.0), Vector3::new(-1.5, -3.5, 13.0)),
        ];
        let model = model_points(4, 7, 1.0);
        poses
            .iter()
            .map(|(r, t)| {
                let world: Vec<_> = model.iter().map(|p| Point2::new(p.x, p.y)).collect();
                let image: Vec<_> = model
                    .iter()
                    .map(|p| project_point(intr, &(r * p.coords + t)).unwrap())
                    .collect();
                (world, image, *r, *t)
            })
            .collect()
    }

    #[test]
    fn test_homography_maps_points() {
        let intr = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        for (world, image, _, _) in board_views(&intr) {
            let h = dlt_homography(&world, &image).unwrap();
            for (w, i) in world.iter().zip(&image) {
                let p = apply(&h, w);
                assert_relative_eq!(p.x, i.x, epsilon = 1e-6);
                assert_relative_eq!(p.y, i.y, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_homography_needs_four_points() {
        let pts = vec![Point2::new(0.0, 0.0); 3];
        assert!(dlt_homography(&pts, &pts).is_err());
    }

    #[test]
    fn test_zhang_recovers_intrinsics() {
        let intr = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        let hs: Vec<_> = board_views(&intr)
            .iter()
            .map(|(w, i, _, _)| dlt_homography(w, i).unwrap())
            .collect();
        let est = zhang_intrinsics(&hs, (640, 480)).unwrap();
        assert_relative_eq!(est.fx, 800.0, epsilon = 1e-3);
        assert_relative_eq!(est.fy, 790.0, epsilon = 1e-3);
        assert_relative_eq!(est.cx, 330.0, epsilon = 1e-3);
        assert_relative_eq!(est.cy, 245.0, epsilon = 1e-3);
    }

    #[test]
    fn test_zhang_needs_three_views() {
        assert!(zhang_intrinsics(&[Matrix3::identity(); 2], (640, 480)).is_err());
    }

    #[test]
    fn test_centered_intrinsics_single_view() {
        let intr = CameraIntrinsics::new(700.0, 700.0, 320.0, 240.0);
        let views = board_views(&intr);
        let h = dlt_homography(&views[0].0, &views[0].1).unwrap();
        let est = centered_intrinsics(&[h], (640, 480));
        assert_relative_eq!(est.fx, 700.0, epsilon = 1e-3);
        assert_eq!(est.fx, est.fy);
        assert_eq!((est.cx, est.cy), (320.0, 240.0));
    }

    #[test]
    fn test_planar_pose_recovers_pose() {
        let intr = CameraIntrinsics::new(800.0, 790.0, 330.0, 245.0);
        for (world, image, r_gt, t_gt) in board_views(&intr) {
            let h = dlt_homography(&world, &image).unwrap();
            let (r, t) = planar_pose(&intr.matrix(), &h).unwrap();
            assert!((t - t_gt).norm() < 1e-6);
            assert!(r.angle_to(&r_gt) < 1e-6);
        }
    }
}
