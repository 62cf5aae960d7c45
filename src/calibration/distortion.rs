//! 放射・接線歪みモデル (k1, k2, p1, p2, k3) とピンホール投影

use nalgebra::{Point2, Vector3};

use super::{CameraIntrinsics, Distortion};

/// カメラ後方・無限遠とみなす z の下限
const MIN_DEPTH: f64 = 1e-12;

/// 正規化カメラ座標に歪みを適用
pub fn distort_normalized(x: f64, y: f64, d: &Distortion) -> (f64, f64) {
    let [k1, k2, p1, p2, k3] = *d;
    let r2 = x * x + y * y;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
    (xd, yd)
}

/// カメラ座標系の3D点をピクセル座標へ（歪みあり）
///
/// z が 0 以下の点は投影できないので None。
pub fn project_point(intr: &CameraIntrinsics, p: &Vector3<f64>) -> Option<Point2<f64>> {
    if p.z <= MIN_DEPTH {
        return None;
    }
    let (xd, yd) = distort_normalized(p.x / p.z, p.y / p.z, &intr.distortion);
    Some(Point2::new(intr.fx * xd + intr.cx, intr.fy * yd + intr.cy))
}

/// 歪んだピクセル座標 → 理想正規化座標
/// Newton-Raphson法による歪み補正（大きな歪み係数でも収束）
pub fn undistort_normalized(intr: &CameraIntrinsics, u_dist: f64, v_dist: f64) -> (f64, f64) {
    // ピクセル→正規化カメラ座標（歪みあり = ターゲット）
    let xd = (u_dist - intr.cx) / intr.fx;
    let yd = (v_dist - intr.cy) / intr.fy;

    if !intr.has_distortion() {
        return (xd, yd);
    }

    let [k1, k2, p1, p2, k3] = intr.distortion;
    let mut x = xd;
    let mut y = yd;
    let mut best = (x, y);
    let mut best_residual = f64::MAX;

    for _ in 0..30 {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
        let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

        let (fx_val, fy_val) = {
            let (dx, dy) = distort_normalized(x, y, &intr.distortion);
            (dx - xd, dy - yd)
        };

        let residual = fx_val * fx_val + fy_val * fy_val;
        if residual < best_residual {
            best_residual = residual;
            best = (x, y);
        }
        if residual < 1e-24 {
            break;
        }

        // ヤコビアン
        let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
        let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
        let j10 = j01;
        let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

        let det = j00 * j11 - j01 * j10;
        if det.abs() < 1e-15 {
            break; // 特異ヤコビアン → best値を使用
        }

        x -= (j11 * fx_val - j01 * fy_val) / det;
        y -= (-j10 * fx_val + j00 * fy_val) / det;
    }

    best
}

/// 歪んだピクセル座標 → 歪み補正後のピクセル座標
pub fn undistort_pixel(intr: &CameraIntrinsics, u_dist: f64, v_dist: f64) -> (f64, f64) {
    let (x, y) = undistort_normalized(intr, u_dist, v_dist);
    (x * intr.fx + intr.cx, y * intr.fy + intr.cy)
}
