use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Rotation3, Vector3};

/// 残差関数だけを持つ最小二乗問題（ヤコビアンは中心差分）
pub(crate) trait Residuals {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;
}

struct NumericProblem<'a, R: Residuals> {
    model: &'a R,
    params: DVector<f64>,
}

impl<R: Residuals> LeastSquaresProblem<f64, Dyn, Dyn> for NumericProblem<'_, R> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.model.residuals(&self.params);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let n = self.params.len();
        let mut jac: Option<DMatrix<f64>> = None;
        let mut x = self.params.clone();

        for j in 0..n {
            let x0 = x[j];
            let h = 1e-6 * x0.abs().max(1.0);
            x[j] = x0 + h;
            let r_plus = self.model.residuals(&x);
            x[j] = x0 - h;
            let r_minus = self.model.residuals(&x);
            x[j] = x0;

            let column = (r_plus - r_minus) / (2.0 * h);
            if column.iter().any(|v| !v.is_finite()) {
                return None;
            }
            jac.get_or_insert_with(|| DMatrix::zeros(column.len(), n))
                .set_column(j, &column);
        }
        jac
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Solution {
    pub params: DVector<f64>,
    pub evaluations: usize,
    pub converged: bool,
}

/// Levenberg-Marquardt で残差二乗和を最小化
pub(crate) fn minimize<R: Residuals>(model: &R, x0: DVector<f64>, max_iterations: usize) -> Solution {
    let problem = NumericProblem { model, params: x0 };
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(max_iterations.max(1))
        .minimize(problem);
    Solution {
        params: problem.params,
        evaluations: report.number_of_evaluations,
        converged: report.termination.was_successful(),
    }
}

/// RMS誤差（残差は (dx, dy) の組）
pub(crate) fn rms_pixel_error(residuals: &DVector<f64>) -> f64 {
    let points = residuals.len() / 2;
    if points == 0 {
        return 0.0;
    }
    (residuals.norm_squared() / points as f64).sqrt()
}

// --- 姿勢パラメータ (回転ベクトル + 並進) ---

pub(crate) fn pose_to_params(r: &Rotation3<f64>, t: &Vector3<f64>) -> [f64; 6] {
    let rv = r.scaled_axis();
    [rv.x, rv.y, rv.z, t.x, t.y, t.z]
}

pub(crate) fn params_to_pose(p: &[f64]) -> (Rotation3<f64>, Vector3<f64>) {
    let r = Rotation3::new(Vector3::new(p[0], p[1], p[2]));
    (r, Vector3::new(p[3], p[4], p[5]))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LineFit {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    impl Residuals for LineFit {
        fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.xs.len(),
                self.xs.iter().zip(&self.ys).map(|(x, y)| p[0] * x + p[1] - y),
            )
        }
    }

    #[test]
    fn test_minimize_line_fit() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys = xs.iter().map(|x| 2.0 * x - 1.0).collect();
        let model = LineFit { xs, ys };
        let sol = minimize(&model, DVector::from_vec(vec![0.0, 0.0]), 100);
        assert!((sol.params[0] - 2.0).abs() < 1e-6);
        assert!((sol.params[1] + 1.0).abs() < 1e-6);
        assert!(sol.evaluations > 0);
    }

    #[test]
    fn test_pose_params_roundtrip() {
        let r = Rotation3::from_euler_angles(0.3, -0.2, 0.1);
        let t = Vector3::new(1.0, 2.0, 3.0);
        let (r2, t2) = params_to_pose(&pose_to_params(&r, &t));
        assert!(r.angle_to(&r2) < 1e-6);
        assert_eq!(t, t2);
    }

    #[test]
    fn test_rms_pixel_error() {
        let r = DVector::from_vec(vec![3.0, 4.0, 0.0, 0.0]);
        assert!((rms_pixel_error(&r) - (25.0f64 / 2.0).sqrt()).abs() < 1e-12);
    }
}
