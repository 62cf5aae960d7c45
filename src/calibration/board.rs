use anyhow::Result;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// 1枚の画像に対するチェスボードコーナー検出結果
///
/// `corners` が None なら検出失敗（その画像はスキップされる）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChessboardObservation {
    pub image_id: String,
    pub grid_rows: usize,
    pub grid_cols: usize,
    #[serde(default)]
    pub corners: Option<Vec<[f64; 2]>>,
}

impl ChessboardObservation {
    pub fn found(image_id: impl Into<String>, rows: usize, cols: usize, corners: Vec<[f64; 2]>) -> Self {
        Self {
            image_id: image_id.into(),
            grid_rows: rows,
            grid_cols: cols,
            corners: Some(corners),
        }
    }

    pub fn not_found(image_id: impl Into<String>, rows: usize, cols: usize) -> Self {
        Self {
            image_id: image_id.into(),
            grid_rows: rows,
            grid_cols: cols,
            corners: None,
        }
    }

    /// コーナーが揃っている（rows*cols 個）か
    pub fn is_valid(&self) -> bool {
        match &self.corners {
            Some(c) => self.grid_rows > 0 && self.grid_cols > 0 && c.len() == self.grid_rows * self.grid_cols,
            None => false,
        }
    }

    /// 有効な観測のみコーナー列を返す
    pub fn image_points(&self) -> Option<Vec<Point2<f64>>> {
        if !self.is_valid() {
            return None;
        }
        self.corners
            .as_ref()
            .map(|c| c.iter().map(|p| Point2::new(p[0], p[1])).collect())
    }

    pub fn same_grid(&self, other: &Self) -> bool {
        self.grid_rows == other.grid_rows && self.grid_cols == other.grid_cols
    }

    pub fn has_grid(&self, rows: usize, cols: usize) -> bool {
        self.grid_rows == rows && self.grid_cols == cols
    }
}

/// 想定ボード（rows, cols）と格子サイズが違う観測は警告して除外する。None なら何でも通す。
pub(crate) fn matches_board(obs: &ChessboardObservation, board: Option<(usize, usize)>) -> bool {
    match board {
        Some((rows, cols)) if !obs.has_grid(rows, cols) => {
            tracing::warn!(
                "skipping {}: {}x{} board, expected {}x{}",
                obs.image_id,
                obs.grid_rows,
                obs.grid_cols,
                rows,
                cols
            );
            false
        }
        _ => true,
    }
}

/// ボード座標系（z=0平面）のコーナー位置
///
/// コーナー i は ((i mod rows) * s, (i div rows) * s, 0)。
pub fn model_points(rows: usize, cols: usize, square_size: f64) -> Vec<Point3<f64>> {
    (0..rows * cols)
        .map(|i| {
            let x = (i % rows) as f64 * square_size;
            let y = (i / rows) as f64 * square_size;
            Point3::new(x, y, 0.0)
        })
        .collect()
}

/// 外部のコーナー検出器との境界
///
/// グレースケール画像と格子サイズからサブピクセル精度のコーナー列を返す。
/// 見つからなければ `Ok(None)`。
pub trait CornerDetector {
    type Image;

    fn find_corners(&mut self, image: &Self::Image, rows: usize, cols: usize) -> Result<Option<Vec<[f64; 2]>>>;
}

/// 画像列からキャリブレーション用の観測列を作る
///
/// 順序は入力順のまま（ステレオではインデックスでペアにするため）。
pub fn detect_observations<'a, D, I>(
    detector: &mut D,
    images: I,
    rows: usize,
    cols: usize,
) -> Result<Vec<ChessboardObservation>>
where
    D: CornerDetector,
    D::Image: 'a,
    I: IntoIterator<Item = (String, &'a D::Image)>,
{
    let mut observations = Vec::new();
    for (image_id, image) in images {
        let obs = match detector.find_corners(image, rows, cols)? {
            Some(corners) => ChessboardObservation::found(image_id, rows, cols, corners),
            None => {
                tracing::debug!("chessboard not found in {}", image_id);
                ChessboardObservation::not_found(image_id, rows, cols)
            }
        };
        observations.push(obs);
    }
    Ok(observations)
}
