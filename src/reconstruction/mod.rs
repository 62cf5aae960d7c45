//! 2Dランドマーク → カメラ座標系の3D点
//!
//! - 単眼: 相対深度による近似的な逆投影 (`BackProjector`)
//! - ステレオ: DLT三角測量 (`Triangulator`)
//!
//! 出力はカメラ1（基準カメラ）の座標系: x 右, y 下, z 前方（メートル）。

pub mod backproject;
pub mod triangulation;

use nalgebra::Vector3;
use std::collections::BTreeMap;

use crate::pose::JointIndex;

pub use backproject::BackProjector;
pub use triangulation::{triangulate_point, CameraProjection, Triangulator};

/// 復元された関節1つ分の3D点
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BodyPoint3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// 可視度 (0.0〜1.0)
    pub visibility: f64,
}

impl BodyPoint3D {
    pub fn new(x: f64, y: f64, z: f64, visibility: f64) -> Self {
        Self { x, y, z, visibility }
    }

    pub fn from_position(position: &Vector3<f64>, visibility: f64) -> Self {
        Self::new(position.x, position.y, position.z, visibility)
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

/// 1フレーム分の復元結果（復元できた関節のみ）
pub type BodyPoints = BTreeMap<JointIndex, BodyPoint3D>;
