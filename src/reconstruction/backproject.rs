use crate::calibration::CameraIntrinsics;
use crate::config::ReconstructionConfig;
use crate::pose::{Landmark, Pose};

use super::{BodyPoint3D, BodyPoints};

/// 単眼カメラ用の逆投影
///
/// 深度 = reference_depth + z_relative * depth_scale という経験則で奥行きを決め、
/// ピンホールモデルを逆にたどる。ポーズ推定の相対深度はメートルではないので、
/// 結果は奥行きの前後関係こそ保つが計測値としては不正確。
/// 歪み補正は行わない（入力画像は補正済みとみなす）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackProjector {
    /// 基準深度（メートル）
    pub reference_depth: f64,
    /// 相対深度に掛ける係数
    pub depth_scale: f64,
}

impl Default for BackProjector {
    fn default() -> Self {
        Self {
            reference_depth: 1.0,
            depth_scale: 0.5,
        }
    }
}

impl BackProjector {
    pub fn new(reference_depth: f64) -> Self {
        Self {
            reference_depth,
            ..Self::default()
        }
    }

    pub fn with_depth_scale(mut self, depth_scale: f64) -> Self {
        self.depth_scale = depth_scale;
        self
    }

    pub fn from_config(config: &ReconstructionConfig) -> Self {
        Self::new(config.reference_depth).with_depth_scale(config.depth_scale)
    }

    pub fn estimated_depth(&self, z_relative: f64) -> f64 {
        self.reference_depth + z_relative * self.depth_scale
    }

    pub fn project_landmark(
        &self,
        landmark: &Landmark,
        image_size: (u32, u32),
        intrinsics: &CameraIntrinsics,
    ) -> BodyPoint3D {
        let (px, py) = landmark.to_pixel(image_size.0, image_size.1);
        let depth = self.estimated_depth(landmark.z);
        BodyPoint3D::new(
            (px - intrinsics.cx) * depth / intrinsics.fx,
            (py - intrinsics.cy) * depth / intrinsics.fy,
            depth,
            landmark.visibility,
        )
    }

    /// 17関節すべてを逆投影（可視度によるフィルタはしない）
    pub fn project_pose(&self, pose: &Pose, image_size: (u32, u32), intrinsics: &CameraIntrinsics) -> BodyPoints {
        pose.iter()
            .map(|(joint, lm)| (joint, self.project_landmark(lm, image_size, intrinsics)))
            .collect()
    }
}
