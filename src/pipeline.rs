//! 1フレームごとの処理サイクル: ランドマーク → 3D復元 → 録画

use anyhow::{bail, Result};

use crate::animation::{AnimationRecorder, AnimationSession};
use crate::calibration::CameraIntrinsics;
use crate::config::Config;
use crate::error::RecorderError;
use crate::pose::Pose;
use crate::reconstruction::{BackProjector, BodyPoints, Triangulator};

/// 3D復元の方式
#[derive(Debug, Clone)]
pub enum ReconstructionMode {
    /// 1台のカメラ + 相対深度による逆投影
    Monocular {
        projector: BackProjector,
        intrinsics: CameraIntrinsics,
        image_size: (u32, u32),
    },
    /// 2台の同期カメラによる三角測量
    Stereo(Triangulator),
}

/// キャプチャセッションの状態一式
///
/// 2台のカメラのフレームが同じ瞬間のものであることは呼び出し側が保証する。
#[derive(Debug)]
pub struct CaptureContext {
    mode: ReconstructionMode,
    recorder: AnimationRecorder,
    visibility_threshold: f64,
    visibility_warning_ratio: f64,
}

impl CaptureContext {
    pub fn new(mode: ReconstructionMode) -> Self {
        Self {
            mode,
            recorder: AnimationRecorder::new(),
            visibility_threshold: 0.5,
            visibility_warning_ratio: 0.9,
        }
    }

    pub fn monocular(projector: BackProjector, intrinsics: CameraIntrinsics, image_size: (u32, u32)) -> Self {
        Self::new(ReconstructionMode::Monocular {
            projector,
            intrinsics,
            image_size,
        })
    }

    pub fn stereo(triangulator: Triangulator) -> Self {
        Self::new(ReconstructionMode::Stereo(triangulator))
    }

    pub fn with_config(mut self, config: &Config) -> Self {
        self.visibility_threshold = config.reconstruction.visibility_threshold;
        self.visibility_warning_ratio = config.recording.visibility_warning_ratio;
        self
    }

    pub fn mode(&self) -> &ReconstructionMode {
        &self.mode
    }

    pub fn recorder(&self) -> &AnimationRecorder {
        &self.recorder
    }

    pub fn start_recording(&mut self) -> Result<(), RecorderError> {
        self.recorder.start()
    }

    pub fn stop_recording(&mut self) -> Option<AnimationSession> {
        self.recorder.stop()
    }

    /// 単眼モードで1フレーム処理
    pub fn process_monocular(&mut self, pose: &Pose) -> Result<BodyPoints> {
        let points = match &self.mode {
            ReconstructionMode::Monocular {
                projector,
                intrinsics,
                image_size,
            } => projector.project_pose(pose, *image_size, intrinsics),
            ReconstructionMode::Stereo(_) => bail!("context is configured for stereo reconstruction"),
        };
        self.warn_if_occluded("camera", pose);
        self.recorder.submit_frame(&points);
        Ok(points)
    }

    /// ステレオモードで1フレーム処理（同じ瞬間の2視点）
    pub fn process_stereo(&mut self, left: &Pose, right: &Pose) -> Result<BodyPoints> {
        let points = match &self.mode {
            ReconstructionMode::Stereo(triangulator) => triangulator.triangulate_pose(left, right),
            ReconstructionMode::Monocular { .. } => bail!("context is configured for monocular reconstruction"),
        };
        self.warn_if_occluded("left camera", left);
        self.warn_if_occluded("right camera", right);
        self.recorder.submit_frame(&points);
        Ok(points)
    }

    fn warn_if_occluded(&self, label: &str, pose: &Pose) {
        let ratio = pose.visible_ratio(self.visibility_threshold);
        if ratio < self.visibility_warning_ratio {
            tracing::warn!(
                "{}: only {:.0}% of landmarks visible, keep the whole body in frame",
                label,
                ratio * 100.0
            );
        }
    }
}
