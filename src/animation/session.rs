use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::bones::{bone_for_joint, to_z_up, BoneId};
use crate::reconstruction::BodyPoints;

/// ボーン1本分のサンプル（Z-up 座標系）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoneSample {
    pub location: [f64; 3],
    pub visibility: f64,
}

/// 1フレーム分のボーン位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoneFrame {
    #[serde(rename = "frame")]
    pub frame_index: u64,
    pub bones: BTreeMap<BoneId, BoneSample>,
}

impl BoneFrame {
    /// 関節の3D点をボーンへ割り当て、座標系を変換する（対応の無い関節は捨てる）
    pub fn from_body_points(frame_index: u64, points: &BodyPoints) -> Self {
        let bones = points
            .iter()
            .filter_map(|(&joint, p)| {
                let bone = bone_for_joint(joint)?;
                Some((
                    bone,
                    BoneSample {
                        location: to_z_up([p.x, p.y, p.z]),
                        visibility: p.visibility,
                    },
                ))
            })
            .collect();
        Self { frame_index, bones }
    }
}

/// 1回の録画で得たフレーム列
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnimationSession {
    pub started_at: Option<NaiveDateTime>,
    pub frames: Vec<BoneFrame>,
}

impl AnimationSession {
    pub fn new(started_at: Option<NaiveDateTime>, frames: Vec<BoneFrame>) -> Self {
        Self { started_at, frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 可視度が閾値以上のボーン座標の最小値・最大値（表示範囲の自動調整用）
    pub fn value_range(&self, visibility_threshold: f64) -> Option<(f64, f64)> {
        self.frames
            .iter()
            .flat_map(|f| f.bones.values())
            .filter(|s| s.visibility >= visibility_threshold)
            .flat_map(|s| s.location)
            .fold(None, |range, v| match range {
                None => Some((v, v)),
                Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
            })
    }
}
