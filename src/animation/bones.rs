use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pose::JointIndex;

/// 出力アニメーションのボーン
///
/// 名前は取り込み側（3Dツールのリグ）のボーン名に合わせる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BoneId {
    #[serde(rename = "shoulder.L")]
    ShoulderL,
    #[serde(rename = "shoulder.R")]
    ShoulderR,
    #[serde(rename = "upper_arm.L")]
    UpperArmL,
    #[serde(rename = "upper_arm.R")]
    UpperArmR,
    #[serde(rename = "forearm.L")]
    ForearmL,
    #[serde(rename = "forearm.R")]
    ForearmR,
    #[serde(rename = "thigh.L")]
    ThighL,
    #[serde(rename = "thigh.R")]
    ThighR,
    #[serde(rename = "shin.L")]
    ShinL,
    #[serde(rename = "shin.R")]
    ShinR,
    #[serde(rename = "foot.L")]
    FootL,
    #[serde(rename = "foot.R")]
    FootR,
}

impl BoneId {
    pub const COUNT: usize = 12;

    pub fn name(self) -> &'static str {
        match self {
            Self::ShoulderL => "shoulder.L",
            Self::ShoulderR => "shoulder.R",
            Self::UpperArmL => "upper_arm.L",
            Self::UpperArmR => "upper_arm.R",
            Self::ForearmL => "forearm.L",
            Self::ForearmR => "forearm.R",
            Self::ThighL => "thigh.L",
            Self::ThighR => "thigh.R",
            Self::ShinL => "shin.L",
            Self::ShinR => "shin.R",
            Self::FootL => "foot.L",
            Self::FootR => "foot.R",
        }
    }
}

impl fmt::Display for BoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 関節 → ボーン対応表（JointIndex の並び順）
///
/// 関節の位置をそのボーンの location として使う。顔と足先は対応なし。
pub const JOINT_BONES: [Option<BoneId>; JointIndex::COUNT] = [
    None,                      // Nose
    None,                      // LeftEye
    None,                      // RightEye
    Some(BoneId::ShoulderL),   // LeftShoulder
    Some(BoneId::ShoulderR),   // RightShoulder
    Some(BoneId::UpperArmL),   // LeftElbow
    Some(BoneId::UpperArmR),   // RightElbow
    Some(BoneId::ForearmL),    // LeftWrist
    Some(BoneId::ForearmR),    // RightWrist
    Some(BoneId::ThighL),      // LeftHip
    Some(BoneId::ThighR),      // RightHip
    Some(BoneId::ShinL),       // LeftKnee
    Some(BoneId::ShinR),       // RightKnee
    Some(BoneId::FootL),       // LeftAnkle
    Some(BoneId::FootR),       // RightAnkle
    None,                      // LeftFoot
    None,                      // RightFoot
];

pub fn bone_for_joint(joint: JointIndex) -> Option<BoneId> {
    JOINT_BONES[joint as usize]
}

/// カメラ座標系 (x 右, y 下, z 前方) → 出力座標系 (Z-up)
pub fn to_z_up(p: [f64; 3]) -> [f64; 3] {
    let [x, y, z] = p;
    [x, z, -y]
}

/// `to_z_up` の逆変換
pub fn from_z_up(p: [f64; 3]) -> [f64; 3] {
    let [bx, by, bz] = p;
    [bx, -bz, by]
}
