use serde::{Deserialize, Serialize};

/// 追跡対象の17関節
///
/// 並び順は出力・マッピング表のインデックスとして使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(usize)]
pub enum JointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftShoulder = 3,
    RightShoulder = 4,
    LeftElbow = 5,
    RightElbow = 6,
    LeftWrist = 7,
    RightWrist = 8,
    LeftHip = 9,
    RightHip = 10,
    LeftKnee = 11,
    RightKnee = 12,
    LeftAnkle = 13,
    RightAnkle = 14,
    LeftFoot = 15,
    RightFoot = 16,
}

impl JointIndex {
    pub const COUNT: usize = 17;

    pub const ALL: [JointIndex; Self::COUNT] = [
        Self::Nose,
        Self::LeftEye,
        Self::RightEye,
        Self::LeftShoulder,
        Self::RightShoulder,
        Self::LeftElbow,
        Self::RightElbow,
        Self::LeftWrist,
        Self::RightWrist,
        Self::LeftHip,
        Self::RightHip,
        Self::LeftKnee,
        Self::RightKnee,
        Self::LeftAnkle,
        Self::RightAnkle,
        Self::LeftFoot,
        Self::RightFoot,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// ポーズ推定ライブラリ（33ランドマーク形式）でのインデックス
    pub fn provider_index(self) -> usize {
        match self {
            Self::Nose => 0,
            Self::LeftEye => 2,
            Self::RightEye => 5,
            Self::LeftShoulder => 11,
            Self::RightShoulder => 12,
            Self::LeftElbow => 13,
            Self::RightElbow => 14,
            Self::LeftWrist => 15,
            Self::RightWrist => 16,
            Self::LeftHip => 23,
            Self::RightHip => 24,
            Self::LeftKnee => 25,
            Self::RightKnee => 26,
            Self::LeftAnkle => 27,
            Self::RightAnkle => 28,
            Self::LeftFoot => 29,
            Self::RightFoot => 30,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nose => "nose",
            Self::LeftEye => "left_eye",
            Self::RightEye => "right_eye",
            Self::LeftShoulder => "left_shoulder",
            Self::RightShoulder => "right_shoulder",
            Self::LeftElbow => "left_elbow",
            Self::RightElbow => "right_elbow",
            Self::LeftWrist => "left_wrist",
            Self::RightWrist => "right_wrist",
            Self::LeftHip => "left_hip",
            Self::RightHip => "right_hip",
            Self::LeftKnee => "left_knee",
            Self::RightKnee => "right_knee",
            Self::LeftAnkle => "left_ankle",
            Self::RightAnkle => "right_ankle",
            Self::LeftFoot => "left_foot",
            Self::RightFoot => "right_foot",
        }
    }
}

/// 単一ランドマーク
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// 正規化されたX座標 (0.0〜1.0)
    pub x: f64,
    /// 正規化されたY座標 (0.0〜1.0)
    pub y: f64,
    /// 相対深度（メートルではない）
    #[serde(default)]
    pub z: f64,
    /// 可視度 (0.0〜1.0)
    #[serde(default)]
    pub visibility: f64,
}

impl Landmark {
    pub fn new(x: f64, y: f64, z: f64, visibility: f64) -> Self {
        Self { x, y, z, visibility }
    }

    /// 可視度が閾値以上か
    pub fn is_valid(&self, threshold: f64) -> bool {
        self.visibility >= threshold
    }

    /// ピクセル座標に変換
    pub fn to_pixel(&self, width: u32, height: u32) -> (f64, f64) {
        (self.x * width as f64, self.y * height as f64)
    }
}

impl Default for Landmark {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            visibility: 0.0,
        }
    }
}

/// 17ランドマークからなる姿勢
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    pub landmarks: [Landmark; JointIndex::COUNT],
}

impl Pose {
    pub fn new(landmarks: [Landmark; JointIndex::COUNT]) -> Self {
        Self { landmarks }
    }

    /// ポーズ推定ライブラリの全ランドマーク列から17関節を取り出す
    ///
    /// 列が短すぎる場合は None。
    pub fn from_provider(all: &[Landmark]) -> Option<Self> {
        let mut landmarks = [Landmark::default(); JointIndex::COUNT];
        for joint in JointIndex::ALL {
            landmarks[joint as usize] = *all.get(joint.provider_index())?;
        }
        Some(Self::new(landmarks))
    }

    /// インデックスでランドマークを取得
    pub fn get(&self, joint: JointIndex) -> &Landmark {
        &self.landmarks[joint as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (JointIndex, &Landmark)> {
        JointIndex::ALL.into_iter().zip(self.landmarks.iter())
    }

    /// 全ランドマークの平均可視度
    pub fn average_visibility(&self) -> f64 {
        let sum: f64 = self.landmarks.iter().map(|l| l.visibility).sum();
        sum / JointIndex::COUNT as f64
    }

    /// 可視度が閾値以上のランドマークの割合
    pub fn visible_ratio(&self, threshold: f64) -> f64 {
        let visible = self
            .landmarks
            .iter()
            .filter(|l| l.is_valid(threshold))
            .count();
        visible as f64 / JointIndex::COUNT as f64
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            landmarks: [Landmark::default(); JointIndex::COUNT],
        }
    }
}
