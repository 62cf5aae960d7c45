use anyhow::Result;

use super::landmark::{Landmark, Pose};

/// 外部のポーズ推定ライブラリとの境界
///
/// 画像1枚から正規化ランドマーク列（固定長・固定インデックス）を返す。
/// 人物が見つからなければ `Ok(None)`。
pub trait PoseProvider {
    type Image;

    fn detect(&mut self, image: &Self::Image) -> Result<Option<Vec<Landmark>>>;
}

/// 推定結果を17関節の Pose にまとめる
///
/// ランドマーク数が足りない出力は検出なしとして扱う。
pub fn detect_pose<P: PoseProvider>(provider: &mut P, image: &P::Image) -> Result<Option<Pose>> {
    let Some(landmarks) = provider.detect(image)? else {
        return Ok(None);
    };
    let pose = Pose::from_provider(&landmarks);
    if pose.is_none() {
        tracing::debug!("pose provider returned {} landmarks, ignoring", landmarks.len());
    }
    Ok(pose)
}
