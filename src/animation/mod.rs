//! 関節の3D点 → ボーン名付きのアニメーションデータ

pub mod bones;
pub mod recorder;
pub mod session;
pub mod store;

pub use bones::{bone_for_joint, from_z_up, to_z_up, BoneId, JOINT_BONES};
pub use recorder::AnimationRecorder;
pub use session::{AnimationSession, BoneFrame, BoneSample};
pub use store::AnimationStore;
