pub mod landmark;
pub mod provider;

pub use landmark::{JointIndex, Landmark, Pose};
pub use provider::{detect_pose, PoseProvider};
