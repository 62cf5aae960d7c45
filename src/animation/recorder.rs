use chrono::{Local, NaiveDateTime};

use super::session::{AnimationSession, BoneFrame};
use crate::error::RecorderError;
use crate::reconstruction::BodyPoints;

#[derive(Debug)]
enum State {
    Idle,
    Recording(AnimationSession),
}

/// 録画の開始・停止とフレームの蓄積
///
/// Idle 中に渡されたフレームは捨てる（バッファしない）。
/// 1回の Recording 区間が1つの独立したセッションになる。
#[derive(Debug)]
pub struct AnimationRecorder {
    state: State,
}

impl Default for AnimationRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimationRecorder {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, State::Recording(_))
    }

    /// 録画中のフレーム数（Idle なら 0）
    pub fn frame_count(&self) -> usize {
        match &self.state {
            State::Recording(session) => session.len(),
            State::Idle => 0,
        }
    }

    pub fn start(&mut self) -> Result<(), RecorderError> {
        self.start_at(Local::now().naive_local())
    }

    pub fn start_at(&mut self, started_at: NaiveDateTime) -> Result<(), RecorderError> {
        if self.is_recording() {
            return Err(RecorderError::AlreadyRecording);
        }
        self.state = State::Recording(AnimationSession::new(Some(started_at), Vec::new()));
        tracing::info!("recording started");
        Ok(())
    }

    /// 録画中ならフレームを追加してそのフレーム番号を返す
    pub fn submit_frame(&mut self, points: &BodyPoints) -> Option<u64> {
        match &mut self.state {
            State::Recording(session) => {
                let index = session.frames.len() as u64;
                session.frames.push(BoneFrame::from_body_points(index, points));
                Some(index)
            }
            State::Idle => None,
        }
    }

    /// 録画を終了してセッションを返す（Idle なら None）
    pub fn stop(&mut self) -> Option<AnimationSession> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Recording(session) => {
                tracing::info!("recording stopped ({} frames)", session.len());
                Some(session)
            }
            State::Idle => None,
        }
    }
}
