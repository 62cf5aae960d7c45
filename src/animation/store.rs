use chrono::{Local, NaiveDateTime};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use super::session::{AnimationSession, BoneFrame};
use crate::config::RecordingConfig;
use crate::error::StoreError;
use crate::persist::{read_json, validate_key, write_atomic};

const ID_PREFIX: &str = "animation_data_";
const ID_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";
const EXTENSION: &str = "json";

/// 録画セッションの保存先（1セッション = `<id>.json`）
///
/// ファイルの中身はフレーム配列のみ:
/// `[{"frame": 0, "bones": {"shoulder.L": {"location": [x, y, z], "visibility": v}, ...}}, ...]`
#[derive(Debug, Clone)]
pub struct AnimationStore {
    root: PathBuf,
}

impl AnimationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &RecordingConfig) -> Self {
        Self::new(&config.output_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, EXTENSION))
    }

    /// セッションを書き出して識別子を返す
    ///
    /// `id` が None なら開始時刻（無ければ現在時刻）から
    /// `animation_data_YYYYMMDD_HHMMSS` を作り、既存と衝突したら `_2`, `_3`, ... を付ける。
    pub fn write(&self, session: &AnimationSession, id: Option<&str>) -> Result<String, StoreError> {
        let id = match id {
            Some(id) => {
                validate_key(id)?;
                id.to_string()
            }
            None => self.generate_id(session.started_at.unwrap_or_else(|| Local::now().naive_local())),
        };

        let path = self.path_for(&id);
        let json = serde_json::to_string_pretty(&session.frames).map_err(|source| StoreError::Format {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, json.as_bytes())?;
        tracing::info!("saved {} frames to {}", session.len(), path.display());
        Ok(id)
    }

    fn generate_id(&self, started_at: NaiveDateTime) -> String {
        let base = format!("{}{}", ID_PREFIX, started_at.format(ID_TIME_FORMAT));
        if !self.path_for(&base).exists() {
            return base;
        }
        let mut n = 2u32;
        loop {
            let id = format!("{}_{}", base, n);
            if !self.path_for(&id).exists() {
                return id;
            }
            n += 1;
        }
    }

    pub fn read(&self, id: &str) -> Result<AnimationSession, StoreError> {
        validate_key(id)?;
        let path = self.path_for(id);
        let frames: Vec<BoneFrame> = read_json(&path, id)?;

        if let Some(w) = frames.windows(2).find(|w| w[1].frame_index <= w[0].frame_index) {
            return Err(StoreError::Corrupt {
                path,
                reason: format!(
                    "frame {} follows frame {} (indices must increase)",
                    w[1].frame_index, w[0].frame_index
                ),
            });
        }

        Ok(AnimationSession::new(parse_started_at(id), frames))
    }

    /// 保存済みセッションの識別子（ディレクトリを読みながら返す。順序は不定）
    ///
    /// 呼び直せば最初から列挙し直す。ディレクトリが無ければ空。
    pub fn list_available(&self) -> impl Iterator<Item = String> {
        fs::read_dir(&self.root)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    return None;
                }
                let id = path.file_stem()?.to_str()?.to_string();
                (validate_key(&id).is_ok() && path.is_file()).then_some(id)
            })
    }

    /// 古い順に並べた識別子（最後が最新）
    pub fn list_by_recency(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.list_available().collect();
        ids.sort_by(|a, b| cmp_recency(a, b));
        ids
    }

    /// 最新のセッション
    ///
    /// 開始時刻と衝突番号で比較する。時刻を含まない任意の識別子は
    /// 自動生成のものより古いとみなす。
    pub fn latest(&self) -> Option<String> {
        self.list_available().max_by(|a, b| cmp_recency(a, b))
    }
}

/// 自動生成した識別子から録画開始時刻を復元する
fn parse_started_at(id: &str) -> Option<NaiveDateTime> {
    let stamp = id.strip_prefix(ID_PREFIX)?.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, ID_TIME_FORMAT).ok()
}

/// 衝突番号（付いていなければ 1、解釈できなければ 0）
fn collision_index(id: &str) -> u32 {
    let Some(rest) = id.strip_prefix(ID_PREFIX).and_then(|r| r.get(15..)) else {
        return 0;
    };
    if rest.is_empty() {
        return 1;
    }
    rest.strip_prefix('_').and_then(|n| n.parse().ok()).unwrap_or(0)
}

fn cmp_recency(a: &str, b: &str) -> Ordering {
    parse_started_at(a)
        .cmp(&parse_started_at(b))
        .then_with(|| collision_index(a).cmp(&collision_index(b)))
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{AnimationRecorder, BoneId};
    use crate::pose::JointIndex;
    use crate::reconstruction::{BodyPoint3D, BodyPoints};
    use chrono::NaiveDate;

    fn t(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn recorded(start: NaiveDateTime, frames: usize) -> AnimationSession {
        let mut recorder = AnimationRecorder::new();
        recorder.start_at(start).unwrap();
        for i in 0..frames {
            let mut points = BodyPoints::new();
            points.insert(JointIndex::LeftHip, BodyPoint3D::new(0.1 * i as f64, 0.30000000000000004, 2.0 / 3.0, 0.95));
            points.insert(JointIndex::RightWrist, BodyPoint3D::new(-0.2, 1e-17, 1.75, 0.4));
            recorder.submit_frame(&points);
        }
        recorder.stop().unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnimationStore::new(dir.path());
        let session = recorded(t(10, 20, 30), 4);
        let id = store.write(&session, None).unwrap();
        assert_eq!(id, "animation_data_20240309_102030");

        let loaded = store.read(&id).unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.frames[3].bones[&BoneId::ThighL].location[0], 0.1 * 3.0);
    }

    #[test]
    fn test_identifier_collision_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnimationStore::new(dir.path());
        let session = recorded(t(9, 0, 0), 1);
        let a = store.write(&session, None).unwrap();
        let b = store.write(&session, None).unwrap();
        let c = store.write(&session, None).unwrap();
        assert_eq!(a, "animation_data_20240309_090000");
        assert_eq!(b, "animation_data_20240309_090000_2");
        assert_eq!(c, "animation_data_20240309_090000_3");
        assert_eq!(store.read(&c).unwrap().started_at, Some(t(9, 0, 0)));
    }

    #[test]
    fn test_explicit_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnimationStore::new(dir.path());
        let session = recorded(t(9, 0, 0), 2);
        let id = store.write(&session, Some("warmup")).unwrap();
        assert_eq!(id, "warmup");
        let loaded = store.read("warmup").unwrap();
        assert_eq!(loaded.frames, session.frames);
        assert_eq!(loaded.started_at, None);
        assert!(matches!(store.write(&session, Some("../x")), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnimationStore::new(dir.path());
        assert!(store.read("animation_data_20000101_000000").unwrap_err().is_not_found());
    }

    #[test]
    fn test_read_rejects_out_of_order_frames() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("bad.json"),
            r#"[{"frame": 0, "bones": {}}, {"frame": 2, "bones": {}}, {"frame": 2, "bones": {}}]"#,
        )
        .unwrap();
        let err = AnimationStore::new(dir.path()).read("bad").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{:?}", err);
    }

    #[test]
    fn test_list_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnimationStore::new(dir.path());
        assert_eq!(store.list_available().count(), 0);
        assert_eq!(store.latest(), None);

        for start in [t(8, 0, 0), t(12, 30, 0), t(10, 15, 0)] {
            store.write(&recorded(start, 1), None).unwrap();
        }
        fs::write(dir.path().join(".animation_data_20990101_000000.json.1.tmp"), "[").unwrap();
        fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let mut ids: Vec<String> = store.list_available().collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "animation_data_20240309_080000",
                "animation_data_20240309_101500",
                "animation_data_20240309_123000",
            ]
        );
        // 再列挙できる
        assert_eq!(store.list_available().count(), 3);
        assert_eq!(store.latest().as_deref(), Some("animation_data_20240309_123000"));
    }

    #[test]
    fn test_latest_orders_collisions_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnimationStore::new(dir.path());
        store.write(&recorded(t(9, 0, 0), 1), Some("warmup")).unwrap();
        let session = recorded(t(9, 0, 0), 1);
        let mut last = String::new();
        for _ in 0..10 {
            last = store.write(&session, None).unwrap();
        }
        assert_eq!(last, "animation_data_20240309_090000_10");
        assert_eq!(store.latest().as_deref(), Some(last.as_str()));

        let ids = store.list_by_recency();
        assert_eq!(ids.len(), 11);
        assert_eq!(ids[0], "warmup");
        assert_eq!(ids[1], "animation_data_20240309_090000");
        assert_eq!(ids[2], "animation_data_20240309_090000_2");
        assert_eq!(ids[10], last);

        // 後の時刻は衝突番号より優先
        let later = store.write(&recorded(t(9, 0, 1), 1), None).unwrap();
        assert_eq!(store.latest(), Some(later));
    }

    #[test]
    fn test_collision_index() {
        assert_eq!(collision_index("animation_data_20240309_090000"), 1);
        assert_eq!(collision_index("animation_data_20240309_090000_12"), 12);
        assert_eq!(collision_index("warmup"), 0);
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnimationStore::new(dir.path().join("never-created"));
        assert_eq!(store.list_available().count(), 0);
    }

    #[test]
    fn test_parse_started_at() {
        assert_eq!(parse_started_at("animation_data_20240309_101500_2"), Some(t(10, 15, 0)));
        assert_eq!(parse_started_at("warmup"), None);
    }
}
