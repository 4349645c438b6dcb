use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use nanobot_core::paths::atomic_write_json;

use crate::error::Result;
use crate::types::CronJob;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CronDocument {
    #[serde(default)]
    jobs: Vec<CronJob>,
}

/// The single JSON document holding all jobs. Every write goes through
/// write-temp-then-rename so a crash can never leave a half-written file.
#[derive(Debug, Clone)]
pub struct CronStore {
    path: PathBuf,
}

impl CronStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Vec<CronJob> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str::<CronDocument>(&text)
            .map(|doc| doc.jobs)
            .unwrap_or_default()
    }

    pub fn save(&self, jobs: &[CronJob]) -> Result<()> {
        let doc = CronDocument {
            jobs: jobs.to_vec(),
        };
        atomic_write_json(&self.path, &doc)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CronJobState, CronPayload, CronSchedule, PayloadKind};

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("cron").join("jobs.json"));
        let job = CronJob {
            id: "j1".into(),
            name: "水".into(),
            enabled: true,
            schedule: CronSchedule::Every { every_ms: 60_000 },
            payload: CronPayload {
                kind: PayloadKind::Message,
                message: "喝水".into(),
                task_name: None,
                deliver: true,
                channel: Some("telegram".into()),
                to: Some("42".into()),
                delete_after_run: false,
            },
            state: CronJobState::default(),
            created_at_ms: 1,
            updated_at_ms: 1,
        };
        store.save(&[job]).unwrap();
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "j1");
        assert!(matches!(loaded[0].schedule, CronSchedule::Every { every_ms: 60_000 }));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }
}
