use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{error, info, warn};

use nanobot_core::AuditLog;

use crate::error::{CronError, Result};
use crate::schedule::next_run_at;
use crate::store::CronStore;
use crate::types::{CronJob, CronJobState, CronPayload, CronSchedule};

/// Fired-job callback. The returned string becomes `last_status` detail.
pub type OnJob = Arc<dyn Fn(CronJob) -> BoxFuture<'static, std::result::Result<String, String>> + Send + Sync>;

/// Persistent scheduler. Job mutations and the ticker share one `Mutex`'d
/// job list; every mutation is flushed to the store atomically.
pub struct CronService {
    store: CronStore,
    jobs: Mutex<Vec<CronJob>>,
    tz: chrono_tz::Tz,
    on_job: Mutex<Option<OnJob>>,
    audit: AuditLog,
}

impl CronService {
    pub fn new(store: CronStore, tz: chrono_tz::Tz, audit: AuditLog) -> Self {
        let jobs = store.load();
        if !jobs.is_empty() {
            info!(count = jobs.len(), "cron jobs loaded");
        }
        Self {
            store,
            jobs: Mutex::new(jobs),
            tz,
            on_job: Mutex::new(None),
            audit,
        }
    }

    /// Install the fired-job callback (the agent's delivery entrypoint).
    pub fn set_callback(&self, cb: OnJob) {
        *self.on_job.lock().expect("cron callback poisoned") = Some(cb);
    }

    pub fn add_job(
        &self,
        name: &str,
        schedule: CronSchedule,
        payload: CronPayload,
    ) -> Result<CronJob> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let next = next_run_at(&schedule, now_ms, &self.tz)?;
        if next.is_none() {
            return Err(CronError::InvalidSchedule(
                "schedule would never fire".to_string(),
            ));
        }
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            enabled: true,
            schedule,
            payload,
            state: CronJobState {
                next_run_at_ms: next,
                last_run_at_ms: None,
                last_status: None,
            },
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        let mut jobs = self.jobs.lock().expect("cron jobs poisoned");
        jobs.push(job.clone());
        self.store.save(&jobs)?;
        info!(job_id = %job.id, name = %job.name, "cron job added");
        Ok(job)
    }

    pub fn remove_job(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("cron jobs poisoned");
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() < before;
        if removed {
            let _ = self.store.save(&jobs);
            info!(job_id = %id, "cron job removed");
        }
        removed
    }

    pub fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().expect("cron jobs poisoned").clone()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("cron jobs poisoned");
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| CronError::JobNotFound { id: id.to_string() })?;
        job.enabled = enabled;
        job.updated_at_ms = chrono::Utc::now().timestamp_millis();
        if enabled && job.state.next_run_at_ms.is_none() {
            job.state.next_run_at_ms =
                next_run_at(&job.schedule, job.updated_at_ms, &self.tz)?;
        }
        self.store.save(&jobs)?;
        Ok(())
    }

    /// Ticker loop (~1 s resolution). Runs until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("cron service started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire every due job once. Public so tests and the ticker share one path.
    pub async fn tick_once(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        // Snapshot the due set; the callback runs without holding the lock.
        let mut due: Vec<CronJob> = {
            let jobs = self.jobs.lock().expect("cron jobs poisoned");
            jobs.iter()
                .filter(|j| {
                    j.enabled && j.state.next_run_at_ms.is_some_and(|next| next <= now_ms)
                })
                .cloned()
                .collect()
        };
        if due.is_empty() {
            return;
        }
        due.sort_by(|a, b| {
            (a.state.next_run_at_ms, &a.id).cmp(&(b.state.next_run_at_ms, &b.id))
        });

        let callback = self.on_job.lock().expect("cron callback poisoned").clone();

        for job in due {
            self.audit.log_event(serde_json::json!({
                "type": "cron_start",
                "job_id": job.id,
                "name": job.name,
            }));

            let status = match &callback {
                Some(cb) => match cb(job.clone()).await {
                    Ok(detail) => {
                        self.audit.log_event(serde_json::json!({
                            "type": "cron_complete",
                            "job_id": job.id,
                            "detail": detail,
                        }));
                        "ok".to_string()
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "cron job failed");
                        self.audit.log_event(serde_json::json!({
                            "type": "cron_error",
                            "job_id": job.id,
                            "error": e,
                        }));
                        format!("error: {e}")
                    }
                },
                None => {
                    warn!(job_id = %job.id, "cron fired with no callback installed");
                    "skipped".to_string()
                }
            };

            self.advance_job(&job.id, now_ms, status);
        }
    }

    /// Update one job's state after a fire, removing it when exhausted.
    fn advance_job(&self, id: &str, fired_at_ms: i64, status: String) {
        let mut jobs = self.jobs.lock().expect("cron jobs poisoned");
        let Some(idx) = jobs.iter().position(|j| j.id == id) else {
            return;
        };

        let delete_after = jobs[idx].payload.delete_after_run;
        let next = next_run_at(&jobs[idx].schedule, fired_at_ms, &self.tz).unwrap_or(None);
        let exhausted = next.is_none();

        if exhausted && delete_after {
            jobs.remove(idx);
        } else {
            let job = &mut jobs[idx];
            job.state.last_run_at_ms = Some(fired_at_ms);
            job.state.last_status = Some(status);
            job.state.next_run_at_ms = next;
            if exhausted {
                job.enabled = false;
            }
            job.updated_at_ms = fired_at_ms;
        }
        if let Err(e) = self.store.save(&jobs) {
            error!(error = %e, "cron state persist failed");
        }
    }
}
