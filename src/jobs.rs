use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Snapshot of an accepted request, replayed by a worker.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub method: String,
    /// Path plus query string, relative to the service root.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Snapshot of the response the worker captured.
#[derive(Debug, Clone)]
pub struct JobResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AsyncJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub request: JobRequest,
    pub response: Option<JobResponse>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retain_until: Option<DateTime<Utc>>,
}

/// Owns the job table. Worker concurrency is bounded by a semaphore sized
/// `max_queue_size`; excess submissions wait for a permit. A sweeper removes
/// jobs past their retention.
pub struct JobManager {
    jobs: Arc<Mutex<HashMap<Uuid, AsyncJob>>>,
    permits: Arc<Semaphore>,
    retention: Duration,
    sweeper_started: AtomicBool,
}

impl JobManager {
    pub fn new(max_queue_size: usize, retention: Duration) -> Self {
        JobManager {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_queue_size.max(1))),
            retention,
            sweeper_started: AtomicBool::new(false),
        }
    }

    /// Enqueue a request snapshot and spawn its worker. Returns the monitor
    /// id immediately.
    pub fn submit<F, Fut>(&self, request: JobRequest, execute: F) -> Uuid
    where
        F: FnOnce(JobRequest) -> Fut + Send + 'static,
        Fut: Future<Output = JobResponse> + Send + 'static,
    {
        self.start_sweeper();
        let id = Uuid::new_v4();
        let job = AsyncJob {
            id,
            status: JobStatus::Pending,
            request: request.clone(),
            response: None,
            created_at: Utc::now(),
            completed_at: None,
            retain_until: None,
        };
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, job);

        let jobs = self.jobs.clone();
        let permits = self.permits.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            // Closed semaphore cannot happen; treat it as a failed job.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            {
                let mut table = jobs.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(job) = table.get_mut(&id) {
                    job.status = JobStatus::Running;
                }
            }
            let response = execute(request).await;
            let mut table = jobs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(job) = table.get_mut(&id) {
                job.status = if response.status < 400 {
                    JobStatus::Succeeded
                } else {
                    JobStatus::Failed
                };
                job.response = Some(response);
                let done = Utc::now();
                job.completed_at = Some(done);
                job.retain_until = chrono::TimeDelta::from_std(retention)
                    .ok()
                    .map(|d| done + d);
            }
        });
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<AsyncJob> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Remove completed jobs past their retention. Called by the sweeper and
    /// from tests.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, job| match job.retain_until {
                Some(until) => until > now,
                None => true,
            });
    }

    fn start_sweeper(&self) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let jobs = self.jobs.clone();
        let period = self.retention.max(Duration::from_secs(2)) / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let mut table = jobs.lock().unwrap_or_else(|e| e.into_inner());
                let before = table.len();
                table.retain(|_, job| match job.retain_until {
                    Some(until) => until > now,
                    None => true,
                });
                let removed = before - table.len();
                if removed > 0 {
                    tracing::debug!("async job sweeper removed {removed} expired job(s)");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> JobRequest {
        JobRequest {
            method: "GET".into(),
            target: "/Products".into(),
            headers: vec![],
            body: vec![],
        }
    }

    #[tokio::test]
    async fn job_runs_and_records_response() {
        let manager = JobManager::new(2, Duration::from_secs(60));
        let id = manager.submit(request(), |_req| async {
            JobResponse {
                status: 200,
                headers: vec![],
                body: b"done".to_vec(),
            }
        });
        // Poll until the worker finishes.
        for _ in 0..100 {
            if let Some(job) = manager.get(&id) {
                if job.status == JobStatus::Succeeded {
                    assert_eq!(job.response.as_ref().unwrap().body, b"done");
                    assert!(job.retain_until.is_some());
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never completed");
    }

    #[tokio::test]
    async fn error_responses_mark_the_job_failed() {
        let manager = JobManager::new(1, Duration::from_secs(60));
        let id = manager.submit(request(), |_req| async {
            JobResponse {
                status: 500,
                headers: vec![],
                body: vec![],
            }
        });
        for _ in 0..100 {
            if manager.get(&id).map(|j| j.status) == Some(JobStatus::Failed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never failed");
    }

    #[tokio::test]
    async fn sweep_removes_expired_jobs() {
        let manager = JobManager::new(1, Duration::from_millis(1));
        let id = manager.submit(request(), |_req| async {
            JobResponse {
                status: 204,
                headers: vec![],
                body: vec![],
            }
        });
        for _ in 0..100 {
            if manager.get(&id).is_some_and(|j| j.completed_at.is_some()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.sweep();
        assert!(manager.get(&id).is_none());
    }
}
