//! In-memory ingestion job tracking.
//!
//! Jobs are progress reporting, not durability: the document row's status is
//! the source of truth and survives restarts, job records do not. The store
//! keeps the newest `cap` entries and silently drops the rest.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{JobStatus, ProcessingJob};

pub struct JobStore {
    jobs: Mutex<HashMap<String, ProcessingJob>>,
    cap: usize,
}

impl JobStore {
    pub fn new(cap: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            cap,
        }
    }

    /// Register a new pending job for a document and return its id.
    pub fn create(&self, account_id: &str, kb_id: &str, document_id: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let job = ProcessingJob {
            id: id.clone(),
            account_id: account_id.to_string(),
            kb_id: kb_id.to_string(),
            document_id: document_id.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut jobs = self.jobs.lock().unwrap();
        jobs.insert(id.clone(), job);
        if jobs.len() > self.cap {
            prune(&mut jobs, self.cap);
        }
        id
    }

    pub fn set_progress(&self, job_id: &str, status: JobStatus, progress: u8) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = status;
            job.progress = progress.min(100);
            job.updated_at = Utc::now();
        }
    }

    pub fn fail(&self, job_id: &str, error: &str) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = JobStatus::Failed;
            job.error = Some(error.to_string());
            job.updated_at = Utc::now();
        }
    }

    pub fn get(&self, job_id: &str) -> Option<ProcessingJob> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// All jobs for a knowledge base, newest first.
    pub fn list_for_kb(&self, kb_id: &str) -> Vec<ProcessingJob> {
        let jobs = self.jobs.lock().unwrap();
        let mut out: Vec<ProcessingJob> = jobs.values().filter(|j| j.kb_id == kb_id).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

/// Keep only the `cap` newest entries by creation time.
fn prune(jobs: &mut HashMap<String, ProcessingJob>, cap: usize) {
    let mut by_age: Vec<(String, chrono::DateTime<Utc>)> = jobs
        .iter()
        .map(|(id, j)| (id.clone(), j.created_at))
        .collect();
    by_age.sort_by(|a, b| b.1.cmp(&a.1));
    for (id, _) in by_age.into_iter().skip(cap) {
        jobs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_update() {
        let store = JobStore::new(10);
        let id = store.create("acct", "kb1", "doc1");

        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);

        store.set_progress(&id, JobStatus::Processing, 50);
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn test_fail_records_error() {
        let store = JobStore::new(10);
        let id = store.create("acct", "kb1", "doc1");
        store.fail(&id, "embedding provider unavailable");

        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("embedding provider unavailable"));
    }

    #[test]
    fn test_progress_clamped_to_100() {
        let store = JobStore::new(10);
        let id = store.create("acct", "kb1", "doc1");
        store.set_progress(&id, JobStatus::Processing, 250);
        assert_eq!(store.get(&id).unwrap().progress, 100);
    }

    #[test]
    fn test_capped_at_newest() {
        let store = JobStore::new(3);
        for i in 0..5 {
            store.create("acct", "kb1", &format!("doc{}", i));
        }
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_list_for_kb_filters() {
        let store = JobStore::new(10);
        store.create("acct", "kb1", "doc1");
        store.create("acct", "kb2", "doc2");
        store.create("acct", "kb1", "doc3");

        assert_eq!(store.list_for_kb("kb1").len(), 2);
        assert_eq!(store.list_for_kb("kb2").len(), 1);
        assert!(store.list_for_kb("kb3").is_empty());
    }
}
