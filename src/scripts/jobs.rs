//! The jobs table: a concurrent map keyed by job id, single writer per
//! entry, holding each running job's cancel handle and its three
//! background task handles. No parent relation across jobs is needed —
//! cancelling one never touches another.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct JobRecord {
    pub job_id: String,
    pub script_name: String,
    pub correlation_id: Option<String>,
    pub cancel: CancellationToken,
    pub stdout: Option<JoinHandle<()>>,
    pub stderr: Option<JoinHandle<()>>,
    pub wait: JoinHandle<()>,
}

#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, record: JobRecord) {
        self.jobs.write().await.insert(record.job_id.clone(), record);
    }

    pub async fn remove(&self, job_id: &str) {
        self.jobs.write().await.remove(job_id);
    }

    /// Cancel every registered job and wait for its three tasks to finish,
    /// e.g. on platform shutdown, so the final exit event is guaranteed to
    /// publish before the process exits. Drains the map first so the lock
    /// isn't held across the awaits.
    pub async fn cancel_all(&self) {
        let records: Vec<JobRecord> = self.jobs.write().await.drain().map(|(_, r)| r).collect();
        for record in &records {
            record.cancel.cancel();
        }
        for record in records {
            if let Some(handle) = record.stdout {
                let _ = handle.await;
            }
            if let Some(handle) = record.stderr {
                let _ = handle.await;
            }
            let _ = record.wait.await;
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_remove() {
        let table = JobTable::new();
        table
            .register(JobRecord {
                job_id: "01J".into(),
                script_name: "foo".into(),
                correlation_id: None,
                cancel: CancellationToken::new(),
                stdout: Some(tokio::spawn(async {})),
                stderr: Some(tokio::spawn(async {})),
                wait: tokio::spawn(async {}),
            })
            .await;
        assert_eq!(table.len().await, 1);
        table.remove("01J").await;
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_registered_token() {
        let table = JobTable::new();
        let cancel = CancellationToken::new();
        table
            .register(JobRecord {
                job_id: "01J".into(),
                script_name: "foo".into(),
                correlation_id: None,
                cancel: cancel.clone(),
                stdout: Some(tokio::spawn(async {})),
                stderr: Some(tokio::spawn(async {})),
                wait: tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_millis(1)).await }),
            })
            .await;
        table.cancel_all().await;
        assert!(cancel.is_cancelled());
        assert_eq!(table.len().await, 0);
    }
}
