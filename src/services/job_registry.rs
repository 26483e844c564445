use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::models::{Job, JobStatus, ProgressUpdate};

/// In-memory view of the backend's jobs. Every mutation is a single
/// synchronous step under the write lock, and bumps the revision observers
/// subscribe to.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    revision: watch::Sender<u64>,
}

#[derive(Default)]
struct RegistryState {
    jobs: Vec<Job>,
    // Last positive speed per job, used to hide zero samples between pushes.
    speed_memory: HashMap<i64, f64>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0_u64);
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                revision,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.read().jobs.clone()
    }

    pub fn get(&self, job_id: i64) -> Option<Job> {
        self.read().jobs.iter().find(|job| job.id == job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.read().last_synced_at
    }

    pub fn remembered_speed(&self, job_id: i64) -> Option<f64> {
        self.read().speed_memory.get(&job_id).copied()
    }

    /// Replaces the whole collection with the backend's list. Speed memory of
    /// jobs the backend no longer knows about is dropped.
    pub fn replace_all(&self, jobs: Vec<Job>) {
        {
            let mut state = self.write();
            let known: HashSet<i64> = jobs.iter().map(|job| job.id).collect();
            state.speed_memory.retain(|job_id, _| known.contains(job_id));
            state.jobs = jobs;
            state.last_synced_at = Some(Utc::now());
        }
        self.bump();
    }

    /// Applies a batch of push updates in arrival order. Returns how many
    /// matched a known job.
    pub fn apply_progress(&self, updates: &[ProgressUpdate]) -> usize {
        let mut applied = 0;
        {
            let mut state = self.write();
            let RegistryState {
                jobs, speed_memory, ..
            } = &mut *state;

            for update in updates {
                let Some(job) = jobs.iter_mut().find(|job| job.id == update.id) else {
                    continue;
                };

                let mut patch = update.clone();
                let incoming = patch.speed.unwrap_or(0.0);
                if incoming > 0.0 {
                    speed_memory.insert(update.id, incoming);
                } else if let Some(remembered) = speed_memory.get(&update.id).copied() {
                    patch.speed = Some(remembered);
                }

                job.apply_update(&patch);
                applied += 1;
            }
        }
        if applied > 0 {
            self.bump();
        }
        applied
    }

    /// Mutates one job in place. Returns false when the id is unknown.
    pub fn update_job<F>(&self, job_id: i64, mutate: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let found = {
            let mut state = self.write();
            match state.jobs.iter_mut().find(|job| job.id == job_id) {
                Some(job) => {
                    mutate(job);
                    true
                }
                None => false,
            }
        };
        if found {
            self.bump();
        }
        found
    }

    pub fn forget_speed(&self, job_id: i64) {
        self.write().speed_memory.remove(&job_id);
    }

    /// Removes the given ids and their speed memory. Returns the number of
    /// jobs actually removed.
    pub fn remove(&self, job_ids: &[i64]) -> usize {
        let removed = {
            let mut state = self.write();
            let targets: HashSet<i64> = job_ids.iter().copied().collect();
            let before = state.jobs.len();
            state.jobs.retain(|job| !targets.contains(&job.id));
            for job_id in &targets {
                state.speed_memory.remove(job_id);
            }
            before - state.jobs.len()
        };
        if removed > 0 {
            self.bump();
        }
        removed
    }

    pub fn ids_with_status(&self, status: &JobStatus) -> Vec<i64> {
        self.read()
            .jobs
            .iter()
            .filter(|job| &job.status == status)
            .map(|job| job.id)
            .collect()
    }

    fn filtered<P>(&self, predicate: P) -> Vec<Job>
    where
        P: Fn(&Job) -> bool,
    {
        self.read()
            .jobs
            .iter()
            .filter(|job| predicate(job))
            .cloned()
            .collect()
    }

    pub fn active(&self) -> Vec<Job> {
        self.filtered(|job| job.status.is_active())
    }

    pub fn completed(&self) -> Vec<Job> {
        self.filtered(|job| job.status == JobStatus::Completed)
    }

    pub fn failed(&self) -> Vec<Job> {
        self.filtered(|job| job.status == JobStatus::Failed)
    }

    pub fn canceled(&self) -> Vec<Job> {
        self.filtered(|job| job.status == JobStatus::Canceled)
    }

    /// Sum of instantaneous speeds of queued and running jobs, in bytes/sec.
    pub fn total_speed(&self) -> f64 {
        self.read()
            .jobs
            .iter()
            .filter(|job| job.status.is_active())
            .map(|job| job.speed)
            .sum()
    }

    /// Average progress of active jobs, rounded and capped at 100.
    pub fn total_progress(&self) -> u32 {
        let state = self.read();
        let active: Vec<&Job> = state
            .jobs
            .iter()
            .filter(|job| job.status.is_active())
            .collect();
        if active.is_empty() {
            return 0;
        }
        let sum: f64 = active
            .iter()
            .map(|job| job.progress.clamp(0.0, 100.0))
            .sum();
        let average = (sum / active.len() as f64).round();
        average.min(100.0) as u32
    }
}
