use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use cadence_core::config::ExhaustedPolicy;
use cadence_core::JobId;
use chrono::{DateTime, Utc};

use super::JobStore;
use crate::error::{StoreError, StoreResult};
use crate::job::Job;

/// Orders jobs by next run time then id, with paused jobs last.
type SortKey = (bool, Option<DateTime<Utc>>, JobId);

fn sort_key(job: &Job) -> SortKey {
    (job.next_run_time.is_none(), job.next_run_time, job.id.clone())
}

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<SortKey, Job>,
    keys: HashMap<JobId, SortKey>,
}

/// Keeps jobs in process memory, without serializing them. Any trigger
/// works here, including ones that cannot be marshaled.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    exhausted: ExhaustedPolicy,
}

impl MemoryJobStore {
    pub const KIND: &'static str = "memory";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(exhausted: ExhaustedPolicy) -> Self {
        Self {
            inner: Mutex::default(),
            exhausted,
        }
    }

    fn replace(inner: &mut Inner, job: &Job) -> StoreResult<()> {
        let old_key = inner
            .keys
            .remove(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.clone()))?;
        inner.jobs.remove(&old_key);
        let key = sort_key(job);
        inner.keys.insert(job.id.clone(), key.clone());
        inner.jobs.insert(key, job.clone());
        Ok(())
    }
}

impl JobStore for MemoryJobStore {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn lookup_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.keys.get(id).and_then(|key| inner.jobs.get(key)).cloned())
    }

    fn get_due_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .jobs
            .iter()
            .take_while(|((_, next, _), _)| next.is_some_and(|t| t <= now))
            .map(|(_, job)| job.clone())
            .collect())
    }

    fn get_next_run_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.jobs.keys().next().and_then(|(_, next, _)| *next))
    }

    fn get_all_jobs(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.jobs.values().cloned().collect())
    }

    fn add_job(&self, job: &Job) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner.keys.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        let key = sort_key(job);
        inner.keys.insert(job.id.clone(), key.clone());
        inner.jobs.insert(key, job.clone());
        Ok(())
    }

    fn update_job(&self, job: &Job) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        Self::replace(&mut inner, job)
    }

    fn update_job_if(&self, job: &Job, expected: Option<DateTime<Utc>>) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        match inner.keys.get(&job.id) {
            None => Err(StoreError::NotFound(job.id.clone())),
            Some((_, current, _)) if *current != expected => Ok(false),
            Some(_) => Self::replace(&mut inner, job).map(|()| true),
        }
    }

    fn remove_job(&self, id: &JobId) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let key = inner
            .keys
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        inner.jobs.remove(&key);
        Ok(())
    }

    fn remove_all_jobs(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.jobs.clear();
        inner.keys.clear();
        Ok(())
    }

    fn exhausted_policy(&self) -> ExhaustedPolicy {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::test_job;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn job(id: &str, next: Option<i64>) -> Job {
        let mut job = test_job(id, "noop");
        job.next_run_time = next.map(at);
        job
    }

    fn ids(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|j| j.id.as_str()).collect()
    }

    #[test]
    fn due_jobs_are_ordered_by_time_then_id() {
        let store = MemoryJobStore::new();
        store.add_job(&job("c", Some(10))).unwrap();
        store.add_job(&job("b", Some(5))).unwrap();
        store.add_job(&job("a", Some(10))).unwrap();
        store.add_job(&job("late", Some(100))).unwrap();
        store.add_job(&job("paused", None)).unwrap();

        assert_eq!(ids(&store.get_due_jobs(at(10)).unwrap()), vec!["b", "a", "c"]);
        assert_eq!(store.get_next_run_time().unwrap(), Some(at(5)));
        assert_eq!(
            ids(&store.get_all_jobs().unwrap()),
            vec!["b", "a", "c", "late", "paused"]
        );
    }

    #[test]
    fn duplicate_and_missing_ids_fail() {
        let store = MemoryJobStore::new();
        store.add_job(&job("a", Some(1))).unwrap();
        assert!(matches!(
            store.add_job(&job("a", Some(2))),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.update_job(&job("b", Some(2))),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.remove_job(&JobId::from("b")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn update_moves_the_job_in_the_ordering() {
        let store = MemoryJobStore::new();
        store.add_job(&job("a", Some(1))).unwrap();
        store.add_job(&job("b", Some(2))).unwrap();
        store.update_job(&job("a", Some(3))).unwrap();

        assert_eq!(ids(&store.get_due_jobs(at(2)).unwrap()), vec!["b"]);
        assert_eq!(
            store.lookup_job(&JobId::from("a")).unwrap().unwrap().next_run_time,
            Some(at(3))
        );
        store.update_job(&job("b", None)).unwrap();
        assert_eq!(store.get_next_run_time().unwrap(), Some(at(3)));
    }

    #[test]
    fn conditional_update_rejects_stale_writers() {
        let store = MemoryJobStore::new();
        store.add_job(&job("a", Some(1))).unwrap();

        assert!(store.update_job_if(&job("a", Some(2)), Some(at(1))).unwrap());
        // A second writer that also read next_run_time = 1 loses.
        assert!(!store.update_job_if(&job("a", Some(2)), Some(at(1))).unwrap());
        assert!(matches!(
            store.update_job_if(&job("z", Some(2)), None),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn empty_or_paused_store_has_no_next_run_time() {
        let store = MemoryJobStore::new();
        assert_eq!(store.get_next_run_time().unwrap(), None);
        store.add_job(&job("p", None)).unwrap();
        assert_eq!(store.get_next_run_time().unwrap(), None);
        store.remove_all_jobs().unwrap();
        assert!(store.get_all_jobs().unwrap().is_empty());
    }
}
