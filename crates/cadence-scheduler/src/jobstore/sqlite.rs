use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use cadence_core::config::{ExhaustedPolicy, DEFAULT_TABLE};
use cadence_core::JobId;
use cadence_marshal::{deserialize_marshaled, serialize_object, unmarshal_object, Serializer};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::{debug, error, instrument};

use super::JobStore;
use crate::error::{StoreError, StoreResult};
use crate::job::Job;

/// Stores marshaled jobs in one SQLite table.
///
/// `next_run_time` is kept in its own indexed column (microseconds since the
/// epoch) so the due-job query never has to decode job state. Every write
/// goes through the configured serializer, so a job whose trigger cannot be
/// marshaled is rejected when it is added.
pub struct SqliteJobStore {
    db: Mutex<Connection>,
    table: String,
    serializer: Arc<dyn Serializer>,
    exhausted: ExhaustedPolicy,
}

impl SqliteJobStore {
    pub const KIND: &'static str = "sqlite";

    /// Wrap an open connection, creating the table if needed.
    pub fn new(
        conn: Connection,
        table: &str,
        serializer: Arc<dyn Serializer>,
        exhausted: ExhaustedPolicy,
    ) -> StoreResult<Self> {
        validate_table_name(table)?;
        init_db(&conn, table)?;
        Ok(Self {
            db: Mutex::new(conn),
            table: table.to_string(),
            serializer,
            exhausted,
        })
    }

    pub fn open(path: impl AsRef<Path>, serializer: Arc<dyn Serializer>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::new(conn, DEFAULT_TABLE, serializer, ExhaustedPolicy::Remove)
    }

    pub fn open_in_memory(serializer: Arc<dyn Serializer>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::new(conn, DEFAULT_TABLE, serializer, ExhaustedPolicy::Remove)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn encode(&self, job: &Job) -> StoreResult<Vec<u8>> {
        Ok(serialize_object(self.serializer.as_ref(), job)?)
    }

    fn decode(&self, bytes: &[u8]) -> StoreResult<Job> {
        let marshaled = deserialize_marshaled(self.serializer.as_ref(), bytes)?;
        Ok(unmarshal_object::<Job>(marshaled)?)
    }

    /// Run a `SELECT id, job_state ...` query and restore every row.
    ///
    /// Rows that cannot be restored are logged and deleted, so one corrupt
    /// job does not wedge the scheduler.
    fn query_jobs(
        &self,
        db: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<Job>> {
        let mut stmt = db.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        let mut failed = Vec::new();
        for (id, state) in rows {
            match self.decode(&state) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    error!(job_id = %id, table = %self.table, "unable to restore job, removing it: {e}");
                    failed.push(id);
                }
            }
        }
        for id in failed {
            db.execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.table),
                rusqlite::params![id],
            )?;
        }
        Ok(jobs)
    }
}

impl fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("table", &self.table)
            .field("serializer", &self.serializer.name())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Create the jobs table and its `next_run_time` index (idempotent).
pub fn init_db(conn: &Connection, table: &str) -> StoreResult<()> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            id             TEXT    NOT NULL PRIMARY KEY,
            next_run_time  INTEGER,            -- microseconds since epoch, NULL when paused
            job_state      BLOB    NOT NULL    -- serialized marshaled job
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_{table}_next_run_time ON {table} (next_run_time);
        "
    ))?;
    Ok(())
}

fn validate_table_name(table: &str) -> StoreResult<()> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidConfig(format!(
            "invalid table name '{table}': use letters, digits and underscores"
        )))
    }
}

fn to_micros(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp_micros())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

impl JobStore for SqliteJobStore {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    #[instrument(skip(self), fields(job_id = %id))]
    fn lookup_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let db = self.db.lock().expect("sqlite store poisoned");
        let mut jobs = self.query_jobs(
            &db,
            &format!("SELECT id, job_state FROM {} WHERE id = ?1", self.table),
            rusqlite::params![id.as_str()],
        )?;
        Ok(jobs.pop())
    }

    fn get_due_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let db = self.db.lock().expect("sqlite store poisoned");
        self.query_jobs(
            &db,
            &format!(
                "SELECT id, job_state FROM {}
                 WHERE next_run_time <= ?1
                 ORDER BY next_run_time, id",
                self.table
            ),
            rusqlite::params![now.timestamp_micros()],
        )
    }

    fn get_next_run_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let db = self.db.lock().expect("sqlite store poisoned");
        let micros: Option<i64> = db
            .query_row(
                &format!(
                    "SELECT next_run_time FROM {}
                     WHERE next_run_time IS NOT NULL
                     ORDER BY next_run_time LIMIT 1",
                    self.table
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(micros.and_then(DateTime::from_timestamp_micros))
    }

    fn get_all_jobs(&self) -> StoreResult<Vec<Job>> {
        let db = self.db.lock().expect("sqlite store poisoned");
        self.query_jobs(
            &db,
            &format!(
                "SELECT id, job_state FROM {}
                 ORDER BY next_run_time IS NULL, next_run_time, id",
                self.table
            ),
            [],
        )
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    fn add_job(&self, job: &Job) -> StoreResult<()> {
        let state = self.encode(job)?;
        let db = self.db.lock().expect("sqlite store poisoned");
        let result = db.execute(
            &format!(
                "INSERT INTO {} (id, next_run_time, job_state) VALUES (?1, ?2, ?3)",
                self.table
            ),
            rusqlite::params![job.id.as_str(), to_micros(job.next_run_time), state],
        );
        match result {
            Ok(_) => {
                debug!("job inserted");
                Ok(())
            }
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists(job.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    fn update_job(&self, job: &Job) -> StoreResult<()> {
        let state = self.encode(job)?;
        let db = self.db.lock().expect("sqlite store poisoned");
        let rows_changed = db.execute(
            &format!(
                "UPDATE {} SET next_run_time = ?1, job_state = ?2 WHERE id = ?3",
                self.table
            ),
            rusqlite::params![to_micros(job.next_run_time), state, job.id.as_str()],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::NotFound(job.id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    fn update_job_if(&self, job: &Job, expected: Option<DateTime<Utc>>) -> StoreResult<bool> {
        let state = self.encode(job)?;
        let db = self.db.lock().expect("sqlite store poisoned");
        // `IS` treats two NULLs as equal.
        let rows_changed = db.execute(
            &format!(
                "UPDATE {} SET next_run_time = ?1, job_state = ?2
                 WHERE id = ?3 AND next_run_time IS ?4",
                self.table
            ),
            rusqlite::params![
                to_micros(job.next_run_time),
                state,
                job.id.as_str(),
                to_micros(expected)
            ],
        )?;
        if rows_changed == 1 {
            return Ok(true);
        }
        let exists: bool = db.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", self.table),
            rusqlite::params![job.id.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            debug!("conditional update lost to another writer");
            Ok(false)
        } else {
            Err(StoreError::NotFound(job.id.clone()))
        }
    }

    #[instrument(skip(self), fields(job_id = %id))]
    fn remove_job(&self, id: &JobId) -> StoreResult<()> {
        let db = self.db.lock().expect("sqlite store poisoned");
        let rows_changed = db.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table),
            rusqlite::params![id.as_str()],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn remove_all_jobs(&self) -> StoreResult<()> {
        let db = self.db.lock().expect("sqlite store poisoned");
        db.execute(&format!("DELETE FROM {}", self.table), [])?;
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
    use cadence_marshal::{JsonSerializer, Marshal};
    use chrono::{Duration, TimeZone};

    fn store() -> SqliteJobStore {
        SqliteJobStore::open_in_memory(Arc::new(JsonSerializer::default())).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn job(id: &str, next: Option<i64>) -> Job {
        let mut job = test_job(id, "noop");
        job.next_run_time = next.map(at);
        job
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let conn = Connection::open_in_memory().unwrap();
        let err = SqliteJobStore::new(
            conn,
            "jobs; DROP TABLE x",
            Arc::new(JsonSerializer::default()),
            ExhaustedPolicy::Remove,
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }

    #[test]
    fn stored_jobs_round_trip_through_the_serializer() {
        let store = store();
        let original = job("a", Some(30));
        store.add_job(&original).unwrap();

        let restored = store.lookup_job(&JobId::from("a")).unwrap().unwrap();
        assert_eq!(restored.marshal().unwrap(), original.marshal().unwrap());
        assert!(store.lookup_job(&JobId::from("b")).unwrap().is_none());
    }

    #[test]
    fn due_jobs_and_next_run_time_use_the_indexed_column() {
        let store = store();
        store.add_job(&job("c", Some(10))).unwrap();
        store.add_job(&job("a", Some(10))).unwrap();
        store.add_job(&job("b", Some(5))).unwrap();
        store.add_job(&job("p", None)).unwrap();

        let due: Vec<_> = store.get_due_jobs(at(10)).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(due, vec![JobId::from("b"), JobId::from("a"), JobId::from("c")]);
        assert_eq!(store.get_next_run_time().unwrap(), Some(at(5)));
        let all = store.get_all_jobs().unwrap();
        assert_eq!(all.last().unwrap().id, JobId::from("p"));
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let store = store();
        store.add_job(&job("a", Some(1))).unwrap();
        assert!(matches!(
            store.add_job(&job("a", Some(1))),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.remove_job(&JobId::from("zzz")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn conditional_update_matches_null_and_instants() {
        let store = store();
        store.add_job(&job("a", None)).unwrap();
        assert!(store.update_job_if(&job("a", Some(4)), None).unwrap());
        assert!(!store.update_job_if(&job("a", Some(8)), None).unwrap());
        assert!(store.update_job_if(&job("a", Some(8)), Some(at(4))).unwrap());
        assert_eq!(store.get_next_run_time().unwrap(), Some(at(8)));
    }

    #[test]
    fn corrupt_rows_are_dropped_on_read() {
        let store = store();
        store.add_job(&job("good", Some(1))).unwrap();
        {
            let db = store.db.lock().unwrap();
            db.execute(
                "INSERT INTO cadence_jobs (id, next_run_time, job_state) VALUES ('bad', 0, x'00ff')",
                [],
            )
            .unwrap();
        }
        let due = store.get_due_jobs(at(100)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, JobId::from("good"));
        assert!(store.lookup_job(&JobId::from("bad")).unwrap().is_none());
    }
}
