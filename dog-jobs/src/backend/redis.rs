//! Redis backend.
//!
//! Layout under `{prefix}:{queue}`:
//! - `:job:{id}` hash with `state`, `version` and `data` (the JSON record)
//! - `:{state}` sorted set of job ids scored by ready time in millis
//!
//! Every state change goes through one Lua script that compares `state` and
//! `version` and moves the id between sorted sets in the same step. The
//! transition itself (expected attempt, ready time) is checked against the
//! loaded record first; `version` guarantees nothing moved in between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use crate::{
    backend::QueueBackend, JobCounts, JobId, JobRecord, JobState, NewJob, QueueError, QueueResult,
    Transition,
};

const PAGE: usize = 100;

const COMMIT_LUA: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return {0, ''}
end
local version = redis.call('HGET', KEYS[1], 'version')
if state ~= ARGV[1] or version ~= ARGV[2] then
  return {-1, state}
end
redis.call('HSET', KEYS[1], 'state', ARGV[3], 'version', ARGV[4], 'data', ARGV[5])
redis.call('ZREM', KEYS[2], ARGV[6])
redis.call('ZADD', KEYS[3], ARGV[7], ARGV[6])
return {1, ARGV[3]}
"#;

#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    prefix: String,
    commit_script: Script,
}

impl RedisBackend {
    /// Connect to `redis://host:port[/db]`
    pub async fn connect(address: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(address)
            .map_err(|e| QueueError::Config(format!("invalid redis address: {e}")))?;
        let conn = client.get_connection_manager().await?;
        info!(address = %summarize_address(address), "connected to redis");
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            commit_script: Script::new(COMMIT_LUA),
        }
    }

    fn job_key(&self, queue: &str, id: &JobId) -> String {
        format!("{}:{}:job:{}", self.prefix, queue, id)
    }

    fn bucket_key(&self, queue: &str, state: JobState) -> String {
        format!("{}:{}:{}", self.prefix, queue, state.name())
    }

    async fn load_version(&self, queue: &str, id: &JobId) -> QueueResult<(JobRecord, u64)> {
        let mut conn = self.conn.clone();
        let (data, version): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.job_key(queue, id))
            .arg("data")
            .arg("version")
            .query_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok((serde_json::from_str(&data)?, version.unwrap_or(0))),
            None => Err(QueueError::JobNotFound(id.to_string())),
        }
    }

    async fn load_many(&self, queue: &str, ids: &[String]) -> QueueResult<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HGET").arg(format!("{}:{}:job:{}", self.prefix, queue, id)).arg("data");
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        raw.into_iter()
            .flatten()
            .map(|data| serde_json::from_str(&data).map_err(QueueError::from))
            .collect()
    }

    /// First record of `job_types` in a bucket within the score range
    async fn first_matching(
        &self,
        queue: &str,
        state: JobState,
        max_score: &str,
        job_types: &[String],
    ) -> QueueResult<Option<JobRecord>> {
        let key = self.bucket_key(queue, state);
        let mut conn = self.conn.clone();
        let mut offset = 0;

        loop {
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(max_score)
                .arg("LIMIT")
                .arg(offset)
                .arg(PAGE)
                .query_async(&mut conn)
                .await?;

            let found = self
                .load_many(queue, &ids)
                .await?
                .into_iter()
                .find(|record| job_types.iter().any(|t| *t == record.job_type));
            if found.is_some() || ids.len() < PAGE {
                return Ok(found);
            }
            offset += PAGE;
        }
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord> {
        let record = JobRecord::new(JobId::new(), queue, job, Utc::now())?;
        let data = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(queue, &record.id))
            .arg("state")
            .arg(record.state.name())
            .arg("version")
            .arg(0)
            .arg("data")
            .arg(data)
            .ignore()
            .cmd("ZADD")
            .arg(self.bucket_key(queue, record.state))
            .arg(record.ready_at.timestamp_millis())
            .arg(record.id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(queue, job_id = %record.id, "enqueued");
        Ok(record)
    }

    async fn fetch_next(
        &self,
        queue: &str,
        job_types: &[String],
    ) -> QueueResult<Option<JobRecord>> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let now = Utc::now().timestamp_millis().to_string();
        let waiting = self.first_matching(queue, JobState::Waiting, "+inf", job_types).await?;
        let delayed = self.first_matching(queue, JobState::Delayed, &now, job_types).await?;

        Ok(match (waiting, delayed) {
            (Some(w), Some(d)) => Some(if d.ready_at < w.ready_at { d } else { w }),
            (w, d) => w.or(d),
        })
    }

    async fn next_ready_at(
        &self,
        queue: &str,
        job_types: &[String],
    ) -> QueueResult<Option<DateTime<Utc>>> {
        Ok(self
            .first_matching(queue, JobState::Delayed, "+inf", job_types)
            .await?
            .map(|record| record.ready_at))
    }

    async fn commit_transition(
        &self,
        queue: &str,
        id: &JobId,
        transition: Transition,
    ) -> QueueResult<JobRecord> {
        let (mut record, version) = self.load_version(queue, id).await?;
        record.apply(&transition, Utc::now())?;
        let data = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let (code, actual): (i64, String) = self
            .commit_script
            .key(self.job_key(queue, id))
            .key(self.bucket_key(queue, transition.from))
            .key(self.bucket_key(queue, transition.to))
            .arg(transition.from.name())
            .arg(version.to_string())
            .arg(transition.to.name())
            .arg((version + 1).to_string())
            .arg(data)
            .arg(id.as_str())
            .arg(record.ready_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(record),
            0 => Err(QueueError::JobNotFound(id.to_string())),
            _ => Err(QueueError::Conflict {
                job_id: id.to_string(),
                expected: transition.from,
                actual: actual
                    .parse()
                    .map_err(|_| QueueError::Internal(format!("unknown job state '{actual}'")))?,
            }),
        }
    }

    async fn get(&self, queue: &str, id: &JobId) -> QueueResult<JobRecord> {
        self.load_version(queue, id).await.map(|(record, _)| record)
    }

    async fn list_by_state(&self, queue: &str, state: JobState) -> QueueResult<Vec<JobRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.bucket_key(queue, state))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        self.load_many(queue, &ids).await
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        let mut pipe = redis::pipe();
        for state in JobState::all() {
            pipe.cmd("ZCARD").arg(self.bucket_key(queue, *state));
        }
        let mut conn = self.conn.clone();
        let sizes: Vec<usize> = pipe.query_async(&mut conn).await?;

        let mut counts = JobCounts::default();
        for (state, size) in JobState::all().iter().zip(sizes) {
            counts.add(*state, size);
        }
        Ok(counts)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        // The manager closes its connection when the last clone is dropped
        debug!("redis backend released");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// `scheme://host` without credentials, for logs
fn summarize_address(address: &str) -> String {
    let (scheme, rest) = address.split_once("://").unwrap_or(("", address));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth.split(['/', '?', '#']).next().unwrap_or(without_auth);
    format!("{scheme}://{host}")
}
