use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use remux_common::config::RedisConfig;
use remux_common::model::TaskStatus;
use remux_common::time::unix_now;
use tracing::{debug, info, warn};

use crate::queue::{parse_status, QueueError, TaskQueue};
use crate::repo::library::LibraryRepo;
use crate::repo::task::{TaskRecord, TaskRepo};

// Atomic claim: pop the highest-priority pending id, move it to in_progress
// and stamp the hash. Returns the claimed id.
const LUA_CLAIM_TASK: &str = r#"
local task_id_score = redis.call('ZPOPMAX', KEYS[1], 1)
if #task_id_score == 0 then
    return nil
end
local task_id = task_id_score[1]
local now = ARGV[1]
redis.call('ZADD', KEYS[2], now, task_id)
local task_key = ARGV[2] .. ':task:' .. task_id
redis.call('HSET', task_key, 'status', 'in_progress', 'start_time', now)
return task_id
"#;

// Claim one specific id out of pending. The ZREM result guards against a
// concurrent claimer having already taken it.
const LUA_CLAIM_SPECIFIC: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 0 then
    return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], 'status', 'in_progress', 'start_time', ARGV[2])
return 1
"#;

const LUA_MARK_PROCESSED: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], 'status', 'processed', 'finish_time', ARGV[2])
return 1
"#;

const LUA_REQUEUE_BOTTOM: &str = r#"
local lowest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local new_score = 0
if #lowest >= 2 then
    new_score = tonumber(lowest[2]) - 1
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[1], new_score, ARGV[1])
redis.call('HSET', KEYS[3], 'status', 'pending', 'priority', new_score)
return new_score
"#;

/// How many pending candidates a filtered claim inspects before giving up.
const MAX_FILTER_CANDIDATES: isize = 100;

/// Redis-backed dispatcher over sorted sets, running in hybrid mode: sqlite
/// remains the source of truth for every task row, redis holds the
/// priority index and per-task hash used for fast claims. Filtered claims
/// consult the relational library metadata the hashes do not carry.
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    key_prefix: String,
    task_repo: Arc<dyn TaskRepo>,
    library_repo: Arc<dyn LibraryRepo>,
    claim_script: Script,
    claim_specific_script: Script,
    processed_script: Script,
    requeue_script: Script,
}

impl RedisTaskQueue {
    pub async fn connect(
        config: &RedisConfig,
        task_repo: Arc<dyn TaskRepo>,
        library_repo: Arc<dyn LibraryRepo>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url())?;
        let conn = client.get_connection_manager().await?;
        info!(host = %config.host, port = config.port, "Redis connection established");
        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            task_repo,
            library_repo,
            claim_script: Script::new(LUA_CLAIM_TASK),
            claim_specific_script: Script::new(LUA_CLAIM_SPECIFIC),
            processed_script: Script::new(LUA_MARK_PROCESSED),
            requeue_script: Script::new(LUA_REQUEUE_BOTTOM),
        })
    }

    fn pending_key(&self) -> String {
        format!("{}:tasks:pending", self.key_prefix)
    }

    fn in_progress_key(&self) -> String {
        format!("{}:tasks:in_progress", self.key_prefix)
    }

    fn processed_key(&self) -> String {
        format!("{}:tasks:processed", self.key_prefix)
    }

    fn task_key(&self, task_id: i64) -> String {
        format!("{}:task:{}", self.key_prefix, task_id)
    }

    fn serialize_task(record: &TaskRecord) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), record.id.to_string()),
            ("abspath".to_string(), record.abspath.clone()),
            ("library_id".to_string(), record.library_id.to_string()),
            ("type".to_string(), record.task_type.clone()),
            ("status".to_string(), record.status.clone()),
            ("priority".to_string(), record.priority.to_string()),
            (
                "success".to_string(),
                if record.success { "1" } else { "0" }.to_string(),
            ),
        ]
    }

    /// Hybrid filter check: type comes from the hash, library metadata from
    /// the relational store.
    async fn matches_filters(
        &self,
        task_hash: &HashMap<String, String>,
        local_only: bool,
        library_names: Option<&[String]>,
        library_tags: Option<&[String]>,
    ) -> Result<bool, QueueError> {
        if local_only && task_hash.get("type").map(String::as_str) != Some("local") {
            return Ok(false);
        }

        if library_names.is_none() && library_tags.is_none() {
            return Ok(true);
        }

        let library_id: i64 = match task_hash.get("library_id").and_then(|v| v.parse().ok()) {
            Some(id) => id,
            None => return Ok(false),
        };
        let library = match self.library_repo.get(library_id).await? {
            Some(library) => library,
            None => return Ok(false),
        };

        if let Some(names) = library_names {
            if !names.contains(&library.name) {
                return Ok(false);
            }
        }

        if let Some(tags) = library_tags {
            let library_tag_names = self.library_repo.get_tags(library_id).await?;
            if tags.is_empty() {
                if !library_tag_names.is_empty() {
                    return Ok(false);
                }
            } else if !tags.iter().any(|tag| library_tag_names.contains(tag)) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn list_ids(&self, set_key: &str, limit: Option<i64>) -> Result<Vec<i64>, QueueError> {
        let end = limit.map(|l| l as isize - 1).unwrap_or(-1);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrevrange(set_key, 0, end).await?;
        Ok(ids.iter().filter_map(|id| id.parse().ok()).collect())
    }

    async fn records_for_ids(&self, ids: Vec<i64>) -> Result<Vec<TaskRecord>, QueueError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.task_repo.get(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Rebuild the redis index from the authoritative store. Used on cold
    /// start and whenever the index is suspected stale.
    pub async fn sync_from_store(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(self.pending_key())
            .del(self.in_progress_key())
            .del(self.processed_key())
            .query_async(&mut conn)
            .await?;

        let mut count = 0;
        for (status, set_key) in [
            ("pending", self.pending_key()),
            ("in_progress", self.in_progress_key()),
            ("processed", self.processed_key()),
        ] {
            for record in self.task_repo.list_by_status(status, None).await? {
                let score = match status {
                    "pending" => record.priority as f64,
                    "in_progress" => record.start_time.unwrap_or_else(unix_now),
                    _ => record.finish_time.unwrap_or_else(unix_now),
                };
                let _: () = redis::pipe()
                    .atomic()
                    .hset_multiple(self.task_key(record.id), &Self::serialize_task(&record))
                    .zadd(&set_key, record.id.to_string(), score)
                    .query_async(&mut conn)
                    .await?;
                count += 1;
            }
        }
        info!("Synced {} tasks into the redis queue index", count);
        Ok(count)
    }

    /// Drop a claimed id whose authoritative row disagreed with the index.
    async fn discard_desynced(&self, task_id: i64) -> Result<(), QueueError> {
        warn!(
            task_id,
            "Redis queue index out of sync with store; dropping entry"
        );
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.pending_key(), task_id.to_string())
            .zrem(self.in_progress_key(), task_id.to_string())
            .del(self.task_key(task_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn list_pending_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let ids = self.list_ids(&self.pending_key(), limit).await?;
        self.records_for_ids(ids).await
    }

    async fn list_in_progress_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let ids = self.list_ids(&self.in_progress_key(), limit).await?;
        self.records_for_ids(ids).await
    }

    async fn list_processed_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let ids = self.list_ids(&self.processed_key(), limit).await?;
        self.records_for_ids(ids).await
    }

    async fn get_next_pending_task(
        &self,
        local_only: bool,
        library_names: Option<&[String]>,
        library_tags: Option<&[String]>,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let now = unix_now();
        let mut conn = self.conn.clone();

        let has_filters = local_only || library_names.is_some() || library_tags.is_some();
        if !has_filters {
            let claimed: Option<String> = self
                .claim_script
                .key(self.pending_key())
                .key(self.in_progress_key())
                .arg(now)
                .arg(&self.key_prefix)
                .invoke_async(&mut conn)
                .await?;
            let task_id: i64 = match claimed.and_then(|id| id.parse().ok()) {
                Some(id) => id,
                None => return Ok(None),
            };
            return match self.task_repo.claim_task(task_id, now).await? {
                Some(record) => Ok(Some(record)),
                None => {
                    self.discard_desynced(task_id).await?;
                    Ok(None)
                }
            };
        }

        // Filtered path: peek candidates rather than popping, so tasks that
        // fail the filter stay queued for other claimers.
        let candidates: Vec<String> = conn
            .zrevrange(self.pending_key(), 0, MAX_FILTER_CANDIDATES - 1)
            .await?;

        for candidate in candidates {
            let task_id: i64 = match candidate.parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let task_hash: HashMap<String, String> =
                conn.hgetall(self.task_key(task_id)).await?;
            if task_hash.is_empty() {
                // Orphaned index entry.
                let _: () = conn.zrem(self.pending_key(), candidate).await?;
                continue;
            }

            if !self
                .matches_filters(&task_hash, local_only, library_names, library_tags)
                .await?
            {
                continue;
            }

            let claimed: i64 = self
                .claim_specific_script
                .key(self.pending_key())
                .key(self.in_progress_key())
                .key(self.task_key(task_id))
                .arg(task_id.to_string())
                .arg(now)
                .invoke_async(&mut conn)
                .await?;
            if claimed == 0 {
                // A concurrent claimer got there first.
                debug!(task_id, "Lost claim race, trying next candidate");
                continue;
            }

            return match self.task_repo.claim_task(task_id, now).await? {
                Some(record) => Ok(Some(record)),
                None => {
                    self.discard_desynced(task_id).await?;
                    Ok(None)
                }
            };
        }

        Ok(None)
    }

    async fn get_next_processed_task(&self) -> Result<Option<TaskRecord>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrevrange(self.processed_key(), 0, 0).await?;
        match ids.first().and_then(|id| id.parse::<i64>().ok()) {
            Some(task_id) => Ok(self.task_repo.get(task_id).await?),
            None => Ok(None),
        }
    }

    async fn mark_in_progress(&self, task_id: i64) -> Result<TaskRecord, QueueError> {
        let now = unix_now();
        let record = match self.task_repo.claim_task(task_id, now).await? {
            Some(record) => record,
            None => {
                let current = self
                    .task_repo
                    .get(task_id)
                    .await?
                    .ok_or(QueueError::TaskNotFound(task_id))?;
                return Err(QueueError::InvalidStatus {
                    from: parse_status(&current)?,
                    to: TaskStatus::InProgress,
                });
            }
        };

        let mut conn = self.conn.clone();
        let _: i64 = self
            .claim_specific_script
            .key(self.pending_key())
            .key(self.in_progress_key())
            .key(self.task_key(task_id))
            .arg(task_id.to_string())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(record)
    }

    async fn mark_processed(&self, task_id: i64) -> Result<TaskRecord, QueueError> {
        let now = unix_now();
        let record = match self.task_repo.mark_processed(task_id, now).await? {
            Some(record) => record,
            None => {
                let current = self
                    .task_repo
                    .get(task_id)
                    .await?
                    .ok_or(QueueError::TaskNotFound(task_id))?;
                return Err(QueueError::InvalidStatus {
                    from: parse_status(&current)?,
                    to: TaskStatus::Processed,
                });
            }
        };

        let mut conn = self.conn.clone();
        let _: i64 = self
            .processed_script
            .key(self.in_progress_key())
            .key(self.processed_key())
            .key(self.task_key(task_id))
            .arg(task_id.to_string())
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(record)
    }

    async fn pending_is_empty(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.zcard(self.pending_key()).await?;
        Ok(count == 0)
    }

    async fn in_progress_is_empty(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.zcard(self.in_progress_key()).await?;
        Ok(count == 0)
    }

    async fn processed_is_empty(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.zcard(self.processed_key()).await?;
        Ok(count == 0)
    }

    async fn requeue_at_bottom(&self, task_id: i64) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .requeue_script
            .key(self.pending_key())
            .key(self.in_progress_key())
            .key(self.task_key(task_id))
            .arg(task_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(self.task_repo.requeue_at_bottom(task_id).await?)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.task_repo.get(task_id).await?)
    }

    async fn enqueue_task(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.task_key(record.id), &Self::serialize_task(record))
            .zadd(
                self.pending_key(),
                record.id.to_string(),
                record.priority as f64,
            )
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn task_hash_serialization_is_string_coerced() {
        let record = TaskRecord {
            id: 42,
            abspath: "/library/a.mkv".to_string(),
            library_id: 1,
            task_type: "local".to_string(),
            status: "pending".to_string(),
            priority: 43,
            cache_path: None,
            success: false,
            start_time: None,
            finish_time: None,
            processed_by_worker: None,
            log: String::new(),
        };
        let fields = RedisTaskQueue::serialize_task(&record);
        let map: HashMap<_, _> = fields.into_iter().collect();
        assert_eq!(map.get("id").map(String::as_str), Some("42"));
        assert_eq!(map.get("type").map(String::as_str), Some("local"));
        assert_eq!(map.get("success").map(String::as_str), Some("0"));
        assert_eq!(map.get("priority").map(String::as_str), Some("43"));
    }
}
