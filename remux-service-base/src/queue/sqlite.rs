use std::sync::Arc;

use async_trait::async_trait;
use remux_common::model::TaskStatus;
use remux_common::time::unix_now;

use crate::queue::{parse_status, QueueError, TaskQueue};
use crate::repo::task::{TaskRecord, TaskRepo};

/// The default backend. All state lives in the `tasks` table; the atomic
/// claim is a single conditional `UPDATE ... RETURNING`.
pub struct SqliteTaskQueue {
    task_repo: Arc<dyn TaskRepo>,
}

impl SqliteTaskQueue {
    pub fn new(task_repo: Arc<dyn TaskRepo>) -> Self {
        Self { task_repo }
    }

    async fn require_task(&self, task_id: i64) -> Result<TaskRecord, QueueError> {
        self.task_repo
            .get(task_id)
            .await?
            .ok_or(QueueError::TaskNotFound(task_id))
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn list_pending_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        Ok(self.task_repo.list_by_status("pending", limit).await?)
    }

    async fn list_in_progress_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        Ok(self.task_repo.list_by_status("in_progress", limit).await?)
    }

    async fn list_processed_tasks(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        Ok(self.task_repo.list_by_status("processed", limit).await?)
    }

    async fn get_next_pending_task(
        &self,
        local_only: bool,
        library_names: Option<&[String]>,
        library_tags: Option<&[String]>,
    ) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self
            .task_repo
            .claim_next_pending(unix_now(), local_only, library_names, library_tags)
            .await?)
    }

    async fn get_next_processed_task(&self) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.task_repo.next_processed().await?)
    }

    async fn mark_in_progress(&self, task_id: i64) -> Result<TaskRecord, QueueError> {
        match self.task_repo.claim_task(task_id, unix_now()).await? {
            Some(record) => Ok(record),
            None => {
                let current = self.require_task(task_id).await?;
                Err(QueueError::InvalidStatus {
                    from: parse_status(&current)?,
                    to: TaskStatus::InProgress,
                })
            }
        }
    }

    async fn mark_processed(&self, task_id: i64) -> Result<TaskRecord, QueueError> {
        match self.task_repo.mark_processed(task_id, unix_now()).await? {
            Some(record) => Ok(record),
            None => {
                let current = self.require_task(task_id).await?;
                Err(QueueError::InvalidStatus {
                    from: parse_status(&current)?,
                    to: TaskStatus::Processed,
                })
            }
        }
    }

    async fn pending_is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.task_repo.count_by_status("pending").await? == 0)
    }

    async fn in_progress_is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.task_repo.count_by_status("in_progress").await? == 0)
    }

    async fn processed_is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.task_repo.count_by_status("processed").await? == 0)
    }

    async fn requeue_at_bottom(&self, task_id: i64) -> Result<bool, QueueError> {
        Ok(self.task_repo.requeue_at_bottom(task_id).await?)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.task_repo.get(task_id).await?)
    }

    async fn enqueue_task(&self, _record: &TaskRecord) -> Result<(), QueueError> {
        // Pending rows are already visible to the claim query.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::db::in_memory_pool;
    use crate::repo::library::{DbLibraryRepo, LibraryRepo};
    use crate::repo::task::DbTaskRepo;

    struct Fixture {
        queue: SqliteTaskQueue,
        task_repo: Arc<dyn TaskRepo>,
        library_repo: Arc<dyn LibraryRepo>,
    }

    async fn fixture() -> Fixture {
        let pool = Arc::new(in_memory_pool().await);
        let task_repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(pool.clone()));
        let library_repo: Arc<dyn LibraryRepo> = Arc::new(DbLibraryRepo::new(pool));
        Fixture {
            queue: SqliteTaskQueue::new(task_repo.clone()),
            task_repo,
            library_repo,
        }
    }

    async fn seed_pending(
        fixture: &Fixture,
        abspath: &str,
        library_id: i64,
        priority: i64,
    ) -> TaskRecord {
        let mut record = fixture
            .task_repo
            .create(abspath, "local", library_id)
            .await
            .unwrap();
        record.status = "pending".to_string();
        record.priority = priority;
        fixture.task_repo.update(&record).await.unwrap();
        record
    }

    #[test]
    async fn claims_highest_priority_first() {
        let fixture = fixture().await;
        fixture
            .library_repo
            .create("Movies", "/library", 0)
            .await
            .unwrap();

        seed_pending(&fixture, "/library/low.mkv", 1, 10).await;
        let high = seed_pending(&fixture, "/library/high.mkv", 1, 100).await;

        let claimed = fixture
            .queue
            .get_next_pending_task(false, None, None)
            .await
            .unwrap()
            .expect("expected a task");
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, "in_progress");
        assert!(claimed.start_time.is_some());

        // The same task is never handed out twice.
        let next = fixture
            .queue
            .get_next_pending_task(false, None, None)
            .await
            .unwrap()
            .expect("expected the remaining task");
        assert_eq!(next.abspath, "/library/low.mkv");

        assert!(fixture.queue.pending_is_empty().await.unwrap());
        assert!(!fixture.queue.in_progress_is_empty().await.unwrap());
    }

    #[test]
    async fn ties_break_by_insertion_order() {
        let fixture = fixture().await;
        fixture
            .library_repo
            .create("Movies", "/library", 0)
            .await
            .unwrap();

        let first = seed_pending(&fixture, "/library/a.mkv", 1, 50).await;
        seed_pending(&fixture, "/library/b.mkv", 1, 50).await;

        let claimed = fixture
            .queue
            .get_next_pending_task(false, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[test]
    async fn local_only_skips_remote_tasks() {
        let fixture = fixture().await;
        fixture
            .library_repo
            .create("Movies", "/library", 0)
            .await
            .unwrap();

        let mut remote = fixture
            .task_repo
            .create("/remote/r.mkv", "remote", 1)
            .await
            .unwrap();
        remote.status = "pending".to_string();
        remote.priority = 500;
        fixture.task_repo.update(&remote).await.unwrap();

        let local = seed_pending(&fixture, "/library/l.mkv", 1, 1).await;

        let claimed = fixture
            .queue
            .get_next_pending_task(true, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, local.id);
    }

    #[test]
    async fn empty_tag_filter_matches_only_untagged_libraries() {
        let fixture = fixture().await;
        let tagged = fixture
            .library_repo
            .create("Tagged", "/tagged", 0)
            .await
            .unwrap();
        fixture
            .library_repo
            .add_tag(tagged.id, "encode")
            .await
            .unwrap();
        let untagged = fixture
            .library_repo
            .create("Untagged", "/untagged", 0)
            .await
            .unwrap();

        let t1 = seed_pending(&fixture, "/tagged/t1.mkv", tagged.id, 100).await;
        let t2 = seed_pending(&fixture, "/untagged/t2.mkv", untagged.id, 50).await;

        // Workers with tags only pick up libraries sharing a tag.
        let for_tagged = fixture
            .queue
            .get_next_pending_task(false, None, Some(&["encode".to_string()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(for_tagged.id, t1.id);

        // Workers without tags only pick up untagged libraries.
        let for_untagged = fixture
            .queue
            .get_next_pending_task(false, None, Some(&[]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(for_untagged.id, t2.id);

        // Neither crosses.
        assert!(fixture
            .queue
            .get_next_pending_task(false, None, Some(&["encode".to_string()]))
            .await
            .unwrap()
            .is_none());
        assert!(fixture
            .queue
            .get_next_pending_task(false, None, Some(&[]))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    async fn library_name_filter_restricts_claims() {
        let fixture = fixture().await;
        let movies = fixture
            .library_repo
            .create("Movies", "/movies", 0)
            .await
            .unwrap();
        let shows = fixture
            .library_repo
            .create("Shows", "/shows", 0)
            .await
            .unwrap();

        seed_pending(&fixture, "/movies/m.mkv", movies.id, 100).await;
        let show_task = seed_pending(&fixture, "/shows/s.mkv", shows.id, 10).await;

        let claimed = fixture
            .queue
            .get_next_pending_task(false, Some(&["Shows".to_string()]), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, show_task.id);

        // An empty advertised-name list can never match.
        assert!(fixture
            .queue
            .get_next_pending_task(false, Some(&[]), None)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    async fn requeue_at_bottom_moves_below_all_pending() {
        let fixture = fixture().await;
        fixture
            .library_repo
            .create("Movies", "/library", 0)
            .await
            .unwrap();

        seed_pending(&fixture, "/library/a.mkv", 1, 5).await;
        let claimed = {
            let b = seed_pending(&fixture, "/library/b.mkv", 1, 10).await;
            fixture.queue.mark_in_progress(b.id).await.unwrap()
        };

        assert!(fixture.queue.requeue_at_bottom(claimed.id).await.unwrap());

        let requeued = fixture.queue.get_task(claimed.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, "pending");
        assert_eq!(requeued.priority, 4);
        assert!(requeued.start_time.is_none());
        assert!(requeued.processed_by_worker.is_none());

        // Requeue of a task that is not pending or in_progress still succeeds.
        assert!(fixture.queue.requeue_at_bottom(claimed.id).await.unwrap());
    }

    #[test]
    async fn status_mutations_enforce_the_lifecycle() {
        let fixture = fixture().await;
        fixture
            .library_repo
            .create("Movies", "/library", 0)
            .await
            .unwrap();

        let record = seed_pending(&fixture, "/library/a.mkv", 1, 1).await;

        // pending -> processed is illegal
        let err = fixture.queue.mark_processed(record.id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidStatus {
                from: TaskStatus::Pending,
                to: TaskStatus::Processed
            }
        ));

        let claimed = fixture.queue.mark_in_progress(record.id).await.unwrap();
        assert_eq!(claimed.status, "in_progress");

        // in_progress -> in_progress is illegal
        let err = fixture.queue.mark_in_progress(record.id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidStatus { .. }));

        let processed = fixture.queue.mark_processed(record.id).await.unwrap();
        assert_eq!(processed.status, "processed");
        assert!(processed.finish_time.is_some());

        let next = fixture
            .queue
            .get_next_processed_task()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, record.id);
    }
}
