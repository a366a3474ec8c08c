use remux_common::model::{ScheduleAction, ScheduleRepetition, WorkerScheduleEvent};
use remux_common::SafeDisplay;
use remux_service_base::repo::settings::SettingsRepo;
use remux_service_base::repo::worker_group::{WorkerGroupRepo, WorkerScheduleRecord};
use remux_service_base::repo::RepoError;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_GROUP_NAME: &str = "default";
/// Upper bound on workers within one group.
pub const MAX_WORKERS_PER_GROUP: i64 = 12;

/// Settings key used by installations that predate worker groups.
const LEGACY_WORKER_COUNT_KEY: &str = "number_of_workers";

#[derive(Debug, thiserror::Error)]
pub enum WorkerGroupError {
    #[error("Worker group {0} not found")]
    NotFound(i64),
    #[error("Invalid schedule entry: {0}")]
    InvalidSchedule(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for WorkerGroupError {
    fn to_safe_string(&self) -> String {
        match self {
            WorkerGroupError::NotFound(_) | WorkerGroupError::InvalidSchedule(_) => {
                self.to_string()
            }
            WorkerGroupError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

/// A worker group with its dispatch tags and schedule, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerGroup {
    pub id: i64,
    pub name: String,
    pub locked: bool,
    pub number_of_workers: i64,
    pub tags: Vec<String>,
    pub schedules: Vec<WorkerScheduleEvent>,
}

fn schedule_from_record(record: &WorkerScheduleRecord) -> Option<WorkerScheduleEvent> {
    let repetition = ScheduleRepetition::from_str(&record.repetition).ok()?;
    let schedule_task = ScheduleAction::from_str(&record.schedule_task).ok()?;
    Some(WorkerScheduleEvent {
        repetition,
        schedule_time: record.schedule_time.clone(),
        schedule_task,
        schedule_worker_count: record.schedule_worker_count,
    })
}

fn valid_hhmm(value: &str) -> bool {
    let Some((hours, minutes)) = value.split_once(':') else {
        return false;
    };
    let hours_ok = hours.len() == 2 && hours.parse::<u32>().map(|h| h < 24).unwrap_or(false);
    let minutes_ok =
        minutes.len() == 2 && minutes.parse::<u32>().map(|m| m < 60).unwrap_or(false);
    hours_ok && minutes_ok
}

/// Worker-group configuration. Groups hold configuration only; the foreman
/// owns the actual worker threads.
pub struct WorkerGroupService {
    repo: Arc<dyn WorkerGroupRepo>,
    settings: Arc<dyn SettingsRepo>,
}

impl WorkerGroupService {
    pub fn new(repo: Arc<dyn WorkerGroupRepo>, settings: Arc<dyn SettingsRepo>) -> Self {
        Self { repo, settings }
    }

    /// All configured groups. On first run, when no group exists yet, a
    /// legacy scalar worker count (if present) is migrated into a locked
    /// default group and then cleared.
    pub async fn get_all_worker_groups(&self) -> Result<Vec<WorkerGroup>, WorkerGroupError> {
        let mut records = self.repo.get_all().await?;
        if records.is_empty() {
            let legacy_count = self
                .settings
                .get(LEGACY_WORKER_COUNT_KEY)
                .await?
                .and_then(|value| value.parse::<i64>().ok());
            let count = legacy_count.unwrap_or(1).clamp(0, MAX_WORKERS_PER_GROUP);
            if legacy_count.is_some() {
                info!(
                    count,
                    "Migrating legacy worker count into the default worker group"
                );
            }
            self.repo.create(DEFAULT_GROUP_NAME, count, true).await?;
            self.settings.delete(LEGACY_WORKER_COUNT_KEY).await?;
            records = self.repo.get_all().await?;
        }

        let mut groups = Vec::with_capacity(records.len());
        for record in records {
            let tags = self.repo.get_tags(record.id).await?;
            let schedules = self
                .repo
                .get_schedules(record.id)
                .await?
                .iter()
                .filter_map(|schedule| {
                    let parsed = schedule_from_record(schedule);
                    if parsed.is_none() {
                        warn!(
                            group_id = record.id,
                            schedule_id = schedule.id,
                            "Skipping unparseable worker schedule entry"
                        );
                    }
                    parsed
                })
                .collect();
            groups.push(WorkerGroup {
                id: record.id,
                name: record.name,
                locked: record.locked,
                number_of_workers: record.number_of_workers,
                tags,
                schedules,
            });
        }
        Ok(groups)
    }

    pub async fn get_worker_group(
        &self,
        group_id: i64,
    ) -> Result<Option<WorkerGroup>, WorkerGroupError> {
        Ok(self
            .get_all_worker_groups()
            .await?
            .into_iter()
            .find(|group| group.id == group_id))
    }

    pub async fn set_number_of_workers(
        &self,
        group_id: i64,
        count: i64,
    ) -> Result<(), WorkerGroupError> {
        if self.repo.get(group_id).await?.is_none() {
            return Err(WorkerGroupError::NotFound(group_id));
        }
        let count = count.clamp(0, MAX_WORKERS_PER_GROUP);
        self.repo.set_number_of_workers(group_id, count).await?;
        Ok(())
    }

    pub async fn set_tags(&self, group_id: i64, tags: &[String]) -> Result<(), WorkerGroupError> {
        if self.repo.get(group_id).await?.is_none() {
            return Err(WorkerGroupError::NotFound(group_id));
        }
        self.repo.set_tags(group_id, tags).await?;
        Ok(())
    }

    /// Replace the full schedule set for a group in one transaction.
    pub async fn set_worker_event_schedules(
        &self,
        group_id: i64,
        events: &[WorkerScheduleEvent],
    ) -> Result<(), WorkerGroupError> {
        if self.repo.get(group_id).await?.is_none() {
            return Err(WorkerGroupError::NotFound(group_id));
        }
        for event in events {
            if !valid_hhmm(&event.schedule_time) {
                return Err(WorkerGroupError::InvalidSchedule(format!(
                    "schedule_time '{}' is not HH:MM",
                    event.schedule_time
                )));
            }
            if event.schedule_task == ScheduleAction::Count
                && event.schedule_worker_count.is_none()
            {
                return Err(WorkerGroupError::InvalidSchedule(
                    "count events require schedule_worker_count".to_string(),
                ));
            }
        }

        let rows: Vec<(String, String, String, Option<i64>)> = events
            .iter()
            .map(|event| {
                (
                    event.repetition.to_string(),
                    event.schedule_time.clone(),
                    event.schedule_task.to_string(),
                    event.schedule_worker_count,
                )
            })
            .collect();
        self.repo.replace_schedules(group_id, &rows).await?;
        Ok(())
    }

    pub async fn delete_worker_group(&self, group_id: i64) -> Result<bool, WorkerGroupError> {
        Ok(self.repo.delete(group_id).await?)
    }

    pub async fn total_worker_count(&self) -> Result<i64, WorkerGroupError> {
        Ok(self
            .get_all_worker_groups()
            .await?
            .iter()
            .map(|group| group.number_of_workers)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use remux_service_base::db::in_memory_pool;
    use remux_service_base::repo::settings::DbSettingsRepo;
    use remux_service_base::repo::worker_group::DbWorkerGroupRepo;

    async fn service() -> (WorkerGroupService, Arc<dyn SettingsRepo>) {
        let pool = Arc::new(in_memory_pool().await);
        let settings: Arc<dyn SettingsRepo> = Arc::new(DbSettingsRepo::new(pool.clone()));
        (
            WorkerGroupService::new(Arc::new(DbWorkerGroupRepo::new(pool)), settings.clone()),
            settings,
        )
    }

    #[test]
    async fn first_run_creates_a_locked_default_group() {
        let (service, _) = service().await;
        let groups = service.get_all_worker_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, DEFAULT_GROUP_NAME);
        assert!(groups[0].locked);
        assert_eq!(groups[0].number_of_workers, 1);
    }

    #[test]
    async fn legacy_worker_count_is_migrated_then_cleared() {
        let (service, settings) = service().await;
        settings.set("number_of_workers", "4").await.unwrap();

        let groups = service.get_all_worker_groups().await.unwrap();
        assert_eq!(groups[0].number_of_workers, 4);
        assert_eq!(settings.get("number_of_workers").await.unwrap(), None);

        // The migration happens once.
        let groups = service.get_all_worker_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    async fn schedules_are_replaced_transactionally() {
        let (service, _) = service().await;
        let group_id = service.get_all_worker_groups().await.unwrap()[0].id;

        let events = vec![
            WorkerScheduleEvent {
                repetition: ScheduleRepetition::Daily,
                schedule_time: "08:00".to_string(),
                schedule_task: ScheduleAction::Resume,
                schedule_worker_count: None,
            },
            WorkerScheduleEvent {
                repetition: ScheduleRepetition::Weekend,
                schedule_time: "22:30".to_string(),
                schedule_task: ScheduleAction::Count,
                schedule_worker_count: Some(6),
            },
        ];
        service
            .set_worker_event_schedules(group_id, &events)
            .await
            .unwrap();

        let group = service.get_worker_group(group_id).await.unwrap().unwrap();
        assert_eq!(group.schedules, events);

        service
            .set_worker_event_schedules(group_id, &events[..1])
            .await
            .unwrap();
        let group = service.get_worker_group(group_id).await.unwrap().unwrap();
        assert_eq!(group.schedules.len(), 1);
    }

    #[test]
    async fn invalid_schedule_times_are_rejected() {
        let (service, _) = service().await;
        let group_id = service.get_all_worker_groups().await.unwrap()[0].id;

        let event = WorkerScheduleEvent {
            repetition: ScheduleRepetition::Daily,
            schedule_time: "25:99".to_string(),
            schedule_task: ScheduleAction::Pause,
            schedule_worker_count: None,
        };
        let err = service
            .set_worker_event_schedules(group_id, &[event])
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerGroupError::InvalidSchedule(_)));
    }

    #[test]
    async fn locked_groups_cannot_be_deleted() {
        let (service, _) = service().await;
        let group_id = service.get_all_worker_groups().await.unwrap()[0].id;
        assert!(!service.delete_worker_group(group_id).await.unwrap());
    }
}
