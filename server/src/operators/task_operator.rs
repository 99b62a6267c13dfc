use crate::{
    data::models::{IngestMessage, Pool, ProcessingStage, Task, TaskState, VersionStatus},
    errors::{PipelineError, ServiceError},
    operators::document_operator::set_version_status_query,
};
use actix_web::web;
use chrono::Duration as ChronoDuration;
use diesel::prelude::*;
use std::time::Duration;

pub const INGEST_QUEUE: &str = "ingest_documents";
pub const LEASE_TTL_SECS: i64 = 60;
pub const MAX_ATTEMPTS: i32 = 5;

/// Pause before requeueing a task stalled on an unavailable blob store.
const STALL_REQUEUE_DELAY: Duration = Duration::from_secs(15);

pub fn create_task_query(new_task: Task, pool: web::Data<Pool>) -> Result<Task, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let task: Task = diesel::insert_into(tasks_columns::tasks)
        .values(&new_task)
        .get_result(&mut conn)?;

    Ok(task)
}

pub fn get_task_query(task_id: uuid::Uuid, pool: web::Data<Pool>) -> Result<Task, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let task: Option<Task> = tasks_columns::tasks
        .filter(tasks_columns::id.eq(task_id))
        .select(Task::as_select())
        .first::<Task>(&mut conn)
        .optional()?;

    task.ok_or(ServiceError::NotFound("Task not found".to_string()))
}

/// The single non-terminal task for a version, if any. One active task per
/// version at a time.
pub fn get_active_task_for_version_query(
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Option<Task>, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let task: Option<Task> = tasks_columns::tasks
        .filter(tasks_columns::version_id.eq(version_id))
        .filter(tasks_columns::state.eq_any(vec![
            TaskState::Queued.to_string(),
            TaskState::Running.to_string(),
            TaskState::Paused.to_string(),
        ]))
        .select(Task::as_select())
        .first::<Task>(&mut conn)
        .optional()?;

    Ok(task)
}

pub fn list_tasks_query(
    state: Option<String>,
    limit: i64,
    pool: web::Data<Pool>,
) -> Result<Vec<Task>, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let mut query = tasks_columns::tasks.into_boxed();
    if let Some(state) = state {
        query = query.filter(tasks_columns::state.eq(state));
    }

    let tasks: Vec<Task> = query
        .order(tasks_columns::updated_at.desc())
        .limit(limit)
        .select(Task::as_select())
        .load(&mut conn)?;

    Ok(tasks)
}

pub fn child_tasks_query(
    parent_task_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Vec<Task>, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let tasks: Vec<Task> = tasks_columns::tasks
        .filter(tasks_columns::parent_task_id.eq(parent_task_id))
        .select(Task::as_select())
        .load(&mut conn)?;

    Ok(tasks)
}

/// Claim is a conditional update: only a queued task can move to running,
/// so two workers racing on the same message get exactly one winner.
pub fn claim_task_query(
    task_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Option<Task>, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let now = chrono::Utc::now().naive_utc();
    let claimed: Option<Task> = diesel::update(
        tasks_columns::tasks
            .filter(tasks_columns::id.eq(task_id))
            .filter(tasks_columns::state.eq(TaskState::Queued.to_string())),
    )
    .set((
        tasks_columns::state.eq(TaskState::Running.to_string()),
        tasks_columns::lease_expires_at.eq(now + ChronoDuration::seconds(LEASE_TTL_SECS)),
        tasks_columns::updated_at.eq(now),
    ))
    .get_result(&mut conn)
    .optional()?;

    Ok(claimed)
}

/// Heartbeat extends the lease while the worker is alive. Returns false if
/// the task is no longer running here (lease stolen or task cancelled).
pub fn heartbeat_task_query(task_id: uuid::Uuid, pool: web::Data<Pool>) -> Result<bool, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let now = chrono::Utc::now().naive_utc();
    let updated = diesel::update(
        tasks_columns::tasks
            .filter(tasks_columns::id.eq(task_id))
            .filter(tasks_columns::state.eq(TaskState::Running.to_string())),
    )
    .set(tasks_columns::lease_expires_at.eq(now + ChronoDuration::seconds(LEASE_TTL_SECS)))
    .execute(&mut conn)?;

    Ok(updated > 0)
}

/// Persist the durable stage cursor. Called at every suspension point.
pub fn checkpoint_task_query(
    task_id: uuid::Uuid,
    stage: ProcessingStage,
    sub_index: i32,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(tasks_columns::tasks.filter(tasks_columns::id.eq(task_id)))
        .set((
            tasks_columns::stage_cursor.eq(stage.to_string()),
            tasks_columns::stage_sub_index.eq(sub_index),
            tasks_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFlags {
    pub pause_requested: bool,
    pub cancel_requested: bool,
}

pub fn control_flags_query(
    task_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<ControlFlags, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let flags: (bool, bool) = tasks_columns::tasks
        .filter(tasks_columns::id.eq(task_id))
        .select((
            tasks_columns::pause_requested,
            tasks_columns::cancel_requested,
        ))
        .first(&mut conn)?;

    Ok(ControlFlags {
        pause_requested: flags.0 && !flags.1,
        cancel_requested: flags.1,
    })
}

pub fn request_pause_query(task_id: uuid::Uuid, pool: web::Data<Pool>) -> Result<Task, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let task = get_task_query(task_id, pool.clone())?;
    if task.state_enum().is_terminal() {
        return Err(ServiceError::Conflict("Task already finished".to_string()));
    }

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let task: Task = diesel::update(tasks_columns::tasks.filter(tasks_columns::id.eq(task_id)))
        .set((
            tasks_columns::pause_requested.eq(true),
            tasks_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .get_result(&mut conn)?;

    Ok(task)
}

/// Clears the pause flag and requeues a paused task. The caller pushes the
/// wake-up message back onto the Redis queue.
pub fn resume_task_query(task_id: uuid::Uuid, pool: web::Data<Pool>) -> Result<Task, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let task = get_task_query(task_id, pool.clone())?;
    if !task.pause_requested && task.state_enum() != TaskState::Paused {
        return Err(ServiceError::Conflict("Task is not paused".to_string()));
    }

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let task: Task = diesel::update(tasks_columns::tasks.filter(tasks_columns::id.eq(task_id)))
        .set((
            tasks_columns::pause_requested.eq(false),
            tasks_columns::state.eq(TaskState::Queued.to_string()),
            tasks_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .get_result(&mut conn)?;

    Ok(task)
}

/// Cooperative cancel: flags the task (and all children) so workers stop at
/// the next checkpoint. Partial artifacts stay tagged for cleanup.
pub fn request_cancel_query(task_id: uuid::Uuid, pool: web::Data<Pool>) -> Result<Task, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let task = get_task_query(task_id, pool.clone())?;
    if task.state_enum().is_terminal() {
        return Err(ServiceError::Conflict("Task already finished".to_string()));
    }

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let now = chrono::Utc::now().naive_utc();

    diesel::update(
        tasks_columns::tasks.filter(tasks_columns::parent_task_id.eq(task_id)),
    )
    .set((
        tasks_columns::cancel_requested.eq(true),
        tasks_columns::updated_at.eq(now),
    ))
    .execute(&mut conn)?;

    let task: Task = diesel::update(tasks_columns::tasks.filter(tasks_columns::id.eq(task_id)))
        .set((
            tasks_columns::cancel_requested.eq(true),
            tasks_columns::updated_at.eq(now),
        ))
        .get_result(&mut conn)?;

    // A queued task will never reach a checkpoint, settle it here.
    for waiting in std::iter::once(task.clone()).chain(child_tasks_query(task_id, pool.clone())?) {
        if waiting.state_enum() == TaskState::Queued {
            finish_task_query(waiting.id, TaskState::Cancelled, None, pool.clone())?;
            set_version_status_query(
                waiting.version_id,
                VersionStatus::Cancelled,
                None,
                pool.clone(),
            )?;
        }
    }

    Ok(task)
}

pub fn finish_task_query(
    task_id: uuid::Uuid,
    state: TaskState,
    last_error: Option<String>,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(tasks_columns::tasks.filter(tasks_columns::id.eq(task_id)))
        .set((
            tasks_columns::state.eq(state.to_string()),
            tasks_columns::last_error.eq(last_error),
            tasks_columns::lease_expires_at.eq(None::<chrono::NaiveDateTime>),
            tasks_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    Ok(())
}

pub fn park_task_query(
    task_id: uuid::Uuid,
    state: TaskState,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(tasks_columns::tasks.filter(tasks_columns::id.eq(task_id)))
        .set((
            tasks_columns::state.eq(state.to_string()),
            tasks_columns::lease_expires_at.eq(None::<chrono::NaiveDateTime>),
            tasks_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    Ok(())
}

/// Crash recovery: running tasks whose lease lapsed go back to queued with
/// one more attempt on the clock. Returns what was swept so the caller can
/// push wake-up messages.
pub fn sweep_expired_leases_query(pool: web::Data<Pool>) -> Result<Vec<Task>, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let now = chrono::Utc::now().naive_utc();

    let swept: Vec<Task> = diesel::update(
        tasks_columns::tasks
            .filter(tasks_columns::state.eq(TaskState::Running.to_string()))
            .filter(tasks_columns::lease_expires_at.lt(now)),
    )
    .set((
        tasks_columns::state.eq(TaskState::Queued.to_string()),
        tasks_columns::attempt_count.eq(tasks_columns::attempt_count + 1),
        tasks_columns::lease_expires_at.eq(None::<chrono::NaiveDateTime>),
        tasks_columns::updated_at.eq(now),
    ))
    .get_results(&mut conn)?;

    Ok(swept)
}

pub fn increment_attempt_query(task_id: uuid::Uuid, pool: web::Data<Pool>) -> Result<i32, ServiceError> {
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let task: Task = diesel::update(tasks_columns::tasks.filter(tasks_columns::id.eq(task_id)))
        .set((
            tasks_columns::attempt_count.eq(tasks_columns::attempt_count + 1),
            tasks_columns::state.eq(TaskState::Queued.to_string()),
            tasks_columns::lease_expires_at.eq(None::<chrono::NaiveDateTime>),
            tasks_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .get_result(&mut conn)?;

    Ok(task.attempt_count)
}

pub async fn enqueue_ingest_message(
    message: &IngestMessage,
    redis_connection: &mut redis::aio::MultiplexedConnection,
) -> Result<(), ServiceError> {
    let serialized = serde_json::to_string(message).map_err(|_| {
        ServiceError::InternalServerError("Failed to serialize ingest message".to_string())
    })?;

    redis::cmd("lpush")
        .arg(INGEST_QUEUE)
        .arg(&serialized)
        .query_async::<i64>(redis_connection)
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(err.to_string()))?;

    Ok(())
}

/// Blocking pop with a processing side-list so messages survive a worker
/// crash between pop and claim.
pub async fn listen_for_ingest_message(
    redis_connection: &mut redis::aio::MultiplexedConnection,
) -> Option<IngestMessage> {
    let payload: Result<Option<String>, redis::RedisError> = redis::cmd("brpoplpush")
        .arg(INGEST_QUEUE)
        .arg(format!("{}_processing", INGEST_QUEUE))
        .arg(1.0)
        .query_async(redis_connection)
        .await;

    let serialized = match payload {
        Ok(Some(serialized)) => serialized,
        Ok(None) => return None,
        Err(err) => {
            if !err.is_timeout() {
                log::error!("Unable to poll ingest queue: {:?}", err);
            }
            return None;
        }
    };

    match serde_json::from_str::<IngestMessage>(&serialized) {
        Ok(message) => Some(message),
        Err(err) => {
            log::error!("Dropping malformed ingest message: {:?}", err);
            None
        }
    }
}

pub async fn remove_from_processing(
    message: &IngestMessage,
    redis_connection: &mut redis::aio::MultiplexedConnection,
) {
    if let Ok(serialized) = serde_json::to_string(message) {
        let _ = redis::cmd("LREM")
            .arg(format!("{}_processing", INGEST_QUEUE))
            .arg(1)
            .arg(&serialized)
            .query_async::<i64>(redis_connection)
            .await;
    }
}

/// Maps a stage failure onto the retry/fail policy and settles both the
/// task row and the version status.
pub async fn handle_pipeline_error(
    task: &Task,
    error: PipelineError,
    pool: web::Data<Pool>,
    redis_connection: &mut redis::aio::MultiplexedConnection,
) -> Result<(), ServiceError> {
    match error {
        PipelineError::Cancelled => {
            log::info!("task {} cancelled at checkpoint", task.id);
            finish_task_query(task.id, TaskState::Cancelled, None, pool.clone())?;
            set_version_status_query(task.version_id, VersionStatus::Cancelled, None, pool)?;
        }
        PipelineError::PermanentInput(message) => {
            log::error!("task {} failed permanently: {}", task.id, message);
            finish_task_query(
                task.id,
                TaskState::Failed,
                Some(message.clone()),
                pool.clone(),
            )?;
            set_version_status_query(
                task.version_id,
                VersionStatus::Failed,
                Some(message),
                pool,
            )?;
        }
        PipelineError::Permission(message) | PipelineError::Invariant(message) => {
            log::error!("task {} failed: {}", task.id, message);
            finish_task_query(
                task.id,
                TaskState::Failed,
                Some(message.clone()),
                pool.clone(),
            )?;
            set_version_status_query(
                task.version_id,
                VersionStatus::Failed,
                Some(message),
                pool,
            )?;
        }
        PipelineError::Stalled(message) => {
            // Storage outage: the task goes back to the queue with its
            // attempt budget untouched and waits out the outage.
            log::warn!("task {} stalled on blob store: {}", task.id, message);
            park_task_query(task.id, TaskState::Queued, pool)?;
            tokio::time::sleep(STALL_REQUEUE_DELAY).await;

            let mut retry = IngestMessage::new(task.id, task.version_id);
            retry.attempt_number = task.attempt_count;
            enqueue_ingest_message(&retry, redis_connection).await?;
        }
        PipelineError::Transient(message) => {
            let attempts = increment_attempt_query(task.id, pool.clone())?;
            if attempts >= MAX_ATTEMPTS {
                log::error!(
                    "task {} exhausted {} attempts: {}",
                    task.id,
                    attempts,
                    message
                );
                finish_task_query(
                    task.id,
                    TaskState::Failed,
                    Some(message.clone()),
                    pool.clone(),
                )?;
                set_version_status_query(
                    task.version_id,
                    VersionStatus::Failed,
                    Some(message),
                    pool,
                )?;
            } else {
                log::warn!(
                    "task {} retrying (attempt {}): {}",
                    task.id,
                    attempts,
                    message
                );
                let mut retry = IngestMessage::new(task.id, task.version_id);
                retry.attempt_number = attempts;
                enqueue_ingest_message(&retry, redis_connection).await?;
            }
        }
    }

    Ok(())
}
