use crate::{
    data::models::{IngestMessage, LoggedUser, Pool, RedisPool, Task},
    errors::{ErrorResponseBody, ServiceError},
    operators::{
        document_operator::{get_version_with_group_query, get_versions_with_groups_query},
        permission_operator::{can_modify, PermissionRecord},
        task_operator::{
            child_tasks_query, enqueue_ingest_message, get_task_query, list_tasks_query,
            request_cancel_query, request_pause_query, resume_task_query,
        },
    },
};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use utoipa::ToSchema;

fn authorize_task_control(
    task: &Task,
    user: &LoggedUser,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    let (version, group) = get_version_with_group_query(task.version_id, pool)?;
    if !can_modify(user, &PermissionRecord::from_version(&group, &version)) {
        return Err(ServiceError::Forbidden);
    }
    Ok(())
}

fn task_json(task: &Task) -> serde_json::Value {
    serde_json::json!({
        "id": task.id,
        "kind": task.kind,
        "version_id": task.version_id,
        "state": task.state,
        "stage": task.stage_cursor,
        "attempt_count": task.attempt_count,
        "last_error": task.last_error,
        "parent_task_id": task.parent_task_id,
        "created_at": task.created_at,
        "updated_at": task.updated_at,
    })
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListTasksParams {
    pub state: Option<String>,
    pub limit: Option<i64>,
}

/// List tasks (superuser sees all; others see tasks on their documents).
#[utoipa::path(
    get,
    path = "/tasks",
    tag = "Tasks",
    responses((status = 200, description = "Tasks, most recently updated first")),
    security(("bearer" = [])),
)]
pub async fn list_tasks(
    params: web::Query<ListTasksParams>,
    user: LoggedUser,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let state = params.state.clone();
    let limit = params.limit.unwrap_or(50).clamp(1, 500);

    let tasks = web::block(move || {
        let tasks = list_tasks_query(state, limit, pool.clone())?;
        if user.is_superuser {
            return Ok(tasks);
        }

        // One batched lookup covers authorization for the whole page.
        let version_ids: Vec<uuid::Uuid> = tasks.iter().map(|task| task.version_id).collect();
        let lookup = get_versions_with_groups_query(version_ids, pool)?;

        Ok::<_, ServiceError>(
            tasks
                .into_iter()
                .filter(|task| {
                    lookup
                        .get(&task.version_id)
                        .map(|(version, group)| {
                            can_modify(&user, &PermissionRecord::from_version(group, version))
                        })
                        .unwrap_or(false)
                })
                .collect(),
        )
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let tasks: Vec<serde_json::Value> = tasks.iter().map(task_json).collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({ "tasks": tasks })))
}

/// Task detail including children of archive parents.
#[utoipa::path(
    get,
    path = "/tasks/{task_id}",
    tag = "Tasks",
    params(("task_id" = uuid::Uuid, Path, description = "Task")),
    responses(
        (status = 200, description = "Task with children"),
        (status = 404, description = "Unknown task", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn get_task(
    task_id: web::Path<uuid::Uuid>,
    user: LoggedUser,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let task_id = task_id.into_inner();

    let (task, children) = web::block(move || {
        let task = get_task_query(task_id, pool.clone())?;
        authorize_task_control(&task, &user, pool.clone())?;
        let children = child_tasks_query(task.id, pool)?;
        Ok::<_, ServiceError>((task, children))
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let children: Vec<serde_json::Value> = children.iter().map(task_json).collect();

    let mut body = task_json(&task);
    body["children"] = serde_json::json!(children);

    Ok(HttpResponse::Ok().json(body))
}

/// Pause: the worker stops after the current stage step.
#[utoipa::path(
    post,
    path = "/tasks/{task_id}/pause",
    tag = "Tasks",
    params(("task_id" = uuid::Uuid, Path, description = "Task")),
    responses(
        (status = 200, description = "Pause requested"),
        (status = 409, description = "Task already finished", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn pause_task(
    task_id: web::Path<uuid::Uuid>,
    user: LoggedUser,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let task_id = task_id.into_inner();

    let task = web::block(move || {
        let task = get_task_query(task_id, pool.clone())?;
        authorize_task_control(&task, &user, pool.clone())?;
        request_pause_query(task.id, pool)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(task_json(&task)))
}

/// Resume a paused task.
#[utoipa::path(
    post,
    path = "/tasks/{task_id}/resume",
    tag = "Tasks",
    params(("task_id" = uuid::Uuid, Path, description = "Task")),
    responses(
        (status = 200, description = "Task requeued"),
        (status = 409, description = "Task is not paused", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn resume_task(
    task_id: web::Path<uuid::Uuid>,
    user: LoggedUser,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let task_id = task_id.into_inner();

    let task = web::block(move || {
        let task = get_task_query(task_id, pool.clone())?;
        authorize_task_control(&task, &user, pool.clone())?;
        resume_task_query(task.id, pool)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let mut redis_conn = redis_pool
        .get()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(err.to_string()))?;
    enqueue_ingest_message(&IngestMessage::new(task.id, task.version_id), &mut redis_conn).await?;

    Ok(HttpResponse::Ok().json(task_json(&task)))
}

/// Cancel cooperatively; children of archive parents are cancelled too.
#[utoipa::path(
    post,
    path = "/tasks/{task_id}/cancel",
    tag = "Tasks",
    params(("task_id" = uuid::Uuid, Path, description = "Task")),
    responses(
        (status = 200, description = "Cancellation requested"),
        (status = 409, description = "Task already finished", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn cancel_task(
    task_id: web::Path<uuid::Uuid>,
    user: LoggedUser,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let task_id = task_id.into_inner();

    let task = web::block(move || {
        let task = get_task_query(task_id, pool.clone())?;
        authorize_task_control(&task, &user, pool.clone())?;
        request_cancel_query(task.id, pool)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(task_json(&task)))
}
