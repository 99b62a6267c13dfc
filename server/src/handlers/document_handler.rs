use crate::{
    data::models::{
        DocumentGroup, DocumentVersion, LoggedUser, OcrEngine, Pool, ProcessingMode, RedisPool,
        UploadOptions, Visibility,
    },
    errors::{ErrorResponseBody, ServiceError},
    operators::{
        document_operator::{
            get_group_by_id_query, get_page_query, get_version_with_group_query,
            list_versions_by_group_query, list_visible_documents_query,
            update_version_permissions_query,
        },
        event_operator::create_event_query,
        index_operator::update_permissions_by_version,
        permission_operator::{can_modify, can_view, share_targets_allowed, PermissionRecord},
        pipeline_operator::register_upload,
        storage_operator::{get_blob_bucket, presign_get_url},
        user_operator::get_user_orgs_query,
        version_operator::{delete_version_query, restore_version_query},
    },
};
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

const PRESIGN_TTL_SECS: u32 = 300;

#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct DocumentResponse {
    pub id: uuid::Uuid,
    pub group_id: uuid::Uuid,
    pub filename: String,
    pub version_number: i32,
    pub is_latest: bool,
    pub checksum: String,
    pub file_type: String,
    pub file_size: i64,
    pub status: String,
    pub total_pages: i32,
    pub processed_pages: i32,
    pub progress_percent: i32,
    pub visibility: String,
    pub shared_with_users: Vec<uuid::Uuid>,
    pub shared_with_roles: Vec<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub owner_id: uuid::Uuid,
    pub org_id: Option<uuid::Uuid>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

impl DocumentResponse {
    fn from_parts(version: DocumentVersion, group: &DocumentGroup) -> Self {
        DocumentResponse {
            id: version.id,
            group_id: group.id,
            filename: group.canonical_filename.clone(),
            version_number: version.version_number,
            is_latest: version.is_latest,
            checksum: version.checksum,
            file_type: version.file_type,
            file_size: version.file_size,
            status: version.status,
            total_pages: version.total_pages,
            processed_pages: version.processed_pages,
            progress_percent: version.progress_percent,
            visibility: version.visibility,
            shared_with_users: version.shared_user_ids,
            shared_with_roles: version.shared_role_codes,
            category: version.category,
            tags: version.tags,
            author: version.author,
            description: version.description,
            owner_id: group.owner_id,
            org_id: group.org_id,
            created_at: version.created_at,
            updated_at: version.updated_at,
        }
    }
}

struct UploadForm {
    files: Vec<(String, Vec<u8>)>,
    fields: HashMap<String, String>,
}

fn max_upload_bytes() -> usize {
    std::env::var("MAX_UPLOAD_BYTES")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(104857600)
}

async fn read_multipart(mut payload: Multipart) -> Result<UploadForm, actix_web::Error> {
    let mut files = vec![];
    let mut fields = HashMap::new();
    let mut received = 0usize;
    let limit = max_upload_bytes();

    while let Some(mut field) = payload.try_next().await? {
        let (name, filename) = {
            let Some(disposition) = field.content_disposition() else {
                continue;
            };
            (
                disposition.get_name().unwrap_or("").to_string(),
                disposition.get_filename().map(|f| f.to_string()),
            )
        };

        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            received += chunk.len();
            if received > limit {
                return Err(ServiceError::PayloadTooLarge.into());
            }
            data.extend_from_slice(&chunk);
        }

        match filename {
            Some(filename) if name == "file" || name == "files" || name == "files[]" => {
                files.push((filename.replace('/', "_"), data));
            }
            _ => {
                fields.insert(name, String::from_utf8_lossy(&data).to_string());
            }
        }
    }

    Ok(UploadForm { files, fields })
}

fn options_from_fields(
    fields: &HashMap<String, String>,
) -> Result<(Visibility, UploadOptions, Option<uuid::Uuid>), ServiceError> {
    let visibility = match fields.get("visibility") {
        Some(raw) => Visibility::parse(raw)
            .ok_or(ServiceError::BadRequest(format!("Unknown visibility {}", raw)))?,
        None => Visibility::Private,
    };

    let ocr_engine = match fields.get("ocr_engine") {
        Some(raw) => OcrEngine::parse(raw)
            .ok_or(ServiceError::BadRequest(format!("Unknown ocr_engine {}", raw)))?,
        None => OcrEngine::default(),
    };

    let processing_mode = match fields.get("processing_mode") {
        Some(raw) => ProcessingMode::parse(raw).ok_or(ServiceError::BadRequest(format!(
            "Unknown processing_mode {}",
            raw
        )))?,
        None => ProcessingMode::default(),
    };

    let organization_id = match fields.get("organization_id") {
        Some(raw) if !raw.is_empty() => Some(
            raw.parse::<uuid::Uuid>()
                .map_err(|_| ServiceError::BadRequest("Invalid organization_id".to_string()))?,
        ),
        _ => None,
    };

    let tags = fields
        .get("tags")
        .map(|raw| {
            raw.split(',')
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let options = UploadOptions {
        ocr_engine,
        processing_mode,
        category: fields.get("category").cloned().filter(|c| !c.is_empty()),
        tags,
        author: fields.get("author").cloned().filter(|a| !a.is_empty()),
        description: fields
            .get("description")
            .cloned()
            .filter(|d| !d.is_empty()),
    };

    Ok((visibility, options, organization_id))
}

fn effective_owner(
    user: &LoggedUser,
    organization_id: Option<uuid::Uuid>,
) -> Result<LoggedUser, ServiceError> {
    match organization_id {
        None => Ok(user.clone()),
        Some(org_id) => {
            if !user.is_superuser && user.org_id != Some(org_id) {
                return Err(ServiceError::Forbidden);
            }
            let mut owner = user.clone();
            owner.org_id = Some(org_id);
            Ok(owner)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadAcceptedResponse {
    pub version_id: uuid::Uuid,
    pub task_id: uuid::Uuid,
    pub checksum: String,
    pub status: String,
}

/// Upload document
///
/// Accepts a multipart upload, persists the raw bytes, and queues the
/// ingestion task. Processing is asynchronous; poll the progress endpoint.
#[utoipa::path(
    post,
    path = "/upload",
    tag = "Documents",
    responses(
        (status = 202, description = "Upload accepted and queued", body = UploadAcceptedResponse),
        (status = 400, description = "Missing file or invalid form fields", body = ErrorResponseBody),
        (status = 413, description = "File exceeds the size limit", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn upload_document(
    payload: Multipart,
    user: LoggedUser,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let form = read_multipart(payload).await?;
    let (visibility, options, organization_id) = options_from_fields(&form.fields)?;
    let owner = effective_owner(&user, organization_id)?;

    let (filename, bytes) = form
        .files
        .into_iter()
        .next()
        .ok_or(ServiceError::BadRequest("Must include a file".to_string()))?;

    let (version, task) = register_upload(
        &bytes,
        &filename,
        &owner,
        visibility,
        options,
        None,
        pool,
        redis_pool.get_ref(),
    )
    .await?;

    Ok(HttpResponse::Accepted().json(UploadAcceptedResponse {
        version_id: version.id,
        task_id: task.id,
        checksum: version.checksum,
        status: version.status,
    }))
}

/// Upload batch
///
/// Multipart upload of several files at once; each becomes its own queued
/// ingestion task.
#[utoipa::path(
    post,
    path = "/upload_batch",
    tag = "Documents",
    responses(
        (status = 202, description = "Uploads accepted and queued"),
        (status = 400, description = "No files in the request", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn upload_batch(
    payload: Multipart,
    user: LoggedUser,
    pool: web::Data<Pool>,
    redis_pool: web::Data<RedisPool>,
) -> Result<HttpResponse, actix_web::Error> {
    let form = read_multipart(payload).await?;
    let (visibility, options, organization_id) = options_from_fields(&form.fields)?;
    let owner = effective_owner(&user, organization_id)?;

    if form.files.is_empty() {
        return Err(ServiceError::BadRequest("Must include at least one file".to_string()).into());
    }

    let mut accepted = vec![];
    for (filename, bytes) in form.files {
        let result = register_upload(
            &bytes,
            &filename,
            &owner,
            visibility,
            options.clone(),
            None,
            pool.clone(),
            redis_pool.get_ref(),
        )
        .await;

        match result {
            Ok((version, task)) => accepted.push(serde_json::json!({
                "filename": filename,
                "version_id": version.id,
                "task_id": task.id,
                "status": version.status,
            })),
            Err(err) => accepted.push(serde_json::json!({
                "filename": filename,
                "error": err.to_string(),
            })),
        }
    }

    Ok(HttpResponse::Accepted().json(serde_json::json!({ "results": accepted })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListDocumentsParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub organization_id: Option<uuid::Uuid>,
    pub status: Option<String>,
}

/// List documents
///
/// Latest versions visible to the caller, newest first.
#[utoipa::path(
    get,
    path = "/documents",
    tag = "Documents",
    responses(
        (status = 200, description = "Visible documents and total count"),
    ),
)]
pub async fn list_documents(
    params: web::Query<ListDocumentsParams>,
    user: Option<LoggedUser>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(20).clamp(1, 100);
    let organization_id = params.organization_id;
    let status = params.status.clone();

    let (rows, total) = web::block(move || {
        list_visible_documents_query(
            user.as_ref(),
            organization_id,
            status,
            page,
            page_size,
            pool,
        )
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let documents: Vec<DocumentResponse> = rows
        .into_iter()
        .map(|(version, group)| DocumentResponse::from_parts(version, &group))
        .collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "documents": documents,
        "total": total,
    })))
}

fn load_checked(
    version_id: uuid::Uuid,
    user: Option<&LoggedUser>,
    pool: web::Data<Pool>,
) -> Result<(DocumentVersion, DocumentGroup, PermissionRecord), ServiceError> {
    let (version, group) = get_version_with_group_query(version_id, pool)?;
    let record = PermissionRecord::from_version(&group, &version);

    if !can_view(user, &record) {
        // Hide existence from callers without rights.
        return Err(ServiceError::NotFound("Document not found".to_string()));
    }

    Ok((version, group, record))
}

/// Document detail with a presigned link to the original file.
#[utoipa::path(
    get,
    path = "/documents/{version_id}",
    tag = "Documents",
    params(("version_id" = uuid::Uuid, Path, description = "Document version")),
    responses(
        (status = 200, description = "Document detail"),
        (status = 404, description = "Unknown or not visible", body = ErrorResponseBody),
    ),
)]
pub async fn get_document(
    version_id: web::Path<uuid::Uuid>,
    user: Option<LoggedUser>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let version_id = version_id.into_inner();

    let (version, group, _) =
        web::block(move || load_checked(version_id, user.as_ref(), pool))
            .await
            .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let bucket = get_blob_bucket()?;
    let original_file_url = presign_get_url(&bucket, &version.storage_key, PRESIGN_TTL_SECS).await?;

    let mut body = serde_json::to_value(DocumentResponse::from_parts(version, &group))
        .map_err(|_| ServiceError::InternalServerError("Serialization failed".to_string()))?;
    body["original_file_url"] = serde_json::json!(original_file_url);

    Ok(HttpResponse::Ok().json(body))
}

/// Processing progress
#[utoipa::path(
    get,
    path = "/documents/{version_id}/progress",
    tag = "Documents",
    params(("version_id" = uuid::Uuid, Path, description = "Document version")),
    responses(
        (status = 200, description = "Progress snapshot"),
        (status = 404, description = "Unknown or not visible", body = ErrorResponseBody),
    ),
)]
pub async fn get_progress(
    version_id: web::Path<uuid::Uuid>,
    user: Option<LoggedUser>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let version_id = version_id.into_inner();

    let (version, _, _) =
        web::block(move || load_checked(version_id, user.as_ref(), pool))
            .await
            .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": version.status,
        "progress_percentage": version.progress_percent,
        "processed_pages": version.processed_pages,
        "total_pages": version.total_pages,
        "message": version.progress_message,
        "error": version.error_message,
    })))
}

/// Page record with OCR boxes and a presigned page image.
#[utoipa::path(
    get,
    path = "/documents/{version_id}/pages/{page_number}",
    tag = "Documents",
    params(
        ("version_id" = uuid::Uuid, Path, description = "Document version"),
        ("page_number" = i32, Path, description = "1-based page number"),
    ),
    responses(
        (status = 200, description = "Page artifact"),
        (status = 404, description = "Unknown or not visible", body = ErrorResponseBody),
    ),
)]
pub async fn get_page(
    path: web::Path<(uuid::Uuid, i32)>,
    user: Option<LoggedUser>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let (version_id, page_number) = path.into_inner();

    let page = web::block(move || {
        load_checked(version_id, user.as_ref(), pool.clone())?;
        get_page_query(version_id, page_number, pool)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let bucket = get_blob_bucket()?;
    let page_image_url = presign_get_url(&bucket, &page.image_key, PRESIGN_TTL_SECS).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "version_id": page.version_id,
        "page_number": page.page_number,
        "text": page.text,
        "avg_confidence": page.avg_confidence,
        "vlm_failed": page.vlm_failed,
        "bboxes": page.bboxes,
        "page_image_url": page_image_url,
    })))
}

/// Version history of a document group.
#[utoipa::path(
    get,
    path = "/documents/{group_id}/versions",
    tag = "Documents",
    params(("group_id" = uuid::Uuid, Path, description = "Document group")),
    responses(
        (status = 200, description = "All versions, newest first"),
        (status = 404, description = "Unknown or not visible", body = ErrorResponseBody),
    ),
)]
pub async fn list_versions(
    group_id: web::Path<uuid::Uuid>,
    user: Option<LoggedUser>,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let group_id = group_id.into_inner();

    let visible = web::block(move || {
        let group = get_group_by_id_query(group_id, pool.clone())?;
        let versions = list_versions_by_group_query(group_id, pool)?;

        let visible: Vec<DocumentResponse> = versions
            .into_iter()
            .filter(|version| {
                can_view(
                    user.as_ref(),
                    &PermissionRecord::from_version(&group, version),
                )
            })
            .map(|version| DocumentResponse::from_parts(version, &group))
            .collect();

        if visible.is_empty() {
            return Err(ServiceError::NotFound("Document not found".to_string()));
        }

        Ok(visible)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "versions": visible })))
}

/// Restore an older version as latest without reprocessing.
#[utoipa::path(
    post,
    path = "/documents/{group_id}/versions/{version_number}/restore",
    tag = "Documents",
    params(
        ("group_id" = uuid::Uuid, Path, description = "Document group"),
        ("version_number" = i32, Path, description = "Version to promote"),
    ),
    responses(
        (status = 200, description = "Version marked latest"),
        (status = 403, description = "Caller may not modify this document", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn restore_version(
    path: web::Path<(uuid::Uuid, i32)>,
    user: LoggedUser,
    pool: web::Data<Pool>,
) -> Result<HttpResponse, actix_web::Error> {
    let (group_id, version_number) = path.into_inner();

    let version = web::block(move || {
        let group = get_group_by_id_query(group_id, pool.clone())?;
        let versions = list_versions_by_group_query(group_id, pool.clone())?;
        let target = versions
            .iter()
            .find(|version| version.version_number == version_number)
            .ok_or(ServiceError::NotFound("Version not found".to_string()))?;

        if !can_modify(&user, &PermissionRecord::from_version(&group, target)) {
            return Err(ServiceError::Forbidden);
        }

        let version = restore_version_query(group_id, version_number, pool.clone())?;

        create_event_query(
            crate::data::models::Event::from_details(
                "version_restored",
                Some(version.id),
                serde_json::json!({"group_id": group_id, "version_number": version_number}),
            ),
            pool,
        )?;

        Ok::<_, ServiceError>(version)
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "version_id": version.id,
        "version_number": version.version_number,
        "is_latest": true,
    })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteDocumentParams {
    pub hard: Option<bool>,
}

/// Delete version
///
/// Soft delete marks the version superseded; hard delete (superuser only)
/// removes blobs, index chunks, and metadata.
#[utoipa::path(
    delete,
    path = "/documents/{version_id}",
    tag = "Documents",
    params(("version_id" = uuid::Uuid, Path, description = "Document version")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Caller may not delete this document", body = ErrorResponseBody),
        (status = 404, description = "Unknown or not visible", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn delete_document(
    version_id: web::Path<uuid::Uuid>,
    params: web::Query<DeleteDocumentParams>,
    user: LoggedUser,
    pool: web::Data<Pool>,
    reqwest_client: web::Data<reqwest::Client>,
) -> Result<HttpResponse, actix_web::Error> {
    let version_id = version_id.into_inner();
    let hard = params.hard.unwrap_or(false);

    let version = {
        let user = user.clone();
        let pool = pool.clone();
        web::block(move || {
            let (version, _, record) = load_checked(version_id, Some(&user), pool)?;

            if !can_modify(&user, &record) {
                return Err(ServiceError::Forbidden);
            }
            if hard && !user.is_superuser {
                return Err(ServiceError::Forbidden);
            }

            Ok::<_, ServiceError>(version)
        })
        .await
        .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??
    };

    delete_version_query(version_id, hard, reqwest_client.get_ref().clone(), pool.clone()).await?;

    web::block(move || {
        create_event_query(
            crate::data::models::Event::from_details(
                "version_deleted",
                Some(version_id),
                serde_json::json!({"hard": hard, "checksum": version.checksum}),
            ),
            pool,
        )
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdatePermissionsReqPayload {
    pub visibility: String,
    #[serde(default)]
    pub shared_with_users: Vec<uuid::Uuid>,
    #[serde(default)]
    pub shared_with_roles: Vec<String>,
}

/// Update permissions
///
/// Changes visibility and share lists, then selectively re-indexes the
/// permission snapshot on every chunk of the version.
#[utoipa::path(
    put,
    path = "/documents/{version_id}/permissions",
    tag = "Documents",
    request_body(content = UpdatePermissionsReqPayload, content_type = "application/json"),
    params(("version_id" = uuid::Uuid, Path, description = "Document version")),
    responses(
        (status = 200, description = "Updated permission attributes"),
        (status = 403, description = "Caller may not modify this document", body = ErrorResponseBody),
    ),
    security(("bearer" = [])),
)]
pub async fn update_permissions(
    version_id: web::Path<uuid::Uuid>,
    payload: web::Json<UpdatePermissionsReqPayload>,
    user: LoggedUser,
    pool: web::Data<Pool>,
    reqwest_client: web::Data<reqwest::Client>,
) -> Result<HttpResponse, actix_web::Error> {
    let version_id = version_id.into_inner();
    let payload = payload.into_inner();

    let version = {
        let pool = pool.clone();
        web::block(move || {
            let (_, _, record) = load_checked(version_id, Some(&user), pool.clone())?;

            if !can_modify(&user, &record) {
                return Err(ServiceError::Forbidden);
            }

            let visibility = Visibility::parse(&payload.visibility).ok_or(
                ServiceError::BadRequest(format!("Unknown visibility {}", payload.visibility)),
            )?;

            if !payload.shared_with_users.is_empty() {
                let target_orgs: Vec<Option<uuid::Uuid>> =
                    get_user_orgs_query(payload.shared_with_users.clone(), pool.clone())?
                        .into_iter()
                        .map(|(_, org)| org)
                        .collect();

                if !share_targets_allowed(&user, record.org_id, &target_orgs) {
                    return Err(ServiceError::BadRequest(
                        "Shares may only target users of the document's organization".to_string(),
                    ));
                }
            }

            update_version_permissions_query(
                version_id,
                &visibility.to_string(),
                payload.shared_with_users.clone(),
                payload.shared_with_roles.clone(),
                pool,
            )
        })
        .await
        .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??
    };

    let updated_chunks = update_permissions_by_version(
        reqwest_client.get_ref().clone(),
        version_id,
        &version.visibility,
        version
            .shared_user_ids
            .iter()
            .map(|id| id.to_string())
            .collect(),
        version.shared_role_codes.clone(),
    )
    .await?;

    web::block({
        let visibility = version.visibility.clone();
        move || {
            create_event_query(
                crate::data::models::Event::from_details(
                    "permissions_updated",
                    Some(version_id),
                    serde_json::json!({
                        "visibility": visibility,
                        "updated_chunks": updated_chunks,
                    }),
                ),
                pool,
            )
        }
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "version_id": version.id,
        "visibility": version.visibility,
        "shared_with_users": version.shared_user_ids,
        "shared_with_roles": version.shared_role_codes,
        "updated_chunks": updated_chunks,
    })))
}
