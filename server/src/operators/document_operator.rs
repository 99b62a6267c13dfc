use crate::{
    data::models::{
        Chunk, DocumentGroup, DocumentVersion, LoggedUser, Page, Pool, VersionStatus,
    },
    errors::ServiceError,
    operators::permission_operator::{can_view, PermissionRecord},
};
use actix_web::web;
use diesel::prelude::*;
use std::collections::HashMap;

pub fn create_group_query(
    new_group: DocumentGroup,
    pool: web::Data<Pool>,
) -> Result<DocumentGroup, ServiceError> {
    use crate::data::schema::document_groups::dsl as groups_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let group: DocumentGroup = diesel::insert_into(groups_columns::document_groups)
        .values(&new_group)
        .get_result(&mut conn)?;

    Ok(group)
}

pub fn get_group_by_id_query(
    group_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<DocumentGroup, ServiceError> {
    use crate::data::schema::document_groups::dsl as groups_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let group: Option<DocumentGroup> = groups_columns::document_groups
        .filter(groups_columns::id.eq(group_id))
        .select(DocumentGroup::as_select())
        .first::<DocumentGroup>(&mut conn)
        .optional()?;

    group.ok_or(ServiceError::NotFound("Document group not found".to_string()))
}

/// Versioning identity: same filename uploaded by the same owner lands in
/// the same group.
pub fn find_group_for_upload_query(
    canonical_filename: &str,
    owner_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Option<DocumentGroup>, ServiceError> {
    use crate::data::schema::document_groups::dsl as groups_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let group: Option<DocumentGroup> = groups_columns::document_groups
        .filter(groups_columns::canonical_filename.eq(canonical_filename))
        .filter(groups_columns::owner_id.eq(owner_id))
        .select(DocumentGroup::as_select())
        .first::<DocumentGroup>(&mut conn)
        .optional()?;

    Ok(group)
}

pub fn next_version_number_query(
    group_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<i32, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let max_version: Option<i32> = versions_columns::document_versions
        .filter(versions_columns::group_id.eq(group_id))
        .select(diesel::dsl::max(versions_columns::version_number))
        .first(&mut conn)?;

    Ok(max_version.unwrap_or(0) + 1)
}

pub fn create_version_query(
    new_version: DocumentVersion,
    pool: web::Data<Pool>,
) -> Result<DocumentVersion, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let version: DocumentVersion = diesel::insert_into(versions_columns::document_versions)
        .values(&new_version)
        .get_result(&mut conn)?;

    Ok(version)
}

pub fn get_version_by_id_query(
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<DocumentVersion, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let version: Option<DocumentVersion> = versions_columns::document_versions
        .filter(versions_columns::id.eq(version_id))
        .select(DocumentVersion::as_select())
        .first::<DocumentVersion>(&mut conn)
        .optional()?;

    version.ok_or(ServiceError::NotFound("Document version not found".to_string()))
}

pub fn get_version_with_group_query(
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<(DocumentVersion, DocumentGroup), ServiceError> {
    let version = get_version_by_id_query(version_id, pool.clone())?;
    let group = get_group_by_id_query(version.group_id, pool)?;
    Ok((version, group))
}

/// Batched version+group lookup keyed by version id, for callers that
/// authorize whole sets in one round-trip.
pub fn get_versions_with_groups_query(
    version_ids: Vec<uuid::Uuid>,
    pool: web::Data<Pool>,
) -> Result<HashMap<uuid::Uuid, (DocumentVersion, DocumentGroup)>, ServiceError> {
    use crate::data::schema::document_groups::dsl as groups_columns;
    use crate::data::schema::document_versions::dsl as versions_columns;

    if version_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let rows: Vec<(DocumentVersion, DocumentGroup)> = versions_columns::document_versions
        .inner_join(groups_columns::document_groups)
        .filter(versions_columns::id.eq_any(version_ids))
        .select((DocumentVersion::as_select(), DocumentGroup::as_select()))
        .load(&mut conn)?;

    Ok(rows
        .into_iter()
        .map(|(version, group)| (version.id, (version, group)))
        .collect())
}

pub fn list_versions_by_group_query(
    group_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Vec<DocumentVersion>, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let versions: Vec<DocumentVersion> = versions_columns::document_versions
        .filter(versions_columns::group_id.eq(group_id))
        .order(versions_columns::version_number.desc())
        .select(DocumentVersion::as_select())
        .load(&mut conn)?;

    Ok(versions)
}

/// Upload dedup: a completed version with identical bytes by the same owner
/// lets the pipeline short-circuit straight to indexing.
pub fn find_completed_version_by_checksum_query(
    checksum: &str,
    uploaded_by: uuid::Uuid,
    exclude_version: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Option<DocumentVersion>, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let version: Option<DocumentVersion> = versions_columns::document_versions
        .filter(versions_columns::checksum.eq(checksum))
        .filter(versions_columns::uploaded_by.eq(uploaded_by))
        .filter(versions_columns::status.eq(VersionStatus::Completed.to_string()))
        .filter(versions_columns::id.ne(exclude_version))
        .order(versions_columns::updated_at.desc())
        .select(DocumentVersion::as_select())
        .first::<DocumentVersion>(&mut conn)
        .optional()?;

    Ok(version)
}

/// Latest versions visible to the caller. The permission predicate is
/// evaluated in-process so it is byte-for-byte the one the index filter
/// mirrors.
pub fn list_visible_documents_query(
    user: Option<&LoggedUser>,
    organization_id: Option<uuid::Uuid>,
    status: Option<String>,
    page: i64,
    page_size: i64,
    pool: web::Data<Pool>,
) -> Result<(Vec<(DocumentVersion, DocumentGroup)>, i64), ServiceError> {
    use crate::data::schema::document_groups::dsl as groups_columns;
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let mut query = versions_columns::document_versions
        .inner_join(groups_columns::document_groups)
        .filter(versions_columns::is_latest.eq(true))
        .select((DocumentVersion::as_select(), DocumentGroup::as_select()))
        .order(versions_columns::updated_at.desc())
        .into_boxed();

    if let Some(org_id) = organization_id {
        query = query.filter(groups_columns::org_id.eq(org_id));
    }
    if let Some(status) = status {
        query = query.filter(versions_columns::status.eq(status));
    }

    let rows: Vec<(DocumentVersion, DocumentGroup)> = query.load(&mut conn)?;

    let visible: Vec<(DocumentVersion, DocumentGroup)> = rows
        .into_iter()
        .filter(|(version, group)| {
            can_view(user, &PermissionRecord::from_version(group, version))
        })
        .collect();

    let total = visible.len() as i64;
    let offset = ((page.max(1) - 1) * page_size) as usize;
    let paged = visible
        .into_iter()
        .skip(offset)
        .take(page_size.max(0) as usize)
        .collect();

    Ok((paged, total))
}

pub fn upsert_page_query(new_page: Page, pool: web::Data<Pool>) -> Result<Page, ServiceError> {
    use crate::data::schema::pages::dsl as pages_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let page: Page = diesel::insert_into(pages_columns::pages)
        .values(&new_page)
        .on_conflict((pages_columns::version_id, pages_columns::page_number))
        .do_update()
        .set(pages_columns::image_key.eq(&new_page.image_key))
        .get_result(&mut conn)?;

    Ok(page)
}

pub fn get_pages_by_version_query(
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Vec<Page>, ServiceError> {
    use crate::data::schema::pages::dsl as pages_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let pages: Vec<Page> = pages_columns::pages
        .filter(pages_columns::version_id.eq(version_id))
        .order(pages_columns::page_number.asc())
        .select(Page::as_select())
        .load(&mut conn)?;

    Ok(pages)
}

pub fn get_page_query(
    version_id: uuid::Uuid,
    page_number: i32,
    pool: web::Data<Pool>,
) -> Result<Page, ServiceError> {
    use crate::data::schema::pages::dsl as pages_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let page: Option<Page> = pages_columns::pages
        .filter(pages_columns::version_id.eq(version_id))
        .filter(pages_columns::page_number.eq(page_number))
        .select(Page::as_select())
        .first::<Page>(&mut conn)
        .optional()?;

    page.ok_or(ServiceError::NotFound("Page not found".to_string()))
}

#[allow(clippy::too_many_arguments)]
pub fn update_page_ocr_query(
    page_id: uuid::Uuid,
    text: &str,
    avg_confidence: f64,
    bboxes: serde_json::Value,
    ocr_json_key: &str,
    vlm_failed: bool,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::pages::dsl as pages_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(pages_columns::pages.filter(pages_columns::id.eq(page_id)))
        .set((
            pages_columns::text.eq(text),
            pages_columns::avg_confidence.eq(avg_confidence),
            pages_columns::bboxes.eq(bboxes),
            pages_columns::ocr_json_key.eq(ocr_json_key),
            pages_columns::vlm_failed.eq(vlm_failed),
        ))
        .execute(&mut conn)?;

    Ok(())
}

pub fn set_version_total_pages_query(
    version_id: uuid::Uuid,
    total_pages: i32,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(versions_columns::document_versions.filter(versions_columns::id.eq(version_id)))
        .set((
            versions_columns::total_pages.eq(total_pages),
            versions_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    Ok(())
}

/// Progress writes are serialized per version and monotone: `GREATEST`
/// keeps a late-arriving lower value from moving the bar backwards.
pub fn update_version_progress_query(
    version_id: uuid::Uuid,
    progress_percent: i32,
    message: &str,
    processed_pages: Option<i32>,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;
    use diesel::dsl::sql;
    use diesel::sql_types::Integer;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let clamped = progress_percent.clamp(0, 100);

    diesel::update(versions_columns::document_versions.filter(versions_columns::id.eq(version_id)))
        .set((
            versions_columns::progress_percent
                .eq(sql::<Integer>(&format!("GREATEST(progress_percent, {})", clamped))),
            versions_columns::progress_message.eq(message),
            versions_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    if let Some(processed) = processed_pages {
        diesel::update(
            versions_columns::document_versions.filter(versions_columns::id.eq(version_id)),
        )
        .set(
            versions_columns::processed_pages
                .eq(sql::<Integer>(&format!("GREATEST(processed_pages, {})", processed))),
        )
        .execute(&mut conn)?;
    }

    Ok(())
}

pub fn set_version_status_query(
    version_id: uuid::Uuid,
    status: VersionStatus,
    error_message: Option<String>,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(versions_columns::document_versions.filter(versions_columns::id.eq(version_id)))
        .set((
            versions_columns::status.eq(status.to_string()),
            versions_columns::error_message.eq(error_message),
            versions_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    Ok(())
}

pub fn update_version_permissions_query(
    version_id: uuid::Uuid,
    visibility: &str,
    shared_user_ids: Vec<uuid::Uuid>,
    shared_role_codes: Vec<String>,
    pool: web::Data<Pool>,
) -> Result<DocumentVersion, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let version: DocumentVersion = diesel::update(
        versions_columns::document_versions.filter(versions_columns::id.eq(version_id)),
    )
    .set((
        versions_columns::visibility.eq(visibility),
        versions_columns::shared_user_ids.eq(shared_user_ids),
        versions_columns::shared_role_codes.eq(shared_role_codes),
        versions_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
    ))
    .get_result(&mut conn)?;

    Ok(version)
}

pub fn insert_chunks_query(
    new_chunks: Vec<Chunk>,
    pool: web::Data<Pool>,
) -> Result<usize, ServiceError> {
    use crate::data::schema::chunks::dsl as chunks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    // Deterministic ids make re-runs after a crash no-ops.
    let inserted = diesel::insert_into(chunks_columns::chunks)
        .values(&new_chunks)
        .on_conflict(chunks_columns::id)
        .do_nothing()
        .execute(&mut conn)?;

    Ok(inserted)
}

pub fn get_chunks_by_version_query(
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Vec<Chunk>, ServiceError> {
    use crate::data::schema::chunks::dsl as chunks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let rows: Vec<Chunk> = chunks_columns::chunks
        .filter(chunks_columns::version_id.eq(version_id))
        .order((
            chunks_columns::page_number.asc(),
            chunks_columns::local_index.asc(),
        ))
        .select(Chunk::as_select())
        .load(&mut conn)?;

    Ok(rows)
}

/// Stage-5 resume set: chunks whose vector was never written.
pub fn get_chunks_missing_embedding_query(
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<Vec<Chunk>, ServiceError> {
    use crate::data::schema::chunks::dsl as chunks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let rows: Vec<Chunk> = chunks_columns::chunks
        .filter(chunks_columns::version_id.eq(version_id))
        .filter(chunks_columns::embedding.is_null())
        .order((
            chunks_columns::page_number.asc(),
            chunks_columns::local_index.asc(),
        ))
        .select(Chunk::as_select())
        .load(&mut conn)?;

    Ok(rows)
}

pub fn set_chunk_embedding_query(
    chunk_id: &str,
    embedding: Vec<f32>,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::chunks::dsl as chunks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(chunks_columns::chunks.filter(chunks_columns::id.eq(chunk_id)))
        .set(chunks_columns::embedding.eq(Some(embedding)))
        .execute(&mut conn)?;

    Ok(())
}

pub fn mark_chunks_indexed_query(
    chunk_ids: Vec<String>,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::chunks::dsl as chunks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    diesel::update(chunks_columns::chunks.filter(chunks_columns::id.eq_any(chunk_ids)))
        .set(chunks_columns::indexed_at.eq(chrono::Utc::now().naive_utc()))
        .execute(&mut conn)?;

    Ok(())
}

/// Copy-on-link for duplicate uploads: page records and embedded chunks of
/// the source version are re-keyed onto the new version. Blob keys are kept
/// as-is so both versions reference one stored object set.
pub fn copy_pages_and_chunks_query(
    source_version_id: uuid::Uuid,
    target_version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<(usize, usize), ServiceError> {
    use crate::data::schema::chunks::dsl as chunks_columns;
    use crate::data::schema::pages::dsl as pages_columns;

    let source_pages = get_pages_by_version_query(source_version_id, pool.clone())?;
    let source_chunks = get_chunks_by_version_query(source_version_id, pool.clone())?;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let new_pages: Vec<Page> = source_pages
        .into_iter()
        .map(|page| Page {
            id: uuid::Uuid::new_v4(),
            version_id: target_version_id,
            created_at: chrono::Utc::now().naive_utc(),
            ..page
        })
        .collect();

    let new_chunks: Vec<Chunk> = source_chunks
        .into_iter()
        .map(|chunk| Chunk {
            id: Chunk::deterministic_id(target_version_id, chunk.page_number, chunk.local_index),
            version_id: target_version_id,
            indexed_at: None,
            created_at: chrono::Utc::now().naive_utc(),
            ..chunk
        })
        .collect();

    let pages_inserted = diesel::insert_into(pages_columns::pages)
        .values(&new_pages)
        .on_conflict((pages_columns::version_id, pages_columns::page_number))
        .do_nothing()
        .execute(&mut conn)?;

    let chunks_inserted = diesel::insert_into(chunks_columns::chunks)
        .values(&new_chunks)
        .on_conflict(chunks_columns::id)
        .do_nothing()
        .execute(&mut conn)?;

    Ok((pages_inserted, chunks_inserted))
}

pub fn delete_version_rows_query(
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::chunks::dsl as chunks_columns;
    use crate::data::schema::document_versions::dsl as versions_columns;
    use crate::data::schema::pages::dsl as pages_columns;
    use crate::data::schema::tasks::dsl as tasks_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::delete(chunks_columns::chunks.filter(chunks_columns::version_id.eq(version_id)))
            .execute(conn)?;
        diesel::delete(pages_columns::pages.filter(pages_columns::version_id.eq(version_id)))
            .execute(conn)?;
        diesel::delete(tasks_columns::tasks.filter(tasks_columns::version_id.eq(version_id)))
            .execute(conn)?;
        diesel::delete(
            versions_columns::document_versions.filter(versions_columns::id.eq(version_id)),
        )
        .execute(conn)?;
        Ok(())
    })?;

    Ok(())
}

pub fn count_versions_sharing_checksum_query(
    checksum: &str,
    exclude_version: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<i64, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let count: i64 = versions_columns::document_versions
        .filter(versions_columns::checksum.eq(checksum))
        .filter(versions_columns::id.ne(exclude_version))
        .count()
        .get_result(&mut conn)?;

    Ok(count)
}
