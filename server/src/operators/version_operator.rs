use crate::{
    data::models::{DocumentVersion, Pool},
    errors::ServiceError,
    operators::{
        document_operator::{
            count_versions_sharing_checksum_query, delete_version_rows_query,
            get_pages_by_version_query, get_version_by_id_query, list_versions_by_group_query,
        },
        index_operator::delete_chunks_by_version,
        storage_operator::{delete_object, get_blob_bucket, raw_object_key},
    },
};
use actix_web::web;
use diesel::prelude::*;

/// Flips `is_latest` onto the given version in one transaction, clearing it
/// on every sibling. Exactly one latest version per group.
pub fn mark_latest_query(
    group_id: uuid::Uuid,
    version_id: uuid::Uuid,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::update(
            versions_columns::document_versions
                .filter(versions_columns::group_id.eq(group_id))
                .filter(versions_columns::id.ne(version_id)),
        )
        .set(versions_columns::is_latest.eq(false))
        .execute(conn)?;

        diesel::update(
            versions_columns::document_versions.filter(versions_columns::id.eq(version_id)),
        )
        .set((
            versions_columns::is_latest.eq(true),
            versions_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(conn)?;

        Ok(())
    })?;

    Ok(())
}

/// Restore: marks an older version latest without reprocessing. Chunk
/// records stay untouched since per-chunk visibility is unchanged.
pub fn restore_version_query(
    group_id: uuid::Uuid,
    version_number: i32,
    pool: web::Data<Pool>,
) -> Result<DocumentVersion, ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let mut conn = pool.get().map_err(|_| {
        ServiceError::InternalServerError("Could not get database connection".to_string())
    })?;

    let version: Option<DocumentVersion> = versions_columns::document_versions
        .filter(versions_columns::group_id.eq(group_id))
        .filter(versions_columns::version_number.eq(version_number))
        .select(DocumentVersion::as_select())
        .first::<DocumentVersion>(&mut conn)
        .optional()?;

    let version = version.ok_or(ServiceError::NotFound("Version not found".to_string()))?;

    mark_latest_query(group_id, version.id, pool)?;

    Ok(version)
}

/// Soft delete marks a version superseded; hard delete removes blobs, index
/// chunks, and metadata rows, promoting the highest remaining sibling when
/// the latest was removed.
pub async fn delete_version_query(
    version_id: uuid::Uuid,
    hard: bool,
    reqwest_client: reqwest::Client,
    pool: web::Data<Pool>,
) -> Result<(), ServiceError> {
    use crate::data::schema::document_versions::dsl as versions_columns;

    let version = {
        let pool = pool.clone();
        web::block(move || get_version_by_id_query(version_id, pool))
            .await
            .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??
    };

    if !hard {
        let pool = pool.clone();
        web::block(move || {
            let mut conn = pool.get().map_err(|_| {
                ServiceError::InternalServerError("Could not get database connection".to_string())
            })?;

            diesel::update(
                versions_columns::document_versions.filter(versions_columns::id.eq(version_id)),
            )
            .set((
                versions_columns::is_latest.eq(false),
                versions_columns::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;

            Ok::<_, ServiceError>(())
        })
        .await
        .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

        return Ok(());
    }

    delete_chunks_by_version(reqwest_client, version_id).await?;

    let pages = {
        let pool = pool.clone();
        web::block(move || get_pages_by_version_query(version_id, pool))
            .await
            .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??
    };

    let bucket = get_blob_bucket()?;
    for page in pages {
        delete_object(&bucket, &page.image_key).await?;
        if let Some(ocr_key) = page.ocr_json_key {
            delete_object(&bucket, &ocr_key).await?;
        }
    }

    // The raw object is content-addressed; drop it only when no other
    // version still references the same bytes.
    let checksum = version.checksum.clone();
    let other_references = {
        let pool = pool.clone();
        web::block(move || count_versions_sharing_checksum_query(&checksum, version_id, pool))
            .await
            .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??
    };
    if other_references == 0 {
        delete_object(&bucket, &raw_object_key(&version.checksum)).await?;
    }

    let was_latest = version.is_latest;
    let group_id = version.group_id;

    web::block(move || {
        delete_version_rows_query(version_id, pool.clone())?;

        if was_latest {
            let remaining = list_versions_by_group_query(group_id, pool.clone())?;
            if let Some(promoted) = remaining.iter().max_by_key(|v| v.version_number) {
                mark_latest_query(group_id, promoted.id, pool)?;
            }
        }

        Ok::<_, ServiceError>(())
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    Ok(())
}
