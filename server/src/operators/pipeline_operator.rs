use crate::{
    data::models::{
        Chunk, DocumentGroup, DocumentVersion, IngestMessage, LoggedUser, Page, Pool,
        ProcessingMode, ProcessingStage, RedisPool, Task, TaskKind, TaskState, UploadOptions,
        VersionStatus, Visibility,
    },
    errors::{PipelineError, ServiceError},
    operators::{
        document_operator::{
            copy_pages_and_chunks_query, create_group_query, create_version_query,
            find_completed_version_by_checksum_query, find_group_for_upload_query,
            get_chunks_by_version_query, get_chunks_missing_embedding_query,
            get_pages_by_version_query, get_version_with_group_query, insert_chunks_query,
            mark_chunks_indexed_query, next_version_number_query, set_chunk_embedding_query,
            set_version_status_query, set_version_total_pages_query, update_page_ocr_query,
            update_version_progress_query, upsert_page_query,
        },
        event_operator::create_event_query,
        index_operator::{bulk_index_chunks, ChunkDocument, ChunkDocumentMetadata},
        model_operator::{self, EMBED_BATCH_SIZE, VLM_CORRECTION_PROMPT},
        ocr_operator::{
            average_confidence, joined_text, layout_sort, reocr_low_confidence_regions, run_ocr,
        },
        parse_operator::chunk_page_text,
        render_operator::{
            detect_variant, list_archive_entries, render_pages, FileVariant,
        },
        storage_operator::{
            get_blob_bucket, get_object_retrying, page_image_key, page_ocr_key,
            public_object_url, put_object_retrying, raw_object_key,
        },
        task_operator::{
            checkpoint_task_query, child_tasks_query, control_flags_query, create_task_query,
            enqueue_ingest_message, finish_task_query, park_task_query,
        },
        version_operator::mark_latest_query,
    },
};
use actix_web::web;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

const INDEX_BATCH_SIZE: usize = 100;

// Progress landmarks for the stage graph; page work fills 20..70.
const PROGRESS_ADMIT: i32 = 5;
const PROGRESS_RENDER: i32 = 20;
const PROGRESS_OCR_SPAN: i32 = 50;
const PROGRESS_CHUNK: i32 = 75;
const PROGRESS_EMBED_END: i32 = 90;
const PROGRESS_INDEX: i32 = 95;

/// Process-level shared state handed to every stage: pools, clients, and
/// the two worker-pool semaphores plus the cross-tenant admit gate.
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: web::Data<Pool>,
    pub redis_pool: RedisPool,
    pub reqwest_client: reqwest::Client,
    pub cpu_pool: Arc<Semaphore>,
    pub model_pool: Arc<Semaphore>,
    pub admit_gate: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Paused,
    AwaitingChildren,
}

pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Persists a new upload end to end: raw blob, group, version row, task row,
/// and the queue wake-up. Shared by the upload handler and archive
/// expansion.
#[allow(clippy::too_many_arguments)]
pub async fn register_upload(
    bytes: &[u8],
    filename: &str,
    owner: &LoggedUser,
    visibility: Visibility,
    options: UploadOptions,
    parent_task_id: Option<uuid::Uuid>,
    pool: web::Data<Pool>,
    redis_pool: &RedisPool,
) -> Result<(DocumentVersion, Task), ServiceError> {
    let variant = detect_variant(filename).ok_or(ServiceError::BadRequest(format!(
        "Unsupported file type: {}",
        filename
    )))?;

    if bytes.is_empty() {
        return Err(ServiceError::BadRequest("Uploaded file is empty".to_string()));
    }

    let checksum = compute_checksum(bytes);
    let storage_key = raw_object_key(&checksum);

    let bucket = get_blob_bucket()?;
    put_object_retrying(&bucket, &storage_key, bytes, "application/octet-stream").await?;

    let owner_id = owner.id;
    let owner_org = owner.org_id;
    let filename = filename.to_string();
    let file_size = bytes.len() as i64;
    let block_pool = pool.clone();

    let (version, task) = web::block(move || {
        let group = match find_group_for_upload_query(&filename, owner_id, block_pool.clone())? {
            Some(group) => group,
            None => create_group_query(
                DocumentGroup::from_details(filename.as_str(), owner_id, owner_org),
                block_pool.clone(),
            )?,
        };

        let version_number = next_version_number_query(group.id, block_pool.clone())?;
        let version = create_version_query(
            DocumentVersion::from_details(
                group.id,
                version_number,
                checksum,
                variant.as_str().to_string(),
                file_size,
                storage_key,
                visibility,
                owner_id,
                options,
            ),
            block_pool.clone(),
        )?;

        let task = create_task_query(
            Task::from_details(TaskKind::IngestDocument, version.id, parent_task_id),
            block_pool,
        )?;

        Ok::<_, ServiceError>((version, task))
    })
    .await
    .map_err(|_| ServiceError::InternalServerError("Blocking error".to_string()))??;

    let mut redis_conn = redis_pool
        .get()
        .await
        .map_err(|err| ServiceError::ServiceUnavailable(err.to_string()))?;
    enqueue_ingest_message(&IngestMessage::new(task.id, version.id), &mut redis_conn).await?;

    Ok((version, task))
}

/// Blob-store failures past the retry budget stall the task instead of
/// burning an attempt; everything else follows the normal policy.
fn storage_stall(err: ServiceError) -> PipelineError {
    match err {
        ServiceError::ServiceUnavailable(message) => PipelineError::Stalled(message),
        other => PipelineError::from(other),
    }
}

fn check_cancel(task_id: uuid::Uuid, pool: &web::Data<Pool>) -> Result<(), PipelineError> {
    let flags = control_flags_query(task_id, pool.clone()).map_err(PipelineError::from)?;
    if flags.cancel_requested {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

fn progress(
    ctx: &PipelineContext,
    version_id: uuid::Uuid,
    percent: i32,
    message: &str,
    processed_pages: Option<i32>,
) -> Result<(), PipelineError> {
    update_version_progress_query(version_id, percent, message, processed_pages, ctx.pool.clone())
        .map_err(PipelineError::from)
}

/// Drives one claimed task from its durable cursor to the next terminal or
/// parked state. Every stage is idempotent by `(version, stage, cursor)`.
pub async fn run_pipeline(ctx: &PipelineContext, task: Task) -> Result<PipelineOutcome, PipelineError> {
    // The admit gate bounds the memory footprint of in-flight jobs across
    // all tenants for the full run of the task.
    let _admit_permit = ctx
        .admit_gate
        .acquire()
        .await
        .map_err(|_| PipelineError::Transient("admit gate closed".to_string()))?;

    let (initial_version, _) = get_version_with_group_query(task.version_id, ctx.pool.clone())
        .map_err(PipelineError::from)?;
    if initial_version.status_enum() == VersionStatus::Queued {
        set_version_status_query(
            initial_version.id,
            VersionStatus::Processing,
            None,
            ctx.pool.clone(),
        )
        .map_err(PipelineError::from)?;
    }

    let mut stage = task.stage();

    loop {
        check_cancel(task.id, &ctx.pool)?;

        let flags = control_flags_query(task.id, ctx.pool.clone()).map_err(PipelineError::from)?;
        if flags.pause_requested {
            park_task_query(task.id, TaskState::Paused, ctx.pool.clone())
                .map_err(PipelineError::from)?;
            log::info!("task {} paused at stage {}", task.id, stage);
            return Ok(PipelineOutcome::Paused);
        }

        // Earlier stages mutate the version row (total pages, progress);
        // every stage works on a fresh snapshot.
        let (version, group) = get_version_with_group_query(task.version_id, ctx.pool.clone())
            .map_err(PipelineError::from)?;

        let next = match stage {
            ProcessingStage::Admit => admit_stage(ctx, &task, &version).await?,
            ProcessingStage::Render => render_stage(ctx, &task, &version).await?,
            ProcessingStage::OcrPages => ocr_stage(ctx, &task, &version).await?,
            ProcessingStage::Chunk => chunk_stage(ctx, &version).await?,
            ProcessingStage::Embed => embed_stage(ctx, &task, &version).await?,
            ProcessingStage::Index => index_stage(ctx, &task, &version, &group).await?,
            ProcessingStage::Finalize => {
                finalize_stage(ctx, &task, &version, &group).await?;
                return Ok(PipelineOutcome::Completed);
            }
            ProcessingStage::AwaitChildren => {
                return await_children_stage(ctx, &task, &version).await;
            }
        };

        checkpoint_task_query(task.id, next, 0, ctx.pool.clone()).map_err(PipelineError::from)?;
        stage = next;
    }
}

/// Stage 1: verify bytes against the recorded checksum, expand archives,
/// and short-circuit duplicate content.
async fn admit_stage(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
) -> Result<ProcessingStage, PipelineError> {
    progress(ctx, version.id, PROGRESS_ADMIT, "Verifying upload", None)?;

    let bucket = get_blob_bucket().map_err(PipelineError::from)?;
    let bytes = get_object_retrying(&bucket, &version.storage_key)
        .await
        .map_err(storage_stall)?;

    if compute_checksum(&bytes) != version.checksum {
        return Err(PipelineError::PermanentInput(
            "stored bytes do not match the recorded checksum".to_string(),
        ));
    }

    let variant = FileVariant::from_file_type(&version.file_type).ok_or(
        PipelineError::PermanentInput(format!("unsupported file type {}", version.file_type)),
    )?;

    if variant == FileVariant::Archive {
        expand_archive(ctx, task, version, &bytes).await?;
        return Ok(ProcessingStage::AwaitChildren);
    }

    if let Some(existing) = find_completed_version_by_checksum_query(
        &version.checksum,
        version.uploaded_by,
        version.id,
        ctx.pool.clone(),
    )
    .map_err(PipelineError::from)?
    {
        log::info!(
            "version {} reuses content of completed version {}",
            version.id,
            existing.id
        );
        copy_pages_and_chunks_query(existing.id, version.id, ctx.pool.clone())
            .map_err(PipelineError::from)?;
        set_version_total_pages_query(version.id, existing.total_pages, ctx.pool.clone())
            .map_err(PipelineError::from)?;
        progress(
            ctx,
            version.id,
            PROGRESS_CHUNK,
            "Linked identical already-processed content",
            Some(existing.total_pages),
        )?;
        return Ok(ProcessingStage::Index);
    }

    Ok(ProcessingStage::Render)
}

/// Archive expansion: every supported member becomes a dependent child
/// upload linked back to this task.
async fn expand_archive(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
    bytes: &[u8],
) -> Result<(), PipelineError> {
    let entries = list_archive_entries(bytes)?;
    let entry_count = entries.len();

    let (_, group) =
        get_version_with_group_query(version.id, ctx.pool.clone()).map_err(PipelineError::from)?;

    let owner = LoggedUser {
        id: group.owner_id,
        username: String::new(),
        email: String::new(),
        org_id: group.org_id,
        is_superuser: false,
        roles: vec![],
    };

    let visibility = Visibility::parse(&version.visibility).unwrap_or(Visibility::Private);
    for (name, data) in entries {
        let options = UploadOptions {
            ocr_engine: crate::data::models::OcrEngine::parse(&version.ocr_engine)
                .unwrap_or_default(),
            processing_mode: ProcessingMode::parse(&version.processing_mode).unwrap_or_default(),
            category: version.category.clone(),
            tags: version.tags.clone(),
            author: version.author.clone(),
            description: version.description.clone(),
        };

        register_upload(
            &data,
            &name,
            &owner,
            visibility,
            options,
            Some(task.id),
            ctx.pool.clone(),
            &ctx.redis_pool,
        )
        .await
        .map_err(PipelineError::from)?;
    }

    progress(
        ctx,
        version.id,
        PROGRESS_ADMIT,
        &format!("Expanded archive into {} documents", entry_count),
        None,
    )?;

    Ok(())
}

/// Stage 2: raster page images, persist them, record native text.
async fn render_stage(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
) -> Result<ProcessingStage, PipelineError> {
    progress(ctx, version.id, PROGRESS_ADMIT, "Rendering pages", None)?;
    check_cancel(task.id, &ctx.pool)?;

    let variant = FileVariant::from_file_type(&version.file_type).ok_or(
        PipelineError::PermanentInput(format!("unsupported file type {}", version.file_type)),
    )?;

    let bucket = get_blob_bucket().map_err(PipelineError::from)?;
    let bytes = get_object_retrying(&bucket, &version.storage_key)
        .await
        .map_err(storage_stall)?;

    let _cpu_permit = ctx
        .cpu_pool
        .acquire()
        .await
        .map_err(|_| PipelineError::Transient("cpu pool closed".to_string()))?;
    let rendered = render_pages(bytes, variant, &ctx.reqwest_client).await?;
    drop(_cpu_permit);

    let total_pages = rendered.len() as i32;
    for page in rendered {
        let image_key = page_image_key(version.id, page.page_number);
        put_object_retrying(&bucket, &image_key, &page.image_png, "image/png")
            .await
            .map_err(storage_stall)?;

        let mut row = Page::from_details(version.id, page.page_number, image_key);
        if let Some(native_text) = page.native_text {
            row.text = native_text;
        }
        upsert_page_query(row, ctx.pool.clone()).map_err(PipelineError::from)?;
    }

    set_version_total_pages_query(version.id, total_pages, ctx.pool.clone())
        .map_err(PipelineError::from)?;
    progress(
        ctx,
        version.id,
        PROGRESS_RENDER,
        &format!("Rendered {} pages", total_pages),
        None,
    )?;

    Ok(ProcessingStage::OcrPages)
}

struct PageOcrResult {
    page_id: uuid::Uuid,
    text: String,
    avg_confidence: f64,
    bboxes: serde_json::Value,
    ocr_json_key: String,
    vlm_failed: bool,
}

async fn process_one_page(
    ctx: &PipelineContext,
    version: &DocumentVersion,
    page: &Page,
) -> Result<PageOcrResult, PipelineError> {
    let engine = crate::data::models::OcrEngine::parse(&version.ocr_engine).unwrap_or_default();
    let mode = ProcessingMode::parse(&version.processing_mode).unwrap_or_default();
    let native_text = (!page.text.trim().is_empty()).then(|| page.text.clone());

    let bucket = get_blob_bucket().map_err(PipelineError::from)?;
    let image_png = {
        let _cpu_permit = ctx
            .cpu_pool
            .acquire()
            .await
            .map_err(|_| PipelineError::Transient("cpu pool closed".to_string()))?;
        get_object_retrying(&bucket, &page.image_key)
            .await
            .map_err(storage_stall)?
    };

    let mut boxes = {
        let _cpu_permit = ctx
            .cpu_pool
            .acquire()
            .await
            .map_err(|_| PipelineError::Transient("cpu pool closed".to_string()))?;

        match mode {
            ProcessingMode::Fast => run_ocr(&image_png, engine, &ctx.reqwest_client).await?,
            ProcessingMode::Deep => {
                // First pass at half resolution, then a sharper re-pass over
                // regions the engine was unsure about.
                let low_res = downsample_png(&image_png)?;
                let mut low_boxes = run_ocr(&low_res, engine, &ctx.reqwest_client).await?;
                for bbox in low_boxes.iter_mut() {
                    for coord in bbox.bbox.iter_mut() {
                        *coord *= 2.0;
                    }
                }
                reocr_low_confidence_regions(
                    &image_png,
                    low_boxes,
                    1.0,
                    engine,
                    &ctx.reqwest_client,
                )
                .await?
            }
        }
    };

    layout_sort(&mut boxes);
    let avg_confidence = average_confidence(&boxes);
    let ocr_text = joined_text(&boxes);

    let mut vlm_failed = false;
    let corrected_text = if native_text.is_none() && !ocr_text.is_empty() {
        let _model_permit = ctx
            .model_pool
            .acquire()
            .await
            .map_err(|_| PipelineError::Transient("model pool closed".to_string()))?;

        let prompt = format!("{}\n\nOCR text:\n{}", VLM_CORRECTION_PROMPT, ocr_text);
        match model_operator::vlm_extract(&image_png, &prompt, &ctx.reqwest_client).await {
            Ok(extraction) => extraction.corrected_text,
            Err(err) => {
                log::warn!(
                    "vlm correction failed for page {} of {}: {}",
                    page.page_number,
                    version.id,
                    err
                );
                vlm_failed = true;
                ocr_text.clone()
            }
        }
    } else {
        ocr_text.clone()
    };

    // A native text layer always wins for correctness; OCR output still
    // provides the highlight rectangles.
    let final_text = native_text.unwrap_or(corrected_text);

    let bboxes_json = serde_json::to_value(&boxes)
        .map_err(|err| PipelineError::Invariant(format!("unserializable boxes: {}", err)))?;

    let ocr_json_key = page_ocr_key(version.id, page.page_number);
    put_object_retrying(
        &bucket,
        &ocr_json_key,
        bboxes_json.to_string().as_bytes(),
        "application/json",
    )
    .await
    .map_err(storage_stall)?;

    Ok(PageOcrResult {
        page_id: page.id,
        text: final_text,
        avg_confidence,
        bboxes: bboxes_json,
        ocr_json_key,
        vlm_failed,
    })
}

fn downsample_png(image_png: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let img = image::load_from_memory(image_png)
        .map_err(|err| PipelineError::PermanentInput(format!("unreadable page image: {}", err)))?;
    let resized = img.resize(
        (img.width() / 2).max(1),
        (img.height() / 2).max(1),
        image::imageops::FilterType::Triangle,
    );

    let mut buffer = Vec::new();
    resized
        .write_to(
            &mut std::io::Cursor::new(&mut buffer),
            image::ImageFormat::Png,
        )
        .map_err(|err| PipelineError::Transient(format!("failed to encode image: {}", err)))?;
    Ok(buffer)
}

/// Stage 3: per-page OCR with bounded parallelism, VLM correction, and
/// incremental progress. Pages that already carry an ocr artifact are
/// skipped, which is what makes a restart resume mid-stage.
async fn ocr_stage(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
) -> Result<ProcessingStage, PipelineError> {
    let all_pages = get_pages_by_version_query(version.id, ctx.pool.clone())
        .map_err(PipelineError::from)?;
    let total = all_pages.len() as i32;

    if total == 0 {
        return Err(PipelineError::PermanentInput("empty document".to_string()));
    }

    let variant = FileVariant::from_file_type(&version.file_type);
    let done_counter = Arc::new(AtomicI32::new(
        all_pages.iter().filter(|p| p.ocr_json_key.is_some()).count() as i32,
    ));

    let pending: Vec<Page> = all_pages
        .into_iter()
        .filter(|page| page.ocr_json_key.is_none())
        .collect();

    // Plain-text uploads have no visual layer to OCR; their pages already
    // carry native text.
    if variant == Some(FileVariant::Text) {
        for page in pending {
            let ocr_json_key = page_ocr_key(version.id, page.page_number);
            let bucket = get_blob_bucket().map_err(PipelineError::from)?;
            put_object_retrying(&bucket, &ocr_json_key, b"[]", "application/json")
                .await
                .map_err(storage_stall)?;
            update_page_ocr_query(
                page.id,
                &page.text,
                0.0,
                serde_json::Value::Array(vec![]),
                &ocr_json_key,
                false,
                ctx.pool.clone(),
            )
            .map_err(PipelineError::from)?;
        }
        progress(ctx, version.id, PROGRESS_RENDER + PROGRESS_OCR_SPAN, "Text captured", Some(total))?;
        return Ok(ProcessingStage::Chunk);
    }

    let parallelism = ctx.cpu_pool.available_permits().max(1);

    let results: Vec<Result<(), PipelineError>> = stream::iter(pending)
        .map(|page| {
            let ctx = ctx.clone();
            let version = version.clone();
            let done_counter = done_counter.clone();
            let task_id = task.id;
            async move {
                check_cancel(task_id, &ctx.pool)?;

                let result = process_one_page(&ctx, &version, &page).await?;
                update_page_ocr_query(
                    result.page_id,
                    &result.text,
                    result.avg_confidence,
                    result.bboxes,
                    &result.ocr_json_key,
                    result.vlm_failed,
                    ctx.pool.clone(),
                )
                .map_err(PipelineError::from)?;

                let done = done_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let percent =
                    PROGRESS_RENDER + (PROGRESS_OCR_SPAN * done) / total.max(1);
                progress(
                    &ctx,
                    version.id,
                    percent,
                    &format!("Recognized page {} of {}", done, total),
                    Some(done),
                )?;

                Ok(())
            }
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;

    for result in results {
        result?;
    }

    Ok(ProcessingStage::Chunk)
}

/// Stage 4: chunk page text. Empty pages keep their record and produce no
/// chunks.
async fn chunk_stage(
    ctx: &PipelineContext,
    version: &DocumentVersion,
) -> Result<ProcessingStage, PipelineError> {
    let pages = get_pages_by_version_query(version.id, ctx.pool.clone())
        .map_err(PipelineError::from)?;

    let mut new_chunks = vec![];
    for page in pages {
        for (local_index, content) in chunk_page_text(&page.text).into_iter().enumerate() {
            new_chunks.push(Chunk::from_details(
                version.id,
                page.page_number,
                local_index as i32,
                content,
            ));
        }
    }

    let inserted = insert_chunks_query(new_chunks, ctx.pool.clone())
        .map_err(PipelineError::from)?;
    progress(
        ctx,
        version.id,
        PROGRESS_CHUNK,
        &format!("Prepared {} chunks", inserted),
        None,
    )?;

    Ok(ProcessingStage::Embed)
}

/// Stage 5: embed chunk batches. The resume predicate is the absence of a
/// vector, so a killed worker re-embeds only what never landed.
async fn embed_stage(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
) -> Result<ProcessingStage, PipelineError> {
    let pending = get_chunks_missing_embedding_query(version.id, ctx.pool.clone())
        .map_err(PipelineError::from)?;
    let total_batches = pending.len().div_ceil(EMBED_BATCH_SIZE).max(1);

    for (batch_index, batch) in pending.chunks(EMBED_BATCH_SIZE).enumerate() {
        check_cancel(task.id, &ctx.pool)?;

        let texts: Vec<String> = batch.iter().map(|chunk| chunk.content.clone()).collect();

        let vectors = {
            let _model_permit = ctx
                .model_pool
                .acquire()
                .await
                .map_err(|_| PipelineError::Transient("model pool closed".to_string()))?;
            model_operator::embed_batch(texts, &ctx.reqwest_client).await?
        };

        for (chunk, vector) in batch.iter().zip(vectors) {
            set_chunk_embedding_query(&chunk.id, vector, ctx.pool.clone())
                .map_err(PipelineError::from)?;
        }

        checkpoint_task_query(
            task.id,
            ProcessingStage::Embed,
            batch_index as i32 + 1,
            ctx.pool.clone(),
        )
        .map_err(PipelineError::from)?;

        let percent = PROGRESS_CHUNK
            + ((PROGRESS_EMBED_END - PROGRESS_CHUNK) * (batch_index as i32 + 1))
                / total_batches as i32;
        progress(
            ctx,
            version.id,
            percent,
            &format!("Embedded batch {} of {}", batch_index + 1, total_batches),
            None,
        )?;
    }

    Ok(ProcessingStage::Index)
}

/// Chunk documents carrying the version's permission snapshot, ready for
/// bulk indexing. Shared with the reindex CLI.
pub fn build_chunk_documents(
    version: &DocumentVersion,
    group: &DocumentGroup,
    chunks: &[Chunk],
) -> Vec<(String, ChunkDocument)> {
    let indexed_at = chrono::Utc::now().to_rfc3339();
    let original_file_url = public_object_url(&version.storage_key);

    chunks
        .iter()
        .map(|chunk| {
            let metadata = ChunkDocumentMetadata {
                document_id: version.id.to_string(),
                group_id: group.id.to_string(),
                filename: group.canonical_filename.clone(),
                filepath: version.storage_key.clone(),
                file_type: version.file_type.clone(),
                page_number: chunk.page_number,
                owner_id: group.owner_id.to_string(),
                org_id: group.org_id.map(|org| org.to_string()),
                visibility: version.visibility.clone(),
                shared_with_users: version
                    .shared_user_ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect(),
                shared_with_roles: version.shared_role_codes.clone(),
                checksum: version.checksum.clone(),
                original_file_url: original_file_url.clone(),
                page_image_url: public_object_url(&page_image_key(
                    version.id,
                    chunk.page_number,
                )),
                category: version.category.clone(),
                tags: version.tags.clone(),
                author: version.author.clone(),
                description: version.description.clone(),
                indexed_at: indexed_at.clone(),
            };

            let doc = ChunkDocument {
                text: chunk.content.clone(),
                content_vector: chunk.embedding.clone(),
                document_name: group.canonical_filename.clone(),
                page_number: chunk.page_number,
                total_pages: version.total_pages,
                drawing_number: None,
                project_name: None,
                equipment_tags: vec![],
                component_details: vec![],
                metadata,
            };

            (chunk.id.clone(), doc)
        })
        .collect()
}

/// Stage 6: write chunk documents with the full permission snapshot to the
/// index. Idempotent on chunk id.
async fn index_stage(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
    group: &DocumentGroup,
) -> Result<ProcessingStage, PipelineError> {
    let chunks = get_chunks_by_version_query(version.id, ctx.pool.clone())
        .map_err(PipelineError::from)?;

    let docs = build_chunk_documents(version, group, &chunks);

    let total_batches = docs.len().div_ceil(INDEX_BATCH_SIZE).max(1);
    for (batch_index, batch) in docs.chunks(INDEX_BATCH_SIZE).enumerate() {
        check_cancel(task.id, &ctx.pool)?;

        let is_last = batch_index + 1 == total_batches;
        bulk_index_chunks(ctx.reqwest_client.clone(), batch.to_vec(), is_last)
            .await
            .map_err(PipelineError::from)?;

        mark_chunks_indexed_query(
            batch.iter().map(|(id, _)| id.clone()).collect(),
            ctx.pool.clone(),
        )
        .map_err(PipelineError::from)?;

        checkpoint_task_query(
            task.id,
            ProcessingStage::Index,
            batch_index as i32 + 1,
            ctx.pool.clone(),
        )
        .map_err(PipelineError::from)?;
    }

    progress(ctx, version.id, PROGRESS_INDEX, "Indexed chunks", None)?;

    Ok(ProcessingStage::Finalize)
}

/// Stage 7: terminal bookkeeping — latest flag, status, audit entry.
async fn finalize_stage(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
    group: &DocumentGroup,
) -> Result<(), PipelineError> {
    mark_latest_query(group.id, version.id, ctx.pool.clone()).map_err(PipelineError::from)?;

    progress(
        ctx,
        version.id,
        100,
        "Processing completed",
        Some(version.total_pages),
    )?;
    set_version_status_query(version.id, VersionStatus::Completed, None, ctx.pool.clone())
        .map_err(PipelineError::from)?;
    finish_task_query(task.id, TaskState::Completed, None, ctx.pool.clone())
        .map_err(PipelineError::from)?;

    create_event_query(
        crate::data::models::Event::from_details(
            "version_completed",
            Some(version.id),
            serde_json::json!({
                "group_id": group.id,
                "version_number": version.version_number,
                "total_pages": version.total_pages,
            }),
        ),
        ctx.pool.clone(),
    )
    .map_err(PipelineError::from)?;

    Ok(())
}

/// Archive parents: progress is the mean of child progress; the parent
/// completes only once every child task is terminal.
async fn await_children_stage(
    ctx: &PipelineContext,
    task: &Task,
    version: &DocumentVersion,
) -> Result<PipelineOutcome, PipelineError> {
    let children = child_tasks_query(task.id, ctx.pool.clone()).map_err(PipelineError::from)?;

    if children.is_empty() {
        return Err(PipelineError::Invariant(
            "archive parent has no child tasks".to_string(),
        ));
    }

    let mut progress_sum = 0i64;
    let mut terminal = 0usize;
    let mut completed = 0usize;
    for child in &children {
        let child_version =
            crate::operators::document_operator::get_version_by_id_query(
                child.version_id,
                ctx.pool.clone(),
            )
            .map_err(PipelineError::from)?;
        progress_sum += child_version.progress_percent as i64;
        if child.state_enum().is_terminal() {
            terminal += 1;
            if child.state_enum() == TaskState::Completed {
                completed += 1;
            }
        }
    }

    let mean_progress = (progress_sum / children.len() as i64) as i32;
    progress(
        ctx,
        version.id,
        mean_progress.min(99),
        &format!("{} of {} documents processed", terminal, children.len()),
        None,
    )?;

    if terminal < children.len() {
        park_task_query(task.id, TaskState::Queued, ctx.pool.clone())
            .map_err(PipelineError::from)?;
        return Ok(PipelineOutcome::AwaitingChildren);
    }

    if completed == children.len() {
        progress(ctx, version.id, 100, "Archive processed", None)?;
        set_version_status_query(version.id, VersionStatus::Completed, None, ctx.pool.clone())
            .map_err(PipelineError::from)?;
        finish_task_query(task.id, TaskState::Completed, None, ctx.pool.clone())
            .map_err(PipelineError::from)?;
    } else {
        let message = format!(
            "{} of {} archive members failed",
            children.len() - completed,
            children.len()
        );
        set_version_status_query(
            version.id,
            VersionStatus::Failed,
            Some(message.clone()),
            ctx.pool.clone(),
        )
        .map_err(PipelineError::from)?;
        finish_task_query(task.id, TaskState::Failed, Some(message), ctx.pool.clone())
            .map_err(PipelineError::from)?;
    }

    Ok(PipelineOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_sha256_hex() {
        let digest = compute_checksum(b"reset procedure");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, compute_checksum(b"reset procedure"));
        assert_ne!(digest, compute_checksum(b"reset procedures"));
    }
}
