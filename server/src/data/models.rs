use super::schema::*;
use chrono::NaiveDateTime;
use derive_more::Display;
use diesel::{r2d2::ConnectionManager, PgConnection};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub type Pool = diesel::r2d2::Pool<ConnectionManager<PgConnection>>;
pub type RedisPool = bb8_redis::bb8::Pool<bb8_redis::RedisConnectionManager>;

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub id: uuid::Uuid,
    pub name: String,
    pub description: String,
    pub created_at: NaiveDateTime,
}

impl Organization {
    pub fn from_details<S: Into<String>>(name: S, description: S) -> Self {
        Organization {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone)]
#[diesel(table_name = users)]
pub struct User {
    pub id: uuid::Uuid,
    pub username: String,
    pub email: String,
    pub hash: String,
    pub org_id: Option<uuid::Uuid>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub role_codes: Vec<String>,
    pub created_at: NaiveDateTime,
    pub last_login: Option<NaiveDateTime>,
}

impl User {
    pub fn from_details<S: Into<String>>(
        username: S,
        email: S,
        hash: S,
        org_id: Option<uuid::Uuid>,
    ) -> Self {
        User {
            id: uuid::Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            hash: hash.into(),
            org_id,
            is_active: true,
            is_superuser: false,
            role_codes: vec![RoleCode::Viewer.to_string()],
            created_at: chrono::Utc::now().naive_utc(),
            last_login: None,
        }
    }
}

/// Closed role set enforced by the permission engine. Other codes may exist
/// in `role_codes` but carry no built-in semantics.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleCode {
    #[display("admin")]
    Admin,
    #[display("editor")]
    Editor,
    #[display("viewer")]
    Viewer,
}

/// The authenticated caller attached to every request by the auth middleware
/// and snapshotted into search-time permission filters.
#[derive(Debug, Serialize, Deserialize, Clone, ToSchema)]
pub struct LoggedUser {
    pub id: uuid::Uuid,
    pub username: String,
    pub email: String,
    pub org_id: Option<uuid::Uuid>,
    pub is_superuser: bool,
    pub roles: Vec<String>,
}

impl From<User> for LoggedUser {
    fn from(user: User) -> Self {
        LoggedUser {
            id: user.id,
            username: user.username,
            email: user.email,
            org_id: user.org_id,
            is_superuser: user.is_superuser,
            roles: user.role_codes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = document_groups)]
pub struct DocumentGroup {
    pub id: uuid::Uuid,
    pub canonical_filename: String,
    pub owner_id: uuid::Uuid,
    pub org_id: Option<uuid::Uuid>,
    pub created_at: NaiveDateTime,
}

impl DocumentGroup {
    pub fn from_details<S: Into<String>>(
        canonical_filename: S,
        owner_id: uuid::Uuid,
        org_id: Option<uuid::Uuid>,
    ) -> Self {
        DocumentGroup {
            id: uuid::Uuid::new_v4(),
            canonical_filename: canonical_filename.into(),
            owner_id,
            org_id,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum VersionStatus {
    #[display("queued")]
    Queued,
    #[display("processing")]
    Processing,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
}

impl VersionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VersionStatus::Completed | VersionStatus::Failed | VersionStatus::Cancelled
        )
    }
}

impl From<String> for VersionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => VersionStatus::Queued,
            "processing" => VersionStatus::Processing,
            "completed" => VersionStatus::Completed,
            "cancelled" => VersionStatus::Cancelled,
            _ => VersionStatus::Failed,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum Visibility {
    #[display("public")]
    Public,
    #[display("organization")]
    Organization,
    #[display("private")]
    Private,
}

impl Visibility {
    pub fn parse(s: &str) -> Option<Visibility> {
        match s {
            "public" => Some(Visibility::Public),
            "organization" => Some(Visibility::Organization),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = document_versions)]
pub struct DocumentVersion {
    pub id: uuid::Uuid,
    pub group_id: uuid::Uuid,
    pub version_number: i32,
    pub is_latest: bool,
    pub checksum: String,
    pub file_type: String,
    pub file_size: i64,
    pub storage_key: String,
    pub status: String,
    pub total_pages: i32,
    pub processed_pages: i32,
    pub progress_percent: i32,
    pub progress_message: String,
    pub visibility: String,
    pub shared_user_ids: Vec<uuid::Uuid>,
    pub shared_role_codes: Vec<String>,
    pub error_message: Option<String>,
    pub uploaded_by: uuid::Uuid,
    pub ocr_engine: String,
    pub processing_mode: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DocumentVersion {
    #[allow(clippy::too_many_arguments)]
    pub fn from_details(
        group_id: uuid::Uuid,
        version_number: i32,
        checksum: String,
        file_type: String,
        file_size: i64,
        storage_key: String,
        visibility: Visibility,
        uploaded_by: uuid::Uuid,
        upload_options: UploadOptions,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        DocumentVersion {
            id: uuid::Uuid::new_v4(),
            group_id,
            version_number,
            is_latest: false,
            checksum,
            file_type,
            file_size,
            storage_key,
            status: VersionStatus::Queued.to_string(),
            total_pages: 0,
            processed_pages: 0,
            progress_percent: 0,
            progress_message: "Queued for processing".to_string(),
            visibility: visibility.to_string(),
            shared_user_ids: vec![],
            shared_role_codes: vec![],
            error_message: None,
            uploaded_by,
            ocr_engine: upload_options.ocr_engine.to_string(),
            processing_mode: upload_options.processing_mode.to_string(),
            category: upload_options.category,
            tags: upload_options.tags,
            author: upload_options.author,
            description: upload_options.description,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status_enum(&self) -> VersionStatus {
        VersionStatus::from(self.status.clone())
    }
}

/// Per-upload knobs carried through from the upload form fields.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub ocr_engine: OcrEngine,
    pub processing_mode: ProcessingMode,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub enum OcrEngine {
    #[default]
    #[display("paddle")]
    Paddle,
    #[display("tesseract")]
    Tesseract,
}

impl OcrEngine {
    pub fn parse(s: &str) -> Option<OcrEngine> {
        match s {
            "paddle" => Some(OcrEngine::Paddle),
            "tesseract" => Some(OcrEngine::Tesseract),
            _ => None,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub enum ProcessingMode {
    #[default]
    #[display("fast")]
    Fast,
    #[display("deep")]
    Deep,
}

impl ProcessingMode {
    pub fn parse(s: &str) -> Option<ProcessingMode> {
        match s {
            "fast" => Some(ProcessingMode::Fast),
            "deep" => Some(ProcessingMode::Deep),
            _ => None,
        }
    }
}

/// One OCR detection: text, its confidence and its page-space rectangle.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct BoundingBox {
    pub text: String,
    pub confidence: f64,
    /// `[x1, y1, x2, y2]` with `x1 < x2` and `y1 < y2`.
    pub bbox: [f64; 4],
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (
            (self.bbox[0] + self.bbox[2]) / 2.0,
            (self.bbox[1] + self.bbox[3]) / 2.0,
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone)]
#[diesel(table_name = pages)]
pub struct Page {
    pub id: uuid::Uuid,
    pub version_id: uuid::Uuid,
    pub page_number: i32,
    pub image_key: String,
    pub ocr_json_key: Option<String>,
    pub text: String,
    pub avg_confidence: f64,
    pub vlm_failed: bool,
    pub bboxes: serde_json::Value,
    pub created_at: NaiveDateTime,
}

impl Page {
    pub fn from_details(version_id: uuid::Uuid, page_number: i32, image_key: String) -> Self {
        Page {
            id: uuid::Uuid::new_v4(),
            version_id,
            page_number,
            image_key,
            ocr_json_key: None,
            text: String::new(),
            avg_confidence: 0.0,
            vlm_failed: false,
            bboxes: serde_json::Value::Array(vec![]),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    pub fn bounding_boxes(&self) -> Vec<BoundingBox> {
        serde_json::from_value(self.bboxes.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone)]
#[diesel(table_name = chunks)]
pub struct Chunk {
    pub id: String,
    pub version_id: uuid::Uuid,
    pub page_number: i32,
    pub local_index: i32,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub indexed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl Chunk {
    pub fn from_details(
        version_id: uuid::Uuid,
        page_number: i32,
        local_index: i32,
        content: String,
    ) -> Self {
        Chunk {
            id: Chunk::deterministic_id(version_id, page_number, local_index),
            version_id,
            page_number,
            local_index,
            content,
            embedding: None,
            indexed_at: None,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    /// Chunk ids are content-addressed on position so that re-running a
    /// stage after a crash produces the same rows.
    pub fn deterministic_id(version_id: uuid::Uuid, page_number: i32, local_index: i32) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(version_id.as_bytes());
        hasher.update(page_number.to_be_bytes());
        hasher.update(local_index.to_be_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum TaskState {
    #[display("queued")]
    Queued,
    #[display("running")]
    Running,
    #[display("paused")]
    Paused,
    #[display("cancelled")]
    Cancelled,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Completed | TaskState::Failed
        )
    }
}

impl From<String> for TaskState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => TaskState::Queued,
            "running" => TaskState::Running,
            "paused" => TaskState::Paused,
            "cancelled" => TaskState::Cancelled,
            "completed" => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum TaskKind {
    #[display("ingest_document")]
    IngestDocument,
    #[display("re_embed")]
    ReEmbed,
    #[display("cleanup")]
    Cleanup,
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "re_embed" => TaskKind::ReEmbed,
            "cleanup" => TaskKind::Cleanup,
            _ => TaskKind::IngestDocument,
        }
    }
}

/// Durable cursor through the per-version stage graph.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStage {
    #[display("admit")]
    Admit,
    #[display("render")]
    Render,
    #[display("ocr_pages")]
    OcrPages,
    #[display("chunk")]
    Chunk,
    #[display("embed")]
    Embed,
    #[display("index")]
    Index,
    #[display("finalize")]
    Finalize,
    /// Archive parents park here until every child task is terminal.
    #[display("await_children")]
    AwaitChildren,
}

impl From<String> for ProcessingStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "render" => ProcessingStage::Render,
            "ocr_pages" => ProcessingStage::OcrPages,
            "chunk" => ProcessingStage::Chunk,
            "embed" => ProcessingStage::Embed,
            "index" => ProcessingStage::Index,
            "finalize" => ProcessingStage::Finalize,
            "await_children" => ProcessingStage::AwaitChildren,
            _ => ProcessingStage::Admit,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = tasks)]
pub struct Task {
    pub id: uuid::Uuid,
    pub kind: String,
    pub version_id: uuid::Uuid,
    pub state: String,
    pub stage_cursor: String,
    pub stage_sub_index: i32,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub lease_expires_at: Option<NaiveDateTime>,
    pub parent_task_id: Option<uuid::Uuid>,
    pub cancel_requested: bool,
    pub pause_requested: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Task {
    pub fn from_details(
        kind: TaskKind,
        version_id: uuid::Uuid,
        parent_task_id: Option<uuid::Uuid>,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Task {
            id: uuid::Uuid::new_v4(),
            kind: kind.to_string(),
            version_id,
            state: TaskState::Queued.to_string(),
            stage_cursor: ProcessingStage::Admit.to_string(),
            stage_sub_index: 0,
            attempt_count: 0,
            last_error: None,
            lease_expires_at: None,
            parent_task_id,
            cancel_requested: false,
            pause_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state_enum(&self) -> TaskState {
        TaskState::from(self.state.clone())
    }

    pub fn stage(&self) -> ProcessingStage {
        ProcessingStage::from(self.stage_cursor.clone())
    }
}

/// Message carried on the Redis ingest queue. The durable truth lives in the
/// tasks table; this is only the wake-up signal plus the attempt counter.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IngestMessage {
    pub task_id: uuid::Uuid,
    pub version_id: uuid::Uuid,
    pub attempt_number: i32,
}

impl IngestMessage {
    pub fn new(task_id: uuid::Uuid, version_id: uuid::Uuid) -> Self {
        IngestMessage {
            task_id,
            version_id,
            attempt_number: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone, ToSchema)]
#[diesel(table_name = tool_tokens)]
pub struct ToolToken {
    pub id: uuid::Uuid,
    pub owner_id: uuid::Uuid,
    pub name: String,
    pub secret_hash: String,
    pub created_at: NaiveDateTime,
    pub last_used: Option<NaiveDateTime>,
    pub expires_at: Option<NaiveDateTime>,
    pub active: bool,
}

impl ToolToken {
    pub fn from_details<S: Into<String>>(
        owner_id: uuid::Uuid,
        name: S,
        secret_hash: S,
        expires_at: Option<NaiveDateTime>,
    ) -> Self {
        ToolToken {
            id: uuid::Uuid::new_v4(),
            owner_id,
            name: name.into(),
            secret_hash: secret_hash.into(),
            created_at: chrono::Utc::now().naive_utc(),
            last_used: None,
            expires_at,
            active: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone)]
#[diesel(table_name = refresh_tokens)]
pub struct RefreshToken {
    pub id: uuid::Uuid,
    pub user_id: uuid::Uuid,
    pub expires_at: NaiveDateTime,
    pub revoked: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Serialize, Deserialize, Queryable, Insertable, Selectable, Clone)]
#[diesel(table_name = events)]
pub struct Event {
    pub id: uuid::Uuid,
    pub event_type: String,
    pub version_id: Option<uuid::Uuid>,
    pub payload: serde_json::Value,
    pub created_at: NaiveDateTime,
}

impl Event {
    pub fn from_details<S: Into<String>>(
        event_type: S,
        version_id: Option<uuid::Uuid>,
        payload: serde_json::Value,
    ) -> Self {
        Event {
            id: uuid::Uuid::new_v4(),
            event_type: event_type.into(),
            version_id,
            payload,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_deterministic_and_distinct() {
        let version = uuid::Uuid::new_v4();
        let a = Chunk::deterministic_id(version, 1, 0);
        let b = Chunk::deterministic_id(version, 1, 0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, Chunk::deterministic_id(version, 1, 1));
        assert_ne!(a, Chunk::deterministic_id(version, 2, 0));
        assert_ne!(a, Chunk::deterministic_id(uuid::Uuid::new_v4(), 1, 0));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            VersionStatus::Queued,
            VersionStatus::Processing,
            VersionStatus::Completed,
            VersionStatus::Failed,
            VersionStatus::Cancelled,
        ] {
            assert_eq!(VersionStatus::from(status.to_string()), status);
        }

        for stage in [
            ProcessingStage::Admit,
            ProcessingStage::Render,
            ProcessingStage::OcrPages,
            ProcessingStage::Chunk,
            ProcessingStage::Embed,
            ProcessingStage::Index,
            ProcessingStage::Finalize,
            ProcessingStage::AwaitChildren,
        ] {
            assert_eq!(ProcessingStage::from(stage.to_string()), stage);
        }
    }

    #[test]
    fn bounding_box_center() {
        let bbox = BoundingBox {
            text: "valve".to_string(),
            confidence: 0.9,
            bbox: [10.0, 20.0, 30.0, 40.0],
        };
        assert_eq!(bbox.center(), (20.0, 30.0));
    }
}
