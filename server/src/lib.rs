use actix_web::{
    get,
    middleware::Logger,
    web::{self, PayloadConfig},
    App, HttpResponse, HttpServer,
};
use diesel::r2d2::ConnectionManager;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_redoc::{Redoc, Servable};

#[macro_use]
extern crate diesel;

pub mod data;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod operators;

use crate::data::models::Pool;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

#[macro_export]
macro_rules! get_env {
    ($name:expr, $message:expr) => {{
        lazy_static::lazy_static! {
            static ref ENV_VAR: String = {
                std::env::var($name).expect($message)
            };
        }
        ENV_VAR.as_str()
    }};
}

/// Health Check
///
/// Confirmation that the service is up and able to answer requests.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Service is healthy")),
)]
#[get("/health")]
pub async fn health_check() -> Result<HttpResponse, actix_web::Error> {
    Ok(HttpResponse::Ok().finish())
}

pub fn establish_pool() -> Pool {
    let database_url = get_env!("DATABASE_URL", "DATABASE_URL should be set");
    let manager = ConnectionManager::<PgConnection>::new(database_url);

    diesel::r2d2::Pool::builder()
        .max_size(
            std::env::var("DB_POOL_SIZE")
                .unwrap_or("10".to_string())
                .parse()
                .unwrap_or(10),
        )
        .build(manager)
        .expect("Failed to create database pool")
}

pub async fn establish_redis_pool() -> data::models::RedisPool {
    let redis_url = get_env!("REDIS_URL", "REDIS_URL should be set");
    let redis_connections: u32 = std::env::var("REDIS_CONNECTIONS")
        .unwrap_or("10".to_string())
        .parse()
        .unwrap_or(10);

    let redis_manager = bb8_redis::RedisConnectionManager::new(redis_url)
        .expect("Failed to create redis manager");

    bb8_redis::bb8::Pool::builder()
        .max_size(redis_connections)
        .connection_timeout(std::time::Duration::from_secs(2))
        .build(redis_manager)
        .await
        .expect("Failed to create redis pool")
}

pub fn run_migrations(pool: &Pool) {
    let mut conn = pool.get().expect("Failed to get connection for migrations");
    conn.run_pending_migrations(MIGRATIONS)
        .expect("Failed to run migrations");
}

#[actix_web::main]
pub async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    env_logger::builder()
        .target(env_logger::Target::Stdout)
        .filter_level(log::LevelFilter::Info)
        .init();

    #[derive(OpenApi)]
    #[openapi(
        info(
            title = "Docbase API",
            description = "Multi-tenant document knowledge base: ingestion, hybrid retrieval, and task control.",
            version = "0.1.0",
        ),
        modifiers(&SecurityAddon),
        paths(
            health_check,
            handlers::auth_handler::login,
            handlers::auth_handler::refresh,
            handlers::auth_handler::register,
            handlers::auth_handler::me,
            handlers::auth_handler::create_tool_token,
            handlers::auth_handler::revoke_tool_token,
            handlers::document_handler::upload_document,
            handlers::document_handler::upload_batch,
            handlers::document_handler::list_documents,
            handlers::document_handler::get_document,
            handlers::document_handler::get_progress,
            handlers::document_handler::get_page,
            handlers::document_handler::list_versions,
            handlers::document_handler::restore_version,
            handlers::document_handler::delete_document,
            handlers::document_handler::update_permissions,
            handlers::search_handler::search,
            handlers::search_handler::stats,
            handlers::task_handler::list_tasks,
            handlers::task_handler::get_task,
            handlers::task_handler::pause_task,
            handlers::task_handler::resume_task,
            handlers::task_handler::cancel_task,
            handlers::tool_handler::call_tool,
        ),
        tags(
            (name = "Auth", description = "Session and tool token operations"),
            (name = "Documents", description = "Upload, lifecycle and permission operations"),
            (name = "Search", description = "Hybrid retrieval over indexed chunks"),
            (name = "Tasks", description = "Ingestion task control"),
            (name = "Tools", description = "Tool-protocol surface for AI assistants"),
        )
    )]
    struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi
                .components
                .as_mut()
                .expect("Components should be registered");
            components.add_security_scheme(
                "bearer",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("Authorization"))),
            )
        }
    }

    let pool = establish_pool();
    run_migrations(&pool);

    let redis_pool = establish_redis_pool().await;
    let reqwest_client = reqwest::Client::new();

    let max_upload_bytes: usize = std::env::var("MAX_UPLOAD_BYTES")
        .unwrap_or("104857600".to_string())
        .parse()
        .unwrap_or(104857600);

    log::info!("Starting docbase server on 0.0.0.0:8090");

    HttpServer::new(move || {
        App::new()
            .wrap(actix_cors::Cors::permissive())
            .wrap(
                Logger::new("%r %s %b %{User-Agent}i %T")
                    .exclude("/health")
                    .exclude("/"),
            )
            .wrap(middleware::auth_middleware::AuthMiddlewareFactory)
            .app_data(PayloadConfig::new(max_upload_bytes))
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::new(redis_pool.clone()))
            .app_data(web::Data::new(reqwest_client.clone()))
            .service(Redoc::with_url("/redoc", ApiDoc::openapi()))
            .service(health_check)
            .service(
                web::scope("/auth")
                    .route("/login", web::post().to(handlers::auth_handler::login))
                    .route("/refresh", web::post().to(handlers::auth_handler::refresh))
                    .route("/register", web::post().to(handlers::auth_handler::register))
                    .route("/me", web::get().to(handlers::auth_handler::me))
                    .route(
                        "/tool_tokens",
                        web::post().to(handlers::auth_handler::create_tool_token),
                    )
                    .route(
                        "/tool_tokens/{token_id}",
                        web::delete().to(handlers::auth_handler::revoke_tool_token),
                    ),
            )
            .route(
                "/upload",
                web::post().to(handlers::document_handler::upload_document),
            )
            .route(
                "/upload_batch",
                web::post().to(handlers::document_handler::upload_batch),
            )
            .service(
                web::scope("/documents")
                    .route("", web::get().to(handlers::document_handler::list_documents))
                    .route(
                        "/{group_id}/versions",
                        web::get().to(handlers::document_handler::list_versions),
                    )
                    .route(
                        "/{group_id}/versions/{version_number}/restore",
                        web::post().to(handlers::document_handler::restore_version),
                    )
                    .route(
                        "/{version_id}/progress",
                        web::get().to(handlers::document_handler::get_progress),
                    )
                    .route(
                        "/{version_id}/pages/{page_number}",
                        web::get().to(handlers::document_handler::get_page),
                    )
                    .route(
                        "/{version_id}/permissions",
                        web::put().to(handlers::document_handler::update_permissions),
                    )
                    .route(
                        "/{version_id}",
                        web::get().to(handlers::document_handler::get_document),
                    )
                    .route(
                        "/{version_id}",
                        web::delete().to(handlers::document_handler::delete_document),
                    ),
            )
            .route("/search", web::post().to(handlers::search_handler::search))
            .route("/stats", web::get().to(handlers::search_handler::stats))
            .service(
                web::scope("/tasks")
                    .route("", web::get().to(handlers::task_handler::list_tasks))
                    .route("/{task_id}", web::get().to(handlers::task_handler::get_task))
                    .route(
                        "/{task_id}/pause",
                        web::post().to(handlers::task_handler::pause_task),
                    )
                    .route(
                        "/{task_id}/resume",
                        web::post().to(handlers::task_handler::resume_task),
                    )
                    .route(
                        "/{task_id}/cancel",
                        web::post().to(handlers::task_handler::cancel_task),
                    ),
            )
            .route(
                "/tools/call",
                web::post().to(handlers::tool_handler::call_tool),
            )
    })
    .bind((
        "0.0.0.0",
        std::env::var("PORT")
            .unwrap_or("8090".to_string())
            .parse()
            .unwrap_or(8090),
    ))?
    .run()
    .await
}
