use clap::{Parser, Subcommand};
use diesel::prelude::*;
use docbase_server::{
    data::models::{Pool, TaskState, User},
    establish_pool,
    operators::{
        document_operator::{get_chunks_by_version_query, get_version_with_group_query},
        index_operator::{
            bulk_index_chunks, delete_chunks_by_version, ensure_index, list_indexed_version_ids,
        },
        pipeline_operator::build_chunk_documents,
        user_operator::{any_superuser_exists_query, create_user_query, hash_password},
    },
    run_migrations,
};
use std::process::ExitCode;

/// Operational command line for the docbase deployment.
#[derive(Parser)]
#[command(name = "docbase-ops", version, about = "Docbase operational commands")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the chunk index with its mapping if missing.
    InitIndex,
    /// Run pending database migrations and seed the first superuser.
    Migrate,
    /// Reconcile the index against metadata and report orphaned chunks.
    CleanupOrphans {
        /// Delete the orphaned chunk sets instead of only listing them.
        #[arg(long)]
        apply: bool,
    },
    /// Rebuild the index documents of one version from metadata.
    ReindexVersion {
        version_id: uuid::Uuid,
    },
    /// Deactivate expired tool tokens and drop dead refresh tokens.
    RotateTokens,
}

enum CliError {
    User(String),
    Internal(String),
}

impl From<docbase_server::errors::ServiceError> for CliError {
    fn from(err: docbase_server::errors::ServiceError) -> CliError {
        CliError::Internal(err.to_string())
    }
}

fn seed_superuser(pool: actix_web::web::Data<Pool>) -> Result<(), CliError> {
    if any_superuser_exists_query(pool.clone())? {
        return Ok(());
    }

    let username = std::env::var("ADMIN_USERNAME").unwrap_or("admin".to_string());
    let email = std::env::var("ADMIN_EMAIL").unwrap_or("admin@localhost".to_string());
    let password = std::env::var("ADMIN_PASSWORD")
        .map_err(|_| CliError::User("ADMIN_PASSWORD must be set to seed the superuser".to_string()))?;

    let hash = hash_password(&password)?;
    let mut user = User::from_details(username.clone(), email, hash, None);
    user.is_superuser = true;
    user.role_codes = vec!["admin".to_string()];

    create_user_query(user, pool)?;
    log::info!("Seeded superuser {}", username);

    Ok(())
}

async fn cleanup_orphans(
    apply: bool,
    pool: actix_web::web::Data<Pool>,
    reqwest_client: reqwest::Client,
) -> Result<(), CliError> {
    use docbase_server::data::schema::document_versions::dsl as versions_columns;
    use docbase_server::data::schema::tasks::dsl as tasks_columns;

    let indexed_ids = list_indexed_version_ids(reqwest_client.clone()).await?;

    let mut conn = pool
        .get()
        .map_err(|err| CliError::Internal(err.to_string()))?;

    let known_ids: Vec<uuid::Uuid> = versions_columns::document_versions
        .select(versions_columns::id)
        .load(&mut conn)
        .map_err(|err| CliError::Internal(err.to_string()))?;

    let mut orphans = vec![];
    for raw_id in indexed_ids {
        match raw_id.parse::<uuid::Uuid>() {
            Ok(id) if known_ids.contains(&id) => {}
            _ => orphans.push(raw_id),
        }
    }

    // Tasks stuck running without a live lease are cleanup candidates too.
    let stuck: Vec<uuid::Uuid> = tasks_columns::tasks
        .filter(tasks_columns::state.eq(TaskState::Running.to_string()))
        .filter(tasks_columns::lease_expires_at.lt(chrono::Utc::now().naive_utc()))
        .select(tasks_columns::id)
        .load(&mut conn)
        .map_err(|err| CliError::Internal(err.to_string()))?;

    println!("orphaned chunk sets: {}", orphans.len());
    for orphan in &orphans {
        println!("  index version without metadata: {}", orphan);
    }
    println!("stuck running tasks: {}", stuck.len());
    for task in &stuck {
        println!("  task with expired lease: {}", task);
    }

    if apply {
        for orphan in orphans {
            if let Ok(version_id) = orphan.parse::<uuid::Uuid>() {
                let deleted = delete_chunks_by_version(reqwest_client.clone(), version_id).await?;
                println!("deleted {} chunks for {}", deleted, version_id);
            }
        }
    } else {
        println!("run with --apply to delete orphaned chunk sets");
    }

    Ok(())
}

async fn reindex_version(
    version_id: uuid::Uuid,
    pool: actix_web::web::Data<Pool>,
    reqwest_client: reqwest::Client,
) -> Result<(), CliError> {
    let (version, group) = get_version_with_group_query(version_id, pool.clone())
        .map_err(|_| CliError::User(format!("unknown version {}", version_id)))?;

    let chunks = get_chunks_by_version_query(version_id, pool)?;
    if chunks.is_empty() {
        return Err(CliError::User(format!(
            "version {} has no chunks to index",
            version_id
        )));
    }

    delete_chunks_by_version(reqwest_client.clone(), version_id).await?;

    let docs = build_chunk_documents(&version, &group, &chunks);
    let total = docs.len();
    bulk_index_chunks(reqwest_client, docs, true).await?;

    println!("reindexed {} chunks for version {}", total, version_id);
    Ok(())
}

fn rotate_tokens(pool: actix_web::web::Data<Pool>) -> Result<(), CliError> {
    use docbase_server::data::schema::refresh_tokens::dsl as refresh_columns;
    use docbase_server::data::schema::tool_tokens::dsl as tool_tokens_columns;

    let mut conn = pool
        .get()
        .map_err(|err| CliError::Internal(err.to_string()))?;

    let now = chrono::Utc::now().naive_utc();

    let deactivated = diesel::update(
        tool_tokens_columns::tool_tokens
            .filter(tool_tokens_columns::active.eq(true))
            .filter(tool_tokens_columns::expires_at.lt(now)),
    )
    .set(tool_tokens_columns::active.eq(false))
    .execute(&mut conn)
    .map_err(|err| CliError::Internal(err.to_string()))?;

    let dropped = diesel::delete(
        refresh_columns::refresh_tokens.filter(
            refresh_columns::revoked
                .eq(true)
                .or(refresh_columns::expires_at.lt(now)),
        ),
    )
    .execute(&mut conn)
    .map_err(|err| CliError::Internal(err.to_string()))?;

    println!(
        "deactivated {} expired tool tokens, dropped {} dead refresh tokens",
        deactivated, dropped
    );
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let pool = actix_web::web::Data::new(establish_pool());
    let reqwest_client = reqwest::Client::new();

    match cli.command {
        Commands::InitIndex => {
            let created = ensure_index(reqwest_client).await?;
            if created {
                println!("index created");
            } else {
                println!("index already exists");
            }
            Ok(())
        }
        Commands::Migrate => {
            run_migrations(&pool);
            seed_superuser(pool)?;
            println!("migrations applied");
            Ok(())
        }
        Commands::CleanupOrphans { apply } => cleanup_orphans(apply, pool, reqwest_client).await,
        Commands::ReindexVersion { version_id } => {
            reindex_version(version_id, pool, reqwest_client).await
        }
        Commands::RotateTokens => rotate_tokens(pool),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    env_logger::builder()
        .target(env_logger::Target::Stdout)
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::User(message)) => {
            eprintln!("error: {}", message);
            ExitCode::from(2)
        }
        Err(CliError::Internal(message)) => {
            eprintln!("internal error: {}", message);
            ExitCode::from(1)
        }
    }
}
