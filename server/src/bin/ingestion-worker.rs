use docbase_server::{
    data::models::{IngestMessage, TaskState, VersionStatus},
    establish_pool, establish_redis_pool,
    operators::{
        document_operator::set_version_status_query,
        pipeline_operator::{run_pipeline, PipelineContext, PipelineOutcome},
        task_operator::{
            claim_task_query, enqueue_ingest_message, finish_task_query, get_task_query,
            handle_pipeline_error, heartbeat_task_query, listen_for_ingest_message,
            remove_from_processing, sweep_expired_leases_query, MAX_ATTEMPTS,
        },
    },
};
use signal_hook::consts::SIGTERM;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::Semaphore;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const CHILD_POLL_DELAY: Duration = Duration::from_secs(5);

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    env_logger::builder()
        .target(env_logger::Target::Stdout)
        .filter_level(log::LevelFilter::Info)
        .init();

    let pool = actix_web::web::Data::new(establish_pool());
    let redis_pool = establish_redis_pool().await;
    let reqwest_client = reqwest::Client::new();

    let cpu_workers = env_usize(
        "CPU_WORKERS",
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4),
    );
    let model_workers = env_usize("MODEL_WORKERS", 2);
    let admit_permits = env_usize("ADMIT_PERMITS", 4);
    let claim_loops = env_usize("WORKER_TASKS", 2);

    let ctx = PipelineContext {
        pool: pool.clone(),
        redis_pool: redis_pool.clone(),
        reqwest_client,
        cpu_pool: Arc::new(Semaphore::new(cpu_workers)),
        model_pool: Arc::new(Semaphore::new(model_workers)),
        admit_gate: Arc::new(Semaphore::new(admit_permits)),
    };

    let should_terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))
        .expect("Failed to register shutdown hook");

    log::info!(
        "Starting ingestion worker: cpu={} model={} admit={} loops={}",
        cpu_workers,
        model_workers,
        admit_permits,
        claim_loops
    );

    // Lease sweeper: returns crashed workers' tasks to the queue.
    let sweeper_ctx = ctx.clone();
    let sweeper_terminate = Arc::clone(&should_terminate);
    let sweeper = tokio::spawn(async move {
        while !sweeper_terminate.load(Ordering::Relaxed) {
            tokio::time::sleep(SWEEP_INTERVAL).await;

            let swept = match sweep_expired_leases_query(sweeper_ctx.pool.clone()) {
                Ok(swept) => swept,
                Err(err) => {
                    log::error!("lease sweep failed: {}", err);
                    continue;
                }
            };

            for task in swept {
                log::warn!(
                    "lease expired for task {} (attempt {})",
                    task.id,
                    task.attempt_count
                );

                if task.attempt_count >= MAX_ATTEMPTS {
                    let message = "worker lease expired too many times".to_string();
                    let _ = finish_task_query(
                        task.id,
                        TaskState::Failed,
                        Some(message.clone()),
                        sweeper_ctx.pool.clone(),
                    );
                    let _ = set_version_status_query(
                        task.version_id,
                        VersionStatus::Failed,
                        Some(message),
                        sweeper_ctx.pool.clone(),
                    );
                    continue;
                }

                if let Ok(mut redis_conn) = sweeper_ctx.redis_pool.get().await {
                    let mut message = IngestMessage::new(task.id, task.version_id);
                    message.attempt_number = task.attempt_count;
                    if let Err(err) = enqueue_ingest_message(&message, &mut redis_conn).await {
                        log::error!("failed to requeue swept task {}: {}", task.id, err);
                    }
                }
            }
        }
    });

    let mut claim_handles = vec![];
    for loop_index in 0..claim_loops {
        let ctx = ctx.clone();
        let should_terminate = Arc::clone(&should_terminate);

        claim_handles.push(tokio::spawn(async move {
            let mut redis_conn = loop {
                match ctx.redis_pool.get().await {
                    Ok(conn) => break conn.clone(),
                    Err(err) => {
                        log::error!("claim loop {} waiting for redis: {}", loop_index, err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            };

            loop {
                if should_terminate.load(Ordering::Relaxed) {
                    log::info!("claim loop {} shutting down", loop_index);
                    break;
                }

                let Some(message) = listen_for_ingest_message(&mut redis_conn).await else {
                    continue;
                };

                let task = match claim_task_query(message.task_id, ctx.pool.clone()) {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        // Someone else claimed it, or it is paused/terminal.
                        remove_from_processing(&message, &mut redis_conn).await;
                        continue;
                    }
                    Err(err) => {
                        log::error!("claim failed for task {}: {}", message.task_id, err);
                        remove_from_processing(&message, &mut redis_conn).await;
                        continue;
                    }
                };

                log::info!(
                    "claim loop {} processing task {} (stage {}, attempt {})",
                    loop_index,
                    task.id,
                    task.stage_cursor,
                    task.attempt_count
                );

                let heartbeat_pool = ctx.pool.clone();
                let heartbeat_task_id = task.id;
                let heartbeat = tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                        match heartbeat_task_query(heartbeat_task_id, heartbeat_pool.clone()) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(err) => {
                                log::warn!("heartbeat failed: {}", err);
                            }
                        }
                    }
                });

                let result = run_pipeline(&ctx, task.clone()).await;
                heartbeat.abort();

                match result {
                    Ok(PipelineOutcome::Completed) => {
                        log::info!("task {} completed", task.id);
                    }
                    Ok(PipelineOutcome::Paused) => {
                        log::info!("task {} paused", task.id);
                    }
                    Ok(PipelineOutcome::AwaitingChildren) => {
                        // Parent parks queued; poke it again after a delay.
                        tokio::time::sleep(CHILD_POLL_DELAY).await;
                        let requeue = IngestMessage::new(task.id, task.version_id);
                        if let Err(err) =
                            enqueue_ingest_message(&requeue, &mut redis_conn).await
                        {
                            log::error!("failed to requeue parent {}: {}", task.id, err);
                        }
                    }
                    Err(error) => {
                        // Re-read the task so the error handler sees the
                        // freshest attempt count.
                        let current = get_task_query(task.id, ctx.pool.clone()).unwrap_or(task.clone());
                        if let Err(err) = handle_pipeline_error(
                            &current,
                            error,
                            ctx.pool.clone(),
                            &mut redis_conn,
                        )
                        .await
                        {
                            log::error!("failed to settle task {}: {}", task.id, err);
                        }
                    }
                }

                remove_from_processing(&message, &mut redis_conn).await;
            }
        }));
    }

    for handle in claim_handles {
        let _ = handle.await;
    }
    sweeper.abort();

    log::info!("Ingestion worker stopped");
}
