use codeduel_common::config::RuntimeSettings;
use codeduel_common::redis;
use codeduel_common::types::SubmissionJob;
use codeduel_engine::registry::FsProblemStore;
use codeduel_engine::sandbox::DockerProvider;
use codeduel_engine::{ExecutionService, LanguageConfigManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("CodeDuel worker booting...");

    let settings = RuntimeSettings::from_env();
    let config = LanguageConfigManager::load_default().map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        e
    })?;
    let languages = config.list_languages();
    info!(
        languages = ?languages,
        persistent = config.settings().use_persistent_containers,
        max_concurrent = config.settings().max_concurrent_submissions,
        "Loaded language configurations"
    );
    let max_concurrent = config.settings().max_concurrent_submissions.max(1);

    let provider = Arc::new(DockerProvider::connect()?);
    let problems = Arc::new(FsProblemStore::new(settings.problems_dir.clone()));
    let service = Arc::new(ExecutionService::new(Arc::new(config), problems, provider)?);

    // Leftovers from a crashed previous run would hold the well-known container names
    match service.pool().teardown_managed().await {
        Ok(0) => {}
        Ok(n) => info!(removed = n, "Removed stale managed containers"),
        Err(e) => warn!(error = %e, "Failed to remove stale containers"),
    }

    for (language, result) in service.warm_up(&languages).await {
        if let Err(e) = result {
            // Not fatal: the language warms lazily on its first submission
            warn!(language = %language, error = %e, "Warm-up failed");
        }
    }

    let client = ::redis::Client::open(settings.redis_url.as_str())?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", settings.redis_url);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, stopping intake...");
    };

    let sweeper = {
        let service = service.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await;
            loop {
                interval.tick().await;
                service.pool().sweep_scratch().await;
            }
        })
    };

    tokio::select! {
        _ = worker_loop(redis_conn, service.clone(), &settings, max_concurrent) => {},
        _ = shutdown => {},
    }

    sweeper.abort();
    service.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip_all)]
async fn worker_loop(
    mut redis_conn: ::redis::aio::ConnectionManager,
    service: Arc<ExecutionService>,
    settings: &RuntimeSettings,
    max_concurrent: usize,
) {
    let slots = Arc::new(Semaphore::new(max_concurrent));
    loop {
        // Only pop what can start right away; the rest waits in Redis
        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        match redis::pop_submission(&mut redis_conn, settings.queue_pop_timeout_seconds).await {
            Ok(Some(job)) => {
                let service = service.clone();
                let conn = redis_conn.clone();
                let ttl = settings.result_ttl_seconds;
                tokio::spawn(async move {
                    process_job(job, service, conn, ttl).await;
                    drop(permit);
                });
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process_job(
    job: SubmissionJob,
    service: Arc<ExecutionService>,
    mut conn: ::redis::aio::ConnectionManager,
    ttl_seconds: u64,
) {
    let submission = job.submission;
    let submission_id = submission.id;
    let queued_ms = (chrono::Utc::now() - job.enqueued_at).num_milliseconds();
    info!(
        submission_id = %submission_id,
        language = %submission.language,
        problem_id = %submission.problem_id,
        source_size = submission.source_code.len(),
        queued_ms,
        "Received submission"
    );

    let response = service.submit(submission).await;
    for (idx, result) in response.test_results.iter().enumerate() {
        debug!(
            submission_id = %submission_id,
            test_num = idx + 1,
            passed = result.passed,
            execution_ms = ?result.execution_time_ms,
            "Test result"
        );
    }

    match redis::store_result(&mut conn, &response, ttl_seconds).await {
        Ok(()) => info!(submission_id = %submission_id, "Result persisted to Redis"),
        // Non-fatal - worker continues
        Err(e) => error!(submission_id = %submission_id, error = %e, "Failed to persist result"),
    }
}
