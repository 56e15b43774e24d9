use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use grader::config::{CliArgs, Config};
use grader::database as db;
use grader::grading::{GitFetcher, Grader, RunnerRegistry, WorkspaceManager, create_sandbox_runner};
use grader::queue::GradingQueue;
use grader::web_server::build_server;
use grader::worker::worker;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let n_workers = cli.workers;

    if n_workers == 0 {
        bail!("The number of grading workers must not be 0");
    }

    let Config {
        server: server_config,
        grading: grading_config,
        runners,
        exercises,
    } = cli.to_config()?;

    let db_path = db::get_db_path();
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;

    let workspace_root = match &grading_config.workspace_root {
        Some(root) => root.clone(),
        None => WorkspaceManager::default_root()?,
    };
    log::info!("Workspaces live under {}", workspace_root.display());

    let registry = Arc::new(RunnerRegistry::from_config(exercises, runners)?);
    let sandbox = create_sandbox_runner(grading_config.engine)?;
    let fetcher = Arc::new(GitFetcher::new(grading_config.clone_timeout.into()));
    let db_pool = Arc::new(db_pool);
    let queue = Arc::new(GradingQueue::new());
    let shutdown_token = CancellationToken::new();

    let grader = Arc::new(Grader::new(
        db_pool.clone(),
        registry.clone(),
        fetcher,
        sandbox,
        workspace_root,
        grading_config,
    ));

    for submission_id in grader.recover().await? {
        log::info!("Re-queueing pending submission {submission_id}");
        queue.push(submission_id).await;
    }

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=n_workers {
        workers.spawn(worker(
            i,
            grader.clone(),
            queue.clone(),
            shutdown_token.clone(),
        ));
    }

    let server = build_server(server_config, db_pool, registry, queue)
        .context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting submissions
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for in-flight grading to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
