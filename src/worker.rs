use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::grading::Grader;
use crate::queue::GradingQueue;

/// Pops submission ids and grades them one at a time.
///
/// The number of workers bounds how many sandboxes run concurrently. A
/// pipeline that has started is allowed to finish before shutdown.
pub async fn worker(
    id: u8,
    grader: Arc<Grader>,
    queue: Arc<GradingQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            submission_id = queue.pop() => {
                log::info!("Worker {id} got submission {submission_id} from queue");

                match grader.grade(submission_id).await {
                    Ok(Some(status)) => {
                        log::info!("Submission {submission_id} finished on worker {id} as {status}");
                    }
                    Ok(None) => {
                        log::debug!("Submission {submission_id} discarded by worker {id}");
                    }
                    Err(e) => {
                        log::error!("Grading submission {submission_id} failed on worker {id}: {e:#}");
                    }
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}
