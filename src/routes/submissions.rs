use actix_web::{HttpResponse, Responder, get, post, web};
use sqlx::sqlite::SqlitePool;

use super::{ErrorResponse, ErrorResponseWithMessage};
use crate::database::{self as db, CreateSubmissionError};
use crate::grading::RunnerRegistry;
use crate::queue::GradingQueue;
use crate::submission::NewSubmission;

/// Stores the submission and queues it for grading; returns without waiting
/// for the grade.
#[post("/submissions")]
pub async fn post_submission_handler(
    queue: web::Data<GradingQueue>,
    pool: web::Data<SqlitePool>,
    body: web::Json<NewSubmission>,
) -> impl Responder {
    let submission = match db::create_submission(&body, pool.into_inner()).await {
        Ok(submission) => submission,
        Err(CreateSubmissionError::Validation(e)) => {
            log::info!("Rejected submission: {e}");
            return HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: e.to_string(),
            });
        }
        Err(CreateSubmissionError::Database(e)) => {
            log::error!("Failed to insert submission into database: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            });
        }
    };

    log::info!(
        "Inserted submission {} for exercise {} into database",
        submission.id,
        submission.exercise_id
    );
    queue.push(submission.id).await;
    log::debug!("Sent submission {} to queue", submission.id);

    HttpResponse::Ok().json(submission)
}

#[get("/submissions/{id}")]
pub async fn get_submission_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<(u32,)>,
) -> impl Responder {
    let submission_id = path.into_inner().0;

    match db::fetch_submission(submission_id, pool.into_inner()).await {
        Ok(submission) => HttpResponse::Ok().json(submission),
        Err(sqlx::Error::RowNotFound) => not_found(submission_id),
        Err(e) => {
            log::error!("Failed to retrieve submission {submission_id} from database: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}

/// The stored result, or a `pending`/`testing` placeholder while grading runs.
#[get("/submissions/{id}/result")]
pub async fn get_result_handler(
    pool: web::Data<SqlitePool>,
    registry: web::Data<RunnerRegistry>,
    path: web::Path<(u32,)>,
) -> impl Responder {
    let submission_id = path.into_inner().0;
    let pool = pool.into_inner();

    let max_score = match db::fetch_submission(submission_id, pool.clone()).await {
        Ok(submission) => registry
            .exercise(&submission.exercise_id)
            .map_or(100.0, |e| e.max_score),
        Err(sqlx::Error::RowNotFound) => return not_found(submission_id),
        Err(e) => {
            log::error!("Failed to retrieve submission {submission_id} from database: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            });
        }
    };

    match db::fetch_test_result(submission_id, max_score, pool).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(sqlx::Error::RowNotFound) => not_found(submission_id),
        Err(e) => {
            log::error!("Failed to retrieve result of submission {submission_id}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}

fn not_found(submission_id: u32) -> HttpResponse {
    log::info!("Got nothing with submission id {submission_id} from database");
    HttpResponse::NotFound().json(ErrorResponseWithMessage {
        reason: "ERR_NOT_FOUND",
        code: 3,
        message: format!("Submission {submission_id} not found."),
    })
}
