use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::ServerConfig;
use crate::grading::RunnerRegistry;
use crate::queue::GradingQueue;
use crate::routes::{
    get_result_handler, get_submission_handler, json_error_handler, post_submission_handler,
};

pub fn build_server(
    server_config: ServerConfig,
    db_pool: Arc<SqlitePool>,
    registry: Arc<RunnerRegistry>,
    queue: Arc<GradingQueue>,
) -> std::io::Result<Server> {
    let db_pool = web::Data::from(db_pool);
    let registry = web::Data::from(registry);
    let queue = web::Data::from(queue);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(db_pool.clone())
            .app_data(registry.clone())
            .app_data(queue.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_submission_handler)
            .service(get_submission_handler)
            .service(get_result_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
