//! Liveness and readiness endpoints for the background loops.

use std::sync::Arc;

use actix_web::{get, web, HttpResponse, Responder};
use tokio::sync::Mutex;

use crate::heartbeat::HeartbeatMonitor;

pub type BackgroundThreads = Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>;

/// 500 when any background loop has exited.
#[get("/lively")]
pub async fn background_threads_running(
    background_threads: web::Data<BackgroundThreads>,
) -> impl Responder {
    let background_threads = background_threads.lock().await;

    for thread in background_threads.iter() {
        if thread.is_finished() {
            return HttpResponse::InternalServerError()
                .body("One or more background tasks are not running.");
        }
    }

    HttpResponse::Ok().json("ok")
}

/// 500 when the scheduler has not ticked within its heartbeat window.
#[get("/ready")]
pub async fn scheduler_ready(monitor: web::Data<Arc<HeartbeatMonitor>>) -> impl Responder {
    if monitor.is_heartbeat_active() {
        HttpResponse::Ok().json("ok")
    } else {
        HttpResponse::InternalServerError().body("Backup scheduler heartbeat is stale.")
    }
}
