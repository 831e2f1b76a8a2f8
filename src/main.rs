use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use futures::future::BoxFuture;
use log::{error, info};
use steward::StewardError;
use steward::backups::config::{BackupConfigRepository, BackupConfigService};
use steward::backups::scheduler::BackupScheduler;
use steward::backups::{BackupRepository, BackupService};
use steward::config::Config;
use steward::databases::{DatabaseRepository, DatabaseService};
use steward::healthcheck::{HealthcheckRepository, HealthcheckService, HealthcheckWorker};
use steward::notifiers::{NotificationService, NotifierRepository};
use steward::restores::{RestoreRepository, RestoreService};
use steward::routes::health::{background_threads_running, scheduler_ready, BackgroundThreads};
use steward::storages::{StorageDirs, StorageRepository, StorageService};
use steward::{db, heartbeat, pgtools, shutdown};
use tokio::sync::Mutex;

/// Scheduler readiness window: the loop ticks every minute, five missed
/// ticks mean it is wedged.
const HEARTBEAT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Arc::new(Config::from_env()?);
    config.ensure_directories()?;

    // Every supported PostgreSQL version must have client tools on disk,
    // otherwise backups of that version fail at dispatch time
    pgtools::verify_installations(config.env_mode, &config.postgres_install_dir)?;

    let pool = db::connect(&config.database_dsn, 10).await?;
    info!("Connected to metadata database");

    let shutdown_flag = shutdown::Shutdown::new();
    shutdown::listen_for_signals(shutdown_flag.clone());

    let (heartbeat_monitor, heartbeat_updater) = heartbeat::start(HEARTBEAT_MAX_AGE);
    let heartbeat_monitor = Arc::new(heartbeat_monitor);

    // Repositories and services, wired explicitly; the cross-component
    // interactions (database removal, storage change) are registered as
    // hooks right here rather than discovered through globals
    let storage_dirs = StorageDirs {
        data_dir: config.data_dir.clone(),
        temp_dir: config.temp_dir.clone(),
        nas_mount_dir: config.nas_mount_dir.clone(),
    };

    let database_service = DatabaseService::new(DatabaseRepository::new(pool.clone()));
    let storage_service = StorageService::new(StorageRepository::new(pool.clone(), storage_dirs));
    let notification_service = NotificationService::new(NotifierRepository::new(pool.clone()));
    let backup_config_service = BackupConfigService::new(BackupConfigRepository::new(pool.clone()));

    let backup_service = BackupService::new(
        config.clone(),
        shutdown_flag.clone(),
        BackupRepository::new(pool.clone()),
        database_service.clone(),
        storage_service.clone(),
        backup_config_service.clone(),
        notification_service.clone(),
    );

    let healthcheck_service = HealthcheckService::new(
        HealthcheckRepository::new(pool.clone()),
        database_service.clone(),
        notification_service.clone(),
    );

    let restore_service = RestoreService::new(
        config.clone(),
        shutdown_flag.clone(),
        RestoreRepository::new(pool.clone()),
        backup_service.clone(),
        backup_config_service.clone(),
        storage_service.clone(),
        database_service.clone(),
    );

    // Removing a database first clears its backups (refused while one is
    // running), then its healthcheck rows, then its backup config
    {
        type HookFuture = BoxFuture<'static, Result<(), StewardError>>;

        let backups = backup_service.clone();
        database_service.add_remove_hook(Arc::new(move |database_id| -> HookFuture {
            let backups = backups.clone();
            Box::pin(async move { backups.delete_database_backups(database_id).await })
        }));

        let healthchecks = healthcheck_service.clone();
        database_service.add_remove_hook(Arc::new(move |database_id| -> HookFuture {
            let healthchecks = healthchecks.clone();
            Box::pin(async move {
                healthchecks
                    .repository()
                    .delete_for_database(database_id)
                    .await
            })
        }));

        let configs = backup_config_service.clone();
        database_service.add_remove_hook(Arc::new(move |database_id| -> HookFuture {
            let configs = configs.clone();
            Box::pin(async move { configs.delete_config(database_id).await })
        }));

        // Changing a config's storage clears artefacts under the old one
        let backups = backup_service.clone();
        backup_config_service.add_storage_change_hook(Arc::new(
            move |database_id| -> HookFuture {
                let backups = backups.clone();
                Box::pin(async move { backups.delete_database_backups(database_id).await })
            },
        ));
    }

    // Crash recovery runs exactly once, before the periodic loops; any
    // failure here is fatal
    backup_service.fail_backups_in_progress().await?;
    restore_service.fail_restores_in_progress().await?;
    info!("Crash-recovery sweep finished");

    let background_threads: BackgroundThreads = Arc::new(Mutex::new(Vec::new()));
    let mut background_threads_guard = background_threads.lock().await;

    info!("Starting backup scheduler");
    background_threads_guard.push({
        let scheduler = Arc::new(BackupScheduler::new(
            backup_service.clone(),
            backup_config_service.clone(),
            storage_service.clone(),
            heartbeat_updater,
            shutdown_flag.clone(),
        ));
        supervise("backup scheduler", shutdown_flag.clone(), move || {
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        })
    });

    info!("Starting healthcheck worker");
    background_threads_guard.push({
        let worker = Arc::new(HealthcheckWorker::new(
            healthcheck_service.clone(),
            shutdown_flag.clone(),
        ));
        supervise("healthcheck worker", shutdown_flag.clone(), move || {
            let worker = worker.clone();
            async move { worker.run().await }
        })
    });

    std::mem::drop(background_threads_guard);

    let server_port = config.server_port;
    info!("Starting steward liveness server on http://0.0.0.0:{server_port}");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(background_threads.clone()))
            .app_data(web::Data::new(heartbeat_monitor.clone()))
            .service(
                web::scope("/health")
                    .service(background_threads_running)
                    .service(scheduler_ready),
            )
    })
    .workers(1)
    .bind(("0.0.0.0", server_port))?
    .run()
    .await?;

    // Actix stops on SIGINT/SIGTERM; make sure the loops see it too, and
    // give running pipelines a moment to observe the flag
    shutdown_flag.trigger();
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("steward stopped");
    Ok(())
}

/// Runs a loop in its own task and restarts it if it ever panics; the
/// loop itself only returns on shutdown.
fn supervise<F, Fut>(
    name: &'static str,
    shutdown_flag: shutdown::Shutdown,
    make_loop: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tokio::spawn(make_loop()).await {
                Ok(()) => break,
                Err(e) => error!("{name} panicked, restarting in 1 second: {e}"),
            }
            if shutdown_flag.is_triggered() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}
