use std::sync::Arc;

use configs::{AppConfig, LogFormat};
use dotenvy::dotenv;
use storage::{BackingStore, JsonFileBackingStore, StorageOptions, StorageService};
use tracing::{error, info, warn};
use uuid::Uuid;

fn init_logging(format: LogFormat) {
    match format {
        LogFormat::Compact => common::utils::logging::init_logging_default(),
        LogFormat::Json => common::utils::logging::init_logging_json(),
    }
    info!(service = "storaged", event = "logger_init", "tracing subscriber initialized");
}

async fn open_backing_store(cfg: &AppConfig) -> anyhow::Result<Option<Arc<dyn BackingStore>>> {
    let dir = cfg.storage.local_storage_directory.as_deref();
    common::env::ensure_storage_dir(dir).await?;
    let Some(dir) = dir else { return Ok(None) };
    let store: Arc<dyn BackingStore> = Arc::new(JsonFileBackingStore::new(dir).await?);
    Ok(Some(store))
}

fn main() -> std::process::ExitCode {
    // 提前加载 .env，使得 RUST_LOG / CONFIG_PATH / STORAGE_DIR 生效
    dotenv().ok();

    // 配置读取失败时退回默认值（仅内存模式），日志初始化后再报告
    let (cfg, cfg_error) = match AppConfig::load_and_validate() {
        Ok(cfg) => (cfg, None),
        Err(e) => {
            let mut cfg = AppConfig::default();
            cfg.storage.normalize_from_env();
            (cfg, Some(e))
        }
    };
    init_logging(cfg.logging.format);
    if let Some(e) = cfg_error {
        warn!(service = "storaged", event = "config_fallback", error = %e, "using default configuration");
    }

    let service_id = Uuid::new_v4();
    let pid = std::process::id();
    let version = env!("CARGO_PKG_VERSION");

    // Panic 钩子：捕获异常并输出错误日志，便于排查问题
    std::panic::set_hook(Box::new({
        let service_id = service_id;
        move |info| {
            error!(
                service = "storaged",
                event = "panic",
                %service_id,
                pid,
                message = %info,
                "unhandled panic occurred"
            );
        }
    }));

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(service = "storaged", event = "runtime_build_failed", error = %e, "failed to build tokio runtime");
            return std::process::ExitCode::FAILURE;
        }
    };

    info!(
        service = "storaged",
        event = "start",
        %service_id,
        pid,
        version,
        storage_dir = cfg.storage.local_storage_directory.as_deref().unwrap_or("<memory>"),
        "storage service starting"
    );

    rt.block_on(async move {
        let store = match open_backing_store(&cfg).await {
            Ok(store) => store,
            Err(e) => {
                error!(service = "storaged", event = "backing_store_failed", error = %e, "cannot open local storage directory");
                return std::process::ExitCode::FAILURE;
            }
        };
        let service = match StorageService::start(StorageOptions::from(&cfg.storage), store) {
            Ok(service) => service,
            Err(e) => {
                error!(service = "storaged", event = "start_failed", error = %e, code = e.code(), "storage worker failed to start");
                return std::process::ExitCode::FAILURE;
            }
        };

        if cfg.admin.enabled {
            if let Err(e) = common::admin_http::spawn_admin_server(&cfg.admin.addr, common::admin_http::encode_metrics) {
                warn!(service = "storaged", event = "admin_failed", error = %e, "admin server not started");
            }
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(service = "storaged", event = "signal_failed", error = %e, "cannot listen for Ctrl+C");
        }
        info!(service = "storaged", event = "shutdown_signal", %service_id, pid, "received Ctrl+C, shutting down");

        // shutdown 会阻塞直到 worker 处理完队列并关闭所有数据库
        match tokio::task::spawn_blocking(move || service.shutdown()).await {
            Ok(()) => {
                info!(service = "storaged", event = "stop", %service_id, pid, "storage service stopped");
                std::process::ExitCode::SUCCESS
            }
            Err(e) => {
                error!(service = "storaged", event = "shutdown_join_error", error = %e, "shutdown task failed");
                std::process::ExitCode::FAILURE
            }
        }
    })
}
