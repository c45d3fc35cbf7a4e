use anyhow::Context;
use slicedl::{
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    logging, DownloadCallbacks, DownloadConfig, Downloader,
};
use std::sync::Arc;
use tracing::info;

const USAGE: &str = "用法: slicedl <URL> <保存路径> [配置文件]";

/// 加载日志配置
///
/// 日志需要在完整配置加载之前初始化，所以单独读取 `[log]` 段，失败时用默认值
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }
    let config_path = args.get(2).map(String::as_str).unwrap_or(DEFAULT_CONFIG_PATH);

    // 🔥 先初始化日志（必须保持 _log_guard 存活）
    let log_config = load_log_config(config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("slicedl v{} 启动", env!("CARGO_PKG_VERSION"));

    let app_config = if std::path::Path::new(config_path).exists() {
        AppConfig::load_from_file(config_path)
            .await
            .with_context(|| format!("加载配置文件失败: {}", config_path))?
    } else {
        AppConfig::load_or_default(config_path).await
    };

    let config = DownloadConfig::new(&args[0], &args[1], app_config.download);

    let callbacks = DownloadCallbacks {
        on_progress: Some(Arc::new(|total: Option<u64>, downloaded: u64| match total {
            Some(total) if total > 0 => info!(
                "进度: {} / {} ({:.1}%)",
                format_size(downloaded),
                format_size(total),
                downloaded as f64 * 100.0 / total as f64
            ),
            _ => info!("进度: {}", format_size(downloaded)),
        })),
        on_speed: Some(Arc::new(|speed: u64| {
            tracing::debug!("速度: {}/s", format_size(speed));
        })),
        ..Default::default()
    };

    let downloader = Arc::new(
        Downloader::with_http_transport(config)
            .context("初始化 HTTP 传输失败")?
            .with_callbacks(callbacks),
    );
    let mut handle = downloader.spawn();

    // 🔥 Ctrl+C 时停止下载并等待索引落盘
    let result = tokio::select! {
        result = &mut handle => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，正在停止下载...");
            downloader.stop();
            handle.await?
        }
    };

    result.context("下载失败")?;
    info!("已保存到: {:?}", downloader.config().target_path);
    Ok(())
}
