//! 日志系统
//!
//! 控制台始终输出；启用文件日志后额外写入 `logs/slicedl.YYYY-MM-DD-HHMMSS.log`，
//! 超过单文件上限时滚动为 `_1`、`_2`…，启动时清理超过保留天数的旧文件。

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "slicedl.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RotatingState {
    dir: PathBuf,
    /// 进程启动时间，同一次运行的所有滚动文件共用
    started_at: String,
    file: File,
    index: u32,
    written: u64,
    max_file_size: u64,
}

impl RotatingState {
    fn file_path(dir: &Path, started_at: &str, index: u32) -> PathBuf {
        let name = match index {
            0 => format!("{}{}{}", LOG_FILE_PREFIX, started_at, LOG_FILE_SUFFIX),
            n => format!("{}{}_{}{}", LOG_FILE_PREFIX, started_at, n, LOG_FILE_SUFFIX),
        };
        dir.join(name)
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件总是可写，单条超长日志不会无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open(&Self::file_path(&self.dir, &self.started_at, self.index))?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct RotatingLogWriter {
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingLogWriter {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> io::Result<Self> {
        let dir = dir.into();
        let started_at = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = RotatingState::open(&RotatingState::file_path(&dir, &started_at, 0))?;
        Ok(Self {
            state: Arc::new(Mutex::new(RotatingState {
                dir,
                started_at,
                file,
                index: 0,
                written: 0,
                max_file_size: max_file_size.max(1),
            })),
        })
    }

    /// 当前写入的文件路径
    pub fn current_path(&self) -> PathBuf {
        let state = self.state.lock();
        RotatingState::file_path(&state.dir, &state.started_at, state.index)
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

/// 日志守卫，drop 时刷出文件日志的剩余内容
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别。重复初始化不会 panic，只保留第一次的订阅器。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let file_writer = if config.enabled {
        match fs::create_dir_all(&config.log_dir)
            .and_then(|_| RotatingLogWriter::new(&config.log_dir, config.max_file_size))
        {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}，仅输出到控制台",
                    config.log_dir, e
                );
                None
            }
        }
    } else {
        None
    };

    let Some(writer) = file_writer else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );
    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 日期取自文件名；文件名无法解析时按修改时间判断。
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX) {
            continue;
        }

        let expired = match date_from_filename(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_mtime(&entry, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}

/// `slicedl.YYYY-MM-DD-HHMMSS[_N].log` -> 日期
fn date_from_filename(name: &str) -> Option<chrono::NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_mtime(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}
