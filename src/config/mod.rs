// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::downloader::DownloadError;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 线程数上限
pub const MAX_THREAD_NUM: usize = 100;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载默认参数（命令行只提供 URL 和目标路径）
    #[serde(default)]
    pub download: DownloadOptions,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 分片策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SlicePolicy {
    /// 小文件单分片，大文件按默认分片大小切分
    #[default]
    Auto,
    /// 固定分片大小（字节）
    FixedSize(u64),
    /// 固定分片数量
    FixedNum(u32),
}

/// 哈希校验策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashVerifyPolicy {
    /// 只要有可比对的哈希就校验
    #[default]
    Always,
    /// 仅在文件大小未知时校验
    OnlyWhenSizeUnknown,
    /// 不校验
    Never,
}

/// 哈希算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
    Crc32,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Crc32 => "crc32",
        }
    }
}

/// 未完成下载的临时文件保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UncompletedSliceSavePolicy {
    /// 任何非成功结果都删除临时文件和续传索引
    AlwaysDiscard,
    /// 除真正的传输失败外都保留，供下次续传
    #[default]
    SaveExceptFailed,
}

/// 下载参数（除 URL 和目标路径外的全部会话设置）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// 并发连接数（1..=100）
    #[serde(default = "default_thread_num")]
    pub thread_num: usize,
    /// 分片策略
    #[serde(default)]
    pub slice_policy: SlicePolicy,
    /// 整个会话的磁盘缓存预算（字节），按活跃分片数均分，0 表示直接写盘
    #[serde(default = "default_disk_cache_size")]
    pub disk_cache_size: u64,
    /// 全局最大下载速度（字节/秒），按活跃分片数均分，0 表示不限速
    #[serde(default)]
    pub max_download_speed: u64,
    /// 哈希校验策略
    #[serde(default)]
    pub hash_verify_policy: HashVerifyPolicy,
    /// 哈希算法
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    /// 期望的哈希值（十六进制）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// 续传索引最大有效期（秒），None 表示永不过期
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_max_age_secs: Option<u64>,
    /// 获取文件信息的最大尝试次数
    #[serde(default = "default_fetch_info_retry_times")]
    pub fetch_info_retry_times: u32,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 读取超时（秒），连接在该时长内无数据视为失败，0 表示不检测
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 附加 HTTP 请求头
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// 代理地址（http:// 或 socks5://）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// 未完成下载的临时文件保留策略
    #[serde(default)]
    pub uncompleted_slice_save_policy: UncompletedSliceSavePolicy,
    /// 续传时是否比对服务器内容哈希
    #[serde(default = "default_true")]
    pub resume_check_content_hash: bool,
    /// 续传时是否比对重定向后的 URL
    #[serde(default)]
    pub resume_check_redirect_url: bool,
    /// 单个分片失败后的最大重试次数
    #[serde(default = "default_slice_max_retries")]
    pub slice_max_retries: u32,
}

fn default_thread_num() -> usize {
    4
}

fn default_disk_cache_size() -> u64 {
    20 * 1024 * 1024
}

fn default_fetch_info_retry_times() -> u32 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_slice_max_retries() -> u32 {
    3
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            thread_num: default_thread_num(),
            slice_policy: SlicePolicy::default(),
            disk_cache_size: default_disk_cache_size(),
            max_download_speed: 0,
            hash_verify_policy: HashVerifyPolicy::default(),
            hash_algorithm: HashAlgorithm::default(),
            expected_hash: None,
            index_max_age_secs: None,
            fetch_info_retry_times: default_fetch_info_retry_times(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            headers: BTreeMap::new(),
            proxy: None,
            uncompleted_slice_save_policy: UncompletedSliceSavePolicy::default(),
            resume_check_content_hash: true,
            resume_check_redirect_url: false,
            slice_max_retries: default_slice_max_retries(),
        }
    }
}

impl DownloadOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 读取超时，0 表示不检测
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    pub fn index_max_age(&self) -> Option<Duration> {
        self.index_max_age_secs.map(Duration::from_secs)
    }
}

/// 单次下载会话配置，运行期间只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 资源 URL
    pub url: String,
    /// 最终保存路径
    pub target_path: PathBuf,
    /// 其余会话参数
    #[serde(flatten)]
    pub options: DownloadOptions,
    /// 协作式取消信号，每次运行在其上派生子令牌
    #[serde(skip)]
    pub cancel_token: CancellationToken,
}

impl DownloadConfig {
    pub fn new(url: impl Into<String>, target_path: impl Into<PathBuf>, options: DownloadOptions) -> Self {
        Self {
            url: url.into(),
            target_path: target_path.into(),
            options,
            cancel_token: CancellationToken::new(),
        }
    }

    /// 下载过程中使用的临时文件路径：`<target>.part`
    pub fn tmp_file_path(&self) -> PathBuf {
        append_extension(&self.target_path, "part")
    }

    /// 续传索引路径：`<target>.resumeindex`
    pub fn index_file_path(&self) -> PathBuf {
        append_extension(&self.target_path, "resumeindex")
    }

    /// 在任何 I/O 之前校验参数
    pub fn validate(&self) -> Result<(), DownloadError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(DownloadError::InvalidUrl("URL 为空".to_string()));
        }
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!(
                "不支持的协议: {}",
                parsed.scheme()
            )));
        }

        if self.target_path.as_os_str().is_empty()
            || self.target_path.file_name().is_none()
            || self.target_path.is_dir()
        {
            return Err(DownloadError::InvalidTargetPath(self.target_path.clone()));
        }

        let opts = &self.options;
        if opts.thread_num == 0 || opts.thread_num > MAX_THREAD_NUM {
            return Err(DownloadError::InvalidThreadNum(opts.thread_num));
        }

        match opts.slice_policy {
            SlicePolicy::FixedSize(0) => {
                return Err(DownloadError::InvalidSlicePolicy(
                    "固定分片大小不能为 0".to_string(),
                ))
            }
            SlicePolicy::FixedNum(0) => {
                return Err(DownloadError::InvalidSlicePolicy(
                    "固定分片数量不能为 0".to_string(),
                ))
            }
            _ => {}
        }

        if let Some(expected) = &opts.expected_hash {
            if expected.trim().is_empty() {
                return Err(DownloadError::InvalidHashPolicy(
                    "期望哈希值为空".to_string(),
                ));
            }
            if opts.hash_verify_policy == HashVerifyPolicy::Never {
                tracing::warn!("已设置期望哈希值，但校验策略为 never，将不会校验");
            }
        }

        if opts.connect_timeout_secs == 0 {
            return Err(DownloadError::InvalidTimeout(
                "连接超时不能为 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        if config.download.thread_num == 0 || config.download.thread_num > MAX_THREAD_NUM {
            anyhow::bail!(
                "配置文件中的线程数无效: {}（范围 1-{}）",
                config.download.thread_num,
                MAX_THREAD_NUM
            );
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }
                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    fn config_in(dir: &TempDir) -> DownloadConfig {
        DownloadConfig::new(
            "https://example.com/file.bin",
            dir.path().join("file.bin"),
            DownloadOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.thread_num = 8;
        config.download.slice_policy = SlicePolicy::FixedNum(6);
        config.download.headers.insert("User-Agent".into(), "slicedl".into());
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download.thread_num, 8);
        assert_eq!(loaded.download.slice_policy, SlicePolicy::FixedNum(6));
        assert_eq!(loaded.download.headers.get("User-Agent").unwrap(), "slicedl");
        assert_eq!(loaded.log.level, "info");
    }

    #[tokio::test]
    async fn test_load_rejects_bad_thread_num() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[download]\nthread_num = 0\n").unwrap();
        let path = temp_file.path().to_str().unwrap();
        assert!(AppConfig::load_from_file(path).await.is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            max_download_speed = 1048576
            slice_policy = { type = "fixed_size", value = 4096 }
            "#,
        )
        .unwrap();
        assert_eq!(config.download.max_download_speed, 1024 * 1024);
        assert_eq!(config.download.slice_policy, SlicePolicy::FixedSize(4096));
        assert_eq!(config.download.thread_num, 4);
        assert_eq!(config.download.fetch_info_retry_times, 3);
        assert!(config.download.resume_check_content_hash);
        assert!(!config.log.enabled);
    }

    #[test]
    fn test_sidecar_paths() {
        let config = DownloadConfig::new(
            "http://example.com/a.iso",
            "/data/a.iso",
            DownloadOptions::default(),
        );
        assert_eq!(config.tmp_file_path(), PathBuf::from("/data/a.iso.part"));
        assert_eq!(
            config.index_file_path(),
            PathBuf::from("/data/a.iso.resumeindex")
        );
    }

    #[test]
    fn test_validate() {
        let dir = TempDir::new().unwrap();
        assert!(config_in(&dir).validate().is_ok());

        let mut bad_url = config_in(&dir);
        bad_url.url = "not a url".into();
        assert!(matches!(bad_url.validate(), Err(DownloadError::InvalidUrl(_))));

        let mut ftp = config_in(&dir);
        ftp.url = "ftp://example.com/a".into();
        assert!(matches!(ftp.validate(), Err(DownloadError::InvalidUrl(_))));

        let mut dir_target = config_in(&dir);
        dir_target.target_path = dir.path().to_path_buf();
        assert!(matches!(
            dir_target.validate(),
            Err(DownloadError::InvalidTargetPath(_))
        ));

        let mut threads = config_in(&dir);
        threads.options.thread_num = 101;
        assert!(matches!(
            threads.validate(),
            Err(DownloadError::InvalidThreadNum(101))
        ));

        let mut policy = config_in(&dir);
        policy.options.slice_policy = SlicePolicy::FixedNum(0);
        assert!(matches!(
            policy.validate(),
            Err(DownloadError::InvalidSlicePolicy(_))
        ));

        let mut timeout = config_in(&dir);
        timeout.options.connect_timeout_secs = 0;
        assert!(matches!(
            timeout.validate(),
            Err(DownloadError::InvalidTimeout(_))
        ));
    }
}
