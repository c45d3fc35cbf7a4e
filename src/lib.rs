// slicedl
// 多连接分片下载库：断点续传、限速、完整性校验

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 传输层（HTTP 及其抽象）
pub mod transport;

// 哈希校验
pub mod hash;

// 续传索引持久化
pub mod persistence;

// 下载引擎模块
pub mod downloader;

// 导出常用类型
pub use config::{
    AppConfig, DownloadConfig, DownloadOptions, HashAlgorithm, HashVerifyPolicy, LogConfig,
    SlicePolicy, UncompletedSliceSavePolicy,
};
pub use downloader::{
    DownloadCallbacks, DownloadError, DownloadResult, Downloader, SessionState,
};
pub use hash::{DigestHashProvider, HashProvider};
pub use transport::{HttpTransport, ResourceInfo, Transport, TransportError};
