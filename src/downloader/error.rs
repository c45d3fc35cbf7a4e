//! 下载错误类型
//!
//! 一次下载只产生一个最终结果：`Ok(())` 表示文件已校验并重命名到目标路径，
//! 其余情况都归入 [`DownloadError`] 的某个变体。

use std::path::PathBuf;
use thiserror::Error;

use crate::transport::TransportError;

/// 一次下载会话的最终结果
pub type DownloadResult = Result<(), DownloadError>;

/// 下载错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// URL 为空、无法解析或协议不受支持
    #[error("无效的下载链接: {0}")]
    InvalidUrl(String),

    /// 目标路径为空或指向目录
    #[error("无效的目标路径: {0:?}")]
    InvalidTargetPath(PathBuf),

    /// 线程数超出 1..=100
    #[error("无效的线程数: {0}")]
    InvalidThreadNum(usize),

    /// 分片策略参数为 0
    #[error("无效的分片策略: {0}")]
    InvalidSlicePolicy(String),

    /// 校验策略要求哈希但未提供
    #[error("无效的哈希校验策略: {0}")]
    InvalidHashPolicy(String),

    /// 连接超时为 0
    #[error("无效的网络超时设置: {0}")]
    InvalidTimeout(String),

    /// 会话已在下载或暂停中
    #[error("已在下载中")]
    AlreadyDownloading,

    /// 多次重试后仍无法获取资源信息
    #[error("获取文件信息失败（已重试 {attempts} 次）: {source}")]
    FetchInfoFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// 无法创建或预分配目标临时文件
    #[error("创建目标文件失败 {path:?}: {source}")]
    CreateTargetFileFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 无法构建传输层（如代理地址无效）
    #[error("传输初始化失败: {0}")]
    TransportInit(#[source] TransportError),

    /// 所有分片都无法启动
    #[error("没有可用的分片")]
    NoAvailableSlice,

    /// 写盘或刷盘失败
    #[error("写入分片 #{index} 失败 (offset={offset}): {source}")]
    WriteFailed {
        index: usize,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// 结束时部分分片缓冲刷盘失败
    #[error("刷写缓冲失败")]
    FlushFailed,

    /// 有分片重试次数用尽或未能下载完整
    #[error("{unfinished} 个分片未能下载完成")]
    SliceDownloadFailed { unfinished: usize },

    /// 已下载字节数与文件大小不一致
    #[error("文件大小不匹配: 已下载 {downloaded} bytes, 期望 {expected} bytes")]
    SizeMismatch { downloaded: u64, expected: u64 },

    /// 计算哈希失败
    #[error("计算哈希失败: {0}")]
    HashComputeFailed(#[source] std::io::Error),

    /// 哈希不一致
    #[error("哈希校验未通过: 期望 {expected}, 实际 {actual}")]
    HashMismatch { expected: String, actual: String },

    /// 临时文件重命名失败
    #[error("重命名临时文件失败 {from:?} -> {to:?}: {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 续传索引写入失败
    #[error("更新续传索引失败: {0}")]
    IndexUpdateFailed(#[source] std::io::Error),

    /// 后台收尾任务异常退出
    #[error("内部错误: {0}")]
    Internal(String),

    /// 用户取消
    #[error("下载已取消")]
    Canceled,

    /// 用户取消，但取消时续传索引写入失败，下次无法续传
    #[error("下载已取消，但续传索引更新失败")]
    CanceledIndexUpdateFailed,
}

impl DownloadError {
    /// 是否属于用户取消（含索引更新失败的取消）
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled | Self::CanceledIndexUpdateFailed)
    }

    /// 是否为传输或校验阶段的真正失败，临时文件已不可信或无法继续
    pub fn is_transfer_failure(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableSlice
                | Self::WriteFailed { .. }
                | Self::FlushFailed
                | Self::SliceDownloadFailed { .. }
                | Self::SizeMismatch { .. }
                | Self::HashMismatch { .. }
        )
    }

    /// 是否为参数校验类错误（不会产生任何文件）
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_)
                | Self::InvalidTargetPath(_)
                | Self::InvalidThreadNum(_)
                | Self::InvalidSlicePolicy(_)
                | Self::InvalidHashPolicy(_)
                | Self::InvalidTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_variants() {
        assert!(DownloadError::Canceled.is_canceled());
        assert!(DownloadError::CanceledIndexUpdateFailed.is_canceled());
        assert!(!DownloadError::NoAvailableSlice.is_canceled());
    }

    #[test]
    fn test_display_contains_sizes() {
        let err = DownloadError::SizeMismatch {
            downloaded: 10,
            expected: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("20"));
        assert!(!err.is_invalid_input());
        assert!(DownloadError::InvalidThreadNum(0).is_invalid_input());
    }

    #[test]
    fn test_transfer_failures() {
        assert!(DownloadError::SliceDownloadFailed { unfinished: 2 }.is_transfer_failure());
        assert!(DownloadError::HashMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_transfer_failure());
        assert!(!DownloadError::Canceled.is_transfer_failure());
        assert!(!DownloadError::FetchInfoFailed {
            attempts: 3,
            source: TransportError::HttpStatus(503)
        }
        .is_transfer_failure());
    }
}
