//! 传输层抽象
//!
//! 下载核心只通过 [`Transport`] 与网络打交道：
//! - `fetch_metadata`：获取资源大小、是否支持 Range、内容哈希和重定向后的地址
//! - `open_range`：打开一个字节范围传输，数据块和结束通知通过事件通道送回
//!
//! 事件通道是有界的，调度循环暂停消费时，传输任务会在发送处阻塞，
//! 由 TCP 背压限制在途数据量。

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub use http::HttpTransport;

/// 事件通道容量（数据块个数）
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// 远程资源信息，每次运行都会重新获取
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    /// 文件大小，None 表示未知
    pub size: Option<u64>,
    /// 服务器是否支持 Range 请求
    pub accept_ranges: bool,
    /// 服务器给出的内容哈希（Content-MD5，十六进制），可能为空
    pub content_hash: String,
    /// 跟随重定向后的最终地址
    pub redirect_url: String,
}

/// 一次范围传输请求
#[derive(Debug, Clone)]
pub struct RangeRequest {
    /// 所属分片
    pub slice_index: usize,
    /// 本次传输编号，用于丢弃已停止传输的迟到事件
    pub transfer_id: u64,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// 起始偏移（含）
    pub start: u64,
    /// 结束偏移（含），None 表示读到连接关闭
    pub end: Option<u64>,
    /// 限速（字节/秒），0 表示不限
    pub rate_limit: u64,
    /// 无数据超时
    pub read_timeout: Option<Duration>,
}

impl RangeRequest {
    /// `Range` 请求头的值；从 0 开始且不限结束时不需要 Range
    pub fn range_header(&self) -> Option<String> {
        match self.end {
            Some(end) => Some(format!("bytes={}-{}", self.start, end)),
            None if self.start > 0 => Some(format!("bytes={}-", self.start)),
            None => None,
        }
    }
}

/// 传输事件
#[derive(Debug)]
pub struct TransferEvent {
    pub slice_index: usize,
    pub transfer_id: u64,
    pub kind: TransferEventKind,
}

#[derive(Debug)]
pub enum TransferEventKind {
    /// 收到一段数据
    Data(Bytes),
    /// 传输结束（成功或失败）
    Finished(Result<(), TransportError>),
}

pub type EventSender = mpsc::Sender<TransferEvent>;
pub type EventReceiver = mpsc::Receiver<TransferEvent>;

/// 创建事件通道
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// 传输错误
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP 请求失败: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP 错误: {0}")]
    HttpStatus(u16),

    /// 服务器忽略了 Range 或返回的起始位置不符
    #[error("服务器未按请求的范围返回数据: 请求起点 {requested}, 状态码 {status}, Content-Range {content_range:?}")]
    RangeNotHonored {
        requested: u64,
        status: u16,
        content_range: Option<String>,
    },

    #[error("读取超时: {0:?} 内未收到数据")]
    ReadTimeout(Duration),

    #[error("传输初始化失败: {0}")]
    Init(String),

    #[error("{0}")]
    Other(String),
}

/// 正在进行的传输
///
/// 取消令牌由传输任务监听；句柄被丢弃时同样会取消传输。
#[derive(Debug)]
pub struct TransferHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TransferHandle {
    pub fn new(token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            token,
            task: Some(task),
        }
    }

    /// 取消传输，不等待任务退出
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.task.take();
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 传输层接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 获取资源信息
    async fn fetch_metadata(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ResourceInfo, TransportError>;

    /// 打开一个范围传输，数据通过 `events` 送回调度循环
    fn open_range(
        &self,
        request: RangeRequest,
        events: EventSender,
    ) -> Result<TransferHandle, TransportError>;

    /// 传输层建议的轮询等待时长，None 表示没有建议
    fn suggested_poll_timeout(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(start: u64, end: Option<u64>) -> RangeRequest {
        RangeRequest {
            slice_index: 0,
            transfer_id: 1,
            url: "http://localhost/file".into(),
            headers: BTreeMap::new(),
            start,
            end,
            rate_limit: 0,
            read_timeout: None,
        }
    }

    #[test]
    fn test_range_header() {
        assert_eq!(request(0, Some(99)).range_header().as_deref(), Some("bytes=0-99"));
        assert_eq!(request(100, None).range_header().as_deref(), Some("bytes=100-"));
        assert_eq!(request(0, None).range_header(), None);
    }

    #[tokio::test]
    async fn test_handle_drop_cancels() {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move { child.cancelled().await });
        let handle = TransferHandle::new(token.clone(), task);
        drop(handle);
        assert!(token.is_cancelled());
    }
}
