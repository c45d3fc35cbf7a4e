// 测试用内存传输：按请求范围从内存数据中切片返回

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{
    EventSender, RangeRequest, ResourceInfo, TransferEvent, TransferEventKind, TransferHandle,
    Transport, TransportError,
};

/// 记录下来的一次范围请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRange {
    pub slice_index: usize,
    pub start: u64,
    pub end: Option<u64>,
}

pub struct MockTransport {
    data: Arc<Vec<u8>>,
    info: ResourceInfo,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    /// 每次传输最多发送的字节数，之后挂起直到被取消
    stall_after: Option<u64>,
    /// 服务器忽略非 0 起点的 Range
    ignore_range: bool,
    metadata_failures: AtomicU32,
    /// 前 N 次传输发送一半数据后失败
    transfer_failures: AtomicU32,
    metadata_calls: AtomicU32,
    requests: Arc<Mutex<Vec<RecordedRange>>>,
}

impl MockTransport {
    pub fn new(data: Vec<u8>) -> Self {
        let info = ResourceInfo {
            size: Some(data.len() as u64),
            accept_ranges: true,
            content_hash: String::new(),
            redirect_url: "http://mock.local/file.bin".to_string(),
        };
        Self {
            data: Arc::new(data),
            info,
            chunk_size: 16 * 1024,
            chunk_delay: None,
            stall_after: None,
            ignore_range: false,
            metadata_failures: AtomicU32::new(0),
            transfer_failures: AtomicU32::new(0),
            metadata_calls: AtomicU32::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_info(mut self, f: impl FnOnce(&mut ResourceInfo)) -> Self {
        f(&mut self.info);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_stall_after(mut self, bytes: u64) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    pub fn with_ignore_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    pub fn with_metadata_failures(self, times: u32) -> Self {
        self.metadata_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_transfer_failures(self, times: u32) -> Self {
        self.transfer_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRange> {
        self.requests.lock().clone()
    }

    pub fn metadata_calls(&self) -> u32 {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_metadata(
        &self,
        _url: &str,
        _headers: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<ResourceInfo, TransportError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.metadata_failures) {
            return Err(TransportError::HttpStatus(503));
        }
        Ok(self.info.clone())
    }

    fn open_range(
        &self,
        request: RangeRequest,
        events: EventSender,
    ) -> Result<TransferHandle, TransportError> {
        self.requests.lock().push(RecordedRange {
            slice_index: request.slice_index,
            start: request.start,
            end: request.end,
        });

        let token = CancellationToken::new();
        let task_token = token.clone();
        let data = self.data.clone();
        let chunk_size = self.chunk_size;
        let chunk_delay = self.chunk_delay;
        let stall_after = self.stall_after;
        let fail = Self::take_failure(&self.transfer_failures);
        let range_ignored = self.ignore_range && request.start > 0;

        let task = tokio::spawn(async move {
            let send = |kind| {
                events.send(TransferEvent {
                    slice_index: request.slice_index,
                    transfer_id: request.transfer_id,
                    kind,
                })
            };

            if range_ignored {
                let err = TransportError::RangeNotHonored {
                    requested: request.start,
                    status: 200,
                    content_range: None,
                };
                let _ = send(TransferEventKind::Finished(Err(err))).await;
                return;
            }

            let total = data.len() as u64;
            let start = request.start.min(total) as usize;
            let end = request.end.map(|e| e + 1).unwrap_or(total).min(total) as usize;
            let mut body = &data[start..end];
            if fail {
                body = &body[..body.len() / 2];
            }

            let mut sent = 0u64;
            for piece in body.chunks(chunk_size) {
                if task_token.is_cancelled() {
                    return;
                }
                if let Some(limit) = stall_after {
                    if sent >= limit {
                        task_token.cancelled().await;
                        return;
                    }
                }
                let piece = match stall_after {
                    Some(limit) if sent + piece.len() as u64 > limit => {
                        &piece[..(limit - sent) as usize]
                    }
                    _ => piece,
                };
                if let Some(delay) = chunk_delay {
                    tokio::select! {
                        _ = task_token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                sent += piece.len() as u64;
                let event = TransferEventKind::Data(Bytes::copy_from_slice(piece));
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    r = send(event) => if r.is_err() { return },
                }
            }

            if let Some(limit) = stall_after {
                if sent >= limit {
                    task_token.cancelled().await;
                    return;
                }
            }

            let result = if fail {
                Err(TransportError::Other("连接被重置".to_string()))
            } else {
                Ok(())
            };
            if !task_token.is_cancelled() {
                let _ = send(TransferEventKind::Finished(result)).await;
            }
        });

        Ok(TransferHandle::new(token, task))
    }
}
