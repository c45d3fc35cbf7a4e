// 分片：文件中的一段连续字节范围

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::target_file::TargetFile;
use crate::transport::{EventSender, RangeRequest, TransferHandle, Transport, TransportError};

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    /// 等待下载
    Unfetched,
    /// 传输进行中
    Active,
    /// 已完成
    Completed,
    /// 重试次数用尽
    Failed,
}

/// 启动传输所需的参数
#[derive(Debug, Clone)]
pub struct SliceStartParams<'a> {
    pub url: &'a str,
    pub headers: &'a std::collections::BTreeMap<String, String>,
    pub transfer_id: u64,
    /// 分配给该分片的磁盘缓存（字节），0 表示直接写盘
    pub cache_budget: u64,
    /// 分配给该分片的限速（字节/秒），0 表示不限
    pub rate_budget: u64,
    pub read_timeout: Option<std::time::Duration>,
}

/// 一次 `on_data` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// 实际接受的字节数
    pub bytes: usize,
    /// 是否有超出分片结尾的数据被丢弃
    pub overflowed: bool,
}

/// 分片
///
/// `begin` 为起始偏移（含）；`end` 为结束偏移（含），`None` 表示开放结尾；
/// `capacity` 为已落盘的字节数，下一个需要的字节是 `begin + capacity + 缓冲长度`。
#[derive(Debug)]
pub struct Slice {
    index: usize,
    begin: u64,
    end: Option<u64>,
    capacity: u64,
    status: SliceStatus,
    retries: u32,
    buffer: Vec<u8>,
    buffer_limit: usize,
    /// 已接收字节（落盘 + 缓冲），供采样任务无锁读取，只增不减
    received: Arc<AtomicU64>,
    transfer: Option<(u64, TransferHandle)>,
}

impl Slice {
    pub fn new(index: usize, begin: u64, end: Option<u64>, capacity: u64) -> Self {
        Self {
            index,
            begin,
            end,
            capacity,
            status: SliceStatus::Unfetched,
            retries: 0,
            buffer: Vec::new(),
            buffer_limit: 0,
            received: Arc::new(AtomicU64::new(capacity)),
            transfer: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// 已落盘字节数
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn buffered(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// 已接收字节数（含缓冲）
    pub fn received(&self) -> u64 {
        self.capacity + self.buffered()
    }

    pub fn received_counter(&self) -> Arc<AtomicU64> {
        self.received.clone()
    }

    pub fn status(&self) -> SliceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SliceStatus) {
        self.status = status;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// 分片长度，开放结尾返回 None
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.begin + 1)
    }

    /// 有界分片的字节全部落盘才算完成；开放结尾分片只能由外部判定
    pub fn is_completed(&self) -> bool {
        self.len() == Some(self.capacity)
    }

    /// 尚未接收的字节数，开放结尾返回 None
    fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.received()))
    }

    /// 当前传输编号
    pub fn transfer_id(&self) -> Option<u64> {
        self.transfer.as_ref().map(|(id, _)| *id)
    }

    /// 打开 `[begin + capacity, end]` 的范围传输
    ///
    /// 调用前缓冲必须已刷盘。
    pub fn start(
        &mut self,
        transport: &dyn Transport,
        events: EventSender,
        params: &SliceStartParams<'_>,
    ) -> Result<(), TransportError> {
        debug_assert!(self.buffer.is_empty());

        let request = RangeRequest {
            slice_index: self.index,
            transfer_id: params.transfer_id,
            url: params.url.to_string(),
            headers: params.headers.clone(),
            start: self.begin + self.capacity,
            end: self.end,
            rate_limit: params.rate_budget,
            read_timeout: params.read_timeout,
        };
        let handle = transport.open_range(request, events)?;

        self.buffer_limit = params.cache_budget.min(usize::MAX as u64) as usize;
        if self.buffer_limit > 0 && self.buffer.capacity() < self.buffer_limit {
            self.buffer.reserve(self.buffer_limit - self.buffer.len());
        }
        self.transfer = Some((params.transfer_id, handle));
        self.status = SliceStatus::Active;

        debug!(
            "分片 #{} 开始传输: [{}, {:?}], 起点 {}, 缓存 {} bytes, 限速 {} B/s",
            self.index,
            self.begin,
            self.end,
            self.begin + self.capacity,
            params.cache_budget,
            params.rate_budget
        );
        Ok(())
    }

    /// 接收一段数据
    ///
    /// 超出分片结尾的部分被截断；无缓冲时直接写盘并刷盘，
    /// 有缓冲时先攒在内存里，放不下再刷。
    pub fn on_data(&mut self, file: &TargetFile, data: &[u8]) -> io::Result<Accepted> {
        let mut data = data;
        let mut overflowed = false;
        if let Some(remaining) = self.remaining() {
            if data.len() as u64 > remaining {
                warn!(
                    "分片 #{} 收到超出范围的数据: 剩余 {} bytes, 收到 {} bytes，多余部分已丢弃",
                    self.index,
                    remaining,
                    data.len()
                );
                data = &data[..remaining as usize];
                overflowed = true;
            }
        }
        if data.is_empty() {
            return Ok(Accepted {
                bytes: 0,
                overflowed,
            });
        }

        if self.buffer_limit == 0 {
            self.write_through(file, data)?;
        } else {
            if self.buffer.len() + data.len() > self.buffer_limit {
                self.flush(file)?;
            }
            if data.len() > self.buffer_limit {
                self.write_through(file, data)?;
            } else {
                self.buffer.extend_from_slice(data);
                self.received.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
        }

        Ok(Accepted {
            bytes: data.len(),
            overflowed,
        })
    }

    fn write_through(&mut self, file: &TargetFile, data: &[u8]) -> io::Result<()> {
        let offset = self.begin + self.capacity;
        file.write_at(offset, data)?;
        file.flush()?;
        self.capacity += data.len() as u64;
        self.received.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// 把缓冲写到 `begin + capacity` 并刷盘，成功后才推进 capacity
    pub fn flush(&mut self, file: &TargetFile) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let offset = self.begin + self.capacity;
        file.write_at(offset, &self.buffer)?;
        file.flush()?;
        self.capacity += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// 停止传输；缓冲保留，由调用方决定何时刷盘
    pub fn stop(&mut self) {
        if let Some((id, mut handle)) = self.transfer.take() {
            handle.cancel();
            debug!("分片 #{} 传输已停止 (transfer={})", self.index, id);
        }
    }

    /// 传输失败后的状态迁移
    ///
    /// # Returns
    /// - `true` - 重新排队等待重试
    /// - `false` - 重试次数用尽，标记失败
    pub fn mark_failed(&mut self, max_retries: u32, resumable: bool) -> bool {
        self.stop();
        self.retries += 1;
        if resumable && self.retries <= max_retries {
            self.status = SliceStatus::Unfetched;
            true
        } else {
            self.status = SliceStatus::Failed;
            false
        }
    }

    pub fn mark_completed(&mut self) {
        self.stop();
        self.status = SliceStatus::Completed;
    }
}
