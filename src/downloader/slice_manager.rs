//! 分片管理器
//!
//! 负责分片规划、续传索引的加载与保存、数据分发以及最终的完整性校验和重命名。
//! 管理器由调度循环独占，不需要内部加锁；采样任务通过 [`ProgressProbe`] 只读访问进度。

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{DownloadError, DownloadResult};
use super::progress::ProgressProbe;
use super::slice::{Slice, SliceStartParams, SliceStatus};
use super::target_file::TargetFile;
use crate::config::{DownloadConfig, DownloadOptions, HashAlgorithm, HashVerifyPolicy, SlicePolicy};
use crate::hash::HashProvider;
use crate::persistence::{self, IndexExpectation, IndexRejection, ResumeSnapshot, SliceRecord};
use crate::transport::{EventSender, ResourceInfo, Transport, TransportError};

/// 默认分片大小 10MB
pub const DEFAULT_SLICE_SIZE: u64 = 10 * 1024 * 1024;

/// 传输结束后分片的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    Completed,
    /// 重新排队，参数为已失败次数
    Retrying(u32),
    Failed,
}

/// 按文件大小和策略规划分片，返回 `(begin, end)` 列表
///
/// 最后一个分片总是开放结尾；大小未知或不支持 Range 时只有一个 `[0, 末尾)` 分片。
pub fn plan_slices(
    size: Option<u64>,
    accept_ranges: bool,
    policy: SlicePolicy,
) -> Vec<(u64, Option<u64>)> {
    let size = match size {
        Some(s) if accept_ranges && s > 0 => s,
        _ => return vec![(0, None)],
    };

    let (slice_size, count) = match policy {
        SlicePolicy::Auto => {
            if size <= DEFAULT_SLICE_SIZE * 3 / 2 {
                return vec![(0, None)];
            }
            (DEFAULT_SLICE_SIZE, size / DEFAULT_SLICE_SIZE)
        }
        SlicePolicy::FixedSize(n) => {
            let n = n.max(1);
            (n, (size / n).max(1))
        }
        SlicePolicy::FixedNum(k) => {
            // 字节数少于分片数时，每个分片 1 字节
            let k = (k as u64).clamp(1, size);
            (size / k, k)
        }
    };

    (0..count)
        .map(|i| {
            let begin = i * slice_size;
            let end = (i + 1 < count).then(|| begin + slice_size - 1);
            (begin, end)
        })
        .collect()
}

pub struct SliceManager {
    url: String,
    target_path: PathBuf,
    tmp_path: PathBuf,
    index_path: PathBuf,
    options: DownloadOptions,
    info: ResourceInfo,
    slices: Vec<Slice>,
    target_file: Option<TargetFile>,
    hasher: Arc<dyn HashProvider>,
    next_transfer_id: u64,
    finished: bool,
}

impl SliceManager {
    pub fn new(config: &DownloadConfig, info: ResourceInfo, hasher: Arc<dyn HashProvider>) -> Self {
        Self {
            url: config.url.clone(),
            target_path: config.target_path.clone(),
            tmp_path: config.tmp_file_path(),
            index_path: config.index_file_path(),
            options: config.options.clone(),
            info,
            slices: Vec::new(),
            target_file: None,
            hasher,
            next_transfer_id: 0,
            finished: false,
        }
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// 从续传索引恢复分片
    ///
    /// 任何一项校验不通过都返回拒绝原因，由调用方转为全新下载。
    pub fn load_existing_slices(&mut self) -> Result<(), IndexRejection> {
        let expectation = IndexExpectation {
            url: &self.url,
            info: &self.info,
            max_age: self.options.index_max_age(),
            check_content_hash: self.options.resume_check_content_hash,
            check_redirect_url: self.options.resume_check_redirect_url,
        };
        let snapshot = persistence::load_index(&self.index_path, &expectation)?;

        if snapshot.tmp_file_path != self.tmp_path {
            return Err(IndexRejection::TmpPathChanged(snapshot.tmp_file_path));
        }

        let file =
            TargetFile::open(&self.tmp_path).map_err(|source| IndexRejection::TmpFileNotWritable {
                path: self.tmp_path.clone(),
                source,
            })?;

        self.slices = snapshot
            .slices
            .iter()
            .enumerate()
            .map(|(i, r)| Slice::new(i, r.begin, r.end(), r.capacity))
            .collect();
        self.target_file = Some(file);

        let size = self.info.size;
        let mut completed = 0;
        for slice in &mut self.slices {
            if slice_done(slice, size) {
                slice.set_status(SliceStatus::Completed);
                completed += 1;
            }
        }

        info!(
            "✓ 续传索引有效: {} 个分片（{} 个已完成），已下载 {} bytes",
            self.slices.len(),
            completed,
            self.total_downloaded()
        );
        Ok(())
    }

    /// 全新规划分片并创建预分配的临时文件
    pub fn make_slices(&mut self) -> Result<(), DownloadError> {
        let plan = plan_slices(
            self.info.size,
            self.info.accept_ranges,
            self.options.slice_policy,
        );

        let file = TargetFile::create_fixed(&self.tmp_path, self.info.size).map_err(|source| {
            DownloadError::CreateTargetFileFailed {
                path: self.tmp_path.clone(),
                source,
            }
        })?;

        self.slices = plan
            .into_iter()
            .enumerate()
            .map(|(i, (begin, end))| Slice::new(i, begin, end, 0))
            .collect();
        self.target_file = Some(file);

        info!(
            "已规划 {} 个分片 (文件大小: {:?}, 支持 Range: {}, 策略: {:?})",
            self.slices.len(),
            self.info.size,
            self.info.accept_ranges,
            self.options.slice_policy
        );
        Ok(())
    }

    /// 已接收字节总数（含未落盘的缓冲）
    pub fn total_downloaded(&self) -> u64 {
        self.slices.iter().map(|s| s.received()).sum()
    }

    pub fn progress_probe(&self) -> ProgressProbe {
        ProgressProbe::new(
            self.slices.iter().map(|s| s.received_counter()).collect(),
            self.info.size,
        )
    }

    pub fn active_count(&self) -> usize {
        self.slices
            .iter()
            .filter(|s| s.status() == SliceStatus::Active)
            .count()
    }

    /// 等待下载的分片数
    pub fn pending_count(&self) -> usize {
        let size = self.info.size;
        self.slices
            .iter()
            .filter(|s| s.status() == SliceStatus::Unfetched && !slice_done(s, size))
            .count()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// 按大小判断所有分片都已接收完毕（续传时可能一开始就完成）
    pub fn is_fully_received(&self) -> bool {
        let size = self.info.size;
        !self.slices.is_empty() && self.slices.iter().all(|s| slice_done(s, size))
    }

    /// 返回下一个可以启动的分片
    ///
    /// `remove_completed` 为 true 时先把已收满的活跃分片停掉并标记完成。
    pub fn fetch_useful_slice(&mut self, remove_completed: bool) -> Option<usize> {
        let size = self.info.size;
        for slice in &mut self.slices {
            let done = slice_done(slice, size);
            match slice.status() {
                SliceStatus::Active if remove_completed && done => {
                    slice.mark_completed();
                    debug!("分片 #{} 已完成，释放连接", slice.index());
                }
                SliceStatus::Unfetched if done => slice.set_status(SliceStatus::Completed),
                _ => {}
            }
        }

        self.slices
            .iter()
            .position(|s| s.status() == SliceStatus::Unfetched)
    }

    /// 启动分片传输
    ///
    /// # Returns
    /// - `Ok(true)` - 已启动
    /// - `Ok(false)` - 传输层拒绝，分片已按失败处理
    /// - `Err` - 启动前刷写残留缓冲失败
    pub fn start_slice(
        &mut self,
        index: usize,
        transport: &dyn Transport,
        events: EventSender,
        cache_budget: u64,
        rate_budget: u64,
    ) -> Result<bool, DownloadError> {
        let file = self.target_file.as_ref().ok_or(DownloadError::NoAvailableSlice)?;
        let slice = self
            .slices
            .get_mut(index)
            .ok_or(DownloadError::NoAvailableSlice)?;

        let offset = slice.begin() + slice.capacity();
        slice
            .flush(file)
            .map_err(|source| DownloadError::WriteFailed {
                index,
                offset,
                source,
            })?;

        self.next_transfer_id += 1;
        let params = SliceStartParams {
            url: &self.url,
            headers: &self.options.headers,
            transfer_id: self.next_transfer_id,
            cache_budget,
            rate_budget,
            read_timeout: self.options.read_timeout(),
        };

        match slice.start(transport, events, &params) {
            Ok(()) => Ok(true),
            Err(e) => {
                let resumable = self.info.accept_ranges || slice.received() == 0;
                let requeued = slice.mark_failed(self.options.slice_max_retries, resumable);
                warn!(
                    "分片 #{} 启动传输失败: {} ({})",
                    index,
                    e,
                    if requeued { "稍后重试" } else { "放弃" }
                );
                Ok(false)
            }
        }
    }

    /// 分发一段数据到对应分片，迟到的旧传输数据直接丢弃
    pub fn on_data(&mut self, index: usize, transfer_id: u64, data: &[u8]) -> DownloadResult {
        let Some(file) = self.target_file.as_ref() else {
            return Ok(());
        };
        let Some(slice) = self.slices.get_mut(index) else {
            return Ok(());
        };
        if slice.transfer_id() != Some(transfer_id) {
            return Ok(());
        }

        let offset = slice.begin() + slice.received();
        let accepted = slice
            .on_data(file, data)
            .map_err(|source| DownloadError::WriteFailed {
                index,
                offset,
                source,
            })?;
        if accepted.overflowed {
            // 有界分片已收满，多余数据不再需要
            debug!(
                "分片 #{} 已收满，丢弃超出部分 {} bytes",
                index,
                data.len() - accepted.bytes
            );
            slice.mark_completed();
        }
        Ok(())
    }

    /// 处理传输结束事件
    ///
    /// 返回 None 表示事件来自已停止的旧传输。
    pub fn on_transfer_finished(
        &mut self,
        index: usize,
        transfer_id: u64,
        result: Result<(), TransportError>,
    ) -> Option<SliceOutcome> {
        let size = self.info.size;
        let accept_ranges = self.info.accept_ranges;
        let max_retries = self.options.slice_max_retries;

        let slice = self.slices.get_mut(index)?;
        if slice.transfer_id() != Some(transfer_id) {
            return None;
        }

        let error = match result {
            Ok(()) if slice_received_all(slice, size) => {
                slice.mark_completed();
                debug!("分片 #{} 传输完成: {} bytes", index, slice.received());
                return Some(SliceOutcome::Completed);
            }
            Ok(()) => format!("连接提前关闭，已接收 {} bytes", slice.received()),
            Err(e) => e.to_string(),
        };

        let resumable = accept_ranges || slice.received() == 0;
        if slice.mark_failed(max_retries, resumable) {
            warn!(
                "分片 #{} 传输失败（第 {} 次）: {}，稍后重试",
                index,
                slice.retries(),
                error
            );
            Some(SliceOutcome::Retrying(slice.retries()))
        } else {
            warn!(
                "分片 #{} 传输失败（第 {} 次）: {}，放弃该分片",
                index,
                slice.retries(),
                error
            );
            Some(SliceOutcome::Failed)
        }
    }

    /// 停止所有传输，缓冲保留
    pub fn stop_all(&mut self) {
        for slice in &mut self.slices {
            if slice.status() == SliceStatus::Active {
                slice.stop();
                slice.set_status(SliceStatus::Unfetched);
            }
        }
    }

    /// 刷写所有分片缓冲
    ///
    /// 失败的分片只记录日志并继续，返回是否全部成功。
    pub fn flush_all(&mut self) -> bool {
        let Some(file) = self.target_file.as_ref() else {
            return true;
        };
        let mut all_ok = true;
        for slice in &mut self.slices {
            if let Err(e) = slice.flush(file) {
                warn!("分片 #{} 刷写缓冲失败: {}", slice.index(), e);
                all_ok = false;
            }
        }
        all_ok
    }

    /// 当前分片进度快照（只含已落盘字节）
    pub fn snapshot(&self) -> ResumeSnapshot {
        ResumeSnapshot {
            update_time: chrono::Utc::now().timestamp(),
            file_size: ResumeSnapshot::size_to_i64(self.info.size),
            content_hash: self.info.content_hash.clone(),
            url: self.url.clone(),
            redirect_url: self.info.redirect_url.clone(),
            tmp_file_path: self.tmp_path.clone(),
            slices: self
                .slices
                .iter()
                .map(|s| SliceRecord::new(s.begin(), s.end(), s.capacity()))
                .collect(),
        }
    }

    pub fn save_index(&self) -> io::Result<()> {
        if self.finished || self.slices.is_empty() {
            return Ok(());
        }
        persistence::save_index(&self.index_path, &self.snapshot())
    }

    /// 按当前策略决定要比对的哈希值，None 表示跳过校验
    fn expected_hash(&self) -> Option<String> {
        let algorithm = self.options.hash_algorithm;
        let expected = self.options.expected_hash.clone().or_else(|| {
            (algorithm == HashAlgorithm::Md5 && !self.info.content_hash.is_empty())
                .then(|| self.info.content_hash.clone())
        });
        match self.options.hash_verify_policy {
            HashVerifyPolicy::Always => expected,
            HashVerifyPolicy::OnlyWhenSizeUnknown if self.info.size.is_none() => expected,
            HashVerifyPolicy::OnlyWhenSizeUnknown | HashVerifyPolicy::Never => None,
        }
    }

    /// 检查所有分片是否完整，并按策略校验哈希
    ///
    /// 只看已落盘的字节，调用前缓冲必须已刷盘。
    pub fn is_all_slice_completed(&self, check_hash: bool) -> DownloadResult {
        let size = self.info.size;
        let unfinished = self
            .slices
            .iter()
            .filter(|s| !slice_persisted(s, size))
            .count();
        if unfinished > 0 {
            return Err(DownloadError::SliceDownloadFailed { unfinished });
        }

        let downloaded = self.total_downloaded();
        if let Some(expected) = size {
            if downloaded != expected {
                return Err(DownloadError::SizeMismatch {
                    downloaded,
                    expected,
                });
            }
        }

        if !check_hash {
            return Ok(());
        }
        let Some(expected) = self.expected_hash() else {
            debug!("跳过哈希校验");
            return Ok(());
        };

        let algorithm = self.options.hash_algorithm;
        let actual = self
            .hasher
            .compute(&self.tmp_path, algorithm)
            .map_err(DownloadError::HashComputeFailed)?;
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(DownloadError::HashMismatch {
                expected,
                actual,
            });
        }
        info!("✓ {} 校验通过: {}", algorithm.as_str(), actual);
        Ok(())
    }

    /// 结束下载
    ///
    /// 总是先刷缓冲并保存索引。`check_completed` 为 true 时继续校验、
    /// 重命名到目标路径并删除索引。重复调用是安全的。
    pub fn finish_download(&mut self, check_completed: bool) -> DownloadResult {
        if self.finished {
            return Ok(());
        }

        let flushed = self.flush_all();
        let index_result = self.save_index();
        if let Err(e) = &index_result {
            warn!("保存续传索引失败: {}", e);
        }

        if !check_completed {
            index_result.map_err(DownloadError::IndexUpdateFailed)?;
            return if flushed {
                Ok(())
            } else {
                Err(DownloadError::FlushFailed)
            };
        }

        if !flushed {
            return Err(DownloadError::FlushFailed);
        }
        self.is_all_slice_completed(true)?;

        let file = self.target_file.take().ok_or(DownloadError::NoAvailableSlice)?;
        file.rename_to(&self.target_path, true)
            .map_err(|source| DownloadError::RenameFailed {
                from: self.tmp_path.clone(),
                to: self.target_path.clone(),
                source,
            })?;
        self.finished = true;

        if let Err(e) = persistence::delete_index(&self.index_path) {
            warn!("删除续传索引失败: {}", e);
        }
        info!("✓ 下载完成: {:?}", self.target_path);
        Ok(())
    }
}

/// 有界分片收满；开放结尾分片只在大小已知且收到末尾时才算
fn slice_done(slice: &Slice, size: Option<u64>) -> bool {
    if slice.status() == SliceStatus::Completed {
        return true;
    }
    match (slice.len(), size) {
        (Some(len), _) => slice.received() >= len,
        (None, Some(size)) => slice.begin() + slice.received() >= size,
        (None, None) => false,
    }
}

/// 分片的字节是否已全部落盘；大小未知的开放结尾分片以传输正常结束为准
fn slice_persisted(slice: &Slice, size: Option<u64>) -> bool {
    match (slice.end(), size) {
        (Some(_), _) => slice.is_completed(),
        (None, Some(size)) => slice.begin() + slice.capacity() >= size,
        (None, None) => slice.status() == SliceStatus::Completed,
    }
}

/// 传输正常结束时是否拿到了应有的全部数据；大小未知的开放结尾分片以连接关闭为准
fn slice_received_all(slice: &Slice, size: Option<u64>) -> bool {
    match (slice.len(), size) {
        (None, None) => true,
        _ => slice_done(slice, size),
    }
}

impl std::fmt::Debug for SliceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceManager")
            .field("url", &self.url)
            .field("tmp_path", &self.tmp_path)
            .field("slices", &self.slices.len())
            .field("finished", &self.finished)
            .finish()
    }
}
