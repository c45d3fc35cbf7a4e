//! 下载会话
//!
//! 一次 `start()` 的完整流程：
//! 1. 校验参数
//! 2. 获取资源信息（带重试，可被取消）
//! 3. 大小为 0 时直接创建空文件
//! 4. 尝试续传索引，不可用则重新规划分片
//! 5. 启动初始并发窗口，进入事件循环：分发数据、补位、每 10 秒保存一次索引
//! 6. 收尾：刷盘、保存索引、校验、重命名
//! 7. 按保留策略清理临时文件，回调最终结果
//!
//! 调度循环是唯一修改分片的地方；暂停、停止和查询都只通过共享状态与其通信。
//! 写盘、刷盘和索引保存都在阻塞线程池上执行，管理器整体移入再取回。

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{DownloadError, DownloadResult};
use super::progress::{
    spawn_progress_sampler, spawn_speed_sampler, ProgressCallback, ProgressProbe, SpeedCallback,
};
use super::slice_manager::SliceManager;
use super::target_file::TargetFile;
use crate::config::{DownloadConfig, UncompletedSliceSavePolicy};
use crate::hash::{DigestHashProvider, HashProvider};
use crate::persistence::{self, IndexRejection};
use crate::transport::{
    event_channel, EventReceiver, EventSender, HttpTransport, ResourceInfo, TransferEvent,
    TransferEventKind, Transport, TransportError, EVENT_CHANNEL_CAPACITY,
};

/// 定期保存续传索引的间隔
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
/// 传输层没有建议时的轮询等待
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// 轮询等待上限
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// 获取资源信息失败后的重试间隔
const FETCH_INFO_RETRY_DELAY: Duration = Duration::from_millis(500);

pub type ResultCallback = Arc<dyn Fn(&DownloadResult) + Send + Sync>;
pub type VerboseCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// 会话回调，均可为空
#[derive(Clone, Default)]
pub struct DownloadCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_speed: Option<SpeedCallback>,
    pub on_result: Option<ResultCallback>,
    pub on_verbose: Option<VerboseCallback>,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Downloading,
    Paused,
}

/// 事件循环的退出原因
#[derive(Debug)]
enum LoopExit {
    /// 没有活跃传输也没有待下载分片
    Drained,
    /// 收到取消信号
    Stopped,
    /// 无法继续的错误
    Fatal(DownloadError),
}

/// 事件循环一次等待的结果
enum Wake {
    Canceled,
    PauseChanged,
    Events(Option<TransferEvent>),
}

/// 下载器
pub struct Downloader {
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    hasher: Arc<dyn HashProvider>,
    callbacks: DownloadCallbacks,
    session_id: String,
    state: Mutex<SessionState>,
    pause_tx: watch::Sender<bool>,
    /// 当前运行的取消令牌，进入 Downloading 时设置，运行结束后清空
    run_token: Mutex<Option<CancellationToken>>,
    probe: Mutex<Option<ProgressProbe>>,
    origin_file_size: Mutex<Option<u64>>,
}

impl Downloader {
    pub fn new(config: DownloadConfig, transport: Arc<dyn Transport>) -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            config,
            transport,
            hasher: Arc::new(DigestHashProvider),
            callbacks: DownloadCallbacks::default(),
            session_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(SessionState::Stopped),
            pause_tx,
            run_token: Mutex::new(None),
            probe: Mutex::new(None),
            origin_file_size: Mutex::new(None),
        }
    }

    /// 使用按配置构建的 HTTP 传输创建下载器
    pub fn with_http_transport(config: DownloadConfig) -> Result<Self, DownloadError> {
        let transport =
            HttpTransport::new(&config.options).map_err(DownloadError::TransportInit)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn with_callbacks(mut self, callbacks: DownloadCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_hash_provider(mut self, hasher: Arc<dyn HashProvider>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// 服务器报告的文件大小，未知或尚未获取时为 None
    pub fn origin_file_size(&self) -> Option<u64> {
        *self.origin_file_size.lock()
    }

    /// 已下载字节数（含未落盘的缓冲）
    pub fn total_downloaded(&self) -> u64 {
        self.probe
            .lock()
            .as_ref()
            .map(|p| p.total_downloaded())
            .unwrap_or(0)
    }

    /// 在后台任务中运行一次下载
    ///
    /// 会话在返回前就已进入 Downloading，之后的 `stop()` 一定作用于这次运行。
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<DownloadResult> {
        let claimed = self.claim();
        let this = self.clone();
        tokio::spawn(async move {
            match claimed {
                Ok(token) => this.run_claimed(token).await,
                Err(e) => this.reject(e),
            }
        })
    }

    /// 暂停：事件循环停止消费数据，传输由背压挂起
    pub fn pause(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Downloading {
            return false;
        }
        *state = SessionState::Paused;
        self.pause_tx.send_replace(true);
        info!("⏸ 下载已暂停: {}", self.config.url);
        true
    }

    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Paused {
            return false;
        }
        *state = SessionState::Downloading;
        self.pause_tx.send_replace(false);
        info!("▶ 下载已恢复: {}", self.config.url);
        true
    }

    /// 请求停止；已暂停的会话也会立即醒来退出
    pub fn stop(&self) {
        if let Some(token) = self.run_token.lock().as_ref() {
            info!("⏹ 请求停止下载: {}", self.config.url);
            token.cancel();
        }
    }

    /// 执行一次完整的下载，返回唯一的最终结果
    pub async fn start(&self) -> DownloadResult {
        match self.claim() {
            Ok(token) => self.run_claimed(token).await,
            Err(e) => self.reject(e),
        }
    }

    /// 校验参数并占用会话，返回本次运行的取消令牌
    fn claim(&self) -> Result<CancellationToken, DownloadError> {
        if let Err(e) = self.config.validate() {
            error!("下载参数无效: {}", e);
            return Err(e);
        }

        let mut state = self.state.lock();
        if *state != SessionState::Stopped {
            warn!("会话已在运行: {}", self.session_id);
            return Err(DownloadError::AlreadyDownloading);
        }
        *state = SessionState::Downloading;
        self.pause_tx.send_replace(false);
        let token = self.config.cancel_token.child_token();
        *self.run_token.lock() = Some(token.clone());
        Ok(token)
    }

    /// 未能占用会话；重复启动不回调结果，运行中的那次会自己回调
    fn reject(&self, error: DownloadError) -> DownloadResult {
        let result = Err(error);
        if !matches!(result, Err(DownloadError::AlreadyDownloading)) {
            self.report_result(&result);
        }
        result
    }

    async fn run_claimed(&self, token: CancellationToken) -> DownloadResult {
        info!(
            "🔥 开始下载: {} -> {:?} (session={}, 线程数={})",
            self.config.url, self.config.target_path, self.session_id, self.config.options.thread_num
        );
        let started = Instant::now();
        let result = self.run(&token).await;

        {
            let mut state = self.state.lock();
            *self.run_token.lock() = None;
            *state = SessionState::Stopped;
            self.pause_tx.send_replace(false);
        }

        match &result {
            Ok(()) => info!(
                "✓ 下载成功: {:?}, 耗时 {:.2}s",
                self.config.target_path,
                started.elapsed().as_secs_f64()
            ),
            Err(e) if e.is_canceled() => info!("下载已停止: {}", e),
            Err(e) => error!("下载失败: {}", e),
        }
        self.report_result(&result);
        result
    }

    async fn run(&self, token: &CancellationToken) -> DownloadResult {
        if token.is_cancelled() {
            return Err(DownloadError::Canceled);
        }
        let info = self.fetch_resource_info(token).await?;
        *self.origin_file_size.lock() = info.size;

        if info.size == Some(0) {
            return self.create_empty_file();
        }

        let manager = SliceManager::new(&self.config, info, self.hasher.clone());
        let (manager, prepared) = on_blocking(manager, prepare_slices).await?;
        if prepared? {
            self.verbose(format!(
                "从续传索引恢复，已下载 {} bytes",
                manager.total_downloaded()
            ));
        }

        let probe = manager.progress_probe();
        *self.probe.lock() = Some(probe.clone());
        let sampler_guard = self.spawn_samplers(&probe).drop_guard();

        let (mut manager, exit) = if manager.is_fully_received() {
            info!("所有分片均已下载，直接校验");
            (manager, LoopExit::Drained)
        } else {
            self.drive(manager, token).await?
        };
        drop(sampler_guard);
        manager.stop_all();

        let check_completed = matches!(exit, LoopExit::Drained);
        let (manager, finish) =
            on_blocking(manager, move |m| m.finish_download(check_completed)).await?;

        if let Some(cb) = &self.callbacks.on_progress {
            cb(probe.total_size(), probe.total_downloaded());
        }
        // 清理临时文件前关闭句柄
        drop(manager);

        let result = match exit {
            LoopExit::Drained => finish,
            LoopExit::Stopped => match finish {
                Err(DownloadError::IndexUpdateFailed(e)) => {
                    warn!("停止时保存续传索引失败: {}", e);
                    Err(DownloadError::CanceledIndexUpdateFailed)
                }
                _ => Err(DownloadError::Canceled),
            },
            LoopExit::Fatal(e) => {
                if let Err(finish_err) = finish {
                    warn!("异常退出后收尾失败: {}", finish_err);
                }
                Err(e)
            }
        };

        if let Err(e) = &result {
            self.apply_save_policy(e);
        }
        result
    }

    /// 获取资源信息，失败按配置次数重试
    async fn fetch_resource_info(&self, token: &CancellationToken) -> Result<ResourceInfo, DownloadError> {
        let options = &self.config.options;
        let attempts = options.fetch_info_retry_times.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let fetch = self.transport.fetch_metadata(
                &self.config.url,
                &options.headers,
                options.connect_timeout(),
            );
            let result = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Canceled),
                r = fetch => r,
            };

            match result {
                Ok(info) => {
                    info!(
                        "文件信息: 大小 {:?}, 支持 Range: {}, 内容哈希: {:?}",
                        info.size, info.accept_ranges, info.content_hash
                    );
                    return Ok(info);
                }
                Err(e) => {
                    warn!("获取文件信息失败 ({}/{}): {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Canceled),
                    _ = tokio::time::sleep(FETCH_INFO_RETRY_DELAY) => {}
                }
            }
        }

        Err(DownloadError::FetchInfoFailed {
            attempts,
            source: last_error.unwrap_or_else(|| TransportError::Other("未发起请求".to_string())),
        })
    }

    fn create_empty_file(&self) -> DownloadResult {
        let path = &self.config.target_path;
        TargetFile::create_fixed(path, Some(0)).map_err(|source| {
            DownloadError::CreateTargetFileFailed {
                path: path.clone(),
                source,
            }
        })?;
        info!("文件大小为 0，已创建空文件: {:?}", path);
        Ok(())
    }

    /// 事件循环
    ///
    /// 管理器在循环内独占，退出时连同退出原因一起交还。
    /// 只有阻塞任务本身异常时才返回 `Err`，此时管理器已丢失。
    async fn drive(
        &self,
        mut manager: SliceManager,
        token: &CancellationToken,
    ) -> Result<(SliceManager, LoopExit), DownloadError> {
        let (events_tx, mut events_rx) = event_channel();
        let mut pause_rx = self.pause_tx.subscribe();

        if let Err(e) = self.start_initial_window(&mut manager, &events_tx) {
            return Ok((manager, LoopExit::Fatal(e)));
        }

        let poll_timeout = self
            .transport
            .suggested_poll_timeout()
            .map(|d| d.min(MAX_POLL_TIMEOUT))
            .unwrap_or(DEFAULT_POLL_TIMEOUT);
        let mut last_checkpoint = Instant::now();
        let mut pause_saved = false;

        loop {
            if token.is_cancelled() {
                return Ok((manager, LoopExit::Stopped));
            }

            if *pause_rx.borrow_and_update() {
                if !pause_saved {
                    // 暂停可能持续很久，先把缓冲落盘
                    manager = checkpoint(manager).await?;
                    last_checkpoint = Instant::now();
                    pause_saved = true;
                    self.verbose("已暂停，等待恢复");
                }
                tokio::select! {
                    _ = token.cancelled() => return Ok((manager, LoopExit::Stopped)),
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            return Ok((manager, LoopExit::Stopped));
                        }
                    }
                }
                continue;
            }
            pause_saved = false;

            if let Err(e) = self.backfill(&mut manager, &events_tx) {
                return Ok((manager, LoopExit::Fatal(e)));
            }
            if manager.active_count() == 0 && !manager.has_pending() {
                return Ok((manager, LoopExit::Drained));
            }

            let wake = tokio::select! {
                _ = token.cancelled() => Wake::Canceled,
                _ = pause_rx.changed() => Wake::PauseChanged,
                received = tokio::time::timeout(poll_timeout, events_rx.recv()) => {
                    Wake::Events(received.ok().flatten())
                }
            };

            match wake {
                Wake::Canceled => return Ok((manager, LoopExit::Stopped)),
                Wake::PauseChanged => continue,
                Wake::Events(None) => {}
                Wake::Events(Some(first)) => {
                    let batch = drain_batch(first, &mut events_rx);
                    let (m, (notes, applied)) =
                        on_blocking(manager, move |m| apply_events(m, batch)).await?;
                    manager = m;
                    for note in notes {
                        self.verbose(note);
                    }
                    if let Err(e) = applied {
                        return Ok((manager, LoopExit::Fatal(e)));
                    }
                }
            }

            if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                manager = checkpoint(manager).await?;
                last_checkpoint = Instant::now();
            }
        }
    }

    /// 启动 min(线程数, 待下载分片数) 个分片
    fn start_initial_window(&self, manager: &mut SliceManager, events_tx: &EventSender) -> DownloadResult {
        let options = &self.config.options;
        let window = options.thread_num.min(manager.pending_count());
        if window == 0 {
            return Err(DownloadError::NoAvailableSlice);
        }

        let cache_budget = options.disk_cache_size / window as u64;
        let rate_budget = split_rate(options.max_download_speed, window);
        let mut started = 0;
        for _ in 0..window {
            let Some(index) = manager.fetch_useful_slice(false) else {
                break;
            };
            if manager.start_slice(
                index,
                self.transport.as_ref(),
                events_tx.clone(),
                cache_budget,
                rate_budget,
            )? {
                started += 1;
            }
        }

        if started == 0 {
            return Err(DownloadError::NoAvailableSlice);
        }
        self.verbose(format!("已启动 {} 个分片", started));
        Ok(())
    }

    /// 补位：活跃数低于线程数时启动下一个分片，预算按启动后的并发数分配
    fn backfill(&self, manager: &mut SliceManager, events_tx: &EventSender) -> DownloadResult {
        let options = &self.config.options;
        while manager.active_count() < options.thread_num {
            let Some(index) = manager.fetch_useful_slice(true) else {
                break;
            };
            let concurrency = manager.active_count() + 1;
            let started = manager.start_slice(
                index,
                self.transport.as_ref(),
                events_tx.clone(),
                options.disk_cache_size / concurrency as u64,
                split_rate(options.max_download_speed, concurrency),
            )?;
            if started {
                self.verbose(format!("分片 #{} 开始下载", index));
            }
        }
        Ok(())
    }

    /// 启动采样任务，返回用于停止它们的令牌
    fn spawn_samplers(&self, probe: &ProgressProbe) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(cb) = &self.callbacks.on_progress {
            spawn_progress_sampler(probe.clone(), cb.clone(), token.clone());
        }
        if let Some(cb) = &self.callbacks.on_speed {
            spawn_speed_sampler(probe.clone(), cb.clone(), token.clone());
        }
        token
    }

    /// 按保留策略处理失败后的临时文件和索引
    fn apply_save_policy(&self, error: &DownloadError) {
        let discard = match self.config.options.uncompleted_slice_save_policy {
            UncompletedSliceSavePolicy::AlwaysDiscard => true,
            UncompletedSliceSavePolicy::SaveExceptFailed => error.is_transfer_failure(),
        };
        if !discard {
            return;
        }

        let tmp_path = self.config.tmp_file_path();
        match std::fs::remove_file(&tmp_path) {
            Ok(()) => info!("已删除临时文件: {:?}", tmp_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除临时文件失败 {:?}: {}", tmp_path, e),
        }
        if let Err(e) = persistence::delete_index(&self.config.index_file_path()) {
            warn!("删除续传索引失败: {}", e);
        }
    }

    fn verbose(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("[{}] {}", self.session_id, message);
        if let Some(cb) = &self.callbacks.on_verbose {
            cb(message);
        }
    }

    fn report_result(&self, result: &DownloadResult) {
        if let Some(cb) = &self.callbacks.on_result {
            cb(result);
        }
    }
}

/// 在阻塞线程池上操作管理器，完成后连同结果一起交还
async fn on_blocking<F, R>(manager: SliceManager, f: F) -> Result<(SliceManager, R), DownloadError>
where
    F: FnOnce(&mut SliceManager) -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut manager = manager;
        let result = f(&mut manager);
        (manager, result)
    })
    .await
    .map_err(|e| DownloadError::Internal(format!("磁盘任务异常: {}", e)))
}

/// 加载续传索引，不可用时重新规划；返回是否从索引恢复
fn prepare_slices(manager: &mut SliceManager) -> Result<bool, DownloadError> {
    let resumed = match manager.load_existing_slices() {
        Ok(()) => true,
        Err(rejection) => {
            match rejection {
                IndexRejection::Missing => debug!("没有续传索引，全新下载"),
                other => info!("续传索引不可用（{}），重新下载", other),
            }
            manager.make_slices()?;
            false
        }
    };
    if let Err(e) = manager.save_index() {
        warn!("保存续传索引失败: {}", e);
    }
    Ok(resumed)
}

/// 刷写所有缓冲并保存续传索引，失败只记录日志
async fn checkpoint(manager: SliceManager) -> Result<SliceManager, DownloadError> {
    let (manager, saved) = on_blocking(manager, |m| {
        m.flush_all();
        m.save_index().map(|()| m.total_downloaded())
    })
    .await?;
    match saved {
        Ok(downloaded) => debug!("续传索引已更新: {} bytes", downloaded),
        Err(e) => warn!("定期保存续传索引失败: {}", e),
    }
    Ok(manager)
}

/// 取出当前已到达的事件，最多一个通道容量
fn drain_batch(first: TransferEvent, events_rx: &mut EventReceiver) -> Vec<TransferEvent> {
    let mut batch = vec![first];
    while batch.len() < EVENT_CHANNEL_CAPACITY {
        match events_rx.try_recv() {
            Ok(event) => batch.push(event),
            Err(_) => break,
        }
    }
    batch
}

/// 按到达顺序把事件交给管理器，返回需要转给 verbose 回调的消息
fn apply_events(
    manager: &mut SliceManager,
    events: Vec<TransferEvent>,
) -> (Vec<String>, DownloadResult) {
    let mut notes = Vec::new();
    for TransferEvent {
        slice_index,
        transfer_id,
        kind,
    } in events
    {
        match kind {
            TransferEventKind::Data(bytes) => {
                if let Err(e) = manager.on_data(slice_index, transfer_id, &bytes) {
                    return (notes, Err(e));
                }
            }
            TransferEventKind::Finished(result) => {
                if let Some(outcome) = manager.on_transfer_finished(slice_index, transfer_id, result)
                {
                    notes.push(format!("分片 #{} 传输结束: {:?}", slice_index, outcome));
                }
            }
        }
    }
    (notes, Ok(()))
}

/// 把全局限速均分给并发分片；限速时每个分片至少 1 B/s
fn split_rate(total: u64, concurrency: usize) -> u64 {
    if total == 0 {
        return 0;
    }
    (total / concurrency.max(1) as u64).max(1)
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("session_id", &self.session_id)
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish()
    }
}
