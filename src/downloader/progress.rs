//! 进度与速度采样
//!
//! 采样任务独立于调度循环运行，只读取各分片的原子计数器，
//! 不触碰分片本身。计数器只在接收数据时增加，刷盘不改变其值，
//! 所以采样得到的总量单调不减。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 进度回调间隔
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
/// 速度回调间隔
pub const SPEED_INTERVAL: Duration = Duration::from_secs(1);

/// 进度回调：(文件大小，None 表示未知；已下载字节)
pub type ProgressCallback = Arc<dyn Fn(Option<u64>, u64) + Send + Sync>;
/// 速度回调：字节/秒
pub type SpeedCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// 已下载字节数的只读视图
#[derive(Clone)]
pub struct ProgressProbe {
    counters: Arc<[Arc<AtomicU64>]>,
    total_size: Option<u64>,
}

impl ProgressProbe {
    pub fn new(counters: Vec<Arc<AtomicU64>>, total_size: Option<u64>) -> Self {
        Self {
            counters: counters.into(),
            total_size,
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }
}

impl std::fmt::Debug for ProgressProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressProbe")
            .field("slices", &self.counters.len())
            .field("total_size", &self.total_size)
            .field("downloaded", &self.total_downloaded())
            .finish()
    }
}

/// 根据两次采样的差值计算速度
#[derive(Debug)]
pub struct SpeedCalculator {
    last_bytes: u64,
    last_time: Instant,
}

impl SpeedCalculator {
    pub fn new(initial_bytes: u64) -> Self {
        Self {
            last_bytes: initial_bytes,
            last_time: Instant::now(),
        }
    }

    /// 返回上次采样以来的平均速度（字节/秒）
    pub fn sample(&mut self, bytes: u64) -> u64 {
        self.sample_at(bytes, Instant::now())
    }

    fn sample_at(&mut self, bytes: u64, now: Instant) -> u64 {
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        let delta = bytes.saturating_sub(self.last_bytes);
        self.last_bytes = bytes;
        self.last_time = now;
        if elapsed <= f64::EPSILON {
            return 0;
        }
        (delta as f64 / elapsed) as u64
    }
}

/// 每 500ms 报告一次进度，直到令牌取消
pub fn spawn_progress_sampler(
    probe: ProgressProbe,
    callback: ProgressCallback,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    callback(probe.total_size(), probe.total_downloaded());
                }
            }
        }
    })
}

/// 每秒报告一次速度，直到令牌取消
pub fn spawn_speed_sampler(
    probe: ProgressProbe,
    callback: SpeedCallback,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut calculator = SpeedCalculator::new(probe.total_downloaded());
        let mut ticker = tokio::time::interval(SPEED_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的第一次 tick 立即触发
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    callback(calculator.sample(probe.total_downloaded()));
                }
            }
        }
    })
}
