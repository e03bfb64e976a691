//! 回调统计模块
//!
//! 在音频回调中收集统计信息，采用降频采样策略减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// 统计采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 间隔缓冲区大小
const INTERVAL_BUFFER_SIZE: usize = 256;

/// 回调统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct CallbackStats {
    /// 时间基准，采样时刻存为相对它的纳秒数
    epoch: Instant,

    callback_count: AtomicU64,
    last_sampled_ns: AtomicU64,

    interval_buffer: Box<[AtomicU64; INTERVAL_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    frames_rendered: AtomicU64,
    underflow_count: AtomicU64,
    overflow_count: AtomicU64,
    /// 管线写入不足一整个缓冲区的次数
    short_reads: AtomicU64,
    producer_panics: AtomicU64,
}

impl CallbackStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            callback_count: AtomicU64::new(0),
            last_sampled_ns: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            frames_rendered: AtomicU64::new(0),
            underflow_count: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
            producer_panics: AtomicU64::new(0),
        }
    }

    /// 在回调开头调用
    ///
    /// 只在采样点才读时钟
    #[inline]
    pub fn on_callback(&self, frames: usize) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);
        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            // +1 保证第一次采样也非零
            let now = self.epoch.elapsed().as_nanos() as u64 + 1;
            let last = self.last_sampled_ns.swap(now, Ordering::Relaxed);

            if last > 0 {
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                    % INTERVAL_BUFFER_SIZE;
                self.interval_buffer[idx].store(now.saturating_sub(last), Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn record_underflow(&self) {
        self.underflow_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overflow(&self) {
        self.overflow_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_producer_panic(&self) {
        self.producer_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn underflow_count(&self) -> u64 {
        self.underflow_count.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn short_reads(&self) -> u64 {
        self.short_reads.load(Ordering::Relaxed)
    }

    pub fn producer_panics(&self) -> u64 {
        self.producer_panics.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, sample_rate: u32) -> StatsReport {
        let callback_count = self.callback_count();
        let frames_rendered = self.frames_rendered();

        // 平均每次回调帧数推出期望间隔
        let expected_sampled_interval_ns = if callback_count > 0 && sample_rate > 0 {
            let frames_per_callback = frames_rendered / callback_count;
            frames_per_callback * 1_000_000_000 / sample_rate as u64 * SAMPLE_INTERVAL
        } else {
            0
        };

        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();

        let interval_stats = match (intervals_ns.iter().min(), intervals_ns.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        StatsReport {
            callback_count,
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns,
            interval_stats,
            frames_rendered,
            underflow_count: self.underflow_count(),
            overflow_count: self.overflow_count(),
            short_reads: self.short_reads(),
            producer_panics: self.producer_panics(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.last_sampled_ns.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.underflow_count.store(0, Ordering::Relaxed);
        self.overflow_count.store(0, Ordering::Relaxed);
        self.short_reads.store(0, Ordering::Relaxed);
        self.producer_panics.store(0, Ordering::Relaxed);

        for slot in self.interval_buffer.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for CallbackStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackStats")
            .field("callback_count", &self.callback_count())
            .field("frames_rendered", &self.frames_rendered())
            .field("underflow_count", &self.underflow_count())
            .field("overflow_count", &self.overflow_count())
            .finish_non_exhaustive()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub frames_rendered: u64,
    pub underflow_count: u64,
    pub overflow_count: u64,
    pub short_reads: u64,
    pub producer_panics: u64,
}

#[derive(Debug, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Output Callback Statistics")?;
        writeln!(f, "==========================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(f, "Frames rendered: {}", self.frames_rendered)?;
        writeln!(f)?;

        writeln!(f, "Callback Timing (per {} callbacks):", self.sample_interval)?;
        writeln!(
            f,
            "  Expected: {:.2} ms",
            self.expected_sampled_interval_ns as f64 / 1_000_000.0
        )?;
        writeln!(f, "  Measured:")?;
        writeln!(f, "    Min: {:.2} ms", self.interval_stats.min_ns as f64 / 1_000_000.0)?;
        writeln!(f, "    Max: {:.2} ms", self.interval_stats.max_ns as f64 / 1_000_000.0)?;
        writeln!(f, "    Avg: {:.2} ms", self.interval_stats.avg_ns as f64 / 1_000_000.0)?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        let jitter_pct = if self.expected_sampled_interval_ns > 0 {
            jitter_ns as f64 / self.expected_sampled_interval_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            f,
            "  Jitter: {:.2} ms ({:.1}%)",
            jitter_ns as f64 / 1_000_000.0,
            jitter_pct
        )?;
        writeln!(f)?;

        writeln!(f, "Underflows: {}", self.underflow_count)?;
        writeln!(f, "Overflows: {}", self.overflow_count)?;
        writeln!(f, "Short reads: {}", self.short_reads)?;
        writeln!(f, "Producer panics: {}", self.producer_panics)?;

        Ok(())
    }
}
