//! 音量渐变器（Fader）
//!
//! 把播放/暂停这类瞬时状态切换变成一段很短的线性增益渐变，
//! 避免输出信号出现不连续（爆音）。
//!
//! 所有字段都是原子量：
//! - 控制线程调用 `change()` / `finish()` 配置渐变
//! - 管线在实时回调里每帧调用 `advance()`（或 `apply()`）推进位置
//!
//! 双方都不加锁。

use std::sync::atomic::{AtomicI8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::MutexGuard;

use super::format::Sample;

/// 渐变时长（毫秒）
pub const FADE_TIME_MS: u32 = 50;

/// 等待渐变完成时的轮询间隔
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 渐变方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FadeDirection {
    /// 淡出（增益递减）
    Down = -1,
    /// 无渐变
    Idle = 0,
    /// 淡入（增益递增）
    Up = 1,
}

impl FadeDirection {
    /// 播放 → 淡入，暂停 → 淡出
    pub fn for_playing(playing: bool) -> Self {
        if playing {
            Self::Up
        } else {
            Self::Down
        }
    }

    fn from_raw(raw: i8) -> Self {
        match raw {
            r if r < 0 => Self::Down,
            0 => Self::Idle,
            _ => Self::Up,
        }
    }
}

/// 计算给定采样率下的渐变长度（样本帧数）
#[inline]
pub fn fade_limit(sample_rate: u32) -> u32 {
    (sample_rate as u64 * FADE_TIME_MS as u64 / 1000) as u32
}

/// 音量渐变器
///
/// 不变量：`0 <= current <= limit`，增益 = `current / limit`。
pub struct Fader {
    /// 渐变位置，被回调线程高频写入，独占 cache line
    current: CachePadded<AtomicU32>,
    /// 渐变长度（样本帧数）
    limit: AtomicU32,
    /// 方向：+1 / -1 / 0
    increment: AtomicI8,
}

impl Fader {
    pub fn new() -> Self {
        Self {
            current: CachePadded::new(AtomicU32::new(0)),
            limit: AtomicU32::new(0),
            increment: AtomicI8::new(0),
        }
    }

    /// 重新配置渐变
    ///
    /// `limit` 按采样率重算。以下两种情况把位置重置到 `direction` 对应的起点
    /// （淡入为 0，淡出为 `limit`）：
    /// - `force_reset` 且当前已处于端点
    /// - 新 `limit` 与旧值不同（设备或采样率变化）
    ///
    /// 方向最后写入，读者不会看到新方向配旧 `limit`。
    pub fn change(&self, direction: FadeDirection, sample_rate: u32, force_reset: bool) {
        let new_limit = fade_limit(sample_rate);
        let mut reset = force_reset && self.is_finished();
        let old_limit = self.limit.swap(new_limit, Ordering::AcqRel);
        reset = reset || old_limit != new_limit;

        if reset {
            let start = match direction {
                FadeDirection::Down => new_limit,
                FadeDirection::Idle | FadeDirection::Up => 0,
            };
            self.current.store(start, Ordering::Release);
        }

        self.increment.store(direction as i8, Ordering::Release);
    }

    /// 立即跳到当前方向的终点
    pub fn finish(&self) {
        match self.direction() {
            FadeDirection::Down => self.current.store(0, Ordering::Release),
            FadeDirection::Idle | FadeDirection::Up => {
                let limit = self.limit.load(Ordering::Acquire);
                self.current.store(limit, Ordering::Release);
            }
        }
    }

    /// 位置是否处于端点（0 或 `limit`）
    #[inline]
    pub fn is_finished(&self) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        let current = self.current.load(Ordering::Acquire);
        current == 0 || current == limit
    }

    /// 等待渐变完成
    ///
    /// 调用者持有播放器锁。每次睡眠期间释放锁，返回前重新获取，
    /// 避免与需要该锁的线程死锁。
    pub fn wait_until_finished<T>(&self, guard: &mut MutexGuard<'_, T>) {
        while !self.is_finished() {
            MutexGuard::unlocked(guard, || std::thread::sleep(WAIT_POLL_INTERVAL));
        }
    }

    /// 带超时的 `wait_until_finished`
    ///
    /// 返回是否在超时前完成。
    pub fn wait_until_finished_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.wait_for(guard, timeout, Self::is_finished)
    }

    /// 等待渐变走到当前方向的终点（最多 `timeout`）
    ///
    /// 与 `wait_until_finished_for` 不同，从 `limit` 开始的淡出不算完成。
    pub fn wait_until_settled_for<T>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.wait_for(guard, timeout, Self::is_settled)
    }

    fn wait_for<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        done: fn(&Self) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let nap = WAIT_POLL_INTERVAL.min(deadline - now);
            MutexGuard::unlocked(guard, || std::thread::sleep(nap));
        }
        true
    }

    pub fn direction(&self) -> FadeDirection {
        FadeDirection::from_raw(self.increment.load(Ordering::Acquire))
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    /// 当前增益
    ///
    /// `limit == 0` 表示没有配置渐变：淡出方向视为静音，其余视为全音量。
    #[inline]
    pub fn gain(&self) -> f32 {
        let limit = self.limit.load(Ordering::Acquire);
        let direction = self.direction();
        gain_at(self.current.load(Ordering::Acquire), limit, direction)
    }

    /// 返回本帧增益并推进一帧
    ///
    /// 实时安全：无锁、无分配。与 `change()` 并发时推进会让位（CAS 失败即放弃）。
    #[inline]
    pub fn advance(&self) -> f32 {
        let limit = self.limit.load(Ordering::Acquire);
        let direction = self.direction();
        let current = self.current.load(Ordering::Acquire);
        let gain = gain_at(current, limit, direction);

        let next = match direction {
            FadeDirection::Up if current < limit => current + 1,
            FadeDirection::Down if current > 0 => current - 1,
            _ => return gain,
        };
        let _ = self
            .current
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed);
        gain
    }

    /// 对交织样本逐帧施加渐变
    ///
    /// 渐变静止时按常量增益处理整个缓冲区。
    pub fn apply<S: Sample>(&self, samples: &mut [S], channels: usize) {
        let channels = channels.max(1);

        if self.is_settled() {
            let gain = self.gain();
            if gain >= 1.0 {
                return;
            }
            if gain <= 0.0 {
                samples.fill(S::SILENCE);
                return;
            }
            for s in samples.iter_mut() {
                *s = s.scale(gain);
            }
            return;
        }

        for frame in samples.chunks_mut(channels) {
            let gain = self.advance();
            for s in frame.iter_mut() {
                *s = s.scale(gain);
            }
        }
    }

    /// 渐变是否已停在当前方向的终点（或无方向）
    pub fn is_settled(&self) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        let current = self.current.load(Ordering::Acquire);
        match self.direction() {
            FadeDirection::Idle => true,
            FadeDirection::Up => current >= limit,
            FadeDirection::Down => current == 0,
        }
    }
}

impl Default for Fader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Fader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fader")
            .field("current", &self.current())
            .field("limit", &self.limit())
            .field("direction", &self.direction())
            .finish()
    }
}

#[inline]
fn gain_at(current: u32, limit: u32, direction: FadeDirection) -> f32 {
    if limit == 0 {
        return match direction {
            FadeDirection::Down => 0.0,
            FadeDirection::Idle | FadeDirection::Up => 1.0,
        };
    }
    current.min(limit) as f32 / limit as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_initial_state_is_finished() {
        let fader = Fader::new();
        assert!(fader.is_finished());
        assert_eq!(fader.limit(), 0);
        assert_eq!(fader.direction(), FadeDirection::Idle);
    }

    #[test]
    fn test_limit_is_fifty_ms_for_all_rates() {
        let fader = Fader::new();
        for rate in [8000, 11025, 22050, 44100, 48000, 88200, 96000, 192000] {
            fader.change(FadeDirection::Up, rate, false);
            assert_eq!(fader.limit(), rate / 20);
            assert!(fader.current() <= fader.limit());

            fader.change(FadeDirection::Down, rate, true);
            assert_eq!(fader.limit(), rate / 20);
            assert!(fader.current() <= fader.limit());
        }
    }

    #[test]
    fn test_change_then_finish_at_44100() {
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 44100, false);
        assert_eq!(fader.limit(), 2205);
        assert_eq!(fader.current(), 0);

        fader.finish();
        assert_eq!(fader.current(), 2205);
        assert!(fader.is_finished());
    }

    #[test]
    fn test_forced_reset_on_finished_fader() {
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 48000, false);
        fader.finish();
        assert_eq!(fader.current(), 2400);

        fader.change(FadeDirection::Up, 48000, true);
        assert_eq!(fader.current(), 0);

        fader.change(FadeDirection::Down, 48000, true);
        assert_eq!(fader.current(), 2400);
    }

    #[test]
    fn test_forced_reset_ignored_mid_ramp() {
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 44100, false);
        for _ in 0..100 {
            fader.advance();
        }
        assert_eq!(fader.current(), 100);
        assert!(!fader.is_finished());

        // 渐变进行中：同采样率下不重置，只反转方向
        fader.change(FadeDirection::Down, 44100, true);
        assert_eq!(fader.current(), 100);
        fader.advance();
        assert_eq!(fader.current(), 99);
    }

    #[test]
    fn test_sample_rate_change_restarts_ramp() {
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 44100, false);
        for _ in 0..500 {
            fader.advance();
        }
        fader.change(FadeDirection::Up, 48000, false);
        assert_eq!(fader.limit(), 2400);
        assert_eq!(fader.current(), 0);
    }

    #[test]
    fn test_advance_is_monotonic_and_clamped() {
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 1000, false);
        let limit = fader.limit();

        let mut last = -1.0f32;
        for _ in 0..(limit + 10) {
            let gain = fader.advance();
            assert!(gain >= last);
            last = gain;
        }
        assert_eq!(fader.current(), limit);
        assert_relative_eq!(fader.gain(), 1.0);

        fader.change(FadeDirection::Down, 1000, false);
        let mut last = 2.0f32;
        for _ in 0..(limit + 10) {
            let gain = fader.advance();
            assert!(gain <= last);
            last = gain;
        }
        assert_eq!(fader.current(), 0);
        assert_relative_eq!(fader.gain(), 0.0);
    }

    #[test]
    fn test_finish_respects_direction() {
        let fader = Fader::new();
        fader.change(FadeDirection::Down, 44100, true);
        fader.advance();
        fader.finish();
        assert_eq!(fader.current(), 0);
        assert!(fader.is_finished());
    }

    #[test]
    fn test_close_style_reset_mutes() {
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 44100, false);
        fader.finish();

        fader.change(FadeDirection::Down, 0, true);
        assert_eq!(fader.limit(), 0);
        assert_eq!(fader.current(), 0);
        assert!(fader.is_finished());
        assert_relative_eq!(fader.gain(), 0.0);

        // 重新打开后从静音开始淡入
        fader.change(FadeDirection::Up, 44100, false);
        assert_eq!(fader.current(), 0);
        assert_relative_eq!(fader.gain(), 0.0);
    }

    #[test]
    fn test_apply_ramps_interleaved_frames() {
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 1000, false);
        let limit = fader.limit() as usize;

        let mut samples = vec![1.0f32; limit * 2 * 2];
        fader.apply(&mut samples, 2);

        // 每帧两个声道增益相同
        for frame in samples.chunks(2) {
            assert_relative_eq!(frame[0], frame[1]);
        }
        assert_relative_eq!(samples[0], 0.0);
        assert_relative_eq!(samples[2], 1.0 / limit as f32);
        assert_relative_eq!(*samples.last().unwrap(), 1.0);
    }

    #[test]
    fn test_apply_settled_down_is_silent() {
        let fader = Fader::new();
        fader.change(FadeDirection::Down, 44100, true);
        fader.finish();

        let mut samples = vec![1234i16; 64];
        fader.apply(&mut samples, 2);
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_wait_until_finished_releases_lock() {
        let lock = Arc::new(Mutex::new(()));
        let fader = Arc::new(Fader::new());
        fader.change(FadeDirection::Up, 1000, false);
        for _ in 0..10 {
            fader.advance();
        }
        assert!(!fader.is_finished());

        let mut guard = lock.lock();

        let advancer = {
            let lock = Arc::clone(&lock);
            let fader = Arc::clone(&fader);
            std::thread::spawn(move || {
                // 只有等待方睡眠时释放了锁，这里才能拿到
                let _guard = lock.lock();
                while !fader.is_finished() {
                    fader.advance();
                }
            })
        };

        fader.wait_until_finished(&mut guard);
        assert!(fader.is_finished());
        drop(guard);
        advancer.join().unwrap();
    }

    #[test]
    fn test_wait_until_finished_for_times_out() {
        let lock = Mutex::new(());
        let fader = Fader::new();
        fader.change(FadeDirection::Up, 1000, false);
        fader.advance();

        let mut guard = lock.lock();
        let start = Instant::now();
        assert!(!fader.wait_until_finished_for(&mut guard, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_until_settled_waits_for_fade_out() {
        let fader = Arc::new(Fader::new());
        fader.change(FadeDirection::Up, 1000, false);
        fader.finish();
        fader.change(FadeDirection::Down, 1000, false);
        // 从 limit 开始的淡出：已 finished，但还没走到 0
        assert!(fader.is_finished());
        assert!(!fader.is_settled());

        let advancer = {
            let fader = Arc::clone(&fader);
            std::thread::spawn(move || {
                while !fader.is_settled() {
                    fader.advance();
                    std::thread::sleep(Duration::from_micros(50));
                }
            })
        };

        let lock = Mutex::new(());
        let mut guard = lock.lock();
        assert!(fader.wait_until_settled_for(&mut guard, Duration::from_secs(5)));
        assert_eq!(fader.current(), 0);
        drop(guard);
        advancer.join().unwrap();
    }
}
