//! 实时线程辅助
//!
//! 回调线程由原生层创建，第一次进入回调时才能调整它：
//! - `set_realtime`: 提升为实时调度
//!   - macOS: 关闭分时、最高重要性，再设 THREAD_TIME_CONSTRAINT_POLICY
//!   - Linux: SCHED_FIFO
//! - `set_current_thread_name`: 设置线程名（调试器和 top 里可见）
//!
//! 两者都是尽力而为，失败只返回 false。

use std::time::Duration;

/// 实时调度优先级（Linux SCHED_FIFO）
#[cfg(target_os = "linux")]
const FIFO_PRIORITY: libc::c_int = 50;

/// 线程名最大长度（Linux 限制 15 字节 + NUL）
const MAX_THREAD_NAME: usize = 15;

/// 计算时间占周期的比例
const COMPUTATION_RATIO: f64 = 0.75;

/// 截止时间占周期的比例
const CONSTRAINT_RATIO: f64 = 0.85;

/// 一次回调的时间约束（纳秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeConstraint {
    pub period_ns: u64,
    pub computation_ns: u64,
    pub constraint_ns: u64,
}

impl TimeConstraint {
    pub fn for_duty(duty: Duration) -> Self {
        let period_ns = duty.as_nanos().clamp(1, u64::MAX as u128) as u64;
        Self {
            period_ns,
            computation_ns: (period_ns as f64 * COMPUTATION_RATIO) as u64,
            constraint_ns: (period_ns as f64 * CONSTRAINT_RATIO) as u64,
        }
    }
}

/// Mach 线程策略相关类型和常量
#[cfg(target_os = "macos")]
mod thread_policy {
    use std::ffi::c_void;

    pub const THREAD_EXTENDED_POLICY: u32 = 1;
    pub const THREAD_EXTENDED_POLICY_COUNT: u32 = 1;
    pub const THREAD_PRECEDENCE_POLICY: u32 = 3;
    pub const THREAD_PRECEDENCE_POLICY_COUNT: u32 = 1;
    pub const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    pub const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    /// 最高的非内核线程重要性
    pub const PRECEDENCE_IMPORTANCE: i32 = 63;

    #[repr(C)]
    pub struct ThreadExtendedPolicy {
        pub timeshare: i32,
    }

    #[repr(C)]
    pub struct ThreadPrecedencePolicy {
        pub importance: i32,
    }

    #[repr(C)]
    pub struct ThreadTimeConstraintPolicy {
        pub period: u32,      // 周期（Mach ticks）
        pub computation: u32, // 计算时间（Mach ticks）
        pub constraint: u32,  // 约束时间（Mach ticks）
        pub preemptible: i32, // 是否可抢占
    }

    #[repr(C)]
    pub struct MachTimebaseInfo {
        pub numer: u32,
        pub denom: u32,
    }

    #[link(name = "System")]
    extern "C" {
        pub fn mach_thread_self() -> u32;
        pub fn thread_policy_set(
            thread: u32,
            flavor: u32,
            policy_info: *const c_void,
            count: u32,
        ) -> i32;
        pub fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
    }

    /// 将纳秒转换为 Mach ticks
    pub fn ns_to_ticks(ns: u64) -> u32 {
        let mut info = MachTimebaseInfo { numer: 0, denom: 0 };
        unsafe {
            mach_timebase_info(&mut info);
        }
        if info.numer == 0 {
            return ns as u32;
        }
        // ticks = ns * denom / numer
        ((ns * info.denom as u64) / info.numer as u64) as u32
    }

    /// 设置一种策略，返回 kern_return_t
    pub fn set<P>(thread: u32, flavor: u32, policy: &P, count: u32) -> i32 {
        unsafe { thread_policy_set(thread, flavor, policy as *const P as *const c_void, count) }
    }
}

/// 把当前线程提升为实时调度
///
/// `duty` 是一次回调的周期（帧数 / 采样率）。依次设置：
/// 1. 关闭分时（extended policy）
/// 2. 最高重要性（precedence policy）
/// 3. 时间约束：计算 75%，截止 85%，不可抢占
///
/// 任何一步失败都停止并返回 false。
#[cfg(target_os = "macos")]
pub fn set_realtime(duty: Duration) -> bool {
    use thread_policy::*;

    let thread = unsafe { mach_thread_self() };

    let extended = ThreadExtendedPolicy { timeshare: 0 };
    let result = set(thread, THREAD_EXTENDED_POLICY, &extended, THREAD_EXTENDED_POLICY_COUNT);
    if result != 0 {
        log::warn!("thread_policy_set(EXTENDED) failed: {}", result);
        return false;
    }

    let precedence = ThreadPrecedencePolicy {
        importance: PRECEDENCE_IMPORTANCE,
    };
    let result = set(
        thread,
        THREAD_PRECEDENCE_POLICY,
        &precedence,
        THREAD_PRECEDENCE_POLICY_COUNT,
    );
    if result != 0 {
        log::warn!("thread_policy_set(PRECEDENCE) failed: {}", result);
        return false;
    }

    let constraint = TimeConstraint::for_duty(duty);
    let policy = ThreadTimeConstraintPolicy {
        period: ns_to_ticks(constraint.period_ns),
        computation: ns_to_ticks(constraint.computation_ns),
        constraint: ns_to_ticks(constraint.constraint_ns),
        preemptible: 0,
    };
    let result = set(
        thread,
        THREAD_TIME_CONSTRAINT_POLICY,
        &policy,
        THREAD_TIME_CONSTRAINT_POLICY_COUNT,
    );

    if result == 0 {
        log::debug!(
            "Callback thread time constraint set: period {:.2} ms",
            constraint.period_ns as f64 / 1_000_000.0
        );
        true
    } else {
        log::warn!("thread_policy_set(TIME_CONSTRAINT) failed: {}", result);
        false
    }
}

/// 把当前线程提升为实时调度
///
/// Linux 上 SCHED_FIFO 没有周期参数，`duty` 只用于日志。
/// 需要 CAP_SYS_NICE 或 rtprio 限额。
#[cfg(target_os = "linux")]
pub fn set_realtime(duty: Duration) -> bool {
    // musl 的 sched_param 还有其它字段
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = FIFO_PRIORITY;

    let result = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };

    if result == 0 {
        log::debug!(
            "Callback thread set to SCHED_FIFO {} (period {:.2} ms)",
            FIFO_PRIORITY,
            duty.as_secs_f64() * 1000.0
        );
        true
    } else {
        log::warn!(
            "Failed to set realtime priority (need CAP_SYS_NICE or rtprio): {}",
            std::io::Error::from_raw_os_error(result)
        );
        false
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn set_realtime(_duty: Duration) -> bool {
    log::debug!("Realtime priority not supported on this platform");
    false
}

/// 回调周期：`frames / sample_rate`，至少 1 ms
pub fn callback_duty(frames: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::from_millis(1);
    }
    let nanos = frames as u64 * 1_000_000_000 / sample_rate as u64;
    Duration::from_nanos(nanos).max(Duration::from_millis(1))
}

/// 设置当前线程名
///
/// 超过 15 字节的名字被截断。不分配内存，可以在回调里调用。
pub fn set_current_thread_name(name: &str) -> bool {
    let mut buf = [0u8; MAX_THREAD_NAME + 1];
    let mut len = name.len().min(MAX_THREAD_NAME);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    if buf[..len].contains(&0) {
        return false;
    }
    set_thread_name_raw(buf.as_ptr() as *const libc::c_char)
}

#[cfg(target_os = "linux")]
fn set_thread_name_raw(name: *const libc::c_char) -> bool {
    unsafe { libc::prctl(libc::PR_SET_NAME, name as libc::c_ulong, 0, 0, 0) == 0 }
}

#[cfg(target_os = "macos")]
fn set_thread_name_raw(name: *const libc::c_char) -> bool {
    unsafe { libc::pthread_setname_np(name) == 0 }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn set_thread_name_raw(_name: *const libc::c_char) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_constraint_ratios() {
        let c = TimeConstraint::for_duty(Duration::from_millis(10));
        assert_eq!(c.period_ns, 10_000_000);
        assert_eq!(c.computation_ns, 7_500_000);
        assert_eq!(c.constraint_ns, 8_500_000);
        assert!(c.computation_ns < c.constraint_ns && c.constraint_ns < c.period_ns);

        assert_eq!(TimeConstraint::for_duty(Duration::ZERO).period_ns, 1);
    }

    #[test]
    fn test_callback_duty() {
        assert_eq!(callback_duty(441, 44100), Duration::from_millis(10));
        assert_eq!(callback_duty(1, 48000), Duration::from_millis(1));
        assert_eq!(callback_duty(512, 0), Duration::from_millis(1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_thread_name_is_truncated() {
        let handle = std::thread::spawn(|| {
            assert!(set_current_thread_name("audio callback with a long name"));
            std::fs::read_to_string("/proc/thread-self/comm").unwrap()
        });
        let comm = handle.join().unwrap();
        assert_eq!(comm.trim_end_matches('\n'), "audio callback ");
    }

    #[test]
    fn test_thread_name_rejects_interior_nul() {
        assert!(!set_current_thread_name("bad\0name"));
    }

    /// 需要实时调度权限
    #[test]
    #[ignore]
    fn test_set_realtime() {
        let handle = std::thread::spawn(|| set_realtime(Duration::from_millis(10)));
        assert!(handle.join().unwrap());
    }
}
