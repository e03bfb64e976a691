//! 输出流管理
//!
//! `OutputStream` 是与一个物理设备之间的连接：
//! - 控制线程（持有播放器锁）调用 `open()` / `close()`
//! - 原生层的回调线程调用渲染闭包，只接触 `CallbackShared`
//!
//! 生命周期：Closed → Opening → Open → Closing → Closed，由播放器锁串行化。
//! `close()` 在释放播放器锁的情况下停止并关闭原生流，
//! 返回之后回调不会再运行。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use super::backend::{BackendError, CallbackInfo, NativeStream, RenderCallback, StatusFlags, StreamParams};
use super::fader::{FadeDirection, Fader};
use super::format::SampleFormat;
use super::handle::{RefCount, RefCounted};
use super::realtime;
use super::stats::CallbackStats;
use super::system::AudioSystem;
use crate::pipeline::{OutputBuffer, SampleProducer};

/// 建议输出延迟
pub const SUGGESTED_LATENCY: Duration = Duration::from_millis(20);

/// 回调线程名
pub const CALLBACK_THREAD_NAME: &str = "audio callback";

/// 回调里每 N 次状态异常才写一次日志
const STATUS_LOG_INTERVAL: u64 = 64;

/// 输出错误
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("no sound device available")]
    NoDeviceAvailable,

    #[error("failed to open output stream on '{device}': {source}")]
    StreamNegotiationFailed {
        device: String,
        #[source]
        source: BackendError,
    },

    #[error("failed to start output stream: {0}")]
    StreamStartFailed(#[source] BackendError),

    #[error("{0} output stream(s) still open")]
    StreamsStillOpen(usize),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// 输出流格式（由播放器配置决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

/// 只能被消费一次的标志
///
/// 控制线程 `arm()`，回调线程 `take()`；`take()` 是单个 CAS，
/// 不存在先读后清的竞争。
#[derive(Debug, Default)]
pub struct OneShot(AtomicBool);

impl OneShot {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn arm(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// 已设置则清除并返回 true
    #[inline]
    pub fn take(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// 回调线程可见的状态
///
/// 回调只通过这里访问外部世界：不加锁、不分配。
pub struct CallbackShared {
    /// 第一次回调时提升线程优先级（独占 cache line，每次回调都会读）
    needs_realtime_reset: CachePadded<OneShot>,
    needs_thread_name: OneShot,
    stats: CallbackStats,
    producer: Arc<dyn SampleProducer>,
    format: StreamFormat,
}

impl CallbackShared {
    fn new(producer: Arc<dyn SampleProducer>, format: StreamFormat) -> Self {
        Self {
            needs_realtime_reset: CachePadded::new(OneShot::new()),
            needs_thread_name: OneShot::new(),
            stats: CallbackStats::new(),
            producer,
            format,
        }
    }

    fn arm(&self) {
        self.needs_realtime_reset.arm();
        self.needs_thread_name.arm();
    }

    /// 实时回调主体
    ///
    /// 写满请求的帧数：管线没写到的部分补静音，管线 panic 时整块静音。
    pub fn render(&self, mut out: OutputBuffer<'_>, info: CallbackInfo) {
        if self.needs_realtime_reset.take() {
            realtime::set_realtime(realtime::callback_duty(info.frames, self.format.sample_rate));
        }
        if self.needs_thread_name.take() {
            realtime::set_current_thread_name(CALLBACK_THREAD_NAME);
        }

        self.stats.on_callback(info.frames);
        self.check_status(info.status);

        let channels = (self.format.channels as usize).max(1);
        let frames = info.frames.min(out.len() / channels);

        let written = match catch_unwind(AssertUnwindSafe(|| {
            self.producer.produce(out.reborrow(), frames)
        })) {
            Ok(written) => written.min(frames),
            Err(_) => {
                let count = self.stats.producer_panics();
                self.stats.record_producer_panic();
                if count % STATUS_LOG_INTERVAL == 0 {
                    log::error!("Sample producer panicked in audio callback, output silenced");
                }
                0
            }
        };

        if written < frames {
            self.stats.record_short_read();
        }
        out.fill_silence_from(written * channels);
    }

    fn check_status(&self, status: StatusFlags) {
        if status.contains(StatusFlags::OUTPUT_UNDERFLOW) {
            let count = self.stats.underflow_count();
            self.stats.record_underflow();
            if count % STATUS_LOG_INTERVAL == 0 {
                log::warn!("Output underflow ({} so far)", count + 1);
            }
        }
        if status.contains(StatusFlags::OUTPUT_OVERFLOW) {
            let count = self.stats.overflow_count();
            self.stats.record_overflow();
            if count % STATUS_LOG_INTERVAL == 0 {
                log::warn!("Output overflow ({} so far)", count + 1);
            }
        }
    }

    pub fn stats(&self) -> &CallbackStats {
        &self.stats
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }
}

/// 控制线程独占的原生状态
#[derive(Default)]
struct NativeState {
    native: Option<Box<dyn NativeStream>>,
    device_name: String,
    device_index: Option<usize>,
}

/// 输出流
///
/// 由播放器通过 `Handle<OutputStream>` 持有。
pub struct OutputStream {
    refs: RefCount,
    system: Arc<AudioSystem>,
    fader: Arc<Fader>,
    shared: Arc<CallbackShared>,
    state: Mutex<NativeState>,
}

unsafe impl RefCounted for OutputStream {
    fn ref_count(&self) -> &RefCount {
        &self.refs
    }
}

impl OutputStream {
    pub fn new(
        system: Arc<AudioSystem>,
        fader: Arc<Fader>,
        producer: Arc<dyn SampleProducer>,
        format: StreamFormat,
    ) -> Self {
        Self {
            refs: RefCount::new(),
            system,
            fader,
            shared: Arc::new(CallbackShared::new(producer, format)),
            state: Mutex::new(NativeState::default()),
        }
    }

    /// 打开并启动输出流
    ///
    /// 已打开时直接返回。偏好设备打开失败时换平台默认设备重试一次。
    pub fn open(&self, preferred: Option<&str>) -> Result<(), OutputError> {
        let mut state = self.state.lock();
        if state.native.is_some() {
            return Ok(());
        }

        // 没有打开的流：设备列表可能变了
        if self.system.open_stream_count() == 0 {
            self.system.reinitialize()?;
        }

        let device = self
            .system
            .select_device(preferred)?
            .ok_or(OutputError::NoDeviceAvailable)?;
        state.device_name = device.name.clone();
        state.device_index = Some(device.index);

        let format = self.shared.format;
        let mut params = StreamParams {
            device_index: device.index,
            channels: format.channels,
            sample_format: format.sample_format,
            sample_rate: format.sample_rate,
            suggested_latency: SUGGESTED_LATENCY,
            frames_per_buffer: None,
        };

        let backend = self.system.backend();
        let mut native = match backend.open_stream(&params, self.render_callback()) {
            Ok(native) => native,
            Err(err) => {
                let default = self
                    .system
                    .default_device()?
                    .filter(|d| d.index != device.index);
                let Some(default) = default else {
                    return Err(OutputError::StreamNegotiationFailed {
                        device: device.name,
                        source: err,
                    });
                };

                log::warn!(
                    "Opening output stream on '{}' failed: {}. Trying again with default device '{}'",
                    device.name,
                    err,
                    default.name
                );
                params.device_index = default.index;
                let native = backend
                    .open_stream(&params, self.render_callback())
                    .map_err(|source| OutputError::StreamNegotiationFailed {
                        device: default.name.clone(),
                        source,
                    })?;
                state.device_name = default.name;
                state.device_index = Some(default.index);
                native
            }
        };

        self.system.stream_opened();
        self.shared.stats.reset();
        self.shared.arm();

        if let Err(err) = native.start() {
            if let Err(close_err) = native.close() {
                log::warn!("Closing unstarted output stream failed: {}", close_err);
            }
            self.system.stream_closed();
            return Err(OutputError::StreamStartFailed(err));
        }

        log::info!(
            "Output stream opened on '{}': {} Hz, {} ch, {}",
            state.device_name,
            format.sample_rate,
            format.channels,
            format.sample_format
        );
        state.native = Some(native);
        Ok(())
    }

    fn render_callback(&self) -> RenderCallback {
        let shared = Arc::clone(&self.shared);
        Box::new(move |out, info| shared.render(out, info))
    }

    /// 关闭输出流
    ///
    /// 调用者持有播放器锁 `guard`。渐变器重置为静音，
    /// 原生 stop/close 期间释放播放器锁，返回前重新获取。
    /// 已关闭时什么也不做。
    pub fn close<G>(&self, wait_for_pending_buffers: bool, guard: &mut MutexGuard<'_, G>) {
        let Some(native) = self.begin_close() else {
            return;
        };
        MutexGuard::unlocked(guard, || shutdown_native(native, wait_for_pending_buffers));
        self.finish_close();
    }

    /// 不持有播放器锁时关闭（立即中止，不等待已排队缓冲区）
    pub fn close_unlocked(&self) {
        if let Some(native) = self.begin_close() {
            shutdown_native(native, false);
            self.finish_close();
        }
    }

    fn begin_close(&self) -> Option<Box<dyn NativeStream>> {
        let native = self.state.lock().native.take()?;
        self.fader.change(FadeDirection::Down, 0, true);
        Some(native)
    }

    fn finish_close(&self) {
        self.system.stream_closed();
        log::info!("Output stream on '{}' closed", self.state.lock().device_name);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().native.is_some()
    }

    /// 最近一次打开所用设备的名称（未打开过时为空）
    pub fn device_name(&self) -> String {
        self.state.lock().device_name.clone()
    }

    pub fn device_index(&self) -> Option<usize> {
        self.state.lock().device_index
    }

    pub fn stats(&self) -> &CallbackStats {
        &self.shared.stats
    }

    pub fn format(&self) -> StreamFormat {
        self.shared.format
    }
}

fn shutdown_native(mut native: Box<dyn NativeStream>, wait_for_pending_buffers: bool) {
    if wait_for_pending_buffers {
        if let Err(err) = native.stop() {
            log::warn!("Stopping output stream failed: {}", err);
        }
    }
    if let Err(err) = native.close() {
        log::warn!("Closing output stream failed: {}", err);
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close_unlocked();
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutputStream")
            .field("open", &state.native.is_some())
            .field("device_name", &state.device_name)
            .field("device_index", &state.device_index)
            .field("format", &self.shared.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::DeviceInfo;
    use crate::audio::virtual_backend::VirtualBackend;
    use crate::pipeline::Silence;
    use approx::assert_relative_eq;
    use std::sync::atomic::AtomicUsize;

    const FORMAT: StreamFormat = StreamFormat {
        sample_rate: 48000,
        channels: 2,
        sample_format: SampleFormat::F32,
    };

    fn setup(devices: Vec<DeviceInfo>, default: Option<usize>) -> (VirtualBackend, OutputStream) {
        let backend = VirtualBackend::new();
        backend.set_devices(devices, default);
        let system = Arc::new(AudioSystem::new(Arc::new(backend.clone())));
        let stream = OutputStream::new(system, Arc::new(Fader::new()), Arc::new(Silence), FORMAT);
        (backend, stream)
    }

    fn two_devices() -> Vec<DeviceInfo> {
        vec![DeviceInfo::new(0, "Speakers", 2), DeviceInfo::new(1, "USB DAC", 2)]
    }

    #[test]
    fn test_one_shot_take_once() {
        let flag = OneShot::new();
        assert!(!flag.take());
        flag.arm();
        assert!(flag.is_armed());
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn test_open_close_updates_counter() {
        let (backend, stream) = setup(two_devices(), Some(0));
        let lock = Mutex::new(());

        stream.open(Some("USB")).unwrap();
        assert!(stream.is_open());
        assert_eq!(stream.device_name(), "USB DAC");
        assert_eq!(stream.device_index(), Some(1));
        assert_eq!(stream.system.open_stream_count(), 1);
        assert_eq!(backend.running_streams(), 1);

        // 已打开时再 open 是空操作
        stream.open(Some("Speakers")).unwrap();
        assert_eq!(stream.device_name(), "USB DAC");
        assert_eq!(stream.system.open_stream_count(), 1);

        let mut guard = lock.lock();
        stream.close(true, &mut guard);
        assert!(!stream.is_open());
        assert_eq!(stream.system.open_stream_count(), 0);
        assert_eq!(backend.running_streams(), 0);

        // 第二次 close 是空操作
        stream.close(false, &mut guard);
        assert_eq!(stream.system.open_stream_count(), 0);
    }

    #[test]
    fn test_open_reinitializes_when_idle() {
        let (backend, stream) = setup(two_devices(), Some(0));
        stream.open(None).unwrap();
        assert_eq!(backend.reinit_count(), 1);
        stream.close_unlocked();
        stream.open(None).unwrap();
        assert_eq!(backend.reinit_count(), 2);
    }

    #[test]
    fn test_open_without_devices_fails() {
        let (_backend, stream) = setup(vec![DeviceInfo::new(0, "Mic", 0)], None);
        assert!(matches!(stream.open(None), Err(OutputError::NoDeviceAvailable)));
        assert!(!stream.is_open());
        assert_eq!(stream.system.open_stream_count(), 0);
    }

    #[test]
    fn test_open_falls_back_to_default_device() {
        let (backend, stream) = setup(two_devices(), Some(0));
        backend.fail_open_on(1);

        stream.open(Some("USB DAC")).unwrap();
        assert!(stream.is_open());
        assert_eq!(stream.device_name(), "Speakers");
        assert_eq!(stream.device_index(), Some(0));
        assert_eq!(backend.open_attempts(), 2);
    }

    #[test]
    fn test_open_fails_when_default_rejected() {
        let (backend, stream) = setup(two_devices(), Some(0));
        backend.fail_open_on(0);

        let err = stream.open(None).unwrap_err();
        match err {
            OutputError::StreamNegotiationFailed { device, .. } => assert_eq!(device, "Speakers"),
            other => panic!("unexpected error: {other}"),
        }
        // 默认设备本身失败时不重试
        assert_eq!(backend.open_attempts(), 1);
        assert_eq!(stream.system.open_stream_count(), 0);
    }

    #[test]
    fn test_start_failure_restores_counter() {
        let (backend, stream) = setup(two_devices(), Some(0));
        backend.set_fail_start(true);

        assert!(matches!(stream.open(None), Err(OutputError::StreamStartFailed(_))));
        assert!(!stream.is_open());
        assert_eq!(stream.system.open_stream_count(), 0);
    }

    #[test]
    fn test_close_resets_fader_to_muted() {
        let (_backend, stream) = setup(two_devices(), Some(0));
        stream.open(None).unwrap();
        stream.fader.change(FadeDirection::Up, 48000, false);
        stream.fader.finish();
        assert_eq!(stream.fader.current(), 2400);

        stream.close_unlocked();
        assert_eq!(stream.fader.limit(), 0);
        assert_eq!(stream.fader.current(), 0);
        assert_eq!(stream.fader.direction(), FadeDirection::Down);
        assert!(stream.fader.is_finished());
        assert_relative_eq!(stream.fader.gain(), 0.0);
    }

    #[test]
    fn test_close_releases_player_lock() {
        let (_backend, stream) = setup(two_devices(), Some(0));
        let lock = Arc::new(Mutex::new(0u32));
        stream.open(None).unwrap();

        let mut guard = lock.lock();
        *guard = 1;
        stream.close(true, &mut guard);
        // guard 仍然有效并持有锁
        assert_eq!(*guard, 1);
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn test_drop_closes_open_stream() {
        let (backend, stream) = setup(two_devices(), Some(0));
        let system = Arc::clone(&stream.system);
        stream.open(None).unwrap();
        drop(stream);
        assert_eq!(system.open_stream_count(), 0);
        assert_eq!(backend.running_streams(), 0);
    }

    #[test]
    fn test_flags_armed_on_every_open() {
        let (backend, stream) = setup(two_devices(), Some(0));
        // 不起渲染线程，由测试直接驱动回调
        backend.set_manual(true);

        for _ in 0..2 {
            stream.open(None).unwrap();
            assert!(stream.shared.needs_realtime_reset.is_armed());
            assert!(stream.shared.needs_thread_name.is_armed());

            let mut buf = vec![0.0f32; 64];
            let info = CallbackInfo { frames: 32, status: StatusFlags::empty() };
            stream.shared.render(OutputBuffer::F32(&mut buf), info);
            assert!(!stream.shared.needs_realtime_reset.is_armed());
            assert!(!stream.shared.needs_thread_name.is_armed());

            stream.close_unlocked();
        }
    }

    struct HalfProducer;

    impl SampleProducer for HalfProducer {
        fn produce(&self, out: OutputBuffer<'_>, frames: usize) -> usize {
            let half = frames / 2;
            if let OutputBuffer::F32(buf) = out {
                buf[..half * 2].fill(0.5);
            }
            half
        }
    }

    struct PanickingProducer(AtomicUsize);

    impl SampleProducer for PanickingProducer {
        fn produce(&self, out: OutputBuffer<'_>, _frames: usize) -> usize {
            self.0.fetch_add(1, Ordering::SeqCst);
            if let OutputBuffer::F32(buf) = out {
                buf.fill(0.9);
            }
            panic!("producer failure");
        }
    }

    #[test]
    fn test_render_zero_fills_short_reads() {
        let shared = CallbackShared::new(Arc::new(HalfProducer), FORMAT);
        let mut buf = vec![1.0f32; 16];
        shared.render(
            OutputBuffer::F32(&mut buf),
            CallbackInfo { frames: 8, status: StatusFlags::OUTPUT_UNDERFLOW },
        );

        assert!(buf[..8].iter().all(|&s| s == 0.5));
        assert!(buf[8..].iter().all(|&s| s == 0.0));
        assert_eq!(shared.stats().short_reads(), 1);
        assert_eq!(shared.stats().underflow_count(), 1);
        assert_eq!(shared.stats().frames_rendered(), 8);
    }

    #[test]
    fn test_render_survives_producer_panic() {
        let producer = Arc::new(PanickingProducer(AtomicUsize::new(0)));
        let shared = CallbackShared::new(producer.clone(), FORMAT);
        let mut buf = vec![1.0f32; 16];
        for _ in 0..2 {
            shared.render(
                OutputBuffer::F32(&mut buf),
                CallbackInfo { frames: 8, status: StatusFlags::OUTPUT_OVERFLOW },
            );
        }

        assert!(buf.iter().all(|&s| s == 0.0));
        assert_eq!(producer.0.load(Ordering::SeqCst), 2);
        assert_eq!(shared.stats().producer_panics(), 2);
        assert_eq!(shared.stats().overflow_count(), 2);
    }
}
