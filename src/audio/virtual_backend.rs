//! 虚拟输出后端
//!
//! 在进程内模拟原生音频层：
//! - 设备列表、默认设备可配置
//! - 每个启动的流有一个渲染线程，按采样率节拍调用回调
//! - 可注入打开失败 / 启动失败，用于测试回退路径
//!
//! `stop()` 会 join 渲染线程，返回后回调不再运行，与真实后端的约定一致。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::backend::{
    AudioBackend, BackendError, CallbackInfo, NativeStream, RenderCallback, StatusFlags,
    StreamParams,
};
use super::device::DeviceInfo;
use super::format::SampleFormat;
use crate::pipeline::OutputBuffer;

/// 默认每次回调帧数
const DEFAULT_BUFFER_FRAMES: usize = 256;

struct VirtualConfig {
    devices: Vec<DeviceInfo>,
    default_device: Option<usize>,
    failing_devices: Vec<usize>,
    fail_start: bool,
    manual: bool,
    buffer_frames: usize,
}

struct Inner {
    config: Mutex<VirtualConfig>,
    reinit_count: AtomicUsize,
    open_attempts: AtomicUsize,
    running_streams: AtomicUsize,
    rendered_frames: AtomicU64,
}

/// 虚拟后端（克隆共享同一状态）
#[derive(Clone)]
pub struct VirtualBackend {
    inner: Arc<Inner>,
}

impl VirtualBackend {
    /// 创建带一个立体声输出设备的后端
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(VirtualConfig {
                    devices: vec![DeviceInfo::new(0, "Virtual Output", 2)],
                    default_device: Some(0),
                    failing_devices: Vec::new(),
                    fail_start: false,
                    manual: false,
                    buffer_frames: DEFAULT_BUFFER_FRAMES,
                }),
                reinit_count: AtomicUsize::new(0),
                open_attempts: AtomicUsize::new(0),
                running_streams: AtomicUsize::new(0),
                rendered_frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_devices(&self, devices: Vec<DeviceInfo>, default_device: Option<usize>) {
        let mut config = self.inner.config.lock();
        config.devices = devices;
        config.default_device = default_device;
    }

    /// 之后在该设备上打开流都会失败
    pub fn fail_open_on(&self, index: usize) {
        self.inner.config.lock().failing_devices.push(index);
    }

    pub fn clear_failures(&self) {
        let mut config = self.inner.config.lock();
        config.failing_devices.clear();
        config.fail_start = false;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.inner.config.lock().fail_start = fail;
    }

    /// 手动模式：启动流时不创建渲染线程
    pub fn set_manual(&self, manual: bool) {
        self.inner.config.lock().manual = manual;
    }

    pub fn set_buffer_frames(&self, frames: usize) {
        self.inner.config.lock().buffer_frames = frames.max(1);
    }

    pub fn reinit_count(&self) -> usize {
        self.inner.reinit_count.load(Ordering::Acquire)
    }

    pub fn open_attempts(&self) -> usize {
        self.inner.open_attempts.load(Ordering::Acquire)
    }

    /// 正在运行（已 start 未 stop）的流数量
    pub fn running_streams(&self) -> usize {
        self.inner.running_streams.load(Ordering::Acquire)
    }

    /// 所有流累计渲染的帧数
    pub fn rendered_frames(&self) -> u64 {
        self.inner.rendered_frames.load(Ordering::Acquire)
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for VirtualBackend {
    fn name(&self) -> &str {
        "virtual"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        Ok(self.inner.config.lock().devices.clone())
    }

    fn default_output_device(&self) -> Option<usize> {
        self.inner.config.lock().default_device
    }

    fn open_stream(
        &self,
        params: &StreamParams,
        callback: RenderCallback,
    ) -> Result<Box<dyn NativeStream>, BackendError> {
        self.inner.open_attempts.fetch_add(1, Ordering::AcqRel);
        let config = self.inner.config.lock();

        let device = config
            .devices
            .iter()
            .find(|d| d.index == params.device_index)
            .ok_or(BackendError::DeviceNotFound(params.device_index))?;

        if config.failing_devices.contains(&params.device_index) {
            return Err(BackendError::Rejected(format!(
                "device '{}' refused the stream",
                device.name
            )));
        }
        if params.channels == 0 || params.channels > device.max_output_channels {
            return Err(BackendError::Rejected(format!(
                "device '{}' supports at most {} channels, requested {}",
                device.name, device.max_output_channels, params.channels
            )));
        }
        if params.sample_rate == 0 {
            return Err(BackendError::Rejected("sample rate must be positive".into()));
        }

        let frames = params
            .frames_per_buffer
            .map(|f| f as usize)
            .unwrap_or(config.buffer_frames);

        log::debug!(
            "Virtual stream opened on '{}' ({} frames per buffer)",
            device.name,
            frames
        );

        Ok(Box::new(VirtualStream {
            inner: Arc::clone(&self.inner),
            params: params.clone(),
            frames,
            callback: Some(callback),
            render_thread: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: false,
        }))
    }

    fn reinitialize(&self) -> Result<(), BackendError> {
        self.inner.reinit_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// 虚拟输出流
struct VirtualStream {
    inner: Arc<Inner>,
    params: StreamParams,
    frames: usize,
    /// 未运行时回调放在这里，运行时移交给渲染线程
    callback: Option<RenderCallback>,
    render_thread: Option<JoinHandle<RenderCallback>>,
    stop_flag: Arc<AtomicBool>,
    running: bool,
}

impl NativeStream for VirtualStream {
    fn start(&mut self) -> Result<(), BackendError> {
        if self.running {
            return Ok(());
        }

        let (fail_start, manual) = {
            let config = self.inner.config.lock();
            (config.fail_start, config.manual)
        };
        if fail_start {
            return Err(BackendError::Start("virtual device refused to start".into()));
        }

        if !manual {
            let callback = self
                .callback
                .take()
                .ok_or_else(|| BackendError::Start("stream callback missing".into()))?;
            self.stop_flag.store(false, Ordering::Release);

            let renderer = Renderer {
                inner: Arc::clone(&self.inner),
                stop_flag: Arc::clone(&self.stop_flag),
                callback,
                frames: self.frames,
                channels: self.params.channels as usize,
                sample_rate: self.params.sample_rate,
                sample_format: self.params.sample_format,
            };

            let handle = std::thread::Builder::new()
                .name("virtual-output".into())
                .spawn(move || renderer.run())
                .map_err(|e| BackendError::Start(e.to_string()))?;
            self.render_thread = Some(handle);
        }

        self.running = true;
        self.inner.running_streams.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.inner.running_streams.fetch_sub(1, Ordering::AcqRel);

        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.render_thread.take() {
            let callback = handle
                .join()
                .map_err(|_| BackendError::Stop("render thread panicked".into()))?;
            self.callback = Some(callback);
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), BackendError> {
        self.stop()
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Virtual stream stop on drop failed: {}", e);
        }
    }
}

/// 渲染线程状态
struct Renderer {
    inner: Arc<Inner>,
    stop_flag: Arc<AtomicBool>,
    callback: RenderCallback,
    frames: usize,
    channels: usize,
    sample_rate: u32,
    sample_format: SampleFormat,
}

impl Renderer {
    /// 按节拍调用回调，直到 stop；返回回调以便再次 start
    fn run(mut self) -> RenderCallback {
        let len = self.frames * self.channels;
        let mut f32_buf = vec![0.0f32; if self.sample_format == SampleFormat::F32 { len } else { 0 }];
        let mut i16_buf = vec![0i16; if self.sample_format == SampleFormat::I16 { len } else { 0 }];

        let period =
            Duration::from_nanos(self.frames as u64 * 1_000_000_000 / self.sample_rate as u64);
        let mut next = Instant::now();
        let mut status = StatusFlags::PRIMING_OUTPUT;

        while !self.stop_flag.load(Ordering::Acquire) {
            let info = CallbackInfo {
                frames: self.frames,
                status,
            };
            match self.sample_format {
                SampleFormat::F32 => (self.callback)(OutputBuffer::F32(&mut f32_buf), info),
                SampleFormat::I16 => (self.callback)(OutputBuffer::I16(&mut i16_buf), info),
            }
            self.inner
                .rendered_frames
                .fetch_add(self.frames as u64, Ordering::AcqRel);

            next += period;
            let now = Instant::now();
            if next > now {
                status = StatusFlags::empty();
                std::thread::sleep(next - now);
            } else {
                // 落后于节拍：相当于设备欠载
                status = StatusFlags::OUTPUT_UNDERFLOW;
                next = now;
            }
        }

        self.callback
    }
}
