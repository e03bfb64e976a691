//! 原生音频层接口
//!
//! 输出流只通过这两个 trait 接触原生 API：
//! - `AudioBackend`: 设备枚举、打开流、重新初始化
//! - `NativeStream`: 已打开的流（start / stop / close）
//!
//! 约定：`stop()` 与 `close()` 都是同步的，返回之后回调不会再被调用。

use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use super::device::DeviceInfo;
use super::format::SampleFormat;
use crate::pipeline::OutputBuffer;

bitflags! {
    /// 原生层随回调报告的状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u32 {
        /// 上次回调之后输出缓冲区欠载（已插入静音）
        const OUTPUT_UNDERFLOW = 1 << 0;
        /// 输出数据被丢弃
        const OUTPUT_OVERFLOW = 1 << 1;
        /// 流启动时的预填充
        const PRIMING_OUTPUT = 1 << 2;
    }
}

/// 单次回调的附加信息
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackInfo {
    /// 请求的帧数
    pub frames: usize,
    pub status: StatusFlags,
}

/// 实时回调
///
/// 由原生层的回调线程调用，缓冲区长度 = `frames × channels`。
pub type RenderCallback = Box<dyn FnMut(OutputBuffer<'_>, CallbackInfo) + Send + 'static>;

/// 打开输出流的参数
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub device_index: usize,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    /// 建议延迟
    pub suggested_latency: Duration,
    /// 每次回调帧数，`None` 由原生层决定
    pub frames_per_buffer: Option<u32>,
}

/// 原生层错误
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device {0} not found")]
    DeviceNotFound(usize),
    #[error("device rejected stream parameters: {0}")]
    Rejected(String),
    #[error("device enumeration failed: {0}")]
    Enumeration(String),
    #[error("failed to start stream: {0}")]
    Start(String),
    #[error("failed to stop stream: {0}")]
    Stop(String),
}

/// 已打开的原生输出流
pub trait NativeStream: Send {
    /// 开始回调
    fn start(&mut self) -> Result<(), BackendError>;

    /// 停止回调，已排队的缓冲区播放完毕后返回
    fn stop(&mut self) -> Result<(), BackendError>;

    /// 关闭流（未停止时立即中止）
    fn close(self: Box<Self>) -> Result<(), BackendError>;
}

/// 原生音频层
pub trait AudioBackend: Send + Sync {
    /// 后端名称（日志用）
    fn name(&self) -> &str;

    /// 枚举所有设备（含纯输入设备）
    fn devices(&self) -> Result<Vec<DeviceInfo>, BackendError>;

    /// 平台默认输出设备的序号
    fn default_output_device(&self) -> Option<usize>;

    /// 打开输出流（不启动）
    fn open_stream(
        &self,
        params: &StreamParams,
        callback: RenderCallback,
    ) -> Result<Box<dyn NativeStream>, BackendError>;

    /// 重新初始化（刷新设备列表）
    ///
    /// 只在没有打开的流时调用。
    fn reinitialize(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
