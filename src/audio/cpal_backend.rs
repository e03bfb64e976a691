//! cpal 输出后端
//!
//! 通过 cpal 的默认 host 访问真实设备。
//! 设备序号 = `output_devices()` 枚举顺序，每次调用都重新枚举。
//!
//! 限制：
//! - cpal 没有建议延迟参数，`suggested_latency` 只在日志里出现
//! - cpal 不报告欠载状态，回调的 `status` 总是空；流错误只写日志

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::backend::{
    AudioBackend, BackendError, CallbackInfo, NativeStream, RenderCallback, StatusFlags,
    StreamParams,
};
use super::device::DeviceInfo;
use super::format::SampleFormat;
use crate::pipeline::OutputBuffer;

/// cpal 后端
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn output_device(index: usize) -> Result<cpal::Device, BackendError> {
        cpal::default_host()
            .output_devices()
            .map_err(|e| BackendError::Enumeration(e.to_string()))?
            .nth(index)
            .ok_or(BackendError::DeviceNotFound(index))
    }
}

fn max_output_channels(device: &cpal::Device) -> u16 {
    device
        .supported_output_configs()
        .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, BackendError> {
        let devices = cpal::default_host()
            .output_devices()
            .map_err(|e| BackendError::Enumeration(e.to_string()))?;

        Ok(devices
            .enumerate()
            .map(|(index, device)| {
                let name = device.name().unwrap_or_else(|_| format!("Device {}", index));
                DeviceInfo::new(index, name, max_output_channels(&device))
            })
            .collect())
    }

    fn default_output_device(&self) -> Option<usize> {
        let host = cpal::default_host();
        let default_name = host.default_output_device()?.name().ok()?;
        host.output_devices()
            .ok()?
            .position(|d| d.name().map(|n| n == default_name).unwrap_or(false))
    }

    fn open_stream(
        &self,
        params: &StreamParams,
        mut callback: RenderCallback,
    ) -> Result<Box<dyn NativeStream>, BackendError> {
        let device = Self::output_device(params.device_index)?;
        let device_name = device.name().unwrap_or_default();

        let config = cpal::StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size: match params.frames_per_buffer {
                Some(frames) => cpal::BufferSize::Fixed(frames),
                None => cpal::BufferSize::Default,
            },
        };
        let channels = (params.channels as usize).max(1);

        let on_error = move |err: cpal::StreamError| {
            log::error!("Output stream error: {}", err);
        };

        let stream = match params.sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let info = CallbackInfo {
                        frames: data.len() / channels,
                        status: StatusFlags::empty(),
                    };
                    callback(OutputBuffer::F32(data), info);
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let info = CallbackInfo {
                        frames: data.len() / channels,
                        status: StatusFlags::empty(),
                    };
                    callback(OutputBuffer::I16(data), info);
                },
                on_error,
                None,
            ),
        }
        .map_err(|e| BackendError::Rejected(e.to_string()))?;

        log::debug!(
            "cpal stream built on '{}' (suggested latency {:?}, buffer {:?})",
            device_name,
            params.suggested_latency,
            config.buffer_size
        );

        Ok(Box::new(CpalStream {
            stream: Some(StreamHolder(stream)),
        }))
    }
}

/// `cpal::Stream` 在部分平台上不是 Send
///
/// 流只在控制线程上创建、启动、停止和释放，不会被并发访问。
struct StreamHolder(cpal::Stream);

unsafe impl Send for StreamHolder {}

struct CpalStream {
    stream: Option<StreamHolder>,
}

impl NativeStream for CpalStream {
    fn start(&mut self) -> Result<(), BackendError> {
        let holder = self
            .stream
            .as_ref()
            .ok_or_else(|| BackendError::Start("stream already closed".into()))?;
        holder.0.play().map_err(|e| BackendError::Start(e.to_string()))
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        match &self.stream {
            Some(holder) => holder.0.pause().map_err(|e| BackendError::Stop(e.to_string())),
            None => Ok(()),
        }
    }

    fn close(mut self: Box<Self>) -> Result<(), BackendError> {
        // drop 之后 cpal 不再调用回调
        drop(self.stream.take());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 需要真实音频设备
    #[test]
    #[ignore]
    fn test_list_devices() {
        let backend = CpalBackend::new();
        let devices = backend.devices().unwrap();
        assert!(!devices.is_empty());
        if let Some(default) = backend.default_output_device() {
            assert!(devices.iter().any(|d| d.index == default));
        }
    }
}
