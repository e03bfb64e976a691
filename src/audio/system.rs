//! 音频子系统
//!
//! 进程级状态：原生后端 + 已打开输出流计数。
//!
//! 计数从 0 开始，只在播放器锁内由 `OutputStream` 增减。
//! 计数为 0 时才允许重新初始化后端（刷新设备列表）。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::backend::AudioBackend;
use super::device::{self, DeviceInfo};
use super::stream::OutputError;

pub struct AudioSystem {
    backend: Arc<dyn AudioBackend>,
    open_streams: AtomicUsize,
}

impl AudioSystem {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        log::info!("Audio subsystem initialized (backend: {})", backend.name());
        Self {
            backend,
            open_streams: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &dyn AudioBackend {
        self.backend.as_ref()
    }

    /// 当前打开的输出流数量
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    pub(crate) fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stream_closed(&self) {
        let prev = self.open_streams.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "open stream counter underflow");
    }

    /// 重新初始化后端
    ///
    /// 仍有打开的流时拒绝。
    pub fn reinitialize(&self) -> Result<(), OutputError> {
        let open = self.open_stream_count();
        if open > 0 {
            return Err(OutputError::StreamsStillOpen(open));
        }
        self.backend.reinitialize()?;
        log::info!("Audio backend '{}' reinitialized", self.backend.name());
        Ok(())
    }

    /// 没有打开的流时刷新后端，否则什么也不做
    pub fn refresh_if_idle(&self) -> Result<(), OutputError> {
        if self.open_stream_count() == 0 {
            self.reinitialize()
        } else {
            Ok(())
        }
    }

    /// 所有有输出声道的设备
    pub fn output_devices(&self) -> Result<Vec<DeviceInfo>, OutputError> {
        let mut devices = self.backend.devices()?;
        devices.retain(DeviceInfo::has_output);
        Ok(devices)
    }

    /// 输出设备名称列表（空闲时先刷新后端）
    pub fn output_device_names(&self) -> Result<Vec<String>, OutputError> {
        self.refresh_if_idle()?;
        Ok(self
            .output_devices()?
            .into_iter()
            .map(|d| d.name)
            .collect())
    }

    /// 按偏好名称选择设备，返回完整的设备描述
    pub fn select_device(&self, preferred: Option<&str>) -> Result<Option<DeviceInfo>, OutputError> {
        let devices = self.backend.devices()?;
        let default_index = self.backend.default_output_device();
        let selected = device::select_device(&devices, default_index, preferred);
        Ok(selected.and_then(|index| devices.into_iter().find(|d| d.index == index)))
    }

    /// 平台默认输出设备的描述
    pub fn default_device(&self) -> Result<Option<DeviceInfo>, OutputError> {
        let Some(index) = self.backend.default_output_device() else {
            return Ok(None);
        };
        Ok(self
            .backend
            .devices()?
            .into_iter()
            .find(|d| d.index == index && d.has_output()))
    }
}

impl std::fmt::Debug for AudioSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSystem")
            .field("backend", &self.backend.name())
            .field("open_streams", &self.open_stream_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::virtual_backend::VirtualBackend;

    fn system() -> (VirtualBackend, AudioSystem) {
        let backend = VirtualBackend::new();
        backend.set_devices(
            vec![
                DeviceInfo::new(0, "Microphone", 0),
                DeviceInfo::new(1, "Speakers", 2),
                DeviceInfo::new(2, "HDMI", 8),
            ],
            Some(2),
        );
        let system = AudioSystem::new(Arc::new(backend.clone()));
        (backend, system)
    }

    #[test]
    fn test_reinitialize_refused_while_open() {
        let (backend, system) = system();
        assert!(system.reinitialize().is_ok());
        assert_eq!(backend.reinit_count(), 1);

        system.stream_opened();
        assert!(matches!(
            system.reinitialize(),
            Err(OutputError::StreamsStillOpen(1))
        ));
        assert!(system.refresh_if_idle().is_ok());
        assert_eq!(backend.reinit_count(), 1);

        system.stream_closed();
        assert_eq!(system.open_stream_count(), 0);
        assert!(system.reinitialize().is_ok());
        assert_eq!(backend.reinit_count(), 2);
    }

    #[test]
    fn test_output_device_names_skip_inputs() {
        let (_backend, system) = system();
        assert_eq!(
            system.output_device_names().unwrap(),
            vec!["Speakers".to_string(), "HDMI".to_string()]
        );
    }

    #[test]
    fn test_select_device() {
        let (_backend, system) = system();
        let selected = system.select_device(Some("speak")).unwrap().unwrap();
        assert_eq!(selected.name, "Speakers");

        let fallback = system.select_device(Some("USB")).unwrap().unwrap();
        assert_eq!(fallback.index, 2);

        assert_eq!(system.default_device().unwrap().unwrap().name, "HDMI");
    }
}
