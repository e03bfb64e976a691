//! 音频输出模块
//!
//! 包含：
//! - Handle: 原子可交换的引用计数指针
//! - Fader: 播放/暂停时的音量渐变
//! - Device: 输出设备选择
//! - Backend: 原生音频层接口（virtual / cpal）
//! - System: 进程级打开流计数
//! - Stream: 输出流生命周期和实时回调
//! - Realtime: 回调线程优先级与命名
//! - Stats: 回调统计

pub mod backend;
#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod device;
pub mod fader;
pub mod format;
pub mod handle;
pub mod realtime;
pub mod stats;
pub mod stream;
pub mod system;
pub mod virtual_backend;

pub use backend::{AudioBackend, BackendError, CallbackInfo, NativeStream, StatusFlags, StreamParams};
#[cfg(feature = "cpal")]
pub use cpal_backend::CpalBackend;
pub use device::{select_device, DeviceInfo};
pub use fader::{FadeDirection, Fader, FADE_TIME_MS};
pub use format::{Sample, SampleFormat};
pub use handle::{Handle, Ref, RefCount, RefCounted};
pub use stats::{CallbackStats, StatsReport};
pub use stream::{OutputError, OutputStream, StreamFormat};
pub use system::AudioSystem;
pub use virtual_backend::VirtualBackend;
