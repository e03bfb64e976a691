//! 播放器门面
//!
//! 控制线程的入口：播放/暂停、打开/关闭输出流、重置。
//!
//! 锁纪律：
//! - 所有控制操作都在播放器锁（`state`）内进行
//! - 阻塞的原生调用（stop/close）和渐变等待期间释放播放器锁
//! - 状态变化钩子在释放播放器锁之后调用
//!
//! 实时回调从不接触这里的任何锁。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::audio::{
    AudioSystem, FadeDirection, Fader, Handle, OutputError, OutputStream, Ref, SampleFormat,
    StreamFormat,
};
use crate::pipeline::{SampleProducer, Silence};

/// 播放器配置
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// 偏好设备名（精确匹配优先，其次前缀匹配）
    pub preferred_device: Option<String>,
    /// 关闭后不打开任何输出设备
    pub sound_output_enabled: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            sample_format: SampleFormat::F32,
            preferred_device: None,
            sound_output_enabled: true,
        }
    }
}

impl PlayerConfig {
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: self.sample_format,
        }
    }
}

/// 播放状态变化通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayingStateChange {
    pub old_state: bool,
    pub new_state: bool,
}

type StateChangeHook = dyn Fn(PlayingStateChange) -> anyhow::Result<()> + Send + Sync;

/// 播放器锁保护的状态
#[derive(Debug)]
pub struct PlayerState {
    playing: bool,
    preferred_device: Option<String>,
}

/// 播放器
pub struct Player {
    config: PlayerConfig,
    system: Arc<AudioSystem>,
    fader: Arc<Fader>,
    producer: Arc<dyn SampleProducer>,
    out_stream: Handle<OutputStream>,
    state: Mutex<PlayerState>,
    on_playing_state_change: Mutex<Option<Arc<StateChangeHook>>>,
}

impl Player {
    /// 只输出静音的播放器
    pub fn new(config: PlayerConfig, system: Arc<AudioSystem>) -> Self {
        Self::with_producer(config, system, Arc::new(Fader::new()), Arc::new(Silence))
    }

    /// `producer` 应当用同一个 `fader` 对输出施加渐变
    pub fn with_producer(
        config: PlayerConfig,
        system: Arc<AudioSystem>,
        fader: Arc<Fader>,
        producer: Arc<dyn SampleProducer>,
    ) -> Self {
        let preferred_device = config.preferred_device.clone();
        Self {
            config,
            system,
            fader,
            producer,
            out_stream: Handle::null(),
            state: Mutex::new(PlayerState {
                playing: false,
                preferred_device,
            }),
            on_playing_state_change: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn system(&self) -> &Arc<AudioSystem> {
        &self.system
    }

    pub fn fader(&self) -> &Arc<Fader> {
        &self.fader
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// 当前输出流（可能未打开）
    pub fn output_stream(&self) -> Option<Ref<OutputStream>> {
        self.out_stream.load()
    }

    /// 修改偏好设备，下次打开输出流时生效
    pub fn set_preferred_device(&self, device: Option<String>) {
        self.state.lock().preferred_device = device;
    }

    /// 注册播放状态变化钩子
    ///
    /// 钩子在控制线程上、播放器锁之外调用；返回的错误只写日志。
    pub fn set_on_playing_state_change<F>(&self, hook: F)
    where
        F: Fn(PlayingStateChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self.on_playing_state_change.lock() = Some(Arc::new(hook));
    }

    pub fn clear_on_playing_state_change(&self) {
        *self.on_playing_state_change.lock() = None;
    }

    /// 播放 / 暂停
    ///
    /// 切到播放时启动管线并打开输出流；打开失败则保持暂停并返回错误。
    /// 状态确实变化且输出流已打开时，启动对应方向的渐变。
    /// 没有出错时调用状态变化钩子（状态未变也调用）。
    pub fn set_playing(&self, playing: bool) -> Result<(), OutputError> {
        let (old_state, new_state, result) = {
            let mut state = self.state.lock();
            let old_state = state.playing;
            let mut new_state = playing;
            let mut result = Ok(());

            if new_state {
                self.producer.ensure_running();
                if let Err(err) = self.open_out_stream_locked(&state) {
                    log::warn!("Cannot start playing: {}", err);
                    new_state = false;
                    result = Err(err);
                }
            }

            if self.config.sound_output_enabled && self.is_out_stream_open() && old_state != new_state {
                self.fader.change(
                    FadeDirection::for_playing(new_state),
                    self.config.sample_rate,
                    false,
                );
            }
            state.playing = new_state;
            (old_state, new_state, result)
        };

        if result.is_ok() {
            self.notify_playing_state_change(PlayingStateChange {
                old_state,
                new_state,
            });
        }
        result
    }

    fn notify_playing_state_change(&self, change: PlayingStateChange) {
        // 克隆出来再调用：钩子里可以重新注册或操作播放器
        let hook = self.on_playing_state_change.lock().clone();
        if let Some(hook) = hook {
            if let Err(err) = hook(change) {
                log::error!("Playing state change hook failed: {:#}", err);
            }
        }
    }

    /// 打开输出流
    ///
    /// 声音输出关闭时直接成功。第一次调用时创建 `OutputStream`。
    pub fn open_out_stream(&self) -> Result<(), OutputError> {
        let state = self.state.lock();
        self.open_out_stream_locked(&state)
    }

    fn open_out_stream_locked(&self, state: &PlayerState) -> Result<(), OutputError> {
        if !self.config.sound_output_enabled {
            return Ok(());
        }

        let stream = match self.out_stream.load() {
            Some(stream) => stream,
            None => {
                let stream = Ref::new(OutputStream::new(
                    Arc::clone(&self.system),
                    Arc::clone(&self.fader),
                    Arc::clone(&self.producer),
                    self.config.stream_format(),
                ));
                self.out_stream.store(Some(stream.clone()));
                stream
            }
        };
        if stream.is_open() {
            return Ok(());
        }
        stream.open(state.preferred_device.as_deref())?;
        // 关闭时渐变器被静音；播放中重新打开要从静音重新淡入
        if state.playing {
            self.fader.change(FadeDirection::Up, self.config.sample_rate, false);
        }
        Ok(())
    }

    /// 关闭输出流
    ///
    /// `wait_for_pending_buffers` 为 true 时先让已排队的缓冲区播完。
    pub fn close_out_stream(&self, wait_for_pending_buffers: bool) {
        let mut state = self.state.lock();
        self.close_out_stream_locked(wait_for_pending_buffers, &mut state);
    }

    fn close_out_stream_locked(
        &self,
        wait_for_pending_buffers: bool,
        guard: &mut MutexGuard<'_, PlayerState>,
    ) {
        // 持有一份引用：close 期间释放了锁，reset 可能同时清空 handle
        let Some(stream) = self.out_stream.load() else {
            return;
        };
        if !stream.is_open() {
            return;
        }
        stream.close(wait_for_pending_buffers, guard);
    }

    pub fn is_out_stream_open(&self) -> bool {
        self.out_stream.load().map_or(false, |s| s.is_open())
    }

    /// 停止播放、释放输出流并重新初始化音频子系统
    pub fn reset_playing(&self) -> Result<(), OutputError> {
        if self.is_playing() {
            self.set_playing(false)?;
        }

        let old = {
            let _state = self.state.lock();
            self.out_stream.exchange(None)
        };
        // 最后一个引用在这里释放，析构时关闭原生流（锁外）
        drop(old);

        self.system.reinitialize()
    }

    /// 输出设备名称
    ///
    /// 已有输出流时返回它的设备，否则返回将会选择的设备，都没有时为空。
    pub fn sound_device(&self) -> String {
        if let Some(stream) = self.out_stream.load() {
            let name = stream.device_name();
            if !name.is_empty() {
                return name;
            }
        }

        let preferred = self.state.lock().preferred_device.clone();
        match self.system.select_device(preferred.as_deref()) {
            Ok(Some(device)) => device.name,
            Ok(None) => String::new(),
            Err(err) => {
                log::warn!("Cannot query sound devices: {}", err);
                String::new()
            }
        }
    }

    /// 平滑停止：淡出，等待渐变完成（最多 `timeout`），再关闭输出流
    ///
    /// 返回渐变是否在超时前完成。
    pub fn stop_smoothly(&self, timeout: Duration) -> Result<bool, OutputError> {
        self.set_playing(false)?;

        let mut state = self.state.lock();
        let finished = if self.is_out_stream_open() {
            self.fader.wait_until_settled_for(&mut state, timeout)
        } else {
            true
        };
        if !finished {
            log::warn!("Fade out did not finish within {:?}", timeout);
        }
        self.close_out_stream_locked(true, &mut state);
        Ok(finished)
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .field("out_stream", &self.out_stream)
            .finish_non_exhaustive()
    }
}
