//! 正弦测试信号源
//!
//! 回调线程里直接合成正弦波并施加渐变，没有工作线程和中间缓冲。
//! 用作 CLI 演示和集成测试的管线。

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::{OutputBuffer, SampleProducer};
use crate::audio::fader::Fader;
use crate::audio::format::Sample;

/// 正弦信号源
///
/// `ensure_running` 之前 `produce` 返回 0 帧（由输出流补静音）。
pub struct ToneSource {
    fader: Arc<Fader>,
    frequency: f32,
    amplitude: f32,
    sample_rate: u32,
    channels: usize,
    /// 每帧相位增量（弧度）
    phase_increment: f32,
    /// 当前相位，f32 位模式；只有回调线程写
    phase: AtomicU32,
    running: AtomicBool,
}

impl ToneSource {
    pub fn new(
        fader: Arc<Fader>,
        frequency: f32,
        amplitude: f32,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            fader,
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            sample_rate,
            channels: (channels as usize).max(1),
            phase_increment: TAU * frequency / sample_rate.max(1) as f32,
            phase: AtomicU32::new(0.0f32.to_bits()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 停止输出；之后 `produce` 返回 0 帧，相位保留
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            log::debug!("Tone source stopped");
        }
    }

    /// 当前相位（弧度，`[0, TAU)`）
    pub fn phase(&self) -> f32 {
        f32::from_bits(self.phase.load(Ordering::Relaxed))
    }

    fn synthesize<S: Sample>(&self, buf: &mut [S], frames: usize) -> usize {
        if !self.is_running() {
            return 0;
        }

        let channels = self.channels;
        let frames = frames.min(buf.len() / channels);
        let samples = &mut buf[..frames * channels];

        let mut phase = self.phase();
        for frame in samples.chunks_exact_mut(channels) {
            frame.fill(S::from_f32(phase.sin() * self.amplitude));
            phase = (phase + self.phase_increment) % TAU;
        }
        self.phase.store(phase.to_bits(), Ordering::Relaxed);

        self.fader.apply(samples, channels);
        frames
    }
}

impl SampleProducer for ToneSource {
    fn produce(&self, out: OutputBuffer<'_>, frames: usize) -> usize {
        match out {
            OutputBuffer::F32(buf) => self.synthesize(buf, frames),
            OutputBuffer::I16(buf) => self.synthesize(buf, frames),
        }
    }

    fn ensure_running(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            log::debug!(
                "Tone source started: {} Hz at {} Hz sample rate",
                self.frequency,
                self.sample_rate
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fader::FadeDirection;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_silent_before_start() {
        let tone = ToneSource::new(Arc::new(Fader::new()), 440.0, 0.5, 48000, 2);
        let mut buf = vec![1.0f32; 64];
        assert_eq!(tone.produce(OutputBuffer::F32(&mut buf), 32), 0);
        assert!(!tone.is_running());
    }

    #[test]
    fn test_produces_sine_at_full_gain() {
        let tone = ToneSource::new(Arc::new(Fader::new()), 1000.0, 0.5, 48000, 2);
        tone.ensure_running();

        let mut buf = vec![0.0f32; 512];
        assert_eq!(tone.produce(OutputBuffer::F32(&mut buf), 256), 256);

        // 声道相同，幅度不超过 amplitude
        for frame in buf.chunks(2) {
            assert_abs_diff_eq!(frame[0], frame[1]);
            assert!(frame[0].abs() <= 0.5 + 1e-6);
        }
        assert_abs_diff_eq!(buf[0], 0.0);
        assert_abs_diff_eq!(buf[2], (TAU * 1000.0 / 48000.0).sin() * 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_phase_continues_across_buffers() {
        let tone = ToneSource::new(Arc::new(Fader::new()), 1000.0, 1.0, 48000, 1);
        tone.ensure_running();

        let mut first = vec![0.0f32; 10];
        tone.produce(OutputBuffer::F32(&mut first), 10);
        let mut second = vec![0.0f32; 1];
        tone.produce(OutputBuffer::F32(&mut second), 1);

        let step = TAU * 1000.0 / 48000.0;
        assert_abs_diff_eq!(tone.phase(), 11.0 * step, epsilon = 1e-5);
        assert_abs_diff_eq!(second[0], (10.0 * step).sin(), epsilon = 1e-5);
    }

    #[test]
    fn test_short_buffer_limits_frames() {
        let tone = ToneSource::new(Arc::new(Fader::new()), 440.0, 0.5, 44100, 2);
        tone.ensure_running();
        let mut buf = vec![0.0f32; 7];
        assert_eq!(tone.produce(OutputBuffer::F32(&mut buf), 16), 3);
    }

    #[test]
    fn test_stop_returns_no_frames() {
        let tone = ToneSource::new(Arc::new(Fader::new()), 440.0, 0.5, 44100, 1);
        tone.ensure_running();
        tone.stop();
        assert!(!tone.is_running());
        let mut buf = vec![0.0f32; 8];
        assert_eq!(tone.produce(OutputBuffer::F32(&mut buf), 8), 0);
    }

    #[test]
    fn test_fader_applied_to_output() {
        let fader = Arc::new(Fader::new());
        fader.change(FadeDirection::Down, 48000, true);
        fader.finish();

        let tone = ToneSource::new(Arc::clone(&fader), 440.0, 0.8, 48000, 1);
        tone.ensure_running();

        let mut buf = vec![0i16; 256];
        assert_eq!(tone.produce(OutputBuffer::I16(&mut buf), 256), 256);
        assert!(buf.iter().all(|&s| s == 0));
    }
}
