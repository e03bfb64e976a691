//! 样本管线接口
//!
//! 输出流在实时回调中通过 `SampleProducer` 拉取样本。
//! 管线自己负责解码、混音和渐变（见 `Fader::apply`），输出层只关心帧数。
//!
//! 包含：
//! - `OutputBuffer`: 按样本格式区分的交织输出缓冲区
//! - `SampleProducer`: 管线接口
//! - `Silence`: 只输出静音的管线
//! - Tone: 正弦测试信号源

pub mod tone;

pub use tone::ToneSource;

use crate::audio::format::{Sample, SampleFormat};

/// 回调输出缓冲区（交织）
#[derive(Debug)]
pub enum OutputBuffer<'a> {
    F32(&'a mut [f32]),
    I16(&'a mut [i16]),
}

impl<'a> OutputBuffer<'a> {
    /// 样本总数（帧数 × 声道数）
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(b) => b.len(),
            Self::I16(b) => b.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn format(&self) -> SampleFormat {
        match self {
            Self::F32(_) => SampleFormat::F32,
            Self::I16(_) => SampleFormat::I16,
        }
    }

    /// 以更短的生命周期重新借用
    #[inline]
    pub fn reborrow(&mut self) -> OutputBuffer<'_> {
        match self {
            Self::F32(b) => OutputBuffer::F32(b),
            Self::I16(b) => OutputBuffer::I16(b),
        }
    }

    /// 从第 `start` 个样本开始写静音
    #[inline]
    pub fn fill_silence_from(&mut self, start: usize) {
        match self {
            Self::F32(b) => fill_silence(b, start),
            Self::I16(b) => fill_silence(b, start),
        }
    }
}

#[inline]
fn fill_silence<S: Sample>(buf: &mut [S], start: usize) {
    if start < buf.len() {
        buf[start..].fill(S::SILENCE);
    }
}

/// 样本管线
///
/// `produce` 在实时回调线程上调用：不能阻塞、加锁或分配内存。
pub trait SampleProducer: Send + Sync {
    /// 向 `out` 写入最多 `frames` 帧，返回实际写入的帧数
    ///
    /// 未写入的部分由输出层补静音。
    fn produce(&self, out: OutputBuffer<'_>, frames: usize) -> usize;

    /// 确保管线的工作线程已启动（控制线程调用）
    fn ensure_running(&self) {}
}

/// 静音管线
#[derive(Debug, Default, Clone, Copy)]
pub struct Silence;

impl SampleProducer for Silence {
    fn produce(&self, mut out: OutputBuffer<'_>, frames: usize) -> usize {
        out.fill_silence_from(0);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_silence_from() {
        let mut data = [1.0f32; 8];
        let mut out = OutputBuffer::F32(&mut data);
        out.fill_silence_from(6);
        assert_eq!(data, [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);

        let mut data = [7i16; 4];
        OutputBuffer::I16(&mut data).fill_silence_from(10);
        assert_eq!(data, [7; 4]);
    }

    #[test]
    fn test_silence_writes_zeros() {
        let mut data = [0.5f32; 16];
        let written = Silence.produce(OutputBuffer::F32(&mut data), 8);
        assert_eq!(written, 8);
        assert!(data.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_buffer_format() {
        let mut a = [0.0f32; 2];
        let mut b = [0i16; 2];
        assert_eq!(OutputBuffer::F32(&mut a).format(), SampleFormat::F32);
        assert_eq!(OutputBuffer::I16(&mut b).format(), SampleFormat::I16);
    }
}
