//! 输出样本格式
//!
//! 输出流的样本格式由播放器配置固定：Float32 或 Int16（交织）。

use std::fmt;
use std::str::FromStr;

/// 输出样本格式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleFormat {
    /// 32-bit 浮点，范围 [-1.0, 1.0]
    #[default]
    F32,
    /// 16-bit 有符号整数
    I16,
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::I16 => write!(f, "i16"),
        }
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float" | "float32" => Ok(Self::F32),
            "i16" | "int16" | "s16" => Ok(Self::I16),
            other => Err(format!("unknown sample format '{}' (expected f32 or i16)", other)),
        }
    }
}

/// 输出样本类型
///
/// 回调热路径上使用，所有方法都是纯计算，无分配。
pub trait Sample: Copy + Send + 'static {
    const FORMAT: SampleFormat;
    const SILENCE: Self;

    fn from_f32(value: f32) -> Self;

    fn to_f32(self) -> f32;

    /// 乘以增益
    #[inline]
    fn scale(self, gain: f32) -> Self {
        Self::from_f32(self.to_f32() * gain)
    }
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;
    const SILENCE: Self = 0.0;

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn scale(self, gain: f32) -> Self {
        self * gain
    }
}

impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;
    const SILENCE: Self = 0;

    #[inline]
    fn from_f32(value: f32) -> Self {
        (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32 / i16::MAX as f32
    }

    #[inline]
    fn scale(self, gain: f32) -> Self {
        (self as f32 * gain) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sample_format() {
        assert_eq!("f32".parse::<SampleFormat>().unwrap(), SampleFormat::F32);
        assert_eq!("Int16".parse::<SampleFormat>().unwrap(), SampleFormat::I16);
        assert!("u8".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_i16_conversion_clamps() {
        assert_eq!(i16::from_f32(1.5), i16::MAX);
        assert_eq!(i16::from_f32(-2.0), -i16::MAX);
        assert_eq!(i16::from_f32(0.0), 0);
    }

    #[test]
    fn test_scale() {
        assert_eq!(1000i16.scale(0.5), 500);
        assert_eq!(0.8f32.scale(0.25), 0.2);
        assert_eq!(1234i16.scale(0.0), 0);
    }
}
