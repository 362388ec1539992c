//! 流格式和样本编码
//!
//! 帧（frame）= 每声道一个样本，是位置和时间统计的最小单位。
//! 缓冲区内一律使用交织布局：LRLRLR...

use std::fmt;

/// 样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// 16-bit 有符号整数，little-endian
    S16LE,
    /// 16-bit 有符号整数，big-endian
    S16BE,
    /// 24-bit 有符号整数，3 字节紧凑排列，little-endian
    S24LE,
    /// 32-bit 浮点，little-endian
    Float32LE,
    /// 32-bit 浮点，big-endian
    Float32BE,
}

impl SampleFormat {
    /// 本机字节序的 16-bit 整数
    #[cfg(target_endian = "little")]
    pub const S16NE: Self = Self::S16LE;
    #[cfg(target_endian = "big")]
    pub const S16NE: Self = Self::S16BE;

    /// 本机字节序的 32-bit 浮点
    #[cfg(target_endian = "little")]
    pub const FLOAT32NE: Self = Self::Float32LE;
    #[cfg(target_endian = "big")]
    pub const FLOAT32NE: Self = Self::Float32BE;

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::S16LE | Self::S16BE => 2,
            Self::S24LE => 3,
            Self::Float32LE | Self::Float32BE => 4,
        }
    }

    /// 将 [-1.0, 1.0] 的 f32 样本编码为本格式的字节
    ///
    /// 超出范围的值会被钳位。返回实际写入的样本数。
    pub fn write_f32(&self, samples: &[f32], output: &mut [u8]) -> usize {
        let bps = self.bytes_per_sample();
        let count = samples.len().min(output.len() / bps);

        for (i, &sample) in samples[..count].iter().enumerate() {
            let out = &mut output[i * bps..(i + 1) * bps];
            let s = sample.clamp(-1.0, 1.0);
            match self {
                Self::S16LE => out.copy_from_slice(&((s * i16::MAX as f32) as i16).to_le_bytes()),
                Self::S16BE => out.copy_from_slice(&((s * i16::MAX as f32) as i16).to_be_bytes()),
                Self::S24LE => {
                    // 24-bit 满幅 = 0x7FFFFF
                    let v = (s * 8_388_607.0) as i32;
                    out[0] = (v & 0xFF) as u8;
                    out[1] = ((v >> 8) & 0xFF) as u8;
                    out[2] = ((v >> 16) & 0xFF) as u8;
                }
                Self::Float32LE => out.copy_from_slice(&s.to_le_bytes()),
                Self::Float32BE => out.copy_from_slice(&s.to_be_bytes()),
            }
        }

        count
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::S16LE => "s16le",
            Self::S16BE => "s16be",
            Self::S24LE => "s24le",
            Self::Float32LE => "f32le",
            Self::Float32BE => "f32be",
        };
        f.write_str(name)
    }
}

/// 流参数：编码、采样率、声道数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamParams {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u16,
}

impl StreamParams {
    pub fn new(format: SampleFormat, rate: u32, channels: u16) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// 给定毫秒数对应的帧数，向上取整
    #[inline]
    pub fn frames_for_ms(&self, ms: u32) -> usize {
        (ms as u64 * self.rate as u64).div_ceil(1000) as usize
    }

    /// 帧数转换为字节数
    #[inline]
    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.bytes_per_frame()
    }
}

impl fmt::Display for StreamParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Hz {}ch", self.format, self.rate, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_frame() {
        assert_eq!(StreamParams::new(SampleFormat::S16LE, 44100, 1).bytes_per_frame(), 2);
        assert_eq!(StreamParams::new(SampleFormat::S24LE, 96000, 2).bytes_per_frame(), 6);
        assert_eq!(StreamParams::new(SampleFormat::Float32BE, 48000, 2).bytes_per_frame(), 8);
    }

    #[test]
    fn test_frames_for_ms_rounds_up() {
        let params = StreamParams::new(SampleFormat::S16LE, 44100, 1);
        assert_eq!(params.frames_for_ms(100), 4410);
        // 44.1 帧 → 45
        assert_eq!(params.frames_for_ms(1), 45);

        let params = StreamParams::new(SampleFormat::S16LE, 48000, 2);
        assert_eq!(params.frames_for_ms(2000), 96000);
    }

    #[test]
    fn test_s16_encoding_endianness() {
        let mut le = [0u8; 2];
        let mut be = [0u8; 2];
        SampleFormat::S16LE.write_f32(&[1.0], &mut le);
        SampleFormat::S16BE.write_f32(&[1.0], &mut be);
        assert_eq!(le, [0xFF, 0x7F]);
        assert_eq!(be, [0x7F, 0xFF]);
    }

    #[test]
    fn test_24bit_negative_encode() {
        let mut out = [0u8; 3];
        assert_eq!(SampleFormat::S24LE.write_f32(&[-1.0], &mut out), 1);
        // -0x7FFFFF 的补码，小端
        assert_eq!(out, [0x01, 0x00, 0x80]);
    }

    #[test]
    fn test_write_clamps_and_truncates() {
        let mut out = [0u8; 4];
        // 输出只容纳 1 个 f32 样本
        let written = SampleFormat::Float32LE.write_f32(&[2.0, 0.5], &mut out);
        assert_eq!(written, 1);
        assert_eq!(f32::from_le_bytes(out), 1.0);
    }
}
