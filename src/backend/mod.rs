//! 音频后端抽象层
//!
//! 核心对后端只有三项要求：
//! - `request_frames`：后端向核心请求最多 N 帧送往硬件
//! - `report_consumed`：后端报告 N 帧已经真正渲染
//! - `report_error`：后端报告设备级故障
//!
//! 这三项由核心实现（`FrameSource`），后端只负责在自己的执行上下文里调用它们。
//! 任何具体后端（硬件回调线程、定时器驱动的软件设备……）都可以适配到这个接口。

pub mod clock;
pub mod manual;

use std::sync::Arc;

use thiserror::Error;

use crate::audio::{SampleFormat, StreamParams};

pub use clock::{ClockBackend, ClockConfig};
pub use manual::{ManualBackend, ManualDevice};

/// 设备级错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device disconnected")]
    Disconnected,
    #[error("failed to start device: {0}")]
    StartFailed(String),
    #[error("device failure: {0}")]
    Failure(String),
}

/// 核心提供给后端的帧来源
///
/// 后端在自己的执行上下文里调用这些方法；同一个流同一时刻只会有一个后端线程调用。
pub trait FrameSource: Send + Sync {
    /// 请求最多 `count` 帧写入 `output`，返回实际交付的帧数
    ///
    /// `output` 至少能容纳 `count` 帧。交付不足的部分由后端自行处理（通常填静音）。
    fn request_frames(&self, output: &mut [u8], count: usize) -> usize;

    /// `count` 帧已经被设备渲染
    fn report_consumed(&self, count: usize);

    /// 设备故障
    fn report_error(&self, error: DeviceError);

    /// 流是否还需要设备继续运转
    fn is_active(&self) -> bool;
}

/// 打开设备流所需的信息
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub name: String,
    pub params: StreamParams,
    /// 流请求的缓冲深度（帧）
    pub latency_frames: usize,
}

/// 后端打开的设备流
pub trait DeviceStream: Send {
    /// 开始驱动 FrameSource
    fn start(&mut self) -> Result<(), DeviceError>;

    /// 停止驱动
    ///
    /// 幂等。返回时设备不会再调用 FrameSource。
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// 后端能力
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub formats: Vec<SampleFormat>,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
}

impl Capabilities {
    /// 检查流参数是否被支持，不支持时返回原因
    pub fn check(&self, params: &StreamParams) -> Result<(), String> {
        if !self.formats.contains(&params.format) {
            return Err(format!("sample format {} not supported", params.format));
        }
        if params.rate < self.min_rate || params.rate > self.max_rate {
            return Err(format!(
                "sample rate {} outside [{}, {}]",
                params.rate, self.min_rate, self.max_rate
            ));
        }
        if params.channels == 0 || params.channels > self.max_channels {
            return Err(format!(
                "{} channels outside [1, {}]",
                params.channels, self.max_channels
            ));
        }
        Ok(())
    }
}

/// 后端
pub trait Backend: Send + Sync {
    /// 后端名称
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// 为一个流打开设备
    ///
    /// 设备在 `start` 之前不得调用 `source`。
    fn open(
        &self,
        config: DeviceConfig,
        source: Arc<dyn FrameSource>,
    ) -> Result<Box<dyn DeviceStream>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            formats: vec![SampleFormat::S16LE, SampleFormat::Float32LE],
            min_rate: 8000,
            max_rate: 192_000,
            max_channels: 8,
        }
    }

    #[test]
    fn test_capabilities_accept() {
        let params = StreamParams::new(SampleFormat::S16LE, 44100, 1);
        assert!(caps().check(&params).is_ok());
    }

    #[test]
    fn test_capabilities_reject() {
        let c = caps();
        assert!(c.check(&StreamParams::new(SampleFormat::S24LE, 44100, 2)).is_err());
        assert!(c.check(&StreamParams::new(SampleFormat::S16LE, 4000, 2)).is_err());
        assert!(c.check(&StreamParams::new(SampleFormat::S16LE, 44100, 0)).is_err());
        assert!(c.check(&StreamParams::new(SampleFormat::S16LE, 44100, 9)).is_err());
    }
}
