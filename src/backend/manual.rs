//! 由调用方驱动的后端
//!
//! 没有自己的线程：调用方通过 `ManualDevice` 手动请求帧、报告渲染、注入故障。
//! 用于确定性测试和离线渲染。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{
    Backend, Capabilities, DeviceConfig, DeviceError, DeviceStream, FrameSource,
};
use crate::audio::{SampleFormat, StreamParams};

/// 手动驱动后端
pub struct ManualBackend {
    capabilities: Capabilities,
    /// 只持弱引用：流销毁后设备随之释放
    devices: Mutex<Vec<Weak<ManualDevice>>>,
    fail_next_start: Arc<AtomicBool>,
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities {
            formats: vec![
                SampleFormat::S16LE,
                SampleFormat::S16BE,
                SampleFormat::S24LE,
                SampleFormat::Float32LE,
                SampleFormat::Float32BE,
            ],
            min_rate: 1,
            max_rate: 768_000,
            max_channels: 64,
        })
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            devices: Mutex::new(Vec::new()),
            fail_next_start: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 最近打开且仍存活的设备
    pub fn last_device(&self) -> Option<Arc<ManualDevice>> {
        self.devices.lock().iter().rev().find_map(Weak::upgrade)
    }

    /// 仍存活的设备数量
    pub fn device_count(&self) -> usize {
        self.devices
            .lock()
            .iter()
            .filter(|device| device.strong_count() > 0)
            .count()
    }

    /// 下一次设备 start 失败
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::Release);
    }
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn open(
        &self,
        config: DeviceConfig,
        source: Arc<dyn FrameSource>,
    ) -> Result<Box<dyn DeviceStream>, DeviceError> {
        let device = Arc::new(ManualDevice {
            name: config.name,
            params: config.params,
            source,
            running: AtomicBool::new(false),
        });
        let mut devices = self.devices.lock();
        devices.retain(|device| device.strong_count() > 0);
        devices.push(Arc::downgrade(&device));
        drop(devices);

        Ok(Box::new(ManualStream {
            device,
            fail_next_start: Arc::clone(&self.fail_next_start),
        }))
    }
}

struct ManualStream {
    device: Arc<ManualDevice>,
    fail_next_start: Arc<AtomicBool>,
}

impl DeviceStream for ManualStream {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.fail_next_start.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::StartFailed("injected start failure".into()));
        }
        self.device.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.device.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.device.is_running()
    }
}

/// 手动设备，调用方用它扮演硬件
pub struct ManualDevice {
    name: String,
    params: StreamParams,
    source: Arc<dyn FrameSource>,
    running: AtomicBool,
}

impl ManualDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    /// 设备是否处于 start 状态
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 请求 `frames` 帧，返回交付的字节（长度 = 交付帧数 × 帧大小）
    ///
    /// 设备未启动时不会调用核心
    pub fn pull(&self, frames: usize) -> Vec<u8> {
        if !self.is_running() {
            return Vec::new();
        }
        self.pull_unchecked(frames)
    }

    /// 不管设备是否启动都向核心请求帧，模拟不守规矩的后端
    pub fn pull_unchecked(&self, frames: usize) -> Vec<u8> {
        let frame_bytes = self.params.bytes_per_frame();
        let mut buffer = vec![0u8; frames * frame_bytes];
        let delivered = self.source.request_frames(&mut buffer, frames);
        buffer.truncate(delivered * frame_bytes);
        buffer
    }

    /// 报告 `frames` 帧已渲染
    pub fn consume(&self, frames: usize) {
        self.source.report_consumed(frames);
    }

    /// 请求并立即报告渲染，返回交付的帧数
    pub fn render(&self, frames: usize) -> usize {
        let delivered = self.pull(frames).len() / self.params.bytes_per_frame();
        self.consume(delivered);
        delivered
    }

    /// 注入设备故障
    pub fn fail(&self, error: DeviceError) {
        self.source.report_error(error);
    }

    pub fn is_source_active(&self) -> bool {
        self.source.is_active()
    }
}
