//! 定时器驱动的软件设备
//!
//! 每个流一个设备线程，按固定周期向核心请求一个周期的帧，
//! 并在 `device_latency_periods` 个周期之后报告这些帧已渲染，模拟硬件 FIFO。
//! 不输出任何声音，用于无声卡环境、测试和离线基准。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{
    Backend, Capabilities, DeviceConfig, DeviceError, DeviceStream, FrameSource,
};
use crate::audio::{SampleFormat, StreamParams};

/// 软件设备配置
#[derive(Clone, Debug)]
pub struct ClockConfig {
    /// 设备周期（毫秒）
    pub period_ms: u32,
    /// 帧从交付到报告渲染之间隔多少个周期
    pub device_latency_periods: u32,
    /// 是否尝试提升设备线程调度优先级
    pub realtime_priority: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            period_ms: 10,
            device_latency_periods: 2,
            realtime_priority: false,
        }
    }
}

/// 定时器驱动的软件后端
pub struct ClockBackend {
    config: ClockConfig,
}

impl ClockBackend {
    pub fn new(config: ClockConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }
}

impl Default for ClockBackend {
    fn default() -> Self {
        Self::new(ClockConfig::default())
    }
}

impl Backend for ClockBackend {
    fn name(&self) -> &'static str {
        "clock"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            // 不接受 3 字节紧凑 24-bit
            formats: vec![
                SampleFormat::S16LE,
                SampleFormat::S16BE,
                SampleFormat::Float32LE,
                SampleFormat::Float32BE,
            ],
            min_rate: 8000,
            max_rate: 384_000,
            max_channels: 32,
        }
    }

    fn open(
        &self,
        config: DeviceConfig,
        source: Arc<dyn FrameSource>,
    ) -> Result<Box<dyn DeviceStream>, DeviceError> {
        if self.config.period_ms == 0 {
            return Err(DeviceError::Failure("clock period must be non-zero".into()));
        }

        log::debug!(
            "Clock device opened: '{}' {} (latency {} frames, period {}ms)",
            config.name,
            config.params,
            config.latency_frames,
            self.config.period_ms
        );

        Ok(Box::new(ClockDevice {
            clock: self.config.clone(),
            name: config.name,
            params: config.params,
            source,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }))
    }
}

struct ClockDevice {
    clock: ClockConfig,
    name: String,
    params: StreamParams,
    source: Arc<dyn FrameSource>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceStream for ClockDevice {
    fn start(&mut self) -> Result<(), DeviceError> {
        // 上一轮线程可能已经自行退出（drain 完成 / 设备错误），先回收
        self.stop();

        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let source = Arc::clone(&self.source);
        let clock = self.clock.clone();
        let params = self.params;

        let handle = thread::Builder::new()
            .name(format!("clock-{}", self.name))
            .spawn(move || device_thread_main(source, running, clock, params))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                DeviceError::StartFailed(e.to_string())
            })?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.thread.take() {
            // 唤醒可能 park 中的设备线程
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Clock device thread '{}' panicked", self.name);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ClockDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 设备线程主函数
///
/// 缓冲区和 FIFO 在进入循环前一次性分配
fn device_thread_main(
    source: Arc<dyn FrameSource>,
    running: Arc<AtomicBool>,
    clock: ClockConfig,
    params: StreamParams,
) {
    if clock.realtime_priority {
        promote_current_thread();
    }

    let period = Duration::from_millis(clock.period_ms as u64);
    let period_frames = params.frames_for_ms(clock.period_ms).max(1);
    let latency_periods = clock.device_latency_periods as usize;

    let mut buffer = vec![0u8; params.frames_to_bytes(period_frames)];
    let mut fifo: VecDeque<usize> = VecDeque::with_capacity(latency_periods + 1);

    log::debug!(
        "Clock device thread started: {} frames/period, {} periods latency",
        period_frames,
        latency_periods
    );

    let mut next_tick = Instant::now();

    while running.load(Ordering::Acquire) && source.is_active() {
        let delivered = source.request_frames(&mut buffer, period_frames);
        fifo.push_back(delivered);

        while fifo.len() > latency_periods {
            if let Some(consumed) = fifo.pop_front() {
                source.report_consumed(consumed);
            }
        }

        next_tick += period;
        let now = Instant::now();
        if next_tick <= now {
            // 落后了，不补发，重新对齐时钟
            next_tick = now;
            continue;
        }

        // park 可以被 stop() 提前唤醒
        let deadline = next_tick;
        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }

    log::debug!("Clock device thread finished");
}

/// 提升当前线程调度优先级（尽力而为）
#[cfg(unix)]
fn promote_current_thread() {
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if result == 0 {
        log::debug!("Clock device thread priority raised");
    } else {
        log::debug!(
            "Failed to raise clock device thread priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn promote_current_thread() {}
