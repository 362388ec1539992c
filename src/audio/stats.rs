//! 流统计模块
//!
//! 在后端消费路径上收集统计信息，所有操作都是 lock-free 的

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 流统计收集器
pub struct StreamStats {
    /// 数据回调调用次数
    callback_count: AtomicU64,
    /// 后端请求次数
    request_count: AtomicU64,
    /// 后端请求但 ring buffer 数据不够（RUNNING 状态下）
    underrun_count: AtomicU64,
    /// 设备错误次数
    error_count: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn on_callback(&self) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(
        &self,
        frames_written: u64,
        frames_played: u64,
        buffer_fill_ratio: f64,
        sample_rate: u32,
    ) -> StatsReport {
        StatsReport {
            callback_count: self.callback_count(),
            request_count: self.request_count(),
            underrun_count: self.underrun_count(),
            error_count: self.error_count(),
            frames_written,
            frames_played,
            buffer_fill_ratio,
            sample_rate,
        }
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callback_count: u64,
    pub request_count: u64,
    pub underrun_count: u64,
    pub error_count: u64,
    pub frames_written: u64,
    pub frames_played: u64,
    pub buffer_fill_ratio: f64,
    pub sample_rate: u32,
}

impl StatsReport {
    /// 已播放时长（秒）
    pub fn position_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_played as f64 / self.sample_rate as f64
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stream Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Data callbacks:   {}", self.callback_count)?;
        writeln!(f, "Device requests:  {}", self.request_count)?;
        writeln!(f, "Underruns:        {}", self.underrun_count)?;
        writeln!(f, "Device errors:    {}", self.error_count)?;
        writeln!(f)?;
        writeln!(f, "Frames written:   {}", self.frames_written)?;
        writeln!(
            f,
            "Frames played:    {} ({:.2} s)",
            self.frames_played,
            self.position_secs()
        )?;
        writeln!(f, "Buffer fill:      {:.1}%", self.buffer_fill_ratio * 100.0)?;
        Ok(())
    }
}
