//! 播放位置跟踪
//!
//! 位置 = 后端实际渲染到输出设备的帧数，而不是写入 ring buffer 的帧数。
//! 三个计数器的关系：
//!
//! ```text
//! frames_played <= frames_played + in_device <= frames_written
//! ```
//!
//! 所有操作都是 lock-free 的，可以在任意线程读取位置。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct PositionTracker {
    /// 写入 ring buffer 的帧数
    frames_written: AtomicU64,
    /// 后端报告已渲染的帧数
    frames_played: AtomicU64,
    /// 已交给后端但尚未报告渲染的帧数
    in_device: AtomicU64,
    /// stop 之后位置冻结
    frozen: AtomicBool,
    frozen_at: AtomicU64,
    /// 已经返回给调用方的最大值，保证读数单调
    last_reported: AtomicU64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            frames_written: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            in_device: AtomicU64::new(0),
            frozen: AtomicBool::new(true),
            frozen_at: AtomicU64::new(0),
            last_reported: AtomicU64::new(0),
        }
    }

    /// 数据回调产出的帧写入了 ring buffer
    #[inline]
    pub fn on_written(&self, frames: usize) {
        self.frames_written.fetch_add(frames as u64, Ordering::AcqRel);
    }

    /// 帧从 ring buffer 交给了后端
    #[inline]
    pub fn on_delivered(&self, frames: usize) {
        self.in_device.fetch_add(frames as u64, Ordering::AcqRel);
    }

    /// 后端报告 `frames` 帧已渲染
    ///
    /// 不会超过已交付的帧数；冻结期间的报告被丢弃。返回实际计入的帧数。
    #[inline]
    pub fn on_consumed(&self, frames: usize) -> u64 {
        if self.frozen.load(Ordering::Acquire) {
            return 0;
        }

        let mut applied = 0;
        let _ = self
            .in_device
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                applied = pending.min(frames as u64);
                Some(pending - applied)
            });

        self.frames_played.fetch_add(applied, Ordering::AcqRel);
        applied
    }

    /// 冻结位置（stop / drain 完成 / 设备错误）
    pub fn freeze(&self) {
        if self.frozen.swap(true, Ordering::AcqRel) {
            return;
        }
        self.frozen_at
            .store(self.frames_played.load(Ordering::Acquire), Ordering::Release);
    }

    /// 解冻（start）
    ///
    /// 上一轮交给后端但没来得及报告的帧被丢弃，不计入位置
    pub fn thaw(&self) {
        self.in_device.store(0, Ordering::Release);
        self.frozen.store(false, Ordering::Release);
    }

    /// 当前播放位置（帧）
    ///
    /// 连续读取永远不会减小
    #[inline]
    pub fn position(&self) -> u64 {
        let current = if self.frozen.load(Ordering::Acquire) {
            self.frozen_at.load(Ordering::Acquire)
        } else {
            self.frames_played.load(Ordering::Acquire)
        };
        let previous = self.last_reported.fetch_max(current, Ordering::AcqRel);
        previous.max(current)
    }

    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Acquire)
    }

    #[inline]
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Acquire)
    }

    /// 已交给后端但尚未报告渲染的帧数
    #[inline]
    pub fn in_device(&self) -> u64 {
        self.in_device.load(Ordering::Acquire)
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}
