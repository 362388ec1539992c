//! 应用回调的唯一调用点
//!
//! - 数据回调：由 `CallbackInvoker` 在一把互斥锁下调用，同一个流的数据回调永不重入。
//!   stop/destroy 通过获取同一把锁等待在途回调返回。
//! - 状态回调：由每个流独立的通知线程按入队顺序调用。

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use super::state::StateEvent;
use super::StreamInfo;
use crate::audio::FrameRingBuffer;

/// 数据回调
///
/// 向 `buffer` 写入最多 `nframes` 帧（交错排列、协商好的编码），返回写入的帧数。
/// 返回 0 表示流结束；返回值超过 `nframes` 是契约违规。
pub trait DataCallback: Send + 'static {
    fn data(&mut self, stream: &StreamInfo, buffer: &mut [u8], nframes: usize) -> usize;
}

impl<F> DataCallback for F
where
    F: FnMut(&StreamInfo, &mut [u8], usize) -> usize + Send + 'static,
{
    #[inline]
    fn data(&mut self, stream: &StreamInfo, buffer: &mut [u8], nframes: usize) -> usize {
        self(stream, buffer, nframes)
    }
}

/// 状态回调
pub trait StateCallback: Send + 'static {
    fn state(&mut self, stream: &StreamInfo, event: StateEvent);
}

impl<F> StateCallback for F
where
    F: FnMut(&StreamInfo, StateEvent) + Send + 'static,
{
    fn state(&mut self, stream: &StreamInfo, event: StateEvent) {
        self(stream, event)
    }
}

thread_local! {
    /// 当前线程正在执行哪个流的数据回调（0 = 无）
    static IN_DATA_CALLBACK: Cell<u64> = const { Cell::new(0) };
}

/// 当前线程是否正在执行流 `id` 的数据回调
pub fn in_data_callback(id: u64) -> bool {
    IN_DATA_CALLBACK.with(|current| current.get() == id)
}

/// 回调期间设置线程标记，panic 时也会清除
struct CallbackMarker {
    previous: u64,
}

impl CallbackMarker {
    fn enter(id: u64) -> Self {
        let previous = IN_DATA_CALLBACK.with(|current| current.replace(id));
        Self { previous }
    }
}

impl Drop for CallbackMarker {
    fn drop(&mut self) {
        IN_DATA_CALLBACK.with(|current| current.set(self.previous));
    }
}

/// 一次填充的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// 回调产出了 n 帧并写入 ring buffer
    Produced(usize),
    /// 回调返回 0
    EndOfStream,
    /// 没有调用回调（流不在运行、缓冲区已满或回调已释放）
    Skipped,
}

struct DataSlot {
    callback: Option<Box<dyn DataCallback>>,
    /// 预分配的回调缓冲区，容量 = ring buffer 容量
    scratch: Vec<u8>,
}

pub struct CallbackInvoker {
    info: Arc<StreamInfo>,
    slot: Mutex<DataSlot>,
    /// 本轮回调是否已经返回过 0
    exhausted: AtomicBool,
}

impl CallbackInvoker {
    pub fn new(info: Arc<StreamInfo>, callback: Box<dyn DataCallback>, ring: &FrameRingBuffer) -> Self {
        Self {
            info,
            slot: Mutex::new(DataSlot {
                callback: Some(callback),
                scratch: vec![0u8; ring.capacity() * ring.frame_bytes()],
            }),
            exhausted: AtomicBool::new(false),
        }
    }

    /// 调用一次数据回调填充 `ring` 的空闲空间
    ///
    /// `live` 在持锁后检查，返回 false 时不调用回调；
    /// 这样 stop 一旦拿到锁，之后的填充都会被跳过。
    pub fn fill(&self, ring: &FrameRingBuffer, live: impl Fn() -> bool) -> Fill {
        let mut slot = self.slot.lock();
        if !live() {
            return Fill::Skipped;
        }

        let DataSlot { callback, scratch } = &mut *slot;
        let Some(callback) = callback.as_mut() else {
            return Fill::Skipped;
        };

        let nframes = ring.free_space();
        if nframes == 0 {
            return Fill::Skipped;
        }

        assert!(
            !self.exhausted.load(Ordering::Acquire),
            "data callback of stream '{}' invoked after it returned 0",
            self.info.name
        );

        let frame_bytes = ring.frame_bytes();
        let buffer = &mut scratch[..nframes * frame_bytes];

        let produced = {
            let _marker = CallbackMarker::enter(self.info.id);
            callback.data(&self.info, buffer, nframes)
        };

        assert!(
            produced <= nframes,
            "data callback of stream '{}' returned {} frames, only {} requested",
            self.info.name,
            produced,
            nframes
        );

        if produced == 0 {
            self.exhausted.store(true, Ordering::Release);
            return Fill::EndOfStream;
        }

        // 只有一个生产者，空闲空间不会变少
        let written = ring.write(&buffer[..produced * frame_bytes]);
        debug_assert_eq!(written, produced);
        Fill::Produced(written)
    }

    /// 等待在途的数据回调返回
    pub fn wait_idle(&self) {
        drop(self.slot.lock());
    }

    /// 新的一轮播放开始，允许回调再次被调用
    pub fn reset_cycle(&self) {
        self.exhausted.store(false, Ordering::Release);
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// 释放数据回调（destroy），此后所有填充都被跳过
    pub fn release(&self) {
        let callback = self.slot.lock().callback.take();
        // 在锁外析构用户对象
        drop(callback);
    }
}

/// 状态通知线程
pub struct StateNotifier {
    thread: Option<JoinHandle<()>>,
}

impl StateNotifier {
    /// 启动通知线程，所有发送端关闭后线程退出
    pub fn spawn(
        info: Arc<StreamInfo>,
        mut callback: Box<dyn StateCallback>,
        events: Receiver<StateEvent>,
    ) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("notify-{}", info.name))
            .spawn(move || {
                for event in events.iter() {
                    match &event {
                        StateEvent::Error(e) => {
                            log::warn!("Stream '{}' stopped by device error: {}", info.name, e)
                        }
                        StateEvent::Drained => log::info!("Stream '{}' drained", info.name),
                        _ => log::debug!("Stream '{}' {:?}", info.name, event),
                    }
                    callback.state(&info, event);
                }
            })?;

        Ok(Self {
            thread: Some(thread),
        })
    }

    /// 等待通知线程把剩余事件投递完并退出
    ///
    /// 调用前必须已经关闭事件通道。从状态回调内部调用时不能等待自己，线程改为分离。
    pub fn join(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            log::debug!("Stream destroyed from its own state callback, notifier detached");
            return;
        }

        if handle.join().is_err() {
            log::error!("State callback panicked");
        }
    }
}
