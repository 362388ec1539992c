//! 播放流
//!
//! 数据流向：
//!
//! ```text
//! 数据回调 ──(CallbackInvoker)──▶ FrameRingBuffer ──(request_frames)──▶ 后端设备
//!                                                                       │
//!                         PositionTracker ◀──(report_consumed)──────────┘
//! ```
//!
//! `StreamCore` 是后端看到的 `FrameSource`，由 `Arc` 在流句柄和设备之间共享；
//! `Stream` 是应用持有的句柄，负责 start/stop/destroy。

pub mod invoker;
pub mod state;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::{FrameRingBuffer, PositionTracker, StatsReport, StreamParams, StreamStats};
use crate::backend::{DeviceConfig, DeviceError, DeviceStream, FrameSource};
use crate::context::Context;
use crate::error::{Error, Result};

pub use invoker::{DataCallback, StateCallback};
pub use state::{StateEvent, StreamState};

use invoker::{in_data_callback, CallbackInvoker, Fill, StateNotifier};
use state::{HotState, StopTicket, StreamStateMachine};

/// 合法的延迟范围（毫秒）
pub const MIN_LATENCY_MS: u32 = 1;
pub const MAX_LATENCY_MS: u32 = 2000;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// 回调看到的流信息
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) params: StreamParams,
    pub(crate) latency_ms: u32,
}

impl StreamInfo {
    /// 进程内唯一的流编号
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    pub fn latency_ms(&self) -> u32 {
        self.latency_ms
    }
}

/// 流的共享核心，后端通过 `FrameSource` 驱动它
pub(crate) struct StreamCore {
    info: Arc<StreamInfo>,
    state: StreamStateMachine,
    invoker: CallbackInvoker,
    ring: FrameRingBuffer,
    position: PositionTracker,
    stats: StreamStats,
}

impl StreamCore {
    /// 热路径上调用数据回调补充 ring buffer
    fn produce(&self) -> Fill {
        let fill = self
            .invoker
            .fill(&self.ring, || self.state.hot() == HotState::Running);

        match fill {
            Fill::Produced(frames) => {
                self.position.on_written(frames);
                self.stats.on_callback();
            }
            Fill::EndOfStream => {
                self.stats.on_callback();
                self.state.try_begin_drain();
            }
            Fill::Skipped => {}
        }
        fill
    }

    /// start 时在调用方线程上预填充 ring buffer
    ///
    /// 返回回调是否已经返回 0。回调内部请求了 stop 时提前结束。
    fn preroll(&self) -> bool {
        loop {
            match self.invoker.fill(&self.ring, || !self.state.stop_pending()) {
                Fill::Produced(frames) => {
                    self.position.on_written(frames);
                    self.stats.on_callback();
                }
                Fill::EndOfStream => {
                    self.stats.on_callback();
                    return true;
                }
                Fill::Skipped => return false,
            }
        }
    }

    /// 缓冲和设备里都没有待播放的帧时完成 drain
    fn check_drained(&self) {
        if self.state.hot() == HotState::Draining
            && self.ring.available() == 0
            && self.position.in_device() == 0
        {
            self.state.try_complete_drain(|| self.position.freeze());
        }
    }
}

impl FrameSource for StreamCore {
    fn request_frames(&self, output: &mut [u8], count: usize) -> usize {
        self.stats.on_request();

        let frame_bytes = self.ring.frame_bytes();
        let count = count.min(output.len() / frame_bytes);
        let mut delivered = 0;
        let mut underrun = false;

        loop {
            let hot = self.state.hot();
            if hot == HotState::Off {
                break;
            }

            delivered += self
                .ring
                .read(&mut output[delivered * frame_bytes..count * frame_bytes]);

            if hot != HotState::Running {
                break;
            }

            if delivered == count {
                // 交付完成后把缓冲补满，下一次请求直接从缓冲读取
                self.produce();
                break;
            }

            underrun = true;
            if !matches!(self.produce(), Fill::Produced(_)) {
                break;
            }
        }

        if underrun && delivered < count {
            self.stats.record_underrun();
        }

        self.position.on_delivered(delivered);
        self.check_drained();
        delivered
    }

    fn report_consumed(&self, count: usize) {
        self.position.on_consumed(count);
        self.check_drained();
    }

    fn report_error(&self, error: DeviceError) {
        self.stats.record_error();
        self.state.try_fail(error, || self.position.freeze());
    }

    fn is_active(&self) -> bool {
        self.state.hot() != HotState::Off
    }
}

/// 播放流句柄
///
/// 借用创建它的 `Context`，所以上下文不可能先于流被销毁。
/// drop 即 destroy：强制 stop，等待所有回调结束，释放设备。
pub struct Stream<'ctx> {
    context: &'ctx Context,
    core: Arc<StreamCore>,
    device: Mutex<Box<dyn DeviceStream>>,
    notifier: StateNotifier,
}

impl<'ctx> Stream<'ctx> {
    /// 校验参数、分配缓冲、打开设备、启动通知线程
    ///
    /// 任何一步失败都不会留下半成品
    pub(crate) fn open<D, S>(
        context: &'ctx Context,
        name: &str,
        params: StreamParams,
        latency_ms: u32,
        data_callback: D,
        state_callback: S,
    ) -> Result<Self>
    where
        D: DataCallback,
        S: StateCallback,
    {
        if !(MIN_LATENCY_MS..=MAX_LATENCY_MS).contains(&latency_ms) {
            return Err(Error::InvalidLatency(latency_ms));
        }

        let backend = context.backend();
        backend
            .capabilities()
            .check(&params)
            .map_err(Error::InvalidFormat)?;

        let info = Arc::new(StreamInfo {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            params,
            latency_ms,
        });

        let latency_frames = params.frames_for_ms(latency_ms);
        let ring = FrameRingBuffer::new(latency_frames, params.bytes_per_frame());
        if context.config().lock_memory {
            ring.lock_memory();
        }

        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let core = Arc::new(StreamCore {
            invoker: CallbackInvoker::new(Arc::clone(&info), Box::new(data_callback), &ring),
            info: Arc::clone(&info),
            state: StreamStateMachine::new(events_tx),
            ring,
            position: PositionTracker::new(),
            stats: StreamStats::new(),
        });

        let device = backend.open(
            DeviceConfig {
                name: info.name.clone(),
                params,
                latency_frames,
            },
            Arc::clone(&core) as Arc<dyn FrameSource>,
        )?;

        let notifier = StateNotifier::spawn(Arc::clone(&info), Box::new(state_callback), events_rx)
            .map_err(|e| Error::Subsystem(format!("cannot spawn notifier thread: {}", e)))?;

        context.register(info.id, &info.name);

        log::info!(
            "Stream '{}' created: {}, latency {}ms ({} frames buffered)",
            info.name,
            params,
            latency_ms,
            core.ring.capacity()
        );

        Ok(Self {
            context,
            core,
            device: Mutex::new(device),
            notifier,
        })
    }

    /// 开始播放
    ///
    /// 先用数据回调预填充缓冲，再启动设备。只能从 IDLE 或 STOPPED 调用。
    pub fn start(&self) -> Result<()> {
        let core = &self.core;
        if in_data_callback(core.info.id) {
            return Err(Error::InvalidState(
                "start called from the stream's own data callback",
            ));
        }

        core.state.begin_start()?;

        let mut device = self.device.lock();
        // 回收上一轮可能已自行退出的设备
        device.stop();

        core.invoker.reset_cycle();
        core.position.thaw();

        let end_of_stream = core.preroll();
        let live = core
            .state
            .commit_start(end_of_stream, || core.position.freeze());

        if live {
            if let Err(e) = device.start() {
                log::error!("Stream '{}' failed to start: {}", core.info.name, e);
                core.state.fail_start(e.clone(), || core.position.freeze());
                return Err(Error::Backend(e));
            }
        }
        drop(device);

        core.state.finish_start(|| core.position.freeze());

        if live {
            log::info!(
                "Stream '{}' started at frame {}{}",
                core.info.name,
                core.position.position(),
                if end_of_stream { " (draining)" } else { "" }
            );
        } else {
            log::info!(
                "Stream '{}' stopped by its data callback during preroll",
                core.info.name
            );
        }
        Ok(())
    }

    /// 停止播放
    ///
    /// 幂等。返回后不会再有数据回调，位置冻结；缓冲中的帧保留到下一次 start。
    ///
    /// 在本流的数据回调内部调用时不阻塞：当前这次回调是最后一次，
    /// 设备留到下一次 start 或 destroy 时回收。
    pub fn stop(&self) -> Result<()> {
        let core = &self.core;
        if in_data_callback(core.info.id) {
            core.state.stop_from_callback(|| core.position.freeze());
            log::info!("Stream '{}' stop requested from its data callback", core.info.name);
            return Ok(());
        }

        if core.state.begin_stop() == StopTicket::AlreadyStopped {
            return Ok(());
        }

        core.invoker.wait_idle();
        self.device.lock().stop();
        core.state.finish_stop(|| core.position.freeze());

        log::info!(
            "Stream '{}' stopped at frame {}",
            core.info.name,
            core.position.position()
        );
        Ok(())
    }

    /// 已渲染的帧数
    ///
    /// 单调不减；STOPPED 期间保持不变
    pub fn position(&self) -> Result<u64> {
        Ok(self.core.position.position())
    }

    /// 销毁流，等价于 drop
    pub fn destroy(self) {}

    pub fn state(&self) -> StreamState {
        self.core.state.state()
    }

    pub fn stats(&self) -> StatsReport {
        let core = &self.core;
        core.stats.report(
            core.position.frames_written(),
            core.position.frames_played(),
            core.ring.fill_ratio(),
            core.info.params.rate,
        )
    }

    pub fn info(&self) -> &StreamInfo {
        &self.core.info
    }

    pub fn name(&self) -> &str {
        &self.core.info.name
    }

    pub fn params(&self) -> StreamParams {
        self.core.info.params
    }

    pub fn latency_ms(&self) -> u32 {
        self.core.info.latency_ms
    }
}

impl fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.core.info.id)
            .field("name", &self.core.info.name)
            .field("params", &self.core.info.params)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Stream<'_> {
    fn drop(&mut self) {
        let id = self.core.info.id;
        assert!(
            !in_data_callback(id),
            "stream '{}' destroyed from its own data callback",
            self.core.info.name
        );

        if let Err(e) = self.stop() {
            log::error!("Failed to stop stream '{}': {}", self.core.info.name, e);
        }

        self.core.state.destroy();
        self.device.get_mut().stop();
        self.core.invoker.release();
        // 事件通道已关闭，等待剩余通知投递完
        self.notifier.join();

        self.context.unregister(id);
        log::info!("Stream '{}' destroyed", self.core.info.name);
    }
}
