//! 流生命周期状态机
//!
//! ```text
//!            start                 回调返回 0               drain 完成
//!   IDLE ─────────────▶ RUNNING ────────────────▶ DRAINING ────────────▶ STOPPED
//!   STOPPED ──────────▶    │                          │                    ▲
//!                          └──────── stop / 设备错误 ──┴────────────────────┘
//!   任意状态 ── destroy ──▶ DESTROYED
//! ```
//!
//! 所有转换都在同一把锁下完成，状态通知也在锁内入队，
//! 所以通知顺序与转换顺序一致。控制操作（start/stop/destroy）不会在持锁时阻塞，
//! 后端线程驱动的转换（drain、设备错误）在 stop 进行中一律放弃：stop 优先。
//!
//! 数据回调内部的 stop 不等待任何东西：没有其他控制操作时当场转入 STOPPED，
//! start 进行中则记为挂起，由 start 在提交或结束时完成。

use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::backend::DeviceError;
use crate::error::{Error, Result};

/// 流生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// 已创建，尚未 start
    Idle,
    Running,
    /// 数据回调已返回 0，只交付缓冲中的帧
    Draining,
    Stopped,
    /// 终态
    Destroyed,
}

/// 投递给状态回调的通知
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateEvent {
    Started,
    Stopped,
    Drained,
    Error(DeviceError),
}

/// 后端热路径看到的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HotState {
    /// 不交付、不调用数据回调（未启动 / 已停止 / stop 进行中）
    Off = 0,
    /// 交付并按需调用数据回调
    Running = 1,
    /// 只交付缓冲中的帧
    Draining = 2,
}

impl HotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Off,
        }
    }
}

/// 正在进行的控制操作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    None,
    Starting,
    Stopping,
}

struct Lifecycle {
    state: StreamState,
    control: Control,
    /// start 期间数据回调请求了 stop
    stop_pending: bool,
    /// destroy 时关闭，通知线程随之退出
    events: Option<Sender<StateEvent>>,
}

impl Lifecycle {
    fn emit(&self, event: StateEvent) {
        if let Some(events) = &self.events {
            // 通知线程只会在 events 关闭后退出，发送不会失败
            let _ = events.send(event);
        }
    }
}

/// stop 的第一阶段结果
#[derive(Debug, PartialEq, Eq)]
pub enum StopTicket {
    /// 本来就没在运行，stop 是空操作
    AlreadyStopped,
    /// 调用方负责等待在途回调、停止设备，然后调用 `finish_stop`
    Proceed,
}

pub struct StreamStateMachine {
    lifecycle: Mutex<Lifecycle>,
    settled: Condvar,
    hot: AtomicU8,
}

impl StreamStateMachine {
    pub fn new(events: Sender<StateEvent>) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: StreamState::Idle,
                control: Control::None,
                stop_pending: false,
                events: Some(events),
            }),
            settled: Condvar::new(),
            hot: AtomicU8::new(HotState::Off as u8),
        }
    }

    /// 当前状态
    pub fn state(&self) -> StreamState {
        self.lifecycle.lock().state
    }

    /// 热路径状态，无锁
    #[inline]
    pub fn hot(&self) -> HotState {
        HotState::from_u8(self.hot.load(Ordering::Acquire))
    }

    #[inline]
    fn set_hot(&self, hot: HotState) {
        self.hot.store(hot as u8, Ordering::Release);
    }

    /// 等待其他控制操作完成
    fn wait_control<'a>(
        &self,
        mut guard: parking_lot::MutexGuard<'a, Lifecycle>,
    ) -> parking_lot::MutexGuard<'a, Lifecycle> {
        while guard.control != Control::None {
            self.settled.wait(&mut guard);
        }
        guard
    }

    /// start 第一阶段：`IDLE|STOPPED` 才能启动
    pub fn begin_start(&self) -> Result<()> {
        let mut guard = self.wait_control(self.lifecycle.lock());
        match guard.state {
            StreamState::Idle | StreamState::Stopped => {
                guard.control = Control::Starting;
                Ok(())
            }
            StreamState::Running | StreamState::Draining => {
                Err(Error::InvalidState("stream already started"))
            }
            StreamState::Destroyed => Err(Error::InvalidState("stream destroyed")),
        }
    }

    /// 预填充期间数据回调是否请求了 stop
    pub fn stop_pending(&self) -> bool {
        self.lifecycle.lock().stop_pending
    }

    /// start 第二阶段：预填充完成，状态生效并通知 Started
    ///
    /// `draining` 为 true 表示预填充期间数据回调已经返回 0。
    /// 返回 false 表示预填充期间已请求 stop，流已经回到 STOPPED，不必启动设备。
    pub fn commit_start(&self, draining: bool, on_stop: impl FnOnce()) -> bool {
        let mut guard = self.lifecycle.lock();
        debug_assert_eq!(guard.control, Control::Starting);

        guard.state = if draining {
            StreamState::Draining
        } else {
            StreamState::Running
        };
        guard.emit(StateEvent::Started);

        if guard.stop_pending {
            self.settle_pending_stop(&mut guard, on_stop);
            return false;
        }
        self.set_hot(if draining {
            HotState::Draining
        } else {
            HotState::Running
        });
        true
    }

    fn settle_pending_stop(&self, guard: &mut Lifecycle, on_stop: impl FnOnce()) {
        guard.stop_pending = false;
        if !matches!(guard.state, StreamState::Running | StreamState::Draining) {
            return;
        }
        self.set_hot(HotState::Off);
        on_stop();
        guard.state = StreamState::Stopped;
        guard.emit(StateEvent::Stopped);
    }

    /// 设备启动失败：回到 STOPPED 并通知错误
    pub fn fail_start(&self, error: DeviceError, on_stop: impl FnOnce()) {
        let mut guard = self.lifecycle.lock();
        self.set_hot(HotState::Off);
        on_stop();
        if matches!(guard.state, StreamState::Running | StreamState::Draining) {
            guard.state = StreamState::Stopped;
            guard.emit(StateEvent::Error(error));
        }
        guard.stop_pending = false;
        guard.control = Control::None;
        self.settled.notify_all();
    }

    /// start 结束，完成设备启动期间挂起的 stop
    pub fn finish_start(&self, on_stop: impl FnOnce()) {
        let mut guard = self.lifecycle.lock();
        if guard.stop_pending {
            self.settle_pending_stop(&mut guard, on_stop);
        }
        guard.control = Control::None;
        self.settled.notify_all();
    }

    /// stop 第一阶段
    ///
    /// 并发的第二个 stop 会等第一个完成，然后看到 STOPPED 直接返回
    pub fn begin_stop(&self) -> StopTicket {
        let mut guard = self.wait_control(self.lifecycle.lock());
        match guard.state {
            StreamState::Running | StreamState::Draining => {
                guard.control = Control::Stopping;
                // 热路径立即停止交付和回调
                self.set_hot(HotState::Off);
                StopTicket::Proceed
            }
            _ => StopTicket::AlreadyStopped,
        }
    }

    /// stop 第二阶段：在途回调已返回、设备已停止
    pub fn finish_stop(&self, on_stop: impl FnOnce()) {
        let mut guard = self.lifecycle.lock();
        debug_assert_eq!(guard.control, Control::Stopping);
        on_stop();
        guard.state = StreamState::Stopped;
        guard.control = Control::None;
        guard.emit(StateEvent::Stopped);
        self.settled.notify_all();
    }

    /// 在数据回调内部 stop，不等待在途回调也不停止设备
    ///
    /// 热路径立即关闭；设备线程看到流不再活动后自行退出，下一次 start 或 destroy 回收。
    pub fn stop_from_callback(&self, on_stop: impl FnOnce()) {
        let mut guard = self.lifecycle.lock();
        match guard.control {
            // 另一个 stop 正在等这次回调返回
            Control::Stopping => {}
            Control::Starting => {
                guard.stop_pending = true;
                self.set_hot(HotState::Off);
            }
            Control::None => {
                guard.stop_pending = true;
                self.settle_pending_stop(&mut guard, on_stop);
            }
        }
    }

    /// `RUNNING → DRAINING`（数据回调返回 0）
    pub fn try_begin_drain(&self) -> bool {
        let mut guard = self.lifecycle.lock();
        if guard.control == Control::Stopping || guard.state != StreamState::Running {
            return false;
        }
        guard.state = StreamState::Draining;
        self.set_hot(HotState::Draining);
        true
    }

    /// `DRAINING → STOPPED`，并通知一次 Drained
    pub fn try_complete_drain(&self, on_stop: impl FnOnce()) -> bool {
        let mut guard = self.lifecycle.lock();
        if guard.control == Control::Stopping || guard.state != StreamState::Draining {
            return false;
        }
        self.set_hot(HotState::Off);
        on_stop();
        guard.state = StreamState::Stopped;
        guard.emit(StateEvent::Drained);
        true
    }

    /// 设备错误：`RUNNING|DRAINING → STOPPED`，并通知错误
    pub fn try_fail(&self, error: DeviceError, on_stop: impl FnOnce()) -> bool {
        let mut guard = self.lifecycle.lock();
        if guard.control == Control::Stopping
            || !matches!(guard.state, StreamState::Running | StreamState::Draining)
        {
            return false;
        }
        self.set_hot(HotState::Off);
        on_stop();
        guard.state = StreamState::Stopped;
        guard.emit(StateEvent::Error(error));
        true
    }

    /// 进入 DESTROYED 并关闭通知队列
    ///
    /// 调用方必须先完成 stop
    pub fn destroy(&self) {
        let mut guard = self.wait_control(self.lifecycle.lock());
        debug_assert!(
            !matches!(guard.state, StreamState::Running | StreamState::Draining),
            "destroy without stop"
        );
        guard.state = StreamState::Destroyed;
        self.set_hot(HotState::Off);
        guard.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};

    fn machine() -> (StreamStateMachine, Receiver<StateEvent>) {
        let (tx, rx) = unbounded();
        (StreamStateMachine::new(tx), rx)
    }

    fn drain_events(rx: &Receiver<StateEvent>) -> Vec<StateEvent> {
        rx.try_iter().collect()
    }

    fn start(sm: &StreamStateMachine) {
        sm.begin_start().unwrap();
        assert!(sm.commit_start(false, || {}));
        sm.finish_start(|| panic!("no pending stop"));
    }

    fn stop(sm: &StreamStateMachine) {
        if sm.begin_stop() == StopTicket::Proceed {
            sm.finish_stop(|| {});
        }
    }

    #[test]
    fn test_start_stop_cycle() {
        let (sm, rx) = machine();
        assert_eq!(sm.state(), StreamState::Idle);
        assert_eq!(sm.hot(), HotState::Off);

        start(&sm);
        assert_eq!(sm.state(), StreamState::Running);
        assert_eq!(sm.hot(), HotState::Running);

        stop(&sm);
        assert_eq!(sm.state(), StreamState::Stopped);
        assert_eq!(sm.hot(), HotState::Off);

        start(&sm);
        assert_eq!(sm.state(), StreamState::Running);

        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped, StateEvent::Started]
        );
    }

    #[test]
    fn test_start_twice_fails_without_state_change() {
        let (sm, rx) = machine();
        start(&sm);
        assert!(matches!(sm.begin_start(), Err(Error::InvalidState(_))));
        assert_eq!(sm.state(), StreamState::Running);
        assert_eq!(drain_events(&rx), vec![StateEvent::Started]);

        assert!(sm.try_begin_drain());
        assert!(sm.begin_start().is_err());
        assert_eq!(sm.state(), StreamState::Draining);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (sm, rx) = machine();
        // IDLE 上 stop 是空操作
        assert_eq!(sm.begin_stop(), StopTicket::AlreadyStopped);

        start(&sm);
        stop(&sm);
        assert_eq!(sm.begin_stop(), StopTicket::AlreadyStopped);
        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped]
        );
    }

    #[test]
    fn test_drain_sequence() {
        let (sm, rx) = machine();
        start(&sm);

        assert!(sm.try_begin_drain());
        assert_eq!(sm.hot(), HotState::Draining);
        // 已经在 DRAINING，不会重复进入
        assert!(!sm.try_begin_drain());

        assert!(sm.try_complete_drain(|| {}));
        assert!(!sm.try_complete_drain(|| {}));
        assert_eq!(sm.state(), StreamState::Stopped);

        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Drained]
        );
    }

    #[test]
    fn test_stop_wins_over_drain() {
        let (sm, rx) = machine();
        start(&sm);
        assert!(sm.try_begin_drain());

        // stop 进行中，drain 完成被放弃
        assert_eq!(sm.begin_stop(), StopTicket::Proceed);
        assert!(!sm.try_complete_drain(|| panic!("must not run")));
        assert!(!sm.try_fail(DeviceError::Disconnected, || panic!("must not run")));
        sm.finish_stop(|| {});

        // stop 完成之后同样放弃
        assert!(!sm.try_complete_drain(|| {}));

        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped]
        );
    }

    #[test]
    fn test_device_error() {
        let (sm, rx) = machine();
        // 未运行时忽略
        assert!(!sm.try_fail(DeviceError::Disconnected, || {}));

        start(&sm);
        assert!(sm.try_fail(DeviceError::Disconnected, || {}));
        assert_eq!(sm.state(), StreamState::Stopped);
        assert_eq!(sm.begin_stop(), StopTicket::AlreadyStopped);

        assert_eq!(
            drain_events(&rx),
            vec![
                StateEvent::Started,
                StateEvent::Error(DeviceError::Disconnected)
            ]
        );
    }

    #[test]
    fn test_fail_start() {
        let (sm, rx) = machine();
        sm.begin_start().unwrap();
        sm.commit_start(false, || {});
        sm.fail_start(DeviceError::StartFailed("no device".into()), || {});
        assert_eq!(sm.state(), StreamState::Stopped);
        // 可以再次 start
        start(&sm);

        assert_eq!(
            drain_events(&rx),
            vec![
                StateEvent::Started,
                StateEvent::Error(DeviceError::StartFailed("no device".into())),
                StateEvent::Started
            ]
        );
    }

    #[test]
    fn test_destroy_closes_events() {
        let (sm, rx) = machine();
        start(&sm);
        stop(&sm);
        sm.destroy();
        assert_eq!(sm.state(), StreamState::Destroyed);
        assert!(matches!(sm.begin_start(), Err(Error::InvalidState(_))));

        assert_eq!(drain_events(&rx).len(), 2);
        assert!(rx.recv().is_err(), "event channel should be closed");
    }

    #[test]
    fn test_concurrent_stop_waits_for_first() {
        use std::sync::Arc;
        use std::time::Duration;

        let (sm, rx) = machine();
        let sm = Arc::new(sm);
        start(&sm);

        assert_eq!(sm.begin_stop(), StopTicket::Proceed);

        let second = {
            let sm = Arc::clone(&sm);
            std::thread::spawn(move || sm.begin_stop())
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!second.is_finished(), "second stop must wait");
        sm.finish_stop(|| {});

        assert_eq!(second.join().unwrap(), StopTicket::AlreadyStopped);
        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped]
        );
    }

    #[test]
    fn test_stop_from_callback_while_running() {
        let (sm, rx) = machine();
        start(&sm);

        let mut frozen = 0;
        sm.stop_from_callback(|| frozen += 1);
        assert_eq!(sm.state(), StreamState::Stopped);
        assert_eq!(sm.hot(), HotState::Off);
        // 之后外部的 stop 是空操作
        assert_eq!(sm.begin_stop(), StopTicket::AlreadyStopped);
        sm.stop_from_callback(|| frozen += 1);
        assert_eq!(frozen, 1);

        start(&sm);
        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped, StateEvent::Started]
        );
    }

    #[test]
    fn test_stop_from_callback_during_preroll() {
        let (sm, rx) = machine();
        sm.begin_start().unwrap();

        sm.stop_from_callback(|| panic!("settled by commit_start"));
        assert!(sm.stop_pending());
        assert_eq!(sm.state(), StreamState::Idle);

        let mut frozen = false;
        assert!(!sm.commit_start(false, || frozen = true));
        assert!(frozen);
        assert!(!sm.stop_pending());
        assert_eq!(sm.hot(), HotState::Off);
        sm.finish_start(|| panic!("already settled"));

        assert_eq!(sm.state(), StreamState::Stopped);
        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped]
        );
        start(&sm);
    }

    #[test]
    fn test_stop_from_callback_during_device_start() {
        let (sm, rx) = machine();
        sm.begin_start().unwrap();
        assert!(sm.commit_start(false, || {}));

        // 设备已启动，start 还没结束
        sm.stop_from_callback(|| panic!("settled by finish_start"));
        assert_eq!(sm.hot(), HotState::Off);
        assert_eq!(sm.state(), StreamState::Running);

        let mut frozen = false;
        sm.finish_start(|| frozen = true);
        assert!(frozen);
        assert_eq!(sm.state(), StreamState::Stopped);
        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped]
        );
    }

    #[test]
    fn test_stop_from_callback_defers_to_running_stop() {
        let (sm, rx) = machine();
        start(&sm);
        assert_eq!(sm.begin_stop(), StopTicket::Proceed);

        sm.stop_from_callback(|| panic!("outer stop owns the transition"));
        sm.finish_stop(|| {});
        assert!(!sm.stop_pending());
        assert_eq!(
            drain_events(&rx),
            vec![StateEvent::Started, StateEvent::Stopped]
        );
    }
}
