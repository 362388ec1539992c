//! 上下文：后端连接和流的所有者
//!
//! 进程内所有上下文共享一个音频子系统：第一个上下文创建时启动，
//! 最后一个上下文销毁时关闭。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::audio::StreamParams;
use crate::backend::{Backend, Capabilities, ClockBackend, ClockConfig};
use crate::error::{Error, Result};
use crate::stream::{DataCallback, StateCallback, Stream};

/// 上下文配置
#[derive(Clone, Debug, Default)]
pub struct ContextConfig {
    /// 软件设备时钟
    pub clock: ClockConfig,
    /// 是否 mlock 每个流的 ring buffer（失败只记录日志）
    pub lock_memory: bool,
}

struct Subsystem {
    contexts: usize,
    started_at: Option<Instant>,
}

static SUBSYSTEM: Mutex<Subsystem> = parking_lot::const_mutex(Subsystem {
    contexts: 0,
    started_at: None,
});

/// 持有期间子系统保持运行
struct SubsystemGuard;

impl SubsystemGuard {
    fn acquire() -> Self {
        let mut subsystem = SUBSYSTEM.lock();
        if subsystem.contexts == 0 {
            subsystem.started_at = Some(Instant::now());
            log::info!("Audio subsystem up");
        }
        subsystem.contexts += 1;
        Self
    }
}

impl Drop for SubsystemGuard {
    fn drop(&mut self) {
        let mut subsystem = SUBSYSTEM.lock();
        subsystem.contexts -= 1;
        if subsystem.contexts == 0 {
            let uptime = subsystem
                .started_at
                .take()
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or_default();
            log::info!("Audio subsystem down after {:.2}s", uptime);
        }
    }
}

/// 当前存活的上下文数量
pub fn live_contexts() -> usize {
    SUBSYSTEM.lock().contexts
}

/// 库上下文
pub struct Context {
    name: String,
    config: ContextConfig,
    backend: Arc<dyn Backend>,
    /// 存活的流：id → 名称
    streams: Mutex<BTreeMap<u64, String>>,
    _subsystem: SubsystemGuard,
}

impl Context {
    /// 使用默认配置和软件时钟后端创建上下文
    pub fn init(name: &str) -> Result<Self> {
        Self::with_config(name, ContextConfig::default())
    }

    pub fn with_config(name: &str, config: ContextConfig) -> Result<Self> {
        if config.clock.period_ms == 0 {
            return Err(Error::Subsystem("clock period must be non-zero".into()));
        }
        let backend = Arc::new(ClockBackend::new(config.clock.clone()));
        Ok(Self::build(name, config, backend))
    }

    /// 使用指定后端和默认配置创建上下文
    pub fn with_backend(name: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        Self::with_backend_and_config(name, backend, ContextConfig::default())
    }

    /// 使用指定后端创建上下文
    ///
    /// `config.clock` 只对软件时钟后端有意义，这里不做校验；
    /// `lock_memory` 等流级选项照常生效。
    pub fn with_backend_and_config(
        name: &str,
        backend: Arc<dyn Backend>,
        config: ContextConfig,
    ) -> Result<Self> {
        Ok(Self::build(name, config, backend))
    }

    fn build(name: &str, config: ContextConfig, backend: Arc<dyn Backend>) -> Self {
        let subsystem = SubsystemGuard::acquire();
        log::info!(
            "Context '{}' initialized with {} backend",
            name,
            backend.name()
        );
        Self {
            name: name.to_string(),
            config,
            backend,
            streams: Mutex::new(BTreeMap::new()),
            _subsystem: subsystem,
        }
    }

    /// 创建一个处于 IDLE 状态的流
    ///
    /// 数据回调和状态回调归流所有，流销毁时释放。
    /// 延迟超出 `[1, 2000]` 毫秒或后端不支持流参数时失败，不会留下半成品。
    pub fn stream_init<D, S>(
        &self,
        name: &str,
        params: StreamParams,
        latency_ms: u32,
        data_callback: D,
        state_callback: S,
    ) -> Result<Stream<'_>>
    where
        D: DataCallback,
        S: StateCallback,
    {
        Stream::open(self, name, params, latency_ms, data_callback, state_callback)
    }

    /// 销毁上下文，等价于 drop
    pub fn destroy(self) {}

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// 存活的流数量
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn register(&self, id: u64, name: &str) {
        self.streams.lock().insert(id, name.to_string());
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.streams.lock().remove(&id);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let streams = self.streams.get_mut();
        if !streams.is_empty() {
            // 流借用上下文，正常情况下走不到这里
            log::error!(
                "Context '{}' destroyed with {} live streams: {:?}",
                self.name,
                streams.len(),
                streams.values().collect::<Vec<_>>()
            );
        }
        debug_assert!(streams.is_empty(), "context destroyed with live streams");
        log::info!("Context '{}' destroyed", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;
    use crate::backend::ManualBackend;
    use crate::error::ErrorCode;
    use crate::stream::{StateEvent, StreamInfo};

    fn silence(info: &StreamInfo, buffer: &mut [u8], nframes: usize) -> usize {
        buffer[..nframes * info.params().bytes_per_frame()].fill(0);
        nframes
    }

    fn ignore(_: &StreamInfo, _: StateEvent) {}

    #[test]
    fn test_init_destroy_multiple_contexts() {
        let contexts: Vec<Context> = (0..4)
            .map(|i| Context::init(&format!("ctx-{}", i)).unwrap())
            .collect();
        assert!(live_contexts() >= 4);
        for ctx in contexts {
            ctx.destroy();
        }
    }

    #[test]
    fn test_context_variables() {
        let ctx = Context::init("variables").unwrap();
        assert_eq!(ctx.name(), "variables");
        assert_eq!(ctx.backend_name(), "clock");
        assert!(ctx
            .capabilities()
            .formats
            .contains(&SampleFormat::S16NE));
        assert_eq!(ctx.stream_count(), 0);
    }

    #[test]
    fn test_zero_clock_period_rejected() {
        let config = ContextConfig {
            clock: ClockConfig {
                period_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            Context::with_config("bad", config),
            Err(Error::Subsystem(_))
        ));
    }

    #[test]
    fn test_invalid_latency() {
        let ctx = Context::init("latency").unwrap();
        let params = StreamParams::new(SampleFormat::S16LE, 44100, 1);

        for latency in [0, 2001, u32::MAX] {
            let err = ctx
                .stream_init("bad", params, latency, silence, ignore)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidLatency(l) if l == latency));
            assert_eq!(err.code(), ErrorCode::Error);
        }

        // 边界值合法
        for latency in [1, 2000] {
            ctx.stream_init("ok", params, latency, silence, ignore)
                .unwrap()
                .destroy();
        }
        assert_eq!(ctx.stream_count(), 0);
    }

    #[test]
    fn test_invalid_format() {
        let ctx = Context::init("format").unwrap();
        let err = ctx
            .stream_init(
                "packed24",
                StreamParams::new(SampleFormat::S24LE, 48000, 2),
                50,
                silence,
                ignore,
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFormat);

        let err = ctx
            .stream_init(
                "too-many-channels",
                StreamParams::new(SampleFormat::S16LE, 48000, 64),
                50,
                silence,
                ignore,
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFormat);
        assert_eq!(ctx.stream_count(), 0);
    }

    #[test]
    fn test_stream_registry() {
        let backend = Arc::new(ManualBackend::new());
        let ctx = Context::with_backend("registry", backend.clone()).unwrap();
        let params = StreamParams::new(SampleFormat::FLOAT32NE, 48000, 2);

        // 按创建顺序销毁
        let streams: Vec<_> = (0..16)
            .map(|i| {
                ctx.stream_init(&format!("s{}", i), params, 50, silence, ignore)
                    .unwrap()
            })
            .collect();
        assert_eq!(ctx.stream_count(), 16);
        assert_eq!(backend.device_count(), 16);
        for stream in streams {
            stream.destroy();
        }
        assert_eq!(ctx.stream_count(), 0);

        // 逆序销毁
        let mut streams: Vec<_> = (0..16)
            .map(|i| {
                ctx.stream_init(&format!("r{}", i), params, 50, silence, ignore)
                    .unwrap()
            })
            .collect();
        while let Some(stream) = streams.pop() {
            stream.destroy();
        }
        assert_eq!(ctx.stream_count(), 0);
    }

    #[test]
    fn test_backend_with_config() {
        let backend = Arc::new(ManualBackend::new());
        let ctx = Context::with_backend_and_config(
            "locked",
            backend.clone(),
            ContextConfig {
                lock_memory: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(ctx.config().lock_memory);
        assert_eq!(ctx.backend_name(), "manual");

        // mlock 失败只记录日志，流照常创建和播放
        let params = StreamParams::new(SampleFormat::S16LE, 48000, 2);
        let stream = ctx.stream_init("locked", params, 20, silence, ignore).unwrap();
        stream.start().unwrap();
        let device = backend.last_device().unwrap();
        assert_eq!(device.render(64), 64);
        stream.stop().unwrap();
        drop(device);
        stream.destroy();

        let ctx = Context::with_backend("default", Arc::new(ManualBackend::new())).unwrap();
        assert!(!ctx.config().lock_memory);
    }

    #[test]
    fn test_subsystem_tracks_contexts() {
        let ctx = Context::init("subsystem").unwrap();
        assert!(live_contexts() >= 1);
        drop(ctx);
    }
}
