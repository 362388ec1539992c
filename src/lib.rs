//! cubeb-lw
//!
//! Callback-driven audio playback engine.
//!
//! 应用创建 `Context`，在其上创建 `Stream`，提供两个回调：
//! - 数据回调：后端需要更多音频时被调用，写入交错 PCM 帧，返回 0 表示结束
//! - 状态回调：流的状态变化（Started / Stopped / Drained / Error）
//!
//! ```no_run
//! use cubeb_lw::{Context, SampleFormat, StateEvent, StreamInfo, StreamParams};
//!
//! let ctx = Context::init("demo")?;
//! let params = StreamParams::new(SampleFormat::S16NE, 48000, 2);
//! let stream = ctx.stream_init(
//!     "silence",
//!     params,
//!     100,
//!     |info: &StreamInfo, buffer: &mut [u8], nframes: usize| {
//!         buffer[..nframes * info.params().bytes_per_frame()].fill(0);
//!         nframes
//!     },
//!     |info: &StreamInfo, event: StateEvent| println!("{}: {:?}", info.name(), event),
//! )?;
//! stream.start()?;
//! std::thread::sleep(std::time::Duration::from_millis(500));
//! stream.stop()?;
//! # Ok::<(), cubeb_lw::Error>(())
//! ```

pub mod audio;
pub mod backend;
pub mod context;
pub mod error;
pub mod stream;

pub use audio::{SampleFormat, StatsReport, StreamParams};
pub use backend::{ClockConfig, DeviceError};
pub use context::{Context, ContextConfig};
pub use error::{Error, ErrorCode, Result};
pub use stream::{DataCallback, StateCallback, StateEvent, Stream, StreamInfo, StreamState};
