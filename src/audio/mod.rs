//! 音频核心模块
//!
//! 包含：
//! - Format: 样本编码和流参数
//! - Ring Buffer: 数据回调路径和后端消费路径之间的 lock-free 帧缓冲
//! - Position: 单调播放位置
//! - Stats: 流统计

pub mod format;
pub mod position;
pub mod ring_buffer;
pub mod stats;

pub use format::{SampleFormat, StreamParams};
pub use position::PositionTracker;
pub use ring_buffer::FrameRingBuffer;
pub use stats::{StatsReport, StreamStats};
