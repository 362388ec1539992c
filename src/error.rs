//! 错误类型
//!
//! 对外只暴露两类错误码：通用错误和格式错误。
//! 运行期设备错误不会同步返回，而是通过状态回调异步通知。

use thiserror::Error;

use crate::backend::DeviceError;

/// 错误码（成功由 `Ok(_)` 表示）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// 通用错误：后端失败、非法状态转换、资源耗尽
    Error,
    /// 后端不支持请求的编码/采样率/声道组合，只会在 stream_init 时出现
    InvalidFormat,
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Latency {0} ms outside valid range [1, 2000]")]
    InvalidLatency(u32),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Backend error: {0}")]
    Backend(#[from] DeviceError),

    #[error("Audio subsystem unavailable: {0}")]
    Subsystem(String),
}

impl Error {
    /// 映射到对外错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidFormat(_) => ErrorCode::InvalidFormat,
            Self::InvalidLatency(_)
            | Self::InvalidState(_)
            | Self::Backend(_)
            | Self::Subsystem(_) => ErrorCode::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
