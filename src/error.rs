//! 统一异常处理模块

use thiserror::Error;

/// 设备同步引擎错误类型
#[derive(Debug, Error)]
pub enum SyncError {
    /// 设备传输层错误（连接失败、套接字断开等）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 设备 I/O 超时（硬件可能无限期挂起，必须显式超时）
    #[error("Device I/O timed out during {0}")]
    Timeout(&'static str),

    /// 设备协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 存储层错误（重复键除外，重复键是正常结果而非错误）
    #[error("Storage error: {0}")]
    Storage(#[from] mongodb::error::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
