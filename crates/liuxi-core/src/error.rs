//! 统一错误类型定义.
//!
//! 所有 Liuxi crate 共用的错误类型, 支持跨模块传播.

use thiserror::Error;

/// Liuxi 框架统一错误类型
#[derive(Debug, Error)]
pub enum LiuxiError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 数据不足, 需要更多输入
    #[error("数据不足, 需要更多输入")]
    NeedMoreData,

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 在非字节对齐位置执行字节读取
    #[error("比特流未对齐到字节边界")]
    Misaligned,

    /// 无效数据 (损坏的码流等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 功能未实现
    #[error("功能未实现: {0}")]
    NotImplemented(String),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

/// Liuxi 框架统一 Result 类型
pub type LiuxiResult<T> = Result<T, LiuxiError>;
