//! # liuxi-core
//!
//! Liuxi 码流解析框架核心库, 提供基础类型定义、错误处理和工具函数.
//!
//! 本 crate 为上层的 H.264 解析器 (liuxi-codec) 与 MPEG-TS 解复用器
//! (liuxi-format) 提供共用的底层设施: 大端比特流读取器、可压缩的
//! 解析缓冲区, 以及统一错误类型.

pub mod bitreader;
pub mod endian;
pub mod error;
pub mod flatbuffer;

// 重导出常用类型
pub use bitreader::{BitPosition, BitReader};
pub use error::{LiuxiError, LiuxiResult};
pub use flatbuffer::FlatBuffer;
