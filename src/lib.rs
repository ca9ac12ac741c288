//! # Liuxi (流析)
//!
//! 纯 Rust 实现的 H.264 码流结构解析框架.
//!
//! Liuxi 把一段 H.264/AVC 基本流 (可选地封装在 MPEG-2 传输流里)
//! 还原成开始解码图像所需的结构信息:
//! - **NAL 解析**: SPS / PPS / SEI / AUD / slice header, 带范围校验
//! - **参数集激活**: 尺寸、色度 QP 表与反量化表推导
//! - **TS 解复用**: 同步获取、PES 去包装、PCR 传输速率估计
//! - **CABAC**: I/SI slice 的逐宏块语法解码与邻居追踪
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use liuxi::codec::h264::{Container, H264Decoder};
//!
//! let mut decoder = H264Decoder::new(Container::AnnexB);
//! decoder.feed(&[0x00, 0x00, 0x01, 0x67 /* ... */]);
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `liuxi-core` | 比特流读取器、解析缓冲区、错误类型 |
//! | `liuxi-codec` | H.264 结构解析与 CABAC 熵解码 |
//! | `liuxi-format` | MPEG-2 TS 解复用 |

/// 核心类型与工具
pub use liuxi_core as core;

/// H.264 码流结构解析
pub use liuxi_codec as codec;

/// 容器格式解复用
pub use liuxi_format as format;

/// 获取 Liuxi 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
