//! # liuxi-format
//!
//! MPEG-2 传输流 (ISO/IEC 13818-1) 解复用.
//!
//! 提供一个推式 TS 同步/提包状态机和视频 PES 的去包装器,
//! 把选定 PID 上承载的 H.264 基本流还原出来.

pub mod mpegts;

pub use mpegts::{PesExtractor, TsParser, TsParserStatus};
