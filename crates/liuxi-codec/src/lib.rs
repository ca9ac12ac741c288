//! # liuxi-codec
//!
//! H.264/AVC (ISO/IEC 14496-10) 码流结构解析.
//!
//! 提供一个可重入的推式 NAL 解析器 (SPS/PPS/SEI/AUD/slice header),
//! 参数集激活与量化表推导, 以及 I/SI slice 的 CABAC 逐宏块语法解码.
//! 重建管线 (反变换、预测、去块滤波) 不在本 crate 范围内.

pub mod h264;
