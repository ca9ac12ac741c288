//! H.264 NAL (Network Abstraction Layer) 单元处理.
//!
//! # NAL 头部 (1 字节)
//! ```text
//! ┌─────────────────────────────────────┐
//! │ forbidden(1) | ref_idc(2) | type(5) │
//! └─────────────────────────────────────┘
//! ```
//!
//! NAL 载荷中连续两个 0x00 之后必须插入防竞争字节 0x03, 以避免与
//! Annex B 起始码混淆. 解析前需要把 NAL 载荷还原为 RBSP.

use liuxi_core::{LiuxiError, LiuxiResult};

/// NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NalUnitType {
    /// 非 IDR 图像切片
    Slice,
    /// 数据分区 A
    SliceDpa,
    /// 数据分区 B
    SliceDpb,
    /// 数据分区 C
    SliceDpc,
    /// IDR 图像切片 (关键帧)
    SliceIdr,
    /// 增补增强信息 (SEI)
    Sei,
    /// 序列参数集 (SPS)
    Sps,
    /// 图像参数集 (PPS)
    Pps,
    /// 访问单元分隔符 (AUD)
    Aud,
    /// 序列结束
    EndOfSequence,
    /// 流结束
    EndOfStream,
    /// 填充数据
    FillerData,
    /// SPS 扩展
    SpsExtension,
    /// 未知类型
    Unknown(u8),
}

impl NalUnitType {
    /// 从 NAL 类型编号创建
    pub fn from_type_id(type_id: u8) -> Self {
        match type_id {
            1 => Self::Slice,
            2 => Self::SliceDpa,
            3 => Self::SliceDpb,
            4 => Self::SliceDpc,
            5 => Self::SliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::FillerData,
            13 => Self::SpsExtension,
            _ => Self::Unknown(type_id),
        }
    }

    /// 获取类型编号
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Slice => 1,
            Self::SliceDpa => 2,
            Self::SliceDpb => 3,
            Self::SliceDpc => 4,
            Self::SliceIdr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::Aud => 9,
            Self::EndOfSequence => 10,
            Self::EndOfStream => 11,
            Self::FillerData => 12,
            Self::SpsExtension => 13,
            Self::Unknown(id) => *id,
        }
    }

    /// 是否为 VCL (Video Coding Layer) NAL
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            Self::Slice | Self::SliceDpa | Self::SliceDpb | Self::SliceDpc | Self::SliceIdr
        )
    }

    /// 是否为关键帧 (IDR)
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::SliceIdr)
    }
}

impl std::fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slice => write!(f, "Slice"),
            Self::SliceDpa => write!(f, "SliceDPA"),
            Self::SliceDpb => write!(f, "SliceDPB"),
            Self::SliceDpc => write!(f, "SliceDPC"),
            Self::SliceIdr => write!(f, "IDR"),
            Self::Sei => write!(f, "SEI"),
            Self::Sps => write!(f, "SPS"),
            Self::Pps => write!(f, "PPS"),
            Self::Aud => write!(f, "AUD"),
            Self::EndOfSequence => write!(f, "EndOfSeq"),
            Self::EndOfStream => write!(f, "EndOfStream"),
            Self::FillerData => write!(f, "Filler"),
            Self::SpsExtension => write!(f, "SPSExt"),
            Self::Unknown(id) => write!(f, "Unknown({id})"),
        }
    }
}

/// 拆解 NAL 头部字节, 返回 (nal_ref_idc, 类型)
pub fn parse_nal_header(header: u8) -> (u8, NalUnitType) {
    let ref_idc = (header >> 5) & 0x03;
    let type_id = header & 0x1F;
    (ref_idc, NalUnitType::from_type_id(type_id))
}

/// 将 NAL 载荷还原为 RBSP, 移除防竞争字节
///
/// NAL 内部在任何字节对齐位置都不允许出现 0x000000 / 0x000001 /
/// 0x000002 三字节序列; `00 00 03` 之后只允许跟 0x00..=0x03.
/// 两条规则任一被破坏即判定 NAL 损坏. 唯一的例外是 cabac_zero_word
/// 收尾: NAL 最后一个字节是防竞争字节 0x03 时将其丢弃,
/// RBSP 以 `00 00` 结束.
pub fn nal_to_rbsp(nal: &[u8]) -> LiuxiResult<Vec<u8>> {
    let mut rbsp = Vec::with_capacity(nal.len());
    let mut zeros = 0usize;
    let mut i = 0usize;

    while i < nal.len() {
        let b = nal[i];

        if zeros == 2 && b < 0x03 {
            return Err(LiuxiError::InvalidData(format!(
                "H264: NAL 中出现被禁止的字节序列 00 00 {:02x}, offset={}",
                b, i
            )));
        }

        if zeros == 2 && b == 0x03 {
            if i + 1 < nal.len() && nal[i + 1] > 0x03 {
                return Err(LiuxiError::InvalidData(format!(
                    "H264: 防竞争字节后出现非法字节 0x{:02x}, offset={}",
                    nal[i + 1],
                    i + 1
                )));
            }
            if i == nal.len() - 1 {
                // cabac_zero_word 收尾: 丢弃最后的 0x03
                break;
            }
            i += 1;
            zeros = 0;
            continue;
        }

        rbsp.push(b);
        if b == 0x00 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        i += 1;
    }

    Ok(rbsp)
}
