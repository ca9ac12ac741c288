//! H.264/AVC 码流结构解析.
//!
//! [`H264Parser`] 是一个拉驱动的推式状态机: 调用方通过 [`H264Parser::write`]
//! 喂入任意长度的字节, 反复调用 [`H264Parser::parse`] 直到返回
//! [`H264ParserStatus::NeedBytes`]. 每个非 NeedBytes 状态对应一个完整
//! 解析 (或跳过/损坏) 的 NAL 单元, 解析出的语法结构可通过访问器取出.
//!
//! 解析失败是局部的: 损坏的 NAL 被丢弃, 参数集表保持原状,
//! 解析从下一个起始码继续.

pub mod aud;
pub mod cabac;
pub mod decoder;
pub mod mb;
pub mod nal;
pub mod picture;
pub mod picture_cabac;
pub mod pps;
pub mod residual;
pub mod scaling;
pub mod sei;
pub mod slice;
pub mod sps;

use std::collections::HashMap;

use liuxi_core::{BitReader, FlatBuffer};
use log::{debug, warn};

pub use aud::Aud;
pub use decoder::{Dimensions, H264Decoder};
pub use nal::NalUnitType;
pub use pps::Pps;
pub use sei::Sei;
pub use slice::{SliceData, SliceHeader, SliceType};
pub use sps::Sps;

/// 输入封装层
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// 裸 NAL 单元序列 (无起始码). 解析路径未实现.
    None,
    /// ISO/IEC 14496-10 Annex B 字节流
    AnnexB,
}

/// 单步解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264ParserStatus {
    /// 输入不足, 继续喂数据
    NeedBytes,
    /// 识别但未处理的 NAL 类型
    NalUnitSkipped,
    /// NAL 范围校验失败或在必选字段处截断
    NalUnitCorrupted,
    AudParsed,
    SpsParsed,
    PpsParsed,
    SeiParsed,
    SliceParsed,
}

impl std::fmt::Display for H264ParserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NeedBytes => "NEED_BYTES",
            Self::NalUnitSkipped => "NAL_UNIT_SKIPPED",
            Self::NalUnitCorrupted => "NAL_UNIT_CORRUPTED",
            Self::AudParsed => "AUD_PARSED",
            Self::SpsParsed => "SPS_PARSED",
            Self::PpsParsed => "PPS_PARSED",
            Self::SeiParsed => "SEI_PARSED",
            Self::SliceParsed => "SLICE_PARSED",
        };
        write!(f, "{s}")
    }
}

/// H.264 NAL 推式解析器
pub struct H264Parser {
    container: Container,
    buf: FlatBuffer,

    aud: Option<Aud>,
    sei: Option<Sei>,
    sps_table: HashMap<u32, Sps>,
    recent_sps: Option<u32>,
    pps_table: HashMap<u32, Pps>,
    recent_pps: Option<u32>,
    slice_header: Option<SliceHeader>,
    prev_slice_header: Option<SliceHeader>,
    slice_data: Option<SliceData>,
}

impl H264Parser {
    /// 创建解析器, `capacity` 为内部缓冲区字节数
    pub fn new(capacity: usize, container: Container) -> Self {
        Self {
            container,
            buf: FlatBuffer::with_capacity(capacity),
            aud: None,
            sei: None,
            sps_table: HashMap::new(),
            recent_sps: None,
            pps_table: HashMap::new(),
            recent_pps: None,
            slice_header: None,
            prev_slice_header: None,
            slice_data: None,
        }
    }

    /// 喂入字节, 返回实际接收的字节数
    ///
    /// 空间不足时先压缩缓冲区; 返回 0 表示缓冲区内是一个放不下的
    /// 超长 NAL, 调用方应 [`H264Parser::reset`] 后重新同步.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.len() > self.buf.write_available() {
            self.buf.compact();
        }
        self.buf.write(data)
    }

    /// 丢弃缓冲数据与书签. 参数集表保留.
    pub fn reset(&mut self) {
        self.buf.reset();
    }

    /// 推进一步, 至多解析一个 NAL 单元
    pub fn parse(&mut self) -> H264ParserStatus {
        match self.container {
            // TODO: 裸 NAL 序列 (如 avcC 长度前缀) 的切分尚未接入
            Container::None => H264ParserStatus::NeedBytes,
            Container::AnnexB => self.parse_byte_stream_nal_units(),
        }
    }

    /// 最近一次解析出的 AUD
    pub fn aud(&self) -> Option<&Aud> {
        self.aud.as_ref()
    }

    /// 最近一次解析出的 SEI
    pub fn sei(&self) -> Option<&Sei> {
        self.sei.as_ref()
    }

    /// 按 id 取 SPS (仅返回完整解析成功的条目)
    pub fn sps(&self, id: u32) -> Option<&Sps> {
        self.sps_table.get(&id)
    }

    /// 最近解析成功的 SPS
    pub fn recent_sps(&self) -> Option<&Sps> {
        self.recent_sps.and_then(|id| self.sps_table.get(&id))
    }

    /// 按 id 取 PPS
    pub fn pps(&self, id: u32) -> Option<&Pps> {
        self.pps_table.get(&id)
    }

    /// 最近解析成功的 PPS
    pub fn recent_pps(&self) -> Option<&Pps> {
        self.recent_pps.and_then(|id| self.pps_table.get(&id))
    }

    /// 最近解析成功的 slice header
    pub fn slice_header(&self) -> Option<&SliceHeader> {
        self.slice_header.as_ref()
    }

    /// 上一个 (最近之前的) slice header
    pub fn prev_slice_header(&self) -> Option<&SliceHeader> {
        self.prev_slice_header.as_ref()
    }

    /// 最近一个 slice 的熵编码数据句柄
    pub fn slice_data(&self) -> Option<&SliceData> {
        self.slice_data.as_ref()
    }

    /// 在未读窗口中查找 3 字节起始码 `00 00 01`, 找到则消费到其后
    fn find_next_start_code(&mut self) -> bool {
        let win = self.buf.read_slice();
        if win.len() < 3 {
            return false;
        }

        let limit = win.len() - 3;
        let mut i = 0;
        while i <= limit && !(win[i] == 0x00 && win[i + 1] == 0x00 && win[i + 2] == 0x01) {
            i += 1;
        }

        if i > limit {
            return false;
        }

        self.buf.consume(i + 3);
        true
    }

    /// 定界一个 NAL 单元
    ///
    /// 书签落在 NAL 首字节; 读游标向前扫描下一个起始码前缀候选
    /// (`00 00 00` 或 `00 00 01`). 返回 NAL 字节数, 0 表示数据不足.
    fn find_nal_unit(&mut self) -> usize {
        if self.buf.bookmark().is_none() {
            if !self.find_next_start_code() {
                return 0;
            }
            self.buf.set_bookmark();
        }

        let win = self.buf.read_slice();
        if win.len() < 3 {
            return 0;
        }

        let limit = win.len() - 3;
        let mut i = 0;
        while i <= limit && !(win[i] == 0x00 && win[i + 1] == 0x00 && win[i + 2] <= 0x01) {
            i += 1;
        }

        self.buf.consume(i);
        if i > limit {
            return 0; // NAL 结束位置尚未到达
        }

        self.buf
            .bookmark_to_read()
            .map(|nal| nal.len())
            .unwrap_or(0)
    }

    fn parse_byte_stream_nal_units(&mut self) -> H264ParserStatus {
        let nal_len = self.find_nal_unit();
        if nal_len == 0 {
            return H264ParserStatus::NeedBytes;
        }

        let nal = match self.buf.bookmark_to_read() {
            Some(nal) => nal.to_vec(),
            None => return H264ParserStatus::NeedBytes,
        };
        self.buf.clear_bookmark();

        match nal::nal_to_rbsp(&nal) {
            Ok(rbsp) => self.parse_nal_unit(rbsp),
            Err(err) => {
                warn!("H264: RBSP 还原失败, err={}", err);
                H264ParserStatus::NalUnitCorrupted
            }
        }
    }

    fn parse_nal_unit(&mut self, rbsp: Vec<u8>) -> H264ParserStatus {
        let mut br = BitReader::new(&rbsp);
        let header = match br.read_u8() {
            Ok(b) => b,
            Err(_) => return H264ParserStatus::NalUnitCorrupted,
        };
        let (nal_ref_idc, nal_unit_type) = nal::parse_nal_header(header);
        debug!(
            "H264: NAL type={} ref_idc={} size={}",
            nal_unit_type,
            nal_ref_idc,
            rbsp.len()
        );

        match nal_unit_type {
            NalUnitType::Aud => match aud::parse_aud(&mut br) {
                Ok(parsed) => {
                    self.aud = Some(parsed);
                    H264ParserStatus::AudParsed
                }
                Err(err) => {
                    warn!("H264: AUD 解析失败, err={}", err);
                    H264ParserStatus::NalUnitCorrupted
                }
            },

            NalUnitType::Sps => match sps::parse_sps(&mut br) {
                Ok(parsed) => {
                    debug!(
                        "H264: SPS id={} profile={} level={} {}x{} 宏块",
                        parsed.seq_parameter_set_id,
                        parsed.profile_idc,
                        parsed.level_idc,
                        parsed.pic_width_in_mbs_minus1 + 1,
                        parsed.pic_height_in_map_units_minus1 + 1
                    );
                    let id = parsed.seq_parameter_set_id;
                    self.sps_table.insert(id, parsed);
                    self.recent_sps = Some(id);
                    H264ParserStatus::SpsParsed
                }
                Err(err) => {
                    warn!("H264: SPS 解析失败, err={}", err);
                    H264ParserStatus::NalUnitCorrupted
                }
            },

            NalUnitType::Pps => {
                let result = pps::parse_pps(&mut br, |id| self.sps_table.get(&id));
                match result {
                    Ok(parsed) => {
                        debug!(
                            "H264: PPS id={} sps={} entropy={}",
                            parsed.pic_parameter_set_id,
                            parsed.seq_parameter_set_id,
                            if parsed.entropy_coding_mode_flag {
                                "CABAC"
                            } else {
                                "CAVLC"
                            }
                        );
                        let id = parsed.pic_parameter_set_id;
                        self.pps_table.insert(id, parsed);
                        self.recent_pps = Some(id);
                        H264ParserStatus::PpsParsed
                    }
                    Err(err) => {
                        warn!("H264: PPS 解析失败, err={}", err);
                        H264ParserStatus::NalUnitCorrupted
                    }
                }
            }

            NalUnitType::Sei => match sei::parse_sei(&mut br) {
                Ok(parsed) => {
                    debug!(
                        "H264: SEI type={} ({}) size={}",
                        parsed.payload_type,
                        parsed.payload_type_name(),
                        parsed.payload_size
                    );
                    self.sei = Some(parsed);
                    H264ParserStatus::SeiParsed
                }
                Err(err) => {
                    warn!("H264: SEI 解析失败, err={}", err);
                    H264ParserStatus::NalUnitCorrupted
                }
            },

            NalUnitType::Slice | NalUnitType::SliceIdr => {
                let result = slice::parse_slice_header(
                    &mut br,
                    nal_ref_idc,
                    nal_unit_type,
                    |id| self.pps_table.get(&id),
                    |id| self.sps_table.get(&id),
                );
                match result {
                    Ok(sh) => {
                        let entropy_coding = self
                            .pps_table
                            .get(&sh.pic_parameter_set_id)
                            .map(|p| p.entropy_coding_mode_flag)
                            .unwrap_or(false);
                        if entropy_coding {
                            // cabac_alignment_one_bit: 对齐到字节边界
                            while br.tell_bits() != 0 {
                                if br.read_bit().is_err() {
                                    break;
                                }
                            }
                        }
                        let byte_offset = br.tell();
                        let bit_offset = br.tell_bits();
                        debug!(
                            "H264: slice type={} first_mb={} frame_num={} 数据偏移={}.{}",
                            sh.slice_type, sh.first_mb_in_slice, sh.frame_num, byte_offset, bit_offset
                        );
                        self.prev_slice_header = self.slice_header.take();
                        self.slice_header = Some(sh);
                        self.slice_data = Some(SliceData {
                            rbsp,
                            byte_offset,
                            bit_offset,
                        });
                        H264ParserStatus::SliceParsed
                    }
                    Err(err) => {
                        warn!("H264: slice header 解析失败, err={}", err);
                        H264ParserStatus::NalUnitCorrupted
                    }
                }
            }

            _ => H264ParserStatus::NalUnitSkipped,
        }
    }
}
