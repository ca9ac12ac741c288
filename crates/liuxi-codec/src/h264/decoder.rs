//! H.264 解码器前端: 参数集激活与量化表推导.
//!
//! 解码器把字节喂给内部解析器, 在 slice header 到来时激活其引用的
//! PPS→SPS 链. 激活在 SPS id 或 PPS id 变化时触发重建:
//! - 尺寸从新 SPS 重建;
//! - 色度 QP 表按位深基表加两个偏移重建;
//! - 反量化系数表按标准 8.5.9 重新推导, 字节相同的缩放列表共享
//!   同一张后备表.
//!
//! 随后按熵编码模式把 I/SI slice 交给对应的图像解码例程.

use liuxi_core::{LiuxiError, LiuxiResult};
use log::{debug, warn};

use super::picture_cabac::PictureCabac;
use super::scaling::{SL_4X4_NUM, SL_8X8_NUM};
use super::slice::{SliceData, SliceHeader};
use super::sps::Sps;
use super::{Container, H264Parser, H264ParserStatus, Pps};

/// 支持的最大量化参数 (位深至 10-bit)
pub const H264_QP_MAX: usize = 51 + 2 * 6;

/// 解析器缓冲区大小
const H264_PARSER_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// 标准 Table 8-15 的 QPc 映射尾段 (QPy ≥ 30 压缩增长)
#[rustfmt::skip]
const CHROMA_QP_MAP: [u8; 52] = [
     0,  1,  2,  3,  4,  5,  6,  7,  8,  9, 10, 11, 12, 13, 14, 15,
    16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 29, 30,
    31, 32, 32, 33, 34, 34, 35, 35, 36, 36, 37, 37, 37, 38, 38, 38,
    39, 39, 39, 39,
];

/// 4x4 反量化的 LevelScale 基数 (标准 8.5.9)
const DEQUANT4X4_V: [[u8; 3]; 6] = [
    [10, 13, 16],
    [11, 14, 18],
    [13, 16, 20],
    [14, 18, 23],
    [16, 20, 25],
    [18, 23, 29],
];

/// 8x8 反量化的 LevelScale 基数 (标准 8.5.9)
const DEQUANT8X8_V: [[u8; 6]; 6] = [
    [20, 18, 32, 19, 25, 24],
    [22, 19, 35, 21, 28, 26],
    [26, 23, 42, 24, 33, 31],
    [28, 25, 45, 26, 35, 33],
    [32, 28, 51, 30, 40, 38],
    [36, 32, 58, 34, 46, 43],
];

/// 8x8 位置 → LevelScale 基数下标
const DEQUANT8X8_V_SCAN: [u8; 16] = [0, 3, 4, 3, 3, 1, 5, 1, 4, 5, 2, 5, 3, 1, 5, 1];

/// 图像尺寸, 随激活的 SPS 重建
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    pub mb_width: i32,
    pub mb_height: i32,
    pub mb_num: i32,
    pub width: i32,
    pub height: i32,
}

impl Dimensions {
    /// 由 SPS 推导尺寸
    pub fn from_sps(sps: &Sps) -> Self {
        let mb_width = (sps.pic_width_in_mbs_minus1 + 1) as i32;
        let mb_height = (sps.pic_height_in_map_units_minus1 + 1) as i32
            * (2 - i32::from(sps.frame_mbs_only_flag));
        Self {
            mb_width,
            mb_height,
            mb_num: mb_width * mb_height,
            width: 16 * mb_width,
            height: 16 * mb_height,
        }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} ({}x{} 宏块, 共 {})",
            self.width, self.height, self.mb_width, self.mb_height, self.mb_num
        )
    }
}

/// 上一次 slice 解码的观测记录 (诊断与测试用)
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceDecodeStats {
    pub decoded_mb_count: u32,
    pub slice_qp: i32,
}

/// H.264 解码器前端
pub struct H264Decoder {
    parser: H264Parser,
    dims: Dimensions,

    active_sps: Option<Sps>,
    active_pps: Option<Pps>,

    /// 按两个色度偏移预先合成的 QPc 查找表
    chroma_qp_table: [[u8; 64]; 2],

    /// 反量化表与去重池下标: 列表 i 的数据在 buffer[dequant_ref[i]]
    dequant4x4_buffer: Box<[[[i32; 16]; H264_QP_MAX + 1]; SL_4X4_NUM]>,
    dequant8x8_buffer: Box<[[[i32; 64]; H264_QP_MAX + 1]; SL_8X8_NUM]>,
    dequant4x4_ref: [usize; SL_4X4_NUM],
    dequant8x8_ref: [usize; SL_8X8_NUM],

    last_stats: Option<SliceDecodeStats>,
}

impl H264Decoder {
    /// 创建解码器
    pub fn new(container: Container) -> Self {
        Self {
            parser: H264Parser::new(H264_PARSER_BUFFER_SIZE, container),
            dims: Dimensions::default(),
            active_sps: None,
            active_pps: None,
            chroma_qp_table: [[0; 64]; 2],
            dequant4x4_buffer: Box::new([[[0; 16]; H264_QP_MAX + 1]; SL_4X4_NUM]),
            dequant8x8_buffer: Box::new([[[0; 64]; H264_QP_MAX + 1]; SL_8X8_NUM]),
            dequant4x4_ref: [0; SL_4X4_NUM],
            dequant8x8_ref: [0; SL_8X8_NUM],
            last_stats: None,
        }
    }

    /// 内部解析器
    pub fn parser(&self) -> &H264Parser {
        &self.parser
    }

    /// 当前激活尺寸
    pub fn dimensions(&self) -> &Dimensions {
        &self.dims
    }

    /// 当前激活的 SPS
    pub fn active_sps(&self) -> Option<&Sps> {
        self.active_sps.as_ref()
    }

    /// 当前激活的 PPS
    pub fn active_pps(&self) -> Option<&Pps> {
        self.active_pps.as_ref()
    }

    /// 合成后的色度 QP 表
    pub fn chroma_qp_table(&self) -> &[[u8; 64]; 2] {
        &self.chroma_qp_table
    }

    /// 取 4x4 反量化行 (经共享池)
    pub fn dequant4x4(&self, list: usize, qp: usize) -> &[i32; 16] {
        &self.dequant4x4_buffer[self.dequant4x4_ref[list]][qp]
    }

    /// 取 8x8 反量化行 (经共享池)
    pub fn dequant8x8(&self, list: usize, qp: usize) -> &[i32; 64] {
        &self.dequant8x8_buffer[self.dequant8x8_ref[list]][qp]
    }

    /// 两个缩放列表是否共享同一张反量化表
    pub fn dequant4x4_shared(&self, a: usize, b: usize) -> bool {
        self.dequant4x4_ref[a] == self.dequant4x4_ref[b]
    }

    /// 最近一次 slice 解码的观测记录
    pub fn last_stats(&self) -> Option<&SliceDecodeStats> {
        self.last_stats.as_ref()
    }

    /// 喂入字节并驱动解析直到需要更多输入
    pub fn feed(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let written = self.parser.write(data);
            if written == 0 {
                // 缓冲区里是一个放不下的超长 NAL, 丢弃重新同步
                warn!("H264: 解析缓冲区无法推进, 重置解析器");
                self.parser.reset();
                continue;
            }

            self.run_parser();
            data = &data[written..];
        }
    }

    fn run_parser(&mut self) {
        loop {
            let status = self.parser.parse();
            match status {
                H264ParserStatus::NeedBytes => break,
                H264ParserStatus::SliceParsed => {
                    let sh = self.parser.slice_header().cloned();
                    let sd = self.parser.slice_data().cloned();
                    if let (Some(sh), Some(sd)) = (sh, sd)
                        && let Err(err) = self.decode_slice(&sh, &sd)
                    {
                        warn!("H264: slice 解码失败, err={}", err);
                    }
                }
                other => {
                    debug!("H264: 解析状态 {}", other);
                }
            }
        }
    }

    /// 激活 slice 引用的参数集并触发表重建
    fn activate_parameter_sets(&mut self, sh: &SliceHeader) -> LiuxiResult<()> {
        let pps = self
            .parser
            .pps(sh.pic_parameter_set_id)
            .ok_or_else(|| {
                LiuxiError::InvalidData(format!(
                    "H264: slice 引用的 pps #{} 无效",
                    sh.pic_parameter_set_id
                ))
            })?
            .clone();
        let sps = self
            .parser
            .sps(pps.seq_parameter_set_id)
            .ok_or_else(|| {
                LiuxiError::InvalidData(format!(
                    "H264: pps #{} 引用的 sps #{} 无效",
                    pps.pic_parameter_set_id, pps.seq_parameter_set_id
                ))
            })?
            .clone();

        let sps_changed = self
            .active_sps
            .as_ref()
            .map(|s| s.seq_parameter_set_id != sps.seq_parameter_set_id)
            .unwrap_or(true);
        let pps_changed = self
            .active_pps
            .as_ref()
            .map(|p| p.pic_parameter_set_id != pps.pic_parameter_set_id)
            .unwrap_or(true);

        if sps_changed {
            self.dims = Dimensions::from_sps(&sps);
            debug!("H264: 激活 SPS id={}, 尺寸 {}", sps.seq_parameter_set_id, self.dims);
            self.active_sps = Some(sps);
        }

        if pps_changed {
            self.active_pps = Some(pps);
            self.init_dequantisation_tables();
            self.init_chroma_qp_tables();
            if let Some(p) = &self.active_pps {
                debug!("H264: 激活 PPS id={}", p.pic_parameter_set_id);
            }
        }

        Ok(())
    }

    /// 色度 QP 基表: 位深偏移段 + Table 8-15 尾段
    fn chroma_qp_base(depth: usize, q: usize) -> u8 {
        let off = 6 * depth;
        if q < off {
            q as u8
        } else {
            CHROMA_QP_MAP[q - off] + off as u8
        }
    }

    /// 重建色度 QP 表 (标准 8.5.8)
    fn init_chroma_qp_tables(&mut self) {
        let (Some(sps), Some(pps)) = (&self.active_sps, &self.active_pps) else {
            return;
        };
        let depth = sps.bit_depth_luma_minus8.min(2) as usize;
        let max_qp = 51 + 6 * depth;

        for (i, offset) in [pps.chroma_qp_index_offset, pps.second_chroma_qp_index_offset]
            .into_iter()
            .enumerate()
        {
            for q in 0..=max_qp {
                let clipped = (q as i32 + offset).clamp(0, max_qp as i32) as usize;
                self.chroma_qp_table[i][q] = Self::chroma_qp_base(depth, clipped);
            }
        }
    }

    /// 重建 4x4 反量化表, 相同的缩放列表共享后备表
    fn init_dequant4x4_coeff_table(&mut self) {
        let (Some(sps), Some(pps)) = (&self.active_sps, &self.active_pps) else {
            return;
        };
        let depth = sps.bit_depth_luma_minus8.min(2) as usize;
        let max_qp = 51 + 6 * depth;

        for i in 0..SL_4X4_NUM {
            self.dequant4x4_ref[i] = i;
            if let Some(j) = (0..i).find(|&j| pps.sm.m4x4[j].list == pps.sm.m4x4[i].list) {
                self.dequant4x4_ref[i] = self.dequant4x4_ref[j];
                continue;
            }

            for q in 0..=max_qp {
                let shift = q / 6;
                let idx = q % 6;
                for x in 0..16 {
                    let idx2 = (x & 1) + ((x >> 2) & 1);
                    let level_scale = i32::from(pps.sm.m4x4[i].list[x])
                        * i32::from(DEQUANT4X4_V[idx][idx2]);
                    self.dequant4x4_buffer[i][q][x] = level_scale << shift;
                }
            }
        }
    }

    /// 重建 8x8 反量化表
    fn init_dequant8x8_coeff_table(&mut self) {
        let (Some(sps), Some(pps)) = (&self.active_sps, &self.active_pps) else {
            return;
        };
        let depth = sps.bit_depth_luma_minus8.min(2) as usize;
        let max_qp = 51 + 6 * depth;

        for i in 0..SL_8X8_NUM {
            self.dequant8x8_ref[i] = i;
            if let Some(j) = (0..i).find(|&j| pps.sm.m8x8[j].list == pps.sm.m8x8[i].list) {
                self.dequant8x8_ref[i] = self.dequant8x8_ref[j];
                continue;
            }

            for q in 0..=max_qp {
                let shift = q / 6;
                let idx = q % 6;
                for x in 0..64 {
                    let idx2 = DEQUANT8X8_V_SCAN[((x >> 1) & 12) | (x & 3)] as usize;
                    let level_scale = i32::from(pps.sm.m8x8[i].list[x])
                        * i32::from(DEQUANT8X8_V[idx][idx2]);
                    self.dequant8x8_buffer[i][q][x] = level_scale << shift;
                }
            }
        }
    }

    /// 重建全部反量化表 (标准 8.5.9)
    fn init_dequantisation_tables(&mut self) {
        self.init_dequant4x4_coeff_table();
        let transform_8x8 = self
            .active_pps
            .as_ref()
            .map(|p| p.transform_8x8_mode_flag)
            .unwrap_or(false);
        if transform_8x8 {
            self.init_dequant8x8_coeff_table();
        }

        // 无损旁路: qp=0 行替换为单位缩放
        let bypass = self
            .active_sps
            .as_ref()
            .map(|s| s.qpprime_y_zero_transform_bypass_flag)
            .unwrap_or(false);
        if bypass {
            for i in 0..SL_4X4_NUM {
                for x in 0..16 {
                    self.dequant4x4_buffer[i][0][x] = 1 << 6;
                }
            }
            if transform_8x8 {
                for i in 0..SL_8X8_NUM {
                    for x in 0..64 {
                        self.dequant8x8_buffer[i][0][x] = 1 << 6;
                    }
                }
            }
        }
    }

    /// 激活检查: 表容量与残差上下文覆盖到的子集
    fn validate_decode_support(sps: &Sps) -> LiuxiResult<()> {
        if sps.bit_depth_luma_minus8 > 2 {
            return Err(LiuxiError::Unsupported(format!(
                "H264: 暂不支持 bit_depth_luma_minus8={}, 至多 10-bit",
                sps.bit_depth_luma_minus8
            )));
        }
        if sps.chroma_array_type() > 1 {
            return Err(LiuxiError::Unsupported(format!(
                "H264: 暂不支持 chroma_format_idc={} 的宏块解码, 仅 4:2:0/单色",
                sps.chroma_format_idc
            )));
        }
        Ok(())
    }

    /// 解码一个已解析的 slice
    fn decode_slice(&mut self, sh: &SliceHeader, sd: &SliceData) -> LiuxiResult<()> {
        self.activate_parameter_sets(sh)?;

        let (Some(sps), Some(pps)) = (self.active_sps.clone(), self.active_pps.clone()) else {
            return Ok(());
        };

        if !sh.slice_type.is_intra() {
            debug!("H264: slice type={} 不在解码范围内, 仅解析 header", sh.slice_type);
            return Ok(());
        }

        if let Err(err) = Self::validate_decode_support(&sps) {
            warn!("H264: 跳过 slice 解码, err={}", err);
            return Ok(());
        }

        if pps.entropy_coding_mode_flag {
            let mut picture =
                PictureCabac::new(&sps, &pps, sh, &self.dims, self.chroma_qp_table, sd);
            let decoded = picture.decode(sh)?;
            debug!(
                "H264: CABAC slice 解码完成, 宏块 {}/{}",
                decoded, self.dims.mb_num
            );
            self.last_stats = Some(SliceDecodeStats {
                decoded_mb_count: decoded,
                slice_qp: pps.pic_init_qp_minus26 + 26 + sh.slice_qp_delta,
            });
        } else {
            // CAVLC 图像解码共享同一宏块循环, 熵解码例程未实现
            debug!("H264: CAVLC slice 不解码, 仅记录 header");
        }

        Ok(())
    }
}
