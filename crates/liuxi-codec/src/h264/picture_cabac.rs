//! CABAC 熵编码图像的逐宏块语法解码 (I/SI slice).
//!
//! 每个语法元素的 ctxIdxInc 推导遵循标准 9.3.3.1.1 的邻居规则;
//! 宏块内的 AC 系数计数与预测模式先在 5x8 缓存中暂存,
//! 宏块解码完成后写回宏块记录, 供右侧与下方的宏块引用.

use liuxi_core::LiuxiResult;
use log::{debug, warn};

use super::cabac::{CabacCtx, CabacDecoder, init_contexts_i_slice};
use super::decoder::Dimensions;
use super::mb::{
    self, COMP_CB, COMP_CR, COMP_Y, IntraLumaPredModes, MB_CACHE_IDX, MB_INFO_I, MB_NZC_DC_CB,
    MB_NZC_DC_CR, MB_NZC_DC_Y, mb_type,
};
use super::picture::Picture;
use super::pps::Pps;
use super::residual::{
    CAT_CHROMA_AC, CAT_CHROMA_DC, CAT_LUMA_4X4, CAT_LUMA_8X8, CAT_LUMA_AC, CAT_LUMA_DC,
    decode_residual_block,
};
use super::slice::{SliceData, SliceHeader, SliceType};
use super::sps::Sps;

/// 4x4 子块的解码顺序 (8x8 分组) → 光栅块号
const BLOCK_SCAN_TO_RASTER: [usize; 16] = [0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15];

/// CABAC 图像解码器
pub struct PictureCabac<'a> {
    pub pic: Picture,
    cabac: CabacDecoder<'a>,
    ctxs: Vec<CabacCtx>,

    qp_bd_offset: i32,
    constrained_intra_pred: bool,
    transform_8x8_mode: bool,
    chroma_qp_table: [[u8; 64]; 2],
}

impl<'a> PictureCabac<'a> {
    /// 按激活参数集与 slice header 建立图像并初始化熵解码器
    pub fn new(
        sps: &Sps,
        pps: &Pps,
        sh: &SliceHeader,
        dims: &Dimensions,
        chroma_qp_table: [[u8; 64]; 2],
        sd: &'a SliceData,
    ) -> Self {
        let qp_y = pps.pic_init_qp_minus26 + 26 + sh.slice_qp_delta;
        let max_qp = 51 + 6 * sps.bit_depth_luma_minus8 as i32;
        let qp_c = [
            i32::from(chroma_qp_table[0][qp_y.clamp(0, max_qp) as usize]),
            i32::from(chroma_qp_table[1][qp_y.clamp(0, max_qp) as usize]),
        ];
        let pic = Picture::new(sps, pps, sh, dims, qp_c);

        let slice_qp = (qp_y - 6 * sps.bit_depth_luma_minus8 as i32).clamp(0, 51);
        let ctxs = init_contexts_i_slice(slice_qp);
        let cabac = CabacDecoder::new(sd.bytes());

        Self {
            pic,
            cabac,
            ctxs,
            qp_bd_offset: 6 * sps.bit_depth_luma_minus8 as i32,
            constrained_intra_pred: pps.constrained_intra_pred_flag,
            transform_8x8_mode: pps.transform_8x8_mode_flag,
            chroma_qp_table,
        }
    }

    /// 解码整个 slice 的宏块, 返回解码的宏块数
    pub fn decode(&mut self, sh: &SliceHeader) -> LiuxiResult<u32> {
        let mut decoded = 0u32;

        loop {
            let Some(idx) = self.pic.curr_mb() else {
                break;
            };

            if !sh.slice_type.is_intra() {
                // P/SP/B 的跳过宏块检测未实现
                debug!("H264: slice type={} 的宏块解码未实现, 跳过", sh.slice_type);
                break;
            }

            self.decode_macroblock(idx, sh.slice_type);
            decoded += 1;

            if self.cabac.exhausted() {
                warn!("H264: CABAC 数据在宏块 {} 后耗尽", self.pic.ctx.mb_pos);
                break;
            }

            // MBAFF 下 end_of_slice_flag 只出现在宏块对的下半之后
            let pair_top = self.pic.ctx.mb_aff_frame && (self.pic.ctx.mb_y & 1 == 0);
            if !pair_top && self.cabac.decode_terminate() == 1 {
                self.pic.advance_mb_pos();
                break;
            }
            self.pic.advance_mb_pos();
        }

        Ok(decoded)
    }

    /// 解码一个 I/SI 宏块的全部语法
    fn decode_macroblock(&mut self, idx: usize, slice_type: SliceType) {
        if self.pic.ctx.mb_aff_frame && self.pic.ctx.mb_y & 1 == 0 {
            let field = self.decode_mb_field_decoding_flag(idx);
            self.pic.ctx.mb_field_decoding_flag = field == 1;
        }

        self.pic.calculate_neighbours_part2(idx);

        let (code, switching) = if slice_type == SliceType::Si {
            let code = self.decode_mb_type_si_slice(idx);
            if code == 0 {
                (0, true)
            } else {
                (code - 1, false)
            }
        } else {
            (self.decode_mb_type_i_slice(idx), false)
        };

        let info = &MB_INFO_I[(code as usize).min(25)];
        let mut mb_flags = info.mb_type;
        if switching {
            mb_flags |= mb_type::SWITCHING;
        }
        if self.pic.ctx.mb_field_decoding_flag {
            mb_flags |= mb_type::INTERLACED;
        }
        self.pic.mbs[idx].mb_type = mb_flags;

        if mb::is_intra_pcm(mb_flags) {
            self.decode_i_pcm(idx);
            return;
        }

        if mb::is_intra_nxn(mb_flags) {
            self.decode_intra_nxn(idx);
        } else {
            // I_16x16: 预测模式与 CBP 由 mb_type 给定
            self.pic.mbs[idx].intra_luma_pred_mode =
                IntraLumaPredModes::M16x16(info.pred_mode as u8);
            self.pic.mbs[idx].cbp_luma = info.cbp_luma as u32;
            self.pic.mbs[idx].cbp_chroma = info.cbp_chroma as u32;
        }

        let chroma_present = matches!(self.pic.ctx.chroma_array_type, 1 | 2);
        if chroma_present {
            let mode = self.decode_intra_chroma_pred_mode(idx);
            self.pic.mbs[idx].intra_chroma_pred_mode = mode as u8;
        }

        if mb::is_intra_nxn(self.pic.mbs[idx].mb_type) {
            let cbp_luma = self.decode_cbp_luma(idx);
            let cbp_chroma = if chroma_present {
                self.decode_cbp_chroma(idx)
            } else {
                0
            };
            self.pic.mbs[idx].cbp_luma = cbp_luma;
            self.pic.mbs[idx].cbp_chroma = cbp_chroma;
        }

        let curr = &self.pic.mbs[idx];
        let has_residual =
            curr.cbp_luma != 0 || curr.cbp_chroma != 0 || mb::is_intra_16x16(curr.mb_type);

        if has_residual {
            self.non_zero_count_cache_init(idx);

            let qp_delta = self.decode_mb_qp_delta();
            self.pic.ctx.last_qp_delta = qp_delta;
            let num_qp = 52 + self.qp_bd_offset;
            self.pic.ctx.qp_y =
                (self.pic.ctx.qp_y + qp_delta + num_qp + self.qp_bd_offset).rem_euclid(num_qp)
                    - self.qp_bd_offset;
            let qp_idx = (self.pic.ctx.qp_y + self.qp_bd_offset).clamp(0, 63) as usize;
            self.pic.ctx.qp_c = [
                i32::from(self.chroma_qp_table[0][qp_idx]),
                i32::from(self.chroma_qp_table[1][qp_idx]),
            ];

            self.decode_residuals(idx);
            self.non_zero_count_save(idx);
        } else {
            self.pic.ctx.last_qp_delta = 0;
            self.pic.mbs[idx].non_zero_count = [0; 51];
        }

        self.pic.mbs[idx].luma_qp = self.pic.ctx.qp_y;
    }

    // ========================================================
    // 语法元素解码 (ctxIdxInc 推导见标准 9.3.3.1.1)
    // ========================================================

    /// mb_field_decoding_flag, ctxIdxOffset 70..=72
    fn decode_mb_field_decoding_flag(&mut self, idx: usize) -> u32 {
        let mb = &self.pic.mbs[idx];
        let mut inc = 0usize;
        if let Some(a) = mb.a
            && mb::is_interlaced(self.pic.mbs[a].mb_type)
        {
            inc += 1;
        }
        if let Some(b) = mb.b
            && mb::is_interlaced(self.pic.mbs[b].mb_type)
        {
            inc += 1;
        }
        self.cabac.decode_decision(&mut self.ctxs[70 + inc])
    }

    /// SI slice 的 mb_type 前缀, ctxIdxOffset 0..=2
    fn decode_mb_type_si_slice(&mut self, idx: usize) -> u32 {
        let mb = &self.pic.mbs[idx];
        let mut inc = 0usize;
        if let Some(l) = mb.left
            && !mb::is_switching(self.pic.mbs[l].mb_type)
        {
            inc += 1;
        }
        if let Some(t) = mb.top
            && !mb::is_switching(self.pic.mbs[t].mb_type)
        {
            inc += 1;
        }
        if self.cabac.decode_decision(&mut self.ctxs[inc]) == 0 {
            return 0;
        }
        1 + self.decode_mb_type_i_slice(idx)
    }

    /// I slice 的 mb_type, ctxIdxOffset 3..=10
    fn decode_mb_type_i_slice(&mut self, idx: usize) -> u32 {
        let mb = &self.pic.mbs[idx];
        let mut inc = 0usize;
        if let Some(l) = mb.left
            && !mb::is_intra_nxn(self.pic.mbs[l].mb_type)
        {
            inc += 1;
        }
        if let Some(t) = mb.top
            && !mb::is_intra_nxn(self.pic.mbs[t].mb_type)
        {
            inc += 1;
        }

        if self.cabac.decode_decision(&mut self.ctxs[3 + inc]) == 0 {
            return 0; // I_NxN
        }
        if self.cabac.decode_terminate() == 1 {
            return 25; // I_PCM
        }

        let mut code = 1u32;
        code += 12 * self.cabac.decode_decision(&mut self.ctxs[6]); // cbp_luma
        if self.cabac.decode_decision(&mut self.ctxs[7]) == 1 {
            // cbp_chroma
            code += 4 + 4 * self.cabac.decode_decision(&mut self.ctxs[8]);
        }
        code += 2 * self.cabac.decode_decision(&mut self.ctxs[9]);
        code += self.cabac.decode_decision(&mut self.ctxs[10]);
        code
    }

    /// transform_size_8x8_flag, ctxIdxOffset 399..=401
    fn decode_transform_size_8x8_flag(&mut self, idx: usize) -> u32 {
        let mb = &self.pic.mbs[idx];
        let mut inc = 0usize;
        if let Some(a) = mb.a
            && mb::is_intra_8x8(self.pic.mbs[a].mb_type)
        {
            inc += 1;
        }
        if let Some(b) = mb.b
            && mb::is_intra_8x8(self.pic.mbs[b].mb_type)
        {
            inc += 1;
        }
        self.cabac.decode_decision(&mut self.ctxs[399 + inc])
    }

    /// coded_block_pattern 亮度部分, ctxIdxOffset 73..=76
    fn decode_cbp_luma(&mut self, idx: usize) -> u32 {
        let curr = &self.pic.mbs[idx];
        let left_blocks = self.pic.ctx.left_blocks;

        let cbp_a = if curr.left.is_some() {
            let lp0 = curr.left_pair[0].map(|n| self.pic.mbs[n].cbp_luma).unwrap_or(0);
            let lp1 = curr.left_pair[1].map(|n| self.pic.mbs[n].cbp_luma).unwrap_or(0);
            ((lp0 >> (left_blocks[0] & !1)) & 2) | (((lp1 >> (left_blocks[2] & !1)) & 2) << 2)
        } else {
            0x0F
        };
        let cbp_b = curr
            .top
            .map(|t| self.pic.mbs[t].cbp_luma)
            .unwrap_or(0x0F);

        let mut cbp = 0u32;
        let inc = usize::from(cbp_a & 0x02 == 0) + 2 * usize::from(cbp_b & 0x04 == 0);
        cbp += self.cabac.decode_decision(&mut self.ctxs[73 + inc]);
        let inc = usize::from(cbp & 0x01 == 0) + 2 * usize::from(cbp_b & 0x08 == 0);
        cbp += self.cabac.decode_decision(&mut self.ctxs[73 + inc]) << 1;
        let inc = usize::from(cbp_a & 0x08 == 0) + 2 * usize::from(cbp & 0x01 == 0);
        cbp += self.cabac.decode_decision(&mut self.ctxs[73 + inc]) << 2;
        let inc = usize::from(cbp & 0x04 == 0) + 2 * usize::from(cbp & 0x02 == 0);
        cbp += self.cabac.decode_decision(&mut self.ctxs[73 + inc]) << 3;
        cbp
    }

    /// coded_block_pattern 色度部分, ctxIdxOffset 77..=84
    fn decode_cbp_chroma(&mut self, idx: usize) -> u32 {
        let curr = &self.pic.mbs[idx];
        let cbp_a = curr
            .left
            .map(|l| self.pic.mbs[l].cbp_chroma & 0x03)
            .unwrap_or(0);
        let cbp_b = curr
            .top
            .map(|t| self.pic.mbs[t].cbp_chroma & 0x03)
            .unwrap_or(0);

        let mut inc = 0usize;
        if cbp_a > 0 {
            inc += 1;
        }
        if cbp_b > 0 {
            inc += 2;
        }
        if self.cabac.decode_decision(&mut self.ctxs[77 + inc]) == 0 {
            return 0;
        }

        let mut inc = 4usize;
        if cbp_a == 2 {
            inc += 1;
        }
        if cbp_b == 2 {
            inc += 2;
        }
        1 + self.cabac.decode_decision(&mut self.ctxs[77 + inc])
    }

    /// mb_qp_delta, ctxIdxOffset 60..=63
    fn decode_mb_qp_delta(&mut self) -> i32 {
        let mut inc = usize::from(self.pic.ctx.last_qp_delta != 0);
        let mut val = 0u32;

        while self.cabac.decode_decision(&mut self.ctxs[60 + inc]) == 1 {
            inc = if val == 0 { 2 } else { 3 };
            val += 1;
            if val > 102 {
                break;
            }
        }

        // se(v) 映射 (标准 Table 9-3)
        if val & 1 == 1 {
            ((val + 1) >> 1) as i32
        } else {
            -(((val + 1) >> 1) as i32)
        }
    }

    /// intra_chroma_pred_mode, ctxIdxOffset 64..=67
    fn decode_intra_chroma_pred_mode(&mut self, idx: usize) -> u32 {
        let curr = &self.pic.mbs[idx];
        let mut inc = 0usize;
        if let Some(l) = curr.left
            && self.pic.mbs[l].intra_chroma_pred_mode != 0
        {
            inc += 1;
        }
        if let Some(t) = curr.top
            && self.pic.mbs[t].intra_chroma_pred_mode != 0
        {
            inc += 1;
        }

        if self.cabac.decode_decision(&mut self.ctxs[64 + inc]) == 0 {
            return 0;
        }
        if self.cabac.decode_decision(&mut self.ctxs[67]) == 0 {
            return 1;
        }
        if self.cabac.decode_decision(&mut self.ctxs[67]) == 0 {
            return 2;
        }
        3
    }

    /// prev_intraNxN_pred_mode_flag (ctx 68) + rem_intraNxN_pred_mode (ctx 69)
    fn decode_intra_pred_mode(&mut self, pred: i8) -> u8 {
        let pred_mode = if pred < 0 { 2 } else { pred as u32 };
        if self.cabac.decode_decision(&mut self.ctxs[68]) == 1 {
            return pred_mode as u8;
        }
        let rem = self.cabac.decode_decision(&mut self.ctxs[69])
            | (self.cabac.decode_decision(&mut self.ctxs[69]) << 1)
            | (self.cabac.decode_decision(&mut self.ctxs[69]) << 2);
        if rem < pred_mode {
            rem as u8
        } else {
            (rem + 1) as u8
        }
    }

    // ========================================================
    // 宏块类型分支
    // ========================================================

    /// I_NxN: 预测模式缓存初始化 + 逐子块模式解码
    fn decode_intra_nxn(&mut self, idx: usize) {
        self.intra_pred_mode_cache_init(idx);

        let use_8x8 =
            self.transform_8x8_mode && self.decode_transform_size_8x8_flag(idx) == 1;
        if use_8x8 {
            self.pic.mbs[idx].mb_type =
                (self.pic.mbs[idx].mb_type & !mb_type::INTRA_NXN) | mb_type::INTRA_8X8;
        } else {
            self.pic.mbs[idx].mb_type =
                (self.pic.mbs[idx].mb_type & !mb_type::INTRA_NXN) | mb_type::INTRA_4X4;
        }

        if use_8x8 {
            let mut modes = [0u8; 4];
            for blk8 in 0..4usize {
                let bx = (blk8 & 1) * 2;
                let by = (blk8 >> 1) * 2;
                let pos = (1 + by) * 8 + 4 + bx;
                let left = self.pic.ctx.intra_nxn_pred_mode[pos - 1];
                let top = self.pic.ctx.intra_nxn_pred_mode[pos - 8];
                let pred = if left < 0 || top < 0 { 2 } else { left.min(top) };
                let mode = self.decode_intra_pred_mode(pred);
                modes[blk8] = mode;
                // 8x8 模式占满 2x2 个缓存单元
                for dy in 0..2 {
                    for dx in 0..2 {
                        self.pic.ctx.intra_nxn_pred_mode[(1 + by + dy) * 8 + 4 + bx + dx] =
                            mode as i8;
                    }
                }
            }
            self.pic.mbs[idx].intra_luma_pred_mode = IntraLumaPredModes::M8x8(modes);
        } else {
            let mut modes = [0u8; 16];
            for scan in 0..16usize {
                let raster = BLOCK_SCAN_TO_RASTER[scan];
                let bx = raster % 4;
                let by = raster / 4;
                let pos = (1 + by) * 8 + 4 + bx;
                let left = self.pic.ctx.intra_nxn_pred_mode[pos - 1];
                let top = self.pic.ctx.intra_nxn_pred_mode[pos - 8];
                let pred = if left < 0 || top < 0 { 2 } else { left.min(top) };
                let mode = self.decode_intra_pred_mode(pred);
                modes[raster] = mode;
                self.pic.ctx.intra_nxn_pred_mode[pos] = mode as i8;
            }
            self.pic.mbs[idx].intra_luma_pred_mode = IntraLumaPredModes::M4x4(modes);
        }
    }

    /// I_PCM: 字节对齐后跳过原始样本, 重启解码引擎
    fn decode_i_pcm(&mut self, idx: usize) {
        self.cabac.align_to_byte_boundary();

        let (luma_bytes, chroma_bytes) = match self.pic.ctx.chroma_array_type {
            0 => (256usize, 0usize),
            1 => (256, 128),
            2 => (256, 256),
            _ => (256, 512),
        };
        for _ in 0..luma_bytes + chroma_bytes {
            let _ = self.cabac.read_raw_byte();
        }

        // PCM 宏块的所有系数视作非零, 供后续邻居上下文使用
        self.pic.mbs[idx].cbp_luma = 0x0F;
        self.pic.mbs[idx].cbp_chroma = 2;
        self.pic.mbs[idx].intra_chroma_pred_mode = 0;
        self.pic.mbs[idx].non_zero_count = [16; 51];
        self.pic.mbs[idx].luma_qp = 0;
        self.pic.ctx.last_qp_delta = 0;

        self.cabac.restart_engine();
    }

    // ========================================================
    // 缓存初始化与写回
    // ========================================================

    /// 从上/左邻居装载帧内 NxN 预测模式缓存
    fn intra_pred_mode_cache_init(&mut self, idx: usize) {
        let curr = &self.pic.mbs[idx];
        let left_blocks = self.pic.ctx.left_blocks;
        let mut cache = [-1i8; 40];

        // 上邻: 其最下一行 4x4 的模式
        match curr.top {
            Some(t) => {
                let top_mb = &self.pic.mbs[t];
                if mb::is_intra_nxn(top_mb.mb_type) {
                    for i in 0..4 {
                        cache[4 + i] = nxn_mode_at(top_mb, 12 + i);
                    }
                } else {
                    let v = self.neighbour_dc_mode(top_mb.mb_type);
                    for i in 0..4 {
                        cache[4 + i] = v;
                    }
                }
            }
            None => {
                for i in 0..4 {
                    cache[4 + i] = -1;
                }
            }
        }

        // 左邻: 经 left_blocks 重索引的右列模式
        for j in 0..4usize {
            let pair = curr.left_pair[j / 2];
            let pos = (1 + j) * 8 + 3;
            match pair {
                Some(l) => {
                    let left_mb = &self.pic.mbs[l];
                    cache[pos] = if mb::is_intra_nxn(left_mb.mb_type) {
                        nxn_mode_at(left_mb, left_blocks[8 + j] as usize)
                    } else {
                        self.neighbour_dc_mode(left_mb.mb_type)
                    };
                }
                None => cache[pos] = -1,
            }
        }

        self.pic.ctx.intra_nxn_pred_mode = cache;
    }

    /// 非 NxN 邻居在预测模式缓存中的取值:
    /// 帧内 (或未启用受限帧内预测) 记 DC, 否则视为不可用
    fn neighbour_dc_mode(&self, neighbour_type: u32) -> i8 {
        if mb::is_intra(neighbour_type) || !self.constrained_intra_pred {
            2
        } else {
            -1
        }
    }

    /// 从上/左邻居装载非零计数缓存 (标准的 nza/nzb 来源)
    fn non_zero_count_cache_init(&mut self, idx: usize) {
        let curr = &self.pic.mbs[idx];
        let left_blocks = self.pic.ctx.left_blocks;
        let cat = self.pic.ctx.chroma_array_type;
        let mut caches = [[0u8; 40]; 3];

        if let Some(t) = curr.top {
            let nzc = &self.pic.mbs[t].non_zero_count;
            caches[COMP_Y][4..8].copy_from_slice(&nzc[3 * 4..3 * 4 + 4]);
            match cat {
                1 | 2 => {
                    caches[COMP_CB][4..8].copy_from_slice(&nzc[5 * 4..5 * 4 + 4]);
                    caches[COMP_CR][4..8].copy_from_slice(&nzc[9 * 4..9 * 4 + 4]);
                }
                3 => {
                    caches[COMP_CB][4..8].copy_from_slice(&nzc[7 * 4..7 * 4 + 4]);
                    caches[COMP_CR][4..8].copy_from_slice(&nzc[11 * 4..11 * 4 + 4]);
                }
                _ => {}
            }
        } else {
            // 0x40 表示 "不可用", 帧内宏块按已编码处理
            for cache in caches.iter_mut() {
                for i in 4..8 {
                    cache[i] = 0x40;
                }
            }
        }

        for i in 0..2usize {
            let rows = [1 + 2 * i, 2 + 2 * i];
            match curr.left_pair[i] {
                Some(l) => {
                    let nzc = &self.pic.mbs[l].non_zero_count;
                    caches[COMP_Y][rows[0] * 8 + 3] = nzc[left_blocks[8 + 2 * i] as usize];
                    caches[COMP_Y][rows[1] * 8 + 3] = nzc[left_blocks[8 + 1 + 2 * i] as usize];

                    match cat {
                        1 => {
                            caches[COMP_CB][(1 + i) * 8 + 3] =
                                nzc[left_blocks[12 + 2 * i] as usize];
                            caches[COMP_CR][(1 + i) * 8 + 3] =
                                nzc[left_blocks[13 + 2 * i] as usize];
                        }
                        2 => {
                            caches[COMP_CB][rows[0] * 8 + 3] =
                                nzc[left_blocks[8 + 2 * i] as usize - 2 + 16];
                            caches[COMP_CB][rows[1] * 8 + 3] =
                                nzc[left_blocks[9 + 2 * i] as usize - 2 + 16];
                            caches[COMP_CR][rows[0] * 8 + 3] =
                                nzc[left_blocks[8 + 2 * i] as usize - 2 + 32];
                            caches[COMP_CR][rows[1] * 8 + 3] =
                                nzc[left_blocks[9 + 2 * i] as usize - 2 + 32];
                        }
                        3 => {
                            caches[COMP_CB][rows[0] * 8 + 3] =
                                nzc[left_blocks[8 + 2 * i] as usize + 16];
                            caches[COMP_CB][rows[1] * 8 + 3] =
                                nzc[left_blocks[9 + 2 * i] as usize + 16];
                            caches[COMP_CR][rows[0] * 8 + 3] =
                                nzc[left_blocks[8 + 2 * i] as usize + 32];
                            caches[COMP_CR][rows[1] * 8 + 3] =
                                nzc[left_blocks[9 + 2 * i] as usize + 32];
                        }
                        _ => {}
                    }
                }
                None => {
                    for comp in 0..3 {
                        caches[comp][rows[0] * 8 + 3] = 0x40;
                        caches[comp][rows[1] * 8 + 3] = 0x40;
                    }
                }
            }
        }

        self.pic.ctx.non_zero_count = caches;
    }

    /// 把非零计数缓存写回宏块记录
    fn non_zero_count_save(&mut self, idx: usize) {
        let cat = self.pic.ctx.chroma_array_type;
        let caches = self.pic.ctx.non_zero_count;
        let nzc = &mut self.pic.mbs[idx].non_zero_count;

        nzc[MB_NZC_DC_Y] = caches[COMP_Y][0];
        for row in 0..4usize {
            let src = (1 + row) * 8 + 4;
            nzc[row * 4..row * 4 + 4].copy_from_slice(&caches[COMP_Y][src..src + 4]);
        }

        if cat == 0 {
            return;
        }

        nzc[MB_NZC_DC_CB] = caches[COMP_CB][0];
        nzc[MB_NZC_DC_CR] = caches[COMP_CR][0];
        for row in 0..2usize {
            let src = (1 + row) * 8 + 4;
            nzc[16 + row * 4..16 + row * 4 + 4].copy_from_slice(&caches[COMP_CB][src..src + 4]);
            nzc[32 + row * 4..32 + row * 4 + 4].copy_from_slice(&caches[COMP_CR][src..src + 4]);
        }

        if cat < 3 {
            return;
        }

        for row in 2..4usize {
            let src = (1 + row) * 8 + 4;
            nzc[16 + row * 4..16 + row * 4 + 4].copy_from_slice(&caches[COMP_CB][src..src + 4]);
            nzc[32 + row * 4..32 + row * 4 + 4].copy_from_slice(&caches[COMP_CR][src..src + 4]);
        }
    }

    // ========================================================
    // 残差
    // ========================================================

    /// AC 块 coded_block_flag 的邻居增量 (缓存中的 nza/nzb)
    fn cbf_inc_from_cache(&self, comp: usize, cache_pos: usize) -> usize {
        let cache = &self.pic.ctx.non_zero_count[comp];
        let nza = cache[cache_pos - 1];
        let nzb = cache[cache_pos - 8];
        usize::from(nza > 0) + 2 * usize::from(nzb > 0)
    }

    /// DC 块 coded_block_flag 的邻居增量 (宏块记录中的 DC 槽位)
    fn cbf_inc_dc(&self, idx: usize, dc_slot: usize) -> usize {
        let curr = &self.pic.mbs[idx];
        let curr_intra = mb::is_intra(curr.mb_type);
        let nza = curr
            .left
            .map(|l| self.pic.mbs[l].non_zero_count[dc_slot])
            .unwrap_or(u8::from(curr_intra));
        let nzb = curr
            .top
            .map(|t| self.pic.mbs[t].non_zero_count[dc_slot])
            .unwrap_or(u8::from(curr_intra));
        usize::from(nza > 0) + 2 * usize::from(nzb > 0)
    }

    /// 解码当前宏块的全部残差块
    fn decode_residuals(&mut self, idx: usize) {
        let field = self.pic.ctx.mb_field_decoding_flag;
        let curr_type = self.pic.mbs[idx].mb_type;
        let cbp_luma = self.pic.mbs[idx].cbp_luma;
        let cbp_chroma = self.pic.mbs[idx].cbp_chroma;

        if mb::is_intra_16x16(curr_type) {
            // 亮度 DC 始终存在
            let inc = self.cbf_inc_dc(idx, MB_NZC_DC_Y);
            let coeffs =
                decode_residual_block(&mut self.cabac, &mut self.ctxs, &CAT_LUMA_DC, inc, true, field);
            self.pic.ctx.non_zero_count[COMP_Y][0] = count_nonzero(&coeffs);

            for scan in 0..16usize {
                let raster = BLOCK_SCAN_TO_RASTER[scan];
                let pos = cache_pos_of_raster(raster);
                if cbp_luma != 0 {
                    let inc = self.cbf_inc_from_cache(COMP_Y, pos);
                    let coeffs = decode_residual_block(
                        &mut self.cabac,
                        &mut self.ctxs,
                        &CAT_LUMA_AC,
                        inc,
                        true,
                        field,
                    );
                    self.pic.ctx.non_zero_count[COMP_Y][pos] = count_nonzero(&coeffs);
                } else {
                    self.pic.ctx.non_zero_count[COMP_Y][pos] = 0;
                }
            }
        } else if mb::is_intra_8x8(curr_type) {
            for blk8 in 0..4usize {
                let cells = [
                    cache_pos_of_raster((blk8 >> 1) * 8 + (blk8 & 1) * 2),
                    cache_pos_of_raster((blk8 >> 1) * 8 + (blk8 & 1) * 2 + 1),
                    cache_pos_of_raster((blk8 >> 1) * 8 + (blk8 & 1) * 2 + 4),
                    cache_pos_of_raster((blk8 >> 1) * 8 + (blk8 & 1) * 2 + 5),
                ];
                if cbp_luma & (1 << blk8) != 0 {
                    let coeffs = decode_residual_block(
                        &mut self.cabac,
                        &mut self.ctxs,
                        &CAT_LUMA_8X8,
                        0,
                        false,
                        field,
                    );
                    let count = count_nonzero(&coeffs).min(16);
                    for pos in cells {
                        self.pic.ctx.non_zero_count[COMP_Y][pos] = count;
                    }
                } else {
                    for pos in cells {
                        self.pic.ctx.non_zero_count[COMP_Y][pos] = 0;
                    }
                }
            }
        } else {
            // I_4x4 / SI
            for blk8 in 0..4usize {
                for sub in 0..4usize {
                    let scan = blk8 * 4 + sub;
                    let raster = BLOCK_SCAN_TO_RASTER[scan];
                    let pos = cache_pos_of_raster(raster);
                    if cbp_luma & (1 << blk8) != 0 {
                        let inc = self.cbf_inc_from_cache(COMP_Y, pos);
                        let coeffs = decode_residual_block(
                            &mut self.cabac,
                            &mut self.ctxs,
                            &CAT_LUMA_4X4,
                            inc,
                            true,
                            field,
                        );
                        self.pic.ctx.non_zero_count[COMP_Y][pos] = count_nonzero(&coeffs);
                    } else {
                        self.pic.ctx.non_zero_count[COMP_Y][pos] = 0;
                    }
                }
            }
        }

        // 色度 (4:2:0): DC 于 cbp_chroma != 0 时解码, AC 于 == 2 时解码
        if self.pic.ctx.chroma_array_type == 1 {
            for (comp, dc_slot) in [(COMP_CB, MB_NZC_DC_CB), (COMP_CR, MB_NZC_DC_CR)] {
                if cbp_chroma != 0 {
                    let inc = self.cbf_inc_dc(idx, dc_slot);
                    let coeffs = decode_residual_block(
                        &mut self.cabac,
                        &mut self.ctxs,
                        &CAT_CHROMA_DC,
                        inc,
                        true,
                        field,
                    );
                    self.pic.ctx.non_zero_count[comp][0] = count_nonzero(&coeffs);
                } else {
                    self.pic.ctx.non_zero_count[comp][0] = 0;
                }
            }
            for comp in [COMP_CB, COMP_CR] {
                for blk in 0..4usize {
                    let pos = MB_CACHE_IDX[blk];
                    if cbp_chroma == 2 {
                        let inc = self.cbf_inc_from_cache(comp, pos);
                        let coeffs = decode_residual_block(
                            &mut self.cabac,
                            &mut self.ctxs,
                            &CAT_CHROMA_AC,
                            inc,
                            true,
                            field,
                        );
                        self.pic.ctx.non_zero_count[comp][pos] = count_nonzero(&coeffs);
                    } else {
                        self.pic.ctx.non_zero_count[comp][pos] = 0;
                    }
                }
            }
        }
    }
}

/// 光栅 4x4 块号 → 缓存位置
fn cache_pos_of_raster(raster: usize) -> usize {
    (1 + raster / 4) * 8 + 4 + raster % 4
}

fn count_nonzero(coeffs: &[i32]) -> u8 {
    coeffs.iter().filter(|&&c| c != 0).count() as u8
}

/// 取 NxN 宏块在光栅 4x4 块号处的预测模式
fn nxn_mode_at(m: &super::mb::Mb, raster: usize) -> i8 {
    match m.intra_luma_pred_mode {
        IntraLumaPredModes::M4x4(modes) => modes[raster] as i8,
        IntraLumaPredModes::M8x8(modes) => {
            let q = (raster / 8) * 2 + (raster % 4) / 2;
            modes[q] as i8
        }
        IntraLumaPredModes::M16x16(_) | IntraLumaPredModes::None => 2,
    }
}
