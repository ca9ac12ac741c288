//! CABAC 算术解码引擎.
//!
//! 上下文自适应二进制算术解码 (标准 9.3). 引擎持有 codIRange /
//! codIOffset 两个寄存器和一个指向 slice 数据的位游标;
//! 1024 个上下文变量各自维护 (pStateIdx, valMPS), 由调用方以
//! 上下文编号索引后传入 [`CabacDecoder::decode_decision`].
//!
//! 初始化按标准 9.3.1.1 由 (m, n) 初值表与截断后的 slice QP 推导;
//! 本模块只内置 I/SI slice 用到的初值段, 其余上下文置中性初值.

/// 上下文变量总数
pub const CABAC_CONTEXT_COUNT: usize = 1024;

/// 单个上下文变量: 概率状态 + 最可能符号
#[derive(Debug, Clone, Copy, Default)]
pub struct CabacCtx {
    pub p_state_idx: u8,
    pub val_mps: u8,
}

/// LPS 区间细分表 (标准 Table 9-44), 按 [pStateIdx][(codIRange>>6)&3]
#[rustfmt::skip]
const RANGE_TAB_LPS: [[u8; 4]; 64] = [
    [128, 176, 208, 240], [128, 167, 197, 227], [128, 158, 187, 216], [123, 150, 178, 205],
    [116, 142, 169, 195], [111, 135, 160, 185], [105, 128, 152, 175], [100, 122, 144, 166],
    [ 95, 116, 137, 158], [ 90, 110, 130, 150], [ 85, 104, 123, 142], [ 81,  99, 117, 135],
    [ 77,  94, 111, 128], [ 73,  89, 105, 122], [ 69,  85, 100, 116], [ 66,  80,  95, 110],
    [ 62,  76,  90, 104], [ 59,  72,  86,  99], [ 56,  69,  81,  94], [ 53,  65,  77,  89],
    [ 51,  62,  73,  85], [ 48,  59,  69,  80], [ 46,  56,  66,  76], [ 43,  53,  63,  72],
    [ 41,  50,  59,  69], [ 39,  48,  56,  65], [ 37,  45,  54,  62], [ 35,  43,  51,  59],
    [ 33,  41,  48,  56], [ 32,  39,  46,  53], [ 30,  37,  43,  50], [ 29,  35,  41,  48],
    [ 27,  33,  39,  45], [ 26,  31,  37,  43], [ 24,  30,  35,  41], [ 23,  28,  33,  39],
    [ 22,  27,  32,  37], [ 21,  26,  30,  35], [ 20,  24,  29,  33], [ 19,  23,  27,  31],
    [ 18,  22,  26,  30], [ 17,  21,  25,  28], [ 16,  20,  23,  27], [ 15,  19,  22,  25],
    [ 14,  18,  21,  24], [ 14,  17,  20,  23], [ 13,  16,  19,  22], [ 12,  15,  18,  21],
    [ 12,  14,  17,  20], [ 11,  14,  16,  19], [ 11,  13,  15,  18], [ 10,  12,  15,  17],
    [ 10,  12,  14,  16], [  9,  11,  13,  15], [  9,  11,  12,  14], [  8,  10,  12,  14],
    [  8,   9,  11,  13], [  7,   9,  11,  12], [  7,   9,  10,  12], [  7,   8,  10,  11],
    [  6,   8,   9,  11], [  6,   7,   9,  10], [  6,   7,   8,   9], [  2,   2,   2,   2],
];

/// MPS 状态转移 (标准 Table 9-45)
#[rustfmt::skip]
const TRANS_IDX_MPS: [u8; 64] = [
     1,  2,  3,  4,  5,  6,  7,  8,  9, 10, 11, 12, 13, 14, 15, 16,
    17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32,
    33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48,
    49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 62, 63,
];

/// LPS 状态转移 (标准 Table 9-45)
#[rustfmt::skip]
const TRANS_IDX_LPS: [u8; 64] = [
     0,  0,  1,  2,  2,  4,  4,  5,  6,  7,  8,  9,  9, 11, 11, 12,
    13, 13, 15, 15, 16, 16, 18, 18, 19, 19, 21, 21, 22, 22, 23, 24,
    24, 25, 26, 26, 27, 27, 28, 29, 29, 30, 30, 30, 31, 32, 32, 33,
    33, 33, 34, 34, 35, 35, 35, 36, 36, 36, 37, 37, 37, 38, 38, 63,
];

// ============================================================
// I/SI slice 上下文初值 (标准 Table 9-12 族的 I 列)
// ============================================================

/// ctx 0..=10: mb_type (SI 前缀 + I 前后缀)
#[rustfmt::skip]
const INIT_I_MB_TYPE: [[i8; 2]; 11] = [
    [ 20, -15], [  2,  54], [  3,  74], [ 20, -15], [  2,  54], [  3,  74],
    [-28, 127], [-23, 104], [ -6,  53], [ -1,  54], [  7,  51],
];

/// ctx 60..=63: mb_qp_delta
const INIT_I_MB_QP_DELTA: [[i8; 2]; 4] = [[0, 41], [0, 63], [0, 63], [0, 63]];

/// ctx 64..=67: intra_chroma_pred_mode
const INIT_I_CHROMA_PRED: [[i8; 2]; 4] = [[-9, 83], [4, 86], [0, 97], [-7, 72]];

/// ctx 68..=69: prev_intraNxN_pred_mode_flag / rem_intraNxN_pred_mode
const INIT_I_INTRA_PRED: [[i8; 2]; 2] = [[13, 41], [3, 62]];

/// ctx 70..=72: mb_field_decoding_flag
const INIT_I_MB_FIELD: [[i8; 2]; 3] = [[0, 45], [-4, 78], [-3, 96]];

/// ctx 73..=76: coded_block_pattern (亮度)
const INIT_I_CBP_LUMA: [[i8; 2]; 4] = [[-27, 126], [-28, 98], [-25, 101], [-23, 67]];

/// ctx 77..=84: coded_block_pattern (色度)
#[rustfmt::skip]
const INIT_I_CBP_CHROMA: [[i8; 2]; 8] = [
    [-28,  82], [-20,  94], [-16,  83], [-22, 110],
    [-21,  91], [-18, 102], [-13,  93], [-29, 127],
];

/// ctx 85..=104: coded_block_flag (块类别 0..=4)
#[rustfmt::skip]
const INIT_I_CBF: [[i8; 2]; 20] = [
    [ -7,  92], [ -5,  89], [ -7,  96], [-13, 108], [ -3,  46],
    [ -1,  65], [ -1,  57], [ -9,  93], [ -3,  74], [ -9,  92],
    [ -8,  87], [-23, 126], [  5,  54], [  6,  60], [  6,  59],
    [  6,  69], [ -1,  48], [  0,  68], [ -4,  69], [ -8,  88],
];

/// ctx 105..=165: significant_coeff_flag (帧)
#[rustfmt::skip]
const INIT_I_SIG_FRAME: [[i8; 2]; 61] = [
    [ -7,  93], [-11,  87], [ -3,  77], [ -5,  71], [ -4,  63],
    [ -4,  68], [-12,  84], [ -7,  62], [ -7,  65], [  8,  61],
    [  5,  56], [ -2,  66], [  1,  64], [  0,  61], [ -2,  78],
    [  1,  50], [  7,  52], [ 10,  35], [  0,  44], [ 11,  38],
    [  1,  45], [  0,  46], [  5,  44], [ 31,  17], [  1,  51],
    [  7,  50], [ 28,  19], [ 16,  33], [ 14,  62], [-13, 108],
    [-15, 100], [-13, 101], [-13,  91], [-12,  94], [-10,  88],
    [-16,  84], [-10,  86], [ -7,  83], [-13,  87], [-19,  94],
    [  1,  70], [  0,  72], [ -5,  74], [ 18,  59], [ -8, 102],
    [-15, 100], [  0,  95], [ -4,  75], [  2,  72], [-11,  75],
    [ -3,  71], [ 15,  46], [-13,  69], [  0,  62], [  0,  65],
    [ 21,  37], [-15,  72], [  9,  57], [ 16,  54], [  0,  62],
    [ 12,  72],
];

/// ctx 166..=226: last_significant_coeff_flag (帧)
#[rustfmt::skip]
const INIT_I_LAST_FRAME: [[i8; 2]; 61] = [
    [ 24,   0], [ 15,   9], [  8,  25], [ 13,  18], [ 15,   9],
    [ 13,  19], [ 10,  37], [ 12,  18], [  6,  29], [ 20,  33],
    [ 15,  30], [  4,  45], [  1,  58], [  0,  62], [  7,  61],
    [ 12,  38], [ 11,  45], [ 15,  39], [ 11,  42], [ 13,  44],
    [ 16,  45], [ 12,  41], [ 10,  49], [ 30,  34], [ 18,  42],
    [ 10,  55], [ 17,  51], [ 17,  46], [  0,  89], [ 26, -19],
    [ 22, -17], [ 26, -17], [ 30, -25], [ 28, -20], [ 33, -23],
    [ 37, -27], [ 33, -23], [ 40, -28], [ 38, -17], [ 33, -11],
    [ 40, -15], [ 41,  -6], [ 38,   1], [ 41,  17], [ 30,  -6],
    [ 27,   3], [ 26,  22], [ 37, -16], [ 35,  -4], [ 38,  -8],
    [ 38,  -3], [ 37,   3], [ 38,   5], [ 42,   0], [ 35,  16],
    [ 39,  22], [ 14,  48], [ 27,  37], [ 21,  60], [ 12,  68],
    [  2,  97],
];

/// ctx 227..=275: coeff_abs_level_minus1
#[rustfmt::skip]
const INIT_I_ABS_LEVEL: [[i8; 2]; 49] = [
    [ -3,  71], [ -6,  42], [ -5,  50], [ -3,  54], [ -2,  62],
    [  0,  58], [  1,  63], [ -2,  72], [ -1,  74], [ -9,  91],
    [ -5,  67], [ -4,  76], [ -4,  77], [ -4,  82], [ -4,  76],
    [-12,  97], [ -7,  64], [ -1,  74], [ -1,  80], [ -1,  83],
    [ -1,  88], [ -1,  85], [ -4,  82], [ -6,  81], [ -4,  99],
    [-14, 106], [-11,  97], [ -9,  88], [ -8,  85], [ -8,  79],
    [ -5,  64], [ -1,  62], [  0,  75], [ -1,  87], [-21, 126],
    [-23, 124], [-20, 110], [-26, 126], [-25, 124], [-17, 105],
    [-27, 121], [-27, 117], [-17, 102], [-26, 117], [-27, 116],
    [-33, 122], [-10,  95], [-14, 100], [ -8,  95],
];

/// ctx 277..=337: significant_coeff_flag (场)
#[rustfmt::skip]
const INIT_I_SIG_FIELD: [[i8; 2]; 61] = [
    [ -6,  93], [ -6,  84], [ -8,  79], [  0,  66], [ -1,  71],
    [  0,  62], [ -2,  60], [ -2,  59], [ -5,  75], [ -3,  62],
    [ -4,  58], [ -9,  66], [ -1,  79], [  0,  71], [  3,  68],
    [ 10,  44], [ -7,  62], [ 15,  36], [ 14,  40], [ 16,  27],
    [ 12,  29], [  1,  44], [ 20,  36], [ 18,  32], [  5,  42],
    [  1,  48], [ 10,  62], [ 17,  46], [  9,  64], [-12, 104],
    [-11,  97], [-16,  96], [ -7,  88], [ -8,  85], [ -7,  85],
    [ -9,  85], [-13,  88], [  4,  66], [ -3,  77], [ -3,  76],
    [ -6,  76], [ 10,  58], [ -1,  76], [ -1,  83], [ -7,  99],
    [-14,  95], [  2,  95], [  0,  76], [ -5,  74], [  0,  70],
    [-11,  75], [  1,  68], [  0,  65], [-14,  73], [  3,  62],
    [  4,  62], [ -1,  68], [-13,  75], [ 11,  55], [  5,  64],
    [ 12,  70],
];

/// ctx 338..=398: last_significant_coeff_flag (场)
#[rustfmt::skip]
const INIT_I_LAST_FIELD: [[i8; 2]; 61] = [
    [ 11,  28], [  2,  40], [  3,  44], [  0,  49], [  0,  46],
    [  2,  44], [  2,  51], [  0,  47], [  4,  39], [  2,  62],
    [  6,  46], [  0,  54], [  3,  54], [  2,  58], [  4,  63],
    [  6,  51], [  6,  57], [  7,  53], [  6,  52], [  6,  55],
    [ 11,  45], [ 14,  36], [  8,  53], [ -1,  82], [  7,  55],
    [ -3,  78], [ 15,  46], [ 22,  31], [ -1,  84], [ 25,   7],
    [ 30,  -7], [ 28,   3], [ 28,   4], [ 32,   0], [ 34,  -1],
    [ 30,   6], [ 30,   6], [ 32,   9], [ 31,  19], [ 26,  27],
    [ 26,  30], [ 37,  20], [ 28,  34], [ 17,  70], [  1,  67],
    [  5,  59], [  9,  67], [ 16,  30], [ 18,  32], [ 18,  35],
    [ 22,  29], [ 24,  31], [ 23,  38], [ 18,  43], [ 20,  41],
    [ 11,  63], [  9,  59], [  9,  64], [ -1,  94], [ -2,  89],
    [ -9, 108],
];

/// ctx 399..=401: transform_size_8x8_flag
const INIT_I_TRANSFORM_8X8: [[i8; 2]; 3] = [[31, 21], [31, 31], [25, 50]];

/// ctx 402..=416: significant_coeff_flag (8x8, 帧)
#[rustfmt::skip]
const INIT_I_SIG_8X8_FRAME: [[i8; 2]; 15] = [
    [-17, 120], [-20, 112], [-18, 114], [-11,  85], [-15,  92],
    [-14,  89], [-26,  71], [-15,  81], [-14,  80], [  0,  68],
    [-14,  70], [-24,  56], [-23,  68], [-24,  50], [-11,  74],
];

/// ctx 417..=425: last_significant_coeff_flag (8x8, 帧)
#[rustfmt::skip]
const INIT_I_LAST_8X8_FRAME: [[i8; 2]; 9] = [
    [ 23, -13], [ 26, -13], [ 40, -15], [ 49, -14], [ 44,   3],
    [ 45,   6], [ 44,  34], [ 33,  54], [ 19,  82],
];

/// ctx 426..=435: coeff_abs_level_minus1 (8x8)
#[rustfmt::skip]
const INIT_I_ABS_8X8: [[i8; 2]; 10] = [
    [ -3,  75], [ -1,  23], [  1,  34], [  1,  43], [  0,  54],
    [ -2,  55], [  0,  61], [  1,  64], [  0,  68], [ -9,  92],
];

/// ctx 436..=450: significant_coeff_flag (8x8, 场)
#[rustfmt::skip]
const INIT_I_SIG_8X8_FIELD: [[i8; 2]; 15] = [
    [-17, 123], [-12, 115], [-16, 122], [-11, 115], [-12,  63],
    [ -2,  68], [-15,  84], [-13, 104], [ -3,  70], [ -8,  93],
    [-10,  90], [-30, 127], [ -1,  74], [ -6,  97], [ -7,  91],
];

/// ctx 451..=459: last_significant_coeff_flag (8x8, 场)
#[rustfmt::skip]
const INIT_I_LAST_8X8_FIELD: [[i8; 2]; 9] = [
    [-20, 127], [ -4, 124], [ -7,  81], [ -5, 104], [ -7,  91],
    [-32, 127], [-10,  95], [-14, 100], [ -8,  95],
];

fn clip3(low: i32, high: i32, v: i32) -> i32 {
    v.clamp(low, high)
}

/// 初始化单个上下文 (标准 9.3.1.1)
fn init_ctx(m: i8, n: i8, slice_qp: i32) -> CabacCtx {
    let qp = clip3(0, 51, slice_qp);
    let pre_ctx_state = clip3(1, 126, ((i32::from(m) * qp) >> 4) + i32::from(n));
    if pre_ctx_state <= 63 {
        CabacCtx {
            p_state_idx: (63 - pre_ctx_state) as u8,
            val_mps: 0,
        }
    } else {
        CabacCtx {
            p_state_idx: (pre_ctx_state - 64) as u8,
            val_mps: 1,
        }
    }
}

fn fill(ctxs: &mut [CabacCtx], base: usize, table: &[[i8; 2]], slice_qp: i32) {
    for (i, [m, n]) in table.iter().enumerate() {
        ctxs[base + i] = init_ctx(*m, *n, slice_qp);
    }
}

/// 初始化 I/SI slice 的全部上下文变量
///
/// 未被 I/SI 语法元素触及的上下文置中性初值 (pStateIdx=0, valMPS=1).
pub fn init_contexts_i_slice(slice_qp: i32) -> Vec<CabacCtx> {
    let mut ctxs = vec![
        CabacCtx {
            p_state_idx: 0,
            val_mps: 1,
        };
        CABAC_CONTEXT_COUNT
    ];

    fill(&mut ctxs, 0, &INIT_I_MB_TYPE, slice_qp);
    fill(&mut ctxs, 60, &INIT_I_MB_QP_DELTA, slice_qp);
    fill(&mut ctxs, 64, &INIT_I_CHROMA_PRED, slice_qp);
    fill(&mut ctxs, 68, &INIT_I_INTRA_PRED, slice_qp);
    fill(&mut ctxs, 70, &INIT_I_MB_FIELD, slice_qp);
    fill(&mut ctxs, 73, &INIT_I_CBP_LUMA, slice_qp);
    fill(&mut ctxs, 77, &INIT_I_CBP_CHROMA, slice_qp);
    fill(&mut ctxs, 85, &INIT_I_CBF, slice_qp);
    fill(&mut ctxs, 105, &INIT_I_SIG_FRAME, slice_qp);
    fill(&mut ctxs, 166, &INIT_I_LAST_FRAME, slice_qp);
    fill(&mut ctxs, 227, &INIT_I_ABS_LEVEL, slice_qp);
    fill(&mut ctxs, 277, &INIT_I_SIG_FIELD, slice_qp);
    fill(&mut ctxs, 338, &INIT_I_LAST_FIELD, slice_qp);
    fill(&mut ctxs, 399, &INIT_I_TRANSFORM_8X8, slice_qp);
    fill(&mut ctxs, 402, &INIT_I_SIG_8X8_FRAME, slice_qp);
    fill(&mut ctxs, 417, &INIT_I_LAST_8X8_FRAME, slice_qp);
    fill(&mut ctxs, 426, &INIT_I_ABS_8X8, slice_qp);
    fill(&mut ctxs, 436, &INIT_I_SIG_8X8_FIELD, slice_qp);
    fill(&mut ctxs, 451, &INIT_I_LAST_8X8_FIELD, slice_qp);

    ctxs
}

// ============================================================
// 算术解码引擎
// ============================================================

/// CABAC 算术解码器
///
/// 从 slice 数据的字节对齐起点开始: `codIRange = 510`,
/// `codIOffset` 取流中头 9 个位. 位游标读越界时补零,
/// 结束条件由 decode_terminate 显式给出.
pub struct CabacDecoder<'a> {
    data: &'a [u8],
    /// 位游标
    bit_pos: usize,
    cod_i_range: u32,
    cod_i_offset: u32,
}

impl<'a> CabacDecoder<'a> {
    /// 在 slice 数据上初始化解码引擎 (标准 9.3.1.2)
    pub fn new(data: &'a [u8]) -> Self {
        let mut dec = Self {
            data,
            bit_pos: 0,
            cod_i_range: 510,
            cod_i_offset: 0,
        };
        dec.cod_i_offset = dec.read_engine_bits(9);
        dec
    }

    fn read_engine_bit(&mut self) -> u32 {
        let byte = self.bit_pos / 8;
        let bit = self.bit_pos % 8;
        self.bit_pos += 1;
        match self.data.get(byte) {
            Some(b) => u32::from((b >> (7 - bit)) & 1),
            None => 0,
        }
    }

    fn read_engine_bits(&mut self, n: u32) -> u32 {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.read_engine_bit();
        }
        v
    }

    /// 当前 codIRange (诊断与测试用)
    pub fn cod_i_range(&self) -> u32 {
        self.cod_i_range
    }

    /// 已消费的位数
    pub fn bits_consumed(&self) -> usize {
        self.bit_pos
    }

    /// 是否已读越 slice 数据末尾
    pub fn exhausted(&self) -> bool {
        self.bit_pos > self.data.len() * 8
    }

    /// 解码一个常规 bin (标准 9.3.3.2.1)
    pub fn decode_decision(&mut self, ctx: &mut CabacCtx) -> u32 {
        let q = ((self.cod_i_range >> 6) & 3) as usize;
        let range_lps = u32::from(RANGE_TAB_LPS[ctx.p_state_idx as usize][q]);
        self.cod_i_range -= range_lps;

        let bin;
        if self.cod_i_offset >= self.cod_i_range {
            // LPS
            bin = u32::from(1 - ctx.val_mps);
            self.cod_i_offset -= self.cod_i_range;
            self.cod_i_range = range_lps;
            if ctx.p_state_idx == 0 {
                ctx.val_mps = 1 - ctx.val_mps;
            }
            ctx.p_state_idx = TRANS_IDX_LPS[ctx.p_state_idx as usize];
        } else {
            // MPS
            bin = u32::from(ctx.val_mps);
            ctx.p_state_idx = TRANS_IDX_MPS[ctx.p_state_idx as usize];
        }

        self.renormalize();
        bin
    }

    /// 解码一个等概率 bin (标准 9.3.3.2.3)
    pub fn decode_bypass(&mut self) -> u32 {
        self.cod_i_offset = (self.cod_i_offset << 1) | self.read_engine_bit();
        if self.cod_i_offset >= self.cod_i_range {
            self.cod_i_offset -= self.cod_i_range;
            1
        } else {
            0
        }
    }

    /// 解码终止 bin (标准 9.3.3.2.4), 用于 end_of_slice 与 PCM 逃逸
    pub fn decode_terminate(&mut self) -> u32 {
        self.cod_i_range -= 2;
        if self.cod_i_offset >= self.cod_i_range {
            1
        } else {
            self.renormalize();
            0
        }
    }

    /// 重整化: 维持 codIRange ∈ [256, 510]
    fn renormalize(&mut self) {
        while self.cod_i_range < 256 {
            self.cod_i_range <<= 1;
            self.cod_i_offset = (self.cod_i_offset << 1) | self.read_engine_bit();
        }
    }

    /// 对齐位游标到下一个字节边界 (PCM 样本前)
    pub fn align_to_byte_boundary(&mut self) {
        self.bit_pos = self.bit_pos.div_ceil(8) * 8;
    }

    /// 读取一个原始字节 (PCM 样本), 越界时返回 0
    pub fn read_raw_byte(&mut self) -> u8 {
        debug_assert_eq!(self.bit_pos % 8, 0);
        let byte = self.bit_pos / 8;
        self.bit_pos += 8;
        self.data.get(byte).copied().unwrap_or(0)
    }

    /// PCM 样本之后重启解码引擎
    pub fn restart_engine(&mut self) {
        self.cod_i_range = 510;
        self.cod_i_offset = self.read_engine_bits(9);
    }
}
