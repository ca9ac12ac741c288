//! 图像上下文与宏块邻居引擎.
//!
//! 宏块编号为光栅顺序. 每个新宏块先按光栅偏移求出候选邻居
//! A(左)/B(上)/C(右上)/D(左上); left/left_pair/top 要等当前宏块的
//! 帧/场属性确定后再细化 (MBAFF 四分支), 同时选定 16 项的
//! `left_blocks` 重索引表.

use super::decoder::Dimensions;
use super::mb::{COMP_MAX, Mb, MbCache, is_interlaced};
use super::pps::Pps;
use super::slice::SliceHeader;
use super::sps::Sps;

/// 图像结构
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStructure {
    Frame,
    FieldTop,
    FieldBottom,
}

impl std::fmt::Display for PictureStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Frame => "frame",
            Self::FieldTop => "field_top",
            Self::FieldBottom => "field_bottom",
        };
        write!(f, "{s}")
    }
}

/// 当前宏块对应的 4x4 左列块重索引表, 按 (当前, 左邻) 帧/场组合四选一
pub const LEFT_BLOCK_OPTIONS: [[u8; 16]; 4] = [
    [0, 1, 2, 3, 7, 10, 8, 11, 3, 7, 11, 15, 17, 33, 21, 37],
    [2, 2, 3, 3, 8, 11, 8, 11, 11, 11, 15, 15, 21, 37, 21, 37],
    [0, 0, 1, 1, 7, 10, 7, 10, 3, 3, 7, 7, 17, 33, 17, 33],
    [0, 2, 0, 2, 7, 10, 7, 10, 3, 11, 3, 11, 17, 33, 17, 33],
];

/// 逐 slice 的解码上下文变量
#[derive(Debug, Clone)]
pub struct ContextVariables {
    pub mb_aff_frame: bool,
    pub mb_field_decoding_flag: bool,
    pub mb_x: i32,
    pub mb_y: i32,
    pub mb_pos: i32,
    pub last_qp_delta: i32,
    pub qp_y: i32,
    pub qp_c: [i32; 2],
    pub chroma_array_type: u32,
    /// 当前宏块对的左列重索引表
    pub left_blocks: &'static [u8; 16],
    /// 帧内 NxN 预测模式缓存 (-1 表示不可用)
    pub intra_nxn_pred_mode: [i8; 5 * 8],
    /// 各颜色分量的非零计数缓存
    pub non_zero_count: [MbCache; COMP_MAX],
}

/// 一幅待解码图像: 宏块数组 + 上下文
pub struct Picture {
    pub structure: PictureStructure,
    pub ctx: ContextVariables,
    pub mbs: Vec<Mb>,
    pub slice_num: i32,
    mb_width: i32,
    mb_num: i32,
}

impl Picture {
    /// 依据激活的参数集与 slice header 建立图像上下文
    pub fn new(sps: &Sps, pps: &Pps, sh: &SliceHeader, dims: &Dimensions, qp_c: [i32; 2]) -> Self {
        let (structure, mb_aff_frame) = if sps.frame_mbs_only_flag {
            (PictureStructure::Frame, false)
        } else if sh.field_pic_flag {
            if sh.bottom_field_flag {
                (PictureStructure::FieldBottom, false)
            } else {
                (PictureStructure::FieldTop, false)
            }
        } else {
            (PictureStructure::Frame, sps.mb_adaptive_frame_field_flag)
        };

        let mb_width = dims.mb_width;
        let mb_x = sh.first_mb_in_slice as i32 % mb_width;
        let mut mb_y = sh.first_mb_in_slice as i32 / mb_width;
        let mb_pos = mb_x + mb_y * mb_width;

        if sh.field_pic_flag || mb_aff_frame {
            mb_y *= 2;
        }
        if structure == PictureStructure::FieldBottom {
            mb_y += 1;
        }

        let ctx = ContextVariables {
            mb_aff_frame,
            mb_field_decoding_flag: structure != PictureStructure::Frame,
            mb_x,
            mb_y,
            mb_pos,
            last_qp_delta: 0,
            qp_y: pps.pic_init_qp_minus26 + 26 + sh.slice_qp_delta,
            qp_c,
            chroma_array_type: sps.chroma_array_type(),
            left_blocks: &LEFT_BLOCK_OPTIONS[0],
            intra_nxn_pred_mode: [0; 40],
            non_zero_count: [[0; 40]; COMP_MAX],
        };

        Self {
            structure,
            ctx,
            mbs: vec![Mb::default(); dims.mb_num as usize],
            slice_num: sh.first_mb_in_slice as i32,
            mb_width,
            mb_num: dims.mb_num,
        }
    }

    /// 宏块可用性: 地址合法, 不晚于当前宏块, 且属于同一 slice
    pub fn is_mb_available(&self, n: i32) -> bool {
        n >= 0
            && n <= self.ctx.mb_pos
            && (n == self.ctx.mb_pos || self.mbs[n as usize].slice_num == self.slice_num)
    }

    fn get_mb(&self, n: i32) -> Option<usize> {
        self.is_mb_available(n).then_some(n as usize)
    }

    /// 取当前宏块并计算第一阶段邻居, 越过图像末尾时返回 None
    pub fn curr_mb(&mut self) -> Option<usize> {
        let n = self.ctx.mb_pos;
        if n >= self.mb_num {
            return None;
        }

        let idx = n as usize;
        self.mbs[idx].x = self.ctx.mb_x;
        self.mbs[idx].y = self.ctx.mb_y;
        self.mbs[idx].pos = n;
        self.mbs[idx].slice_num = self.slice_num;

        self.calculate_neighbours_part1(idx);
        Some(idx)
    }

    /// 第一阶段: 按光栅偏移求 A/B/C/D 候选
    fn calculate_neighbours_part1(&mut self, idx: usize) {
        let n = self.ctx.mb_pos;
        let y = self.ctx.mb_y;
        let w = self.mb_width;

        let (a, b, c, d) = if self.ctx.mb_aff_frame {
            let shift = if y & 1 == 1 { 3 * w } else { 2 * w };
            (
                (n % w != 0).then(|| self.get_mb(n - 1 - (y & 1) * w)).flatten(),
                self.get_mb(n - shift),
                ((n + 1) % w != 0).then(|| self.get_mb(n - shift + 1)).flatten(),
                (n % w != 0).then(|| self.get_mb(n - shift - 1)).flatten(),
            )
        } else {
            let shift = if self.structure == PictureStructure::Frame {
                w
            } else {
                2 * w
            };
            (
                (n % w != 0).then(|| self.get_mb(n - 1)).flatten(),
                self.get_mb(n - shift),
                ((n + 1) % w != 0).then(|| self.get_mb(n - shift + 1)).flatten(),
                (n % w != 0).then(|| self.get_mb(n - shift - 1)).flatten(),
            )
        };

        let mb = &mut self.mbs[idx];
        mb.a = a;
        mb.b = b;
        mb.c = c;
        mb.d = d;

        // left/top 需要知道当前宏块是帧编码还是场编码, 留给第二阶段
        mb.left = None;
        mb.left_pair = [None; 2];
        mb.top = None;
    }

    /// 第二阶段: 确定 left/left_pair/top 与 left_blocks
    ///
    /// MBAFF 下按 (当前帧/场, 宏块对上/下) 四种组合细化;
    /// 左邻本身的帧/场属性决定取宏块对的哪一半和哪张重索引表.
    pub fn calculate_neighbours_part2(&mut self, idx: usize) {
        let w = self.mb_width as usize;

        if !self.ctx.mb_aff_frame {
            let mb = &self.mbs[idx];
            let (a, b) = (mb.a, mb.b);
            let mb = &mut self.mbs[idx];
            mb.left = a;
            mb.left_pair = [a, a];
            mb.top = b;
            self.ctx.left_blocks = &LEFT_BLOCK_OPTIONS[0];
            return;
        }

        let curr_y = self.mbs[idx].y;
        let mb_ax = self.mbs[idx].a;
        let mb_bx = self.mbs[idx].b;
        let ax_interlaced = mb_ax.map(|a| is_interlaced(self.mbs[a].mb_type)).unwrap_or(false);
        let bx_interlaced = mb_bx.map(|b| is_interlaced(self.mbs[b].mb_type)).unwrap_or(false);
        let is_top_mb = curr_y & 1 == 0;

        let mut left_pair = [None; 2];
        let mut top = None;
        let mut left_blocks: &'static [u8; 16] = &LEFT_BLOCK_OPTIONS[0];

        if !self.ctx.mb_field_decoding_flag {
            // 当前为帧编码宏块
            if is_top_mb {
                if let Some(ax) = mb_ax {
                    left_pair = [Some(ax), Some(ax)];
                    left_blocks = if ax_interlaced {
                        &LEFT_BLOCK_OPTIONS[2]
                    } else {
                        &LEFT_BLOCK_OPTIONS[0]
                    };
                }
                if let Some(bx) = mb_bx {
                    top = Some(bx + w);
                }
            } else {
                if let Some(ax) = mb_ax {
                    if ax_interlaced {
                        left_pair = [Some(ax), Some(ax)];
                        left_blocks = &LEFT_BLOCK_OPTIONS[1];
                    } else {
                        left_pair = [Some(ax + w), Some(ax + w)];
                        left_blocks = &LEFT_BLOCK_OPTIONS[0];
                    }
                }
                // 宏块对下半的上邻是同对的上半
                top = Some(idx - w);
            }
        } else {
            // 当前为场编码宏块
            if let Some(ax) = mb_ax {
                if ax_interlaced {
                    if is_top_mb {
                        left_pair = [Some(ax), Some(ax)];
                        left_blocks = &LEFT_BLOCK_OPTIONS[0];
                    } else {
                        left_pair = [Some(ax + w), Some(ax + w)];
                        left_blocks = &LEFT_BLOCK_OPTIONS[0];
                    }
                } else {
                    left_pair = [Some(ax), Some(ax + w)];
                    left_blocks = &LEFT_BLOCK_OPTIONS[3];
                }
            }
            if let Some(bx) = mb_bx {
                if is_top_mb {
                    top = if bx_interlaced { Some(bx) } else { Some(bx + w) };
                } else {
                    top = Some(bx + w);
                }
            }
        }

        let mb = &mut self.mbs[idx];
        mb.left_pair = left_pair;
        mb.left = left_pair[0];
        mb.top = top;
        self.ctx.left_blocks = left_blocks;
    }

    /// 前进到下一个宏块位置
    ///
    /// MBAFF 下先走完宏块对 (上→下) 再右移; 场图像按 2 行步进.
    pub fn advance_mb_pos(&mut self) {
        if self.ctx.mb_aff_frame {
            if self.ctx.mb_y & 1 == 0 {
                self.ctx.mb_y += 1; // 移到宏块对的下半
            } else {
                self.ctx.mb_y -= 1; // 回到上半
                self.ctx.mb_x += 1; // 右移一个宏块对
                if self.ctx.mb_x >= self.mb_width {
                    self.ctx.mb_x = 0;
                    self.ctx.mb_y += 2;
                }
            }
        } else {
            self.ctx.mb_x += 1;
            if self.ctx.mb_x >= self.mb_width {
                self.ctx.mb_x = 0;
                self.ctx.mb_y += 1;
                if self.structure != PictureStructure::Frame {
                    self.ctx.mb_y += 1;
                }
            }
        }

        self.ctx.mb_pos = self.ctx.mb_x + self.ctx.mb_y * self.mb_width;
    }

    /// 宏块总数
    pub fn mb_num(&self) -> i32 {
        self.mb_num
    }

    /// 宏块行宽
    pub fn mb_width(&self) -> i32 {
        self.mb_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::pps::parse_pps;
    use crate::h264::slice::parse_slice_header;
    use crate::h264::sps::parse_sps;
    use crate::h264::{Container, H264Parser, H264ParserStatus, NalUnitType};
    use liuxi_core::BitReader;

    fn qcif_picture() -> Picture {
        let sps_data = [0x42, 0xC0, 0x0D, 0xF4, 0x16, 0x27, 0x20];
        let mut br = BitReader::new(&sps_data);
        let sps = parse_sps(&mut br).unwrap();

        let pps_data = [0xEE, 0x38, 0x80];
        let mut br = BitReader::new(&pps_data);
        let pps = parse_pps(&mut br, |_| Some(&sps)).unwrap();

        // IDR I-slice header
        let sh_bits = [0b1_0001000u8, 0b1_0000_1_00, 0b00_0_1_1_000];
        let mut br = BitReader::new(&sh_bits);
        let sh = parse_slice_header(
            &mut br,
            3,
            NalUnitType::SliceIdr,
            |_| Some(&pps),
            |_| Some(&sps),
        )
        .unwrap();

        let dims = Dimensions::from_sps(&sps);
        Picture::new(&sps, &pps, &sh, &dims, [26, 26])
    }

    #[test]
    fn test_first_mb_has_no_neighbours() {
        let mut pic = qcif_picture();
        let idx = pic.curr_mb().unwrap();
        assert_eq!(idx, 0);
        let mb = &pic.mbs[0];
        assert!(mb.a.is_none());
        assert!(mb.b.is_none());
        assert!(mb.c.is_none());
        assert!(mb.d.is_none());
    }

    #[test]
    fn test_raster_neighbours() {
        let mut pic = qcif_picture();
        let w = pic.mb_width() as usize;

        // 走到第二行中间的宏块
        let target = w + 2;
        for _ in 0..target {
            pic.curr_mb().unwrap();
            pic.calculate_neighbours_part2(pic.ctx.mb_pos as usize);
            pic.advance_mb_pos();
        }
        let idx = pic.curr_mb().unwrap();
        pic.calculate_neighbours_part2(idx);

        let mb = &pic.mbs[idx];
        assert_eq!(mb.a, Some(target - 1));
        assert_eq!(mb.b, Some(target - w));
        assert_eq!(mb.c, Some(target - w + 1));
        assert_eq!(mb.d, Some(target - w - 1));
        assert_eq!(mb.left, Some(target - 1));
        assert_eq!(mb.top, Some(target - w));
    }

    #[test]
    fn test_neighbours_strictly_precede() {
        let mut pic = qcif_picture();
        let total = pic.mb_num();
        for _ in 0..total {
            let idx = pic.curr_mb().unwrap();
            pic.calculate_neighbours_part2(idx);
            let mb = &pic.mbs[idx];
            for nb in [mb.a, mb.b, mb.c, mb.d, mb.left, mb.top] {
                if let Some(n) = nb {
                    assert!(
                        (n as i32) < mb.pos,
                        "宏块 {} 的邻居 {} 不在其之前",
                        mb.pos,
                        n
                    );
                }
            }
            pic.advance_mb_pos();
        }
        assert!(pic.curr_mb().is_none(), "走完整幅图像后应返回 None");
    }

    #[test]
    fn test_top_right_unavailable_at_row_edge() {
        let mut pic = qcif_picture();
        let w = pic.mb_width() as usize;

        // 第二行最后一个宏块: C (右上) 不可用
        let target = 2 * w - 1;
        for _ in 0..target {
            pic.curr_mb().unwrap();
            pic.advance_mb_pos();
        }
        let idx = pic.curr_mb().unwrap();
        assert_eq!(idx, target);
        assert!(pic.mbs[idx].c.is_none());
        assert!(pic.mbs[idx].a.is_some());
    }

    #[test]
    fn test_parser_to_picture_smoke() {
        // 经由解析器构造上下文, 验证尺寸推导一致
        let mut parser = H264Parser::new(4096, Container::AnnexB);
        let mut stream = vec![0x00, 0x00, 0x01];
        stream.extend_from_slice(&[0x67, 0x42, 0xC0, 0x0D, 0xF4, 0x16, 0x27, 0x20]);
        stream.extend_from_slice(&[0x00, 0x00, 0x01]);
        parser.write(&stream);
        assert_eq!(parser.parse(), H264ParserStatus::SpsParsed);
        let sps = parser.recent_sps().unwrap();
        let dims = Dimensions::from_sps(sps);
        assert_eq!(dims.mb_width, 11);
        assert_eq!(dims.mb_height, 9);
        assert_eq!(dims.mb_num, 99);
    }
}
