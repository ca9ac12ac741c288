//! 比特流读取器.
//!
//! 提供从字节缓冲区中按位读取数据的能力, 是 NAL 语法结构解析与 CABAC
//! 熵解码共用的基础设施. 按大端位序读取 (MSB first).
//!
//! 与一般的比特读取器相比有三个额外约定:
//! - 每次失败的读取都不移动游标, 成功的读取精确移动所请求的位数;
//! - 读取器携带一个粘性状态位域 {OK, EOS, MISALIGNED, CORRUPTED},
//!   供上层在一串读取之后统一判断;
//! - 可注册一个错误回调, 在任何失败读取时收到 (失败前位置, 假想的
//!   失败后位置), 用于诊断输出.

use crate::endian::{read_be_u16, read_be_u32, read_be_u64};
use crate::{LiuxiError, LiuxiResult};

/// 未发生任何错误
pub const STATUS_OK: u32 = 0;
/// 已触及流末尾
pub const STATUS_EOS: u32 = 1 << 0;
/// 在非字节对齐位置执行了字节读取
pub const STATUS_MISALIGNED: u32 = 1 << 1;
/// 流被上层标记为损坏
pub const STATUS_CORRUPTED: u32 = 1 << 2;

/// 比特流中的一个位置: 字节偏移 + 字节内位偏移 (0 为最高位)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitPosition {
    pub byte: usize,
    pub bit: u8,
}

impl BitPosition {
    /// 折算为总位数
    pub fn to_bits(self) -> usize {
        self.byte * 8 + self.bit as usize
    }

    /// 位置前进 n 位后的假想位置
    pub fn advanced(self, n: usize) -> Self {
        let bits = self.to_bits() + n;
        Self {
            byte: bits / 8,
            bit: (bits % 8) as u8,
        }
    }
}

impl std::fmt::Display for BitPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.byte, self.bit)
    }
}

/// 失败读取的诊断回调: (失败前位置, 假想的失败后位置)
pub type BitReaderErrorFn = Box<dyn Fn(BitPosition, BitPosition)>;

/// 大端比特流读取器
///
/// # 示例
/// ```
/// use liuxi_core::bitreader::BitReader;
///
/// let data = [0b10110001, 0b01010101];
/// let mut br = BitReader::new(&data);
/// assert_eq!(br.read_bits(4).unwrap(), 0b1011);
/// assert_eq!(br.read_bits(4).unwrap(), 0b0001);
/// assert_eq!(br.read_u8().unwrap(), 0b01010101);
/// ```
pub struct BitReader<'a> {
    /// 源数据
    data: &'a [u8],
    /// 当前位置
    pos: BitPosition,
    /// 粘性状态位域
    status: u32,
    /// 失败读取的诊断回调
    error_fn: Option<BitReaderErrorFn>,
}

impl<'a> BitReader<'a> {
    /// 创建新的比特流读取器
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: BitPosition::default(),
            status: STATUS_OK,
            error_fn: None,
        }
    }

    /// 注册失败读取的诊断回调
    pub fn set_error_fn(&mut self, f: BitReaderErrorFn) {
        self.error_fn = Some(f);
    }

    /// 清除诊断回调
    pub fn clear_error_fn(&mut self) {
        self.error_fn = None;
    }

    /// 当前状态位域
    pub fn status(&self) -> u32 {
        self.status
    }

    /// 状态是否完全正常
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// 无条件标记流损坏
    pub fn mark_corrupted(&mut self) {
        self.status |= STATUS_CORRUPTED;
    }

    /// 清除状态位域
    pub fn clear_status(&mut self) {
        self.status = STATUS_OK;
    }

    /// 底层数据
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// 流总字节数
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 当前字节位置
    pub fn tell(&self) -> usize {
        self.pos.byte
    }

    /// 当前字节内位偏移 (0 = 最高位, 7 = 最低位)
    pub fn tell_bits(&self) -> u8 {
        self.pos.bit
    }

    /// 当前位置
    pub fn position(&self) -> BitPosition {
        self.pos
    }

    /// 剩余未读字节数 (不含当前字节已读的位)
    pub fn remains(&self) -> usize {
        self.data.len().saturating_sub(self.pos.byte)
    }

    /// 剩余可读位数
    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos.to_bits())
    }

    /// 回到流起始位置
    pub fn rewind(&mut self) {
        self.pos = BitPosition::default();
    }

    /// 跳过 n 个字节. 允许越过流末尾, 后续读取将以 EOS 失败.
    pub fn skip(&mut self, n: usize) {
        self.pos.byte += n;
    }

    /// 跳过 n 个位. 允许越过流末尾, 后续读取将以 EOS 失败.
    pub fn skip_bits(&mut self, n: usize) {
        self.pos = self.pos.advanced(n);
    }

    /// 将位置定位到指定字节偏移
    pub fn seek(&mut self, byte: usize, bit: u8) {
        self.pos = BitPosition { byte, bit: bit & 7 };
    }

    fn fail(&mut self, flag: u32, n_bits: usize) {
        self.status |= flag;
        if let Some(f) = &self.error_fn {
            f(self.pos, self.pos.advanced(n_bits));
        }
    }

    /// 读取 1 个位
    pub fn read_bit(&mut self) -> LiuxiResult<u32> {
        self.read_bits(1)
    }

    /// 读取 N 个位 (最多 32 位)
    ///
    /// 按大端位序读取, 返回值的低 N 位有效.
    /// 位数不足时返回 `Eof`, 且不移动游标.
    pub fn read_bits(&mut self, n: u32) -> LiuxiResult<u32> {
        let v = self.peek_bits(n)?;
        self.pos = self.pos.advanced(n as usize);
        Ok(v)
    }

    /// 窥视 N 个位 (不移动位置)
    pub fn peek_bits(&mut self, n: u32) -> LiuxiResult<u32> {
        if n == 0 {
            return Ok(0);
        }
        if n > 32 {
            return Err(LiuxiError::InvalidArgument(format!(
                "peek_bits: n={} 超过 32 位",
                n,
            )));
        }
        if (n as usize) > self.bits_left() {
            self.fail(STATUS_EOS, n as usize);
            return Err(LiuxiError::Eof);
        }

        let mut byte_pos = self.pos.byte;
        let mut bit_pos = self.pos.bit as u32;
        let mut result: u32 = 0;
        let mut remaining = n;

        while remaining > 0 {
            let available = 8 - bit_pos;
            let to_read = remaining.min(available);

            // 从当前字节中提取位
            let shift = available - to_read;
            let mask = ((1u32 << to_read) - 1) as u8;
            let bits = (self.data[byte_pos] >> shift) & mask;

            result = (result << to_read) | u32::from(bits);

            bit_pos += to_read;
            if bit_pos >= 8 {
                bit_pos = 0;
                byte_pos += 1;
            }
            remaining -= to_read;
        }

        Ok(result)
    }

    fn read_aligned(&mut self, n_bytes: usize) -> LiuxiResult<&'a [u8]> {
        if self.pos.bit != 0 {
            self.fail(STATUS_MISALIGNED, n_bytes * 8);
            return Err(LiuxiError::Misaligned);
        }
        let end = self.pos.byte + n_bytes;
        if end > self.data.len() {
            self.fail(STATUS_EOS, n_bytes * 8);
            return Err(LiuxiError::Eof);
        }
        let slice = &self.data[self.pos.byte..end];
        self.pos.byte = end;
        Ok(slice)
    }

    /// 读取 1 个对齐字节
    pub fn read_u8(&mut self) -> LiuxiResult<u8> {
        Ok(self.read_aligned(1)?[0])
    }

    /// 窥视 1 个对齐字节 (不移动位置)
    pub fn peek_u8(&mut self) -> LiuxiResult<u8> {
        let saved = self.pos;
        let v = self.read_u8();
        self.pos = saved;
        v
    }

    /// 读取对齐的大端 u16
    pub fn read_u16(&mut self) -> LiuxiResult<u16> {
        Ok(read_be_u16(self.read_aligned(2)?))
    }

    /// 读取对齐的大端 u32
    pub fn read_u32(&mut self) -> LiuxiResult<u32> {
        Ok(read_be_u32(self.read_aligned(4)?))
    }

    /// 读取对齐的大端 u64
    pub fn read_u64(&mut self) -> LiuxiResult<u64> {
        Ok(read_be_u64(self.read_aligned(8)?))
    }

    /// 读取 1 个对齐字节 (有符号)
    pub fn read_s8(&mut self) -> LiuxiResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// 读取对齐的大端 i16
    pub fn read_s16(&mut self) -> LiuxiResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// 读取对齐的大端 i32
    pub fn read_s32(&mut self) -> LiuxiResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// 读取对齐的大端 i64
    pub fn read_s64(&mut self) -> LiuxiResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// 读取无符号 Exp-Golomb 编码值 ue(v)
    ///
    /// 先数出 k 个前导零, 再读 k 位尾数 m, 值为 `(1<<k) - 1 + m`.
    /// 途中触及流末尾时游标恢复到调用前的位置.
    pub fn read_exp_golomb_u(&mut self) -> LiuxiResult<u32> {
        let saved = self.pos;
        let mut leading_zeros = 0u32;
        loop {
            let bit = match self.read_bits(1) {
                Ok(b) => b,
                Err(e) => {
                    self.pos = saved;
                    return Err(e);
                }
            };
            if bit == 1 {
                break;
            }
            leading_zeros += 1;
            if leading_zeros > 31 {
                self.pos = saved;
                self.mark_corrupted();
                return Err(LiuxiError::InvalidData("Exp-Golomb 前导零过多".into()));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let suffix = match self.read_bits(leading_zeros) {
            Ok(v) => v,
            Err(e) => {
                self.pos = saved;
                return Err(e);
            }
        };
        Ok((1u32 << leading_zeros) - 1 + suffix)
    }

    /// 读取有符号 Exp-Golomb 编码值 se(v)
    ///
    /// 映射: 0→0, 1→1, 2→-1, 3→2, 4→-2, ...
    pub fn read_exp_golomb_s(&mut self) -> LiuxiResult<i32> {
        let code = self.read_exp_golomb_u()?;
        let value = code.div_ceil(2) as i32;
        if code & 1 == 0 { Ok(-value) } else { Ok(value) }
    }

    /// 窥视无符号 Exp-Golomb 编码值 (不移动位置)
    pub fn peek_exp_golomb_u(&mut self) -> LiuxiResult<u32> {
        let saved = self.pos;
        let v = self.read_exp_golomb_u();
        self.pos = saved;
        v
    }

    /// 窥视有符号 Exp-Golomb 编码值 (不移动位置)
    pub fn peek_exp_golomb_s(&mut self) -> LiuxiResult<i32> {
        let saved = self.pos;
        let v = self.read_exp_golomb_s();
        self.pos = saved;
        v
    }

    /// RBSP 中是否还有语法数据
    ///
    /// 仅当剩余位恰好是一个 1 加零填充到字节边界 (rbsp_stop_one_bit +
    /// rbsp_alignment_zero_bit) 时返回 false.
    pub fn more_rbsp_data(&mut self) -> bool {
        if self.pos.byte >= self.data.len() {
            return false;
        }
        if self.pos.byte < self.data.len() - 1 {
            return true;
        }

        let bits = 8 - self.pos.bit as u32;
        match self.peek_bits(bits) {
            Ok(v) => v != (1u32 << (bits - 1)),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for BitReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitReader")
            .field("size", &self.data.len())
            .field("pos", &self.pos)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_read_bits_basic() {
        let data = [0b10110001, 0b01010101];
        let mut br = BitReader::new(&data);

        assert_eq!(br.read_bits(1).unwrap(), 1);
        assert_eq!(br.read_bits(1).unwrap(), 0);
        assert_eq!(br.read_bits(2).unwrap(), 0b11);
        assert_eq!(br.read_bits(4).unwrap(), 0b0001);
        assert_eq!(br.read_bits(8).unwrap(), 0b01010101);
        assert_eq!(br.bits_left(), 0);
    }

    #[test]
    fn test_read_bits_32_bit() {
        let data = [0xFF, 0x00, 0xFF, 0x00];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_bits(32).unwrap(), 0xFF00FF00);
    }

    #[test]
    fn test_failed_read_keeps_position() {
        let data = [0xAB];
        let mut br = BitReader::new(&data);
        br.read_bits(3).unwrap();
        let before = br.position();
        assert!(br.read_bits(6).is_err());
        assert_eq!(br.position(), before, "失败读取不应移动游标");
        assert_eq!(br.status() & STATUS_EOS, STATUS_EOS);
        // 剩余 5 位依然可读
        assert_eq!(br.read_bits(5).unwrap(), 0xAB & 0x1F);
    }

    #[test]
    fn test_successful_read_advances_exactly() {
        let data = [0x12, 0x34, 0x56];
        let mut br = BitReader::new(&data);
        for n in [1u32, 3, 7, 2, 8] {
            let p = br.position().to_bits();
            br.read_bits(n).unwrap();
            assert_eq!(br.position().to_bits(), p + n as usize);
        }
    }

    #[test]
    fn test_misaligned_byte_read() {
        let data = [0x12, 0x34];
        let mut br = BitReader::new(&data);
        br.read_bits(3).unwrap();
        assert!(matches!(br.read_u8(), Err(LiuxiError::Misaligned)));
        assert_eq!(br.status() & STATUS_MISALIGNED, STATUS_MISALIGNED);
    }

    #[test]
    fn test_aligned_integer_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut br = BitReader::new(&data);
        assert_eq!(br.read_u16().unwrap(), 0x0102);
        assert_eq!(br.read_u32().unwrap(), 0x03040506);
        assert_eq!(br.read_s16().unwrap(), 0x0708);
        assert!(br.read_u8().is_err());
    }

    #[test]
    fn test_exp_golomb_u_scenarios() {
        // 1 → 0; 010 → 1; 011 → 2; 00100 → 3; 00111 → 6; 0001000 → 7
        let cases: [(&[u8], u32, u32); 6] = [
            (&[0b1000_0000], 1, 0),
            (&[0b0100_0000], 3, 1),
            (&[0b0110_0000], 3, 2),
            (&[0b0010_0000], 5, 3),
            (&[0b0011_1000], 5, 6),
            (&[0b0001_0000], 7, 7),
        ];
        for (data, bits, expected) in cases {
            let mut br = BitReader::new(data);
            assert_eq!(br.read_exp_golomb_u().unwrap(), expected);
            assert_eq!(br.position().to_bits(), bits as usize);
        }
    }

    #[test]
    fn test_exp_golomb_s_scenarios() {
        // 1 → 0; 010 → 1; 011 → -1; 00100 → 2; 00101 → -2; 00110 → 3
        let cases: [(&[u8], i32); 6] = [
            (&[0b1000_0000], 0),
            (&[0b0100_0000], 1),
            (&[0b0110_0000], -1),
            (&[0b0010_0000], 2),
            (&[0b0010_1000], -2),
            (&[0b0011_0000], 3),
        ];
        for (data, expected) in cases {
            let mut br = BitReader::new(data);
            assert_eq!(br.read_exp_golomb_s().unwrap(), expected);
        }
    }

    #[test]
    fn test_exp_golomb_roundtrip() {
        // 编码 v: k = floor(log2(v+1)), 写 k 个零, 再写 v+1 的低 k+1 位
        fn encode(v: u32) -> (u64, u32) {
            let k = 32 - (v + 1).leading_zeros() - 1;
            let bits = u64::from(v + 1);
            (bits, 2 * k + 1)
        }
        for v in [0u32, 1, 2, 3, 6, 7, 100, 255, 65535, 0x7FFF_FFFE] {
            let (bits, n) = encode(v);
            let packed = bits << (64 - n);
            let bytes = packed.to_be_bytes();
            let mut br = BitReader::new(&bytes);
            assert_eq!(br.read_exp_golomb_u().unwrap(), v, "v={} 往返失败", v);
        }
    }

    #[test]
    fn test_exp_golomb_eof_restores_position() {
        // 只有前导零, 没有终止位
        let data = [0x00];
        let mut br = BitReader::new(&data);
        br.read_bits(2).unwrap();
        let before = br.position();
        assert!(br.read_exp_golomb_u().is_err());
        assert_eq!(br.position(), before);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let data = [0b0110_0000];
        let mut br = BitReader::new(&data);
        assert_eq!(br.peek_exp_golomb_u().unwrap(), 2);
        assert_eq!(br.peek_exp_golomb_u().unwrap(), 2);
        assert_eq!(br.read_exp_golomb_u().unwrap(), 2);
        assert_eq!(br.position().to_bits(), 3);
    }

    #[test]
    fn test_more_rbsp_data() {
        // 0x80 = 停止位 + 零填充 → 无更多数据
        let data = [0x80];
        let mut br = BitReader::new(&data);
        assert!(!br.more_rbsp_data());

        // 0xC0 = 语法位 1 + 停止位 → 仍有数据
        let data = [0xC0];
        let mut br = BitReader::new(&data);
        assert!(br.more_rbsp_data());

        // 非最后一个字节 → 一定有数据
        let data = [0x80, 0x80];
        let mut br = BitReader::new(&data);
        assert!(br.more_rbsp_data());
    }

    #[test]
    fn test_error_fn_reports_positions() {
        let reported: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&reported);

        let data = [0xFF];
        let mut br = BitReader::new(&data);
        br.set_error_fn(Box::new(move |before, after| {
            sink.borrow_mut().push((before.to_bits(), after.to_bits()));
        }));

        br.read_bits(4).unwrap();
        assert!(br.read_bits(8).is_err());
        assert_eq!(reported.borrow().as_slice(), &[(4, 12)]);
    }

    #[test]
    fn test_status_is_sticky() {
        let data = [0x00];
        let mut br = BitReader::new(&data);
        assert!(br.read_u16().is_err());
        br.mark_corrupted();
        assert_eq!(br.status(), STATUS_EOS | STATUS_CORRUPTED);
        br.clear_status();
        assert!(br.is_ok());
    }
}
