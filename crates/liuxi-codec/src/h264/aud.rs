//! H.264 AUD (Access Unit Delimiter) 解析器.

use liuxi_core::{BitReader, LiuxiError, LiuxiResult};

/// 访问单元分隔符
#[derive(Debug, Clone, Copy, Default)]
pub struct Aud {
    /// 后续图像允许出现的 slice 类型集合编号 (0..=7)
    pub primary_pic_type: u32,
}

impl Aud {
    /// primary_pic_type 对应的 slice 类型集合
    pub fn slice_type_set(&self) -> &'static str {
        match self.primary_pic_type {
            0 => "(I)",
            1 => "(I, P)",
            2 => "(I, P, B)",
            3 => "(SI)",
            4 => "(SI, SP)",
            5 => "(I, SI)",
            6 => "(I, SI, P, SP)",
            7 => "(I, SI, P, SP, B)",
            _ => "(invalid)",
        }
    }
}

/// 从 RBSP 解析 AUD
pub fn parse_aud(br: &mut BitReader<'_>) -> LiuxiResult<Aud> {
    let primary_pic_type = br.read_bits(3)?;
    if primary_pic_type > 7 {
        return Err(LiuxiError::InvalidData(format!(
            "H264: primary_pic_type 非法, value={}",
            primary_pic_type
        )));
    }
    Ok(Aud { primary_pic_type })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aud() {
        // primary_pic_type=2 + rbsp 停止位
        let data = [0b010_10000];
        let mut br = BitReader::new(&data);
        let aud = parse_aud(&mut br).unwrap();
        assert_eq!(aud.primary_pic_type, 2);
        assert_eq!(aud.slice_type_set(), "(I, P, B)");
    }

    #[test]
    fn test_empty_aud_is_error() {
        let mut br = BitReader::new(&[]);
        assert!(parse_aud(&mut br).is_err());
    }
}
