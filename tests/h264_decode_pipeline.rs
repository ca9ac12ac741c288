//! H.264 解码前端管线测试: 参数集激活、表推导与 CABAC 宏块解码.

use liuxi::codec::h264::{Container, H264Decoder};

fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&[0x00, 0x00, 0x01]);
        out.extend_from_slice(nal);
    }
    out
}

const SPS_NAL: &[u8] = &[0x67, 0x42, 0xC0, 0x0D, 0xF4, 0x16, 0x27, 0x20];
const PPS_NAL: &[u8] = &[0x68, 0xEE, 0x38, 0x80];
const IDR_NAL: &[u8] = &[
    0x65, 0x88, 0x84, 0x1F, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0,
];

fn feed_stream(decoder: &mut H264Decoder, nals: &[&[u8]]) {
    let mut stream = annex_b(nals);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);
    decoder.feed(&stream);
}

#[test]
fn test_activation_builds_dimensions() {
    let mut decoder = H264Decoder::new(Container::AnnexB);
    feed_stream(&mut decoder, &[SPS_NAL, PPS_NAL, IDR_NAL]);

    let dims = decoder.dimensions();
    assert_eq!(dims.mb_width, 11);
    assert_eq!(dims.mb_height, 9);
    assert_eq!(dims.mb_num, dims.mb_width * dims.mb_height);
    assert_eq!(dims.width, 16 * dims.mb_width);
    assert_eq!(dims.height, 16 * dims.mb_height);

    assert_eq!(
        decoder.active_sps().map(|s| s.seq_parameter_set_id),
        Some(0)
    );
    assert_eq!(
        decoder.active_pps().map(|p| p.pic_parameter_set_id),
        Some(0)
    );
}

#[test]
fn test_chroma_qp_table_after_activation() {
    let mut decoder = H264Decoder::new(Container::AnnexB);
    feed_stream(&mut decoder, &[SPS_NAL, PPS_NAL, IDR_NAL]);

    // 该 PPS 的两个偏移都为 0: 表应与标准 Table 8-15 一致
    let table = decoder.chroma_qp_table();
    for q in 0..=29 {
        assert_eq!(table[0][q], q as u8);
        assert_eq!(table[1][q], q as u8);
    }
    assert_eq!(table[0][51], 39);
    assert_eq!(table[0][43], 37);
}

#[test]
fn test_dequant_tables_after_activation() {
    let mut decoder = H264Decoder::new(Container::AnnexB);
    feed_stream(&mut decoder, &[SPS_NAL, PPS_NAL, IDR_NAL]);

    // Baseline SPS 不携带缩放矩阵: 6 组平坦列表共享一张表
    for i in 1..6 {
        assert!(decoder.dequant4x4_shared(0, i));
    }
    // qp 每 +6, 表值左移一位
    let base = decoder.dequant4x4(0, 20)[7];
    assert_eq!(decoder.dequant4x4(0, 26)[7], base << 1);
}

#[test]
fn test_cabac_slice_decodes_macroblocks() {
    let mut decoder = H264Decoder::new(Container::AnnexB);
    feed_stream(&mut decoder, &[SPS_NAL, PPS_NAL, IDR_NAL]);

    let stats = decoder.last_stats().expect("I slice 应触发 CABAC 解码");
    assert!(stats.decoded_mb_count >= 1, "至少解码出第一个宏块");
    assert_eq!(stats.slice_qp, 26);
}

#[test]
fn test_decode_without_parameter_sets_is_harmless() {
    let mut decoder = H264Decoder::new(Container::AnnexB);
    feed_stream(&mut decoder, &[IDR_NAL]);
    assert!(decoder.last_stats().is_none());
    assert!(decoder.active_sps().is_none());
}

#[test]
fn test_two_slices_reuse_activation() {
    let mut decoder = H264Decoder::new(Container::AnnexB);
    feed_stream(&mut decoder, &[SPS_NAL, PPS_NAL, IDR_NAL, IDR_NAL]);

    assert!(decoder.last_stats().is_some());
    let dims = *decoder.dimensions();
    assert_eq!(dims.mb_num, 99);
}
