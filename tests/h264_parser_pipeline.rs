//! H.264 解析管线测试: Annex B 字节流 → NAL → 语法结构.

use liuxi::codec::h264::{Container, H264Parser, H264ParserStatus};

/// 用 3 字节起始码拼接 NAL 单元
fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&[0x00, 0x00, 0x01]);
        out.extend_from_slice(nal);
    }
    out
}

/// QCIF Baseline SPS (id=0, 11x9 宏块)
const SPS_NAL: &[u8] = &[0x67, 0x42, 0xC0, 0x0D, 0xF4, 0x16, 0x27, 0x20];
/// PPS (id=0, sps=0, CABAC)
const PPS_NAL: &[u8] = &[0x68, 0xEE, 0x38, 0x80];
/// AUD (primary_pic_type=0)
const AUD_NAL: &[u8] = &[0x09, 0x10];
/// SEI (recovery_point, 4 字节载荷)
const SEI_NAL: &[u8] = &[0x06, 0x06, 0x04, 0x11, 0x22, 0x33, 0x44, 0x80];
/// IDR slice: header (I, first_mb=0, qp_delta=0) + CABAC 数据
const IDR_NAL: &[u8] = &[
    0x65, 0x88, 0x84, 0x1F, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0,
];

fn drain(parser: &mut H264Parser) -> Vec<H264ParserStatus> {
    let mut statuses = Vec::new();
    loop {
        let status = parser.parse();
        if status == H264ParserStatus::NeedBytes {
            break;
        }
        statuses.push(status);
    }
    statuses
}

#[test]
fn test_full_access_unit_sequence() {
    let mut stream = annex_b(&[AUD_NAL, SPS_NAL, PPS_NAL, SEI_NAL, IDR_NAL]);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);

    let mut parser = H264Parser::new(1 << 16, Container::AnnexB);
    assert_eq!(parser.write(&stream), stream.len());
    let statuses = drain(&mut parser);

    assert_eq!(
        statuses,
        vec![
            H264ParserStatus::AudParsed,
            H264ParserStatus::SpsParsed,
            H264ParserStatus::PpsParsed,
            H264ParserStatus::SeiParsed,
            H264ParserStatus::SliceParsed,
        ]
    );

    // 结构可取出
    assert_eq!(parser.aud().unwrap().primary_pic_type, 0);
    let sps = parser.sps(0).unwrap();
    assert_eq!(sps.pic_width_in_mbs_minus1, 10);
    let pps = parser.pps(0).unwrap();
    assert!(pps.entropy_coding_mode_flag);
    assert_eq!(parser.sei().unwrap().payload_type, 6);

    let sh = parser.slice_header().unwrap();
    assert_eq!(sh.first_mb_in_slice, 0);
    assert_eq!(sh.frame_num, 0);

    // CABAC slice 数据在字节边界开始
    let sd = parser.slice_data().unwrap();
    assert_eq!(sd.bit_offset, 0);
    assert_eq!(sd.byte_offset, 4);
    assert_eq!(sd.bytes()[0], 0x12);
}

#[test]
fn test_start_code_variants_split_nal_types() {
    // 3 字节与 4 字节起始码混用
    let mut stream = vec![0x00, 0x00, 0x00, 0x01];
    stream.extend_from_slice(SPS_NAL);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);
    stream.extend_from_slice(PPS_NAL);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);

    let mut parser = H264Parser::new(1 << 16, Container::AnnexB);
    parser.write(&stream);
    let statuses = drain(&mut parser);
    assert_eq!(
        statuses,
        vec![H264ParserStatus::SpsParsed, H264ParserStatus::PpsParsed]
    );
}

#[test]
fn test_emulation_prevention_inside_sps() {
    // SPS 尾部人为插入 00 00 03 00: RBSP 中还原为 00 00 00
    let nal_with_epb: &[u8] = &[0x67, 0x42, 0x00, 0x1F, 0x00, 0x00, 0x03, 0x00, 0x28];
    let mut stream = annex_b(&[nal_with_epb]);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);

    let mut parser = H264Parser::new(1 << 16, Container::AnnexB);
    parser.write(&stream);
    // 防竞争字节本身不判损; 该 payload 的语义有效性由 SPS 解析决定
    let statuses = drain(&mut parser);
    assert_eq!(statuses.len(), 1);
    assert_ne!(statuses[0], H264ParserStatus::NeedBytes);
}

#[test]
fn test_forbidden_sequence_marks_nal_corrupted() {
    // NAL 内出现 00 00 02
    let bad_nal: &[u8] = &[0x67, 0x00, 0x00, 0x02];
    let mut stream = annex_b(&[bad_nal]);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);

    let mut parser = H264Parser::new(1 << 16, Container::AnnexB);
    parser.write(&stream);
    let statuses = drain(&mut parser);
    assert_eq!(statuses, vec![H264ParserStatus::NalUnitCorrupted]);
}

#[test]
fn test_corrupted_sps_keeps_previous_entry() {
    let mut stream = annex_b(&[SPS_NAL]);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);
    let mut parser = H264Parser::new(1 << 16, Container::AnnexB);
    parser.write(&stream);
    assert_eq!(drain(&mut parser), vec![H264ParserStatus::SpsParsed]);
    let width_before = parser.sps(0).unwrap().pic_width_in_mbs_minus1;

    // 同 id 的 SPS 被截断: 表项保持原值
    let mut bad = annex_b(&[&[0x67, 0x42, 0xC0]]);
    bad.extend_from_slice(&[0x00, 0x00, 0x01]);
    parser.write(&bad);
    assert_eq!(drain(&mut parser), vec![H264ParserStatus::NalUnitCorrupted]);
    assert_eq!(
        parser.sps(0).unwrap().pic_width_in_mbs_minus1,
        width_before,
        "损坏的 NAL 不得改动参数集表"
    );
}

#[test]
fn test_slice_before_parameter_sets_is_corrupted() {
    // 没有 PPS 时 slice header 解析失败, 流在下一个起始码继续
    let mut stream = annex_b(&[IDR_NAL, SPS_NAL]);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);

    let mut parser = H264Parser::new(1 << 16, Container::AnnexB);
    parser.write(&stream);
    let statuses = drain(&mut parser);
    assert_eq!(
        statuses,
        vec![
            H264ParserStatus::NalUnitCorrupted,
            H264ParserStatus::SpsParsed,
        ]
    );
}

#[test]
fn test_byte_by_byte_feeding_is_restartable() {
    let mut stream = annex_b(&[SPS_NAL, PPS_NAL, IDR_NAL]);
    stream.extend_from_slice(&[0x00, 0x00, 0x01]);

    let mut parser = H264Parser::new(1 << 16, Container::AnnexB);
    let mut statuses = Vec::new();
    for &b in &stream {
        parser.write(&[b]);
        statuses.extend(drain(&mut parser));
    }

    assert_eq!(
        statuses,
        vec![
            H264ParserStatus::SpsParsed,
            H264ParserStatus::PpsParsed,
            H264ParserStatus::SliceParsed,
        ]
    );
}
