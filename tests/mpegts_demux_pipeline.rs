//! MPEG-TS 解复用管线测试: TS 包 → PES → H.264 基本流 → 结构解析.

use liuxi::codec::h264::{Container, H264Decoder};
use liuxi::format::mpegts::{packet_payload_offset, packet_pid, packet_pusi};
use liuxi::format::{PesExtractor, TsParser, TsParserStatus};

const TS_PACKET_SIZE: usize = 188;
const VIDEO_PID: u16 = 0x100;
const NULL_PID: u16 = 0x1FFF;

fn build_ts_packet(pid: u16, pusi: bool, payload: &[u8]) -> [u8; TS_PACKET_SIZE] {
    assert!(payload.len() <= TS_PACKET_SIZE - 4);
    let mut pkt = [0xFFu8; TS_PACKET_SIZE];
    pkt[0] = 0x47;
    pkt[1] = if pusi { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F);
    pkt[2] = pid as u8;
    pkt[3] = 0x10;
    pkt[4..4 + payload.len()].copy_from_slice(payload);
    pkt
}

/// 用适配域填充把载荷压到精确长度的 TS 包
fn build_ts_packet_stuffed(pid: u16, pusi: bool, payload: &[u8]) -> [u8; TS_PACKET_SIZE] {
    assert!(payload.len() <= TS_PACKET_SIZE - 6);
    let mut pkt = [0xFFu8; TS_PACKET_SIZE];
    pkt[0] = 0x47;
    pkt[1] = if pusi { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F);
    pkt[2] = pid as u8;
    pkt[3] = 0x30; // 适配域 + 载荷

    let af_len = TS_PACKET_SIZE - 5 - payload.len();
    pkt[4] = af_len as u8;
    if af_len > 0 {
        pkt[5] = 0x00; // 适配域标志
    }
    let start = 5 + af_len;
    pkt[start..start + payload.len()].copy_from_slice(payload);
    pkt
}

/// 最小 MPEG-2 PES 头 (无 PTS) + 基本流
fn build_video_pes(es: &[u8]) -> Vec<u8> {
    let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
    pes.extend_from_slice(es);
    pes
}

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

/// 把 TS 字节流跑完, 选定 PID 的基本流喂给解码器
fn demux_into_decoder(stream: &[u8], pid: u16, decoder: &mut H264Decoder) -> Vec<TsParserStatus> {
    let mut parser = TsParser::new(64 * 1024);
    let mut pes = PesExtractor::new();
    let mut statuses = Vec::new();

    assert_eq!(parser.write(stream), stream.len());
    loop {
        let status = parser.parse();
        statuses.push(status);
        match status {
            TsParserStatus::NeedBytes => break,
            TsParserStatus::SyncGained | TsParserStatus::Synchronized => {
                if let Some(packet) = parser.current_packet() {
                    if packet_pid(packet) == pid
                        && let Some(offset) = packet_payload_offset(packet)
                    {
                        let pusi = packet_pusi(packet);
                        let payload = packet[offset..].to_vec();
                        pes.push(&payload, pusi, &mut |bytes| decoder.feed(bytes));
                    }
                    parser.consume_packet();
                }
            }
            TsParserStatus::SyncLost => pes.reset(),
            _ => {}
        }
    }
    statuses
}

#[test]
fn test_ts_to_parameter_sets() {
    // 基本流: SPS + PPS + 收尾起始码, 封入一个 PES
    let mut es = annex_b(&[SPS_NAL, PPS_NAL]);
    es.extend_from_slice(&[0x00, 0x00, 0x01]);
    let pes = build_video_pes(&es);

    let mut stream = Vec::new();
    stream.extend_from_slice(&build_ts_packet_stuffed(VIDEO_PID, true, &pes));
    // 补足同步探测窗口
    for _ in 0..11 {
        stream.extend_from_slice(&build_ts_packet(NULL_PID, false, &[]));
    }

    let mut decoder = H264Decoder::new(Container::AnnexB);
    let statuses = demux_into_decoder(&stream, VIDEO_PID, &mut decoder);

    assert!(statuses.contains(&TsParserStatus::SyncGained));
    let sps = decoder.parser().sps(0).expect("应从 TS 中恢复出 SPS");
    assert_eq!(sps.pic_width_in_mbs_minus1, 10);
    assert!(decoder.parser().pps(0).is_some(), "应从 TS 中恢复出 PPS");
}

#[test]
fn test_es_split_across_ts_packets() {
    // 把 PES 拆成 8 字节的小片, 逐包传输
    let mut es = annex_b(&[SPS_NAL, PPS_NAL]);
    es.extend_from_slice(&[0x00, 0x00, 0x01]);
    let pes = build_video_pes(&es);

    let mut stream = Vec::new();
    for (i, chunk) in pes.chunks(8).enumerate() {
        stream.extend_from_slice(&build_ts_packet_stuffed(VIDEO_PID, i == 0, chunk));
    }
    for _ in 0..11 {
        stream.extend_from_slice(&build_ts_packet(NULL_PID, false, &[]));
    }

    let mut decoder = H264Decoder::new(Container::AnnexB);
    demux_into_decoder(&stream, VIDEO_PID, &mut decoder);

    assert!(decoder.parser().sps(0).is_some());
    assert!(decoder.parser().pps(0).is_some());
}

#[test]
fn test_other_pids_are_filtered() {
    let mut es = annex_b(&[SPS_NAL]);
    es.extend_from_slice(&[0x00, 0x00, 0x01]);
    let pes = build_video_pes(&es);

    // 基本流在 0x200 上, 但我们选择 0x100
    let mut stream = Vec::new();
    stream.extend_from_slice(&build_ts_packet_stuffed(0x200, true, &pes));
    for _ in 0..11 {
        stream.extend_from_slice(&build_ts_packet(NULL_PID, false, &[]));
    }

    let mut decoder = H264Decoder::new(Container::AnnexB);
    demux_into_decoder(&stream, VIDEO_PID, &mut decoder);
    assert!(decoder.parser().sps(0).is_none(), "未选中的 PID 不应进入解码器");
}
