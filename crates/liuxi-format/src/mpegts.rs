//! MPEG-2 TS (Transport Stream) 解复用器.
//!
//! # TS 包结构 (188 字节, 可带 RS 校验尾)
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ 同步字节 (0x47)                     1 byte│
//! │ TEI(1) + PUSI(1) + Priority(1) +         │
//! │   PID(13)                         2 bytes│
//! │ TSC(2) + AFC(2) + CC(4)            1 byte│
//! │ [Adaptation Field]                   可变│
//! │ [Payload]                            可变│
//! └──────────────────────────────────────────┘
//! ```
//!
//! 同步获取: 在候选包长 {188, 204, 208} 上探测 0x47 按步长连续复现
//! 10 个包. 同步获取时当前包即可提取 (SYNC_GAINED 等同于带包的
//! SYNCHRONIZED); 同步字节丢失时发布 SYNC_LOST 并重新探测.
//!
//! 传输速率: 在同一 PID 的两个 PCR 之间按
//! `包数 * 27_000_000 / ΔPCR` 估计, PCR 回绕时重开窗口.

use liuxi_core::FlatBuffer;
use log::debug;

/// 基础 TS 包长
pub const TS_PACKET_SIZE: usize = 188;
/// TS 同步字节
pub const TS_SYNC_BYTE: u8 = 0x47;
/// 候选包长: 188 / 188+16 (DVB RS) / 188+20 (ATSC RS)
pub const TS_PACKET_SIZES: [usize; 3] = [188, 204, 208];
/// 同步探测需要的连续复现次数
const TS_FORWARD_SCAN: usize = 10;
/// 13 位 PID 空间之外的无效值
pub const PID_INVALID: u16 = 0x2000;

/// 单步解复用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsParserStatus {
    /// 输入不足
    NeedBytes,
    /// 未能在任何候选包长上同步, 丢弃了一段输入
    NotSynchronized,
    /// 刚获得同步, 当前包可提取
    SyncGained,
    /// 同步中, 当前包可提取
    Synchronized,
    /// 同步字节丢失, 状态机回到探测
    SyncLost,
    /// 本包的 PCR 使传输速率首次可用, 包尚未消费
    TransportRateDetected,
}

impl std::fmt::Display for TsParserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NeedBytes => "NEED_BYTES",
            Self::NotSynchronized => "NOT_SYNCHRONIZED",
            Self::SyncGained => "SYNC_GAINED",
            Self::Synchronized => "SYNCHRONIZED",
            Self::SyncLost => "SYNC_LOST",
            Self::TransportRateDetected => "TRANSPORT_RATE_DETECTED",
        };
        write!(f, "{s}")
    }
}

/// TS 包头辅助: PID
pub fn packet_pid(tsp: &[u8]) -> u16 {
    ((u16::from(tsp[1]) << 8) | u16::from(tsp[2])) & 0x1FFF
}

/// TS 包头辅助: payload_unit_start_indicator
pub fn packet_pusi(tsp: &[u8]) -> bool {
    tsp[1] & 0x40 != 0
}

/// 适配域存在且携带 PCR
pub fn packet_has_pcr(tsp: &[u8]) -> bool {
    tsp[3] & 0x20 != 0 && tsp[4] != 0 && tsp[5] & 0x10 != 0
}

/// 读取 PCR (27 MHz 刻度: base * 300 + extension)
pub fn packet_pcr(tsp: &[u8]) -> u64 {
    let pcr_base = ((((u64::from(tsp[6]) << 24)
        | (u64::from(tsp[7]) << 16)
        | (u64::from(tsp[8]) << 8)
        | u64::from(tsp[9]))
        << 8)
        | u64::from(tsp[10]))
        >> 7;
    let pcr_ext = ((u64::from(tsp[10]) << 8) | u64::from(tsp[11])) & 0x1FF;
    1 + pcr_base * 300 + pcr_ext
}

/// 按 adaptation_field_control 求载荷偏移, 无载荷时返回 None
pub fn packet_payload_offset(tsp: &[u8]) -> Option<usize> {
    let afc = (tsp[3] >> 4) & 0x03;
    match afc {
        1 => Some(4),
        3 => {
            let offset = 5 + tsp[4] as usize;
            (offset < tsp.len()).then_some(offset)
        }
        // 00 保留, 10 仅适配域
        _ => None,
    }
}

/// PCR 窗口上的传输速率估计
#[derive(Debug, Clone, Copy)]
struct TransportRate {
    pcr_pid: u16,
    pcr1: u64,
    pcr2: u64,
    packet_count: u64,
    rate: u64,
}

impl TransportRate {
    fn new() -> Self {
        Self {
            pcr_pid: PID_INVALID,
            pcr1: 0,
            pcr2: 0,
            packet_count: 0,
            rate: 0,
        }
    }

    fn is_valid(&self) -> bool {
        self.rate != 0
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// 观察一个包, 速率首次确定时返回 true
    fn calculate(&mut self, tsp: &[u8]) -> bool {
        if self.rate != 0 {
            return true;
        }

        let pid = packet_pid(tsp);
        if self.pcr_pid == PID_INVALID {
            if packet_has_pcr(tsp) {
                self.pcr1 = packet_pcr(tsp);
                self.pcr_pid = pid;
            }
            return false;
        }

        self.packet_count += 1;
        if pid == self.pcr_pid && packet_has_pcr(tsp) {
            self.pcr2 = packet_pcr(tsp);
            if self.pcr2 > self.pcr1 {
                self.rate = self.packet_count * 27_000_000 / (self.pcr2 - self.pcr1);
                return true;
            }
            // PCR 回绕: 重开窗口
            self.pcr1 = self.pcr2;
            self.packet_count = 0;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TsState {
    WaitingForSync,
    Synchronized,
}

/// TS 推式解复用器
pub struct TsParser {
    buf: FlatBuffer,
    state: TsState,
    packet_size: usize,
    rate: TransportRate,
}

impl TsParser {
    /// 创建解复用器, `capacity` 为内部缓冲区字节数
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: FlatBuffer::with_capacity(capacity),
            state: TsState::WaitingForSync,
            packet_size: 0,
            rate: TransportRate::new(),
        }
    }

    /// 喂入字节, 返回实际接收的字节数
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.len() > self.buf.write_available() {
            self.buf.compact();
        }
        self.buf.write(data)
    }

    /// 重置到未同步状态并清空缓冲
    pub fn reset(&mut self) {
        self.buf.reset();
        self.state = TsState::WaitingForSync;
        self.packet_size = 0;
        self.rate.reset();
    }

    /// 当前包长 (同步后有效)
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// 估计出的传输速率 (包/秒), 未确定时为 0
    pub fn transport_rate(&self) -> u64 {
        self.rate.rate
    }

    /// 推进一步
    pub fn parse(&mut self) -> TsParserStatus {
        match self.state {
            TsState::WaitingForSync => self.waiting_for_sync(),
            TsState::Synchronized => self.synchronized(),
        }
    }

    /// 同步后当前未消费的包
    pub fn current_packet(&self) -> Option<&[u8]> {
        if self.state != TsState::Synchronized || self.buf.read_available() < self.packet_size {
            return None;
        }
        Some(&self.buf.read_slice()[..self.packet_size])
    }

    /// 消费当前包
    pub fn consume_packet(&mut self) {
        if self.state == TsState::Synchronized && self.buf.read_available() >= self.packet_size {
            self.buf.consume(self.packet_size);
        }
    }

    /// 在一个候选包长上探测同步: 0x47 按步长复现 TS_FORWARD_SCAN 次
    fn synchronize(&self, packet_size: usize) -> Option<usize> {
        let win = self.buf.read_slice();
        for offset in 0..packet_size {
            if win[offset] != TS_SYNC_BYTE {
                continue;
            }
            let confirmed = (1..=TS_FORWARD_SCAN).all(|j| win[j * packet_size + offset] == TS_SYNC_BYTE);
            if confirmed {
                return Some(offset);
            }
        }
        None
    }

    fn waiting_for_sync(&mut self) -> TsParserStatus {
        for packet_size in TS_PACKET_SIZES {
            if self.buf.read_available() < packet_size * (TS_FORWARD_SCAN + 1) {
                return TsParserStatus::NeedBytes;
            }

            if let Some(offset) = self.synchronize(packet_size) {
                self.buf.consume(offset);
                self.state = TsState::Synchronized;
                self.packet_size = packet_size;
                debug!("TS: 同步获取, 包长 {}, 偏移 {}", packet_size, offset);
                return TsParserStatus::SyncGained;
            }
        }

        // 所有候选包长都失败, 丢弃一个基础包长继续探测
        self.buf.consume(TS_PACKET_SIZE.min(self.buf.read_available()));
        TsParserStatus::NotSynchronized
    }

    fn synchronized(&mut self) -> TsParserStatus {
        if self.buf.read_available() < self.packet_size {
            return TsParserStatus::NeedBytes;
        }

        let first = self.buf.read_slice()[0];
        if first != TS_SYNC_BYTE {
            debug!("TS: 同步丢失, 首字节 0x{:02x}", first);
            self.state = TsState::WaitingForSync;
            self.packet_size = 0;
            self.rate.reset();
            return TsParserStatus::SyncLost;
        }

        if !self.rate.is_valid() {
            let packet = &self.buf.read_slice()[..self.packet_size];
            if self.rate.calculate(packet) {
                debug!("TS: 传输速率 {} 包/秒", self.rate.rate);
                return TsParserStatus::TransportRateDetected;
            }
        }

        TsParserStatus::Synchronized
    }
}

/// 视频 PES 去包装状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PesState {
    Idle,
    Header,
    Data,
}

/// 视频 PES 去包装器
///
/// 载荷以 `00 00 01 E0..EF` 开头, 第三个可选头字节的高两位必须是
/// `10` (MPEG-2); 跳过 `PES_header_data_length` 限定的前缀后,
/// 其余字节即基本流. PES 头可跨 TS 包, 未凑齐的前缀暂存在内部.
pub struct PesExtractor {
    state: PesState,
    pending: Vec<u8>,
}

impl Default for PesExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PesExtractor {
    pub fn new() -> Self {
        Self {
            state: PesState::Idle,
            pending: Vec::new(),
        }
    }

    /// 回到空闲状态
    pub fn reset(&mut self) {
        self.state = PesState::Idle;
        self.pending.clear();
    }

    /// 喂入一个 TS 包的载荷, 基本流字节经 `emit` 输出
    pub fn push(&mut self, payload: &[u8], pusi: bool, emit: &mut dyn FnMut(&[u8])) {
        if pusi {
            self.state = PesState::Header;
            self.pending.clear();
        }

        match self.state {
            PesState::Idle => {}
            PesState::Data => emit(payload),
            PesState::Header => {
                self.pending.extend_from_slice(payload);

                if self.pending.len() < 7 {
                    return;
                }
                let p = &self.pending;
                // 1110 xxxx: 13818-2 / 14496-10 视频流号
                if p[0] != 0x00
                    || p[1] != 0x00
                    || p[2] != 0x01
                    || p[3] < 0xE0
                    || p[3] > 0xEF
                    || (p[6] & 0xC0) != 0x80
                {
                    debug!("TS: 非视频 PES 或非 MPEG-2 标记, 丢弃");
                    self.state = PesState::Idle;
                    self.pending.clear();
                    return;
                }

                if self.pending.len() < 9 {
                    return;
                }
                let header_len = 9 + self.pending[8] as usize;
                if self.pending.len() < header_len {
                    return;
                }

                emit(&self.pending[header_len..]);
                self.pending.clear();
                self.state = PesState::Data;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 构造一个最小 TS 包
    fn build_ts_packet(pid: u16, pusi: bool, payload: &[u8]) -> [u8; TS_PACKET_SIZE] {
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = if pusi { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F);
        pkt[2] = pid as u8;
        pkt[3] = 0x10; // AFC=01 (仅载荷)

        let n = payload.len().min(TS_PACKET_SIZE - 4);
        pkt[4..4 + n].copy_from_slice(&payload[..n]);
        pkt
    }

    /// 构造带 PCR 适配域的 TS 包
    fn build_ts_packet_with_pcr(pid: u16, pcr: u64) -> [u8; TS_PACKET_SIZE] {
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        pkt[0] = TS_SYNC_BYTE;
        pkt[1] = (pid >> 8) as u8 & 0x1F;
        pkt[2] = pid as u8;
        pkt[3] = 0x20; // AFC=10 (仅适配域)
        pkt[4] = 183; // adaptation_field_length
        pkt[5] = 0x10; // PCR_flag

        let base = (pcr - 1) / 300;
        let ext = (pcr - 1) % 300;
        pkt[6] = (base >> 25) as u8;
        pkt[7] = (base >> 17) as u8;
        pkt[8] = (base >> 9) as u8;
        pkt[9] = (base >> 1) as u8;
        pkt[10] = (((base & 1) as u8) << 7) | 0x7E | ((ext >> 8) as u8 & 1);
        pkt[11] = ext as u8;
        pkt
    }

    fn collect_statuses(parser: &mut TsParser, data: &[u8]) -> Vec<TsParserStatus> {
        assert_eq!(parser.write(data), data.len());
        let mut statuses = Vec::new();
        loop {
            let status = parser.parse();
            match status {
                TsParserStatus::NeedBytes => break,
                TsParserStatus::SyncGained | TsParserStatus::Synchronized => {
                    parser.consume_packet();
                }
                _ => {}
            }
            statuses.push(status);
        }
        statuses
    }

    #[test]
    fn test_sync_gained_then_synchronized() {
        // 11 个 188 字节包: SYNC_GAINED 一次, SYNCHRONIZED 十次
        let mut stream = Vec::new();
        for _ in 0..11 {
            stream.extend_from_slice(&build_ts_packet(0x101, false, &[]));
        }

        let mut parser = TsParser::new(8192);
        let statuses = collect_statuses(&mut parser, &stream);

        let gained = statuses.iter().filter(|&&s| s == TsParserStatus::SyncGained).count();
        let synced = statuses.iter().filter(|&&s| s == TsParserStatus::Synchronized).count();
        assert_eq!(gained, 1);
        assert_eq!(synced, 10);
        assert_eq!(parser.packet_size(), 188);
    }

    #[test]
    fn test_sync_lost_on_corrupt_sync_byte() {
        // 先用 11 个完好的包获得同步
        let mut stream = Vec::new();
        for _ in 0..11 {
            stream.extend_from_slice(&build_ts_packet(0x101, false, &[]));
        }
        let mut parser = TsParser::new(8192);
        let statuses = collect_statuses(&mut parser, &stream);
        assert!(statuses.contains(&TsParserStatus::SyncGained));

        // 继续喂包, 其中第 5 个包的同步字节被破坏
        let mut tail = Vec::new();
        for i in 0..8 {
            let mut pkt = build_ts_packet(0x101, false, &[]);
            if i == 4 {
                pkt[0] = 0x48;
            }
            tail.extend_from_slice(&pkt);
        }
        let statuses = collect_statuses(&mut parser, &tail);

        let lost_at = statuses.iter().position(|&s| s == TsParserStatus::SyncLost);
        assert!(lost_at.is_some(), "损坏的同步字节应触发 SYNC_LOST");
        let before_lost = &statuses[..lost_at.unwrap()];
        assert_eq!(
            before_lost
                .iter()
                .filter(|&&s| s == TsParserStatus::Synchronized)
                .count(),
            4,
            "同步丢失前应提取 4 个包"
        );
    }

    #[test]
    fn test_garbage_prefix_is_skipped() {
        let mut stream = vec![0xABu8; 50];
        for _ in 0..11 {
            stream.extend_from_slice(&build_ts_packet(0x42, false, &[]));
        }

        let mut parser = TsParser::new(8192);
        let statuses = collect_statuses(&mut parser, &stream);
        assert!(statuses.contains(&TsParserStatus::SyncGained));
    }

    #[test]
    fn test_204_byte_packets() {
        // 188+16 RS 尾的 DVB 包
        let mut stream = Vec::new();
        for _ in 0..12 {
            let mut pkt = vec![0u8; 204];
            pkt[..188].copy_from_slice(&build_ts_packet(0x44, false, &[]));
            stream.extend_from_slice(&pkt);
        }

        // 纯 188 探测会被 RS 尾打断, 204 探测成功
        let mut parser = TsParser::new(8192);
        let statuses = collect_statuses(&mut parser, &stream);
        assert!(statuses.contains(&TsParserStatus::SyncGained));
        assert_eq!(parser.packet_size(), 204);
    }

    #[test]
    fn test_transport_rate_from_pcr() {
        let pid = 0x100;
        let mut stream = Vec::new();
        // 探测窗口用的普通包
        for _ in 0..11 {
            stream.extend_from_slice(&build_ts_packet(pid, false, &[]));
        }
        // 第一个 PCR
        stream.extend_from_slice(&build_ts_packet_with_pcr(pid, 1 + 300));
        // 9 个中间包
        for _ in 0..9 {
            stream.extend_from_slice(&build_ts_packet(pid, false, &[]));
        }
        // 第二个 PCR: 10 个包跨过 27000 个 27MHz 刻度
        stream.extend_from_slice(&build_ts_packet_with_pcr(pid, 1 + 300 + 27_000));

        let mut parser = TsParser::new(16384);
        assert_eq!(parser.write(&stream), stream.len());

        let mut detected = false;
        loop {
            match parser.parse() {
                TsParserStatus::NeedBytes => break,
                TsParserStatus::SyncGained | TsParserStatus::Synchronized => {
                    parser.consume_packet();
                }
                TsParserStatus::TransportRateDetected => detected = true,
                _ => {}
            }
        }

        assert!(detected, "应当检测到传输速率");
        // 10 包 / 27000 刻度 = 10 * 27e6 / 27000 = 10000 包/秒
        assert_eq!(parser.transport_rate(), 10_000);
    }

    #[test]
    fn test_pcr_roundtrip() {
        let pkt = build_ts_packet_with_pcr(0x100, 123_456_789);
        assert!(packet_has_pcr(&pkt));
        assert_eq!(packet_pcr(&pkt), 123_456_789);
    }

    #[test]
    fn test_pid_and_pusi_extraction() {
        let pkt = build_ts_packet(0x1ABC & 0x1FFF, true, &[]);
        assert_eq!(packet_pid(&pkt), 0x1ABC & 0x1FFF);
        assert!(packet_pusi(&pkt));

        let pkt = build_ts_packet(0x0042, false, &[]);
        assert_eq!(packet_pid(&pkt), 0x42);
        assert!(!packet_pusi(&pkt));
    }

    #[test]
    fn test_payload_offset() {
        let pkt = build_ts_packet(0x42, false, &[1, 2, 3]);
        assert_eq!(packet_payload_offset(&pkt), Some(4));

        let pkt = build_ts_packet_with_pcr(0x42, 1234);
        assert_eq!(packet_payload_offset(&pkt), None, "仅适配域的包没有载荷");
    }

    #[test]
    fn test_pes_extraction() {
        // PES: 起始码 + E0 + 长度 + 标志 + header_data_length=5 + 5 字节填充 + ES
        let es = [0x00, 0x00, 0x01, 0x67, 0xAA, 0xBB];
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
        pes.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]); // PTS 字段占位
        pes.extend_from_slice(&es);

        let mut extractor = PesExtractor::new();
        let mut out = Vec::new();
        extractor.push(&pes, true, &mut |bytes| out.extend_from_slice(bytes));
        assert_eq!(out, es);

        // 后续非起始包直接透传
        extractor.push(&[0xCC, 0xDD], false, &mut |bytes| {
            out.extend_from_slice(bytes)
        });
        assert_eq!(&out[es.len()..], &[0xCC, 0xDD]);
    }

    #[test]
    fn test_pes_header_across_packets() {
        let es = [0x11, 0x22, 0x33];
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
        pes.extend_from_slice(&es);

        let mut extractor = PesExtractor::new();
        let mut out = Vec::new();
        // 头部拆成 4 + 其余两段
        extractor.push(&pes[..4], true, &mut |b| out.extend_from_slice(b));
        assert!(out.is_empty());
        extractor.push(&pes[4..8], false, &mut |b| out.extend_from_slice(b));
        assert!(out.is_empty());
        extractor.push(&pes[8..], false, &mut |b| out.extend_from_slice(b));
        assert_eq!(out, es);
    }

    #[test]
    fn test_pes_rejects_non_video_stream_id() {
        // 0xC0 为音频流号
        let pes = [0x00, 0x00, 0x01, 0xC0, 0x00, 0x00, 0x80, 0x00, 0x00, 0xAA];
        let mut extractor = PesExtractor::new();
        let mut out = Vec::new();
        extractor.push(&pes, true, &mut |b| out.extend_from_slice(b));
        extractor.push(&[0xBB], false, &mut |b| out.extend_from_slice(b));
        assert!(out.is_empty(), "非视频流必须被整体丢弃");
    }
}
