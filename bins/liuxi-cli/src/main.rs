//! liuxi - H.264 码流结构解析命令行工具
//!
//! 从文件读取 Annex B 基本流或 MPEG-2 传输流, 解析出 SPS/PPS/SEI/
//! AUD/slice header 并对 I/SI slice 执行 CABAC 逐宏块语法解码.
//! 解析出的结构与状态转移写入日志.

mod logging;

use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::{Read, Write};
use std::process;

use liuxi_codec::h264::{Container, H264Decoder};
use liuxi_format::{PesExtractor, TsParser, TsParserStatus};
use liuxi_format::mpegts::{packet_payload_offset, packet_pid, packet_pusi};

/// 读文件的块大小
const READ_BUFFER_SIZE: usize = 4 * 1024;
/// TS 解析缓冲区
const TS_PARSER_BUFFER_SIZE: usize = 2 * READ_BUFFER_SIZE;

#[derive(Parser, Debug)]
#[command(name = "liuxi", version, about = "H.264 码流结构解析工具")]
struct Cli {
    /// 输入文件路径
    input: String,

    /// 输入流由 RTP (RFC 6184) 封装 (保留, 未实现)
    #[arg(short = 'r', long = "rtp")]
    rtp: bool,

    /// 输入为 ISO/IEC 13818-1 传输流, 参数为承载视频的 PID (十进制或 0x 十六进制)
    #[arg(short = 't', long = "ts", value_name = "pid")]
    ts_pid: Option<String>,

    /// 输入为 ISO/IEC 14496-10 Annex B 字节流 (使用 -t 时自动选中)
    #[arg(short = 'a', long = "annex-b")]
    annex_b: bool,

    /// 把选中的基本流另存一份到文件
    #[arg(short = 'o', long = "output", value_name = "file")]
    output: Option<String>,

    /// 日志级别 (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// 解析 PID 参数: 十进制或 0x/0X 前缀的十六进制
fn parse_pid(text: &str) -> Option<u16> {
    let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        text.parse::<u32>().ok()?
    };
    (value < 0x2000).then_some(value as u16)
}

/// 基本流出口: 喂给解码器, 可选落盘
struct EsSink {
    decoder: H264Decoder,
    tee: Option<File>,
}

impl EsSink {
    fn feed(&mut self, data: &[u8]) {
        if let Some(f) = self.tee.as_mut()
            && let Err(err) = f.write_all(data)
        {
            warn!("写出基本流失败: {err}");
            self.tee = None;
        }
        self.decoder.feed(data);
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init("liuxi", cli.verbose);

    if cli.rtp {
        eprintln!("错误: RTP 封装尚未实现");
        process::exit(1);
    }

    let ts_pid = match cli.ts_pid.as_deref() {
        Some(text) => match parse_pid(text) {
            Some(pid) => Some(pid),
            None => {
                eprintln!("错误: 无法把 '{text}' 解析为 PID");
                process::exit(1);
            }
        },
        None => None,
    };

    // -t 隐含 Annex B
    let container = if cli.annex_b || ts_pid.is_some() {
        Container::AnnexB
    } else {
        Container::None
    };

    info!(
        "封装: ts={} annex-b={}, 输入 {}",
        ts_pid.map(|p| format!("0x{p:04x}")).unwrap_or_else(|| "n".into()),
        matches!(container, Container::AnnexB),
        cli.input
    );

    let tee = match cli.output.as_deref() {
        Some(path) => match File::create(path) {
            Ok(f) => Some(f),
            Err(err) => {
                eprintln!("错误: 无法打开 '{path}': {err}");
                process::exit(1);
            }
        },
        None => None,
    };

    let mut file = match File::open(&cli.input) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("错误: 无法打开 '{}': {err}", cli.input);
            process::exit(1);
        }
    };

    let mut sink = EsSink {
        decoder: H264Decoder::new(container),
        tee,
    };
    let mut ts = ts_pid.map(|pid| (TsParser::new(TS_PARSER_BUFFER_SIZE), PesExtractor::new(), pid));

    let mut total = 0usize;
    let mut chunk = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                eprintln!("错误: 读取失败: {err}");
                process::exit(1);
            }
        };
        total += n;

        match ts.as_mut() {
            Some((parser, pes, pid)) => feed_transport_stream(parser, pes, *pid, &mut sink, &chunk[..n]),
            None => sink.feed(&chunk[..n]),
        }
    }

    info!("读取 {} 字节完毕", total);
    if let Some(stats) = sink.decoder.last_stats() {
        info!(
            "最后一个 slice: 解码 {} 个宏块, slice_qp={}",
            stats.decoded_mb_count, stats.slice_qp
        );
    }
}

/// 把文件字节推入 TS 解复用器并抽出选定 PID 的基本流
fn feed_transport_stream(
    parser: &mut TsParser,
    pes: &mut PesExtractor,
    pid: u16,
    sink: &mut EsSink,
    mut data: &[u8],
) {
    while !data.is_empty() {
        let written = parser.write(data);
        if written == 0 {
            warn!("TS: 缓冲区无法推进, 重置解复用器");
            parser.reset();
            pes.reset();
            continue;
        }

        loop {
            let status = parser.parse();
            match status {
                TsParserStatus::NeedBytes => break,
                TsParserStatus::SyncGained | TsParserStatus::Synchronized => {
                    if status == TsParserStatus::SyncGained {
                        info!("TS: {status}");
                    }
                    if let Some(packet) = parser.current_packet() {
                        if packet_pid(packet) == pid
                            && let Some(offset) = packet_payload_offset(packet)
                        {
                            let pusi = packet_pusi(packet);
                            let payload = packet[offset..].to_vec();
                            pes.push(&payload, pusi, &mut |bytes| sink.feed(bytes));
                        }
                        parser.consume_packet();
                    }
                }
                TsParserStatus::SyncLost => {
                    info!("TS: {status}");
                    pes.reset();
                }
                TsParserStatus::TransportRateDetected => {
                    info!("TS: 传输速率 {} 包/秒", parser.transport_rate());
                }
                TsParserStatus::NotSynchronized => {}
            }
        }

        data = &data[written..];
    }
}
