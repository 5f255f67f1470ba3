//! Decode and print bus frames from a captured serial dump.
//!
//! Feed it a raw binary file recorded off the RS-485 line (e.g. with
//! `cat /dev/ttyUSB0 > capture.bin` while the panel polls) and it walks
//! the byte stream with the same resyncing decoder the gateway runs,
//! printing one line per frame.

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::codec::Decoder;

use heatbus_gateway::protocol::{Frame, FrameCodec, SRC_ADDRESS, command};

#[derive(Parser)]
#[command(name = "decode-capture", about = "Decode bus frames from a serial capture file")]
struct Args {
    /// Raw capture file.
    input: PathBuf,

    /// Show full payload hex instead of a truncated preview.
    #[arg(short, long)]
    verbose: bool,

    /// Stop after this many frames (0 = all).
    #[arg(short = 'n', long, default_value_t = 0)]
    limit: usize,

    /// Only show frames with this command code (e.g. 0x40).
    #[arg(short, long, value_parser = parse_command)]
    command: Option<u8>,
}

fn parse_command(raw: &str) -> Result<u8, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| format!("not a command byte: {raw}"))
}

fn command_name(cmd: u8) -> String {
    match cmd {
        command::GET_SETTINGS => "GET_SETTINGS".into(),
        command::GET_SETTINGS_RESPONSE => "GET_SETTINGS_RESPONSE".into(),
        command::GET_PARAMS_STRUCT => "GET_PARAMS_STRUCT".into(),
        command::GET_PARAMS_STRUCT_RESPONSE => "GET_PARAMS_STRUCT_RESPONSE".into(),
        command::GET_PARAMS_STRUCT_WITH_RANGE => "GET_PARAMS_STRUCT_WITH_RANGE".into(),
        command::GET_PARAMS_STRUCT_WITH_RANGE_RESPONSE => {
            "GET_PARAMS_STRUCT_WITH_RANGE_RESPONSE".into()
        }
        command::GET_PARAMS => "GET_PARAMS".into(),
        command::GET_PARAMS_RESPONSE => "GET_PARAMS_RESPONSE".into(),
        command::MODIFY_PARAM => "MODIFY_PARAM".into(),
        command::MODIFY_PARAM_RESPONSE => "MODIFY_PARAM_RESPONSE".into(),
        command::IDENTIFY => "IDENTIFY".into(),
        command::IDENTIFY_RESPONSE => "IDENTIFY_RESPONSE".into(),
        command::SERVICE => "SERVICE".into(),
        command::SERVICE_RESPONSE => "SERVICE_RESPONSE".into(),
        command::NO_DATA => "NO_DATA".into(),
        command::ERROR => "ERROR".into(),
        other => format!("UNKNOWN(0x{other:02X})"),
    }
}

fn hex(data: &[u8], max_len: usize) -> String {
    let shown: Vec<String> = data.iter().take(max_len).map(|b| format!("{b:02x}")).collect();
    let mut out = shown.join(" ");
    if data.len() > max_len {
        out.push_str(&format!(" ... (+{} bytes)", data.len() - max_len));
    }
    out
}

fn describe_payload(frame: &Frame, verbose: bool) -> Option<String> {
    if frame.payload.is_empty() {
        return None;
    }
    if frame.command == command::GET_PARAMS && frame.payload.len() >= 3 {
        let count = frame.payload[0];
        let start = u16::from_le_bytes([frame.payload[1], frame.payload[2]]);
        return Some(format!("start_index={start}, count={count}"));
    }
    let max_len = if verbose { frame.payload.len() } else { 32 };
    Some(format!(
        "data[{}]: {}",
        frame.payload.len(),
        hex(&frame.payload, max_len)
    ))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let raw = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(raw.as_slice());
    let mut shown = 0usize;
    let mut total = 0usize;

    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        total += 1;
        if let Some(filter) = args.command {
            if frame.command != filter {
                continue;
            }
        }
        if args.limit != 0 && shown >= args.limit {
            break;
        }
        shown += 1;

        // Frames we originated carry our source address.
        let direction = if frame.source == SRC_ADDRESS { ">>>" } else { "<<<" };
        println!(
            "[{shown:4}] {direction} {} dest={} src={}",
            command_name(frame.command),
            frame.destination,
            frame.source
        );
        if let Some(detail) = describe_payload(&frame, args.verbose) {
            println!("       {detail}");
        }
    }

    println!(
        "{total} frames decoded, {} invalid candidates skipped",
        codec.invalid_count()
    );
    Ok(())
}
