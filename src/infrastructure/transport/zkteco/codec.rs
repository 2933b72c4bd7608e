//! ZKTeco TCP 协议编解码
//!
//! 帧结构：4 字节魔数 `50 50 82 7d` + 4 字节负载长度（LE），负载为
//! `命令 u16 | 校验和 u16 | 会话 u16 | 应答序号 u16 | 数据`，全部小端。
//! 校验和是对负载（校验字段置零）按 16 位累加进位后取反。
//! 时间戳为厂商打包格式：自 2000 年起的 年/月/日/时/分/秒 混合进制编码。

use bytes::{BufMut, BytesMut};
use chrono::{NaiveDate, NaiveDateTime, Timelike};

use crate::error::{Result, SyncError};

pub const HEADER_MAGIC: [u8; 4] = [0x50, 0x50, 0x82, 0x7d];

// 命令字
pub const CMD_CONNECT: u16 = 1000;
pub const CMD_EXIT: u16 = 1001;
pub const CMD_ENABLEDEVICE: u16 = 1002;
pub const CMD_DISABLEDEVICE: u16 = 1003;
pub const CMD_AUTH: u16 = 1102;
pub const CMD_PREPARE_DATA: u16 = 1500;
pub const CMD_DATA: u16 = 1501;
pub const CMD_FREE_DATA: u16 = 1502;
pub const CMD_DATA_WRRQ: u16 = 1503;
pub const CMD_ACK_OK: u16 = 2000;
pub const CMD_ACK_ERROR: u16 = 2001;
pub const CMD_ACK_DATA: u16 = 2002;
pub const CMD_ACK_UNAUTH: u16 = 2005;
pub const CMD_REG_EVENT: u16 = 500;
pub const CMD_ATTLOG_RRQ: u16 = 13;

/// 实时事件掩码：考勤打卡
pub const EF_ATTLOG: u32 = 1;

/// 用户表的缓冲读取参数（表号 5）
pub const REQ_USER_DATA: [u8; 11] = [
    0x01, 0x09, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
/// 考勤日志的缓冲读取参数（表号 13）
pub const REQ_ATTENDANCE_DATA: [u8; 11] = [
    0x01, 0x0d, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// 用户目录记录长度（TCP 固件）
pub const USER_RECORD_SIZE: usize = 72;
/// 考勤记录长度（TCP 固件）
pub const ATTENDANCE_RECORD_SIZE: usize = 40;

/// 一个解码后的协议包
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub command: u16,
    pub session_id: u16,
    pub reply_id: u16,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(command: u16, session_id: u16, reply_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            session_id,
            reply_id,
            data,
        }
    }

    /// 编码为完整 TCP 帧（含魔数与长度头）
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = BytesMut::with_capacity(8 + self.data.len());
        payload.put_u16_le(self.command);
        payload.put_u16_le(0); // 校验和占位
        payload.put_u16_le(self.session_id);
        payload.put_u16_le(self.reply_id);
        payload.put_slice(&self.data);

        let checksum = checksum16(&payload);
        payload[2] = (checksum & 0xff) as u8;
        payload[3] = (checksum >> 8) as u8;

        let mut frame = BytesMut::with_capacity(8 + payload.len());
        frame.put_slice(&HEADER_MAGIC);
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(&payload);
        frame.to_vec()
    }

    /// 从帧负载（魔数与长度头之后）解码并校验
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(SyncError::Protocol(format!(
                "packet payload too short: {} bytes",
                payload.len()
            )));
        }

        let received = u16::from_le_bytes([payload[2], payload[3]]);
        let mut scratch = payload.to_vec();
        scratch[2] = 0;
        scratch[3] = 0;
        let computed = checksum16(&scratch);
        if computed != received {
            return Err(SyncError::Protocol(format!(
                "packet checksum mismatch: received {received:#06x}, computed {computed:#06x}"
            )));
        }

        Ok(Self {
            command: u16::from_le_bytes([payload[0], payload[1]]),
            session_id: u16::from_le_bytes([payload[4], payload[5]]),
            reply_id: u16::from_le_bytes([payload[6], payload[7]]),
            data: payload[8..].to_vec(),
        })
    }
}

/// 16 位反码累加校验和
pub fn checksum16(payload: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = payload.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += *last as u32;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// 解码厂商打包时间戳
pub fn decode_time(mut packed: u32) -> Option<NaiveDateTime> {
    let second = packed % 60;
    packed /= 60;
    let minute = packed % 60;
    packed /= 60;
    let hour = packed % 24;
    packed /= 24;
    let day = packed % 31 + 1;
    packed /= 31;
    let month = packed % 12 + 1;
    packed /= 12;
    let year = packed + 2000;

    NaiveDate::from_ymd_opt(year as i32, month, day)?.and_hms_opt(hour, minute, second)
}

/// 编码为厂商打包时间戳（测试与写回设备时钟用）
pub fn encode_time(t: NaiveDateTime) -> u32 {
    use chrono::Datelike;
    let date = t.date();
    ((date.year() as u32 - 2000) * 12 * 31 + (date.month() - 1) * 31 + (date.day() - 1))
        * 24
        * 60
        * 60
        + t.hour() * 60 * 60
        + t.minute() * 60
        + t.second()
}

/// 实时推送帧的六字节日期形态（y-2000, m, d, h, m, s）
pub fn decode_time_bytes(raw: &[u8]) -> Option<NaiveDateTime> {
    if raw.len() < 6 {
        return None;
    }
    NaiveDate::from_ymd_opt(2000 + raw[0] as i32, raw[1] as u32, raw[2] as u32)?.and_hms_opt(
        raw[3] as u32,
        raw[4] as u32,
        raw[5] as u32,
    )
}

/// 通信密钥握手值（设备回 `CMD_ACK_UNAUTH` 时发送）
///
/// 厂商算法：密钥按位反转、加会话号、逐字节异或 "ZKSO"、
/// 交换 16 位半字，再与固定 ticks 字节异或。
pub fn make_comm_key(key: u32, session_id: u16) -> [u8; 4] {
    const TICKS: u8 = 50;

    let mut reversed: u32 = 0;
    for i in 0..32 {
        reversed <<= 1;
        if key & (1 << i) != 0 {
            reversed |= 1;
        }
    }
    let k = reversed.wrapping_add(session_id as u32);

    let b = k.to_le_bytes();
    let xored = [b[0] ^ b'Z', b[1] ^ b'K', b[2] ^ b'S', b[3] ^ b'O'];

    // 交换半字
    let swapped = [xored[2], xored[3], xored[0], xored[1]];
    [
        swapped[0] ^ TICKS,
        swapped[1] ^ TICKS,
        TICKS,
        swapped[3] ^ TICKS,
    ]
}

/// 以零字节截断的 ASCII 字段
pub fn ascii_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}
