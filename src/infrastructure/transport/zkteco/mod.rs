//! ZKTeco 考勤机传输适配器
//!
//! 基于 TCP 的请求/应答协议，实时打卡以 `CMD_REG_EVENT` 推送帧混在
//! 应答流里到达；读取任务负责分流：事件帧回 ACK 后转发给订阅通道，
//! 其余应答投递给请求方。套接字断开通过 watch 通道通知会话层。

pub mod codec;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::domain::model::{DeviceConfig, RawPunch, RawRecord, RawTimestamp, RawUser};
use crate::domain::repository::{DeviceTransport, TransportFactory};
use crate::error::{Result, SyncError};

use codec::*;

/// 单帧上限；考勤数据按 CMD_DATA 分块到达，不会超过它
const MAX_FRAME_BYTES: usize = 1024 * 1024;
const REALTIME_CHANNEL_CAPACITY: usize = 64;

/// 按设备配置创建 ZKTeco 适配器的工厂
pub struct ZkTransportFactory;

impl TransportFactory for ZkTransportFactory {
    fn create(&self, device: &DeviceConfig) -> Arc<dyn DeviceTransport> {
        Arc::new(ZkTransport::new(device.addr(), device.comm_key))
    }
}

/// 考勤日志的取数策略（固件代际差异），连接内首次成功后固定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttendanceFetch {
    /// 新固件：带参数的缓冲读取
    Buffered,
    /// 旧固件：专用日志读取命令
    Legacy,
}

/// 取数策略的固定尝试顺序
const FETCH_STRATEGIES: [AttendanceFetch; 2] = [AttendanceFetch::Buffered, AttendanceFetch::Legacy];

struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    session_id: u16,
    next_reply: u16,
    replies: mpsc::Receiver<Packet>,
    reader: JoinHandle<()>,
    attendance_fetch: Option<AttendanceFetch>,
}

impl Connection {
    /// 发送一条命令并等待对应序号的应答；过期应答直接丢弃
    async fn request(&mut self, command: u16, data: Vec<u8>) -> Result<Packet> {
        self.next_reply = self.next_reply.wrapping_add(1);
        let packet = Packet::new(command, self.session_id, self.next_reply, data);
        self.writer.lock().await.write_all(&packet.encode()).await?;

        loop {
            let reply = self
                .replies
                .recv()
                .await
                .ok_or_else(|| SyncError::Transport("connection closed".into()))?;
            if reply.reply_id == self.next_reply {
                return Ok(reply);
            }
            trace!(reply = reply.reply_id, expected = self.next_reply, "Dropping stale reply");
        }
    }

    /// 读取一个可能分块到达的数据表
    ///
    /// 小表直接在 `CMD_DATA`/`CMD_ACK_DATA` 应答里返回；大表先收到
    /// `CMD_PREPARE_DATA` 预告总长，随后累积 `CMD_DATA` 块直到长度够
    /// 或收到 `CMD_ACK_OK`，最后回 `CMD_FREE_DATA` 释放设备缓冲。
    async fn read_table(&mut self, command: u16, params: Vec<u8>) -> Result<Vec<u8>> {
        let reply = self.request(command, params).await?;
        match reply.command {
            CMD_DATA | CMD_ACK_DATA => Ok(reply.data),
            // 空表：设备直接确认，没有后续数据块
            CMD_ACK_OK => Ok(reply.data),
            CMD_PREPARE_DATA => {
                let total = reply
                    .data
                    .get(0..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .unwrap_or(0);
                let mut buf = Vec::with_capacity(total);
                loop {
                    let chunk = self
                        .replies
                        .recv()
                        .await
                        .ok_or_else(|| SyncError::Transport("connection closed".into()))?;
                    match chunk.command {
                        CMD_PREPARE_DATA => {} // 重复预告，忽略
                        CMD_DATA => {
                            buf.extend_from_slice(&chunk.data);
                            if total > 0 && buf.len() >= total {
                                break;
                            }
                        }
                        CMD_ACK_OK => break,
                        CMD_ACK_ERROR => {
                            return Err(SyncError::Protocol("device reported read error".into()))
                        }
                        other => {
                            trace!(command = other, "Ignoring unexpected packet in data stream");
                        }
                    }
                }
                let _ = self.request(CMD_FREE_DATA, vec![]).await;
                Ok(buf)
            }
            CMD_ACK_ERROR => Err(SyncError::Protocol("device refused data read".into())),
            other => Err(SyncError::Protocol(format!(
                "unexpected data reply command: {other}"
            ))),
        }
    }
}

pub struct ZkTransport {
    addr: String,
    comm_key: u32,
    conn: Mutex<Option<Connection>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    realtime: Arc<Mutex<Option<mpsc::Sender<RawRecord>>>>,
}

impl ZkTransport {
    pub fn new(addr: String, comm_key: u32) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            addr,
            comm_key,
            conn: Mutex::new(None),
            closed_tx,
            closed_rx,
            realtime: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait::async_trait]
impl DeviceTransport for ZkTransport {
    async fn connect(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let writer = Arc::new(Mutex::new(write_half));
        let (reply_tx, reply_rx) = mpsc::channel(64);
        let _ = self.closed_tx.send(false);
        let reader = tokio::spawn(reader_loop(
            read_half,
            reply_tx,
            self.realtime.clone(),
            writer.clone(),
            self.closed_tx.clone(),
        ));

        let mut conn = Connection {
            writer,
            session_id: 0,
            next_reply: 0,
            replies: reply_rx,
            reader,
            attendance_fetch: None,
        };

        match handshake(&mut conn, self.comm_key).await {
            Ok(()) => {
                debug!(addr = %self.addr, session = conn.session_id, "Device handshake complete");
                *self.conn.lock().await = Some(conn);
                Ok(())
            }
            Err(e) => {
                conn.reader.abort();
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(mut conn) = self.conn.lock().await.take() {
            let _ = conn.request(CMD_EXIT, vec![]).await;
            conn.reader.abort();
        }
        // 订阅方看到通道结束即知会话已拆除
        self.realtime.lock().await.take();
        Ok(())
    }

    async fn fetch_users(&self) -> Result<Vec<RawUser>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SyncError::Transport("not connected".into()))?;
        let data = conn.read_table(CMD_DATA_WRRQ, REQ_USER_DATA.to_vec()).await?;
        Ok(parse_users(&data))
    }

    async fn fetch_attendance(&self) -> Result<Vec<RawRecord>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SyncError::Transport("not connected".into()))?;

        // 已确定策略的连接只用该策略；否则按固定顺序探测一次
        let strategies: Vec<AttendanceFetch> = match conn.attendance_fetch {
            Some(s) => vec![s],
            None => FETCH_STRATEGIES.to_vec(),
        };

        let mut last_err: Option<SyncError> = None;
        for strategy in strategies {
            let fetched = match strategy {
                AttendanceFetch::Buffered => {
                    conn.read_table(CMD_DATA_WRRQ, REQ_ATTENDANCE_DATA.to_vec()).await
                }
                AttendanceFetch::Legacy => conn.read_table(CMD_ATTLOG_RRQ, vec![]).await,
            };
            match fetched {
                Ok(data) if !data.is_empty() => {
                    conn.attendance_fetch = Some(strategy);
                    return Ok(parse_attendance(&data));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(addr = %self.addr, strategy = ?strategy, error = %e, "Attendance fetch strategy failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(Vec::new()), // 设备日志为空
        }
    }

    async fn subscribe_realtime(&self) -> Result<mpsc::Receiver<RawRecord>> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SyncError::Transport("not connected".into()))?;

        let reply = conn
            .request(CMD_REG_EVENT, EF_ATTLOG.to_le_bytes().to_vec())
            .await?;
        if reply.command != CMD_ACK_OK {
            return Err(SyncError::Protocol(
                "device rejected realtime event registration".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(REALTIME_CHANNEL_CAPACITY);
        *self.realtime.lock().await = Some(tx);
        Ok(rx)
    }

    async fn enable(&self) -> Result<()> {
        self.simple_command(CMD_ENABLEDEVICE).await
    }

    async fn disable(&self) -> Result<()> {
        self.simple_command(CMD_DISABLEDEVICE).await
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

impl ZkTransport {
    async fn simple_command(&self, command: u16) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SyncError::Transport("not connected".into()))?;
        let reply = conn.request(command, vec![]).await?;
        if reply.command == CMD_ACK_OK {
            Ok(())
        } else {
            Err(SyncError::Protocol(format!(
                "command {command} rejected with {}",
                reply.command
            )))
        }
    }
}

/// 连接握手：CMD_CONNECT 换会话号；设备要求鉴权时补发通信密钥
async fn handshake(conn: &mut Connection, comm_key: u32) -> Result<()> {
    let reply = conn.request(CMD_CONNECT, vec![]).await?;
    conn.session_id = reply.session_id;
    match reply.command {
        CMD_ACK_OK => Ok(()),
        CMD_ACK_UNAUTH => {
            let key = make_comm_key(comm_key, conn.session_id);
            let auth = conn.request(CMD_AUTH, key.to_vec()).await?;
            if auth.command == CMD_ACK_OK {
                Ok(())
            } else {
                Err(SyncError::Protocol("device rejected comm key".into()))
            }
        }
        other => Err(SyncError::Protocol(format!(
            "unexpected connect reply command: {other}"
        ))),
    }
}

/// 读取任务：分帧、分流应答与实时事件，套接字断开时发出通知
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    replies: mpsc::Sender<Packet>,
    realtime: Arc<Mutex<Option<mpsc::Sender<RawRecord>>>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
) {
    loop {
        let mut header = [0u8; 8];
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        if header[..4] != HEADER_MAGIC {
            debug!("Bad frame magic, dropping connection");
            break;
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if !(8..=MAX_FRAME_BYTES).contains(&len) {
            debug!(len, "Frame length out of bounds, dropping connection");
            break;
        }
        let mut payload = vec![0u8; len];
        if read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        let packet = match Packet::decode(&payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "Undecodable frame, dropping connection");
                break;
            }
        };

        if packet.command == CMD_REG_EVENT {
            // 设备期望对事件帧立即确认
            let ack = Packet::new(CMD_ACK_OK, packet.session_id, packet.reply_id, vec![]);
            let _ = writer.lock().await.write_all(&ack.encode()).await;

            if let Some(record) = parse_realtime(&packet.data) {
                if let Some(tx) = realtime.lock().await.as_ref() {
                    // 订阅方落后太多时宁可丢推送：轮询兜底会补上
                    let _ = tx.try_send(record);
                }
            }
            continue;
        }

        if replies.send(packet).await.is_err() {
            break;
        }
    }
    let _ = closed.send(true);
}

/// 解析 72 字节用户记录表；负载可能带长度前缀，按记录长度尾部对齐
fn parse_users(data: &[u8]) -> Vec<RawUser> {
    let offset = data.len() % USER_RECORD_SIZE;
    data[offset..]
        .chunks_exact(USER_RECORD_SIZE)
        .map(|rec| {
            let uid = u16::from_le_bytes([rec[0], rec[1]]) as u32;
            let name = ascii_field(&rec[11..35]);
            let card = u32::from_le_bytes([rec[35], rec[36], rec[37], rec[38]]);
            let user_id = ascii_field(&rec[48..57]);
            RawUser {
                uid: Some(uid),
                user_id: (!user_id.is_empty()).then_some(user_id),
                card_no: (card > 0).then(|| card.to_string()),
                pin: None,
                user_sn: None,
                name: (!name.is_empty()).then_some(name),
            }
        })
        .collect()
}

/// 解析 40 字节考勤记录表
///
/// 布局：序号 u16@0、用户标识 ASCII@2..11、校验方式 u8@26、
/// 打包时间 u32@27、punch 状态 u8@31。
fn parse_attendance(data: &[u8]) -> Vec<RawRecord> {
    let offset = data.len() % ATTENDANCE_RECORD_SIZE;
    data[offset..]
        .chunks_exact(ATTENDANCE_RECORD_SIZE)
        .map(|rec| {
            let sn = u16::from_le_bytes([rec[0], rec[1]]) as u32;
            let user = ascii_field(&rec[2..11]);
            let packed = u32::from_le_bytes([rec[27], rec[28], rec[29], rec[30]]);
            RawRecord {
                device_user_id: (!user.is_empty()).then_some(user),
                sn: Some(sn),
                timestamp: decode_time(packed).map(RawTimestamp::Instant),
                punch: Some(RawPunch::Code(rec[31] as i64)),
                ..Default::default()
            }
        })
        .collect()
}

/// 解析实时推送帧：用户标识 ASCII@0..9、punch 状态 u8@24、
/// 六字节日期@26..32
fn parse_realtime(data: &[u8]) -> Option<RawRecord> {
    if data.len() < 32 {
        return None;
    }
    let user = ascii_field(&data[0..9]);
    Some(RawRecord {
        device_user_id: (!user.is_empty()).then_some(user),
        timestamp: decode_time_bytes(&data[26..32]).map(RawTimestamp::Instant),
        punch: Some(RawPunch::Code(data[24] as i64)),
        ..Default::default()
    })
}
