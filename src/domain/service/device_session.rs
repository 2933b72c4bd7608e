//! 设备会话
//!
//! 每台物理设备一个会话任务，独占一条传输连接：
//! 连接 → 加载用户目录 → 全量快照 → 实时订阅 + 轮询兜底。
//! 状态机 `Disconnected → Connecting → Syncing →（出错回 Disconnected）`。
//! 连续轮询失败达到阈值或套接字突然断开时，标记设备离线、拆除会话，
//! 并把设备交还给监督者的重连探测调度。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::model::{AttendanceEvent, DeviceConfig, DeviceStatus, DirectoryCache, RawRecord};
use crate::domain::normalizer;
use crate::domain::repository::{AttendanceSink, DeviceRegistry, DeviceTransport, InsertOutcome};
use crate::error::{Result, SyncError};

/// 连续轮询失败多少次后判定连接丢失
const FAILURE_THRESHOLD: u32 = 3;

/// 会话时间参数
#[derive(Clone, Debug)]
pub struct SessionTuning {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

/// 会话结束方式，监督者据此决定是否调度重连探测
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionExit {
    /// 对账/停机主动停止：不再写任何状态
    Stopped,
    /// 连接丢失：设备已标记离线，等待探测重连
    Failed,
}

/// 会话内部状态（仅存在于任务内存中，随会话销毁）
struct SessionState {
    /// 高水位：已摄取的最新事件时刻
    last_seen: Option<DateTime<Utc>>,
    /// 上次快照的记录条数，用于只追加设备的按数检新
    last_snapshot_count: usize,
    /// 连续轮询失败计数
    failures: u32,
    directory: DirectoryCache,
}

pub struct DeviceSession {
    device: DeviceConfig,
    transport: Arc<dyn DeviceTransport>,
    sink: Arc<dyn AttendanceSink>,
    registry: Arc<dyn DeviceRegistry>,
    tuning: SessionTuning,
}

impl DeviceSession {
    pub fn new(
        device: DeviceConfig,
        transport: Arc<dyn DeviceTransport>,
        sink: Arc<dyn AttendanceSink>,
        registry: Arc<dyn DeviceRegistry>,
        tuning: SessionTuning,
    ) -> Self {
        Self {
            device,
            transport,
            sink,
            registry,
            tuning,
        }
    }

    /// 运行会话直到被停止或连接丢失
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> SessionExit {
        let device_id = self.device.id.clone();

        // 连接（带超时，硬件可能无限期挂起）
        match timeout(self.tuning.connect_timeout, self.transport.connect()).await {
            Ok(Ok(())) => {
                info!(device = %device_id, addr = %self.device.addr(), "Connected to device");
            }
            Ok(Err(e)) => {
                warn!(device = %device_id, error = %e, "Failed to connect to device");
                self.mark_offline().await;
                return SessionExit::Failed;
            }
            Err(_) => {
                warn!(device = %device_id, "Device connect timed out");
                self.mark_offline().await;
                return SessionExit::Failed;
            }
        }

        self.write_status(DeviceStatus::online(true)).await;

        let mut state = SessionState {
            last_seen: None,
            last_snapshot_count: 0,
            failures: 0,
            directory: DirectoryCache::new(),
        };

        // 用已落库的最新时刻播种高水位；失败无碍，去重兜底
        match self
            .sink
            .high_water(self.device.hostel_id.as_deref(), &self.device.host)
            .await
        {
            Ok(seed) => state.last_seen = seed,
            Err(e) => debug!(device = %device_id, error = %e, "Could not seed high-water mark"),
        }

        self.load_directory(&mut state).await;

        if let Err(exit) = self.bulk_snapshot(&mut state, &stop).await {
            return exit;
        }

        // 实时订阅失败只降级为纯轮询
        let mut realtime = match self.transport.subscribe_realtime().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                debug!(device = %device_id, error = %e, "Realtime subscription unavailable, polling only");
                None
            }
        };

        self.write_status(DeviceStatus::online(false)).await;

        let mut poll = interval(self.tuning.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的首个 tick 立即完成，消费掉以免快照后立刻重复全量
        poll.tick().await;

        let mut closed = self.transport.closed();

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!(device = %device_id, "Stopping session");
                        return self.teardown(SessionExit::Stopped).await;
                    }
                }
                res = closed.changed() => {
                    let abrupt = res.is_err() || *closed.borrow();
                    if abrupt {
                        warn!(device = %device_id, "Device connection closed unexpectedly");
                        self.mark_offline().await;
                        return self.teardown(SessionExit::Failed).await;
                    }
                }
                rec = recv_realtime(&mut realtime) => {
                    match rec {
                        Some(record) => self.handle_realtime(record, &mut state).await,
                        None => realtime = None,
                    }
                }
                _ = poll.tick() => {
                    match self.poll_cycle(&mut state).await {
                        Ok(()) => state.failures = 0,
                        Err(e) => {
                            state.failures += 1;
                            warn!(
                                device = %device_id,
                                error = %e,
                                failures = state.failures,
                                "Poll cycle failed"
                            );
                            if state.failures >= FAILURE_THRESHOLD {
                                warn!(device = %device_id, "Consecutive poll failures, marking device offline");
                                self.mark_offline().await;
                                return self.teardown(SessionExit::Failed).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// 加载设备用户目录，注册每个标识变体；容忍失败（继续裸摄取）
    async fn load_directory(&self, state: &mut SessionState) {
        match timeout(self.tuning.io_timeout, self.transport.fetch_users()).await {
            Ok(Ok(users)) => {
                for user in &users {
                    state.directory.register(user);
                }
                info!(
                    device = %self.device.id,
                    users = users.len(),
                    entries = state.directory.len(),
                    "Device user directory loaded"
                );
            }
            Ok(Err(e)) => {
                warn!(device = %self.device.id, error = %e, "Failed to load device users, continuing");
            }
            Err(_) => {
                warn!(device = %self.device.id, "Device user fetch timed out, continuing");
            }
        }
    }

    /// 连接后的全量快照：暂停设备本地操作（best-effort）、单次取全量日志、
    /// 逐条规范化落库、恢复设备，并播种高水位与快照基数
    async fn bulk_snapshot(
        &self,
        state: &mut SessionState,
        stop: &watch::Receiver<bool>,
    ) -> std::result::Result<(), SessionExit> {
        if let Err(e) = run_with_timeout(self.tuning.io_timeout, self.transport.disable()).await {
            debug!(device = %self.device.id, error = %e, "Could not suspend device for snapshot");
        }

        let fetched = run_with_timeout(self.tuning.io_timeout, self.transport.fetch_attendance()).await;

        match fetched {
            Ok(snapshot) => {
                info!(device = %self.device.id, records = snapshot.len(), "Bulk snapshot fetched");
                let mut inserted = 0usize;
                for record in &snapshot {
                    // 停止请求后不再调度新工作
                    if *stop.borrow() {
                        break;
                    }
                    let event = normalizer::normalize(record, &self.device, &state.directory);
                    match self.ingest(&event, state).await {
                        Ok(InsertOutcome::Inserted) => inserted += 1,
                        Ok(InsertOutcome::Duplicate) => {}
                        Err(e) => {
                            error!(device = %self.device.id, error = %e, "Snapshot record insert failed");
                        }
                    }
                }
                state.last_snapshot_count = snapshot.len();
                info!(
                    device = %self.device.id,
                    inserted,
                    high_water = ?state.last_seen,
                    "Bulk snapshot ingested"
                );
            }
            Err(e) => {
                // 快照失败不拆会话，轮询周期会继续计数
                warn!(device = %self.device.id, error = %e, "Bulk snapshot fetch failed");
            }
        }

        if let Err(e) = run_with_timeout(self.tuning.io_timeout, self.transport.enable()).await {
            debug!(device = %self.device.id, error = %e, "Could not resume device after snapshot");
        }

        if *stop.borrow() {
            return Err(self.teardown(SessionExit::Stopped).await);
        }
        Ok(())
    }

    /// 实时推送的单条记录：立即规范化落库并刷新在线状态
    async fn handle_realtime(&self, record: RawRecord, state: &mut SessionState) {
        let event = normalizer::normalize(&record, &self.device, &state.directory);
        match self.ingest(&event, state).await {
            Ok(InsertOutcome::Inserted) => {
                debug!(
                    device = %self.device.id,
                    subject = %event.subject_id,
                    at = %event.instant_utc,
                    "Realtime punch ingested"
                );
            }
            Ok(InsertOutcome::Duplicate) => {}
            Err(e) => {
                error!(device = %self.device.id, error = %e, "Realtime insert failed");
            }
        }
        self.write_status(DeviceStatus::online(true)).await;
    }

    /// 一个轮询周期：全量拉取并与上一轮对比检出新记录
    ///
    /// 检新策略按优先级：(a) 条数增加 → 尾部切片视为新增（适配只追加、
    /// 时钟不可靠的设备）；(b) 否则取事件时刻严格大于高水位的记录。
    /// 无论是否检出新记录，高水位与快照基数在每轮结束都会更新。
    async fn poll_cycle(&self, state: &mut SessionState) -> Result<()> {
        let snapshot =
            run_with_timeout(self.tuning.io_timeout, self.transport.fetch_attendance()).await?;
        if snapshot.is_empty() {
            self.write_status(DeviceStatus::online(false)).await;
            return Ok(());
        }

        let events: Vec<AttendanceEvent> = snapshot
            .iter()
            .map(|rec| normalizer::normalize(rec, &self.device, &state.directory))
            .collect();

        let fresh: Vec<&AttendanceEvent> = if snapshot.len() > state.last_snapshot_count {
            let delta = snapshot.len() - state.last_snapshot_count;
            debug!(
                device = %self.device.id,
                delta,
                "Detected appended records by count"
            );
            events[events.len() - delta..].iter().collect()
        } else {
            events
                .iter()
                .filter(|e| state.last_seen.map_or(true, |hw| e.instant_utc > hw))
                .collect()
        };

        let mut inserted = 0usize;
        for event in fresh {
            // 插入失败（非重复键）向上传播，计入失败阈值，下轮重试
            if let InsertOutcome::Inserted = self.ingest(event, state).await? {
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!(device = %self.device.id, inserted, "Poll cycle ingested new punches");
        }

        state.last_snapshot_count = snapshot.len();
        self.write_status(DeviceStatus::online(false)).await;
        Ok(())
    }

    /// 落库一条事件并推进高水位；每次成功插入都刷新心跳
    async fn ingest(&self, event: &AttendanceEvent, state: &mut SessionState) -> Result<InsertOutcome> {
        let outcome = self
            .sink
            .insert(self.device.hostel_id.as_deref(), event)
            .await?;

        if state.last_seen.map_or(true, |hw| event.instant_utc > hw) {
            state.last_seen = Some(event.instant_utc);
        }
        if outcome == InsertOutcome::Inserted {
            self.write_status(DeviceStatus::online(true)).await;
        }
        Ok(outcome)
    }

    async fn teardown(&self, exit: SessionExit) -> SessionExit {
        if let Err(e) = run_with_timeout(self.tuning.io_timeout, self.transport.disconnect()).await {
            debug!(device = %self.device.id, error = %e, "Disconnect during teardown failed");
        }
        exit
    }

    async fn mark_offline(&self) {
        self.write_status(DeviceStatus::offline()).await;
    }

    /// 状态回写失败只记日志：注册表暂不可写不应拆掉正常的摄取会话
    async fn write_status(&self, status: DeviceStatus) {
        if let Err(e) = self.registry.update_status(&self.device.id, status).await {
            debug!(device = %self.device.id, error = %e, "Failed to write device status");
        }
    }
}

/// 所有设备 I/O 都必须有显式超时：挂起的调用等同一次轮询失败
async fn run_with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(SyncError::Timeout("device I/O")),
    }
}

async fn recv_realtime(realtime: &mut Option<mpsc::Receiver<RawRecord>>) -> Option<RawRecord> {
    match realtime {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
