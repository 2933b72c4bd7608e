// 集成测试套件 - 用内存假件驱动会话/监督者/监视器全链路
// 不触网、不连库：传输层与仓储层都以假件替身注入

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;

use hms_device_sync::domain::model::{
    AttendanceEvent, DeviceConfig, DeviceStatus, RawPunch, RawRecord, RawTimestamp, RawUser,
};
use hms_device_sync::domain::repository::{
    AttendanceSink, DeviceRegistry, DeviceTransport, InsertOutcome, TransportFactory,
};
use hms_device_sync::domain::service::{
    DeviceSession, FleetSupervisor, RegistryWatcher, SessionExit, SessionTuning, SupervisorConfig,
};
use hms_device_sync::error::{Result, SyncError};

/// 可编程的设备传输假件
struct FakeTransport {
    connects: AtomicU32,
    disconnects: AtomicU32,
    /// 剩余的拉取失败次数，递减到零后恢复正常
    fetch_errors: AtomicU32,
    /// 置位后考勤拉取永远挂起（模拟死掉但未断开的固件）
    hang_fetches: AtomicBool,
    users: Mutex<Vec<RawUser>>,
    snapshot: Mutex<Vec<RawRecord>>,
    realtime_tx: Mutex<Option<mpsc::Sender<RawRecord>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(Self {
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            fetch_errors: AtomicU32::new(0),
            hang_fetches: AtomicBool::new(false),
            users: Mutex::new(Vec::new()),
            snapshot: Mutex::new(Vec::new()),
            realtime_tx: Mutex::new(None),
            closed_tx,
            closed_rx,
        })
    }

    async fn set_snapshot(&self, records: Vec<RawRecord>) {
        *self.snapshot.lock().await = records;
    }

    async fn push_realtime(&self, record: RawRecord) {
        let guard = self.realtime_tx.lock().await;
        let tx = guard.as_ref().expect("realtime not subscribed");
        tx.send(record).await.expect("realtime receiver dropped");
    }

    fn fail_next_fetches(&self, n: u32) {
        self.fetch_errors.store(n, Ordering::SeqCst);
    }

    fn hang_fetches(&self) {
        self.hang_fetches.store(true, Ordering::SeqCst);
    }

    fn drop_connection(&self) {
        let _ = self.closed_tx.send(true);
    }
}

#[async_trait::async_trait]
impl DeviceTransport for FakeTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let _ = self.closed_tx.send(false);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.realtime_tx.lock().await.take();
        Ok(())
    }

    async fn fetch_users(&self) -> Result<Vec<RawUser>> {
        Ok(self.users.lock().await.clone())
    }

    async fn fetch_attendance(&self) -> Result<Vec<RawRecord>> {
        if self.hang_fetches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let remaining = self.fetch_errors.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fetch_errors.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Transport("injected fetch failure".into()));
        }
        Ok(self.snapshot.lock().await.clone())
    }

    async fn subscribe_realtime(&self) -> Result<mpsc::Receiver<RawRecord>> {
        let (tx, rx) = mpsc::channel(16);
        *self.realtime_tx.lock().await = Some(tx);
        Ok(rx)
    }

    async fn enable(&self) -> Result<()> {
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        Ok(())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

struct FakeFactory {
    transport: Arc<FakeTransport>,
    creates: AtomicU32,
}

impl FakeFactory {
    fn new(transport: Arc<FakeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            creates: AtomicU32::new(0),
        })
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, _device: &DeviceConfig) -> Arc<dyn DeviceTransport> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.transport.clone()
    }
}

/// 幂等落库假件：按 (device_host, subject_id, instant_utc) 去重
struct FakeSink {
    events: Mutex<Vec<AttendanceEvent>>,
    keys: Mutex<HashSet<(String, String, DateTime<Utc>)>>,
    seed_high_water: Mutex<Option<DateTime<Utc>>>,
    /// 累计的插入尝试次数（含重复与失败）
    attempts: AtomicU32,
    /// 剩余的注入插入失败次数
    fail_inserts: AtomicU32,
}

impl FakeSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            keys: Mutex::new(HashSet::new()),
            seed_high_water: Mutex::new(None),
            attempts: AtomicU32::new(0),
            fail_inserts: AtomicU32::new(0),
        })
    }

    /// 预置一条"上一次运行"已落库的记录：建去重键并抬高水位
    async fn prime(&self, host: &str, subject: &str, instant: DateTime<Utc>) {
        self.keys
            .lock()
            .await
            .insert((host.to_string(), subject.to_string(), instant));
        let mut seed = self.seed_high_water.lock().await;
        if seed.map_or(true, |hw| instant > hw) {
            *seed = Some(instant);
        }
    }

    async fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .events
            .lock()
            .await
            .iter()
            .map(|e| e.subject_id.clone())
            .collect();
        subjects.sort();
        subjects
    }

    async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait::async_trait]
impl AttendanceSink for FakeSink {
    async fn insert(&self, _org_ref: Option<&str>, event: &AttendanceEvent) -> Result<InsertOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.fail_inserts.load(Ordering::SeqCst);
        if failing > 0 {
            self.fail_inserts.store(failing - 1, Ordering::SeqCst);
            return Err(SyncError::Transport("injected insert failure".into()));
        }
        let key = (
            event.device_host.clone(),
            event.subject_id.clone(),
            event.instant_utc,
        );
        let mut keys = self.keys.lock().await;
        if !keys.insert(key) {
            return Ok(InsertOutcome::Duplicate);
        }
        self.events.lock().await.push(event.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn high_water(
        &self,
        _org_ref: Option<&str>,
        _device_host: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.seed_high_water.lock().await)
    }
}

struct FakeRegistry {
    devices: Mutex<Vec<DeviceConfig>>,
    statuses: Mutex<Vec<DeviceStatus>>,
}

impl FakeRegistry {
    fn new(devices: Vec<DeviceConfig>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            statuses: Mutex::new(Vec::new()),
        })
    }

    async fn set_devices(&self, devices: Vec<DeviceConfig>) {
        *self.devices.lock().await = devices;
    }

    async fn saw_offline(&self) -> bool {
        self.statuses.lock().await.iter().any(|s| !s.online)
    }
}

#[async_trait::async_trait]
impl DeviceRegistry for FakeRegistry {
    async fn list_enabled(&self) -> Result<Vec<DeviceConfig>> {
        Ok(self.devices.lock().await.clone())
    }

    async fn update_status(&self, _device_id: &str, status: DeviceStatus) -> Result<()> {
        self.statuses.lock().await.push(status);
        Ok(())
    }
}

fn device() -> DeviceConfig {
    DeviceConfig {
        id: "dev-1".into(),
        hostel_id: Some("hostel-1".into()),
        host: "192.168.1.250".into(),
        port: 4370,
        comm_key: 0,
        enabled: true,
    }
}

fn base_time() -> NaiveDateTime {
    Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0)
        .unwrap()
        .naive_utc()
}

fn instant_at(offset_secs: i64) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(base_time() + chrono::Duration::seconds(offset_secs)))
}

fn record(user: &str, offset_secs: i64, punch: i64) -> RawRecord {
    RawRecord {
        user_id: Some(user.to_string()),
        timestamp: Some(RawTimestamp::Instant(
            base_time() + chrono::Duration::seconds(offset_secs),
        )),
        punch: Some(RawPunch::Code(punch)),
        ..Default::default()
    }
}

fn tuning() -> SessionTuning {
    SessionTuning {
        poll_interval: Duration::from_millis(25),
        connect_timeout: Duration::from_secs(1),
        io_timeout: Duration::from_secs(1),
    }
}

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        tuning: tuning(),
        probe_interval: Duration::from_millis(25),
    }
}

/// 快照、轮询、实时三路重叠投递同一批打卡，落库必须恰好一次
#[tokio::test]
async fn overlapping_sources_ingest_exactly_once() {
    let transport = FakeTransport::new();
    transport
        .set_snapshot(vec![record("A", 0, 0), record("B", 60, 1)])
        .await;

    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);

    let session = DeviceSession::new(
        device(),
        transport.clone(),
        sink.clone(),
        registry.clone(),
        tuning(),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(session.run(stop_rx));

    // 等快照与实时订阅就绪
    sleep(Duration::from_millis(80)).await;

    // 实时推送 B 的重复帧与新打卡 C
    transport.push_realtime(record("B", 60, 1)).await;
    transport.push_realtime(record("C", 120, 0)).await;

    // 轮询也会看到含 C 的全量
    transport
        .set_snapshot(vec![record("A", 0, 0), record("B", 60, 1), record("C", 120, 0)])
        .await;
    sleep(Duration::from_millis(120)).await;

    stop_tx.send(true).unwrap();
    let exit = handle.await.unwrap();
    assert_eq!(exit, SessionExit::Stopped);

    assert_eq!(sink.len().await, 3);
    assert_eq!(sink.subjects().await, vec!["A", "B", "C"]);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
}

/// 只追加设备时钟不可靠：追加记录的时刻早于高水位，按条数差检出
#[tokio::test]
async fn count_delta_catches_backdated_appends() {
    let transport = FakeTransport::new();
    transport
        .set_snapshot(vec![record("A", 1000, 0), record("B", 1060, 1)])
        .await;

    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);

    let session = DeviceSession::new(
        device(),
        transport.clone(),
        sink.clone(),
        registry.clone(),
        tuning(),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(session.run(stop_rx));

    sleep(Duration::from_millis(80)).await;
    assert_eq!(sink.len().await, 2);

    // 追加两条时刻倒退的记录；时间过滤会漏掉它们，条数差不会
    transport
        .set_snapshot(vec![
            record("A", 1000, 0),
            record("B", 1060, 1),
            record("C", 10, 0),
            record("D", 20, 4),
        ])
        .await;
    sleep(Duration::from_millis(120)).await;

    stop_tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(sink.len().await, 4);
    assert_eq!(sink.subjects().await, vec!["A", "B", "C", "D"]);
}

/// 会话重启后高水位从库里播种：快照期间落库失败也不会让后续轮询
/// 退回"全量重试"——轮询按播种水位过滤，不再反复尝试历史记录
#[tokio::test]
async fn seeded_high_water_filters_polls_after_restart() {
    let transport = FakeTransport::new();
    transport
        .set_snapshot(vec![record("A", 100, 0), record("B", 300, 1)])
        .await;

    // 上一次运行已把 A、B 落库；本次快照的两次插入还恰好碰上存储故障
    let sink = FakeSink::new();
    sink.prime("192.168.1.250", "A", instant_at(100)).await;
    sink.prime("192.168.1.250", "B", instant_at(300)).await;
    sink.fail_inserts.store(2, Ordering::SeqCst);

    let registry = FakeRegistry::new(vec![device()]);
    let session = DeviceSession::new(
        device(),
        transport.clone(),
        sink.clone(),
        registry.clone(),
        tuning(),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(session.run(stop_rx));

    // 跑过好几个轮询周期
    sleep(Duration::from_millis(150)).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap();

    // 快照尝试了 2 次；轮询被播种的高水位滤空，不再有任何尝试
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(sink.len().await, 0);
}

/// 挂死的设备 I/O 等同一次轮询失败：连续超时同样送设备离线
#[tokio::test]
async fn hung_fetch_counts_as_poll_failure() {
    let transport = FakeTransport::new();
    transport.hang_fetches();

    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);

    let mut tuning = tuning();
    tuning.io_timeout = Duration::from_millis(30);

    let session = DeviceSession::new(
        device(),
        transport.clone(),
        sink.clone(),
        registry.clone(),
        tuning,
    );
    let (_stop_tx, stop_rx) = watch::channel(false);
    let exit = tokio::spawn(session.run(stop_rx)).await.unwrap();

    assert_eq!(exit, SessionExit::Failed);
    assert!(registry.saw_offline().await);
    assert_eq!(sink.len().await, 0);
}

/// 实时推送解析出目录里的用户：数字句柄经目录映射为外部标识
#[tokio::test]
async fn realtime_resolves_through_directory() {
    let transport = FakeTransport::new();
    *transport.users.lock().await = vec![RawUser {
        uid: Some(7),
        user_id: Some("PSI00004".into()),
        name: Some("Ravi".into()),
        ..Default::default()
    }];

    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);

    let session = DeviceSession::new(
        device(),
        transport.clone(),
        sink.clone(),
        registry.clone(),
        tuning(),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(session.run(stop_rx));

    sleep(Duration::from_millis(80)).await;
    transport
        .push_realtime(RawRecord {
            device_user_id: Some("7".into()),
            timestamp: Some(RawTimestamp::Instant(base_time())),
            punch: Some(RawPunch::Code(0)),
            ..Default::default()
        })
        .await;
    sleep(Duration::from_millis(50)).await;

    stop_tx.send(true).unwrap();
    handle.await.unwrap();

    let events = sink.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject_id, "PSI00004");
    assert_eq!(events[0].display_name, "Ravi");
}

/// 注册表撤下设备：会话被停掉、传输断开，且不再写离线状态
#[tokio::test]
async fn reconcile_removal_stops_session_cleanly() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);
    let factory = FakeFactory::new(transport.clone());

    let supervisor = FleetSupervisor::new(
        registry.clone(),
        sink.clone(),
        factory.clone(),
        supervisor_config(),
    );

    supervisor.reconcile(vec![device()]).await;
    sleep(Duration::from_millis(60)).await;
    assert_eq!(supervisor.active_sessions().await, 1);
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

    supervisor.reconcile(vec![]).await;
    assert_eq!(supervisor.active_sessions().await, 0);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    // 主动停止不是故障，设备不应被标记离线
    assert!(!registry.saw_offline().await);

    supervisor.shutdown().await;
}

/// 配置变更（通信密钥换了）触发会话重启，而非原地沿用旧连接
#[tokio::test]
async fn config_change_restarts_session() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);
    let factory = FakeFactory::new(transport.clone());

    let supervisor = FleetSupervisor::new(
        registry.clone(),
        sink.clone(),
        factory.clone(),
        supervisor_config(),
    );

    supervisor.reconcile(vec![device()]).await;
    sleep(Duration::from_millis(60)).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

    let mut changed = device();
    changed.comm_key = 42;
    supervisor.reconcile(vec![changed]).await;
    sleep(Duration::from_millis(60)).await;

    assert_eq!(supervisor.active_sessions().await, 1);
    assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

    supervisor.shutdown().await;
}

/// 连续轮询失败达到阈值：设备离线、会话拆除、探测成功后恰好重启一次
#[tokio::test]
async fn failure_threshold_triggers_probe_and_single_restart() {
    let transport = FakeTransport::new();
    // 快照拉取消耗 1 次，随后 3 个轮询周期连续失败触发阈值
    transport.fail_next_fetches(4);

    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);
    let factory = FakeFactory::new(transport.clone());

    let supervisor = FleetSupervisor::new(
        registry.clone(),
        sink.clone(),
        factory.clone(),
        supervisor_config(),
    );

    supervisor.reconcile(vec![device()]).await;

    // 等故障发酵、探测触发、会话重启收敛
    sleep(Duration::from_millis(600)).await;

    assert!(registry.saw_offline().await);
    assert_eq!(supervisor.active_sessions().await, 1);
    assert!(!supervisor.probe_pending("dev-1").await);
    // 连接序列：首次会话 + 探测 + 重启会话
    assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
    assert_eq!(factory.creates.load(Ordering::SeqCst), 3);

    supervisor.shutdown().await;
}

/// 套接字被拔线：closed 通知立刻把会话送入离线 + 探测路径
#[tokio::test]
async fn abrupt_socket_drop_marks_offline() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![device()]);

    let session = DeviceSession::new(
        device(),
        transport.clone(),
        sink.clone(),
        registry.clone(),
        tuning(),
    );
    let (_stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(session.run(stop_rx));

    sleep(Duration::from_millis(60)).await;
    transport.drop_connection();

    let exit = handle.await.unwrap();
    assert_eq!(exit, SessionExit::Failed);
    assert!(registry.saw_offline().await);
}

/// 监视器端到端：注册表里增删设备，无需重启进程即生效
#[tokio::test]
async fn watcher_hot_adds_and_removes_devices() {
    let transport = FakeTransport::new();
    let sink = FakeSink::new();
    let registry = FakeRegistry::new(vec![]);
    let factory = FakeFactory::new(transport.clone());

    let supervisor = FleetSupervisor::new(
        registry.clone(),
        sink.clone(),
        factory.clone(),
        supervisor_config(),
    );
    let watcher = RegistryWatcher::new(
        registry.clone(),
        supervisor.clone(),
        Duration::from_millis(30),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let watcher_task = tokio::spawn(async move { watcher.run(stop_rx).await });

    sleep(Duration::from_millis(50)).await;
    assert_eq!(supervisor.active_sessions().await, 0);

    registry.set_devices(vec![device()]).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.active_sessions().await, 1);

    registry.set_devices(vec![]).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.active_sessions().await, 0);

    stop_tx.send(true).unwrap();
    watcher_task.await.unwrap();
    supervisor.shutdown().await;
}
