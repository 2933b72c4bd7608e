//! 机群监督者
//!
//! 持有设备标识到活动会话的映射，负责：按对账结果启停/重启会话、
//! 为失联设备调度连通性探测（每台设备至多一个探测任务）、优雅停机。
//! 所有可变状态都归监督者实例所有，同一进程可并存多个互不相干的实例。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::domain::model::DeviceConfig;
use crate::domain::repository::{AttendanceSink, DeviceRegistry, TransportFactory};
use crate::domain::service::device_session::{DeviceSession, SessionExit, SessionTuning};

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub tuning: SessionTuning,
    /// 连通性探测间隔
    pub probe_interval: Duration,
}

/// 一个运行中的会话句柄
struct SessionHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    /// 会话启动时的配置签名，对账时比对
    signature: String,
}

struct SupervisorInner {
    registry: Arc<dyn DeviceRegistry>,
    sink: Arc<dyn AttendanceSink>,
    transports: Arc<dyn TransportFactory>,
    config: SupervisorConfig,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// 设备标识 → 未决探测任务；存在即表示"已在探测"，天然幂等
    probes: Mutex<HashMap<String, JoinHandle<()>>>,
    /// 上次启动（或探测）时所见的设备配置，按此做对账差分
    known: Mutex<HashMap<String, DeviceConfig>>,
}

#[derive(Clone)]
pub struct FleetSupervisor {
    inner: Arc<SupervisorInner>,
}

impl FleetSupervisor {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn AttendanceSink>,
        transports: Arc<dyn TransportFactory>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                sink,
                transports,
                config,
                sessions: Mutex::new(HashMap::new()),
                probes: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 对账：给定最新的启用设备清单，启动新设备、重启配置变更的设备、
    /// 停掉已删除/停用的设备（连同其未决探测）
    pub async fn reconcile(&self, fresh: Vec<DeviceConfig>) {
        let fresh_map: HashMap<String, DeviceConfig> =
            fresh.into_iter().map(|d| (d.id.clone(), d)).collect();

        let mut to_start: Vec<DeviceConfig> = Vec::new();
        let mut to_restart: Vec<DeviceConfig> = Vec::new();
        let mut to_stop: Vec<String> = Vec::new();

        {
            let mut known = self.inner.known.lock().await;
            for (id, device) in &fresh_map {
                match known.get(id) {
                    None => {
                        info!(device = %id, "New device detected");
                        to_start.push(device.clone());
                    }
                    Some(prev) if prev.config_signature() != device.config_signature() => {
                        info!(device = %id, "Device config changed, restarting session");
                        to_restart.push(device.clone());
                    }
                    Some(_) => {}
                }
            }
            for id in known.keys() {
                if !fresh_map.contains_key(id) {
                    info!(device = %id, "Device removed or disabled, stopping session");
                    to_stop.push(id.clone());
                }
            }
            *known = fresh_map;
        }

        for id in to_stop {
            cancel_probe(&self.inner, &id).await;
            stop_session(&self.inner, &id).await;
        }
        for device in to_restart {
            cancel_probe(&self.inner, &device.id).await;
            stop_session(&self.inner, &device.id).await;
            start_session(self.inner.clone(), device).await;
        }
        for device in to_start {
            start_session(self.inner.clone(), device).await;
        }
    }

    /// 优雅停机：撤销全部探测、停掉全部会话并等待任务退出
    pub async fn shutdown(&self) {
        info!("Shutting down device fleet");

        for (_, probe) in self.inner.probes.lock().await.drain() {
            probe.abort();
        }

        let handles: Vec<(String, SessionHandle)> =
            self.inner.sessions.lock().await.drain().collect();
        for (id, handle) in &handles {
            debug!(device = %id, "Signalling session stop");
            let _ = handle.stop_tx.send(true);
        }
        for (id, handle) in handles {
            if let Err(e) = handle.join.await {
                warn!(device = %id, error = %e, "Session task ended abnormally");
            }
        }
        self.inner.known.lock().await.clear();
    }

    /// 当前活动会话数（测试与可观测用）
    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// 是否有针对该设备的未决探测
    pub async fn probe_pending(&self, device_id: &str) -> bool {
        self.inner.probes.lock().await.contains_key(device_id)
    }
}

/// 启动一台设备的会话任务并登记句柄
///
/// 会话以 `Failed` 结束时自动转入探测调度；`Stopped` 则静默退出。
/// 返回装箱 future 以打断与 `schedule_probe` 的 async 递归（Send 推断所需）
fn start_session(
    inner: Arc<SupervisorInner>,
    device: DeviceConfig,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(start_session_impl(inner, device))
}

async fn start_session_impl(inner: Arc<SupervisorInner>, device: DeviceConfig) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let transport = inner.transports.create(&device);
    let session = DeviceSession::new(
        device.clone(),
        transport,
        inner.sink.clone(),
        inner.registry.clone(),
        inner.config.tuning.clone(),
    );
    let signature = device.config_signature();

    // 先持锁再 spawn：任务退出路径也要锁 sessions，不会在登记前完成移除
    let mut sessions = inner.sessions.lock().await;
    let device_id = device.id.clone();
    let join = tokio::spawn({
        let inner = inner.clone();
        async move {
            let exit = session.run(stop_rx).await;
            inner.sessions.lock().await.remove(&device.id);
            if exit == SessionExit::Failed {
                schedule_probe(inner.clone(), device).await;
            }
        }
    });
    sessions.insert(
        device_id,
        SessionHandle {
            stop_tx,
            join,
            signature,
        },
    );
}

/// 停止并等待一台设备的会话退出；设备未在运行则为空操作
async fn stop_session(inner: &Arc<SupervisorInner>, device_id: &str) {
    let handle = inner.sessions.lock().await.remove(device_id);
    if let Some(handle) = handle {
        let _ = handle.stop_tx.send(true);
        if let Err(e) = handle.join.await {
            warn!(device = %device_id, error = %e, "Session task ended abnormally");
        }
        debug!(device = %device_id, signature = %handle.signature, "Session stopped");
    }
}

/// 为失联设备调度周期性连通性探测
///
/// 幂等：该设备已有未决探测时直接返回。探测成功即撤销自身并启动
/// 全新会话——恰好一个，不会出现双会话。
async fn schedule_probe(inner: Arc<SupervisorInner>, device: DeviceConfig) {
    let mut probes = inner.probes.lock().await;
    if probes.contains_key(&device.id) {
        return;
    }
    info!(device = %device.id, "Scheduling reconnect probe");

    let device_id = device.id.clone();
    let handle = tokio::spawn({
        let inner = inner.clone();
        async move {
            let mut ticker = interval(inner.config.probe_interval);
            // 首个 tick 立即完成；失联后等满一个间隔再探，避免空转
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!(device = %device.id, "Probing device connectivity");
                let probe = inner.transports.create(&device);
                match timeout(inner.config.tuning.connect_timeout, probe.connect()).await {
                    Ok(Ok(())) => {
                        info!(device = %device.id, "Reconnect probe succeeded, restarting session");
                        if let Ok(Err(e)) =
                            timeout(inner.config.tuning.io_timeout, probe.disconnect()).await
                        {
                            debug!(device = %device.id, error = %e, "Probe disconnect failed");
                        }
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!(device = %device.id, error = %e, "Reconnect probe failed");
                    }
                    Err(_) => {
                        debug!(device = %device.id, "Reconnect probe timed out");
                    }
                }
            }
            inner.probes.lock().await.remove(&device.id);
            start_session(inner.clone(), device).await;
        }
    });
    probes.insert(device_id, handle);
}

async fn cancel_probe(inner: &Arc<SupervisorInner>, device_id: &str) {
    if let Some(probe) = inner.probes.lock().await.remove(device_id) {
        debug!(device = %device_id, "Cancelling reconnect probe");
        probe.abort();
    }
}
