//! 设备注册表监视器
//!
//! 定期重读配置库中的启用设备清单并触发监督者对账，
//! 是热添加/移除/变更设备的唯一机制——无需重启进程。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::domain::repository::DeviceRegistry;
use crate::domain::service::fleet_supervisor::FleetSupervisor;

pub struct RegistryWatcher {
    registry: Arc<dyn DeviceRegistry>,
    supervisor: FleetSupervisor,
    refresh_interval: Duration,
}

impl RegistryWatcher {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        supervisor: FleetSupervisor,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            refresh_interval,
        }
    }

    /// 运行监视循环直到收到停止信号
    ///
    /// 首个 tick 立即触发，承担启动时的首次设备装载；
    /// 清单读取失败只告警跳过，下一轮重试。
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match self.registry.list_enabled().await {
                        Ok(fresh) => self.supervisor.reconcile(fresh).await,
                        Err(e) => {
                            warn!(error = %e, "Failed to read device registry");
                        }
                    }
                }
            }
        }
    }
}
