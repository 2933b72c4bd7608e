//! Wire 风格的依赖注入模块
//!
//! 类似 Go 的 Wire 框架，提供简单的依赖构建方法

use std::sync::Arc;

use anyhow::{Context, Result};
use mongodb::Client;

use crate::config::SyncConfig;
use crate::domain::repository::{AttendanceSink, DeviceRegistry, OrganizationDirectory, TransportFactory};
use crate::domain::service::{FleetSupervisor, RegistryWatcher, SessionTuning, SupervisorConfig};
use crate::infrastructure::persistence::{
    MongoAttendanceSink, MongoDeviceRegistry, MongoOrganizationDirectory,
};
use crate::infrastructure::transport::ZkTransportFactory;

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub client: Client,
    pub supervisor: FleetSupervisor,
    pub watcher: RegistryWatcher,
}

/// 构建应用上下文
///
/// 类似 Go Wire 的 Initialize 函数，按照依赖顺序构建所有组件
pub async fn initialize(config: &SyncConfig) -> Result<ApplicationContext> {
    // 1. 创建 MongoDB 客户端；连不上配置库则无事可做，直接失败
    let client = Client::with_uri_str(&config.mongodb_uri)
        .await
        .context("Failed to connect to MongoDB")?;
    let db = client.database(&config.mongodb_db);

    // 2. 创建设备注册表仓储
    let registry: Arc<dyn DeviceRegistry> =
        Arc::new(MongoDeviceRegistry::new(&db, &config.devices_collection));

    // 3. 创建组织目录仓储
    let organizations: Arc<dyn OrganizationDirectory> =
        Arc::new(MongoOrganizationDirectory::new(&db, &config.hostels_collection));

    // 4. 创建考勤落库通道
    let sink: Arc<dyn AttendanceSink> =
        Arc::new(MongoAttendanceSink::new(db, organizations));

    // 5. 创建设备传输工厂
    let transports: Arc<dyn TransportFactory> = Arc::new(ZkTransportFactory);

    // 6. 构建舰队监督者
    let supervisor = FleetSupervisor::new(
        registry.clone(),
        sink,
        transports,
        SupervisorConfig {
            tuning: SessionTuning {
                poll_interval: config.poll_interval,
                connect_timeout: config.connect_timeout,
                io_timeout: config.io_timeout,
            },
            probe_interval: config.reconnect_probe_interval,
        },
    );

    // 7. 构建注册表监视器
    let watcher = RegistryWatcher::new(registry, supervisor.clone(), config.device_list_interval);

    Ok(ApplicationContext {
        client,
        supervisor,
        watcher,
    })
}
