//! 仓储与传输接口定义（Port）

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::domain::model::{AttendanceEvent, DeviceConfig, DeviceStatus, RawRecord, RawUser};
use crate::error::Result;

/// 设备注册表：引擎读取全部配置字段，只回写状态字段
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// 读取全部启用的设备
    async fn list_enabled(&self) -> Result<Vec<DeviceConfig>>;

    /// 回写单台设备的运行状态（online/syncing/lastSeen）
    async fn update_status(&self, device_id: &str, status: DeviceStatus) -> Result<()>;
}

/// 组织目录：组织引用 → 展示名，仅用于计算目标集合名
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn organization_name(&self, org_ref: &str) -> Result<Option<String>>;
}

/// 单条事件的落库结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// 重复键：快照/轮询/实时多路重叠下的正常稳态结果
    Duplicate,
}

/// 考勤事件落库端口
///
/// 幂等插入：唯一键 (device_host, subject_id, instant_utc) 冲突时
/// 返回 `Duplicate` 而非错误；其余失败向上传播、由会话按可重试处理。
#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn insert(&self, org_ref: Option<&str>, event: &AttendanceEvent) -> Result<InsertOutcome>;

    /// 某台设备已落库的最新事件时刻，用于会话重启时播种高水位
    async fn high_water(
        &self,
        org_ref: Option<&str>,
        device_host: &str,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// 物理设备传输层（把专有协议当作黑盒 SDK 边界）
///
/// 固件代际差异由适配器内部消化：一个固件族一个适配器，
/// 由 [`TransportFactory`] 在会话构造时选定。
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// 拉取设备用户目录
    async fn fetch_users(&self) -> Result<Vec<RawUser>>;

    /// 全量拉取考勤日志（快照与轮询共用）
    async fn fetch_attendance(&self) -> Result<Vec<RawRecord>>;

    /// 订阅实时打卡推送；不支持实时的固件返回 Err，轮询兜底
    async fn subscribe_realtime(&self) -> Result<mpsc::Receiver<RawRecord>>;

    /// 暂停设备本地操作（全量拉取期间 best-effort 使用）
    async fn enable(&self) -> Result<()>;

    async fn disable(&self) -> Result<()>;

    /// 连接突然断开的通知通道（套接字被拔线等）
    fn closed(&self) -> watch::Receiver<bool>;
}

/// 按设备配置选择并创建传输适配器
pub trait TransportFactory: Send + Sync {
    fn create(&self, device: &DeviceConfig) -> Arc<dyn DeviceTransport>;
}
