//! 引擎配置模块
//!
//! 全部来自环境变量，带默认值；与宿主应用共用同一个 MongoDB 实例。

use std::env;
use std::time::Duration;

use anyhow::Result;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub mongodb_uri: String,
    pub mongodb_db: String,
    pub devices_collection: String,
    pub hostels_collection: String,
    /// 考勤日志轮询间隔
    pub poll_interval: Duration,
    /// 设备列表对账间隔（热添加/移除/变更）
    pub device_list_interval: Duration,
    /// 断线后的连通性探测间隔
    pub reconnect_probe_interval: Duration,
    /// 设备连接超时
    pub connect_timeout: Duration,
    /// 单次设备 I/O（拉取用户/考勤、启停设备）超时
    pub io_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let mongodb_uri = env::var("MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string());
        let mongodb_db = env::var("MONGODB_DB").unwrap_or_else(|_| "HMS".to_string());

        let devices_collection =
            env::var("DEVICES_COLLECTION").unwrap_or_else(|_| "devices".to_string());
        let hostels_collection =
            env::var("HOSTELS_COLLECTION").unwrap_or_else(|_| "hostels".to_string());

        let poll_interval = millis_from_env("ATTENDANCE_POLL_MS", 5000);
        let device_list_interval = millis_from_env("DEVICE_POLL_MS", 15_000);
        let reconnect_probe_interval = millis_from_env("RECONNECT_PROBE_MS", 10_000);
        let connect_timeout = millis_from_env("DEVICE_CONNECT_TIMEOUT_MS", 10_000);
        let io_timeout = millis_from_env("DEVICE_IO_TIMEOUT_MS", 10_000);

        Ok(Self {
            mongodb_uri,
            mongodb_db,
            devices_collection,
            hostels_collection,
            poll_interval,
            device_list_interval,
            reconnect_probe_interval,
            connect_timeout,
            io_timeout,
        })
    }
}

fn millis_from_env(key: &str, default_ms: u64) -> Duration {
    let ms = env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}
