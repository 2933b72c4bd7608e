//! HMS 设备同步引擎
//!
//! 维护与多台考勤打卡设备的长连接，将实时推送事件与轮询快照合并、
//! 幂等去重后写入按组织划分的 MongoDB 集合。注册表热更新时自动
//! 启停对应的设备会话，连接断开后自动探测重连。

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod service;
