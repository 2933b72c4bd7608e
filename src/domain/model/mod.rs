//! 领域模型定义
//!
//! 设备配置来自注册表（引擎只读），状态字段由引擎回写；
//! 考勤事件一经落库不再更新或删除。

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};

/// 设备配置实体（注册表中的一条文档，引擎只读）
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    /// 注册表主键的字符串形式
    pub id: String,
    /// 所属组织引用（宿舍/园区），缺失时落入默认集合
    pub hostel_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub comm_key: u32,
    pub enabled: bool,
}

impl DeviceConfig {
    /// 配置签名：对账时据此判断设备是否需要重启会话
    pub fn config_signature(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.host,
            self.port,
            self.comm_key,
            self.enabled,
            self.hostel_id.as_deref().unwrap_or("")
        )
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 引擎回写的设备运行状态（注册表中仅这些字段归引擎所有）
#[derive(Clone, Copy, Debug)]
pub struct DeviceStatus {
    pub online: bool,
    pub syncing: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceStatus {
    pub fn online(syncing: bool) -> Self {
        Self {
            online: true,
            syncing,
            last_seen: Some(Utc::now()),
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            syncing: false,
            last_seen: None,
        }
    }
}

/// 打卡方向，由 punch 码映射而来
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "In",
            Direction::Out => "Out",
            Direction::Unknown => "unknown",
        }
    }
}

/// 规范化后的考勤事件（落库单位）
///
/// 去重键：(device_host, subject_id, instant_utc)
#[derive(Clone, Debug)]
pub struct AttendanceEvent {
    pub device_host: String,
    pub device_port: u16,
    /// 解析出的外部用户标识，无法解析时为字面量 "unknown"
    pub subject_id: String,
    pub display_name: String,
    /// 规范 UTC 时刻
    pub instant_utc: DateTime<Utc>,
    /// 设备本地时间原样渲染（"YYYY-MM-DD HH:MM:SS"），下游按日逻辑依赖它
    pub raw_timestamp: String,
    /// 原始 punch 码，解析失败时为 None
    pub punch: Option<i64>,
    pub direction: Direction,
    pub ingested_at: DateTime<Utc>,
}

/// 设备原始时间戳的两种来源形态
#[derive(Clone, Debug)]
pub enum RawTimestamp {
    /// 设备按本地时钟给出的朴素时间
    Instant(NaiveDateTime),
    /// 字符串形态（固件差异），解析失败时回退为摄取时刻
    Text(String),
}

/// 设备原始 punch 码的两种来源形态
#[derive(Clone, Debug)]
pub enum RawPunch {
    Code(i64),
    /// "in"/"out"/"checkin"/"checkout" 或数字文本
    Text(String),
}

/// 一条未经规范化的设备考勤记录
///
/// 不同固件/SDK 的字段名各不相同，这里按优先级把候选字段都建成可选项，
/// 规范化时逐个尝试。
#[derive(Clone, Debug, Default)]
pub struct RawRecord {
    /// 外部用户标识（如 "PSI00004"），优先级最高
    pub user_id: Option<String>,
    /// 设备本地数字句柄
    pub device_user_id: Option<String>,
    pub card_no: Option<String>,
    pub pin: Option<String>,
    /// 序号，需经目录缓存解析为外部标识
    pub sn: Option<u32>,
    pub timestamp: Option<RawTimestamp>,
    pub punch: Option<RawPunch>,
    /// 记录内嵌的姓名（部分固件携带）
    pub name: Option<String>,
}

/// 设备用户目录的一条原始条目
#[derive(Clone, Debug, Default)]
pub struct RawUser {
    pub uid: Option<u32>,
    pub user_id: Option<String>,
    pub card_no: Option<String>,
    pub pin: Option<String>,
    pub user_sn: Option<u32>,
    pub name: Option<String>,
}

/// 目录缓存解析出的主体
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    pub subject_id: String,
    pub display_name: String,
}

/// 每会话的设备用户目录缓存
///
/// 把每个观察到的标识变体（数字句柄、卡号、PIN、序号）都指向同一个
/// 外部主体；会话（重）启动时整体重建，仅存在于内存。
#[derive(Clone, Debug, Default)]
pub struct DirectoryCache {
    by_id: HashMap<String, DirectoryEntry>,
    by_sn: HashMap<u32, DirectoryEntry>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一条用户目录条目，容忍任意字段缺失
    pub fn register(&mut self, user: &RawUser) {
        let subject_id = user
            .user_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .or_else(|| user.uid.map(|u| u.to_string()))
            .or_else(|| user.pin.clone().filter(|s| !s.is_empty()));

        let Some(subject_id) = subject_id else {
            return;
        };

        let display_name = user
            .name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("User {subject_id}"));

        let entry = DirectoryEntry {
            subject_id: subject_id.clone(),
            display_name,
        };

        let mut variants: Vec<String> = vec![subject_id];
        if let Some(uid) = user.uid {
            variants.push(uid.to_string());
        }
        for v in [&user.card_no, &user.pin] {
            if let Some(v) = v.as_deref().filter(|s| !s.is_empty()) {
                variants.push(v.to_owned());
            }
        }
        for v in variants {
            self.by_id.insert(v, entry.clone());
        }

        // 序号既按 uid 也按 userSn 建索引：考勤记录里的 sn 两者都可能对应
        if let Some(uid) = user.uid {
            self.by_sn.insert(uid, entry.clone());
        }
        if let Some(sn) = user.user_sn {
            self.by_sn.insert(sn, entry);
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&DirectoryEntry> {
        self.by_id.get(id)
    }

    pub fn lookup_sn(&self, sn: u32) -> Option<&DirectoryEntry> {
        self.by_sn.get(&sn)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
