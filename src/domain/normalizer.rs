//! 打卡记录规范化
//!
//! 把形态各异的设备原始记录转换为规范考勤事件：标识按候选链解析、
//! 时间戳强制为 UTC 并保留设备本地渲染、punch 码映射为方向。
//! 纯函数，无任何副作用；宁可带着 "unknown" 落库也不丢弃记录。

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::domain::model::{
    AttendanceEvent, DeviceConfig, Direction, DirectoryCache, RawPunch, RawRecord, RawTimestamp,
};

/// 打入方向的 punch 码集合
const IN_PUNCHES: [i64; 3] = [0, 3, 4];
/// 打出方向的 punch 码集合
const OUT_PUNCHES: [i64; 3] = [1, 2, 5];

const RAW_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 把一条原始记录规范化为考勤事件
///
/// 时间戳解析失败时回退为当前时刻而不是让整批失败——设计上
/// 摄取完整性优先于严格校验。
pub fn normalize(record: &RawRecord, device: &DeviceConfig, directory: &DirectoryCache) -> AttendanceEvent {
    let ingested_at = Utc::now();
    let (instant_utc, raw_timestamp) = resolve_instant(record.timestamp.as_ref(), ingested_at);
    let punch = resolve_punch(record.punch.as_ref());
    let direction = direction_for(punch);
    let subject_id = resolve_subject_id(record, directory);
    let display_name = resolve_display_name(record, directory, &subject_id);

    AttendanceEvent {
        device_host: device.host.clone(),
        device_port: device.port,
        subject_id,
        display_name,
        instant_utc,
        raw_timestamp,
        punch,
        direction,
        ingested_at,
    }
}

/// 标识解析候选链：外部标识 → 设备句柄 → 卡号 → PIN → 序号（查目录）
///
/// 记录只带序号时，用会话目录缓存把序号映射回外部标识；记录携带的
/// 标识是纯数字（设备本地句柄）时同样优先用序号映射修正。
pub fn resolve_subject_id(record: &RawRecord, directory: &DirectoryCache) -> String {
    let literal = [
        &record.user_id,
        &record.device_user_id,
        &record.card_no,
        &record.pin,
    ]
    .into_iter()
    .find_map(|f| f.as_deref().filter(|s| !s.is_empty()).map(str::to_owned));

    if let Some(sn) = record.sn {
        if let Some(entry) = directory.lookup_sn(sn) {
            // 记录本身没带标识，或带的只是数字句柄，都以目录解析结果为准
            let keep_literal = literal
                .as_deref()
                .is_some_and(|s| !s.chars().all(|c| c.is_ascii_digit()));
            if !keep_literal {
                return entry.subject_id.clone();
            }
        }
    }

    if let Some(id) = literal {
        // 数字句柄可能在目录里登记过外部标识
        if let Some(entry) = directory.lookup(&id) {
            return entry.subject_id.clone();
        }
        return id;
    }

    "unknown".to_string()
}

fn resolve_display_name(record: &RawRecord, directory: &DirectoryCache, subject_id: &str) -> String {
    if let Some(entry) = directory.lookup(subject_id) {
        return entry.display_name.clone();
    }
    record
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("User {subject_id}"))
}

/// 时间戳解析：返回规范 UTC 时刻与设备本地渲染
///
/// 设备给出的是无时区的本地时间，按 UTC 解读以保持确定性；
/// `raw` 字符串不重定时区，下游"迟到/跨日"逻辑依赖本地渲染。
pub fn resolve_instant(
    raw: Option<&RawTimestamp>,
    fallback: DateTime<Utc>,
) -> (DateTime<Utc>, String) {
    let naive = match raw {
        Some(RawTimestamp::Instant(naive)) => Some(*naive),
        Some(RawTimestamp::Text(text)) => parse_text_timestamp(text),
        None => None,
    };

    match naive {
        Some(naive) => (
            Utc.from_utc_datetime(&naive),
            naive.format(RAW_TIMESTAMP_FORMAT).to_string(),
        ),
        None => (
            fallback,
            fallback.naive_utc().format(RAW_TIMESTAMP_FORMAT).to_string(),
        ),
    }
}

fn parse_text_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, RAW_TIMESTAMP_FORMAT) {
        return Some(naive);
    }
    // ISO 8601 形态（带 T 或带时区偏移）
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").ok()
}

/// punch 码解析：数字直接用，文本按大小写不敏感的语义词或数字文本处理
pub fn resolve_punch(raw: Option<&RawPunch>) -> Option<i64> {
    match raw {
        Some(RawPunch::Code(code)) => Some(*code),
        Some(RawPunch::Text(text)) => {
            let s = text.trim().to_ascii_lowercase();
            if s.is_empty() || s == "null" {
                return None;
            }
            // "checkin" 也含 "in"，顺序无碍；先语义词后数字文本
            if s.contains("out") {
                return Some(1);
            }
            if s.contains("in") {
                return Some(0);
            }
            s.parse::<i64>().ok()
        }
        None => None,
    }
}

/// 方向映射：{0,3,4} 打入，{1,2,5} 打出，其余（含缺失）未知
pub fn direction_for(punch: Option<i64>) -> Direction {
    match punch {
        Some(code) if IN_PUNCHES.contains(&code) => Direction::In,
        Some(code) if OUT_PUNCHES.contains(&code) => Direction::Out,
        _ => Direction::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn device() -> DeviceConfig {
        DeviceConfig {
            id: "d1".into(),
            hostel_id: None,
            host: "192.168.1.250".into(),
            port: 4370,
            comm_key: 0,
            enabled: true,
        }
    }

    fn naive(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn direction_mapping_covers_all_codes() {
        for code in [0, 3, 4] {
            assert_eq!(direction_for(Some(code)), Direction::In);
        }
        for code in [1, 2, 5] {
            assert_eq!(direction_for(Some(code)), Direction::Out);
        }
        for code in [6, 7, 99, -1] {
            assert_eq!(direction_for(Some(code)), Direction::Unknown);
        }
        assert_eq!(direction_for(None), Direction::Unknown);
    }

    #[test]
    fn punch_text_forms_coerce() {
        assert_eq!(resolve_punch(Some(&RawPunch::Text("CheckIn".into()))), Some(0));
        assert_eq!(resolve_punch(Some(&RawPunch::Text("checkout".into()))), Some(1));
        assert_eq!(resolve_punch(Some(&RawPunch::Text("OUT".into()))), Some(1));
        assert_eq!(resolve_punch(Some(&RawPunch::Text("4".into()))), Some(4));
        assert_eq!(resolve_punch(Some(&RawPunch::Text("null".into()))), None);
        assert_eq!(resolve_punch(Some(&RawPunch::Text("garbage".into()))), None);
    }

    #[test]
    fn sequence_number_resolves_through_directory() {
        let mut directory = DirectoryCache::new();
        directory.register(&crate::domain::model::RawUser {
            uid: Some(7),
            user_id: Some("PSI00004".into()),
            name: Some("Ravi".into()),
            ..Default::default()
        });

        // 只带序号
        let record = RawRecord {
            sn: Some(7),
            ..Default::default()
        };
        assert_eq!(resolve_subject_id(&record, &directory), "PSI00004");

        // 带数字句柄 + 序号：目录解析胜出，而不是原始序号
        let record = RawRecord {
            device_user_id: Some("7".into()),
            sn: Some(7),
            ..Default::default()
        };
        assert_eq!(resolve_subject_id(&record, &directory), "PSI00004");

        // 已带非数字外部标识时不被序号覆盖
        let record = RawRecord {
            user_id: Some("PSI00009".into()),
            sn: Some(7),
            ..Default::default()
        };
        assert_eq!(resolve_subject_id(&record, &directory), "PSI00009");
    }

    #[test]
    fn unresolvable_identity_falls_back_to_unknown() {
        let record = RawRecord::default();
        let event = normalize(&record, &device(), &DirectoryCache::new());
        assert_eq!(event.subject_id, "unknown");
        assert_eq!(event.display_name, "User unknown");
        assert_eq!(event.direction, Direction::Unknown);
    }

    #[test]
    fn timestamp_preserves_local_rendering() {
        let record = RawRecord {
            user_id: Some("PSI00004".into()),
            timestamp: Some(RawTimestamp::Instant(naive(8, 5, 9))),
            punch: Some(RawPunch::Code(0)),
            ..Default::default()
        };
        let event = normalize(&record, &device(), &DirectoryCache::new());
        assert_eq!(event.raw_timestamp, "2025-03-14 08:05:09");
        assert_eq!(event.instant_utc.timestamp(), Utc.from_utc_datetime(&naive(8, 5, 9)).timestamp());
    }

    #[test]
    fn malformed_timestamp_defaults_to_ingestion_instant() {
        let record = RawRecord {
            user_id: Some("PSI00004".into()),
            timestamp: Some(RawTimestamp::Text("not a date".into())),
            ..Default::default()
        };
        let before = Utc::now();
        let event = normalize(&record, &device(), &DirectoryCache::new());
        assert!(event.instant_utc >= before);
        assert!(!event.raw_timestamp.is_empty());
    }

    #[test]
    fn text_timestamp_forms_parse() {
        let (dt, raw) = resolve_instant(
            Some(&RawTimestamp::Text("2025-03-14 08:05:09".into())),
            Utc::now(),
        );
        assert_eq!(raw, "2025-03-14 08:05:09");
        assert_eq!(dt, Utc.from_utc_datetime(&naive(8, 5, 9)));

        let (dt, _) = resolve_instant(
            Some(&RawTimestamp::Text("2025-03-14T08:05:09+00:00".into())),
            Utc::now(),
        );
        assert_eq!(dt, Utc.from_utc_datetime(&naive(8, 5, 9)));
    }

    /// 固件返回 punch 码 [0,1,0]、主体 "7"、目录映射 "7"→"PSI00004" 的场景
    #[test]
    fn example_scenario_three_punches() {
        let mut directory = DirectoryCache::new();
        directory.register(&crate::domain::model::RawUser {
            uid: Some(7),
            user_id: Some("PSI00004".into()),
            name: Some("Ravi".into()),
            ..Default::default()
        });

        let timestamps = [naive(8, 0, 0), naive(12, 0, 0), naive(18, 0, 0)];
        let punches = [0i64, 1, 0];
        let expected = [Direction::In, Direction::Out, Direction::In];

        let mut high_water: Option<DateTime<Utc>> = None;
        for i in 0..3 {
            let record = RawRecord {
                device_user_id: Some("7".into()),
                sn: Some(7),
                timestamp: Some(RawTimestamp::Instant(timestamps[i])),
                punch: Some(RawPunch::Code(punches[i])),
                ..Default::default()
            };
            let event = normalize(&record, &device(), &directory);
            assert_eq!(event.subject_id, "PSI00004");
            assert_eq!(event.direction, expected[i]);
            if high_water.map_or(true, |hw| event.instant_utc > hw) {
                high_water = Some(event.instant_utc);
            }
        }
        assert_eq!(high_water, Some(Utc.from_utc_datetime(&naive(18, 0, 0))));
    }
}
