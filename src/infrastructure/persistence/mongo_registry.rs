//! 设备注册表与组织目录的 MongoDB 实现
//!
//! 注册表文档由外部管理界面增删改；引擎只读配置字段，
//! 仅回写 online/syncing/lastSeen 三个状态字段。

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use futures::stream::TryStreamExt;
use mongodb::{Collection, Database};
use tracing::debug;

use crate::domain::model::{DeviceConfig, DeviceStatus};
use crate::domain::repository::{DeviceRegistry, OrganizationDirectory};
use crate::error::Result;

const DEFAULT_DEVICE_PORT: u16 = 4370;

pub struct MongoDeviceRegistry {
    devices: Collection<Document>,
}

impl MongoDeviceRegistry {
    pub fn new(db: &Database, collection: &str) -> Self {
        Self {
            devices: db.collection::<Document>(collection),
        }
    }

    /// 注册表文档 → 设备配置；字段缺失走默认值，主机缺失的文档跳过
    fn parse_device(doc: &Document) -> Option<DeviceConfig> {
        let id = doc.get("_id").map(id_to_string)?;
        let host = doc
            .get_str("ip")
            .or_else(|_| doc.get_str("host"))
            .ok()?
            .to_string();
        if host.is_empty() {
            return None;
        }

        let port = numeric_field(doc, "port")
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_DEVICE_PORT);
        let comm_key = numeric_field(doc, "commKey")
            .and_then(|k| u32::try_from(k).ok())
            .unwrap_or(0);
        let enabled = doc.get_bool("enabled").unwrap_or(true);
        let hostel_id = doc.get("hostelId").map(id_to_string).filter(|s| !s.is_empty());

        Some(DeviceConfig {
            id,
            hostel_id,
            host,
            port,
            comm_key,
            enabled,
        })
    }
}

#[async_trait]
impl DeviceRegistry for MongoDeviceRegistry {
    async fn list_enabled(&self) -> Result<Vec<DeviceConfig>> {
        let mut cursor = self
            .devices
            .find(doc! { "enabled": { "$ne": false } }, None)
            .await?;

        let mut devices = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            match Self::parse_device(&doc) {
                Some(device) => devices.push(device),
                None => debug!(?doc, "Skipping malformed device document"),
            }
        }
        Ok(devices)
    }

    async fn update_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        let mut set = doc! {
            "online": status.online,
            "syncing": status.syncing,
        };
        if let Some(last_seen) = status.last_seen {
            set.insert("lastSeen", Bson::DateTime(last_seen.into()));
        }

        self.devices
            .update_one(doc! { "_id": id_filter(device_id) }, doc! { "$set": set }, None)
            .await?;
        Ok(())
    }
}

/// 组织目录：组织引用 → 展示名（用于推导考勤集合名）
pub struct MongoOrganizationDirectory {
    hostels: Collection<Document>,
}

impl MongoOrganizationDirectory {
    pub fn new(db: &Database, collection: &str) -> Self {
        Self {
            hostels: db.collection::<Document>(collection),
        }
    }
}

#[async_trait]
impl OrganizationDirectory for MongoOrganizationDirectory {
    async fn organization_name(&self, org_ref: &str) -> Result<Option<String>> {
        let found = self
            .hostels
            .find_one(doc! { "_id": id_filter(org_ref) }, None)
            .await?;
        Ok(found
            .and_then(|doc| doc.get_str("name").ok().map(str::to_owned))
            .filter(|name| !name.is_empty()))
    }
}

/// `_id` 可能是 ObjectId 也可能是纯字符串，统一成字符串形式
fn id_to_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 反向：字符串形式的标识还原为查询条件
fn id_filter(id: &str) -> Bson {
    match ObjectId::parse_str(id) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(id.to_string()),
    }
}

fn numeric_field(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        Bson::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_with_defaults() {
        let doc = doc! { "_id": "d1", "ip": "192.168.1.250" };
        let device = MongoDeviceRegistry::parse_device(&doc).unwrap();
        assert_eq!(device.port, 4370);
        assert_eq!(device.comm_key, 0);
        assert!(device.enabled);
        assert!(device.hostel_id.is_none());
    }

    #[test]
    fn parses_device_with_explicit_fields() {
        let oid = ObjectId::new();
        let doc = doc! {
            "_id": oid,
            "hostelId": "h9",
            "ip": "10.0.0.5",
            "port": 4371_i32,
            "commKey": 7_i32,
            "enabled": false,
        };
        let device = MongoDeviceRegistry::parse_device(&doc).unwrap();
        assert_eq!(device.id, oid.to_hex());
        assert_eq!(device.hostel_id.as_deref(), Some("h9"));
        assert_eq!(device.port, 4371);
        assert_eq!(device.comm_key, 7);
        assert!(!device.enabled);
    }

    #[test]
    fn skips_document_without_host() {
        let doc = doc! { "_id": "d1", "enabled": true };
        assert!(MongoDeviceRegistry::parse_device(&doc).is_none());
    }

    #[test]
    fn id_round_trip() {
        let oid = ObjectId::new();
        assert_eq!(id_filter(&oid.to_hex()), Bson::ObjectId(oid));
        assert_eq!(id_filter("plain"), Bson::String("plain".into()));
    }
}
