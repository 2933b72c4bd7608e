//! 考勤事件落库的 MongoDB 实现
//!
//! 每个组织一个集合（展示名清洗后加固定后缀），集合内由
//! (device_ip, user_id, timestamp_utc) 唯一索引保证幂等；
//! 组织解析失败时落入共享默认集合——摄取永远不因映射缺失而阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::model::AttendanceEvent;
use crate::domain::repository::{AttendanceSink, InsertOutcome, OrganizationDirectory};
use crate::error::Result;

const COLLECTION_SUFFIX: &str = "_attendance_logs";
const DEFAULT_COLLECTION: &str = "default_attendance_logs";
const UNIQUE_INDEX_NAME: &str = "uniq_device_user_ts";
const DUPLICATE_KEY_CODE: i32 = 11000;

pub struct MongoAttendanceSink {
    db: Database,
    organizations: Arc<dyn OrganizationDirectory>,
    /// 组织引用 → 已确保唯一索引的集合名
    prepared: Mutex<HashMap<String, String>>,
}

impl MongoAttendanceSink {
    pub fn new(db: Database, organizations: Arc<dyn OrganizationDirectory>) -> Self {
        Self {
            db,
            organizations,
            prepared: Mutex::new(HashMap::new()),
        }
    }

    /// 解析组织对应的集合并确保唯一索引存在（每组织仅做一次）
    async fn collection_for(&self, org_ref: Option<&str>) -> Collection<Document> {
        let cache_key = org_ref.unwrap_or("").to_string();

        {
            let prepared = self.prepared.lock().await;
            if let Some(name) = prepared.get(&cache_key) {
                return self.db.collection::<Document>(name);
            }
        }

        let name = self.resolve_collection_name(org_ref).await;
        let collection = self.db.collection::<Document>(&name);
        self.ensure_unique_index(&collection).await;

        self.prepared.lock().await.insert(cache_key, name);
        collection
    }

    async fn resolve_collection_name(&self, org_ref: Option<&str>) -> String {
        let Some(org_ref) = org_ref else {
            debug!("Device has no organization reference, using default collection");
            return DEFAULT_COLLECTION.to_string();
        };

        match self.organizations.organization_name(org_ref).await {
            Ok(Some(display_name)) => {
                format!("{}{}", sanitize_organization_name(&display_name), COLLECTION_SUFFIX)
            }
            Ok(None) => {
                warn!(org = %org_ref, "Organization not found, using default collection");
                DEFAULT_COLLECTION.to_string()
            }
            Err(e) => {
                warn!(org = %org_ref, error = %e, "Organization lookup failed, using default collection");
                DEFAULT_COLLECTION.to_string()
            }
        }
    }

    /// 建唯一索引是幂等的；已存在或建失败都不阻塞摄取
    async fn ensure_unique_index(&self, collection: &Collection<Document>) {
        let model = IndexModel::builder()
            .keys(doc! { "device_ip": 1, "user_id": 1, "timestamp_utc": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name(UNIQUE_INDEX_NAME.to_string())
                    .build(),
            )
            .build();

        match collection.create_index(model, None).await {
            Ok(_) => {
                info!(collection = %collection.name(), "Unique attendance index ensured");
            }
            Err(e) => {
                // IndexOptionsConflict 等同已存在
                debug!(collection = %collection.name(), error = %e, "Unique index creation skipped");
            }
        }
    }
}

#[async_trait]
impl AttendanceSink for MongoAttendanceSink {
    async fn insert(&self, org_ref: Option<&str>, event: &AttendanceEvent) -> Result<InsertOutcome> {
        let collection = self.collection_for(org_ref).await;

        let doc = doc! {
            "device_ip": &event.device_host,
            "device_port": event.device_port as i32,
            "user_id": &event.subject_id,
            "user_name": &event.display_name,
            "timestamp_utc": instant_string(event.instant_utc),
            "punch": event.punch,
            "event_type": event.direction.as_str(),
            "raw": doc! {
                "timestamp": &event.raw_timestamp,
                "punch": event.punch,
            },
            "ingested_at_utc": instant_string(event.ingested_at),
        };

        match collection.insert_one(doc, None).await {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn high_water(
        &self,
        org_ref: Option<&str>,
        device_host: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let collection = self.collection_for(org_ref).await;
        let options = FindOneOptions::builder()
            .sort(doc! { "timestamp_utc": -1 })
            .build();

        let latest = collection
            .find_one(doc! { "device_ip": device_host }, options)
            .await?;

        Ok(latest
            .and_then(|doc| doc.get_str("timestamp_utc").ok().map(str::to_owned))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

fn instant_string(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY_CODE
    )
}

/// 组织展示名 → 集合名片段：仅保留字母数字，其余替换为下划线
pub fn sanitize_organization_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
