//! MongoDB 持久化适配器

pub mod mongo_registry;
pub mod mongo_sink;

pub use mongo_registry::{MongoDeviceRegistry, MongoOrganizationDirectory};
pub use mongo_sink::MongoAttendanceSink;
