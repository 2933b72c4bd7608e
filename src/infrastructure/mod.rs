//! 基础设施层：MongoDB 持久化与设备传输适配器

pub mod persistence;
pub mod transport;
