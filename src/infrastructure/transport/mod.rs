//! 设备传输适配器
//!
//! 每个固件族一个适配器，统一挂在 [`crate::domain::repository::DeviceTransport`]
//! 后面；由工厂在会话构造时选定，不在调用点做能力探测。

pub mod zkteco;

pub use zkteco::{ZkTransport, ZkTransportFactory};
