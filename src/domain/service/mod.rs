//! 领域服务：设备会话、机群监督者、注册表监视器

pub mod device_session;
pub mod fleet_supervisor;
pub mod registry_watcher;

pub use device_session::{DeviceSession, SessionExit, SessionTuning};
pub use fleet_supervisor::{FleetSupervisor, SupervisorConfig};
pub use registry_watcher::RegistryWatcher;
