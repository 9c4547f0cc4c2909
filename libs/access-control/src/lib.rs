pub mod access;
pub mod backend;
pub mod batch;
pub mod cache;
pub mod entity;
pub mod memory;
pub mod metrics;

pub use access::SecurityService;
pub use backend::AuthorizationBackend;
pub use batch::{BatchPermissionChecker, PreloadSettings, PreloadStats};
pub use cache::{
  CacheSettings, CacheStats, NoSharedCache, PermissionCache, RedisPermissionCache,
  SharedPermissionCache,
};
pub use entity::{
  BackendPermission, CombinePolicy, CompositePermission, Permission, PermissionCheck, Session,
};
pub use memory::{MemoryPressure, StaticMemoryPressure, SystemMemoryPressure};
pub use metrics::AccessControlMetrics;
