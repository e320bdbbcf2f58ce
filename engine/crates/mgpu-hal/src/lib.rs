//! mgpu 的 HAL (Hardware Abstraction Layer) 边界
//!
//! driver 核心只通过这里定义的 trait 访问硬件：
//! - [`device::HalDevice`]：每个物理设备一个，负责 command allocator、gpu memory、peer/shared view 和 residency
//! - [`render_state::RenderStateCache`]：depth stencil 等 render state 的缓存
//! - [`host::HostAllocator`] / [`host::StackAllocatorManager`]：host 内存与 scratch stack allocator
//!
//! 所有对象都用不透明的 handle 表示，真正的对象生命周期由 HAL 实现负责。
//! 打开 `mock` feature 后，[`mock`] 模块提供一个会记录调用顺序的实现，用于测试。

pub mod cmd;
pub mod device;
pub mod error;
pub mod handles;
pub mod host;
pub mod memory;
pub mod render_state;

#[cfg(feature = "mock")]
pub mod mock;

pub use error::{HalError, HalResult};
pub use handles::{DEFAULT_DEVICE_INDEX, DeviceMask, MAX_DEVICES};
