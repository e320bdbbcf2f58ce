//! mgpu driver 核心
//!
//! - [`cmd_pool::CmdPool`]：每个设备一个 command allocator，登记从中分配的 command buffer，
//!   追踪录制期间借出的 depth stencil state、host 内存和 stack allocator，并在 reset 时统一归还
//! - [`memory::AliasedAllocation`]：一个逻辑 memory 分配在 device group 中每对设备上的 HAL 对象，按需打开并保持 resident
//! - [`bind`]：资源绑定 memory 时选择每个设备使用的 memory instance
//!
//! 硬件相关的操作都通过 `mgpu_hal` 的 trait 完成。

pub mod bind;
pub mod cmd_buffer;
pub mod cmd_pool;
pub mod device;
pub mod error;
pub mod memory;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cmd_buffer::{CmdBuffer, CmdBufferKey, CmdBufferState};
pub use cmd_pool::{CmdPool, CmdPoolCreateInfo};
pub use device::{Device, DeviceCreateInfo};
pub use error::{IcdError, IcdResult};
pub use settings::RuntimeSettings;
