//! multi-GPU 下的 memory 分配
//!
//! - [`aliased::AliasedAllocation`]：一个逻辑分配在每对 (资源所在设备, 内存来源设备) 上的 HAL 对象矩阵
//! - [`priority::MemoryPriority`]：配置值、`VkMemoryPriorityAllocateInfoEXT` 与 HAL 优先级之间的转换

pub mod aliased;
pub mod priority;

pub use aliased::{AliasedAllocation, MemoryAllocateInfo};
pub use priority::MemoryPriority;
