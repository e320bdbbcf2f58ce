use ash::vk;

use crate::error::HalResult;
use crate::handles::{HostBlock, StackAllocatorHandle};

/// instance 级别的 host 内存分配器
pub trait HostAllocator: Send + Sync {
    /// 分配失败返回 `None`
    fn alloc(&self, size: usize, scope: vk::SystemAllocationScope) -> Option<HostBlock>;

    fn free(&self, block: HostBlock);
}

/// 管理 scratch 用的 virtual stack allocator
pub trait StackAllocatorManager: Send + Sync {
    fn acquire_allocator(&self) -> HalResult<StackAllocatorHandle>;

    fn release_allocator(&self, allocator: StackAllocatorHandle);
}
