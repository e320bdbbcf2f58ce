use ash::vk;

use crate::handles::CmdAllocatorHandle;
use crate::memory::GpuHeap;

/// command allocator 管理的三类内存
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmdAllocType {
    /// command 本身的数据
    CommandData = 0,
    /// 嵌入在 command stream 中的数据（例如 push constant 的备份）
    EmbeddedData = 1,
    /// GPU scratch memory
    GpuScratchMem = 2,
}

impl CmdAllocType {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::CommandData, Self::EmbeddedData, Self::GpuScratchMem];
}

/// 单类内存的 chunk 配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdAllocInfo {
    pub alloc_heap: GpuHeap,
    /// 每次向 HAL 申请的 chunk 大小
    pub alloc_size: u64,
    /// chunk 内部的 sub allocation 粒度
    pub suballoc_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdAllocatorCreateInfo {
    /// reset 之后 chunk 可以被直接复用
    pub auto_memory_reuse: bool,
    /// pool 只会在单线程中使用，不需要追踪 chunk 是否 busy
    pub disable_busy_chunk_tracking: bool,
    /// 以 [`CmdAllocType`] 为索引
    pub alloc_info: [CmdAllocInfo; CmdAllocType::COUNT],
}

impl CmdAllocatorCreateInfo {
    #[inline]
    pub fn alloc_info(&self, ty: CmdAllocType) -> &CmdAllocInfo {
        &self.alloc_info[ty as usize]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HalCmdBufferCreateInfo {
    pub allocator: CmdAllocatorHandle,
    pub queue_family_index: u32,
    pub level: vk::CommandBufferLevel,
}
