use crate::cmd::{CmdAllocatorCreateInfo, HalCmdBufferCreateInfo};
use crate::error::HalResult;
use crate::handles::{CmdAllocatorHandle, ExternalHandle, GpuMemoryHandle, HalCmdBufferHandle, HostBlock};
use crate::memory::{
    ExternalGpuMemoryOpenInfo, GpuMemPriority, GpuMemoryCreateInfo, GpuMemoryDesc, OpenedExternalMemory,
    PinnedGpuMemoryCreateInfo,
};

/// 单个物理设备的 HAL 接口
///
/// driver 核心对硬件的所有操作都经过这个 trait。实现者需要保证线程安全：
/// 同一个 memory 对象的 priority 可能在多个线程中被同时提升。
pub trait HalDevice: Send + Sync {
    // --- command allocator ---

    fn create_cmd_allocator(&self, info: &CmdAllocatorCreateInfo) -> HalResult<CmdAllocatorHandle>;

    /// 将 allocator 中所有 chunk 标记为未使用，从中分配的 command buffer 随之失效
    fn reset_cmd_allocator(&self, allocator: CmdAllocatorHandle) -> HalResult<()>;

    fn destroy_cmd_allocator(&self, allocator: CmdAllocatorHandle);

    // --- command buffer ---

    fn create_cmd_buffer(&self, info: &HalCmdBufferCreateInfo) -> HalResult<HalCmdBufferHandle>;

    fn begin_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle) -> HalResult<()>;

    fn end_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle) -> HalResult<()>;

    fn reset_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle) -> HalResult<()>;

    fn destroy_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle);

    // --- gpu memory ---

    fn create_gpu_memory(&self, info: &GpuMemoryCreateInfo) -> HalResult<GpuMemoryHandle>;

    /// pinned memory 所需的 host 侧对象大小，失败说明 host 地址不可用
    fn pinned_gpu_memory_size(&self, info: &PinnedGpuMemoryCreateInfo) -> HalResult<usize>;

    fn create_pinned_gpu_memory(&self, info: &PinnedGpuMemoryCreateInfo) -> HalResult<GpuMemoryHandle>;

    fn open_external_gpu_memory(&self, info: &ExternalGpuMemoryOpenInfo) -> HalResult<OpenedExternalMemory>;

    /// 导入成功后 handle 的所有权属于 driver，释放内存时需要归还
    fn release_external_handle(&self, handle: ExternalHandle);

    fn export_external_handle(&self, memory: GpuMemoryHandle) -> HalResult<ExternalHandle>;

    fn destroy_gpu_memory(&self, memory: GpuMemoryHandle);

    fn gpu_memory_desc(&self, memory: GpuMemoryHandle) -> GpuMemoryDesc;

    fn set_gpu_memory_priority(&self, memory: GpuMemoryHandle, priority: GpuMemPriority, offset: u32) -> HalResult<()>;

    /// 返回映射后的 host 地址
    fn map_gpu_memory(&self, memory: GpuMemoryHandle) -> HalResult<u64>;

    fn unmap_gpu_memory(&self, memory: GpuMemoryHandle) -> HalResult<()>;

    // --- peer / shared view ---

    /// 在本设备上打开 `original`（位于同一 linked group 另一设备的 local heap）所需的 host 存储大小
    fn peer_gpu_memory_size(&self, original: GpuMemoryHandle) -> HalResult<usize>;

    /// 在本设备上打开 `shared`（位于 system memory heap）所需的 host 存储大小
    fn shared_gpu_memory_size(&self, shared: GpuMemoryHandle) -> HalResult<usize>;

    /// 在 `storage` 中构造 peer view
    fn open_peer_gpu_memory(&self, original: GpuMemoryHandle, storage: HostBlock) -> HalResult<GpuMemoryHandle>;

    /// 在 `storage` 中构造 shared view
    fn open_shared_gpu_memory(&self, shared: GpuMemoryHandle, storage: HostBlock) -> HalResult<GpuMemoryHandle>;

    // --- residency ---

    /// 加入本设备的 residency list，引用期间不会被换出
    fn add_residency_reference(&self, memory: GpuMemoryHandle) -> HalResult<()>;

    fn remove_residency_reference(&self, memory: GpuMemoryHandle);
}
