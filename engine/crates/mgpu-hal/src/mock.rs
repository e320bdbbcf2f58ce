//! 用于测试的 HAL 实现
//!
//! 所有 mock 对象共享同一份 [`MockState`]：
//! - 每次 HAL 调用都会按顺序追加一个 [`MockEvent`]，测试可以检查调用顺序
//! - 通过 [`MockPlatform::fail_next`] 注入一次性的失败
//! - 记录所有仍然存活的对象，测试结束时可以检查是否有泄漏

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::cmd::{CmdAllocatorCreateInfo, HalCmdBufferCreateInfo};
use crate::device::HalDevice;
use crate::error::{HalError, HalResult};
use crate::handles::{
    CmdAllocatorHandle, DepthStencilStateHandle, ExternalHandle, GpuMemoryHandle, HalCmdBufferHandle, HostBlock,
    MAX_DEVICES, StackAllocatorHandle,
};
use crate::host::{HostAllocator, StackAllocatorManager};
use crate::memory::{
    ExternalGpuMemoryOpenInfo, GpuHeap, GpuMemPriority, GpuMemoryCreateInfo, GpuMemoryDesc, GpuMemoryFlags,
    OpenedExternalMemory, PinnedGpuMemoryCreateInfo,
};
use crate::render_state::{DepthStencilStateCreateInfo, DepthStencilStates, RenderStateCache};

/// peer / shared view 需要的 host 存储大小
pub const MOCK_VIEW_OBJECT_SIZE: usize = 256;
/// pinned memory 需要的 host 存储大小
pub const MOCK_PINNED_OBJECT_SIZE: usize = 128;
/// 第一个 gpu memory 的虚拟地址
pub const MOCK_VIRT_ADDR_BASE: u64 = 0x1_0000_0000;
const MOCK_VIRT_ADDR_GRANULARITY: u64 = 0x1_0000;

/// 测试使用的 heap 大小，以 [`GpuHeap`] 为索引
pub const MOCK_HEAP_SIZES: [vk::DeviceSize; GpuHeap::COUNT] = [256 << 20, 1 << 30, 4 << 30, 4 << 30];
pub const MOCK_BASE_ADDR_ALIGNMENT: vk::DeviceSize = 64 << 10;

/// 测试使用的 memory type 表，以 Vulkan memory type index 为索引：
/// 0: local visible, 1: invisible, 2: USWC, 3: cacheable, 4: protected, 5: device coherent
///
/// 每一项是 `(heap, property flags, multi-instance)`
pub fn mock_memory_types() -> Vec<(GpuHeap, vk::MemoryPropertyFlags, bool)> {
    use vk::MemoryPropertyFlags as F;

    vec![
        (GpuHeap::Local, F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT, true),
        (GpuHeap::Invisible, F::DEVICE_LOCAL, true),
        (GpuHeap::GartUswc, F::HOST_VISIBLE | F::HOST_COHERENT, false),
        (GpuHeap::GartCacheable, F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED, false),
        (GpuHeap::Invisible, F::DEVICE_LOCAL | F::PROTECTED, true),
        (
            GpuHeap::Local,
            F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT | F::DEVICE_COHERENT_AMD,
            true,
        ),
    ]
}

/// HAL 调用记录；`device` 是发生调用的设备序号
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEvent {
    CreateCmdAllocator { device: usize, allocator: CmdAllocatorHandle },
    ResetCmdAllocator { device: usize, allocator: CmdAllocatorHandle },
    DestroyCmdAllocator { device: usize, allocator: CmdAllocatorHandle },

    CreateCmdBuffer { device: usize, cmd_buffer: HalCmdBufferHandle },
    BeginCmdBuffer { device: usize, cmd_buffer: HalCmdBufferHandle },
    EndCmdBuffer { device: usize, cmd_buffer: HalCmdBufferHandle },
    ResetCmdBuffer { device: usize, cmd_buffer: HalCmdBufferHandle },
    DestroyCmdBuffer { device: usize, cmd_buffer: HalCmdBufferHandle },

    CreateGpuMemory { device: usize, memory: GpuMemoryHandle, heap: GpuHeap, flags: GpuMemoryFlags },
    CreatePinnedGpuMemory { device: usize, memory: GpuMemoryHandle },
    OpenExternalGpuMemory { device: usize, memory: GpuMemoryHandle },
    ReleaseExternalHandle { device: usize, handle: ExternalHandle },
    ExportExternalHandle { device: usize, memory: GpuMemoryHandle, handle: ExternalHandle },
    OpenPeerGpuMemory { device: usize, original: GpuMemoryHandle, view: GpuMemoryHandle, storage: HostBlock },
    OpenSharedGpuMemory { device: usize, shared: GpuMemoryHandle, view: GpuMemoryHandle, storage: HostBlock },
    DestroyGpuMemory { device: usize, memory: GpuMemoryHandle },
    SetGpuMemoryPriority { device: usize, memory: GpuMemoryHandle, priority: GpuMemPriority, offset: u32 },
    MapGpuMemory { device: usize, memory: GpuMemoryHandle },
    UnmapGpuMemory { device: usize, memory: GpuMemoryHandle },

    AddResidency { device: usize, memory: GpuMemoryHandle },
    RemoveResidency { device: usize, memory: GpuMemoryHandle },

    CreateDepthStencilState { states: DepthStencilStates },
    DestroyDepthStencilState { states: DepthStencilStates },

    HostAlloc { block: HostBlock, size: usize },
    HostFree { block: HostBlock },

    AcquireStackAllocator { allocator: StackAllocatorHandle },
    ReleaseStackAllocator { allocator: StackAllocatorHandle },
}

/// 可以注入失败的调用
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateCmdAllocator,
    ResetCmdAllocator,
    CreateCmdBuffer,
    BeginCmdBuffer,
    EndCmdBuffer,
    ResetCmdBuffer,
    CreateGpuMemory,
    PinnedGpuMemorySize,
    CreatePinnedGpuMemory,
    OpenExternalGpuMemory,
    ExportExternalHandle,
    ViewObjectSize,
    OpenView,
    SetGpuMemoryPriority,
    MapGpuMemory,
    AddResidency,
    CreateDepthStencilState,
    /// host 分配失败时返回 `None`，注入的错误被忽略
    HostAlloc,
    AcquireStackAllocator,
}

#[derive(Clone, Copy, Debug)]
struct PendingFailure {
    point: FailPoint,
    /// `None` 表示任意设备
    device: Option<usize>,
    error: HalError,
}

#[derive(Clone, Copy, Debug)]
struct MockMemory {
    device: usize,
    desc: GpuMemoryDesc,
    priority: GpuMemPriority,
    priority_offset: u32,
    mapped: bool,
}

#[derive(Default)]
struct MockState {
    events: Vec<MockEvent>,
    next_handle: u64,
    next_virt_addr: u64,
    failures: Vec<PendingFailure>,

    cmd_allocators: HashMap<CmdAllocatorHandle, usize>,
    cmd_buffers: HashMap<HalCmdBufferHandle, usize>,
    memories: HashMap<GpuMemoryHandle, MockMemory>,
    residency: HashMap<(usize, GpuMemoryHandle), u32>,
    external_handles: HashSet<ExternalHandle>,

    depth_stencil_states: HashMap<DepthStencilStateCreateInfo, (DepthStencilStates, u32)>,
    host_blocks: HashMap<HostBlock, usize>,
    stack_allocators: HashSet<StackAllocatorHandle>,
}

impl MockState {
    fn new_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// 取出匹配的一次性失败
    fn take_failure(&mut self, point: FailPoint, device: Option<usize>) -> Option<HalError> {
        let idx = self.failures.iter().position(|f| {
            f.point == point && (f.device.is_none() || device.is_none() || f.device == device)
        })?;
        let failure = self.failures.remove(idx);
        log::debug!("mock: injected {:?} at {:?} on device {:?}", failure.error, point, device);
        Some(failure.error)
    }

    fn check(&mut self, point: FailPoint, device: Option<usize>) -> HalResult<()> {
        match self.take_failure(point, device) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn alloc_virt_addr(&mut self, size: vk::DeviceSize) -> u64 {
        if self.next_virt_addr == 0 {
            self.next_virt_addr = MOCK_VIRT_ADDR_BASE;
        }
        let addr = self.next_virt_addr;
        let span = size.max(1).div_ceil(MOCK_VIRT_ADDR_GRANULARITY) * MOCK_VIRT_ADDR_GRANULARITY;
        self.next_virt_addr += span;
        addr
    }

    fn new_memory(&mut self, device: usize, desc: GpuMemoryDesc, priority: GpuMemPriority, offset: u32) -> GpuMemoryHandle {
        let handle = GpuMemoryHandle(self.new_handle());
        self.memories.insert(
            handle,
            MockMemory {
                device,
                desc,
                priority,
                priority_offset: offset,
                mapped: false,
            },
        );
        handle
    }
}

type SharedState = Arc<Mutex<MockState>>;

/// 一个完整的 mock 平台：若干设备以及它们共享的 cache / allocator
pub struct MockPlatform {
    state: SharedState,
    devices: Vec<Arc<MockHalDevice>>,
    render_state_cache: Arc<MockRenderStateCache>,
    host_allocator: Arc<MockHostAllocator>,
    stack_allocators: Arc<MockStackAllocators>,
}

// new & init
impl MockPlatform {
    pub fn new(num_devices: usize) -> Self {
        assert!(num_devices > 0 && num_devices <= MAX_DEVICES);

        let state = SharedState::default();
        let devices = (0..num_devices)
            .map(|device_index| {
                Arc::new(MockHalDevice {
                    device_index,
                    state: state.clone(),
                })
            })
            .collect();

        Self {
            devices,
            render_state_cache: Arc::new(MockRenderStateCache { state: state.clone() }),
            host_allocator: Arc::new(MockHostAllocator { state: state.clone() }),
            stack_allocators: Arc::new(MockStackAllocators { state: state.clone() }),
            state,
        }
    }
}

// getters
impl MockPlatform {
    #[inline]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    #[inline]
    pub fn device(&self, device_index: usize) -> &Arc<MockHalDevice> {
        &self.devices[device_index]
    }

    pub fn hal_devices(&self) -> Vec<Arc<dyn HalDevice>> {
        self.devices.iter().map(|d| d.clone() as Arc<dyn HalDevice>).collect()
    }

    #[inline]
    pub fn render_state_cache(&self) -> Arc<MockRenderStateCache> {
        self.render_state_cache.clone()
    }

    #[inline]
    pub fn host_allocator(&self) -> Arc<MockHostAllocator> {
        self.host_allocator.clone()
    }

    #[inline]
    pub fn stack_allocators(&self) -> Arc<MockStackAllocators> {
        self.stack_allocators.clone()
    }
}

// tools
impl MockPlatform {
    /// 下一次匹配的调用返回 `error`；`device == None` 时匹配任意设备
    pub fn fail_next(&self, point: FailPoint, device: Option<usize>, error: HalError) {
        self.state.lock().failures.push(PendingFailure { point, device, error });
    }

    /// 设置下一个 gpu memory 的虚拟地址
    pub fn set_next_virt_addr(&self, addr: u64) {
        self.state.lock().next_virt_addr = addr;
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// 清空调用记录，返回清空前的内容
    pub fn take_events(&self) -> Vec<MockEvent> {
        std::mem::take(&mut self.state.lock().events)
    }

    pub fn live_cmd_allocator_count(&self) -> usize {
        self.state.lock().cmd_allocators.len()
    }

    pub fn live_cmd_buffer_count(&self) -> usize {
        self.state.lock().cmd_buffers.len()
    }

    pub fn live_gpu_memory_count(&self) -> usize {
        self.state.lock().memories.len()
    }

    pub fn is_gpu_memory_live(&self, memory: GpuMemoryHandle) -> bool {
        self.state.lock().memories.contains_key(&memory)
    }

    /// 某个 gpu memory 在 `device` 的 residency list 中的引用数
    pub fn residency_refs(&self, device: usize, memory: GpuMemoryHandle) -> u32 {
        self.state.lock().residency.get(&(device, memory)).copied().unwrap_or(0)
    }

    pub fn total_residency_refs(&self) -> u32 {
        self.state.lock().residency.values().sum()
    }

    pub fn gpu_memory_priority(&self, memory: GpuMemoryHandle) -> Option<(GpuMemPriority, u32)> {
        self.state.lock().memories.get(&memory).map(|m| (m.priority, m.priority_offset))
    }

    pub fn is_gpu_memory_mapped(&self, memory: GpuMemoryHandle) -> bool {
        self.state.lock().memories.get(&memory).is_some_and(|m| m.mapped)
    }

    pub fn gpu_memory_device(&self, memory: GpuMemoryHandle) -> Option<usize> {
        self.state.lock().memories.get(&memory).map(|m| m.device)
    }

    pub fn live_host_block_count(&self) -> usize {
        self.state.lock().host_blocks.len()
    }

    pub fn live_stack_allocator_count(&self) -> usize {
        self.state.lock().stack_allocators.len()
    }

    pub fn live_external_handle_count(&self) -> usize {
        self.state.lock().external_handles.len()
    }

    /// cache 中某个 depth stencil state 的引用数
    pub fn depth_stencil_ref_count(&self, states: &DepthStencilStates) -> u32 {
        self.state
            .lock()
            .depth_stencil_states
            .values()
            .find(|(s, _)| s == states)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// 向平台注入一个外部 handle，模拟其他进程导出的内存
    pub fn new_external_handle(&self) -> ExternalHandle {
        let mut state = self.state.lock();
        let handle = ExternalHandle(state.new_handle());
        state.external_handles.insert(handle);
        handle
    }
}

/// 单个设备
pub struct MockHalDevice {
    device_index: usize,
    state: SharedState,
}

impl MockHalDevice {
    #[inline]
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    fn open_view(
        &self,
        source: GpuMemoryHandle,
        make_event: impl FnOnce(GpuMemoryHandle) -> MockEvent,
    ) -> HalResult<GpuMemoryHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::OpenView, Some(self.device_index))?;
        let src = state.memories.get(&source).copied().ok_or(HalError::Unknown(-1))?;
        let view = state.new_memory(self.device_index, src.desc, src.priority, src.priority_offset);
        state.events.push(make_event(view));
        Ok(view)
    }

    fn view_size(&self, source: GpuMemoryHandle) -> HalResult<usize> {
        let mut state = self.state.lock();
        state.check(FailPoint::ViewObjectSize, Some(self.device_index))?;
        if !state.memories.contains_key(&source) {
            return Err(HalError::Unknown(-1));
        }
        Ok(MOCK_VIEW_OBJECT_SIZE)
    }
}

impl HalDevice for MockHalDevice {
    fn create_cmd_allocator(&self, _info: &CmdAllocatorCreateInfo) -> HalResult<CmdAllocatorHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateCmdAllocator, Some(self.device_index))?;
        let allocator = CmdAllocatorHandle(state.new_handle());
        state.cmd_allocators.insert(allocator, self.device_index);
        state.events.push(MockEvent::CreateCmdAllocator {
            device: self.device_index,
            allocator,
        });
        Ok(allocator)
    }

    fn reset_cmd_allocator(&self, allocator: CmdAllocatorHandle) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::ResetCmdAllocator, Some(self.device_index))?;
        state.events.push(MockEvent::ResetCmdAllocator {
            device: self.device_index,
            allocator,
        });
        Ok(())
    }

    fn destroy_cmd_allocator(&self, allocator: CmdAllocatorHandle) {
        let mut state = self.state.lock();
        let removed = state.cmd_allocators.remove(&allocator);
        assert!(removed.is_some(), "destroying unknown cmd allocator {allocator:?}");
        state.events.push(MockEvent::DestroyCmdAllocator {
            device: self.device_index,
            allocator,
        });
    }

    fn create_cmd_buffer(&self, info: &HalCmdBufferCreateInfo) -> HalResult<HalCmdBufferHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateCmdBuffer, Some(self.device_index))?;
        assert!(state.cmd_allocators.contains_key(&info.allocator));
        let cmd_buffer = HalCmdBufferHandle(state.new_handle());
        state.cmd_buffers.insert(cmd_buffer, self.device_index);
        state.events.push(MockEvent::CreateCmdBuffer {
            device: self.device_index,
            cmd_buffer,
        });
        Ok(cmd_buffer)
    }

    fn begin_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::BeginCmdBuffer, Some(self.device_index))?;
        state.events.push(MockEvent::BeginCmdBuffer {
            device: self.device_index,
            cmd_buffer,
        });
        Ok(())
    }

    fn end_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::EndCmdBuffer, Some(self.device_index))?;
        state.events.push(MockEvent::EndCmdBuffer {
            device: self.device_index,
            cmd_buffer,
        });
        Ok(())
    }

    fn reset_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::ResetCmdBuffer, Some(self.device_index))?;
        state.events.push(MockEvent::ResetCmdBuffer {
            device: self.device_index,
            cmd_buffer,
        });
        Ok(())
    }

    fn destroy_cmd_buffer(&self, cmd_buffer: HalCmdBufferHandle) {
        let mut state = self.state.lock();
        let removed = state.cmd_buffers.remove(&cmd_buffer);
        assert!(removed.is_some(), "destroying unknown cmd buffer {cmd_buffer:?}");
        state.events.push(MockEvent::DestroyCmdBuffer {
            device: self.device_index,
            cmd_buffer,
        });
    }

    fn create_gpu_memory(&self, info: &GpuMemoryCreateInfo) -> HalResult<GpuMemoryHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateGpuMemory, Some(self.device_index))?;
        let heap = info.preferred_heap().ok_or(HalError::Unknown(-2))?;
        let desc = GpuMemoryDesc {
            gpu_virt_addr: state.alloc_virt_addr(info.size),
            size: info.size,
            alignment: info.alignment,
            preferred_heap: heap,
        };
        let memory = state.new_memory(self.device_index, desc, info.priority, info.priority_offset);
        state.events.push(MockEvent::CreateGpuMemory {
            device: self.device_index,
            memory,
            heap,
            flags: info.flags,
        });
        Ok(memory)
    }

    fn pinned_gpu_memory_size(&self, _info: &PinnedGpuMemoryCreateInfo) -> HalResult<usize> {
        let mut state = self.state.lock();
        state.check(FailPoint::PinnedGpuMemorySize, Some(self.device_index))?;
        Ok(MOCK_PINNED_OBJECT_SIZE)
    }

    fn create_pinned_gpu_memory(&self, info: &PinnedGpuMemoryCreateInfo) -> HalResult<GpuMemoryHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreatePinnedGpuMemory, Some(self.device_index))?;
        let desc = GpuMemoryDesc {
            gpu_virt_addr: state.alloc_virt_addr(info.size),
            size: info.size,
            alignment: info.alignment,
            preferred_heap: GpuHeap::GartCacheable,
        };
        let memory = state.new_memory(self.device_index, desc, GpuMemPriority::Normal, 0);
        state.events.push(MockEvent::CreatePinnedGpuMemory {
            device: self.device_index,
            memory,
        });
        Ok(memory)
    }

    fn open_external_gpu_memory(&self, info: &ExternalGpuMemoryOpenInfo) -> HalResult<OpenedExternalMemory> {
        let mut state = self.state.lock();
        state.check(FailPoint::OpenExternalGpuMemory, Some(self.device_index))?;
        let known = info.handle.is_some_and(|h| state.external_handles.contains(&h));
        if !known {
            return Err(HalError::InvalidExternalHandle);
        }

        let size = 0x1_0000;
        let create_info = GpuMemoryCreateInfo {
            size,
            alignment: 0x1_0000,
            heaps: vec![GpuHeap::Local],
            flags: GpuMemoryFlags::INTERPROCESS,
            priority: GpuMemPriority::Normal,
            priority_offset: 0,
        };
        let desc = GpuMemoryDesc {
            gpu_virt_addr: state.alloc_virt_addr(size),
            size,
            alignment: create_info.alignment,
            preferred_heap: GpuHeap::Local,
        };
        let memory = state.new_memory(self.device_index, desc, GpuMemPriority::Normal, 0);
        state.events.push(MockEvent::OpenExternalGpuMemory {
            device: self.device_index,
            memory,
        });
        Ok(OpenedExternalMemory { memory, create_info })
    }

    fn release_external_handle(&self, handle: ExternalHandle) {
        let mut state = self.state.lock();
        state.external_handles.remove(&handle);
        state.events.push(MockEvent::ReleaseExternalHandle {
            device: self.device_index,
            handle,
        });
    }

    fn export_external_handle(&self, memory: GpuMemoryHandle) -> HalResult<ExternalHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::ExportExternalHandle, Some(self.device_index))?;
        let handle = ExternalHandle(state.new_handle());
        state.external_handles.insert(handle);
        state.events.push(MockEvent::ExportExternalHandle {
            device: self.device_index,
            memory,
            handle,
        });
        Ok(handle)
    }

    fn destroy_gpu_memory(&self, memory: GpuMemoryHandle) {
        let mut state = self.state.lock();
        let removed = state.memories.remove(&memory);
        assert!(removed.is_some(), "destroying unknown gpu memory {memory:?}");
        assert!(
            !state.residency.contains_key(&(self.device_index, memory)),
            "destroying gpu memory {memory:?} that is still resident"
        );
        state.events.push(MockEvent::DestroyGpuMemory {
            device: self.device_index,
            memory,
        });
    }

    fn gpu_memory_desc(&self, memory: GpuMemoryHandle) -> GpuMemoryDesc {
        let state = self.state.lock();
        match state.memories.get(&memory) {
            Some(m) => m.desc,
            None => panic!("querying unknown gpu memory {memory:?}"),
        }
    }

    fn set_gpu_memory_priority(&self, memory: GpuMemoryHandle, priority: GpuMemPriority, offset: u32) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::SetGpuMemoryPriority, Some(self.device_index))?;
        let m = state.memories.get_mut(&memory).ok_or(HalError::Unknown(-1))?;
        m.priority = priority;
        m.priority_offset = offset;
        state.events.push(MockEvent::SetGpuMemoryPriority {
            device: self.device_index,
            memory,
            priority,
            offset,
        });
        Ok(())
    }

    fn map_gpu_memory(&self, memory: GpuMemoryHandle) -> HalResult<u64> {
        let mut state = self.state.lock();
        state.check(FailPoint::MapGpuMemory, Some(self.device_index))?;
        let m = state.memories.get_mut(&memory).ok_or(HalError::Unknown(-1))?;
        m.mapped = true;
        // host 地址与 gpu 地址同值，方便测试校验 offset
        let addr = m.desc.gpu_virt_addr;
        state.events.push(MockEvent::MapGpuMemory {
            device: self.device_index,
            memory,
        });
        Ok(addr)
    }

    fn unmap_gpu_memory(&self, memory: GpuMemoryHandle) -> HalResult<()> {
        let mut state = self.state.lock();
        let m = state.memories.get_mut(&memory).ok_or(HalError::Unknown(-1))?;
        m.mapped = false;
        state.events.push(MockEvent::UnmapGpuMemory {
            device: self.device_index,
            memory,
        });
        Ok(())
    }

    fn peer_gpu_memory_size(&self, original: GpuMemoryHandle) -> HalResult<usize> {
        self.view_size(original)
    }

    fn shared_gpu_memory_size(&self, shared: GpuMemoryHandle) -> HalResult<usize> {
        self.view_size(shared)
    }

    fn open_peer_gpu_memory(&self, original: GpuMemoryHandle, storage: HostBlock) -> HalResult<GpuMemoryHandle> {
        let device = self.device_index;
        self.open_view(original, |view| MockEvent::OpenPeerGpuMemory {
            device,
            original,
            view,
            storage,
        })
    }

    fn open_shared_gpu_memory(&self, shared: GpuMemoryHandle, storage: HostBlock) -> HalResult<GpuMemoryHandle> {
        let device = self.device_index;
        self.open_view(shared, |view| MockEvent::OpenSharedGpuMemory {
            device,
            shared,
            view,
            storage,
        })
    }

    fn add_residency_reference(&self, memory: GpuMemoryHandle) -> HalResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::AddResidency, Some(self.device_index))?;
        *state.residency.entry((self.device_index, memory)).or_default() += 1;
        state.events.push(MockEvent::AddResidency {
            device: self.device_index,
            memory,
        });
        Ok(())
    }

    fn remove_residency_reference(&self, memory: GpuMemoryHandle) {
        let mut state = self.state.lock();
        let key = (self.device_index, memory);
        match state.residency.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.residency.remove(&key);
            }
            None => panic!("removing residency of {memory:?} which is not resident on device {}", self.device_index),
        }
        state.events.push(MockEvent::RemoveResidency {
            device: self.device_index,
            memory,
        });
    }
}

/// 按 key 去重并引用计数的 render state cache
pub struct MockRenderStateCache {
    state: SharedState,
}

impl RenderStateCache for MockRenderStateCache {
    fn create_depth_stencil_state(
        &self,
        info: &DepthStencilStateCreateInfo,
        _parent_scope: vk::SystemAllocationScope,
    ) -> HalResult<DepthStencilStates> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateDepthStencilState, None)?;

        let states = match state.depth_stencil_states.get(info).copied() {
            Some((states, count)) => {
                state.depth_stencil_states.insert(*info, (states, count + 1));
                states
            }
            None => {
                let mut states = DepthStencilStates::default();
                for slot in states.per_device.iter_mut() {
                    *slot = Some(DepthStencilStateHandle(state.new_handle()));
                }
                state.depth_stencil_states.insert(*info, (states, 1));
                states
            }
        };
        state.events.push(MockEvent::CreateDepthStencilState { states });
        Ok(states)
    }

    fn destroy_depth_stencil_state(&self, states: &DepthStencilStates) {
        let mut state = self.state.lock();
        let key = state
            .depth_stencil_states
            .iter()
            .find(|(_, (s, _))| s == states)
            .map(|(k, _)| *k);
        let Some(key) = key else {
            panic!("destroying unknown depth stencil state {states:?}");
        };
        let remove = match state.depth_stencil_states.get_mut(&key) {
            Some((_, count)) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if remove {
            state.depth_stencil_states.remove(&key);
        }
        state.events.push(MockEvent::DestroyDepthStencilState { states: *states });
    }
}

pub struct MockHostAllocator {
    state: SharedState,
}

impl HostAllocator for MockHostAllocator {
    fn alloc(&self, size: usize, _scope: vk::SystemAllocationScope) -> Option<HostBlock> {
        let mut state = self.state.lock();
        if state.take_failure(FailPoint::HostAlloc, None).is_some() {
            return None;
        }
        let block = HostBlock(state.new_handle() << 12);
        state.host_blocks.insert(block, size);
        state.events.push(MockEvent::HostAlloc { block, size });
        Some(block)
    }

    fn free(&self, block: HostBlock) {
        let mut state = self.state.lock();
        let removed = state.host_blocks.remove(&block);
        assert!(removed.is_some(), "freeing unknown host block {block:?}");
        state.events.push(MockEvent::HostFree { block });
    }
}

pub struct MockStackAllocators {
    state: SharedState,
}

impl StackAllocatorManager for MockStackAllocators {
    fn acquire_allocator(&self) -> HalResult<StackAllocatorHandle> {
        let mut state = self.state.lock();
        state.check(FailPoint::AcquireStackAllocator, None)?;
        let allocator = StackAllocatorHandle(state.new_handle());
        state.stack_allocators.insert(allocator);
        state.events.push(MockEvent::AcquireStackAllocator { allocator });
        Ok(allocator)
    }

    fn release_allocator(&self, allocator: StackAllocatorHandle) {
        let mut state = self.state.lock();
        let removed = state.stack_allocators.remove(&allocator);
        assert!(removed, "releasing unknown stack allocator {allocator:?}");
        state.events.push(MockEvent::ReleaseStackAllocator { allocator });
    }
}
