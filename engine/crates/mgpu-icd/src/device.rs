use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;
use mgpu_hal::cmd::CmdAllocatorCreateInfo;
use mgpu_hal::device::HalDevice;
use mgpu_hal::handles::CmdAllocatorHandle;
use mgpu_hal::host::{HostAllocator, StackAllocatorManager};
use mgpu_hal::memory::GpuHeap;
use mgpu_hal::render_state::RenderStateCache;
use mgpu_hal::{DeviceMask, MAX_DEVICES};
use parking_lot::Mutex;
use scopeguard::ScopeGuard;

use crate::error::{IcdError, IcdResult};
use crate::settings::RuntimeSettings;

/// 一种 Vulkan memory type 对应的 HAL 属性
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub heap: GpuHeap,
    pub property_flags: vk::MemoryPropertyFlags,
    /// 所在的 Vulkan heap 带有 `MULTI_INSTANCE` 标志：每个设备各自持有一份
    pub multi_instance: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryProperties {
    /// 以 Vulkan memory type index 为索引
    pub types: Vec<MemoryType>,
    /// 每个设备上各个 heap 的大小，以 [`GpuHeap`] 为索引
    pub heap_sizes: [vk::DeviceSize; GpuHeap::COUNT],
    /// memory 对象起始地址的对齐，足以覆盖绝大多数 image 的要求
    pub base_addr_alignment: vk::DeviceSize,
}

pub struct DeviceCreateInfo {
    pub hal_devices: Vec<Arc<dyn HalDevice>>,
    pub render_state_cache: Arc<dyn RenderStateCache>,
    pub host_allocator: Arc<dyn HostAllocator>,
    pub stack_allocators: Arc<dyn StackAllocatorManager>,
    pub memory_properties: MemoryProperties,
    pub settings: RuntimeSettings,
    /// 应用通过 `VK_EXT_pageable_device_local_memory` 自行控制优先级，bind 时不再提升
    pub app_controlled_mem_priority: bool,
    /// 是否启用了 `deviceCoherentMemory` feature
    pub device_coherent_memory: bool,
}

/// 由若干物理设备组成的逻辑设备
///
/// 持有 HAL 对象、运行时配置以及 memory 的预算统计，以 `Arc<Device>` 的形式被 pool 和 memory 共享。
pub struct Device {
    hal_devices: Vec<Arc<dyn HalDevice>>,
    render_state_cache: Arc<dyn RenderStateCache>,
    host_allocator: Arc<dyn HostAllocator>,
    stack_allocators: Arc<dyn StackAllocatorManager>,

    memory_properties: MemoryProperties,
    settings: RuntimeSettings,
    app_controlled_mem_priority: bool,
    device_coherent_memory: bool,

    /// `use_shared_cmd_allocator` 时所有 pool 共用，每个设备一个
    shared_cmd_allocators: Option<Vec<CmdAllocatorHandle>>,

    allocation_count: AtomicU32,
    /// [device][heap] 已分配的字节数
    allocated_sizes: Mutex<[[vk::DeviceSize; GpuHeap::COUNT]; MAX_DEVICES]>,

    /// 保护 memory priority 的修改
    memory_mutex: Mutex<()>,
}

// new & init
impl Device {
    pub fn new(create_info: DeviceCreateInfo) -> IcdResult<Arc<Self>> {
        let _span = tracy_client::span!("Device::new");

        let num_devices = create_info.hal_devices.len();
        if num_devices == 0 || num_devices > MAX_DEVICES {
            return Err(IcdError::InvalidOperation("device group size out of range"));
        }

        let shared_cmd_allocators = if create_info.settings.use_shared_cmd_allocator {
            let info = create_info.settings.cmd_allocator_create_info();
            Some(create_cmd_allocators(&create_info.hal_devices, &info)?)
        } else {
            None
        };

        log::info!(
            "device created: {} physical device(s), shared cmd allocator: {}",
            num_devices,
            shared_cmd_allocators.is_some()
        );

        Ok(Arc::new(Self {
            hal_devices: create_info.hal_devices,
            render_state_cache: create_info.render_state_cache,
            host_allocator: create_info.host_allocator,
            stack_allocators: create_info.stack_allocators,
            memory_properties: create_info.memory_properties,
            settings: create_info.settings,
            app_controlled_mem_priority: create_info.app_controlled_mem_priority,
            device_coherent_memory: create_info.device_coherent_memory,
            shared_cmd_allocators,
            allocation_count: AtomicU32::new(0),
            allocated_sizes: Mutex::new([[0; GpuHeap::COUNT]; MAX_DEVICES]),
            memory_mutex: Mutex::new(()),
        }))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(allocators) = self.shared_cmd_allocators.take() {
            destroy_cmd_allocators(&self.hal_devices, allocators);
        }
        debug_assert_eq!(
            self.allocation_count.load(Ordering::Acquire),
            0,
            "device dropped with live memory allocations"
        );
    }
}

// getters
impl Device {
    #[inline]
    pub fn num_devices(&self) -> usize {
        self.hal_devices.len()
    }

    /// 包含所有物理设备
    #[inline]
    pub fn device_mask(&self) -> DeviceMask {
        DeviceMask::all(self.num_devices())
    }

    /// # Panics
    /// `device_index` 必须小于 [`Device::num_devices`]
    #[inline]
    pub fn hal_device(&self, device_index: usize) -> &dyn HalDevice {
        self.hal_devices[device_index].as_ref()
    }

    #[inline]
    pub(crate) fn hal_devices(&self) -> &[Arc<dyn HalDevice>] {
        &self.hal_devices
    }

    #[inline]
    pub fn render_state_cache(&self) -> &dyn RenderStateCache {
        self.render_state_cache.as_ref()
    }

    #[inline]
    pub fn host_allocator(&self) -> &dyn HostAllocator {
        self.host_allocator.as_ref()
    }

    #[inline]
    pub fn stack_allocators(&self) -> &dyn StackAllocatorManager {
        self.stack_allocators.as_ref()
    }

    #[inline]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    #[inline]
    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    #[inline]
    pub fn app_controlled_mem_priority(&self) -> bool {
        self.app_controlled_mem_priority
    }

    #[inline]
    pub fn device_coherent_memory_enabled(&self) -> bool {
        self.device_coherent_memory
    }

    #[inline]
    pub fn shared_cmd_allocators(&self) -> Option<&[CmdAllocatorHandle]> {
        self.shared_cmd_allocators.as_deref()
    }

    #[inline]
    pub fn memory_mutex(&self) -> &Mutex<()> {
        &self.memory_mutex
    }

    #[inline]
    pub fn allocation_count(&self) -> u32 {
        self.allocation_count.load(Ordering::Acquire)
    }
}

// memory type
impl Device {
    pub fn memory_type(&self, type_index: u32) -> IcdResult<&MemoryType> {
        self.memory_properties
            .types
            .get(type_index as usize)
            .ok_or(IcdError::InvalidOperation("memory type index out of range"))
    }

    #[inline]
    pub fn heap_from_type_index(&self, type_index: u32) -> IcdResult<GpuHeap> {
        self.memory_type(type_index).map(|ty| ty.heap)
    }

    #[inline]
    pub fn memory_base_addr_alignment(&self, _type_index: u32) -> vk::DeviceSize {
        self.memory_properties.base_addr_alignment
    }
}

// allocation budget
impl Device {
    /// 预占一个 allocation 名额；超过上限时返回 `ResourceExhausted(ObjectCount)`
    pub fn increase_allocation_count(&self) -> IcdResult<()> {
        let max = self.settings.max_memory_allocation_count;
        self.allocation_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| (count < max).then_some(count + 1))
            .map(|_| ())
            .map_err(|_| IcdError::TOO_MANY_OBJECTS)
    }

    pub fn decrease_allocation_count(&self) {
        let prev = self.allocation_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allocation count underflow");
    }

    #[inline]
    fn is_size_tracked(&self, heap: GpuHeap) -> bool {
        self.settings.enable_allocation_size_tracking && heap.is_device_local()
    }

    /// 只检查 `mask` 中每个设备的 heap 是否还放得下 `size`，不记账
    pub fn try_increase_allocated_memory_size(
        &self,
        size: vk::DeviceSize,
        mask: DeviceMask,
        heap: GpuHeap,
    ) -> IcdResult<()> {
        if !self.is_size_tracked(heap) {
            return Ok(());
        }

        let limit = self.memory_properties.heap_sizes[heap as usize];
        let sizes = self.allocated_sizes.lock();
        let fits = mask
            .iter()
            .all(|device| sizes[device][heap as usize].checked_add(size).is_some_and(|total| total <= limit));
        if fits { Ok(()) } else { Err(IcdError::OUT_OF_DEVICE_MEMORY) }
    }

    /// 记账，返回实际记账的设备
    pub fn increase_allocated_memory_size(&self, size: vk::DeviceSize, mask: DeviceMask, heap: GpuHeap) -> DeviceMask {
        if !self.is_size_tracked(heap) {
            return DeviceMask::EMPTY;
        }

        let mut sizes = self.allocated_sizes.lock();
        for device in mask.iter() {
            sizes[device][heap as usize] += size;
        }
        mask
    }

    pub fn decrease_allocated_memory_size(&self, size: vk::DeviceSize, mask: DeviceMask, heap: GpuHeap) {
        let mut sizes = self.allocated_sizes.lock();
        for device in mask.iter() {
            let slot = &mut sizes[device][heap as usize];
            debug_assert!(*slot >= size, "allocated size underflow on device {device}");
            *slot = slot.saturating_sub(size);
        }
    }

    pub fn allocated_memory_size(&self, device_index: usize, heap: GpuHeap) -> vk::DeviceSize {
        self.allocated_sizes.lock()[device_index][heap as usize]
    }
}

/// 在每个设备上创建一个 command allocator；任何一个失败都会销毁之前创建的
pub(crate) fn create_cmd_allocators(
    hal_devices: &[Arc<dyn HalDevice>],
    info: &CmdAllocatorCreateInfo,
) -> IcdResult<Vec<CmdAllocatorHandle>> {
    let mut created = scopeguard::guard(Vec::with_capacity(hal_devices.len()), |created| {
        log::warn!("cmd allocator creation failed, destroying {} created allocator(s)", created.len());
        destroy_cmd_allocators(hal_devices, created);
    });

    for hal_device in hal_devices {
        created.push(hal_device.create_cmd_allocator(info)?);
    }

    Ok(ScopeGuard::into_inner(created))
}

/// `allocators[i]` 属于 device i，按相反顺序销毁
pub(crate) fn destroy_cmd_allocators(hal_devices: &[Arc<dyn HalDevice>], allocators: Vec<CmdAllocatorHandle>) {
    for (device_index, allocator) in allocators.into_iter().enumerate().rev() {
        hal_devices[device_index].destroy_cmd_allocator(allocator);
    }
}
