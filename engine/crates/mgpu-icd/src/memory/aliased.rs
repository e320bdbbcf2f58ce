use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;
use mgpu_hal::handles::{ExternalHandle, GpuMemoryHandle, HostBlock};
use mgpu_hal::memory::{
    ExternalGpuMemoryOpenInfo, GpuHeap, GpuMemoryCreateInfo, GpuMemoryDesc, GpuMemoryFlags, PinnedGpuMemoryCreateInfo,
};
use mgpu_hal::{DEFAULT_DEVICE_INDEX, DeviceMask, HalError, MAX_DEVICES};
use scopeguard::ScopeGuard;

use crate::device::Device;
use crate::error::{IcdError, IcdResult};
use crate::memory::priority::MemoryPriority;

/// 单实例分配所在的设备
pub const DEFAULT_MEMORY_INSTANCE_INDEX: usize = 0;

/// 对应 `VkMemoryAllocateInfo` 及其扩展链中本模块关心的部分
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MemoryAllocateInfo {
    pub allocation_size: vk::DeviceSize,
    pub memory_type_index: u32,
    /// `VkMemoryAllocateFlagsInfo::deviceMask`
    pub device_mask: Option<DeviceMask>,
    /// `VkMemoryPriorityAllocateInfoEXT::priority`
    pub priority: Option<f32>,
    /// 带有 `VkExportMemoryAllocateInfo`
    pub export: bool,
    /// 导入外部 handle
    pub import: Option<ExternalGpuMemoryOpenInfo>,
    /// `VkImportMemoryHostPointerInfoEXT::pHostPointer`
    pub pinned_host_address: Option<u64>,
}

/// `[R][S]` 中的一项：对角线上是设备自己的分配，其余是按需打开的 view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PairMemory {
    Base(GpuMemoryHandle),
    /// `storage` 是 view 对象占用的 host 内存
    View { memory: GpuMemoryHandle, storage: HostBlock },
}

impl PairMemory {
    #[inline]
    fn memory(&self) -> GpuMemoryHandle {
        match self {
            Self::Base(memory) | Self::View { memory, .. } => *memory,
        }
    }
}

/// 一个逻辑上的 memory 分配
///
/// 在 device group 中，设备 R 上的资源访问来自设备 S 的内存时，需要一个 R 上的 HAL 对象。
/// `per_pair[R][S]` 缓存这些对象：对角线在创建时填好，其余在第一次 [`Self::resolve`] 时打开，
/// 之后一直有效并保持在 R 的 residency list 中，直到 [`Self::free`]。
pub struct AliasedAllocation {
    device: Arc<Device>,
    info: GpuMemoryCreateInfo,

    per_pair: [[Option<PairMemory>; MAX_DEVICES]; MAX_DEVICES],

    primary_device_index: usize,
    multi_instance: bool,

    allocation_counted: bool,
    size_accounted_mask: DeviceMask,

    /// [`MemoryPriority::pack`] 的结果
    priority: AtomicU32,

    /// 导入时使用的外部 handle
    external_handle: Option<ExternalHandle>,
}

// new & init
impl AliasedAllocation {
    /// 分配内存：标准分配、pinned host memory 或者导入外部 handle
    pub fn allocate(device: &Arc<Device>, alloc_info: &MemoryAllocateInfo) -> IcdResult<Self> {
        let _span = tracy_client::span!("AliasedAllocation::allocate");

        // 先占用 allocation 名额
        device.increase_allocation_count()?;

        let result = Self::allocate_counted(device, alloc_info);
        if result.is_err() {
            device.decrease_allocation_count();
        }
        result
    }

    fn allocate_counted(device: &Arc<Device>, alloc_info: &MemoryAllocateInfo) -> IcdResult<Self> {
        let settings = device.settings();
        let memory_type = *device.memory_type(alloc_info.memory_type_index)?;

        let mut create_info = GpuMemoryCreateInfo {
            size: alloc_info.allocation_size,
            alignment: 0,
            heaps: vec![memory_type.heap],
            flags: GpuMemoryFlags::empty(),
            priority: Default::default(),
            priority_offset: 0,
        };
        if create_info.size != 0 {
            create_info.alignment = device.memory_base_addr_alignment(alloc_info.memory_type_index);
        }

        let mut allocation_mask = DeviceMask::single(DEFAULT_DEVICE_INDEX);
        if device.num_devices() > 1 {
            if memory_type.multi_instance {
                // local heap 上的 multi-GPU 分配需要允许 peer 写入
                create_info.flags |= GpuMemoryFlags::PEER_WRITABLE;
                allocation_mask = device.device_mask();
            } else {
                debug_assert!(memory_type.heap.is_system_visible());
                create_info.flags |= GpuMemoryFlags::SHAREABLE;
                allocation_mask = DeviceMask::single(DEFAULT_MEMORY_INSTANCE_INDEX);
            }
        }

        if settings.override_heap_gart_cacheable_to_uswc && create_info.heaps[0] == GpuHeap::GartCacheable {
            create_info.heaps[0] = GpuHeap::GartUswc;
        }

        let property_flags = memory_type.property_flags;
        if property_flags.contains(vk::MemoryPropertyFlags::DEVICE_COHERENT_AMD) && device.device_coherent_memory_enabled()
        {
            create_info.flags |= GpuMemoryFlags::GL2_UNCACHED;
        }
        if !property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            create_info.flags |= GpuMemoryFlags::CPU_INVISIBLE;
        }
        if property_flags.contains(vk::MemoryPropertyFlags::PROTECTED) {
            create_info.flags |= GpuMemoryFlags::TMZ_PROTECTED;
        }
        if alloc_info.export {
            create_info.flags |= GpuMemoryFlags::INTERPROCESS;
        }

        if let Some(mask) = alloc_info.device_mask {
            if mask.is_empty() || !mask.is_subset_of(device.device_mask()) {
                debug_assert!(false, "invalid device mask {mask:?}");
                return Err(IcdError::InvalidOperation("device mask is empty or names missing devices"));
            }
            allocation_mask = mask;
        }

        let priority = alloc_info
            .priority
            .map(MemoryPriority::from_vk_priority)
            .unwrap_or_else(|| MemoryPriority::from_setting(settings.memory_priority_default));

        // 只检查预算，真正的记账要等分配成功
        device.try_increase_allocated_memory_size(create_info.size, allocation_mask, create_info.heaps[0])?;

        let mut memory = if let Some(open_info) = &alloc_info.import {
            Self::open_external_memory(device, open_info)?
        } else {
            create_info.priority = priority.priority;
            create_info.priority_offset = priority.offset;

            match alloc_info.pinned_host_address {
                None => Self::create_gpu_memory(device, create_info, allocation_mask)?,
                Some(host_address) => Self::create_pinned_memory(device, create_info, allocation_mask, host_address)?,
            }
        };

        if let Some(heap) = memory.info.preferred_heap() {
            memory.size_accounted_mask = device.increase_allocated_memory_size(memory.info.size, allocation_mask, heap);
        }
        memory.allocation_counted = true;

        log::debug!(
            "memory allocated: size {:#x}, heap {:?}, mask {:?}, multi-instance {}",
            memory.info.size,
            memory.info.preferred_heap(),
            allocation_mask,
            memory.multi_instance
        );
        Ok(memory)
    }

    fn new(
        device: &Arc<Device>,
        info: GpuMemoryCreateInfo,
        bases: impl IntoIterator<Item = (usize, GpuMemoryHandle)>,
        multi_instance: bool,
        primary_device_index: usize,
        external_handle: Option<ExternalHandle>,
    ) -> Self {
        let mut per_pair = [[None; MAX_DEVICES]; MAX_DEVICES];
        for (device_index, memory) in bases {
            per_pair[device_index][device_index] = Some(PairMemory::Base(memory));
        }

        let priority = MemoryPriority::new(info.priority, info.priority_offset);
        Self {
            device: device.clone(),
            info,
            per_pair,
            primary_device_index,
            multi_instance,
            allocation_counted: false,
            size_accounted_mask: DeviceMask::EMPTY,
            priority: AtomicU32::new(priority.pack()),
            external_handle,
        }
    }

    /// primary device 是 mask 的最低位，多于一个设备时为 multi-instance
    #[inline]
    fn primary_device(mask: DeviceMask) -> (usize, bool) {
        (mask.first().unwrap_or(DEFAULT_DEVICE_INDEX), mask.count() > 1)
    }

    /// 在 mask 中的每个设备上分配内存并加入 residency list
    fn create_gpu_memory(device: &Arc<Device>, info: GpuMemoryCreateInfo, mask: DeviceMask) -> IcdResult<Self> {
        debug_assert!(!mask.is_empty());
        let (primary, multi_instance) = Self::primary_device(mask);

        // 大小为 0 的分配没有任何 HAL 对象
        if info.size == 0 {
            return Ok(Self::new(device, info, [], false, DEFAULT_DEVICE_INDEX, None));
        }

        let bases = Self::create_per_device(device, mask, |device_index| {
            device.hal_device(device_index).create_gpu_memory(&info)
        })
        .map_err(IcdError::from)?;

        Ok(Self::new(device, info, bases, multi_instance, primary, None))
    }

    /// 把应用提供的 host 内存固定下来
    fn create_pinned_memory(
        device: &Arc<Device>,
        info: GpuMemoryCreateInfo,
        mask: DeviceMask,
        host_address: u64,
    ) -> IcdResult<Self> {
        let (primary, multi_instance) = Self::primary_device(mask);
        debug_assert!(!multi_instance, "pinned memory cannot be multi-instance");

        let pinned_info = PinnedGpuMemoryCreateInfo {
            size: info.size,
            host_address,
            alignment: info.alignment,
        };
        // 只用来检查 host 地址范围能否被固定，大小以 info.size 为准
        device
            .hal_device(DEFAULT_DEVICE_INDEX)
            .pinned_gpu_memory_size(&pinned_info)
            .map_err(|_| IcdError::InvalidExternalHandle)?;

        let bases = Self::create_per_device(device, mask, |device_index| {
            device.hal_device(device_index).create_pinned_gpu_memory(&pinned_info)
        })
        .map_err(|_| IcdError::InvalidExternalHandle)?;

        Ok(Self::new(device, info, bases, multi_instance, primary, None))
    }

    /// 导入外部 handle；导入的内存总是单实例的
    fn open_external_memory(device: &Arc<Device>, open_info: &ExternalGpuMemoryOpenInfo) -> IcdResult<Self> {
        let hal_device = device.hal_device(DEFAULT_MEMORY_INSTANCE_INDEX);
        let opened = hal_device.open_external_gpu_memory(open_info)?;

        if let Err(err) = hal_device.add_residency_reference(opened.memory) {
            hal_device.destroy_gpu_memory(opened.memory);
            return Err(err.into());
        }

        Ok(Self::new(
            device,
            opened.create_info,
            [(DEFAULT_MEMORY_INSTANCE_INDEX, opened.memory)],
            false,
            DEFAULT_MEMORY_INSTANCE_INDEX,
            open_info.handle,
        ))
    }

    /// 依次在每个设备上创建并加入 residency list；失败时按相反顺序撤销已经创建的
    fn create_per_device(
        device: &Arc<Device>,
        mask: DeviceMask,
        create: impl Fn(usize) -> Result<GpuMemoryHandle, HalError>,
    ) -> Result<Vec<(usize, GpuMemoryHandle)>, HalError> {
        let mut created = scopeguard::guard(Vec::with_capacity(mask.count() as usize), |created| {
            log::warn!("gpu memory creation failed, unwinding {} device(s)", created.len());
            for (device_index, memory) in created.into_iter().rev() {
                let hal_device = device.hal_device(device_index);
                hal_device.remove_residency_reference(memory);
                hal_device.destroy_gpu_memory(memory);
            }
        });

        for device_index in mask.iter() {
            let hal_device = device.hal_device(device_index);
            let memory = create(device_index)?;
            if let Err(err) = hal_device.add_residency_reference(memory) {
                hal_device.destroy_gpu_memory(memory);
                return Err(err);
            }
            created.push((device_index, memory));
        }

        Ok(ScopeGuard::into_inner(created))
    }
}

// destroy
impl AliasedAllocation {
    /// 释放所有 HAL 对象：先释放所有 view，再释放各设备上的分配
    pub fn free(mut self) {
        let _span = tracy_client::span!("AliasedAllocation::free");
        let device = self.device.clone();
        let num_devices = device.num_devices();

        for resource_index in 0..num_devices {
            for source_index in 0..num_devices {
                if resource_index == source_index {
                    continue;
                }
                if let Some(PairMemory::View { memory, storage }) = self.per_pair[resource_index][source_index].take() {
                    let hal_device = device.hal_device(resource_index);
                    hal_device.remove_residency_reference(memory);
                    hal_device.destroy_gpu_memory(memory);
                    device.host_allocator().free(storage);
                }
            }
        }

        for device_index in 0..num_devices {
            if let Some(cell) = self.per_pair[device_index][device_index].take() {
                let hal_device = device.hal_device(device_index);
                hal_device.remove_residency_reference(cell.memory());
                hal_device.destroy_gpu_memory(cell.memory());
            }
        }

        if let Some(handle) = self.external_handle.take() {
            device.hal_device(DEFAULT_MEMORY_INSTANCE_INDEX).release_external_handle(handle);
        }

        if self.allocation_counted {
            device.decrease_allocation_count();
            self.allocation_counted = false;
        }

        if !self.size_accounted_mask.is_empty() {
            if let Some(heap) = self.info.preferred_heap() {
                device.decrease_allocated_memory_size(self.info.size, self.size_accounted_mask, heap);
            }
            self.size_accounted_mask = DeviceMask::EMPTY;
        }
    }
}

impl Drop for AliasedAllocation {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        debug_assert!(!self.allocation_counted, "AliasedAllocation dropped without free()");
        debug_assert!(self.per_pair.iter().flatten().all(Option::is_none));
    }
}

// getters
impl AliasedAllocation {
    #[inline]
    pub fn info(&self) -> &GpuMemoryCreateInfo {
        &self.info
    }

    #[inline]
    pub fn primary_device_index(&self) -> usize {
        self.primary_device_index
    }

    #[inline]
    pub fn is_multi_instance(&self) -> bool {
        self.multi_instance
    }

    #[inline]
    pub fn allocation_counted(&self) -> bool {
        self.allocation_counted
    }

    #[inline]
    pub fn size_accounted_mask(&self) -> DeviceMask {
        self.size_accounted_mask
    }

    #[inline]
    pub fn priority(&self) -> MemoryPriority {
        MemoryPriority::unpack(self.priority.load(Ordering::Acquire))
    }

    /// 与 `vkGetDeviceMemoryCommitment` 对应：从不延迟分配，所以总是整个大小
    #[inline]
    pub fn commitment(&self) -> vk::DeviceSize {
        self.info.size
    }

    /// 不会打开新的 view
    #[inline]
    pub fn cached(&self, resource_index: usize, source_index: usize) -> Option<GpuMemoryHandle> {
        self.per_pair
            .get(resource_index)
            .and_then(|row| row.get(source_index))
            .copied()
            .flatten()
            .map(|cell| cell.memory())
    }

    /// `memory` 必须是这个分配在 `device_index` 上的 HAL 对象
    #[inline]
    pub fn gpu_memory_desc(&self, device_index: usize, memory: GpuMemoryHandle) -> GpuMemoryDesc {
        self.device.hal_device(device_index).gpu_memory_desc(memory)
    }

    #[inline]
    fn base(&self, device_index: usize) -> Option<GpuMemoryHandle> {
        match self.per_pair[device_index][device_index] {
            Some(PairMemory::Base(memory)) => Some(memory),
            _ => None,
        }
    }
}

// view
impl AliasedAllocation {
    /// 返回设备 `resource_index` 上访问设备 `source_index` 内存所用的 HAL 对象，必要时打开 view
    ///
    /// 非 multi-instance 的分配只存在于 primary device，因此忽略 `source_index`。
    /// 打开失败时这一项保持为空，下一次调用会重试。
    pub fn resolve(&mut self, resource_index: usize, source_index: usize) -> IcdResult<GpuMemoryHandle> {
        let num_devices = self.device.num_devices();
        if resource_index >= num_devices || source_index >= num_devices {
            return Err(IcdError::InvalidOperation("device index out of range"));
        }

        let index = if self.multi_instance { source_index } else { self.primary_device_index };
        if let Some(cell) = self.per_pair[resource_index][index] {
            return Ok(cell.memory());
        }

        let _span = tracy_client::span!("AliasedAllocation::resolve");

        let Some(base) = self.base(index) else {
            return Err(IcdError::InvalidOperation("allocation has no memory on the source device"));
        };

        let device = self.device.clone();
        let hal_device = device.hal_device(resource_index);

        // system memory 用 shared view 打开，其他设备的 local heap 用 peer view 打开
        let open_shared = device.hal_device(index).gpu_memory_desc(base).preferred_heap.is_system_visible();

        let view_size = if open_shared {
            hal_device.shared_gpu_memory_size(base)?
        } else {
            hal_device.peer_gpu_memory_size(base)?
        };
        let storage = device
            .host_allocator()
            .alloc(view_size, vk::SystemAllocationScope::OBJECT)
            .ok_or(IcdError::OUT_OF_HOST_MEMORY)?;

        let opened = if open_shared {
            hal_device.open_shared_gpu_memory(base, storage)
        } else {
            hal_device.open_peer_gpu_memory(base, storage)
        };
        let view = match opened {
            Ok(view) => view,
            Err(err) => {
                device.host_allocator().free(storage);
                return Err(err.into());
            }
        };

        if let Err(err) = hal_device.add_residency_reference(view) {
            log::warn!("failed to make view [{resource_index}][{index}] resident: {err}");
            hal_device.destroy_gpu_memory(view);
            device.host_allocator().free(storage);
            return Err(err.into());
        }

        log::debug!(
            "opened {} view [{}][{}] of {:?}",
            if open_shared { "shared" } else { "peer" },
            resource_index,
            index,
            base
        );
        self.per_pair[resource_index][index] = Some(PairMemory::View { memory: view, storage });
        Ok(view)
    }
}

// tools
impl AliasedAllocation {
    /// 把 primary device 上的内存映射到 host，返回 `offset` 处的地址
    pub fn map(&self, offset: vk::DeviceSize) -> IcdResult<u64> {
        // multi-instance 的内存不允许映射
        if self.multi_instance {
            return Err(IcdError::MemoryMapFailed);
        }
        let base = self.base(self.primary_device_index).ok_or(IcdError::MemoryMapFailed)?;

        let address = self
            .device
            .hal_device(self.primary_device_index)
            .map_gpu_memory(base)
            .map_err(|_| IcdError::MemoryMapFailed)?;
        Ok(address + offset)
    }

    pub fn unmap(&self) -> IcdResult<()> {
        debug_assert!(!self.multi_instance);
        let base = self
            .base(self.primary_device_index)
            .ok_or(IcdError::InvalidOperation("unmapping memory without backing"))?;
        self.device.hal_device(self.primary_device_index).unmap_gpu_memory(base)?;
        Ok(())
    }

    /// 导出 default device 上的内存
    pub fn share_handle(&self) -> IcdResult<ExternalHandle> {
        let base = self
            .base(DEFAULT_DEVICE_INDEX)
            .ok_or(IcdError::InvalidOperation("exporting memory without backing"))?;
        Ok(self.device.hal_device(DEFAULT_DEVICE_INDEX).export_external_handle(base)?)
    }

    /// 将优先级提升到至少 `priority`，已经更高时什么都不做
    ///
    /// 可以在多个线程中同时调用：先无锁比较，再在 device 的 memory mutex 下重新检查。
    pub fn elevate_priority(&self, priority: MemoryPriority) {
        if self.priority() >= priority {
            return;
        }

        let _lock = self.device.memory_mutex().lock();
        if self.priority() >= priority {
            return;
        }

        for device_index in 0..self.device.num_devices() {
            let Some(base) = self.base(device_index) else {
                continue;
            };
            let result = self.device.hal_device(device_index).set_gpu_memory_priority(
                base,
                priority.priority,
                priority.offset,
            );
            match result {
                Ok(()) => self.priority.store(priority.pack(), Ordering::Release),
                Err(err) => log::warn!("failed to elevate priority on device {device_index}: {err}"),
            }
        }
    }
}
