mod common;

use common::{GART_CACHEABLE, GART_USWC, INVISIBLE, LOCAL_HEAP_SIZE, LOCAL_VISIBLE, TestDevice, count, position};
use mgpu_hal::device::HalDevice;
use mgpu_hal::memory::{ExternalGpuMemoryOpenInfo, GpuHeap, GpuMemPriority, GpuMemoryFlags};
use mgpu_hal::mock::{FailPoint, MockEvent};
use mgpu_hal::{DeviceMask, HalError};
use mgpu_icd::memory::{AliasedAllocation, MemoryAllocateInfo, MemoryPriority};
use mgpu_icd::{IcdError, RuntimeSettings};

const SIZE: u64 = 0x2_0000;

fn alloc_info(memory_type_index: u32) -> MemoryAllocateInfo {
    MemoryAllocateInfo {
        allocation_size: SIZE,
        memory_type_index,
        ..Default::default()
    }
}

#[test]
fn test_single_instance_shared_view_lifecycle() {
    let TestDevice { platform, device } = TestDevice::new(2);
    let mut memory = AliasedAllocation::allocate(&device, &alloc_info(GART_USWC)).unwrap();
    assert!(!memory.is_multi_instance());
    assert_eq!(memory.primary_device_index(), 0);
    let base = memory.cached(0, 0).unwrap();
    assert!(memory.info().flags.contains(GpuMemoryFlags::SHAREABLE));

    platform.take_events();
    let view = memory.resolve(1, 0).unwrap();
    assert_ne!(view, base);
    let events = platform.take_events();
    assert_eq!(
        count(&events, |e| matches!(e, MockEvent::OpenSharedGpuMemory { device: 1, shared, .. } if *shared == base)),
        1
    );
    assert_eq!(platform.residency_refs(1, view), 1);

    // 幂等
    assert_eq!(memory.resolve(1, 0).unwrap(), view);
    assert!(platform.take_events().is_empty());

    memory.free();
    let events = platform.take_events();
    let view_unresident = position(&events, |e| matches!(e, MockEvent::RemoveResidency { device: 1, memory } if *memory == view));
    let view_destroyed = position(&events, |e| matches!(e, MockEvent::DestroyGpuMemory { device: 1, memory } if *memory == view));
    let base_destroyed = position(&events, |e| matches!(e, MockEvent::DestroyGpuMemory { device: 0, memory } if *memory == base));
    assert!(view_unresident.is_some());
    assert!(view_unresident < view_destroyed);
    assert!(view_destroyed < base_destroyed);

    assert_eq!(platform.total_residency_refs(), 0);
    assert_eq!(platform.live_gpu_memory_count(), 0);
    assert_eq!(platform.live_host_block_count(), 0);
    assert_eq!(device.allocation_count(), 0);
}

#[test]
fn test_single_instance_ignores_source_device() {
    let TestDevice { device, .. } = TestDevice::new(3);
    let mut memory = AliasedAllocation::allocate(&device, &alloc_info(GART_USWC)).unwrap();

    let view = memory.resolve(2, 0).unwrap();
    assert_eq!(memory.resolve(2, 1).unwrap(), view);
    assert_eq!(memory.resolve(2, 2).unwrap(), view);
    // 只存在于 primary device
    assert_eq!(memory.resolve(0, 2).unwrap(), memory.cached(0, 0).unwrap());

    memory.free();
}

#[test]
fn test_multi_instance_peer_views() {
    let TestDevice { platform, device } = TestDevice::new(2);
    let mut memory = AliasedAllocation::allocate(&device, &alloc_info(INVISIBLE)).unwrap();
    assert!(memory.is_multi_instance());
    assert!(memory.info().flags.contains(GpuMemoryFlags::PEER_WRITABLE));
    assert!(memory.info().flags.contains(GpuMemoryFlags::CPU_INVISIBLE));

    let base0 = memory.resolve(0, 0).unwrap();
    let base1 = memory.resolve(1, 1).unwrap();
    assert_ne!(base0, base1);

    platform.take_events();
    let view = memory.resolve(0, 1).unwrap();
    let events = platform.take_events();
    assert_eq!(
        count(&events, |e| matches!(e, MockEvent::OpenPeerGpuMemory { device: 0, original, .. } if *original == base1)),
        1
    );
    assert_eq!(platform.gpu_memory_device(view), Some(0));

    assert!(matches!(memory.resolve(0, 2), Err(IcdError::InvalidOperation(_))));
    assert_eq!(memory.map(0), Err(IcdError::MemoryMapFailed));

    memory.free();
    assert_eq!(platform.live_gpu_memory_count(), 0);
}

#[test]
fn test_residency_failure_leaves_cell_empty() {
    let TestDevice { platform, device } = TestDevice::new(2);
    let mut memory = AliasedAllocation::allocate(&device, &alloc_info(LOCAL_VISIBLE)).unwrap();
    let live = platform.live_gpu_memory_count();

    platform.fail_next(FailPoint::AddResidency, Some(1), HalError::OutOfMemory);
    assert_eq!(memory.resolve(1, 0), Err(IcdError::OUT_OF_HOST_MEMORY));
    assert_eq!(memory.cached(1, 0), None);
    assert_eq!(platform.live_gpu_memory_count(), live);
    assert_eq!(platform.live_host_block_count(), 0);

    let view = memory.resolve(1, 0).unwrap();
    assert_eq!(memory.cached(1, 0), Some(view));

    memory.free();
    assert_eq!(platform.total_residency_refs(), 0);
}

#[test]
fn test_construction_unwinds_on_partial_failure() {
    let TestDevice { platform, device } = TestDevice::new(3);

    platform.fail_next(FailPoint::CreateGpuMemory, Some(2), HalError::OutOfGpuMemory);
    let result = AliasedAllocation::allocate(&device, &alloc_info(INVISIBLE));
    assert_eq!(result.err(), Some(IcdError::OUT_OF_DEVICE_MEMORY));

    assert_eq!(platform.live_gpu_memory_count(), 0);
    assert_eq!(platform.total_residency_refs(), 0);
    assert_eq!(device.allocation_count(), 0);

    // 按相反的顺序撤销
    let destroyed = platform
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MockEvent::DestroyGpuMemory { device, .. } => Some(device),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(destroyed, vec![1, 0]);
}

#[test]
fn test_create_failure_keeps_device_error() {
    let TestDevice { platform, device } = TestDevice::new(2);

    platform.fail_next(FailPoint::CreateGpuMemory, Some(1), HalError::DeviceLost);
    let result = AliasedAllocation::allocate(&device, &alloc_info(INVISIBLE));
    assert_eq!(result.err(), Some(IcdError::DeviceOperationFailed(HalError::DeviceLost)));
    assert_eq!(platform.live_gpu_memory_count(), 0);
    assert_eq!(device.allocation_count(), 0);

    platform.fail_next(FailPoint::CreateGpuMemory, Some(0), HalError::OutOfMemory);
    let result = AliasedAllocation::allocate(&device, &alloc_info(INVISIBLE));
    assert_eq!(result.err(), Some(IcdError::OUT_OF_HOST_MEMORY));
    assert_eq!(platform.live_gpu_memory_count(), 0);
}

#[test]
fn test_size_budget_charged_once() {
    let settings = RuntimeSettings {
        enable_allocation_size_tracking: true,
        ..Default::default()
    };
    let TestDevice { device, .. } = TestDevice::with_settings(2, settings);

    let memory = AliasedAllocation::allocate(&device, &alloc_info(LOCAL_VISIBLE)).unwrap();
    assert_eq!(memory.size_accounted_mask(), DeviceMask::all(2));
    assert_eq!(device.allocated_memory_size(0, GpuHeap::Local), SIZE);
    assert_eq!(device.allocated_memory_size(1, GpuHeap::Local), SIZE);

    let too_big = MemoryAllocateInfo {
        allocation_size: LOCAL_HEAP_SIZE,
        ..alloc_info(LOCAL_VISIBLE)
    };
    let result = AliasedAllocation::allocate(&device, &too_big);
    assert_eq!(result.err(), Some(IcdError::OUT_OF_DEVICE_MEMORY));
    assert_eq!(device.allocation_count(), 1);

    memory.free();
    assert_eq!(device.allocated_memory_size(0, GpuHeap::Local), 0);
    assert_eq!(device.allocated_memory_size(1, GpuHeap::Local), 0);
    assert_eq!(device.allocation_count(), 0);
}

#[test]
fn test_device_mask_override() {
    let TestDevice { platform, device } = TestDevice::new(3);
    let info = MemoryAllocateInfo {
        device_mask: Some(DeviceMask::from_bits(0b110)),
        ..alloc_info(INVISIBLE)
    };
    let mut memory = AliasedAllocation::allocate(&device, &info).unwrap();
    assert_eq!(memory.primary_device_index(), 1);
    assert!(memory.is_multi_instance());
    assert_eq!(memory.cached(0, 0), None);
    assert!(matches!(memory.resolve(1, 0), Err(IcdError::InvalidOperation(_))));
    assert!(memory.resolve(0, 2).is_ok());

    memory.free();
    assert_eq!(platform.live_gpu_memory_count(), 0);
}

#[test]
fn test_map_single_instance() {
    let TestDevice { platform, device } = TestDevice::new(1);
    platform.set_next_virt_addr(0x4_0000_0000);
    let memory = AliasedAllocation::allocate(&device, &alloc_info(GART_CACHEABLE)).unwrap();

    // 默认不覆盖 heap
    assert_eq!(memory.info().preferred_heap(), Some(GpuHeap::GartCacheable));
    assert_eq!(memory.map(0x10), Ok(0x4_0000_0010));
    let base = memory.cached(0, 0).unwrap();
    assert!(platform.is_gpu_memory_mapped(base));
    memory.unmap().unwrap();
    assert_eq!(memory.commitment(), SIZE);

    memory.free();
}

#[test]
fn test_gart_cacheable_override() {
    let settings = RuntimeSettings {
        override_heap_gart_cacheable_to_uswc: true,
        ..Default::default()
    };
    let TestDevice { device, .. } = TestDevice::with_settings(1, settings);
    let memory = AliasedAllocation::allocate(&device, &alloc_info(GART_CACHEABLE)).unwrap();
    assert_eq!(memory.info().preferred_heap(), Some(GpuHeap::GartUswc));
    memory.free();
}

#[test]
fn test_zero_size_allocation_has_no_backing() {
    let TestDevice { platform, device } = TestDevice::new(2);
    let info = MemoryAllocateInfo {
        allocation_size: 0,
        ..alloc_info(LOCAL_VISIBLE)
    };
    let mut memory = AliasedAllocation::allocate(&device, &info).unwrap();
    assert_eq!(platform.live_gpu_memory_count(), 0);
    assert!(matches!(memory.resolve(0, 0), Err(IcdError::InvalidOperation(_))));

    memory.free();
    assert_eq!(device.allocation_count(), 0);
}

#[test]
fn test_import_and_export_external_memory() {
    let TestDevice { platform, device } = TestDevice::new(2);
    let handle = platform.new_external_handle();
    let info = MemoryAllocateInfo {
        import: Some(ExternalGpuMemoryOpenInfo {
            handle: Some(handle),
            ..Default::default()
        }),
        ..alloc_info(LOCAL_VISIBLE)
    };
    let memory = AliasedAllocation::allocate(&device, &info).unwrap();
    assert!(!memory.is_multi_instance());

    let exported = memory.share_handle().unwrap();
    platform.device(0).release_external_handle(exported);

    memory.free();
    assert_eq!(platform.live_external_handle_count(), 0);
    assert_eq!(platform.live_gpu_memory_count(), 0);

    let unknown = MemoryAllocateInfo {
        import: Some(ExternalGpuMemoryOpenInfo::default()),
        ..alloc_info(LOCAL_VISIBLE)
    };
    let result = AliasedAllocation::allocate(&device, &unknown);
    assert_eq!(result.err(), Some(IcdError::InvalidExternalHandle));
    assert_eq!(device.allocation_count(), 0);
}

#[test]
fn test_allocation_priority() {
    let TestDevice { platform, device } = TestDevice::new(1);
    let info = MemoryAllocateInfo {
        priority: Some(1.0),
        ..alloc_info(LOCAL_VISIBLE)
    };
    let memory = AliasedAllocation::allocate(&device, &info).unwrap();
    let base = memory.cached(0, 0).unwrap();
    assert_eq!(platform.gpu_memory_priority(base), Some((GpuMemPriority::VeryHigh, 0)));

    // 不会降低
    memory.elevate_priority(MemoryPriority::new(GpuMemPriority::Low, 3));
    assert_eq!(memory.priority(), MemoryPriority::new(GpuMemPriority::VeryHigh, 0));

    memory.free();
}

#[test]
fn test_concurrent_priority_elevation() {
    let TestDevice { platform, device } = TestDevice::new(2);
    let memory = AliasedAllocation::allocate(&device, &alloc_info(INVISIBLE)).unwrap();

    std::thread::scope(|s| {
        for offset in 0..8 {
            let memory = &memory;
            s.spawn(move || memory.elevate_priority(MemoryPriority::new(GpuMemPriority::High, offset)));
        }
    });

    let highest = MemoryPriority::new(GpuMemPriority::High, 7);
    assert_eq!(memory.priority(), highest);
    for device_index in 0..2 {
        let base = memory.cached(device_index, device_index).unwrap();
        assert_eq!(platform.gpu_memory_priority(base), Some((GpuMemPriority::High, 7)));
    }

    memory.free();
}

#[test]
fn test_pinned_host_memory() {
    let TestDevice { platform, device } = TestDevice::new(1);
    let info = MemoryAllocateInfo {
        pinned_host_address: Some(0x7f00_0000_0000),
        ..alloc_info(GART_CACHEABLE)
    };
    let memory = AliasedAllocation::allocate(&device, &info).unwrap();
    let events = platform.events();
    assert_eq!(count(&events, |e| matches!(e, MockEvent::CreatePinnedGpuMemory { device: 0, .. })), 1);
    assert_eq!(platform.total_residency_refs(), 1);
    memory.free();

    platform.fail_next(FailPoint::CreatePinnedGpuMemory, None, HalError::OutOfMemory);
    let result = AliasedAllocation::allocate(&device, &info);
    assert_eq!(result.err(), Some(IcdError::InvalidExternalHandle));
    assert_eq!(platform.live_gpu_memory_count(), 0);
    assert_eq!(device.allocation_count(), 0);

    // 地址范围不能被固定时不会创建任何 memory
    platform.take_events();
    platform.fail_next(FailPoint::PinnedGpuMemorySize, None, HalError::InvalidExternalHandle);
    let result = AliasedAllocation::allocate(&device, &info);
    assert_eq!(result.err(), Some(IcdError::InvalidExternalHandle));
    let events = platform.take_events();
    assert_eq!(count(&events, |e| matches!(e, MockEvent::CreatePinnedGpuMemory { .. })), 0);
    assert_eq!(device.allocation_count(), 0);
}
