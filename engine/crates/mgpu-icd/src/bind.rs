//! buffer / image 绑定 memory 时，为每个设备挑选要使用的 memory instance

use ash::vk;
use mgpu_hal::handles::GpuMemoryHandle;
use mgpu_hal::{DEFAULT_DEVICE_INDEX, MAX_DEVICES};

use crate::error::{IcdError, IcdResult};
use crate::memory::{AliasedAllocation, MemoryPriority};
use crate::settings::RuntimeSettings;

/// `indices[R]` 是设备 R 上的资源要使用的 memory instance
///
/// 显式给出的 `device_indices` 原样使用；否则 multi-instance 的内存用各设备自己的那一份，
/// 单实例的内存都指向 default device。
pub fn generate_bind_indices(num_devices: usize, device_indices: &[u32], multi_instance: bool) -> [u32; MAX_DEVICES] {
    let mut indices = [DEFAULT_DEVICE_INDEX as u32; MAX_DEVICES];

    if !device_indices.is_empty() {
        debug_assert_eq!(device_indices.len(), num_devices);
        for (slot, index) in indices.iter_mut().zip(device_indices) {
            *slot = *index;
        }
    } else if multi_instance {
        for (device_index, slot) in indices.iter_mut().enumerate().take(num_devices) {
            *slot = device_index as u32;
        }
    }

    indices
}

/// 绑定时 memory 至少要达到的优先级，image 使用单独的配置
#[inline]
pub fn bind_priority(settings: &RuntimeSettings, is_image: bool) -> MemoryPriority {
    if is_image {
        MemoryPriority::from_setting(settings.memory_priority_image_any)
    } else {
        MemoryPriority::from_setting(settings.memory_priority_default)
    }
}

/// memory 的 GPU 虚拟地址不满足 `alignment` 时需要额外跳过的字节数
#[inline]
fn base_addr_offset(gpu_virt_addr: u64, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 || gpu_virt_addr % alignment == 0 {
        return 0;
    }
    gpu_virt_addr.next_multiple_of(alignment) - gpu_virt_addr
}

/// 把 `memory` 的 `offset` 处绑定到每个设备上的资源
///
/// 返回 `result[R]`：设备 R 上应当使用的 HAL memory 以及在其中的偏移。
/// 需要的 view 会在这里按需打开。应用自己控制优先级时不修改 memory 的优先级。
pub fn bind_memory(
    memory: &mut AliasedAllocation,
    offset: vk::DeviceSize,
    requirements: &vk::MemoryRequirements,
    num_devices: usize,
    device_indices: &[u32],
    priority: MemoryPriority,
    app_controlled_priority: bool,
) -> IcdResult<Vec<(GpuMemoryHandle, vk::DeviceSize)>> {
    let _span = tracy_client::span!("bind_memory");

    if !device_indices.is_empty() && device_indices.len() != num_devices {
        return Err(IcdError::InvalidOperation("device index count does not match device count"));
    }

    let indices = generate_bind_indices(num_devices, device_indices, memory.is_multi_instance());

    let mut bound = Vec::with_capacity(num_devices);
    for (local_index, source_index) in indices.iter().take(num_devices).enumerate() {
        let gpu_memory = memory.resolve(local_index, *source_index as usize)?;

        let desc = memory.gpu_memory_desc(local_index, gpu_memory);
        let offset = base_addr_offset(desc.gpu_virt_addr, requirements.alignment) + offset;
        bound.push((gpu_memory, offset));
    }

    if !app_controlled_priority {
        memory.elevate_priority(priority);
    }

    Ok(bound)
}
