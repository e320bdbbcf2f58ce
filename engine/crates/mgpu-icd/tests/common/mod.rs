#![allow(dead_code)]

use std::sync::Arc;

use ash::vk;
use mgpu_hal::memory::GpuHeap;
use mgpu_hal::mock::{MOCK_BASE_ADDR_ALIGNMENT, MOCK_HEAP_SIZES, MockEvent, MockPlatform, mock_memory_types};
use mgpu_icd::device::{Device, DeviceCreateInfo, MemoryProperties, MemoryType};
use mgpu_icd::settings::RuntimeSettings;

/// memory type index，与 [`mock_memory_types`] 一致
pub const LOCAL_VISIBLE: u32 = 0;
pub const INVISIBLE: u32 = 1;
pub const GART_USWC: u32 = 2;
pub const GART_CACHEABLE: u32 = 3;

pub const LOCAL_HEAP_SIZE: vk::DeviceSize = MOCK_HEAP_SIZES[GpuHeap::Local as usize];

pub struct TestDevice {
    pub platform: MockPlatform,
    pub device: Arc<Device>,
}

impl TestDevice {
    pub fn new(num_devices: usize) -> Self {
        Self::with_settings(num_devices, RuntimeSettings::default())
    }

    pub fn with_settings(num_devices: usize, settings: RuntimeSettings) -> Self {
        mgpu_crate_tools::init_log::init_test_log();

        let platform = MockPlatform::new(num_devices);
        let create_info = DeviceCreateInfo {
            hal_devices: platform.hal_devices(),
            render_state_cache: platform.render_state_cache(),
            host_allocator: platform.host_allocator(),
            stack_allocators: platform.stack_allocators(),
            memory_properties: memory_properties(),
            settings,
            app_controlled_mem_priority: false,
            device_coherent_memory: true,
        };
        let device = Device::new(create_info).unwrap();
        Self { platform, device }
    }
}

fn memory_properties() -> MemoryProperties {
    MemoryProperties {
        types: mock_memory_types()
            .into_iter()
            .map(|(heap, property_flags, multi_instance)| MemoryType {
                heap,
                property_flags,
                multi_instance,
            })
            .collect(),
        heap_sizes: MOCK_HEAP_SIZES,
        base_addr_alignment: MOCK_BASE_ADDR_ALIGNMENT,
    }
}

/// 第一个满足条件的事件的位置
pub fn position(events: &[MockEvent], pred: impl Fn(&MockEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

pub fn count(events: &[MockEvent], pred: impl Fn(&MockEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
