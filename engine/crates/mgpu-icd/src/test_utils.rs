use std::sync::Arc;

use mgpu_hal::mock::{MOCK_BASE_ADDR_ALIGNMENT, MOCK_HEAP_SIZES, MockPlatform, mock_memory_types};

use crate::device::{Device, DeviceCreateInfo, MemoryProperties, MemoryType};
use crate::settings::RuntimeSettings;

/// mock 平台加上在它之上创建的 device
pub(crate) struct TestDevice {
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
        let device = Device::new(Self::create_info(&platform, settings, test_memory_properties()))
            .unwrap_or_else(|err| panic!("failed to create test device: {err}"));
        Self { platform, device }
    }

    pub fn create_info(
        platform: &MockPlatform,
        settings: RuntimeSettings,
        memory_properties: MemoryProperties,
    ) -> DeviceCreateInfo {
        DeviceCreateInfo {
            hal_devices: platform.hal_devices(),
            render_state_cache: platform.render_state_cache(),
            host_allocator: platform.host_allocator(),
            stack_allocators: platform.stack_allocators(),
            memory_properties,
            settings,
            app_controlled_mem_priority: false,
            device_coherent_memory: true,
        }
    }
}

pub(crate) fn test_memory_properties() -> MemoryProperties {
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
