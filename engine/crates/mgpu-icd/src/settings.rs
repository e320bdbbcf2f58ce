use std::fs;
use std::path::Path;

use anyhow::Context;
use mgpu_hal::cmd::{CmdAllocInfo, CmdAllocType, CmdAllocatorCreateInfo};
use mgpu_hal::memory::GpuHeap;
use serde::{Deserialize, Serialize};

/// 驱动的默认配置
pub struct DefaultDriverSettings;
impl DefaultDriverSettings {
    pub const CMD_ALLOCATOR_DATA: CmdAllocInfo = CmdAllocInfo {
        alloc_heap: GpuHeap::GartUswc,
        alloc_size: 128 * 1024,
        suballoc_size: 8 * 1024,
    };
    pub const CMD_ALLOCATOR_EMBEDDED: CmdAllocInfo = CmdAllocInfo {
        alloc_heap: GpuHeap::GartUswc,
        alloc_size: 128 * 1024,
        suballoc_size: 8 * 1024,
    };
    pub const CMD_ALLOCATOR_SCRATCH: CmdAllocInfo = CmdAllocInfo {
        // scratch 只有 GPU 访问
        alloc_heap: GpuHeap::Invisible,
        alloc_size: 64 * 1024,
        suballoc_size: 8 * 1024,
    };

    /// 高 4 位是优先级等级，低 4 位是等级内的 offset；0x30 即 Normal / 0
    pub const MEMORY_PRIORITY_DEFAULT: u32 = 0x30;
    pub const MEMORY_PRIORITY_IMAGE_ANY: u32 = 0x40;

    /// Vulkan 要求 maxMemoryAllocationCount 至少为 4096
    pub const MAX_MEMORY_ALLOCATION_COUNT: u32 = 4096;
}

/// 运行时可调的驱动配置
///
/// 缺省的字段使用 [`DefaultDriverSettings`] 中的值，因此配置文件只需要写需要覆盖的项。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// 所有 command pool 共用 device 上的 command allocator
    pub use_shared_cmd_allocator: bool,
    /// 忽略 pool reset 时的 release resources 标志
    pub disable_reset_release_resources: bool,

    pub cmd_allocator_data_heap: GpuHeap,
    pub cmd_allocator_data_alloc_size: u64,
    pub cmd_allocator_data_suballoc_size: u64,
    pub cmd_allocator_embedded_heap: GpuHeap,
    pub cmd_allocator_embedded_alloc_size: u64,
    pub cmd_allocator_embedded_suballoc_size: u64,
    pub cmd_allocator_scratch_heap: GpuHeap,
    pub cmd_allocator_scratch_alloc_size: u64,
    pub cmd_allocator_scratch_suballoc_size: u64,

    pub memory_priority_default: u32,
    pub memory_priority_image_any: u32,

    /// 把 GART cacheable heap 上的分配改放到 USWC
    pub override_heap_gart_cacheable_to_uswc: bool,
    /// 按 heap 统计每个设备已分配的显存，超出 heap 大小时拒绝分配
    pub enable_allocation_size_tracking: bool,
    pub max_memory_allocation_count: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let data = DefaultDriverSettings::CMD_ALLOCATOR_DATA;
        let embedded = DefaultDriverSettings::CMD_ALLOCATOR_EMBEDDED;
        let scratch = DefaultDriverSettings::CMD_ALLOCATOR_SCRATCH;
        Self {
            use_shared_cmd_allocator: false,
            disable_reset_release_resources: false,

            cmd_allocator_data_heap: data.alloc_heap,
            cmd_allocator_data_alloc_size: data.alloc_size,
            cmd_allocator_data_suballoc_size: data.suballoc_size,
            cmd_allocator_embedded_heap: embedded.alloc_heap,
            cmd_allocator_embedded_alloc_size: embedded.alloc_size,
            cmd_allocator_embedded_suballoc_size: embedded.suballoc_size,
            cmd_allocator_scratch_heap: scratch.alloc_heap,
            cmd_allocator_scratch_alloc_size: scratch.alloc_size,
            cmd_allocator_scratch_suballoc_size: scratch.suballoc_size,

            memory_priority_default: DefaultDriverSettings::MEMORY_PRIORITY_DEFAULT,
            memory_priority_image_any: DefaultDriverSettings::MEMORY_PRIORITY_IMAGE_ANY,

            override_heap_gart_cacheable_to_uswc: false,
            enable_allocation_size_tracking: false,
            max_memory_allocation_count: DefaultDriverSettings::MAX_MEMORY_ALLOCATION_COUNT,
        }
    }
}

// load & save
impl RuntimeSettings {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("解析驱动配置失败")
    }

    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;

        let settings =
            Self::from_toml_str(&content).with_context(|| format!("解析 TOML 配置失败: {:?}", path.as_ref()))?;
        log::info!("driver settings loaded from {:?}", path.as_ref());

        Ok(settings)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        fs::write(path.as_ref(), content).with_context(|| format!("写入配置文件失败: {:?}", path.as_ref()))?;

        Ok(())
    }
}

// tools
impl RuntimeSettings {
    /// pool 私有的 command allocator 的创建参数
    pub fn cmd_allocator_create_info(&self) -> CmdAllocatorCreateInfo {
        let mut alloc_info = [DefaultDriverSettings::CMD_ALLOCATOR_DATA; CmdAllocType::COUNT];
        alloc_info[CmdAllocType::CommandData as usize] = CmdAllocInfo {
            alloc_heap: self.cmd_allocator_data_heap,
            alloc_size: self.cmd_allocator_data_alloc_size,
            suballoc_size: self.cmd_allocator_data_suballoc_size,
        };
        alloc_info[CmdAllocType::EmbeddedData as usize] = CmdAllocInfo {
            alloc_heap: self.cmd_allocator_embedded_heap,
            alloc_size: self.cmd_allocator_embedded_alloc_size,
            suballoc_size: self.cmd_allocator_embedded_suballoc_size,
        };
        alloc_info[CmdAllocType::GpuScratchMem as usize] = CmdAllocInfo {
            alloc_heap: self.cmd_allocator_scratch_heap,
            alloc_size: self.cmd_allocator_scratch_alloc_size,
            suballoc_size: self.cmd_allocator_scratch_suballoc_size,
        };

        CmdAllocatorCreateInfo {
            // pool 是外部同步的，reset 后 chunk 可以直接复用
            auto_memory_reuse: true,
            disable_busy_chunk_tracking: true,
            alloc_info,
        }
    }
}
