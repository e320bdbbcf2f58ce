use mgpu_hal::memory::{GPU_MEM_PRIORITY_OFFSET_COUNT, GpuMemPriority};

/// HAL 优先级等级加上等级内的 offset
///
/// 先比较等级，再比较 offset。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryPriority {
    pub priority: GpuMemPriority,
    pub offset: u32,
}

/// `[0.0, 1.0)` 被均分成的档位数：VeryLow ~ High 四个等级，每个等级 8 档
const TOTAL_MEMORY_PRIORITY_STEPS: f32 = 32.0;

impl MemoryPriority {
    #[inline]
    pub fn new(priority: GpuMemPriority, offset: u32) -> Self {
        Self {
            priority,
            offset: offset.min(GPU_MEM_PRIORITY_OFFSET_COUNT - 1),
        }
    }

    /// 解码配置中的优先级：高 4 位是等级，低 4 位是 offset
    pub fn from_setting(value: u32) -> Self {
        Self::new(GpuMemPriority::from_raw(value / 16), value % 16)
    }

    /// `VkMemoryPriorityAllocateInfoEXT::priority` 到 HAL 优先级的映射
    ///
    /// 0.5 映射到 Normal / 0，与默认配置一致；1.0 映射到 VeryHigh / 0。
    pub fn from_vk_priority(value: f32) -> Self {
        debug_assert!((0.0..=1.0).contains(&value), "memory priority {value} out of range");
        let steps = (value.clamp(0.0, 1.0) * TOTAL_MEMORY_PRIORITY_STEPS) as u32;
        Self::new(GpuMemPriority::from_raw(steps / 8 + 1), steps % 8)
    }

    /// 压缩成一个保序的整数，便于原子地读写
    #[inline]
    pub(crate) fn pack(self) -> u32 {
        ((self.priority as u32) << 4) | self.offset
    }

    #[inline]
    pub(crate) fn unpack(packed: u32) -> Self {
        Self::new(GpuMemPriority::from_raw(packed >> 4), packed & 0xf)
    }
}
