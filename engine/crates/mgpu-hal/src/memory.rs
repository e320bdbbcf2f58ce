use ash::vk;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::handles::{ExternalHandle, GpuMemoryHandle};

/// gpu memory 所在的 heap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuHeap {
    /// device local 且 CPU 可见
    Local,
    /// device local，CPU 不可见
    Invisible,
    /// system memory，write combined
    GartUswc,
    /// system memory，cacheable
    GartCacheable,
}

impl GpuHeap {
    pub const COUNT: usize = 4;

    /// system memory 中的 heap 可以被其他设备以 shared view 的方式打开；
    /// device local heap 只能在同一个 linked group 内以 peer view 打开
    #[inline]
    pub fn is_system_visible(self) -> bool {
        matches!(self, Self::GartUswc | Self::GartCacheable)
    }

    /// 参与显存预算统计的 heap
    #[inline]
    pub fn is_device_local(self) -> bool {
        matches!(self, Self::Local | Self::Invisible)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GpuMemoryFlags: u32 {
        /// 可以被其他设备以 shared view 打开
        const SHAREABLE     = 1 << 0;
        /// multi-GPU 下允许 peer 设备写入
        const PEER_WRITABLE = 1 << 1;
        const CPU_INVISIBLE = 1 << 2;
        /// 可以导出给其他进程
        const INTERPROCESS  = 1 << 3;
        const GL2_UNCACHED  = 1 << 4;
        const TMZ_PROTECTED = 1 << 5;
    }
}

/// HAL 的内存优先级等级
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GpuMemPriority {
    Unused = 0,
    VeryLow = 1,
    Low = 2,
    #[default]
    Normal = 3,
    High = 4,
    VeryHigh = 5,
}

impl GpuMemPriority {
    pub const COUNT: u32 = 6;

    /// 超出范围的值按最高优先级处理
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::Unused,
            1 => Self::VeryLow,
            2 => Self::Low,
            3 => Self::Normal,
            4 => Self::High,
            _ => Self::VeryHigh,
        }
    }
}

/// 每个优先级等级内部的细分档位数
pub const GPU_MEM_PRIORITY_OFFSET_COUNT: u32 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuMemoryCreateInfo {
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    /// 按优先顺序排列，第一个是 preferred heap
    pub heaps: Vec<GpuHeap>,
    pub flags: GpuMemoryFlags,
    pub priority: GpuMemPriority,
    pub priority_offset: u32,
}

impl GpuMemoryCreateInfo {
    #[inline]
    pub fn preferred_heap(&self) -> Option<GpuHeap> {
        self.heaps.first().copied()
    }
}

/// 把 host 上已有的一段内存固定下来给 GPU 使用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinnedGpuMemoryCreateInfo {
    pub size: vk::DeviceSize,
    /// host 地址，必须按 HAL 的分配粒度对齐
    pub host_address: u64,
    pub alignment: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalGpuMemoryOpenInfo {
    /// `None` 表示通过名字打开
    pub handle: Option<ExternalHandle>,
    pub nt_handle: bool,
    pub android_hw_buf: bool,
}

/// HAL 报告的 gpu memory 属性
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuMemoryDesc {
    pub gpu_virt_addr: u64,
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub preferred_heap: GpuHeap,
}

/// 打开 external memory 的结果：HAL 对象以及 HAL 推导出的创建参数
#[derive(Clone, Debug)]
pub struct OpenedExternalMemory {
    pub memory: GpuMemoryHandle,
    pub create_info: GpuMemoryCreateInfo,
}
