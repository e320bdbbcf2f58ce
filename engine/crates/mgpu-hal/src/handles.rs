use std::fmt;

/// 一个 device group 中最多支持的物理设备数量
pub const MAX_DEVICES: usize = 4;

/// 默认设备，也是 single-instance 内存默认所在的设备
pub const DEFAULT_DEVICE_INDEX: usize = 0;

/// 用 bit 表示的一组设备，第 i 位对应 device i
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceMask(u32);

impl DeviceMask {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn single(device_index: usize) -> Self {
        Self(1 << device_index)
    }

    /// 包含前 `num_devices` 个设备
    #[inline]
    pub const fn all(num_devices: usize) -> Self {
        Self(((1u64 << num_devices) - 1) as u32)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, device_index: usize) -> bool {
        device_index < 32 && (self.0 & (1 << device_index)) != 0
    }

    #[inline]
    pub const fn is_subset_of(self, other: Self) -> bool {
        (self.0 & other.0) == self.0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// 最低位的设备序号
    #[inline]
    pub const fn first(self) -> Option<usize> {
        if self.0 == 0 { None } else { Some(self.0.trailing_zeros() as usize) }
    }

    /// 按从小到大的顺序遍历所有设备序号
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |i| self.contains(*i))
    }
}

impl fmt::Debug for DeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceMask({:#06b})", self.0)
    }
}

macro_rules! hal_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

hal_handle! {
    /// HAL command allocator，管理 command data / embedded data / scratch memory 的 chunk
    CmdAllocatorHandle;
    /// HAL command buffer，从某个 command allocator 中分配
    HalCmdBufferHandle;
    /// HAL gpu memory 对象：可能是真正的分配，也可能是 peer / shared view
    GpuMemoryHandle;
    /// 单个设备上的 depth stencil state 对象
    DepthStencilStateHandle;
    /// scratch 用的 virtual stack allocator
    StackAllocatorHandle;
    /// host 内存块的起始地址
    HostBlock;
    /// 由 OS 提供的外部共享 handle（例如 fd）
    ExternalHandle;
}
