use ash::vk;
use mgpu_hal::HalError;

/// 耗尽的资源种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    HostMemory,
    DeviceMemory,
    /// 超过了 device 允许的 memory allocation 数量
    ObjectCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IcdError {
    #[error("resource exhausted: {0:?}")]
    ResourceExhausted(Exhausted),

    /// 违反调用约定；debug 构建下会先触发断言
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("device operation failed: {0}")]
    DeviceOperationFailed(HalError),

    #[error("invalid external handle")]
    InvalidExternalHandle,

    #[error("memory map failed")]
    MemoryMapFailed,
}

pub type IcdResult<T> = Result<T, IcdError>;

impl IcdError {
    pub const OUT_OF_HOST_MEMORY: Self = Self::ResourceExhausted(Exhausted::HostMemory);
    pub const OUT_OF_DEVICE_MEMORY: Self = Self::ResourceExhausted(Exhausted::DeviceMemory);
    pub const TOO_MANY_OBJECTS: Self = Self::ResourceExhausted(Exhausted::ObjectCount);
}

impl From<HalError> for IcdError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => Self::OUT_OF_HOST_MEMORY,
            HalError::OutOfGpuMemory => Self::OUT_OF_DEVICE_MEMORY,
            HalError::InvalidExternalHandle => Self::InvalidExternalHandle,
            other => Self::DeviceOperationFailed(other),
        }
    }
}

impl From<IcdError> for vk::Result {
    fn from(err: IcdError) -> Self {
        match err {
            IcdError::ResourceExhausted(Exhausted::HostMemory) => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            IcdError::ResourceExhausted(Exhausted::DeviceMemory) => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            IcdError::ResourceExhausted(Exhausted::ObjectCount) => vk::Result::ERROR_TOO_MANY_OBJECTS,
            IcdError::InvalidOperation(_) => vk::Result::ERROR_VALIDATION_FAILED_EXT,
            IcdError::DeviceOperationFailed(HalError::DeviceLost) => vk::Result::ERROR_DEVICE_LOST,
            IcdError::DeviceOperationFailed(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
            IcdError::InvalidExternalHandle => vk::Result::ERROR_INVALID_EXTERNAL_HANDLE,
            IcdError::MemoryMapFailed => vk::Result::ERROR_MEMORY_MAP_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hal_error_mapping() {
        assert_eq!(IcdError::from(HalError::OutOfMemory), IcdError::OUT_OF_HOST_MEMORY);
        assert_eq!(IcdError::from(HalError::OutOfGpuMemory), IcdError::OUT_OF_DEVICE_MEMORY);
        assert_eq!(IcdError::from(HalError::InvalidExternalHandle), IcdError::InvalidExternalHandle);
        assert_eq!(
            IcdError::from(HalError::Unknown(7)),
            IcdError::DeviceOperationFailed(HalError::Unknown(7))
        );
    }

    #[test]
    fn test_vk_result_mapping() {
        assert_eq!(vk::Result::from(IcdError::TOO_MANY_OBJECTS), vk::Result::ERROR_TOO_MANY_OBJECTS);
        assert_eq!(
            vk::Result::from(IcdError::DeviceOperationFailed(HalError::DeviceLost)),
            vk::Result::ERROR_DEVICE_LOST
        );
        assert_eq!(vk::Result::from(IcdError::MemoryMapFailed), vk::Result::ERROR_MEMORY_MAP_FAILED);
    }
}
