/// HAL 调用的失败原因
///
/// 对上层来说这些错误是不透明的，只有内存耗尽和外部 handle 无效会被单独区分。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    #[error("out of host memory")]
    OutOfMemory,

    #[error("out of gpu memory")]
    OutOfGpuMemory,

    #[error("invalid external handle")]
    InvalidExternalHandle,

    #[error("device lost")]
    DeviceLost,

    #[error("unknown hal failure (code {0})")]
    Unknown(i32),
}

pub type HalResult<T> = Result<T, HalError>;
