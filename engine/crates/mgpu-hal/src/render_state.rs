use ash::vk;

use crate::error::HalResult;
use crate::handles::{DepthStencilStateHandle, MAX_DEVICES};

/// depth stencil state 的 key，cache 对相同的 key 返回相同的对象
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilStateCreateInfo {
    pub depth_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: vk::CompareOp,
    pub depth_bounds_enable: bool,
    pub stencil_enable: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
        }
    }
}

impl Default for DepthStencilStateCreateInfo {
    fn default() -> Self {
        Self {
            depth_enable: true,
            depth_write_enable: true,
            depth_func: vk::CompareOp::LESS_OR_EQUAL,
            depth_bounds_enable: false,
            stencil_enable: false,
            front: StencilOpState::default(),
            back: StencilOpState::default(),
        }
    }
}

/// 一个 render state 在每个设备上各有一个对象
///
/// 整个数组作为一个 handle 使用：cache 对相同 key 返回相同的数组。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DepthStencilStates {
    pub per_device: [Option<DepthStencilStateHandle>; MAX_DEVICES],
}

/// 由 device 持有的 render state cache
///
/// 每次 create 都会在 cache 内增加一次引用，需要对应次数的 destroy。
pub trait RenderStateCache: Send + Sync {
    fn create_depth_stencil_state(
        &self,
        info: &DepthStencilStateCreateInfo,
        parent_scope: vk::SystemAllocationScope,
    ) -> HalResult<DepthStencilStates>;

    fn destroy_depth_stencil_state(&self, states: &DepthStencilStates);
}
