use ash::vk;
use derive_getters::Getters;
use indexmap::IndexMap;
use mgpu_hal::cmd::HalCmdBufferCreateInfo;
use mgpu_hal::handles::{CmdAllocatorHandle, HalCmdBufferHandle, HostBlock, StackAllocatorHandle};
use mgpu_hal::render_state::{DepthStencilStateCreateInfo, DepthStencilStates};
use scopeguard::ScopeGuard;
use slotmap::new_key_type;

use crate::cmd_pool::registry::CmdBufferRegistry;
use crate::cmd_pool::tracked::TrackedResources;
use crate::device::Device;
use crate::error::{IcdError, IcdResult};

new_key_type! { pub struct CmdBufferKey; }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdBufferState {
    Initial,
    Recording,
    Executable,
}

/// command buffer 操作时需要访问的 pool 状态
pub(crate) struct PoolContext<'a> {
    pub device: &'a Device,
    pub tracked: &'a mut TrackedResources,
    pub registry: &'a mut CmdBufferRegistry,
}

/// 从 [`crate::cmd_pool::CmdPool`] 分配的 command buffer，每个设备上有一个 HAL command buffer
///
/// 录制期间通过 pool 获得的资源（depth stencil state、host 内存、stack allocator）记录在这里，
/// 同时也被 pool 追踪。`generation` 是最近一次同步时 pool 的 generation：
/// 两者不同说明 pool reset 已经回收了这些资源，此时只能忘掉它们，不能再归还一次。
#[derive(Getters)]
pub struct CmdBuffer {
    key: CmdBufferKey,
    level: vk::CommandBufferLevel,
    state: CmdBufferState,
    generation: u64,

    #[getter(skip)]
    hal_cmd_buffers: Vec<HalCmdBufferHandle>,

    /// 相同的 state 在一次录制中只向 pool 申请一次
    #[getter(skip)]
    depth_stencil_states: IndexMap<DepthStencilStateCreateInfo, DepthStencilStates>,
    #[getter(skip)]
    host_allocs: Vec<HostBlock>,
    #[getter(skip)]
    stack_allocator: Option<StackAllocatorHandle>,
}

// new & init
impl CmdBuffer {
    pub(crate) fn new(
        key: CmdBufferKey,
        device: &Device,
        allocators: &[CmdAllocatorHandle],
        queue_family_index: u32,
        level: vk::CommandBufferLevel,
        generation: u64,
    ) -> IcdResult<Self> {
        let mut created = scopeguard::guard(Vec::with_capacity(allocators.len()), |created| {
            for (device_index, cmd_buffer) in created.into_iter().enumerate().rev() {
                device.hal_device(device_index).destroy_cmd_buffer(cmd_buffer);
            }
        });

        for (device_index, allocator) in allocators.iter().enumerate() {
            let create_info = HalCmdBufferCreateInfo {
                allocator: *allocator,
                queue_family_index,
                level,
            };
            created.push(device.hal_device(device_index).create_cmd_buffer(&create_info)?);
        }

        Ok(Self {
            key,
            level,
            state: CmdBufferState::Initial,
            generation,
            hal_cmd_buffers: ScopeGuard::into_inner(created),
            depth_stencil_states: IndexMap::new(),
            host_allocs: Vec::new(),
            stack_allocator: None,
        })
    }

    /// 释放 pool 资源和 HAL command buffer，并从 pool 中注销
    pub(crate) fn destroy(mut self, ctx: &mut PoolContext) {
        self.release_pool_resources(ctx, true);

        for (device_index, cmd_buffer) in self.hal_cmd_buffers.drain(..).enumerate() {
            ctx.device.hal_device(device_index).destroy_cmd_buffer(cmd_buffer);
        }
        ctx.registry.unregister(self.key);
    }
}

// lifecycle
impl CmdBuffer {
    pub(crate) fn begin(&mut self, ctx: &mut PoolContext) -> IcdResult<()> {
        match self.state {
            CmdBufferState::Recording => return Err(IcdError::InvalidOperation("cmd buffer is already recording")),
            // 隐式 reset
            CmdBufferState::Executable => self.reset(ctx, false)?,
            CmdBufferState::Initial => self.sync_generation(ctx.tracked.generation()),
        }

        for (device_index, cmd_buffer) in self.hal_cmd_buffers.iter().enumerate() {
            ctx.device.hal_device(device_index).begin_cmd_buffer(*cmd_buffer)?;
        }
        self.state = CmdBufferState::Recording;
        Ok(())
    }

    /// 结束录制；持有 pool 资源时需要在 pool reset 时被单独 reset
    pub(crate) fn end(&mut self, ctx: &mut PoolContext) -> IcdResult<()> {
        if self.state != CmdBufferState::Recording {
            return Err(IcdError::InvalidOperation("cmd buffer is not recording"));
        }

        for (device_index, cmd_buffer) in self.hal_cmd_buffers.iter().enumerate() {
            ctx.device.hal_device(device_index).end_cmd_buffer(*cmd_buffer)?;
        }

        if self.holds_pool_resources() {
            ctx.registry.mark_explicit_reset(self.key)?;
        } else {
            ctx.registry.unmark_explicit_reset(self.key);
        }
        self.state = CmdBufferState::Executable;
        Ok(())
    }

    /// `release_resources` 为 false 时保留缓存的 depth stencil state 供下一次录制使用
    pub(crate) fn reset(&mut self, ctx: &mut PoolContext, release_resources: bool) -> IcdResult<()> {
        self.release_pool_resources(ctx, release_resources);

        for (device_index, cmd_buffer) in self.hal_cmd_buffers.iter().enumerate() {
            ctx.device.hal_device(device_index).reset_cmd_buffer(*cmd_buffer)?;
        }

        if self.depth_stencil_states.is_empty() {
            ctx.registry.unmark_explicit_reset(self.key);
        }
        self.state = CmdBufferState::Initial;
        Ok(())
    }

    /// pool 的 allocator 被 reset 后，HAL command buffer 已经回到初始状态
    pub(crate) fn on_allocator_reset(&mut self) {
        self.state = CmdBufferState::Initial;
    }
}

// recording
impl CmdBuffer {
    pub(crate) fn set_depth_stencil_state(
        &mut self,
        ctx: &mut PoolContext,
        info: &DepthStencilStateCreateInfo,
    ) -> IcdResult<DepthStencilStates> {
        self.ensure_recording()?;
        if let Some(states) = self.depth_stencil_states.get(info) {
            return Ok(*states);
        }

        let states = ctx
            .tracked
            .create_depth_stencil_state(ctx.device, info, vk::SystemAllocationScope::OBJECT)?;
        self.depth_stencil_states.insert(*info, states);
        Ok(states)
    }

    pub(crate) fn alloc_host_mem(&mut self, ctx: &mut PoolContext, size: usize) -> IcdResult<HostBlock> {
        self.ensure_recording()?;
        let block = ctx.tracked.alloc_mem(ctx.device, size, vk::SystemAllocationScope::COMMAND)?;
        self.host_allocs.push(block);
        Ok(block)
    }

    /// 一次录制只使用一个 stack allocator
    pub(crate) fn acquire_stack_allocator(&mut self, ctx: &mut PoolContext) -> IcdResult<StackAllocatorHandle> {
        self.ensure_recording()?;
        if let Some(allocator) = self.stack_allocator {
            return Ok(allocator);
        }

        let allocator = ctx.tracked.acquire_stack_allocator(ctx.device)?;
        self.stack_allocator = Some(allocator);
        Ok(allocator)
    }
}

// tools
impl CmdBuffer {
    #[inline]
    pub fn holds_pool_resources(&self) -> bool {
        !self.depth_stencil_states.is_empty() || !self.host_allocs.is_empty() || self.stack_allocator.is_some()
    }

    /// 超出设备数量时返回 None
    #[inline]
    pub fn hal_cmd_buffer(&self, device_index: usize) -> Option<HalCmdBufferHandle> {
        self.hal_cmd_buffers.get(device_index).copied()
    }

    #[inline]
    fn ensure_recording(&self) -> IcdResult<()> {
        if self.state == CmdBufferState::Recording {
            Ok(())
        } else {
            Err(IcdError::InvalidOperation("cmd buffer is not recording"))
        }
    }

    /// pool 已经进入新的 generation 时，缓存的资源都已被回收，直接忘掉
    fn sync_generation(&mut self, pool_generation: u64) {
        if self.generation == pool_generation {
            return;
        }
        if self.holds_pool_resources() {
            log::debug!(
                "cmd buffer {:?} forgets resources of generation {} (pool is at {})",
                self.key,
                self.generation,
                pool_generation
            );
        }
        self.depth_stencil_states.clear();
        self.host_allocs.clear();
        self.stack_allocator = None;
        self.generation = pool_generation;
    }

    /// 通过 pool 归还资源；`release_states` 为 false 时保留缓存的 depth stencil state
    fn release_pool_resources(&mut self, ctx: &mut PoolContext, release_states: bool) {
        self.sync_generation(ctx.tracked.generation());

        for block in self.host_allocs.drain(..) {
            ctx.tracked.free_mem(ctx.device, block);
        }
        if let Some(allocator) = self.stack_allocator.take() {
            ctx.tracked.release_stack_allocator(ctx.device, allocator);
        }
        if release_states {
            for (_, states) in self.depth_stencil_states.drain(..) {
                ctx.tracked.destroy_depth_stencil_state(ctx.device, &states);
            }
        }
    }
}
