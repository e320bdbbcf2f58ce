use ash::vk;
use indexmap::{IndexMap, IndexSet};
use mgpu_hal::handles::{HostBlock, StackAllocatorHandle};
use mgpu_hal::render_state::{DepthStencilStateCreateInfo, DepthStencilStates};

use crate::device::Device;
use crate::error::{IcdError, IcdResult};

/// command buffer 在录制期间借助 pool 获得的资源
///
/// allocator reset 不会回收它们，由 pool reset 统一归还。每次归还后 `generation` 加一，
/// command buffer 据此判断自己缓存的资源是否已经被 pool 回收。
#[derive(Debug, Default)]
pub struct TrackedResources {
    /// 同一个 state 可能被创建多次，记录未归还的次数
    depth_stencil_states: IndexMap<DepthStencilStates, u32>,
    host_allocs: IndexSet<HostBlock>,
    stack_allocators: IndexSet<StackAllocatorHandle>,

    generation: u64,
}

// depth stencil state
impl TrackedResources {
    pub fn create_depth_stencil_state(
        &mut self,
        device: &Device,
        info: &DepthStencilStateCreateInfo,
        parent_scope: vk::SystemAllocationScope,
    ) -> IcdResult<DepthStencilStates> {
        let cache = device.render_state_cache();
        let states = cache.create_depth_stencil_state(info, parent_scope)?;

        if self.depth_stencil_states.try_reserve(1).is_err() {
            cache.destroy_depth_stencil_state(&states);
            return Err(IcdError::OUT_OF_HOST_MEMORY);
        }
        *self.depth_stencil_states.entry(states).or_insert(0) += 1;
        Ok(states)
    }

    pub fn destroy_depth_stencil_state(&mut self, device: &Device, states: &DepthStencilStates) {
        device.render_state_cache().destroy_depth_stencil_state(states);

        match self.depth_stencil_states.get_mut(states) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.depth_stencil_states.shift_remove(states);
            }
            None => debug_assert!(false, "destroying untracked depth stencil state {states:?}"),
        }
    }
}

// host memory
impl TrackedResources {
    pub fn alloc_mem(
        &mut self,
        device: &Device,
        size: usize,
        scope: vk::SystemAllocationScope,
    ) -> IcdResult<HostBlock> {
        let host_allocator = device.host_allocator();
        let block = host_allocator.alloc(size, scope).ok_or(IcdError::OUT_OF_HOST_MEMORY)?;

        if self.host_allocs.try_reserve(1).is_err() {
            host_allocator.free(block);
            return Err(IcdError::OUT_OF_HOST_MEMORY);
        }
        self.host_allocs.insert(block);
        Ok(block)
    }

    pub fn free_mem(&mut self, device: &Device, block: HostBlock) {
        device.host_allocator().free(block);

        let tracked = self.host_allocs.shift_remove(&block);
        debug_assert!(tracked, "freeing untracked host block {block:?}");
    }
}

// stack allocator
impl TrackedResources {
    pub fn acquire_stack_allocator(&mut self, device: &Device) -> IcdResult<StackAllocatorHandle> {
        let manager = device.stack_allocators();
        let allocator = manager.acquire_allocator()?;

        if self.stack_allocators.try_reserve(1).is_err() {
            manager.release_allocator(allocator);
            return Err(IcdError::OUT_OF_HOST_MEMORY);
        }
        self.stack_allocators.insert(allocator);
        Ok(allocator)
    }

    pub fn release_stack_allocator(&mut self, device: &Device, allocator: StackAllocatorHandle) {
        let tracked = self.stack_allocators.shift_remove(&allocator);
        debug_assert!(tracked, "releasing untracked stack allocator {allocator:?}");

        device.stack_allocators().release_allocator(allocator);
    }
}

// release
impl TrackedResources {
    /// 归还所有资源并进入下一个 generation
    ///
    /// 即使没有任何资源，generation 也会增加。
    pub fn release_all(&mut self, device: &Device) {
        let cache = device.render_state_cache();
        for (states, count) in self.depth_stencil_states.drain(..) {
            // 每一次 create 对应一次 destroy
            for _ in 0..count {
                cache.destroy_depth_stencil_state(&states);
            }
        }

        let host_allocator = device.host_allocator();
        for block in self.host_allocs.drain(..) {
            host_allocator.free(block);
        }

        let manager = device.stack_allocators();
        for allocator in self.stack_allocators.drain(..) {
            manager.release_allocator(allocator);
        }

        self.generation += 1;
    }
}

// getters
impl TrackedResources {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.depth_stencil_states.is_empty() && self.host_allocs.is_empty() && self.stack_allocators.is_empty()
    }

    /// 某个 depth stencil state 尚未归还的次数
    #[inline]
    pub fn depth_stencil_state_count(&self, states: &DepthStencilStates) -> u32 {
        self.depth_stencil_states.get(states).copied().unwrap_or(0)
    }

    #[inline]
    pub fn host_alloc_count(&self) -> usize {
        self.host_allocs.len()
    }

    #[inline]
    pub fn stack_allocator_count(&self) -> usize {
        self.stack_allocators.len()
    }
}
