pub mod registry;
pub mod tracked;

use std::sync::Arc;

use ash::vk;
use itertools::Itertools;
use mgpu_hal::handles::{CmdAllocatorHandle, HostBlock, StackAllocatorHandle};
use mgpu_hal::render_state::{DepthStencilStateCreateInfo, DepthStencilStates};
use slotmap::SlotMap;

use crate::cmd_buffer::{CmdBuffer, CmdBufferKey, PoolContext};
use crate::cmd_pool::registry::CmdBufferRegistry;
use crate::cmd_pool::tracked::TrackedResources;
use crate::device::{Device, create_cmd_allocators, destroy_cmd_allocators};
use crate::error::{IcdError, IcdResult};

#[derive(Clone, Copy, Debug, Default)]
pub struct CmdPoolCreateInfo {
    pub queue_family_index: u32,
    pub flags: vk::CommandPoolCreateFlags,
}

/// command pool：每个设备一个 HAL command allocator，外加录制期间借出的资源
///
/// # Destroy
/// 需要手动调用 [`CmdPool::destroy`]，会先销毁所有仍然存在的 command buffer，再销毁自己的 allocator
pub struct CmdPool {
    device: Arc<Device>,
    queue_family_index: u32,
    flags: vk::CommandPoolCreateFlags,

    /// `allocators[i]` 属于 device i
    allocators: Vec<CmdAllocatorHandle>,
    /// 使用 device 共享的 allocator 时不拥有它们，也不能 reset 它们
    shared_allocator: bool,

    /// 创建时从配置中读取，之后不再变化
    release_resources_disabled: bool,

    buffers: SlotMap<CmdBufferKey, CmdBuffer>,
    registry: CmdBufferRegistry,
    tracked: TrackedResources,

    destroyed: bool,
}

// new & init
impl CmdPool {
    pub fn new(device: &Arc<Device>, create_info: &CmdPoolCreateInfo) -> IcdResult<Self> {
        let _span = tracy_client::span!("CmdPool::new");

        let (allocators, shared_allocator) = match device.shared_cmd_allocators() {
            Some(shared) => (shared.to_vec(), true),
            None => {
                let info = device.settings().cmd_allocator_create_info();
                (create_cmd_allocators(device.hal_devices(), &info)?, false)
            }
        };

        log::info!(
            "cmd pool created: queue family {}, {} allocator(s), shared: {}",
            create_info.queue_family_index,
            allocators.len(),
            shared_allocator
        );

        Ok(Self {
            device: device.clone(),
            queue_family_index: create_info.queue_family_index,
            flags: create_info.flags,
            allocators,
            shared_allocator,
            release_resources_disabled: device.settings().disable_reset_release_resources,
            buffers: SlotMap::with_key(),
            registry: CmdBufferRegistry::default(),
            tracked: TrackedResources::default(),
            destroyed: false,
        })
    }

    pub fn destroy(mut self) {
        let _span = tracy_client::span!("CmdPool::destroy");

        let mut ctx = PoolContext {
            device: &self.device,
            tracked: &mut self.tracked,
            registry: &mut self.registry,
        };
        for (_, buffer) in self.buffers.drain() {
            buffer.destroy(&mut ctx);
        }
        debug_assert!(self.registry.registered().is_empty());

        // 没有归还的资源随 pool 一起释放
        if !self.tracked.is_empty() {
            log::debug!("cmd pool destroyed with tracked resources left, releasing them");
            self.tracked.release_all(&self.device);
        }

        let allocators = std::mem::take(&mut self.allocators);
        if !self.shared_allocator {
            destroy_cmd_allocators(self.device.hal_devices(), allocators);
        }

        log::info!("cmd pool destroyed: queue family {}", self.queue_family_index);
        self.destroyed = true;
    }
}

impl Drop for CmdPool {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        debug_assert!(self.destroyed, "CmdPool dropped without destroy()");
    }
}

// reset
impl CmdPool {
    /// 先单独 reset 需要的 command buffer，再归还借出的资源，最后 reset allocator
    ///
    /// 遇到第一个错误就停止并返回；此时 explicit reset 集合保持原样，可以再次 reset。
    pub fn reset(&mut self, flags: vk::CommandPoolResetFlags) -> IcdResult<()> {
        let _span = tracy_client::span!("CmdPool::reset");

        self.registry.set_reset_in_progress(true);
        let result = self.reset_inner(flags.contains(vk::CommandPoolResetFlags::RELEASE_RESOURCES));
        self.registry.set_reset_in_progress(false);

        match &result {
            Ok(()) => log::debug!("cmd pool reset, generation {}", self.tracked.generation()),
            Err(err) => log::warn!("cmd pool reset failed: {err}"),
        }
        result
    }

    fn reset_inner(&mut self, release_resources: bool) -> IcdResult<()> {
        // 共享 allocator 不会被 reset，所有 command buffer 都需要单独 reset
        let to_reset = if self.shared_allocator {
            self.registry.registered().iter().copied().collect_vec()
        } else {
            self.registry.explicit_reset().iter().copied().collect_vec()
        };

        let mut ctx = PoolContext {
            device: &self.device,
            tracked: &mut self.tracked,
            registry: &mut self.registry,
        };
        for key in to_reset {
            let buffer = self
                .buffers
                .get_mut(key)
                .ok_or(IcdError::InvalidOperation("registered cmd buffer is missing"))?;
            buffer.reset(&mut ctx, true)?;
        }
        self.registry.clear_explicit_reset();

        if release_resources && !self.release_resources_disabled {
            self.tracked.release_all(&self.device);
        }

        if !self.shared_allocator {
            for (device_index, allocator) in self.allocators.iter().enumerate() {
                self.device.hal_device(device_index).reset_cmd_allocator(*allocator)?;
            }
            for buffer in self.buffers.values_mut() {
                buffer.on_allocator_reset();
            }
        }

        Ok(())
    }
}

// cmd buffer
impl CmdPool {
    /// 任何一个失败时，已经分配的都会被释放
    pub fn allocate_cmd_buffers(&mut self, count: u32, level: vk::CommandBufferLevel) -> IcdResult<Vec<CmdBufferKey>> {
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.allocate_cmd_buffer(level) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    self.free_cmd_buffers(&keys);
                    return Err(err);
                }
            }
        }
        Ok(keys)
    }

    fn allocate_cmd_buffer(&mut self, level: vk::CommandBufferLevel) -> IcdResult<CmdBufferKey> {
        let device = &self.device;
        let allocators = &self.allocators;
        let queue_family_index = self.queue_family_index;
        let generation = self.tracked.generation();

        let key = self.buffers.try_insert_with_key(|key| {
            CmdBuffer::new(key, device, allocators, queue_family_index, level, generation)
        })?;

        if let Err(err) = self.registry.register(key) {
            if let Some(buffer) = self.buffers.remove(key) {
                let mut ctx = PoolContext {
                    device: &self.device,
                    tracked: &mut self.tracked,
                    registry: &mut self.registry,
                };
                buffer.destroy(&mut ctx);
            }
            return Err(err);
        }
        Ok(key)
    }

    /// 不属于这个 pool 的 key 会被忽略
    pub fn free_cmd_buffers(&mut self, keys: &[CmdBufferKey]) {
        let mut ctx = PoolContext {
            device: &self.device,
            tracked: &mut self.tracked,
            registry: &mut self.registry,
        };
        for key in keys {
            if let Some(buffer) = self.buffers.remove(*key) {
                buffer.destroy(&mut ctx);
            }
        }
    }

    pub fn begin_cmd_buffer(&mut self, key: CmdBufferKey) -> IcdResult<()> {
        self.with_cmd_buffer(key, |buffer, ctx| buffer.begin(ctx))
    }

    pub fn end_cmd_buffer(&mut self, key: CmdBufferKey) -> IcdResult<()> {
        self.with_cmd_buffer(key, |buffer, ctx| buffer.end(ctx))
    }

    pub fn reset_cmd_buffer(&mut self, key: CmdBufferKey, flags: vk::CommandBufferResetFlags) -> IcdResult<()> {
        let release = flags.contains(vk::CommandBufferResetFlags::RELEASE_RESOURCES);
        self.with_cmd_buffer(key, |buffer, ctx| buffer.reset(ctx, release))
    }

    pub fn cmd_set_depth_stencil_state(
        &mut self,
        key: CmdBufferKey,
        info: &DepthStencilStateCreateInfo,
    ) -> IcdResult<DepthStencilStates> {
        self.with_cmd_buffer(key, |buffer, ctx| buffer.set_depth_stencil_state(ctx, info))
    }

    pub fn cmd_alloc_host_mem(&mut self, key: CmdBufferKey, size: usize) -> IcdResult<HostBlock> {
        self.with_cmd_buffer(key, |buffer, ctx| buffer.alloc_host_mem(ctx, size))
    }

    pub fn cmd_acquire_stack_allocator(&mut self, key: CmdBufferKey) -> IcdResult<StackAllocatorHandle> {
        self.with_cmd_buffer(key, |buffer, ctx| buffer.acquire_stack_allocator(ctx))
    }

    fn with_cmd_buffer<T>(
        &mut self,
        key: CmdBufferKey,
        f: impl FnOnce(&mut CmdBuffer, &mut PoolContext) -> IcdResult<T>,
    ) -> IcdResult<T> {
        let buffer = self
            .buffers
            .get_mut(key)
            .ok_or(IcdError::InvalidOperation("cmd buffer does not belong to this pool"))?;
        let mut ctx = PoolContext {
            device: &self.device,
            tracked: &mut self.tracked,
            registry: &mut self.registry,
        };
        f(buffer, &mut ctx)
    }
}

// registry
impl CmdPool {
    /// 只接受这个 pool 分配出去的 command buffer
    pub fn register_cmd_buffer(&mut self, key: CmdBufferKey) -> IcdResult<()> {
        self.ensure_owned(key)?;
        self.registry.register(key)
    }

    #[inline]
    pub fn unregister_cmd_buffer(&mut self, key: CmdBufferKey) {
        self.registry.unregister(key)
    }

    pub fn mark_explicitly_reset_cmd_buffer(&mut self, key: CmdBufferKey) -> IcdResult<()> {
        self.ensure_owned(key)?;
        self.registry.mark_explicit_reset(key)
    }

    #[inline]
    pub fn unmark_explicitly_reset_cmd_buffer(&mut self, key: CmdBufferKey) {
        self.registry.unmark_explicit_reset(key)
    }

    /// 不属于这个 pool 的 key 进入 registry 后，之后的每次 reset 都会失败
    #[inline]
    fn ensure_owned(&self, key: CmdBufferKey) -> IcdResult<()> {
        if self.buffers.contains_key(key) {
            Ok(())
        } else {
            Err(IcdError::InvalidOperation("cmd buffer does not belong to this pool"))
        }
    }
}

// tracked resources
impl CmdPool {
    pub fn create_depth_stencil_state(
        &mut self,
        info: &DepthStencilStateCreateInfo,
        parent_scope: vk::SystemAllocationScope,
    ) -> IcdResult<DepthStencilStates> {
        self.tracked.create_depth_stencil_state(&self.device, info, parent_scope)
    }

    pub fn destroy_depth_stencil_state(&mut self, states: &DepthStencilStates) {
        self.tracked.destroy_depth_stencil_state(&self.device, states)
    }

    pub fn alloc_mem(&mut self, size: usize, scope: vk::SystemAllocationScope) -> IcdResult<HostBlock> {
        self.tracked.alloc_mem(&self.device, size, scope)
    }

    pub fn free_mem(&mut self, block: HostBlock) {
        self.tracked.free_mem(&self.device, block)
    }

    pub fn acquire_stack_allocator(&mut self) -> IcdResult<StackAllocatorHandle> {
        self.tracked.acquire_stack_allocator(&self.device)
    }

    pub fn release_stack_allocator(&mut self, allocator: StackAllocatorHandle) {
        self.tracked.release_stack_allocator(&self.device, allocator)
    }
}

// getters
impl CmdPool {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.tracked.generation()
    }

    #[inline]
    pub fn registry(&self) -> &CmdBufferRegistry {
        &self.registry
    }

    #[inline]
    pub fn tracked(&self) -> &TrackedResources {
        &self.tracked
    }

    #[inline]
    pub fn cmd_buffer(&self, key: CmdBufferKey) -> Option<&CmdBuffer> {
        self.buffers.get(key)
    }

    #[inline]
    pub fn allocators(&self) -> &[CmdAllocatorHandle] {
        &self.allocators
    }

    #[inline]
    pub fn is_shared_allocator(&self) -> bool {
        self.shared_allocator
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn flags(&self) -> vk::CommandPoolCreateFlags {
        self.flags
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use mgpu_hal::HalError;
    use mgpu_hal::mock::{FailPoint, MockEvent};

    use super::*;
    use crate::cmd_buffer::CmdBufferState;
    use crate::settings::RuntimeSettings;
    use crate::test_utils::TestDevice;

    const PRIMARY: vk::CommandBufferLevel = vk::CommandBufferLevel::PRIMARY;

    fn new_pool(device: &Arc<Device>) -> CmdPool {
        CmdPool::new(device, &CmdPoolCreateInfo::default()).unwrap()
    }

    /// 录制一个持有 depth stencil state 的 command buffer
    fn record_with_state(pool: &mut CmdPool, key: CmdBufferKey) -> DepthStencilStates {
        pool.begin_cmd_buffer(key).unwrap();
        let states = pool.cmd_set_depth_stencil_state(key, &DepthStencilStateCreateInfo::default()).unwrap();
        pool.end_cmd_buffer(key).unwrap();
        states
    }

    #[test]
    fn test_end_with_resources_marks_buffer() {
        let TestDevice { device, .. } = TestDevice::new(1);
        let mut pool = new_pool(&device);
        let [with, without] = pool.allocate_cmd_buffers(2, PRIMARY).unwrap().try_into().unwrap();

        record_with_state(&mut pool, with);
        pool.begin_cmd_buffer(without).unwrap();
        pool.end_cmd_buffer(without).unwrap();

        assert!(pool.registry().is_marked_for_explicit_reset(with));
        assert!(!pool.registry().is_marked_for_explicit_reset(without));
        assert_eq!(pool.cmd_buffer(with).map(|b| *b.state()), Some(CmdBufferState::Executable));

        pool.destroy();
    }

    #[test]
    fn test_reset_order_private_allocator() {
        let TestDevice { platform, device } = TestDevice::new(2);
        let mut pool = new_pool(&device);
        let [marked, plain] = pool.allocate_cmd_buffers(2, PRIMARY).unwrap().try_into().unwrap();
        let states = record_with_state(&mut pool, marked);
        pool.begin_cmd_buffer(plain).unwrap();
        pool.end_cmd_buffer(plain).unwrap();

        let hal_marked = pool.cmd_buffer(marked).and_then(|b| b.hal_cmd_buffer(0));
        let hal_plain = pool.cmd_buffer(plain).and_then(|b| b.hal_cmd_buffer(0));
        platform.take_events();
        pool.reset(vk::CommandPoolResetFlags::RELEASE_RESOURCES).unwrap();
        let events = platform.take_events();

        let buffer_reset = events.iter().position(|e| {
            matches!(e, MockEvent::ResetCmdBuffer { device: 0, cmd_buffer } if Some(*cmd_buffer) == hal_marked)
        });
        let allocator_reset = events
            .iter()
            .position(|e| matches!(e, MockEvent::ResetCmdAllocator { .. }));
        assert!(buffer_reset.is_some());
        assert!(buffer_reset < allocator_reset);

        // 没有被标记的 command buffer 只随 allocator 一起 reset
        assert!(!events.iter().any(
            |e| matches!(e, MockEvent::ResetCmdBuffer { cmd_buffer, .. } if Some(*cmd_buffer) == hal_plain)
        ));
        let allocator_resets = events
            .iter()
            .filter(|e| matches!(e, MockEvent::ResetCmdAllocator { .. }))
            .count();
        assert_eq!(allocator_resets, 2);

        assert_eq!(platform.depth_stencil_ref_count(&states), 0);
        assert!(pool.registry().explicit_reset().is_empty());
        assert_eq!(pool.generation(), 1);
        assert_eq!(pool.cmd_buffer(plain).map(|b| *b.state()), Some(CmdBufferState::Initial));

        pool.destroy();
    }

    #[test]
    fn test_reset_shared_allocator_resets_every_buffer() {
        let settings = RuntimeSettings {
            use_shared_cmd_allocator: true,
            ..Default::default()
        };
        let TestDevice { platform, device } = TestDevice::with_settings(1, settings);
        let mut pool = new_pool(&device);
        assert!(pool.is_shared_allocator());
        pool.allocate_cmd_buffers(3, PRIMARY).unwrap();

        platform.take_events();
        pool.reset(vk::CommandPoolResetFlags::empty()).unwrap();
        let events = platform.take_events();

        let buffer_resets = events
            .iter()
            .filter(|e| matches!(e, MockEvent::ResetCmdBuffer { .. }))
            .count();
        assert_eq!(buffer_resets, 3);
        assert!(!events.iter().any(|e| matches!(e, MockEvent::ResetCmdAllocator { .. })));
        // 没有 release resources 时 generation 不变
        assert_eq!(pool.generation(), 0);

        pool.destroy();
        // 共享的 allocator 属于 device
        assert_eq!(platform.live_cmd_allocator_count(), 1);
    }

    #[test]
    fn test_release_disabled_by_setting() {
        let settings = RuntimeSettings {
            disable_reset_release_resources: true,
            ..Default::default()
        };
        let TestDevice { device, .. } = TestDevice::with_settings(1, settings);
        let mut pool = new_pool(&device);

        pool.alloc_mem(16, vk::SystemAllocationScope::OBJECT).unwrap();
        pool.reset(vk::CommandPoolResetFlags::RELEASE_RESOURCES).unwrap();
        assert_eq!(pool.generation(), 0);
        assert_eq!(pool.tracked().host_alloc_count(), 1);

        pool.destroy();
    }

    #[test]
    fn test_failed_reset_is_retriable() {
        let TestDevice { platform, device } = TestDevice::new(1);
        let mut pool = new_pool(&device);
        let [key] = pool.allocate_cmd_buffers(1, PRIMARY).unwrap().try_into().unwrap();
        record_with_state(&mut pool, key);

        platform.fail_next(FailPoint::ResetCmdBuffer, None, HalError::DeviceLost);
        let result = pool.reset(vk::CommandPoolResetFlags::RELEASE_RESOURCES);
        assert_eq!(result, Err(IcdError::DeviceOperationFailed(HalError::DeviceLost)));
        assert!(pool.registry().is_marked_for_explicit_reset(key));
        assert!(!pool.registry().reset_in_progress());
        assert_eq!(pool.generation(), 0);

        pool.reset(vk::CommandPoolResetFlags::RELEASE_RESOURCES).unwrap();
        assert!(pool.registry().explicit_reset().is_empty());
        assert_eq!(pool.generation(), 1);

        pool.destroy();
    }

    #[test]
    fn test_stale_generation_forgets_resources() {
        let TestDevice { platform, device } = TestDevice::new(1);
        let mut pool = new_pool(&device);
        let [key] = pool.allocate_cmd_buffers(1, PRIMARY).unwrap().try_into().unwrap();

        // 录制中被 pool reset 的资源不能再归还第二次
        pool.begin_cmd_buffer(key).unwrap();
        pool.cmd_alloc_host_mem(key, 64).unwrap();
        pool.cmd_acquire_stack_allocator(key).unwrap();
        pool.reset(vk::CommandPoolResetFlags::RELEASE_RESOURCES).unwrap();
        assert_eq!(platform.live_host_block_count(), 0);

        pool.begin_cmd_buffer(key).unwrap();
        pool.end_cmd_buffer(key).unwrap();
        assert_eq!(pool.cmd_buffer(key).map(|b| *b.generation()), Some(1));
        assert!(!pool.registry().is_marked_for_explicit_reset(key));

        let frees = platform
            .events()
            .iter()
            .filter(|e| matches!(e, MockEvent::HostFree { .. }))
            .count();
        assert_eq!(frees, 1);

        pool.destroy();
    }

    #[test]
    fn test_destroy_buffers_before_allocators() {
        let TestDevice { platform, device } = TestDevice::new(2);
        let mut pool = new_pool(&device);
        let [key, _] = pool.allocate_cmd_buffers(2, PRIMARY).unwrap().try_into().unwrap();
        let states = record_with_state(&mut pool, key);

        platform.take_events();
        pool.destroy();
        let events = platform.take_events();

        let last_buffer = events
            .iter()
            .rposition(|e| matches!(e, MockEvent::DestroyCmdBuffer { .. }));
        let first_allocator = events
            .iter()
            .position(|e| matches!(e, MockEvent::DestroyCmdAllocator { .. }));
        assert!(last_buffer < first_allocator);
        assert_eq!(platform.live_cmd_buffer_count(), 0);
        assert_eq!(platform.live_cmd_allocator_count(), 0);
        assert_eq!(platform.depth_stencil_ref_count(&states), 0);
    }

    #[test]
    fn test_allocate_unwinds_on_failure() {
        let TestDevice { platform, device } = TestDevice::new(2);
        let mut pool = new_pool(&device);

        platform.fail_next(FailPoint::CreateCmdBuffer, Some(1), HalError::OutOfMemory);
        let result = pool.allocate_cmd_buffers(1, PRIMARY);
        assert_eq!(result.err(), Some(IcdError::OUT_OF_HOST_MEMORY));
        assert_eq!(platform.live_cmd_buffer_count(), 0);
        assert!(pool.registry().registered().is_empty());

        pool.destroy();
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let settings = RuntimeSettings {
            use_shared_cmd_allocator: true,
            ..Default::default()
        };
        let TestDevice { device, .. } = TestDevice::with_settings(1, settings);
        let mut pool = new_pool(&device);
        pool.allocate_cmd_buffers(1, PRIMARY).unwrap();

        // 下标超出 pool 中已有的 command buffer
        let mut other = SlotMap::<CmdBufferKey, ()>::with_key();
        let foreign = (0..4).map(|_| other.insert(())).last().unwrap();
        assert!(matches!(pool.register_cmd_buffer(foreign), Err(IcdError::InvalidOperation(_))));
        assert!(matches!(
            pool.mark_explicitly_reset_cmd_buffer(foreign),
            Err(IcdError::InvalidOperation(_))
        ));
        assert_eq!(pool.registry().registered().len(), 1);
        assert!(pool.registry().explicit_reset().is_empty());

        // pool 依然可以 reset
        pool.reset(vk::CommandPoolResetFlags::RELEASE_RESOURCES).unwrap();
        pool.reset(vk::CommandPoolResetFlags::RELEASE_RESOURCES).unwrap();
        assert_eq!(pool.generation(), 2);

        pool.destroy();
    }

    #[test]
    fn test_hal_cmd_buffer_per_device() {
        let TestDevice { device, .. } = TestDevice::new(2);
        let mut pool = new_pool(&device);
        let [key] = pool.allocate_cmd_buffers(1, PRIMARY).unwrap().try_into().unwrap();

        let buffer = pool.cmd_buffer(key).unwrap();
        assert!(buffer.hal_cmd_buffer(0).is_some());
        assert!(buffer.hal_cmd_buffer(1).is_some());
        assert_ne!(buffer.hal_cmd_buffer(0), buffer.hal_cmd_buffer(1));
        assert_eq!(buffer.hal_cmd_buffer(2), None);

        pool.destroy();
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let TestDevice { device, .. } = TestDevice::new(1);
        let mut pool = new_pool(&device);
        let [key] = pool.allocate_cmd_buffers(1, PRIMARY).unwrap().try_into().unwrap();

        pool.begin_cmd_buffer(key).unwrap();
        assert!(matches!(pool.begin_cmd_buffer(key), Err(IcdError::InvalidOperation(_))));

        pool.destroy();
    }
}
