use indexmap::IndexSet;

use crate::cmd_buffer::CmdBufferKey;
use crate::error::{IcdError, IcdResult};

/// pool 中所有 command buffer 的登记表
///
/// `explicit_reset` 是 `registered` 的子集：其中的 command buffer 持有 allocator reset 无法回收的资源，
/// 必须在 allocator reset 之前单独 reset。
#[derive(Debug, Default)]
pub struct CmdBufferRegistry {
    registered: IndexSet<CmdBufferKey>,
    explicit_reset: IndexSet<CmdBufferKey>,
    reset_in_progress: bool,
}

impl CmdBufferRegistry {
    pub fn register(&mut self, key: CmdBufferKey) -> IcdResult<()> {
        if self.registered.contains(&key) {
            debug_assert!(false, "cmd buffer {key:?} registered twice");
            return Err(IcdError::InvalidOperation("cmd buffer registered twice"));
        }
        self.registered.try_reserve(1).map_err(|_| IcdError::OUT_OF_HOST_MEMORY)?;
        self.registered.insert(key);
        Ok(())
    }

    /// 不存在时什么都不做
    pub fn unregister(&mut self, key: CmdBufferKey) {
        self.unmark_explicit_reset(key);
        self.registered.shift_remove(&key);
    }

    /// pool reset 期间不允许修改需要 reset 的集合
    pub fn mark_explicit_reset(&mut self, key: CmdBufferKey) -> IcdResult<()> {
        if self.reset_in_progress {
            debug_assert!(false, "cmd buffer {key:?} marked for explicit reset during pool reset");
            return Err(IcdError::InvalidOperation("marking cmd buffer during pool reset"));
        }
        debug_assert!(self.registered.contains(&key));
        self.explicit_reset.try_reserve(1).map_err(|_| IcdError::OUT_OF_HOST_MEMORY)?;
        self.explicit_reset.insert(key);
        Ok(())
    }

    /// pool reset 期间调用会被忽略：此时只可能是 reset 自己在 reset command buffer，
    /// 集合会在 reset 成功后整体清空
    pub fn unmark_explicit_reset(&mut self, key: CmdBufferKey) {
        if self.reset_in_progress {
            return;
        }
        self.explicit_reset.shift_remove(&key);
    }
}

// reset
impl CmdBufferRegistry {
    #[inline]
    pub(crate) fn set_reset_in_progress(&mut self, in_progress: bool) {
        self.reset_in_progress = in_progress;
    }

    #[inline]
    pub(crate) fn clear_explicit_reset(&mut self) {
        self.explicit_reset.clear();
    }
}

// getters
impl CmdBufferRegistry {
    #[inline]
    pub fn is_registered(&self, key: CmdBufferKey) -> bool {
        self.registered.contains(&key)
    }

    #[inline]
    pub fn is_marked_for_explicit_reset(&self, key: CmdBufferKey) -> bool {
        self.explicit_reset.contains(&key)
    }

    #[inline]
    pub fn registered(&self) -> &IndexSet<CmdBufferKey> {
        &self.registered
    }

    #[inline]
    pub fn explicit_reset(&self) -> &IndexSet<CmdBufferKey> {
        &self.explicit_reset
    }

    #[inline]
    pub fn reset_in_progress(&self) -> bool {
        self.reset_in_progress
    }
}
