//! GPU synchronisation primitives: [`Fence`] and [`Semaphore`].
//!
//! [`Fence`] tracks on the CPU side whether it is unsignaled, pending on a
//! queue, or known to be signaled. A fence can only be reset once a wait
//! has observed the signal, which is what lets a frame slot reuse its
//! command buffer safely.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
    #[error("Waited on a fence that was never submitted")]
    NotSubmitted,
}

#[derive(Debug, Error)]
pub enum ResetFenceError {
    #[error("Fence reset before its signal was observed (state {0:?})")]
    NotSignaled(FenceState),
    #[error("Vulkan error resetting fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum MarkSubmittedError {
    #[error("Fence submitted while in state {0:?}")]
    NotUnsignaled(FenceState),
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error("Vulkan error creating semaphore: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

/// CPU-side view of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Reset and not yet handed to a queue.
    Unsignaled,
    /// Submitted with work that will signal it.
    Pending,
    /// A wait observed the signal, or the fence was created signaled.
    Signaled,
}

impl FenceState {
    /// `Ok(true)` when the signal is already known on the CPU, `Ok(false)`
    /// when only the device can tell.
    fn known_signaled(self) -> Result<bool, WaitFenceError> {
        match self {
            FenceState::Signaled => Ok(true),
            FenceState::Pending => Ok(false),
            FenceState::Unsignaled => Err(WaitFenceError::NotSubmitted),
        }
    }
}

pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    state: FenceState,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Frame slots pass `signaled = true` so their first wait returns
    /// immediately.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        // SAFETY: create_info has no borrowed pointers.
        let handle = unsafe { device.create_raw_fence(&create_info) }
            .map_err(CreateFenceError::Vulkan)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            state: if signaled {
                FenceState::Signaled
            } else {
                FenceState::Unsignaled
            },
        })
    }

    /// Blocks until the fence signals or `timeout_ns` elapses. Pass
    /// `u64::MAX` to wait forever.
    pub fn wait(&mut self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        if self.state.known_signaled()? {
            return Ok(());
        }
        // SAFETY: handle was created from parent.
        unsafe {
            self.parent
                .wait_for_raw_fences(&[self.handle], true, timeout_ns)
        }
        .map_err(|e| match e {
            vk::Result::TIMEOUT => WaitFenceError::Timeout,
            e => WaitFenceError::Vulkan(e),
        })?;
        self.state = FenceState::Signaled;
        Ok(())
    }

    /// Non-blocking poll. `Ok(true)` once the fence has signaled.
    pub fn poll(&mut self) -> Result<bool, WaitFenceError> {
        if self.state.known_signaled()? {
            return Ok(true);
        }
        // SAFETY: handle was created from parent.
        let signaled = unsafe { self.parent.get_raw_fence_status(self.handle) }
            .map_err(WaitFenceError::Vulkan)?;
        if signaled {
            self.state = FenceState::Signaled;
        }
        Ok(signaled)
    }

    /// Returns the fence to the unsignaled state. Only allowed after a wait
    /// has observed the signal.
    pub fn reset(&mut self) -> Result<(), ResetFenceError> {
        if self.state != FenceState::Signaled {
            return Err(ResetFenceError::NotSignaled(self.state));
        }
        // SAFETY: the signal was observed, so no queue still owns the fence.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }
            .map_err(ResetFenceError::Vulkan)?;
        self.state = FenceState::Unsignaled;
        Ok(())
    }

    /// Records that the fence was handed to a queue operation.
    ///
    /// # Safety
    /// The raw handle must actually have been passed to a successful
    /// submission that will signal it.
    pub unsafe fn mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        if self.state != FenceState::Unsignaled {
            return Err(MarkSubmittedError::NotUnsignaled(self.state));
        }
        self.state = FenceState::Pending;
        Ok(())
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: owners wait for the device to idle before dropping frame
        // resources, so the fence is not pending.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// A binary semaphore, signaled and waited on only by queue operations.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(
        device: &Arc<Device>,
        name: Option<&str>,
    ) -> Result<Self, CreateSemaphoreError> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: create_info has no borrowed pointers.
        let handle = unsafe { device.create_raw_semaphore(&create_info) }
            .map_err(CreateSemaphoreError::Vulkan)?;
        // SAFETY: handle was just created from device.
        unsafe { device.name_or_warn(handle, name) };
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_semaphore(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: owners idle the device before dropping, so no queue
        // operation still references the semaphore.
        unsafe { self.parent.destroy_raw_semaphore(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_fences_ask_the_device() {
        assert!(matches!(FenceState::Signaled.known_signaled(), Ok(true)));
        assert!(matches!(FenceState::Pending.known_signaled(), Ok(false)));
        assert!(matches!(
            FenceState::Unsignaled.known_signaled(),
            Err(WaitFenceError::NotSubmitted)
        ));
    }
}
