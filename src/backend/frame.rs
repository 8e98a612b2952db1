// Frame pacing: the acquire -> record -> submit -> present cycle
//
// FramePacer owns the logical frame index and the recreation flags. Every
// GPU-facing step goes through FrameTarget, so the state machine runs the same
// against the Vulkan renderer and against a scripted double in tests.

use anyhow::Result;

/// Result of asking the swapchain for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; nothing was acquired
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal
    Stale,
}

/// The per-slot operations one frame needs
pub trait FrameTarget {
    /// Block until the slot's last submission has retired
    fn wait_for_fence(&mut self, slot: usize) -> Result<()>;
    /// Acquire with the slot's image-available semaphore
    fn acquire_image(&mut self, slot: usize) -> Result<Acquire>;
    fn reset_fence(&mut self, slot: usize) -> Result<()>;
    /// Reset and re-record the slot's command buffer for `image_index`
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;
    /// Submit the slot's command buffer, signaling its fence on completion
    fn submit(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    /// Rebuild the swapchain. Ok(false) means the surface is zero-sized and
    /// nothing was built.
    fn recreate_swapchain(&mut self) -> Result<bool>;
}

/// A frame that has been recorded but not yet submitted
#[derive(Debug)]
pub struct ActiveFrame {
    pub slot: usize,
    pub image_index: u32,
    suboptimal: bool,
}

#[derive(Debug)]
pub struct FramePacer {
    frames_in_flight: usize,
    current: usize,
    resized: bool,
    recreate_pending: bool,
}

impl FramePacer {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current: 0,
            resized: false,
            recreate_pending: false,
        }
    }

    /// Swapchain recreation is waiting on a non-zero surface
    pub fn recreate_pending(&self) -> bool {
        self.recreate_pending
    }

    /// The window changed size; recreate after the next present
    pub fn notify_surface_resized(&mut self) {
        self.resized = true;
    }

    /// Wait for the current slot, acquire an image and record into it.
    ///
    /// Returns None when there is nothing to draw this time: the swapchain
    /// was out of date (and has been rebuilt) or the surface is zero-sized.
    pub fn begin_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<Option<ActiveFrame>> {
        if self.recreate_pending {
            self.recreate(target)?;
            if self.recreate_pending {
                return Ok(None);
            }
            log::debug!("Deferred swapchain recreation done");
        }

        let slot = self.current;
        target.wait_for_fence(slot)?;

        match target.acquire_image(slot)? {
            Acquire::OutOfDate => {
                // Fence stays signaled and the slot is retried next time
                log::debug!("Swapchain out of date on acquire");
                self.recreate(target)?;
                Ok(None)
            }
            Acquire::Image { index, suboptimal } => {
                target.reset_fence(slot)?;
                target.record(slot, index)?;
                Ok(Some(ActiveFrame {
                    slot,
                    image_index: index,
                    suboptimal,
                }))
            }
        }
    }

    /// Submit and present `frame`, recreate if needed, move to the next slot
    pub fn end_frame<T: FrameTarget>(&mut self, target: &mut T, frame: ActiveFrame) -> Result<()> {
        target.submit(frame.slot)?;
        let outcome = target.present(frame.slot, frame.image_index)?;

        if outcome == PresentOutcome::Stale || frame.suboptimal || self.resized {
            log::debug!(
                "Recreating swapchain (stale: {}, suboptimal: {}, resized: {})",
                outcome == PresentOutcome::Stale,
                frame.suboptimal,
                self.resized
            );
            self.recreate(target)?;
        }

        self.current = (self.current + 1) % self.frames_in_flight;
        Ok(())
    }

    /// One full frame. Returns whether anything was presented.
    pub fn draw_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<bool> {
        match self.begin_frame(target)? {
            Some(frame) => {
                self.end_frame(target, frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rebuild now; any resize seen so far is covered by this rebuild
    fn recreate<T: FrameTarget>(&mut self, target: &mut T) -> Result<()> {
        let was_pending = self.recreate_pending;
        self.resized = false;
        self.recreate_pending = !target.recreate_swapchain()?;
        if self.recreate_pending && !was_pending {
            log::info!("Surface has zero size, pausing rendering");
        }
        Ok(())
    }
}
