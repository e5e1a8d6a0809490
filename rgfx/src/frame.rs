//! Frame pacing over a fixed ring of frame slots.
//!
//! [`FramePacer`] owns the per-slot bookkeeping and the order of
//! operations in a frame. Everything that touches the GPU goes through a
//! [`FrameBackend`], so the pacing rules can be exercised without one.
//!
//! A slot moves Idle → Recording → Submitted → Idle. The only blocking
//! point is [`FrameBackend::wait_for_slot`] at the start of a frame, which
//! bounds the CPU to at most `N` submissions ahead of the GPU.

use ash::vk;

/// Result of asking the presentation engine for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32 },
    /// Out of date, suboptimal, or no presentable images at all.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Stale,
}

/// The GPU half of a frame.
///
/// Calls for one frame arrive in this order: `wait_for_slot`,
/// `acquire_image`, `begin_slot`, the record callback, `end_slot`,
/// `submit_slot`, `present`. `resize` may be called after `wait_for_slot`
/// or after `present`.
pub trait FrameBackend {
    type Error;

    /// Blocks until the slot's previous submission, if any, has finished.
    fn wait_for_slot(&mut self, slot: usize) -> Result<(), Self::Error>;

    fn is_presentable(&self) -> bool;

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome, Self::Error>;

    /// Resets the slot's fence and command buffer, begins recording and
    /// moves the acquired image and depth attachments into attachment
    /// layouts.
    fn begin_slot(&mut self, slot: usize, image_index: u32) -> Result<(), Self::Error>;

    /// Moves the image to the present layout and ends recording.
    fn end_slot(&mut self, slot: usize, image_index: u32) -> Result<(), Self::Error>;

    /// Submits the slot's commands, signalling the slot's fence.
    fn submit_slot(&mut self, slot: usize, image_index: u32) -> Result<(), Self::Error>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome, Self::Error>;

    /// Rebuilds the swapchain at the last requested extent.
    fn resize(&mut self) -> Result<(), Self::Error>;

    /// Extent of the presentable images, zero when minimized.
    fn extent(&self) -> vk::Extent2D;
}

/// What the record callback gets to know about the frame it records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub slot: usize,
    pub image_index: u32,
    pub extent: vk::Extent2D,
    pub frame_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The surface has no area; nothing was acquired.
    Minimized,
    /// Acquire reported a stale swapchain, or a resize was pending. The
    /// swapchain was rebuilt and nothing was submitted.
    AcquireOutOfDate,
    /// The frame was submitted but present reported a stale swapchain,
    /// which was then rebuilt.
    PresentOutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented(FrameInfo),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Idle,
    Recording,
    Submitted,
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    phase: SlotPhase,
    image_index: Option<u32>,
    needs_resize: bool,
}

impl SlotState {
    fn new() -> Self {
        Self {
            phase: SlotPhase::Idle,
            image_index: None,
            needs_resize: false,
        }
    }
}

#[derive(Debug)]
pub struct FramePacer {
    slots: Vec<SlotState>,
    current: usize,
    frame_number: u64,
}

impl FramePacer {
    /// A pacer over `frames_in_flight` slots, at least one.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: vec![SlotState::new(); frames_in_flight.max(1)],
            current: 0,
            frame_number: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn slot_phase(&self, slot: usize) -> Option<SlotPhase> {
        self.slots.get(slot).map(|s| s.phase)
    }

    /// The image most recently acquired by `slot`.
    pub fn slot_image(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot).and_then(|s| s.image_index)
    }

    /// Marks every slot as needing a swapchain rebuild before its next
    /// acquire.
    pub fn request_resize(&mut self) {
        for slot in &mut self.slots {
            slot.needs_resize = true;
        }
    }

    pub fn resize_pending(&self) -> bool {
        self.slots[self.current].needs_resize
    }

    fn run_resize<B: FrameBackend>(&mut self, backend: &mut B) -> Result<(), B::Error> {
        // One rebuild serves every slot.
        for slot in &mut self.slots {
            slot.needs_resize = false;
        }
        backend.resize()
    }

    /// Runs one frame: wait, acquire, record, submit, present.
    ///
    /// Stale swapchains are absorbed here and reported as
    /// [`FrameOutcome::Skipped`]. An error from `record` is returned only
    /// after the slot has been submitted and presented, so the slot's
    /// fence never stays unsignaled.
    pub fn draw_frame<B, F>(&mut self, backend: &mut B, record: F) -> Result<FrameOutcome, B::Error>
    where
        B: FrameBackend,
        F: FnOnce(&mut B, &FrameInfo) -> Result<(), B::Error>,
    {
        let slot = self.current;
        let _span = tracing::trace_span!("draw_frame", slot, frame = self.frame_number).entered();

        backend.wait_for_slot(slot)?;
        self.slots[slot].phase = SlotPhase::Idle;

        if self.slots[slot].needs_resize {
            tracing::debug!("Resize pending on slot {slot}");
            self.run_resize(backend)?;
        }
        if !backend.is_presentable() {
            return Ok(FrameOutcome::Skipped(SkipReason::Minimized));
        }

        let image_index = match backend.acquire_image(slot)? {
            AcquireOutcome::Acquired { image_index } => image_index,
            AcquireOutcome::Stale => {
                tracing::debug!("Swapchain stale at acquire");
                self.run_resize(backend)?;
                return Ok(FrameOutcome::Skipped(SkipReason::AcquireOutOfDate));
            }
        };
        self.slots[slot].image_index = Some(image_index);

        let info = FrameInfo {
            slot,
            image_index,
            extent: backend.extent(),
            frame_number: self.frame_number,
        };

        backend.begin_slot(slot, image_index)?;
        self.slots[slot].phase = SlotPhase::Recording;
        let recorded = record(backend, &info);
        backend.end_slot(slot, image_index)?;
        backend.submit_slot(slot, image_index)?;
        self.slots[slot].phase = SlotPhase::Submitted;

        let presented = backend.present(slot, image_index)?;
        self.current = (slot + 1) % self.slots.len();
        self.frame_number += 1;

        let outcome = match presented {
            PresentOutcome::Presented => FrameOutcome::Presented(info),
            PresentOutcome::Stale => {
                tracing::debug!("Swapchain stale at present");
                self.run_resize(backend)?;
                FrameOutcome::Skipped(SkipReason::PresentOutOfDate)
            }
        };
        recorded.map(|()| outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SimFence {
        Signaled,
        Unsignaled,
        Pending,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Begin(usize),
        End(usize),
        Submit(usize),
        Present(usize),
        Resize(vk::Extent2D),
    }

    /// A presentation engine and queue that complete a submission only
    /// when its fence is waited on, the worst case for pacing.
    struct SimulatedGpu {
        fences: Vec<SimFence>,
        surface_extent: vk::Extent2D,
        swapchain_extent: vk::Extent2D,
        image_count: u32,
        next_image: u32,
        stale_acquires: u32,
        stale_presents: u32,
        max_in_flight: usize,
        events: Vec<Event>,
    }

    impl SimulatedGpu {
        fn new(slots: usize, extent: vk::Extent2D) -> Self {
            Self {
                fences: vec![SimFence::Signaled; slots],
                surface_extent: extent,
                swapchain_extent: extent,
                image_count: 3,
                next_image: 0,
                stale_acquires: 0,
                stale_presents: 0,
                max_in_flight: 0,
                events: Vec::new(),
            }
        }

        fn in_flight(&self) -> usize {
            self.fences.iter().filter(|f| **f == SimFence::Pending).count()
        }

        fn submissions(&self) -> usize {
            self.events.iter().filter(|e| matches!(e, Event::Submit(_))).count()
        }

        fn presents(&self) -> usize {
            self.events.iter().filter(|e| matches!(e, Event::Present(_))).count()
        }

        fn resizes(&self) -> Vec<vk::Extent2D> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Resize(extent) => Some(*extent),
                    _ => None,
                })
                .collect()
        }
    }

    impl FrameBackend for SimulatedGpu {
        type Error = &'static str;

        fn wait_for_slot(&mut self, slot: usize) -> Result<(), Self::Error> {
            self.events.push(Event::Wait(slot));
            if self.fences[slot] == SimFence::Pending {
                self.fences[slot] = SimFence::Signaled;
            }
            Ok(())
        }

        fn is_presentable(&self) -> bool {
            self.swapchain_extent.width > 0 && self.swapchain_extent.height > 0
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome, Self::Error> {
            self.events.push(Event::Acquire(slot));
            if self.stale_acquires > 0 {
                self.stale_acquires -= 1;
                return Ok(AcquireOutcome::Stale);
            }
            if self.swapchain_extent != self.surface_extent {
                return Ok(AcquireOutcome::Stale);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireOutcome::Acquired { image_index })
        }

        fn begin_slot(&mut self, slot: usize, _image_index: u32) -> Result<(), Self::Error> {
            self.events.push(Event::Begin(slot));
            if self.fences[slot] != SimFence::Signaled {
                return Err("slot reset before its fence signaled");
            }
            self.fences[slot] = SimFence::Unsignaled;
            Ok(())
        }

        fn end_slot(&mut self, slot: usize, _image_index: u32) -> Result<(), Self::Error> {
            self.events.push(Event::End(slot));
            Ok(())
        }

        fn submit_slot(&mut self, slot: usize, _image_index: u32) -> Result<(), Self::Error> {
            self.events.push(Event::Submit(slot));
            if self.fences[slot] != SimFence::Unsignaled {
                return Err("submitted with a fence that was not reset");
            }
            self.fences[slot] = SimFence::Pending;
            self.max_in_flight = self.max_in_flight.max(self.in_flight());
            Ok(())
        }

        fn present(
            &mut self,
            slot: usize,
            _image_index: u32,
        ) -> Result<PresentOutcome, Self::Error> {
            self.events.push(Event::Present(slot));
            if self.stale_presents > 0 {
                self.stale_presents -= 1;
                return Ok(PresentOutcome::Stale);
            }
            Ok(PresentOutcome::Presented)
        }

        fn resize(&mut self) -> Result<(), Self::Error> {
            // A real resize idles the device first.
            for fence in &mut self.fences {
                if *fence == SimFence::Pending {
                    *fence = SimFence::Signaled;
                }
            }
            self.swapchain_extent = self.surface_extent;
            self.events.push(Event::Resize(self.surface_extent));
            Ok(())
        }

        fn extent(&self) -> vk::Extent2D {
            self.swapchain_extent
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn no_op(_: &mut SimulatedGpu, _: &FrameInfo) -> Result<(), &'static str> {
        Ok(())
    }

    #[test]
    fn in_flight_submissions_never_exceed_slot_count() {
        let mut gpu = SimulatedGpu::new(3, extent(800, 600));
        let mut pacer = FramePacer::new(3);
        for _ in 0..20 {
            let outcome = pacer.draw_frame(&mut gpu, no_op).unwrap();
            assert!(matches!(outcome, FrameOutcome::Presented(_)));
            assert!(gpu.in_flight() <= 3);
        }
        assert_eq!(gpu.max_in_flight, 3);
        assert_eq!(gpu.submissions(), 20);
    }

    #[test]
    fn slot_is_waited_on_before_reset() {
        let mut gpu = SimulatedGpu::new(3, extent(800, 600));
        let mut pacer = FramePacer::new(3);
        for _ in 0..9 {
            pacer.draw_frame(&mut gpu, no_op).unwrap();
        }
        for (i, event) in gpu.events.iter().enumerate() {
            if let Event::Begin(slot) = event {
                let last_wait = gpu.events[..i]
                    .iter()
                    .rposition(|e| *e == Event::Wait(*slot))
                    .expect("begin without a wait");
                let last_submit = gpu.events[..i]
                    .iter()
                    .rposition(|e| *e == Event::Submit(*slot));
                assert!(last_submit.is_none_or(|s| s < last_wait));
            }
        }
    }

    #[test]
    fn slots_rotate_and_phases_track_submission() {
        let mut gpu = SimulatedGpu::new(3, extent(640, 480));
        let mut pacer = FramePacer::new(3);
        let mut seen = Vec::new();
        for _ in 0..4 {
            pacer
                .draw_frame(&mut gpu, |_, info| {
                    seen.push((info.slot, info.frame_number));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 2), (0, 3)]);
        assert_eq!(pacer.current_slot(), 1);
        assert_eq!(pacer.slot_phase(0), Some(SlotPhase::Submitted));
    }

    #[test]
    fn minimize_and_restore_scenario() {
        let mut gpu = SimulatedGpu::new(3, extent(800, 600));
        let mut pacer = FramePacer::new(3);

        let first = pacer.draw_frame(&mut gpu, no_op).unwrap();
        let FrameOutcome::Presented(info) = first else {
            panic!("expected a presented frame, got {first:?}");
        };
        assert_eq!(info.extent, extent(800, 600));

        gpu.surface_extent = extent(0, 0);
        pacer.request_resize();
        let submitted = gpu.submissions();
        assert_eq!(
            pacer.draw_frame(&mut gpu, no_op).unwrap(),
            FrameOutcome::Skipped(SkipReason::Minimized)
        );
        assert_eq!(
            pacer.draw_frame(&mut gpu, no_op).unwrap(),
            FrameOutcome::Skipped(SkipReason::Minimized)
        );
        assert_eq!(gpu.submissions(), submitted);
        assert_eq!(gpu.resizes(), vec![extent(0, 0)]);

        gpu.surface_extent = extent(1024, 768);
        pacer.request_resize();
        let mut recorded_extent = None;
        let outcome = pacer
            .draw_frame(&mut gpu, |_, info| {
                recorded_extent = Some(info.extent);
                Ok(())
            })
            .unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented(i) if i.extent == extent(1024, 768)));
        assert_eq!(recorded_extent, Some(extent(1024, 768)));
        assert_eq!(gpu.resizes(), vec![extent(0, 0), extent(1024, 768)]);
    }

    #[test]
    fn stale_acquire_resizes_and_skips_without_submitting() {
        let mut gpu = SimulatedGpu::new(3, extent(800, 600));
        let mut pacer = FramePacer::new(3);
        gpu.stale_acquires = 1;

        let outcome = pacer.draw_frame(&mut gpu, |_, _| panic!("must not record")).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::AcquireOutOfDate));
        assert_eq!(gpu.submissions(), 0);
        assert_eq!(gpu.resizes().len(), 1);
        assert_eq!(pacer.current_slot(), 0);

        assert!(matches!(
            pacer.draw_frame(&mut gpu, no_op).unwrap(),
            FrameOutcome::Presented(_)
        ));
    }

    #[test]
    fn stale_present_resizes_after_submission() {
        let mut gpu = SimulatedGpu::new(3, extent(800, 600));
        let mut pacer = FramePacer::new(3);
        gpu.stale_presents = 1;

        let outcome = pacer.draw_frame(&mut gpu, no_op).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::PresentOutOfDate));
        assert_eq!(gpu.submissions(), 1);
        assert_eq!(gpu.resizes().len(), 1);
        assert_eq!(pacer.current_slot(), 1);
    }

    #[test]
    fn one_resize_serves_every_slot() {
        let mut gpu = SimulatedGpu::new(3, extent(800, 600));
        let mut pacer = FramePacer::new(3);
        gpu.surface_extent = extent(900, 700);
        pacer.request_resize();
        for _ in 0..3 {
            pacer.draw_frame(&mut gpu, no_op).unwrap();
        }
        assert_eq!(gpu.resizes(), vec![extent(900, 700)]);
        assert!(!pacer.resize_pending());
    }

    #[test]
    fn record_error_is_returned_after_submit_and_present() {
        let mut gpu = SimulatedGpu::new(2, extent(800, 600));
        let mut pacer = FramePacer::new(2);

        let err = pacer.draw_frame(&mut gpu, |_, _| Err("recording failed")).unwrap_err();
        assert_eq!(err, "recording failed");
        assert_eq!(gpu.submissions(), 1);
        assert_eq!(gpu.presents(), 1);
        assert_eq!(pacer.current_slot(), 1);

        for _ in 0..4 {
            pacer.draw_frame(&mut gpu, no_op).unwrap();
        }
    }

    #[test]
    fn zero_slots_clamps_to_one() {
        let pacer = FramePacer::new(0);
        assert_eq!(pacer.frames_in_flight(), 1);
    }
}
