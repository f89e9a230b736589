use core::sync::atomic::{AtomicBool, Ordering};

/// Wake-on-motion flag shared between the IMU interrupt handler and the
/// fusion loop.
///
/// ```ignore
/// static MOTION: MotionInterruptFlag = MotionInterruptFlag::new();
///
/// fn imu_int1_handler() {
///     MOTION.signal();
/// }
/// ```
#[derive(Debug, Default)]
pub struct MotionInterruptFlag {
    pending: AtomicBool,
}

impl MotionInterruptFlag {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Safe to call from interrupt context.
    pub fn signal(&self) {
        self.pending.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Consumes a pending wake.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}
