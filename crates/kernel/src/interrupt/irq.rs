//! External IRQ routing
//!
//! Vectors 32–47 come from an interrupt controller. The controller is
//! abstracted behind a trait (mask/unmask, trigger mode, EOI); the
//! dual 8259 PIC backs it on bare-metal x86-64, and hosted builds use a
//! no-op controller so dispatch remains testable.

use super::InterruptFrame;
use crate::status::{Result, Status};
use core::sync::atomic::{AtomicUsize, Ordering};

pub const NUM_IRQS: usize = 16;

/// Interrupt controller operations.
pub trait IrqController: Send + Sync {
    fn name(&self) -> &'static str;
    /// Unmask a line.
    fn enable(&self, line: u8);
    /// Mask a line.
    fn disable(&self, line: u8);
    /// Acknowledge end-of-interrupt.
    fn eoi(&self, line: u8);
    /// Configure edge (false) or level (true) triggering.
    fn set_level_triggered(&self, _line: u8, _level: bool) {}
}

static CONTROLLER: spin::RwLock<Option<&'static dyn IrqController>> = spin::RwLock::new(None);

pub fn set_controller(controller: &'static dyn IrqController) {
    crate::info!("irq: controller {}", controller.name());
    *CONTROLLER.write() = Some(controller);
}

/// Per-line handlers, lock-free like the main dispatch table.
const EMPTY_SLOT: AtomicUsize = AtomicUsize::new(0);
static HANDLERS: [AtomicUsize; NUM_IRQS] = [EMPTY_SLOT; NUM_IRQS];

/// Register a handler and unmask the line.
pub fn register(line: u8, handler: super::Handler) -> Result<()> {
    let slot = HANDLERS.get(line as usize).ok_or(Status::InvalidArg)?;
    if slot
        .compare_exchange(0, handler as usize, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(Status::InUse);
    }
    if let Some(controller) = *CONTROLLER.read() {
        controller.enable(line);
    }
    Ok(())
}

pub fn unregister(line: u8) {
    if let Some(slot) = HANDLERS.get(line as usize) {
        slot.store(0, Ordering::Release);
    }
    if let Some(controller) = *CONTROLLER.read() {
        controller.disable(line);
    }
}

/// IRQ leg of the dispatcher: run the line's handler, then EOI.
pub(super) fn handle(line: u8, frame: &mut InterruptFrame) {
    let raw = HANDLERS
        .get(line as usize)
        .map(|slot| slot.load(Ordering::Acquire))
        .unwrap_or(0);
    if raw != 0 {
        let handler = unsafe { core::mem::transmute::<usize, super::Handler>(raw) };
        handler(frame);
    } else {
        crate::warn!("irq: spurious line {}", line);
    }
    if let Some(controller) = *CONTROLLER.read() {
        controller.eoi(line);
    }
}

pub(super) fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        pic::init();
        set_controller(&pic::PIC_CONTROLLER);
    }
}

/// Dual 8259 PIC, remapped onto vectors 32–47.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod pic {
    use pic8259::ChainedPics;
    use spin::Mutex;

    pub const PIC_BASE: u8 = 32;

    static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_BASE, PIC_BASE + 8) });

    pub fn init() {
        unsafe {
            PICS.lock().initialize();
        }
    }

    pub struct PicController;

    pub static PIC_CONTROLLER: PicController = PicController;

    impl super::IrqController for PicController {
        fn name(&self) -> &'static str {
            "i8259"
        }

        fn enable(&self, line: u8) {
            // ChainedPics manages the mask as a whole; recompute it.
            unsafe {
                let mut pics = PICS.lock();
                let [a, b] = pics.read_masks();
                let masks = u16::from_le_bytes([a, b]) & !(1 << line);
                let [a, b] = masks.to_le_bytes();
                pics.write_masks(a, b);
            }
        }

        fn disable(&self, line: u8) {
            unsafe {
                let mut pics = PICS.lock();
                let [a, b] = pics.read_masks();
                let masks = u16::from_le_bytes([a, b]) | (1 << line);
                let [a, b] = masks.to_le_bytes();
                pics.write_masks(a, b);
            }
        }

        fn eoi(&self, line: u8) {
            unsafe {
                PICS.lock().notify_end_of_interrupt(PIC_BASE + line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::dispatch;

    static EOIS: AtomicUsize = AtomicUsize::new(0);
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    struct TestController;

    impl IrqController for TestController {
        fn name(&self) -> &'static str {
            "test"
        }
        fn enable(&self, _line: u8) {}
        fn disable(&self, _line: u8) {}
        fn eoi(&self, _line: u8) {
            EOIS.fetch_add(1, Ordering::SeqCst);
        }
    }

    static TEST_CONTROLLER: TestController = TestController;

    fn irq_handler(_frame: &mut InterruptFrame) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn irq_dispatch_runs_handler_and_eois() {
        crate::testing::init_kernel();
        set_controller(&TEST_CONTROLLER);
        register(5, irq_handler).unwrap();

        let mut frame = InterruptFrame {
            vector: 37, // IRQ line 5
            cs: 0x08,
            ..Default::default()
        };
        let fired_before = FIRED.load(Ordering::SeqCst);
        let eois_before = EOIS.load(Ordering::SeqCst);
        dispatch(&mut frame);
        assert_eq!(FIRED.load(Ordering::SeqCst), fired_before + 1);
        assert_eq!(EOIS.load(Ordering::SeqCst), eois_before + 1);
        unregister(5);
    }

    #[test]
    fn bad_line_is_rejected() {
        assert_eq!(register(16, irq_handler), Err(Status::InvalidArg));
    }
}
