//! Board bring-up and the forever loop: clocks, UART console, SPI, the
//! shared radio, the DW3000 interrupt, and the 1 ms tick.
//!
//! The radio is owned by a static slot guarded by [`DwIrqMutex`], which
//! masks the DW3000's interrupt line for the duration of every facade
//! operation — the same discipline the chip's SPI access rules require
//! (no transaction may be cut in half by the ISR's own register reads).
//! The main loop reaches the radio through [`SharedRadio`]; the ISR reaches
//! it directly from the same slot.

use core::cell::UnsafeCell;
use core::sync::atomic::{compiler_fence, AtomicU32, Ordering};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::NVIC;
use cortex_m_rt::exception;
use hal::clocks::Clocks;
use hal::gpio::{self, Edge, Pin, PinMode, Port};
use hal::pac;
use hal::pac::interrupt;
use hal::spi::{BaudRate, Spi, SpiConfig};
use hal::usart::{Usart, UsartConfig};

use crate::dw3000::{Dw3000, IrqEvent};
use crate::inbox::EventInbox;
use crate::radio::{RadioConfig, RadioError, RxDiagnostics, StsQuality, UwbRadio};
use crate::registers as regs;
use crate::rotator::{Rotator, StepperPins, SweepMode};
use crate::spi_interface::Interface;
use crate::telemetry::{Console, SerialSink};
use crate::twr::{Engine, EngineConfig, Role};
use crate::Clock;

const AHB_FREQ: u32 = 170_000_000;

/// The EXTI line the DW3000 IRQ pin (PB5) lands on.
const DW_IRQ_PIN: u8 = 5;
const DW_IRQN: pac::Interrupt = pac::Interrupt::EXTI9_5;

static INBOX: EventInbox = EventInbox::new();
static RADIO: DwIrqMutex<Option<Dw3000>> = DwIrqMutex::new(None);
static TICK_MS: AtomicU32 = AtomicU32::new(0);

/// A cell whose contents are only ever touched with the DW3000 interrupt
/// masked, so the main loop and the radio ISR can share it without a
/// kernel. Masking only the one line keeps the tick and UART alive during
/// the long accumulator reads.
pub struct DwIrqMutex<T> {
    inner: UnsafeCell<T>,
}

// Access is exclusive by construction: the only interrupt that touches the
// cell is masked while anyone else holds it.
unsafe impl<T: Send> Sync for DwIrqMutex<T> {}

impl<T> DwIrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let was_enabled = NVIC::is_enabled(DW_IRQN);
        NVIC::mask(DW_IRQN);
        compiler_fence(Ordering::SeqCst);

        let result = f(unsafe { &mut *self.inner.get() });

        compiler_fence(Ordering::SeqCst);
        if was_enabled {
            unsafe { NVIC::unmask(DW_IRQN) };
        }
        result
    }
}

/// Handle to the radio in the shared slot; every operation runs under the
/// IRQ mask. Constructed only by [`run`], after the slot is filled.
pub struct SharedRadio;

impl SharedRadio {
    fn with<R>(f: impl FnOnce(&mut Dw3000) -> R) -> R {
        RADIO.with(|slot| f(slot.as_mut().expect("radio not initialised")))
    }
}

impl UwbRadio for SharedRadio {
    fn send_immediate(&mut self, frame: &[u8], response_expected: bool) -> Result<(), RadioError> {
        Self::with(|r| r.send_immediate(frame, response_expected))
    }

    fn send_delayed(&mut self, frame: &[u8], at: u64, response_expected: bool) -> Result<(), RadioError> {
        Self::with(|r| r.send_delayed(frame, at, response_expected))
    }

    fn enable_rx(&mut self) -> Result<(), RadioError> {
        Self::with(|r| r.enable_rx())
    }

    fn force_trx_off(&mut self) {
        Self::with(|r| r.force_trx_off())
    }

    fn tx_timestamp(&mut self) -> Result<u64, RadioError> {
        Self::with(|r| r.tx_timestamp())
    }

    fn rx_timestamp(&mut self) -> Result<u64, RadioError> {
        Self::with(|r| r.rx_timestamp())
    }

    fn read_rx_frame(&mut self, buf: &mut [u8]) -> Result<(), RadioError> {
        Self::with(|r| r.read_rx_frame(buf))
    }

    fn sts_quality(&mut self) -> Result<StsQuality, RadioError> {
        Self::with(|r| r.sts_quality())
    }

    fn read_diagnostics(&mut self) -> Result<RxDiagnostics, RadioError> {
        Self::with(|r| r.read_diagnostics())
    }

    fn read_cir(&mut self, buf: &mut [u8], sample_offset: u16) -> Result<(), RadioError> {
        Self::with(|r| r.read_cir(buf, sample_offset))
    }
}

/// Millisecond tick backed by SysTick.
pub struct SysClock;

impl Clock for SysClock {
    fn ticks_ms(&self) -> u32 {
        TICK_MS.load(Ordering::Relaxed)
    }

    fn sleep_ms(&mut self, ms: u32) {
        let start = self.ticks_ms();
        while self.ticks_ms().wrapping_sub(start) < ms {}
    }
}

#[exception]
fn SysTick() {
    TICK_MS.fetch_add(1, Ordering::Relaxed);
}

/// Console sink over the UART TX line. Writes block until the bytes left
/// the peripheral; failures are dropped, serial output is best-effort.
pub struct UartSink {
    uart: Usart<pac::USART2>,
}

impl SerialSink for UartSink {
    fn write(&mut self, bytes: &[u8]) {
        let _ = self.uart.write(bytes);
    }
}

/// Rotator STEP/DIR lines.
pub struct MotorPins {
    step: Pin,
    dir: Pin,
}

impl StepperPins for MotorPins {
    fn set_direction(&mut self, reverse: bool) {
        if reverse {
            self.dir.set_high();
        } else {
            self.dir.set_low();
        }
    }

    fn set_step(&mut self, high: bool) {
        if high {
            self.step.set_high();
        } else {
            self.step.set_low();
        }
    }
}

/// Per-application knobs: the banner, the engine preset and whether (and
/// how) the antenna sweeps between rounds.
pub struct AppConfig {
    pub banner: &'static str,
    pub engine: EngineConfig,
    /// Sweep mode and ranging rounds per one-degree step.
    pub rotation: Option<(SweepMode, u16)>,
}

fn halt() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// One-shot bring-up, then the infinite ranging loop. The order matters:
/// reset, IDLE_RC, init, configure, interrupt mask, latch clear, ISR
/// unmask, diagnostics logging, role banner, loop.
pub fn run(app: AppConfig) -> ! {
    let dp = pac::Peripherals::take().unwrap();
    let cp = cortex_m::Peripherals::take().unwrap();

    let clock_cfg = Clocks::default();
    clock_cfg.setup().unwrap();

    // 1 ms tick for round timeouts and pacing.
    let mut syst = cp.SYST;
    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(AHB_FREQ / 1_000 - 1);
    syst.clear_current();
    syst.enable_counter();
    syst.enable_interrupt();

    // Host console, 8N1 at the platform baud.
    let uart = Usart::new(dp.USART2, 115_200, UsartConfig::default(), &clock_cfg);
    let mut console = Console::new(UartSink { uart });
    console.line(app.banner);

    // SPI1 to the DW3000, chip select driven manually around each
    // transaction; RSTn and the IRQ input next to it.
    let _sck = Pin::new(Port::A, 5, PinMode::Alt(5));
    let _miso = Pin::new(Port::A, 6, PinMode::Alt(5));
    let _mosi = Pin::new(Port::A, 7, PinMode::Alt(5));
    let mut cs = Pin::new(Port::A, 4, PinMode::Output);
    cs.set_high();
    let mut rstn = Pin::new(Port::B, 0, PinMode::Output);
    rstn.set_high();
    let mut dw_irq = Pin::new(Port::B, DW_IRQ_PIN, PinMode::Input);
    dw_irq.enable_interrupt(Edge::Rising);

    let spi = Spi::new(dp.SPI1, SpiConfig::default(), BaudRate::Div8);

    let mut radio = Dw3000::new(Interface::new(spi, cs), rstn);
    radio.reset();
    if radio.wait_for_idle_rc().is_err() || radio.init().is_err() {
        console.line("INIT FAILED\n");
        halt();
    }
    console.line("INITIALIZED\n");

    // Eval-shield debug: D2 flashes on every RX enable.
    let _ = radio.set_leds(true);

    if radio.configure(&RadioConfig::default()).is_err() {
        console.line("CONFIG FAILED\n");
        halt();
    }
    console.line("CONFIGURED\n");

    if radio.set_interrupts(regs::RANGING_INTERRUPTS).is_err()
        || radio.clear_spi_ready_latches().is_err()
        || radio.enable_cia_diagnostics().is_err()
    {
        console.line("INIT FAILED\n");
        halt();
    }

    // Hand the radio to the shared slot, then let its interrupt through.
    RADIO.with(|slot| *slot = Some(radio));
    unsafe { NVIC::unmask(DW_IRQN) };

    let mut clock = SysClock;

    let rotator = app.rotation.map(|(mode, rounds_per_degree)| {
        let mut pins = MotorPins {
            step: Pin::new(Port::B, 6, PinMode::Output),
            dir: Pin::new(Port::B, 7, PinMode::Output),
        };
        pins.set_step(false);
        pins.set_direction(false);
        Rotator::new(pins, mode, rounds_per_degree)
    });

    match app.engine.role {
        Role::Tag => {
            console.line("Wait 3s before starting...");
            clock.sleep_ms(3000);
            match &rotator {
                Some(r) => console.fmt_line(format_args!(
                    "Config: twr/angle: {}\n",
                    r.rounds_per_degree
                )),
                None => console.line("Config: twr/angle: -\n"),
            }
        }
        Role::Anchor => {
            if SharedRadio.enable_rx().is_err() {
                console.line("INIT FAILED\n");
                halt();
            }
            console.line("Waiting for frames\n");
        }
    }

    let mut engine = Engine::new(SharedRadio, clock, console, &INBOX, rotator, app.engine);
    loop {
        engine.poll();
    }
}

/// DW3000 interrupt: demultiplex and clear SYS_STATUS until nothing is
/// pending. The EXTI input is edge-sensitive while the chip's line is
/// level-driven, so stopping early would lose the edge for any event that
/// arrived mid-service.
#[interrupt]
fn EXTI9_5() {
    gpio::clear_exti_interrupt(DW_IRQ_PIN);

    RADIO.with(|slot| {
        let Some(radio) = slot.as_mut() else { return };
        loop {
            match radio.service_interrupt() {
                Ok(IrqEvent::TxDone) => INBOX.post_tx_done(),
                Ok(IrqEvent::RxGood(len)) => INBOX.post_rx_ok(len),
                Ok(IrqEvent::RxRestarted) => {}
                Ok(IrqEvent::Idle) | Err(_) => break,
            }
        }
    });
}
