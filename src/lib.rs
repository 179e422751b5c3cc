//! Firmware for DS-TWR ranging between two DW3000 UWB nodes: a dual-antenna
//! tag (initiator, computes the range) and a single-antenna anchor
//! (responder). Per ranging round the tag streams raw diagnostics, the full
//! channel impulse response and the range estimate to a host over UART.
//!
//! The ranging engine itself is hardware-independent; everything that talks
//! to the DW3000 or the board lives behind the `g4` feature.

#![cfg_attr(not(test), no_std)]

pub mod codec;
pub mod frame;
pub mod inbox;
pub mod radio;
pub mod rotator;
pub mod telemetry;
pub mod twr;

#[cfg(feature = "g4")]
pub mod registers;
#[cfg(feature = "g4")]
pub mod spi_interface;
#[cfg(feature = "g4")]
pub mod dw3000;
#[cfg(feature = "g4")]
pub mod shell;

/// Microsecond to device time unit conversion factor. The DW3000 timestamps
/// at 499.2 MHz * 128, around 15.65 ps per unit; 1 µs = 63898 units.
pub const US_TO_DWT_TIME: u64 = 63_898;

/// Device time counters are 40 bits wide and wrap modulo 2^40.
pub const DEVICE_TIME_MASK: u64 = (1 << 40) - 1;

/// Millisecond wall clock plus blocking delay, as the engine and the rotator
/// see them. On the target this is backed by the SysTick counter; tests
/// substitute a scripted clock.
pub trait Clock {
    /// Milliseconds since boot. Wraps at 2^32; consumers compare with
    /// `wrapping_sub`.
    fn ticks_ms(&self) -> u32;

    /// Busy-wait for the given number of milliseconds.
    fn sleep_ms(&mut self, ms: u32);
}
