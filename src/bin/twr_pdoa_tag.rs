//! TWR tag with full data collection (dual-antenna module): every accepted
//! frame streams diagnostics, CIR analysis and the raw accumulator to the
//! host, and each round closes with the range estimate.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_probe as _;

use dw3000_twr::rotator::SweepMode;
use dw3000_twr::shell::{self, AppConfig};
use dw3000_twr::twr::EngineConfig;

/// Set to sweep the receiver antenna during collection.
const ROTATE: bool = false;
/// Ranging rounds per one-degree step.
const TWR_COUNT_PER_ANGLE: u16 = 5;
/// Rotate continuously instead of sweeping to 360 and back.
const ROTATION_WRAP: bool = true;

#[entry]
fn main() -> ! {
    let mut engine = EngineConfig::pdoa_tag();

    let rotation = if ROTATE {
        // Rounds that do not step still pause long enough for the host to
        // keep up with the CIR stream.
        engine.round_pause_ms = 10;
        let mode = if ROTATION_WRAP { SweepMode::Wrap } else { SweepMode::Bounce };
        Some((mode, TWR_COUNT_PER_ANGLE))
    } else {
        None
    };

    shell::run(AppConfig {
        banner: "DW3000 TEST TWR Tag\n",
        engine,
        rotation,
    })
}
