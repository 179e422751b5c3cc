//! Minimal TWR tag: ranges and reports `dist_mm`, without the diagnostics
//! and CIR streaming of the data-collection build.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_probe as _;

use dw3000_twr::shell::{self, AppConfig};
use dw3000_twr::twr::EngineConfig;

#[entry]
fn main() -> ! {
    shell::run(AppConfig {
        banner: "DW3000 TEST TWR Tag\n",
        engine: EngineConfig::basic_tag(),
        rotation: None,
    })
}
