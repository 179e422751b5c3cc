//! TWR anchor (single-antenna module): answers a tag's sync with the poll,
//! timestamps the exchange and ships its two intervals back in the final
//! frame. Emits no telemetry of its own.

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
        banner: "DW3000 TEST TWR Anchor\n",
        engine: EngineConfig::anchor(),
        rotation: None,
    })
}
