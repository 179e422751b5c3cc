//! Concrete DW3000 facade: bring-up, channel configuration, TX/RX control,
//! hardware timestamps, CIA diagnostics and accumulator reads.
//!
//! Runtime operations mirror the [`crate::radio::UwbRadio`] trait; the
//! shell wraps a shared instance of this type in its IRQ-masking lock and
//! forwards the trait calls. Bring-up (reset, init, configure) happens once
//! before the interrupt is unmasked, so it lives here as inherent methods
//! only.

use defmt::println;
use hal::delay_ms;
use hal::gpio::Pin;

use crate::codec;
use crate::frame::FCS_LEN;
use crate::radio::{CirSegmentDiag, RadioConfig, RadioError, RxDiagnostics, StsQuality};
use crate::registers as regs;
use crate::registers::FastCommand;
use crate::spi_interface::Interface;
use crate::DEVICE_TIME_MASK;

const AHB_FREQ: u32 = 170_000_000;

/// Bounded busy-waits on chip state.
const MAX_ITERS: u32 = 100_000;

/// What the interrupt line was raised for, after demultiplexing SYS_STATUS.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum IrqEvent {
    TxDone,
    /// A frame with a good FCS, with its on-air length.
    RxGood(u16),
    /// An RX error or timeout; the receiver was restarted in place and the
    /// main loop is *not* notified (the round timeout covers the loss).
    RxRestarted,
    /// Nothing pending; stop polling the status register.
    Idle,
}

pub struct Dw3000 {
    iface: Interface,
    reset: Pin,
    config: RadioConfig,
    /// TX_FCTRL template assembled by `configure`; per-frame length is OR-ed
    /// in at send time.
    tx_fctrl_base: u32,
}

impl Dw3000 {
    pub fn new(iface: Interface, reset: Pin) -> Self {
        Self {
            iface,
            reset,
            config: RadioConfig::default(),
            tx_fctrl_base: 0,
        }
    }

    /// Drive RSTn low and give the chip time to come back up; it lands in
    /// INIT_RC and proceeds to IDLE_RC on its own.
    pub fn reset(&mut self) {
        self.reset.set_low();
        delay_ms(2, AHB_FREQ);
        self.reset.set_high();
        delay_ms(20, AHB_FREQ);
    }

    /// Block until the chip reports IDLE_RC.
    pub fn wait_for_idle_rc(&mut self) -> Result<(), RadioError> {
        for _ in 0..MAX_ITERS {
            if self.iface.read_32(regs::SYS_STATUS)? & regs::SYS_STATUS_RCINIT != 0 {
                return Ok(());
            }
        }
        println!("DW3000 never reached IDLE_RC");
        Err(RadioError::Timeout)
    }

    /// Verify the SPI link and put the chip into a known state.
    pub fn init(&mut self) -> Result<(), RadioError> {
        let dev_id = self.iface.read_32(regs::DEV_ID)?;
        println!("DW3000 DEV_ID: {:#010x}", dev_id);

        // All-zeros / all-ones means the bus is dead; anything without the
        // 0xDECA tag is not a DW3000.
        if dev_id & regs::DEV_ID_RIDTAG_MASK != regs::DEV_ID_RIDTAG {
            return Err(RadioError::UnexpectedDeviceId(dev_id));
        }

        self.iface.fast_command(FastCommand::TxRxOff)?;
        self.iface.fast_command(FastCommand::ClrIrqs)?;
        Ok(())
    }

    /// Apply the channel, preamble, STS and data-rate configuration.
    pub fn configure(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        self.config = config.clone();

        // STS packet configuration and PDoA mode live in SYS_CFG. Mode 2
        // puts one STS segment between SFD and PHR and a second one after
        // the data, which is what produces the STS1/STS2 timestamp pair.
        let mut sys_cfg = self.iface.read_32(regs::SYS_CFG)?;
        sys_cfg &= !((0b11 << 12) | (0b11 << 16));
        sys_cfg |= ((config.sts_mode as u32) & 0b11) << 12;
        sys_cfg |= ((config.pdoa_mode as u32) & 0b11) << 16;
        self.iface.write_32(regs::SYS_CFG, sys_cfg)?;

        // Channel, SFD type, TX and RX preamble codes.
        let chan_ctrl: u16 = (config.channel == 9) as u16
            | ((config.sfd_mode as u16 & 0b11) << 1)
            | ((config.preamble_code as u16 & 0x1f) << 3)
            | ((config.preamble_code as u16 & 0x1f) << 8);
        self.iface.write_16(regs::CHAN_CTRL, chan_ctrl)?;

        // STS segment length, stored in units of 8 chips, minus one.
        self.iface
            .write_16(regs::STS_CFG, config.sts_len / 8 - 1)?;

        // TX frame control template: data rate, preamble length class and
        // the ranging bit; the per-frame length is OR-ed in at send time.
        let txbr: u32 = (config.data_rate_kbps >= 6800) as u32;
        let txpsr: u32 = match config.preamble_len {
            64 => 0x1,
            128 => 0x5,
            256 => 0x9,
            512 => 0xd,
            1024 => 0x2,
            _ => 0x5,
        };
        self.tx_fctrl_base = (txbr << 10) | (1 << 11) | (txpsr << 12);

        // The receiver's gain control needs its preset reloaded after any
        // channel change.
        self.iface.write_32(regs::DGC_CFG, 0x64)?;

        // A failed PLL lock or RX calibration leaves the configuration
        // registers dead; read back the channel word as the health check.
        if self.iface.read_16(regs::CHAN_CTRL)? != chan_ctrl {
            return Err(RadioError::Config);
        }
        Ok(())
    }

    /// Select which events raise the interrupt line.
    pub fn set_interrupts(&mut self, mask: u32) -> Result<(), RadioError> {
        self.iface.write_32(regs::SYS_ENABLE, mask)
    }

    /// Clear the start-up latches (RCINIT, SPIRDY) so the first real event
    /// is not shadowed by them.
    pub fn clear_spi_ready_latches(&mut self) -> Result<(), RadioError> {
        self.iface.write_32(
            regs::SYS_STATUS,
            regs::SYS_STATUS_RCINIT | regs::SYS_STATUS_SPIRDY,
        )
    }

    /// Debug blink on the eval-shield LEDs: one flash per RX enable.
    pub fn set_leds(&mut self, enable: bool) -> Result<(), RadioError> {
        let value: u16 = if enable { 0x0110 } else { 0 };
        self.iface.write_16(regs::LED_CTRL, value)
    }

    /// Enable CIA diagnostic calculation and logging for every frame.
    pub fn enable_cia_diagnostics(&mut self) -> Result<(), RadioError> {
        self.iface.write_8(regs::CIA_CONF, 0x01)
    }

    fn write_tx_fctrl(&mut self, air_len: usize) -> Result<(), RadioError> {
        let fctrl = self.tx_fctrl_base | (air_len as u32 & 0x3ff);
        self.iface.write_32(regs::TX_FCTRL, fctrl)
    }

    pub fn send_immediate(
        &mut self,
        frame: &[u8],
        response_expected: bool,
    ) -> Result<(), RadioError> {
        self.iface.write(regs::TX_BUFFER, frame)?;
        self.write_tx_fctrl(frame.len() + FCS_LEN)?;
        self.iface.fast_command(if response_expected {
            FastCommand::TxW4R
        } else {
            FastCommand::Tx
        })
    }

    pub fn send_delayed(
        &mut self,
        frame: &[u8],
        at: u64,
        response_expected: bool,
    ) -> Result<(), RadioError> {
        self.iface.write(regs::TX_BUFFER, frame)?;
        self.write_tx_fctrl(frame.len() + FCS_LEN)?;

        // The launch register takes the top 32 bits of the 40-bit device
        // time; the chip ignores the low 8.
        self.iface
            .write_32(regs::DX_TIME, ((at & DEVICE_TIME_MASK) >> 8) as u32)?;
        self.iface.fast_command(if response_expected {
            FastCommand::DTxW4R
        } else {
            FastCommand::DTx
        })?;

        // HPDWARN means the programmed time had already passed when the
        // command ran; the frame would go out half a device-time epoch late.
        let status = self.iface.read_32(regs::SYS_STATUS)?;
        if status & regs::SYS_STATUS_HPDWARN != 0 {
            self.force_trx_off();
            self.iface
                .write_32(regs::SYS_STATUS, regs::SYS_STATUS_HPDWARN)?;
            return Err(RadioError::DelayedSendLate);
        }
        Ok(())
    }

    pub fn enable_rx(&mut self) -> Result<(), RadioError> {
        self.iface.fast_command(FastCommand::Rx)
    }

    pub fn force_trx_off(&mut self) {
        // Unconditional abort; with "response expected" sends the receiver
        // would otherwise stay hot.
        let _ = self.iface.fast_command(FastCommand::TxRxOff);
    }

    pub fn tx_timestamp(&mut self) -> Result<u64, RadioError> {
        let mut buf = [0; 5];
        self.iface.read(regs::TX_TIME, &mut buf)?;
        Ok(codec::decode_40(&buf))
    }

    pub fn rx_timestamp(&mut self) -> Result<u64, RadioError> {
        let mut buf = [0; 5];
        self.iface.read(regs::RX_TIME, &mut buf)?;
        Ok(codec::decode_40(&buf))
    }

    pub fn read_rx_frame(&mut self, buf: &mut [u8]) -> Result<(), RadioError> {
        self.iface.read(regs::RX_BUFFER_0, buf)
    }

    /// STS timestamp quality: the accumulation count, compared against 60 %
    /// of the nominal count for the configured segment length. Below that
    /// the STS first-path estimate is not trustworthy.
    pub fn sts_quality(&mut self) -> Result<StsQuality, RadioError> {
        let acc_count = (self.iface.read_16(regs::STS_STS)? & 0x0fff) as i16;
        let threshold = (self.config.sts_len as i16 * 8) * 6 / 10;
        Ok(StsQuality {
            score: acc_count - threshold,
            index: acc_count,
        })
    }

    fn read_segment_diag(&mut self, base: regs::Reg) -> Result<CirSegmentDiag, RadioError> {
        let mut buf = [0; 24];
        self.iface.read(base, &mut buf)?;
        Ok(CirSegmentDiag {
            peak: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            power: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            f1: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            f2: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            f3: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            fp_index: u16::from_le_bytes(buf[20..22].try_into().unwrap()),
            accum_count: u16::from_le_bytes(buf[22..24].try_into().unwrap()),
        })
    }

    pub fn read_diagnostics(&mut self) -> Result<RxDiagnostics, RadioError> {
        let mut diag = RxDiagnostics::default();

        diag.cia_diag_1 = self.iface.read_32(regs::CIA_DIAG_1)?;

        // Ipatov block: 40-bit TOA, status byte, 14-bit POA.
        let mut ip = [0; 8];
        self.iface.read(regs::IP_TOA_LO, &mut ip)?;
        diag.ip_toa.copy_from_slice(&ip[0..5]);
        diag.ip_toa_status = ip[5];
        diag.ip_poa = u16::from_le_bytes([ip[6], ip[7]]);

        // STS blocks: 40-bit TOA, 14-bit POA, status in the top byte of the
        // HI word. The status bytes are read straight from the register
        // (STS*_TOA_HI + 3); the aggregated diagnostic dump misplaces them.
        let mut sts = [0; 8];
        self.iface.read(regs::STS_TOA_LO, &mut sts)?;
        diag.sts1_toa.copy_from_slice(&sts[0..5]);
        diag.sts1_poa = u16::from_le_bytes([sts[5], sts[6]]);
        diag.sts1_toa_status = self.iface.read_8_at(regs::STS_TOA_HI, 3)? & 0x7f;

        self.iface.read(regs::STS1_TOA_LO, &mut sts)?;
        diag.sts2_toa.copy_from_slice(&sts[0..5]);
        diag.sts2_poa = u16::from_le_bytes([sts[5], sts[6]]);
        diag.sts2_toa_status = self.iface.read_8_at(regs::STS1_TOA_HI, 3)? & 0x7f;

        // TDoA is 41 bits: five bytes plus a sign bit in the sixth.
        self.iface.read(regs::CIA_TDOA_0, &mut diag.tdoa)?;

        // PDoA shares its register with the first-path-threshold decision.
        let pdoa_raw = self.iface.read_16(regs::CIA_PDOA)?;
        diag.pdoa = (((pdoa_raw & 0x3fff) << 2) as i16) >> 2;
        diag.fp_threshold_test = ((pdoa_raw >> 14) & 0x1) as u8;

        // Crystal offset: 13-bit signed field of CIA_DIAG_0.
        let diag0 = self.iface.read_32(regs::CIA_DIAG_0)?;
        diag.xtal_offset = (((diag0 & 0x1fff) << 3) as i16) >> 3;

        // DGC gain decision, bits 28..30 of DGC_DBG.
        diag.dgc_decision = (self.iface.read_8_at(regs::DGC_DBG, 3)? & 0x70) >> 4;

        diag.ip = self.read_segment_diag(regs::IP_DIAG_BASE)?;
        diag.sts1 = self.read_segment_diag(regs::STS1_DIAG_BASE)?;
        diag.sts2 = self.read_segment_diag(regs::STS2_DIAG_BASE)?;

        Ok(diag)
    }

    /// Read accumulator samples through indirect pointer A. `buf[0]`
    /// receives the hardware dummy byte, sample data follows.
    pub fn read_cir(&mut self, buf: &mut [u8], sample_offset: u16) -> Result<(), RadioError> {
        // The accumulator memory is only readable with its clocks forced on.
        let clk = self.iface.read_16(regs::CLK_CTRL)?;
        self.iface.write_16(
            regs::CLK_CTRL,
            clk | regs::CLK_CTRL_ACC_CLK_EN | regs::CLK_CTRL_ACC_MCLK_EN,
        )?;

        self.iface
            .write_16(regs::PTR_ADDR_A, regs::ACC_MEM_FILE as u16)?;
        self.iface.write_16(regs::PTR_OFFSET_A, sample_offset * 6)?;
        let result = self.iface.read(regs::INDIRECT_PORT_A, buf);

        self.iface.write_16(regs::CLK_CTRL, clk)?;
        result
    }

    /// The ISR's status demultiplexer: report one pending event, clearing
    /// its status bits. Call until it returns [`IrqEvent::Idle`]; the
    /// interrupt line is level-driven by the remaining status bits but the
    /// EXTI input only sees edges.
    pub fn service_interrupt(&mut self) -> Result<IrqEvent, RadioError> {
        let status = self.iface.read_32(regs::SYS_STATUS)?;

        if status & regs::SYS_STATUS_TXFRS != 0 {
            self.iface
                .write_32(regs::SYS_STATUS, regs::SYS_STATUS_TXFRS)?;
            return Ok(IrqEvent::TxDone);
        }

        if status & regs::SYS_STATUS_RXFCG != 0 {
            let len = self.iface.read_32(regs::RX_FINFO)? & regs::RX_FINFO_RXFLEN_MASK;
            self.iface
                .write_32(regs::SYS_STATUS, regs::SYS_STATUS_RXFCG)?;
            return Ok(IrqEvent::RxGood(len as u16));
        }

        let trouble = regs::SYS_STATUS_ALL_RX_ERR | regs::SYS_STATUS_ALL_RX_TO;
        if status & trouble != 0 {
            self.iface.write_32(regs::SYS_STATUS, trouble)?;
            // Restart reception in place; the state machine is deliberately
            // not told and recovers through its round timeout.
            self.force_trx_off();
            self.iface.fast_command(FastCommand::Rx)?;
            return Ok(IrqEvent::RxRestarted);
        }

        Ok(IrqEvent::Idle)
    }
}
