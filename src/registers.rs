//! The subset of the DW3000 register map this firmware touches, plus the
//! fast commands and the SYS_STATUS/SYS_ENABLE bit assignments. Register
//! addresses are a 5-bit file ID and a 7-bit offset within the file, per
//! the transaction format in the user manual.

/// A register address: file ID plus byte offset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Reg {
    pub file: u8,
    pub offset: u8,
}

const fn reg(file: u8, offset: u8) -> Reg {
    Reg { file, offset }
}

// File 0x00: general configuration.
pub const DEV_ID: Reg = reg(0x00, 0x00);
pub const SYS_CFG: Reg = reg(0x00, 0x10);
pub const TX_FCTRL: Reg = reg(0x00, 0x24);
/// Delayed TX/RX launch time; the top 32 bits of the 40-bit device time.
pub const DX_TIME: Reg = reg(0x00, 0x2c);
pub const SYS_ENABLE: Reg = reg(0x00, 0x3c);
pub const SYS_STATUS: Reg = reg(0x00, 0x44);
pub const RX_FINFO: Reg = reg(0x00, 0x4c);
/// RX timestamp; the adjusted time of arrival is the first 5 bytes.
pub const RX_TIME: Reg = reg(0x00, 0x64);
/// TX timestamp, 5 bytes.
pub const TX_TIME: Reg = reg(0x00, 0x74);

// File 0x01: general configuration (second half).
pub const CHAN_CTRL: Reg = reg(0x01, 0x14);
pub const LED_CTRL: Reg = reg(0x01, 0x16);

// File 0x02: STS configuration and status.
pub const STS_CFG: Reg = reg(0x02, 0x00);
/// STS accumulation quality, 12 bits.
pub const STS_STS: Reg = reg(0x02, 0x08);

// File 0x03: RX tuning. DGC_DBG holds the gain decision in bits 28..30.
pub const DGC_CFG: Reg = reg(0x03, 0x18);
pub const DGC_DBG: Reg = reg(0x03, 0x60);

// File 0x0c: CIA first-path and phase results.
pub const IP_TOA_LO: Reg = reg(0x0c, 0x00);
pub const STS_TOA_LO: Reg = reg(0x0c, 0x08);
/// Upper word of the STS1 time of arrival; byte 3 is the status byte,
/// read directly because the driver-style aggregate misreports it.
pub const STS_TOA_HI: Reg = reg(0x0c, 0x0c);
pub const STS1_TOA_LO: Reg = reg(0x0c, 0x10);
pub const STS1_TOA_HI: Reg = reg(0x0c, 0x14);
pub const CIA_TDOA_0: Reg = reg(0x0c, 0x18);
/// PDoA result; bit 14 carries the first-path-threshold test decision.
pub const CIA_PDOA: Reg = reg(0x0c, 0x1e);
pub const CIA_DIAG_0: Reg = reg(0x0c, 0x20);
pub const CIA_DIAG_1: Reg = reg(0x0c, 0x24);
/// Ipatov, STS1 and STS2 diagnostic blocks (peak, power, F1..F3,
/// first-path index, accumulator count), 0x1c bytes apart.
pub const IP_DIAG_BASE: Reg = reg(0x0c, 0x28);
pub const STS1_DIAG_BASE: Reg = reg(0x0c, 0x44);
pub const STS2_DIAG_BASE: Reg = reg(0x0c, 0x60);

// File 0x0e: CIA general configuration.
pub const CIA_CONF: Reg = reg(0x0e, 0x00);

// File 0x11: PMSC.
pub const CLK_CTRL: Reg = reg(0x11, 0x04);

// Accumulator and frame memories are whole files.
pub const RX_BUFFER_0: Reg = reg(0x12, 0x00);
pub const TX_BUFFER: Reg = reg(0x14, 0x00);
pub const ACC_MEM_FILE: u8 = 0x15;

// Large memories are reached through indirect pointer A: base file and byte
// offset go into the pointer registers, the payload streams out of the
// access port.
pub const INDIRECT_PORT_A: Reg = reg(0x1d, 0x00);
pub const PTR_ADDR_A: Reg = reg(0x1f, 0x04);
pub const PTR_OFFSET_A: Reg = reg(0x1f, 0x08);

/// Fast commands, encoded as a one-byte transaction.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FastCommand {
    /// Abort TX/RX and return to IDLE.
    TxRxOff = 0x00,
    /// Immediate transmission.
    Tx = 0x01,
    /// Immediate receive.
    Rx = 0x02,
    /// Delayed transmission at DX_TIME.
    DTx = 0x03,
    /// Delayed receive at DX_TIME.
    DRx = 0x04,
    /// Immediate transmission, then receive after the frame.
    TxW4R = 0x0c,
    /// Delayed transmission, then receive after the frame.
    DTxW4R = 0x0d,
    /// Clear all interrupt events.
    ClrIrqs = 0x10,
}

// SYS_STATUS / SYS_ENABLE bit assignments (low word). The enable register
// mirrors the status bit positions.
pub const SYS_STATUS_TXFRS: u32 = 1 << 7; // TX frame sent
pub const SYS_STATUS_RXPHE: u32 = 1 << 12; // PHY header error
pub const SYS_STATUS_RXFCG: u32 = 1 << 14; // RX FCS good
pub const SYS_STATUS_RXFCE: u32 = 1 << 15; // RX FCS error
pub const SYS_STATUS_RXFSL: u32 = 1 << 16; // Reed-Solomon sync loss
pub const SYS_STATUS_RXFTO: u32 = 1 << 17; // RX frame wait timeout
pub const SYS_STATUS_RXPTO: u32 = 1 << 21; // preamble detection timeout
pub const SYS_STATUS_SPIRDY: u32 = 1 << 23; // SPI ready latch
pub const SYS_STATUS_RCINIT: u32 = 1 << 24; // IDLE_RC reached
pub const SYS_STATUS_RXSTO: u32 = 1 << 26; // SFD timeout
pub const SYS_STATUS_HPDWARN: u32 = 1 << 27; // delayed TX/RX time already passed

pub const SYS_STATUS_ALL_RX_ERR: u32 =
    SYS_STATUS_RXPHE | SYS_STATUS_RXFCE | SYS_STATUS_RXFSL | SYS_STATUS_RXSTO;
pub const SYS_STATUS_ALL_RX_TO: u32 = SYS_STATUS_RXFTO | SYS_STATUS_RXPTO;

/// The interrupt set the ranging applications run with: TX confirmations,
/// good frames, RX timeouts and RX errors.
pub const RANGING_INTERRUPTS: u32 =
    SYS_STATUS_TXFRS | SYS_STATUS_RXFCG | SYS_STATUS_ALL_RX_TO | SYS_STATUS_ALL_RX_ERR;

// RX_FINFO: frame length in the low bits.
pub const RX_FINFO_RXFLEN_MASK: u32 = 0x3ff;

// CLK_CTRL bits needed to read the accumulator memory.
pub const CLK_CTRL_ACC_CLK_EN: u16 = 1 << 6;
pub const CLK_CTRL_ACC_MCLK_EN: u16 = 1 << 15;

// DEV_ID: 0xdeca tag in the top half.
pub const DEV_ID_RIDTAG: u32 = 0xdeca_0000;
pub const DEV_ID_RIDTAG_MASK: u32 = 0xffff_0000;
