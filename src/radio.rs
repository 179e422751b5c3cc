//! The driver surface the ranging engine consumes, as a trait plus the data
//! types that cross it. The concrete DW3000 implementation lives in
//! [`crate::dw3000`]; tests drive the engine with a scripted substitute.

/// Errors surfaced by the radio facade.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum RadioError {
    /// SPI transaction failed.
    Spi,
    /// The chip never reported the expected state (IDLE_RC, command accept).
    Timeout,
    /// DEV_ID read back wrong; SPI wiring or clock issue.
    UnexpectedDeviceId(u32),
    /// PLL or RX calibration failed during configuration.
    Config,
    /// A delayed transmission was programmed after its time had passed.
    DelayedSendLate,
}

/// Channel and frame configuration, applied once at start-up.
///
/// The STS is placed both between SFD and PHR and in a second slot
/// (packet configuration 2), which is what gives the receiver the two
/// independently timestamped STS segments and, with PDoA mode 3, the phase
/// difference between the two antennas.
#[derive(Clone)]
pub struct RadioConfig {
    /// UWB channel number (5 or 9).
    pub channel: u8,
    /// Preamble length in symbols.
    pub preamble_len: u16,
    /// Preamble acquisition chunk size.
    pub pac: u8,
    /// TX and RX preamble code (same code both directions here).
    pub preamble_code: u8,
    /// Non-standard SFD, length 8.
    pub sfd_mode: u8,
    /// Data rate in kb/s.
    pub data_rate_kbps: u16,
    /// STS packet configuration. 2 = STS after SFD plus a second slot.
    pub sts_mode: u8,
    /// STS segment length in units of 8 chips.
    pub sts_len: u16,
    /// PDoA mode 3: phase difference across both STS segments.
    pub pdoa_mode: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: 5,
            preamble_len: 128,
            pac: 8,
            preamble_code: 9,
            sfd_mode: 2,
            data_rate_kbps: 6800,
            sts_mode: 2,
            sts_len: 64,
            pdoa_mode: 3,
        }
    }
}

/// STS timestamp quality as reported by the receiver. A non-negative score
/// means the STS first-path estimate is trustworthy; ranging rounds reject
/// frames with a negative score.
#[derive(Clone, Copy, Default, Debug, defmt::Format)]
pub struct StsQuality {
    pub score: i16,
    pub index: i16,
}

impl StsQuality {
    pub fn is_good(&self) -> bool {
        self.score >= 0
    }
}

/// Per-segment CIR statistics (one each for the Ipatov preamble and the two
/// STS segments).
#[derive(Clone, Copy, Default, Debug)]
pub struct CirSegmentDiag {
    /// Peak amplitude and index, as packed by the CIA.
    pub peak: u32,
    /// Channel area (power) estimate.
    pub power: u32,
    /// Magnitudes of the three samples around the first path.
    pub f1: u32,
    pub f2: u32,
    pub f3: u32,
    /// First-path index into the accumulator, fixed-point with a 6-bit
    /// fractional part.
    pub fp_index: u16,
    /// Number of accumulated symbols.
    pub accum_count: u16,
}

/// Receiver diagnostics for one frame, read after every accepted frame and
/// streamed to the host unmodified.
#[derive(Clone, Copy, Default, Debug)]
pub struct RxDiagnostics {
    pub cia_diag_1: u32,
    /// Phase of arrival per pipeline.
    pub ip_poa: u16,
    pub sts1_poa: u16,
    pub sts2_poa: u16,
    /// Phase difference of arrival between the two antennas.
    pub pdoa: i16,
    /// Crystal offset measured against the remote transmitter.
    pub xtal_offset: i16,
    /// Time difference of arrival, 41 bits: 5 bytes plus a sign bit in the
    /// low bit of byte 5.
    pub tdoa: [u8; 6],
    /// Time of arrival and status per pipeline.
    pub ip_toa: [u8; 5],
    pub ip_toa_status: u8,
    pub sts1_toa: [u8; 5],
    pub sts1_toa_status: u8,
    pub sts2_toa: [u8; 5],
    pub sts2_toa_status: u8,
    /// First-path-threshold metric test decision.
    pub fp_threshold_test: u8,
    /// DGC gain decision applied to this frame.
    pub dgc_decision: u8,
    pub ip: CirSegmentDiag,
    pub sts1: CirSegmentDiag,
    pub sts2: CirSegmentDiag,
}

/// Accumulator geometry: 1016 Ipatov samples, then the two 512-sample STS
/// segments at fixed bases. Each complex sample is 6 bytes on the wire and
/// every read is preceded by one hardware dummy byte.
pub const CIR_IP_SAMPLES: usize = 1016;
pub const CIR_STS1_BASE: usize = 1024;
pub const CIR_STS2_BASE: usize = 1536;
pub const CIR_STS_SAMPLES: usize = 512;
/// Full dump: everything up to the end of the second STS segment.
pub const CIR_FULL_BYTES: usize = (CIR_STS2_BASE + CIR_STS_SAMPLES) * 6;
pub const CIR_BUFFER_LEN: usize = CIR_FULL_BYTES + 1;

/// The operations the ranging engine needs from the radio at run time.
/// Bring-up (reset, init, configure, interrupt selection) stays on the
/// concrete type; by the time an engine exists the radio is configured.
pub trait UwbRadio {
    /// Load `frame` and transmit immediately. With `response_expected` the
    /// receiver is enabled automatically after the transmission.
    fn send_immediate(&mut self, frame: &[u8], response_expected: bool) -> Result<(), RadioError>;

    /// Load `frame` and transmit when the device time reaches `at` (40-bit
    /// device time; the radio ignores the low 8 bits). Fails with
    /// [`RadioError::DelayedSendLate`] if `at` is already in the past by
    /// the time the command is issued.
    fn send_delayed(&mut self, frame: &[u8], at: u64, response_expected: bool)
        -> Result<(), RadioError>;

    /// Enable the receiver immediately.
    fn enable_rx(&mut self) -> Result<(), RadioError>;

    /// Abort any TX or RX in progress, unconditionally. Required after a
    /// round is abandoned, because `response_expected` leaves the receiver
    /// running.
    fn force_trx_off(&mut self);

    /// 40-bit timestamp of the last transmitted frame.
    fn tx_timestamp(&mut self) -> Result<u64, RadioError>;

    /// 40-bit timestamp of the last received frame.
    fn rx_timestamp(&mut self) -> Result<u64, RadioError>;

    /// Copy the received frame (including FCS) into `buf`.
    fn read_rx_frame(&mut self, buf: &mut [u8]) -> Result<(), RadioError>;

    /// STS quality of the last received frame.
    fn sts_quality(&mut self) -> Result<StsQuality, RadioError>;

    /// CIA diagnostics of the last received frame.
    fn read_diagnostics(&mut self) -> Result<RxDiagnostics, RadioError>;

    /// Read CIR accumulator samples starting at `sample_offset`. `buf[0]`
    /// receives the hardware dummy byte; sample data follows.
    fn read_cir(&mut self, buf: &mut [u8], sample_offset: u16) -> Result<(), RadioError>;
}
