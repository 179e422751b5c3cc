//! The four-frame DS-TWR exchange, driven from the main loop for either
//! role.
//!
//! ```text
//! Sync ──(send / await sync)──► PollResponse ──(poll + response)──► Final
//!   ▲                                                                │
//!   └──────────── Error ◄─(validation failure, radio fault)──────────┘
//! ```
//!
//! The tag initiates with a sync frame, receives the anchor's poll, answers
//! with a response scheduled a fixed delay after the poll's arrival, and
//! closes the round when the anchor's final frame delivers the two
//! remote-side intervals. The anchor mirrors this. Only the tag computes the
//! range; it is also the node with the dual antenna, so the phase data ends
//! up on the node that needs it.
//!
//! Timestamp slots are named after the frame they time (`poll_ts`,
//! `response_ts`, `final_ts`); whether a slot holds an RX or a TX timestamp
//! depends on the role, and both roles derive their two intervals as
//! `response_ts - poll_ts` and `final_ts - response_ts`.

use crate::frame::{self, ANCHOR_ADDR, BASE_FRAME_LEN, FCS_LEN, FINAL_FRAME_LEN, FrameError,
    FunctionCode, MAX_FRAME_LEN, TAG_ADDR};
use crate::inbox::EventInbox;
use crate::radio::{CIR_BUFFER_LEN, RadioError, UwbRadio};
use crate::rotator::{Rotator, StepperPins};
use crate::telemetry::{CIR_ANALYSIS_VERSION, CIR_VERSION, Console, SerialSink, TOA_VERSION,
    TWR_VERSION, TwrRecord, encode_cir_analysis, encode_toa};
use crate::{Clock, DEVICE_TIME_MASK, US_TO_DWT_TIME};

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Role {
    /// Initiator; dual antenna, computes and reports the range.
    Tag,
    /// Responder; answers polls and embeds its intervals in the final frame.
    Anchor,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum State {
    Sync,
    PollResponse,
    Final,
    Error,
}

#[derive(Clone)]
pub struct EngineConfig {
    pub role: Role,
    /// Delay between receiving a frame and launching the scheduled answer,
    /// in device time units.
    pub round_tx_delay: u64,
    /// Wall-clock ceiling on a round before it is abandoned and restarted.
    pub ranging_timeout_ms: u32,
    /// Pause in the error state; breaks symmetric failure loops where both
    /// nodes keep answering each other's garbage.
    pub error_pause_ms: u32,
    /// Tag-side pause between successful rounds when the rotator does not
    /// step.
    pub round_pause_ms: u32,
    /// Stream diagnostics and the full CIR for every accepted frame.
    pub collect_diagnostics: bool,
}

impl EngineConfig {
    /// Data-collection tag: long reply delay so the host can drain the CIR
    /// dump between frames, full telemetry.
    pub fn pdoa_tag() -> Self {
        Self {
            role: Role::Tag,
            round_tx_delay: 100_000 * US_TO_DWT_TIME,
            ranging_timeout_ms: 1000,
            error_pause_ms: 200,
            round_pause_ms: 5,
            collect_diagnostics: true,
        }
    }

    /// Minimal ranging tag: range output only.
    pub fn basic_tag() -> Self {
        Self {
            role: Role::Tag,
            round_tx_delay: 10_000 * US_TO_DWT_TIME,
            ranging_timeout_ms: 2000,
            error_pause_ms: 3000,
            round_pause_ms: 500,
            collect_diagnostics: false,
        }
    }

    pub fn anchor() -> Self {
        Self {
            role: Role::Anchor,
            round_tx_delay: 10_000 * US_TO_DWT_TIME,
            ranging_timeout_ms: 1000,
            error_pause_ms: 500,
            round_pause_ms: 0,
            collect_diagnostics: false,
        }
    }
}

/// Propagation estimate from the four intervals of an asymmetric DS-TWR
/// round, in millimetres, truncated toward zero.
///
/// The device time resolution is approximately u = 15.65 ps, so
/// 1 ns = 63.898 u; the division by 63.898 is approximated by the `<< 6`.
/// Peer nodes use the same approximation, so it must not be "improved"
/// unilaterally.
pub fn distance_mm(tround1: u64, treply1: u64, tround2: u64, treply2: u64) -> u32 {
    let num = tround1
        .wrapping_mul(tround2)
        .wrapping_sub(treply1.wrapping_mul(treply2));
    let den = tround1 + tround2 + treply1 + treply2;
    if den == 0 {
        return 0;
    }
    let tprop_ns = num as f64 / ((den << 6) as f64);
    (tprop_ns * 299.792_458) as u32 // c = 299.79... mm/ns
}

pub struct Engine<'a, R, K, W, P>
where
    R: UwbRadio,
    K: Clock,
    W: SerialSink,
    P: StepperPins,
{
    radio: R,
    clock: K,
    console: Console<W>,
    inbox: &'a EventInbox,
    rotator: Option<Rotator<P>>,
    cfg: EngineConfig,
    state: State,
    next_seq: u8,
    poll_ts: u64,
    response_ts: u64,
    final_ts: u64,
    last_sync_time: u32,
    twr_count: u16,
    rx_buf: [u8; MAX_FRAME_LEN],
    cir_buf: [u8; CIR_BUFFER_LEN],
}

impl<'a, R, K, W, P> Engine<'a, R, K, W, P>
where
    R: UwbRadio,
    K: Clock,
    W: SerialSink,
    P: StepperPins,
{
    pub fn new(
        radio: R,
        clock: K,
        console: Console<W>,
        inbox: &'a EventInbox,
        rotator: Option<Rotator<P>>,
        cfg: EngineConfig,
    ) -> Self {
        let last_sync_time = clock.ticks_ms();
        Self {
            radio,
            clock,
            console,
            inbox,
            rotator,
            cfg,
            state: State::Sync,
            next_seq: 0,
            poll_ts: 0,
            response_ts: 0,
            final_ts: 0,
            last_sync_time,
            twr_count: 0,
            rx_buf: [0; MAX_FRAME_LEN],
            cir_buf: [0; CIR_BUFFER_LEN],
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// One main-loop iteration: check the round timeout, then run the
    /// current state. Never blocks outside the configured pauses.
    pub fn poll(&mut self) {
        let now = self.clock.ticks_ms();
        if self.idle_at_sync() {
            // No round in flight; keep the timeout reference fresh so it
            // only measures rounds that actually started.
            self.last_sync_time = now;
        } else if now.wrapping_sub(self.last_sync_time) > self.cfg.ranging_timeout_ms {
            self.radio.force_trx_off();
            self.last_sync_time = now;
            self.console.line("Timeout -> reset\n");
            self.clear_round();
            self.state = State::Sync;
            if self.cfg.role == Role::Anchor {
                let _ = self.radio.enable_rx();
            }
        }

        match (self.state, self.cfg.role) {
            (State::Sync, Role::Tag) => self.tag_sync(),
            (State::PollResponse, Role::Tag) => self.tag_poll_response(),
            (State::Final, Role::Tag) => self.tag_final(),
            (State::Sync, Role::Anchor) => self.anchor_sync(),
            (State::PollResponse, Role::Anchor) => self.anchor_poll_response(),
            (State::Final, Role::Anchor) => self.anchor_final(),
            (State::Error, _) => self.recover(),
        }
    }

    fn idle_at_sync(&self) -> bool {
        // The tag starts a round the moment it enters Sync; the anchor sits
        // in Sync listening until a sync frame arrives.
        self.cfg.role == Role::Anchor && self.state == State::Sync
    }

    // ── Tag ────────────────────────────────────────────────────────────

    /// Send the sync frame (1/4).
    fn tag_sync(&mut self) {
        self.last_sync_time = self.clock.ticks_ms();
        let seq = self.bump_seq();
        let sync = frame::base_frame(FunctionCode::RangingInit, seq, ANCHOR_ADDR, TAG_ADDR);

        // Set early so the TX-done interrupt arrives in the new state.
        self.state = State::PollResponse;
        if self.radio.send_immediate(&sync, true).is_err() {
            self.console.line("TX ERR: could not send sync frame\n");
            self.state = State::Error;
        }
    }

    /// Await the poll frame (2/4), then schedule the response (3/4).
    fn tag_poll_response(&mut self) {
        if self.inbox.accept_tx_done() {
            self.console.line("TX: Sync frame\n");
        }

        if let Some(len) = self.inbox.take_rx_frame() {
            if !self.receive_checked(
                len,
                BASE_FRAME_LEN + FCS_LEN,
                FunctionCode::Poll,
                Some(self.next_seq),
            ) {
                return;
            }
            self.console.line("RX: Poll frame\n");

            let Some(t) = self.read_rx_timestamp() else { return };
            self.poll_ts = t;

            if !self.emit_frame_telemetry() {
                return;
            }

            self.next_seq = self.next_seq.wrapping_add(1);
            self.inbox.accept_rx();
        }

        if self.inbox.pair_complete() {
            self.inbox.clear();

            let seq = self.bump_seq();
            let response = frame::base_frame(FunctionCode::Activity, seq, ANCHOR_ADDR, TAG_ADDR);
            let at = self.poll_ts.wrapping_add(self.cfg.round_tx_delay) & DEVICE_TIME_MASK;

            self.state = State::Final; // set early, as for the sync send
            if self.radio.send_delayed(&response, at, true).is_err() {
                self.console.line("TX ERR: delayed send time missed\n");
                self.state = State::Error;
            }
        }
    }

    /// Await the final frame (4/4) and derive the range.
    fn tag_final(&mut self) {
        if self.inbox.accept_tx_done() {
            self.console.line("TX: Response frame\n");
            let Some(t) = self.read_tx_timestamp() else { return };
            self.response_ts = t;
        }

        if let Some(len) = self.inbox.take_rx_frame() {
            if !self.receive_checked(
                len,
                FINAL_FRAME_LEN + FCS_LEN,
                FunctionCode::Final,
                Some(self.next_seq),
            ) {
                return;
            }
            self.console.line("RX: Final frame\n");

            let Some(t) = self.read_rx_timestamp() else { return };
            self.final_ts = t;

            if !self.emit_frame_telemetry() {
                return;
            }

            self.next_seq = self.next_seq.wrapping_add(1);
            self.inbox.accept_rx();
        }

        if self.inbox.pair_complete() {
            self.finish_tag_round();
        }
    }

    fn finish_tag_round(&mut self) {
        let (tround1, treply2) = frame::final_intervals(&self.rx_buf[..FINAL_FRAME_LEN]);
        let treply1 = self.response_ts.wrapping_sub(self.poll_ts) & DEVICE_TIME_MASK;
        let tround2 = self.final_ts.wrapping_sub(self.response_ts) & DEVICE_TIME_MASK;
        let dist_mm = distance_mm(tround1, treply1, tround2, treply2);

        let rotation_deg = self.rotator.as_ref().map_or(0, |r| r.angle());
        let full_rotations = self.rotator.as_ref().map_or(0, |r| r.full_rotations());
        let record = TwrRecord {
            treply1,
            treply2,
            tround1,
            tround2,
            dist_mm,
            twr_count: self.twr_count,
            rotation_deg,
        };
        self.console.blob("twr", TWR_VERSION, &record.to_bytes());
        self.console.fmt_line(format_args!(
            "twr_count: {}, dist_mm: {}\n",
            self.twr_count, dist_mm
        ));
        self.console.fmt_line(format_args!(
            "rotation: {}, 360_count: {}\n",
            rotation_deg, full_rotations
        ));

        self.twr_count = self.twr_count.wrapping_add(1);

        // Pace the next round; every N-th round advances the sweep instead.
        match &mut self.rotator {
            Some(rot) if self.twr_count % rot.rounds_per_degree == 0 => {
                rot.advance(&mut self.clock)
            }
            _ => self.clock.sleep_ms(self.cfg.round_pause_ms),
        }

        self.clear_round();
        self.state = State::Sync;
    }

    // ── Anchor ─────────────────────────────────────────────────────────

    /// Await the sync frame (1/4), then send the poll (2/4) immediately.
    fn anchor_sync(&mut self) {
        if let Some(len) = self.inbox.take_rx_frame() {
            if !self.receive_checked(len, BASE_FRAME_LEN + FCS_LEN, FunctionCode::RangingInit, None)
            {
                return;
            }
            self.console.line("RX: Sync frame\n");

            // The sync frame seeds the sequence numbering for the exchange.
            self.next_seq = frame::sequence_number(&self.rx_buf).wrapping_add(1);

            let seq = self.bump_seq();
            let poll = frame::base_frame(FunctionCode::Poll, seq, TAG_ADDR, ANCHOR_ADDR);
            self.state = State::PollResponse; // set early for the TX-done interrupt
            if self.radio.send_immediate(&poll, true).is_err() {
                self.console.line("TX ERR: could not send poll frame\n");
                self.state = State::Error;
            }
        }
    }

    /// Await the response frame (3/4), then schedule the final (4/4) with
    /// the two measured intervals embedded.
    fn anchor_poll_response(&mut self) {
        if self.inbox.accept_tx_done() {
            self.console.line("TX: Poll frame\n");
            let Some(t) = self.read_tx_timestamp() else { return };
            self.poll_ts = t;
        }

        if let Some(len) = self.inbox.take_rx_frame() {
            if !self.receive_checked(
                len,
                BASE_FRAME_LEN + FCS_LEN,
                FunctionCode::Activity,
                Some(self.next_seq),
            ) {
                return;
            }
            self.console.line("RX: Response frame\n");

            let Some(t) = self.read_rx_timestamp() else { return };
            self.response_ts = t;

            self.next_seq = self.next_seq.wrapping_add(1);
            self.inbox.accept_rx();
        }

        if self.inbox.pair_complete() {
            self.inbox.clear();

            let seq = self.bump_seq();

            // The launch time is predicted, not measured: the radio starts
            // at the top 32 bits of this, so the prediction is exactly what
            // must be embedded for the remote side's arithmetic.
            self.final_ts =
                self.response_ts.wrapping_add(self.cfg.round_tx_delay) & DEVICE_TIME_MASK;
            let tround1 = self.response_ts.wrapping_sub(self.poll_ts) & DEVICE_TIME_MASK;
            let treply2 = self.final_ts.wrapping_sub(self.response_ts) & DEVICE_TIME_MASK;

            let final_frame = frame::final_frame(seq, TAG_ADDR, ANCHOR_ADDR, tround1, treply2);
            self.state = State::Final;
            if self
                .radio
                .send_delayed(&final_frame, self.final_ts, true)
                .is_err()
            {
                self.console.line("TX ERR: delayed send time missed\n");
                self.state = State::Error;
            }
        }
    }

    /// The final frame left; `response_expected` re-arms the receiver for
    /// the next sync.
    fn anchor_final(&mut self) {
        if self.inbox.accept_tx_done() {
            self.console.line("TX: Final frame\n");
            self.clear_round();
            self.state = State::Sync;
        }
    }

    // ── Shared paths ───────────────────────────────────────────────────

    /// Error state: log, clear the round, pause, start over.
    fn recover(&mut self) {
        self.radio.force_trx_off();
        self.console.line("Ranging error -> reset\n");
        self.clear_round();
        self.state = State::Sync;
        self.clock.sleep_ms(self.cfg.error_pause_ms);
        if self.cfg.role == Role::Anchor {
            let _ = self.radio.enable_rx();
        }
    }

    /// Length, STS-quality and frame validation, in that order, leaving the
    /// frame (with FCS) in `rx_buf`. Any failure logs and aborts the round.
    fn receive_checked(
        &mut self,
        air_len: u16,
        expected_len: usize,
        fc: FunctionCode,
        seq: Option<u8>,
    ) -> bool {
        if air_len as usize != expected_len {
            self.console.line("RX ERR: wrong frame length\n");
            self.state = State::Error;
            return false;
        }

        match self.radio.sts_quality() {
            Ok(q) if q.is_good() => {}
            Ok(_) => {
                self.console.line("RX ERR: bad STS quality\n");
                self.state = State::Error;
                return false;
            }
            Err(_) => {
                self.fault();
                return false;
            }
        }

        if self
            .radio
            .read_rx_frame(&mut self.rx_buf[..expected_len])
            .is_err()
        {
            self.fault();
            return false;
        }

        match frame::validate(&self.rx_buf[..expected_len - FCS_LEN], fc, seq) {
            Ok(()) => true,
            Err(FrameError::SequenceNumber { .. }) => {
                self.console.line("RX ERR: wrong sequence number\n");
                self.state = State::Error;
                false
            }
            Err(_) => {
                self.console.fmt_line(format_args!(
                    "RX ERR: wrong frame (expected {})\n",
                    expected_frame_name(fc)
                ));
                self.state = State::Error;
                false
            }
        }
    }

    /// Marker line plus diagnostics and CIR blobs for the frame just
    /// accepted, when the build collects them. Returns false on a radio
    /// fault.
    fn emit_frame_telemetry(&mut self) -> bool {
        // Marker for the serial output parsing script.
        self.console
            .fmt_line(format_args!("New Frame: poll: {}\n", self.next_seq));

        if !self.cfg.collect_diagnostics {
            return true;
        }
        if self.emit_rx_diagnostics().is_err() || self.emit_cir().is_err() {
            self.fault();
            return false;
        }
        true
    }

    fn emit_rx_diagnostics(&mut self) -> Result<(), RadioError> {
        let diag = self.radio.read_diagnostics()?;
        let sts = self.radio.sts_quality()?;

        self.console.blob("toa", TOA_VERSION, &encode_toa(&diag, sts));
        self.console
            .blob("cir analysis ip", CIR_ANALYSIS_VERSION, &encode_cir_analysis(&diag.ip));
        self.console
            .blob("cir analysis sts1", CIR_ANALYSIS_VERSION, &encode_cir_analysis(&diag.sts1));
        self.console
            .blob("cir analysis sts2", CIR_ANALYSIS_VERSION, &encode_cir_analysis(&diag.sts2));
        Ok(())
    }

    fn emit_cir(&mut self) -> Result<(), RadioError> {
        self.radio.read_cir(&mut self.cir_buf, 0)?;
        // The leading dummy byte is an SPI artefact, not sample data.
        self.console.blob("cir", CIR_VERSION, &self.cir_buf[1..]);
        Ok(())
    }

    fn read_rx_timestamp(&mut self) -> Option<u64> {
        match self.radio.rx_timestamp() {
            Ok(t) => Some(t),
            Err(_) => {
                self.fault();
                None
            }
        }
    }

    fn read_tx_timestamp(&mut self) -> Option<u64> {
        match self.radio.tx_timestamp() {
            Ok(t) => Some(t),
            Err(_) => {
                self.fault();
                None
            }
        }
    }

    fn fault(&mut self) {
        self.console.line("RADIO ERR: abort round\n");
        self.state = State::Error;
    }

    fn bump_seq(&mut self) -> u8 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn clear_round(&mut self) {
        self.poll_ts = 0;
        self.response_ts = 0;
        self.final_ts = 0;
        self.inbox.clear();
    }
}

fn expected_frame_name(fc: FunctionCode) -> &'static str {
    match fc {
        FunctionCode::RangingInit => "sync",
        FunctionCode::Poll => "poll",
        FunctionCode::Activity => "response",
        FunctionCode::Final => "final",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::radio::{RxDiagnostics, StsQuality};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// 10 ms in device time units.
    const R: u64 = 10_000 * US_TO_DWT_TIME;

    #[derive(Debug)]
    struct SentFrame {
        bytes: Vec<u8>,
        delayed_at: Option<u64>,
        response_expected: bool,
    }

    #[derive(Default)]
    struct RadioState {
        sent: Vec<SentFrame>,
        rx_frame: Vec<u8>,
        sts: StsQuality,
        tx_ts: u64,
        rx_ts: u64,
        diag: RxDiagnostics,
        forced_off: usize,
        rx_enabled: usize,
        fail_delayed: bool,
    }

    #[derive(Clone, Default)]
    struct MockRadio(Rc<RefCell<RadioState>>);

    impl MockRadio {
        fn receive(&self, frame: &[u8], rx_ts: u64) {
            let mut s = self.0.borrow_mut();
            let mut on_air = frame.to_vec();
            on_air.extend_from_slice(&[0, 0]); // FCS, appended by the radio
            s.rx_frame = on_air;
            s.rx_ts = rx_ts;
        }
    }

    impl UwbRadio for MockRadio {
        fn send_immediate(&mut self, frame: &[u8], response_expected: bool) -> Result<(), RadioError> {
            self.0.borrow_mut().sent.push(SentFrame {
                bytes: frame.to_vec(),
                delayed_at: None,
                response_expected,
            });
            Ok(())
        }

        fn send_delayed(&mut self, frame: &[u8], at: u64, response_expected: bool) -> Result<(), RadioError> {
            let mut s = self.0.borrow_mut();
            if s.fail_delayed {
                return Err(RadioError::DelayedSendLate);
            }
            s.sent.push(SentFrame {
                bytes: frame.to_vec(),
                delayed_at: Some(at),
                response_expected,
            });
            Ok(())
        }

        fn enable_rx(&mut self) -> Result<(), RadioError> {
            self.0.borrow_mut().rx_enabled += 1;
            Ok(())
        }

        fn force_trx_off(&mut self) {
            self.0.borrow_mut().forced_off += 1;
        }

        fn tx_timestamp(&mut self) -> Result<u64, RadioError> {
            Ok(self.0.borrow().tx_ts)
        }

        fn rx_timestamp(&mut self) -> Result<u64, RadioError> {
            Ok(self.0.borrow().rx_ts)
        }

        fn read_rx_frame(&mut self, buf: &mut [u8]) -> Result<(), RadioError> {
            let s = self.0.borrow();
            buf.copy_from_slice(&s.rx_frame[..buf.len()]);
            Ok(())
        }

        fn sts_quality(&mut self) -> Result<StsQuality, RadioError> {
            Ok(self.0.borrow().sts)
        }

        fn read_diagnostics(&mut self) -> Result<RxDiagnostics, RadioError> {
            Ok(self.0.borrow().diag)
        }

        fn read_cir(&mut self, buf: &mut [u8], _sample_offset: u16) -> Result<(), RadioError> {
            buf[0] = 0xa5; // dummy byte
            for (i, b) in buf[1..].iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MockClock(Rc<RefCell<(u32, Vec<u32>)>>);

    impl MockClock {
        fn advance(&self, ms: u32) {
            self.0.borrow_mut().0 += ms;
        }
        fn sleeps(&self) -> Vec<u32> {
            self.0.borrow().1.clone()
        }
    }

    impl Clock for MockClock {
        fn ticks_ms(&self) -> u32 {
            self.0.borrow().0
        }
        fn sleep_ms(&mut self, ms: u32) {
            let mut s = self.0.borrow_mut();
            s.0 += ms;
            s.1.push(ms);
        }
    }

    #[derive(Clone, Default)]
    struct MockSink(Rc<RefCell<Vec<u8>>>);

    impl MockSink {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
        fn count(&self, needle: &str) -> usize {
            self.text().matches(needle).count()
        }
    }

    impl SerialSink for MockSink {
        fn write(&mut self, bytes: &[u8]) {
            self.0.borrow_mut().extend_from_slice(bytes);
        }
    }

    struct NoPins;

    impl StepperPins for NoPins {
        fn set_direction(&mut self, _reverse: bool) {}
        fn set_step(&mut self, _high: bool) {}
    }

    type TestEngine<'a> = Engine<'a, MockRadio, MockClock, MockSink, NoPins>;

    fn engine<'a>(
        inbox: &'a EventInbox,
        cfg: EngineConfig,
        radio: &MockRadio,
        clock: &MockClock,
        sink: &MockSink,
    ) -> TestEngine<'a> {
        Engine::new(
            radio.clone(),
            clock.clone(),
            Console::new(sink.clone()),
            inbox,
            None,
            cfg,
        )
    }

    /// A final frame whose embedded fields *decode* to the given values
    /// (i.e. what the tag's arithmetic actually consumes).
    fn final_frame_decoding_to(seq: u8, tround1: u64, treply2: u64) -> Vec<u8> {
        let mut f = frame::final_frame(seq, TAG_ADDR, ANCHOR_ADDR, 0, 0).to_vec();
        f[10..15].copy_from_slice(&codec::encode_40(tround1));
        f[15..20].copy_from_slice(&codec::encode_40(treply2));
        f
    }

    /// Pull the 40-byte twr record out of the console stream.
    fn twr_record(sink: &MockSink) -> Vec<u8> {
        let raw = sink.0.borrow();
        let header = b"BLOB / twr / v2 / 40\n";
        let at = raw
            .windows(header.len())
            .position(|w| w == header)
            .expect("no twr blob emitted");
        raw[at + header.len()..at + header.len() + 40].to_vec()
    }

    fn run_tag_round(
        eng: &mut TestEngine<'_>,
        inbox: &EventInbox,
        radio: &MockRadio,
        base_seq: u8,
        rx_poll_ts: u64,
        tx_response_ts: u64,
        rx_final_ts: u64,
        tround1: u64,
        treply2: u64,
    ) {
        eng.poll(); // Sync: sync frame goes out

        radio.receive(
            &frame::base_frame(FunctionCode::Poll, base_seq.wrapping_add(1), TAG_ADDR, ANCHOR_ADDR),
            rx_poll_ts,
        );
        inbox.post_tx_done();
        inbox.post_rx_ok(12);
        eng.poll(); // PollResponse: pairs and schedules the response

        radio.0.borrow_mut().tx_ts = tx_response_ts;
        radio.receive(
            &final_frame_decoding_to(base_seq.wrapping_add(3), tround1, treply2),
            rx_final_ts,
        );
        inbox.post_tx_done();
        inbox.post_rx_ok(22);
        eng.poll(); // Final: pairs, computes the range
    }

    #[test]
    fn tag_happy_round_computes_one_metre() {
        // One-way time of flight of ~1 m is 3.34 ns, about 213 device time
        // units; both nodes reply after R.
        let tof = 213;
        let rx_poll_ts = 0x10_0000_0000;
        let tx_response_ts = rx_poll_ts + R;
        let rx_final_ts = tx_response_ts + R + 2 * tof;

        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let cfg = EngineConfig {
            collect_diagnostics: false,
            ..EngineConfig::pdoa_tag()
        };
        let mut eng = engine(&inbox, cfg.clone(), &radio, &clock, &sink);

        run_tag_round(
            &mut eng, &inbox, &radio, 0,
            rx_poll_ts, tx_response_ts, rx_final_ts,
            R + 2 * tof, R,
        );

        assert_eq!(eng.state(), State::Sync);

        {
            let r = radio.0.borrow();
            assert_eq!(r.sent.len(), 2);
            // Sync: immediate, response expected.
            assert_eq!(r.sent[0].bytes[9], 0x20);
            assert_eq!(r.sent[0].delayed_at, None);
            assert!(r.sent[0].response_expected);
            // Response: scheduled at poll RX + reply delay.
            assert_eq!(r.sent[1].bytes[9], 0x10);
            assert_eq!(
                r.sent[1].delayed_at,
                Some((rx_poll_ts + cfg.round_tx_delay) & DEVICE_TIME_MASK)
            );
            assert!(r.sent[1].response_expected);
        }

        let rec = twr_record(&sink);
        let dist = u32::from_le_bytes(rec[32..36].try_into().unwrap());
        // The << 6 approximation undershoots the true 999 mm slightly.
        assert_eq!(dist, 997);
        assert!((997..=1003).contains(&dist));
        // Intervals land in the record in Treply1/Treply2/Tround1/Tround2 order.
        assert_eq!(u64::from_le_bytes(rec[0..8].try_into().unwrap()), R);
        assert_eq!(u64::from_le_bytes(rec[8..16].try_into().unwrap()), R);
        assert_eq!(u64::from_le_bytes(rec[16..24].try_into().unwrap()), R + 2 * tof);
        assert_eq!(u64::from_le_bytes(rec[24..32].try_into().unwrap()), R + 2 * tof);

        assert!(sink.text().contains("twr_count: 0, dist_mm: 997\n"));
    }

    #[test]
    fn sequence_numbers_cover_s_to_s_plus_3() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let cfg = EngineConfig {
            collect_diagnostics: false,
            ..EngineConfig::pdoa_tag()
        };
        let mut eng = engine(&inbox, cfg, &radio, &clock, &sink);

        run_tag_round(&mut eng, &inbox, &radio, 0, 1 << 32, (1 << 32) + R, (1 << 32) + 2 * R, R, R);
        assert_eq!(eng.state(), State::Sync);
        {
            let r = radio.0.borrow();
            // Frames the tag emitted carry s and s+2; the peer's s+1 and
            // s+3 were accepted (the round completed).
            assert_eq!(r.sent[0].bytes[2], 0);
            assert_eq!(r.sent[1].bytes[2], 2);
        }

        // Next round starts at s+4.
        eng.poll();
        assert_eq!(radio.0.borrow().sent[2].bytes[2], 4);
    }

    #[test]
    fn zero_range_round_yields_zero() {
        assert_eq!(distance_mm(R, R, R, R), 0);
    }

    #[test]
    fn distance_is_finite_and_nonnegative_for_consistent_rounds() {
        let mut x: u64 = 9;
        for _ in 0..1000 {
            x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let treply1 = (x >> 8) & 0x3fff_ffff;
            let treply2 = (x >> 34) & 0x3fff_ffff;
            let tof = x & 0xffff;
            let tround1 = treply2 + 2 * tof;
            let tround2 = treply1 + 2 * tof;
            let d = distance_mm(tround1, treply1, tround2, treply2);
            assert!(d < 1_000_000_000, "{d}");
        }
    }

    #[test]
    fn bad_sts_aborts_round_without_response() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let mut eng = engine(&inbox, EngineConfig::pdoa_tag(), &radio, &clock, &sink);

        eng.poll(); // sync out
        radio.receive(&frame::base_frame(FunctionCode::Poll, 1, TAG_ADDR, ANCHOR_ADDR), 1 << 30);
        radio.0.borrow_mut().sts = StsQuality { score: -5, index: 0 };
        inbox.post_tx_done();
        inbox.post_rx_ok(12);

        eng.poll();
        assert_eq!(eng.state(), State::Error);
        assert!(sink.text().contains("RX ERR: bad STS quality\n"));
        // No response frame went out.
        assert_eq!(radio.0.borrow().sent.len(), 1);

        // Recovery: radio off, 200 ms pause, flags and timestamps cleared.
        eng.poll();
        assert_eq!(eng.state(), State::Sync);
        assert!(radio.0.borrow().forced_off >= 1);
        assert_eq!(clock.sleeps(), vec![200]);
        assert!(!inbox.pair_complete());
        assert_eq!((eng.poll_ts, eng.response_ts, eng.final_ts), (0, 0, 0));
    }

    #[test]
    fn anchor_rejects_wrong_function_code_without_poll() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let mut eng = engine(&inbox, EngineConfig::anchor(), &radio, &clock, &sink);

        let mut not_sync = frame::base_frame(FunctionCode::RangingInit, 0, ANCHOR_ADDR, TAG_ADDR);
        not_sync[9] = 0x22;
        radio.receive(&not_sync, 1 << 30);
        inbox.post_rx_ok(12);

        eng.poll();
        assert_eq!(eng.state(), State::Error);
        assert!(sink.text().contains("RX ERR: wrong frame (expected sync)\n"));
        assert!(radio.0.borrow().sent.is_empty());

        // Recovery re-arms the receiver on the anchor.
        eng.poll();
        assert_eq!(eng.state(), State::Sync);
        assert_eq!(clock.sleeps(), vec![500]);
        assert_eq!(radio.0.borrow().rx_enabled, 1);
    }

    #[test]
    fn timeout_forces_radio_off_and_restarts_with_next_seq() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let mut eng = engine(&inbox, EngineConfig::pdoa_tag(), &radio, &clock, &sink);

        eng.poll(); // sync with seq 0, no reply ever arrives
        assert_eq!(eng.state(), State::PollResponse);

        clock.advance(1001);
        eng.poll();

        assert!(sink.text().contains("Timeout -> reset\n"));
        assert_eq!(radio.0.borrow().forced_off, 1);
        assert!(!inbox.pair_complete());
        // The same poll already re-entered Sync and sent the fresh sync,
        // with the next sequence number.
        assert_eq!(eng.state(), State::PollResponse);
        let r = radio.0.borrow();
        assert_eq!(r.sent.len(), 2);
        assert_eq!(r.sent[1].bytes[2], 1);
    }

    #[test]
    fn missed_delayed_send_aborts_round() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let cfg = EngineConfig {
            collect_diagnostics: false,
            ..EngineConfig::pdoa_tag()
        };
        let mut eng = engine(&inbox, cfg, &radio, &clock, &sink);

        eng.poll();
        radio.receive(&frame::base_frame(FunctionCode::Poll, 1, TAG_ADDR, ANCHOR_ADDR), 1 << 30);
        radio.0.borrow_mut().fail_delayed = true;
        inbox.post_tx_done();
        inbox.post_rx_ok(12);

        eng.poll();
        assert_eq!(eng.state(), State::Error);
        assert!(sink.text().contains("TX ERR: delayed send time missed\n"));
    }

    #[test]
    fn anchor_happy_round_embeds_measured_intervals() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let cfg = EngineConfig::anchor();
        let mut eng = engine(&inbox, cfg.clone(), &radio, &clock, &sink);

        // Sync (seq 7) arrives; the poll must leave immediately with seq 8.
        radio.receive(&frame::base_frame(FunctionCode::RangingInit, 7, ANCHOR_ADDR, TAG_ADDR), 0);
        inbox.post_rx_ok(12);
        eng.poll();
        assert_eq!(eng.state(), State::PollResponse);
        {
            let r = radio.0.borrow();
            assert_eq!(r.sent.len(), 1);
            assert_eq!(r.sent[0].bytes[9], 0x21);
            assert_eq!(r.sent[0].bytes[2], 8);
            assert_eq!(r.sent[0].delayed_at, None);
        }

        // Poll TX timestamp, then the tag's response (seq 9).
        let tx_poll_ts = 0x20_0000_0000;
        let rx_response_ts = tx_poll_ts + R + 400;
        radio.0.borrow_mut().tx_ts = tx_poll_ts;
        radio.receive(
            &frame::base_frame(FunctionCode::Activity, 9, ANCHOR_ADDR, TAG_ADDR),
            rx_response_ts,
        );
        inbox.post_tx_done();
        inbox.post_rx_ok(12);
        eng.poll();

        assert_eq!(eng.state(), State::Final);
        {
            let r = radio.0.borrow();
            assert_eq!(r.sent.len(), 2);
            let final_frame = &r.sent[1];
            assert_eq!(final_frame.bytes[9], 0x23);
            assert_eq!(final_frame.bytes[2], 10);
            assert_eq!(
                final_frame.delayed_at,
                Some((rx_response_ts + cfg.round_tx_delay) & DEVICE_TIME_MASK)
            );
            assert!(final_frame.response_expected);
            // Intervals travel in the deployed responders' byte layout.
            assert_eq!(
                &final_frame.bytes[10..15],
                &frame::encode_embedded_interval(R + 400)
            );
            assert_eq!(
                &final_frame.bytes[15..20],
                &frame::encode_embedded_interval(cfg.round_tx_delay)
            );
        }

        // TX-done for the final closes the round.
        inbox.post_tx_done();
        eng.poll();
        assert_eq!(eng.state(), State::Sync);
        assert!(sink.text().contains("TX: Final frame\n"));
    }

    #[test]
    fn full_telemetry_round_emits_all_blobs() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let mut eng = engine(&inbox, EngineConfig::pdoa_tag(), &radio, &clock, &sink);

        run_tag_round(&mut eng, &inbox, &radio, 0, 1 << 32, (1 << 32) + R, (1 << 32) + 2 * R, R, R);
        assert_eq!(eng.state(), State::Sync);

        // Two received frames -> two full diagnostic sets, one twr record.
        assert_eq!(sink.count("BLOB / toa / v3 / 43\n"), 2);
        assert_eq!(sink.count("BLOB / cir analysis ip / v1 / 24\n"), 2);
        assert_eq!(sink.count("BLOB / cir analysis sts1 / v1 / 24\n"), 2);
        assert_eq!(sink.count("BLOB / cir analysis sts2 / v1 / 24\n"), 2);
        assert_eq!(sink.count("BLOB / cir / v1 / 12288\n"), 2);
        assert_eq!(sink.count("BLOB / twr / v2 / 40\n"), 1);
        assert_eq!(sink.count("New Frame: poll: "), 2);
    }

    #[test]
    fn anchor_stalled_round_times_out_but_idle_does_not() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let mut eng = engine(&inbox, EngineConfig::anchor(), &radio, &clock, &sink);

        // Idle for a long time: no timeout chatter.
        for _ in 0..5 {
            clock.advance(10_000);
            eng.poll();
        }
        assert_eq!(sink.count("Timeout -> reset"), 0);

        // A round that stalls after the sync does time out.
        radio.receive(&frame::base_frame(FunctionCode::RangingInit, 3, ANCHOR_ADDR, TAG_ADDR), 0);
        inbox.post_rx_ok(12);
        eng.poll();
        assert_eq!(eng.state(), State::PollResponse);

        clock.advance(1001);
        eng.poll();
        assert_eq!(eng.state(), State::Sync);
        assert_eq!(sink.count("Timeout -> reset"), 1);
        assert_eq!(radio.0.borrow().forced_off, 1);
        assert_eq!(radio.0.borrow().rx_enabled, 1);
    }

    #[test]
    fn wrong_sequence_number_aborts_round() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let cfg = EngineConfig {
            collect_diagnostics: false,
            ..EngineConfig::pdoa_tag()
        };
        let mut eng = engine(&inbox, cfg, &radio, &clock, &sink);

        eng.poll();
        // Poll arrives with a stale sequence number.
        radio.receive(&frame::base_frame(FunctionCode::Poll, 0, TAG_ADDR, ANCHOR_ADDR), 1 << 30);
        inbox.post_tx_done();
        inbox.post_rx_ok(12);

        eng.poll();
        assert_eq!(eng.state(), State::Error);
        assert!(sink.text().contains("RX ERR: wrong sequence number\n"));
        assert_eq!(radio.0.borrow().sent.len(), 1);
    }

    #[test]
    fn wrong_length_aborts_round_before_any_radio_read() {
        let inbox = EventInbox::new();
        let (radio, clock, sink) = (MockRadio::default(), MockClock::default(), MockSink::default());
        let cfg = EngineConfig {
            collect_diagnostics: false,
            ..EngineConfig::pdoa_tag()
        };
        let mut eng = engine(&inbox, cfg, &radio, &clock, &sink);

        eng.poll();
        inbox.post_tx_done();
        inbox.post_rx_ok(13); // not a poll frame's on-air length

        eng.poll();
        assert_eq!(eng.state(), State::Error);
        assert!(sink.text().contains("RX ERR: wrong frame length\n"));
    }
}
