//! Fixed-layout frames of the four-frame TWR exchange.
//!
//! All frames are IEEE 802.15.4 data frames with short addressing and a
//! one-byte function code after the addressing fields. The final frame adds
//! two 5-byte device-time intervals measured by the anchor. The radio
//! appends a 2-byte FCS to every frame on air, so the length handed to the
//! transmitter (and reported for received frames) is the frame size plus
//! [`FCS_LEN`].

use crate::codec;

/// Frame Control: data frame, short addresses.
pub const FRAME_CTRL: [u8; 2] = [0x41, 0x88];

pub const PAN_ID: [u8; 2] = *b"XX";
pub const TAG_ADDR: [u8; 2] = *b"TT";
pub const ANCHOR_ADDR: [u8; 2] = *b"AA";

/// fc(2) + seq(1) + pan(2) + dst(2) + src(2) + function code(1).
pub const BASE_FRAME_LEN: usize = 10;
/// Base frame plus the two embedded 5-byte intervals.
pub const FINAL_FRAME_LEN: usize = BASE_FRAME_LEN + 10;
/// The radio appends a 2-byte frame check sequence on air.
pub const FCS_LEN: usize = 2;
/// Largest on-air frame the receiver has to buffer.
pub const MAX_FRAME_LEN: usize = FINAL_FRAME_LEN + FCS_LEN;

const SEQ_OFFSET: usize = 2;
const FN_OFFSET: usize = 9;
const TROUND1_OFFSET: usize = 10;
const TREPLY2_OFFSET: usize = 15;

/// TWR function codes, loosely after ISO/IEC 24730-62. The tag/anchor
/// direction is inverted relative to the standard so the range can be
/// computed on the node that also has the AoA estimate.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum FunctionCode {
    /// Activity control, used as the tag's response frame (3/4).
    Activity = 0x10,
    /// Ranging initiation, the tag's sync frame (1/4).
    RangingInit = 0x20,
    /// Ranging poll, sent by the anchor (2/4).
    Poll = 0x21,
    /// Ranging final with the two embedded intervals (4/4).
    Final = 0x23,
}

/// Frame validation failures. All of them abort the ranging round; none is
/// retryable.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum FrameError {
    Length { got: usize },
    FrameControl,
    FunctionCode { got: u8 },
    SequenceNumber { got: u8 },
}

fn header(buf: &mut [u8], fc: FunctionCode, seq: u8, dst: [u8; 2], src: [u8; 2]) {
    buf[0..2].copy_from_slice(&FRAME_CTRL);
    buf[SEQ_OFFSET] = seq;
    buf[3..5].copy_from_slice(&PAN_ID);
    buf[5..7].copy_from_slice(&dst);
    buf[7..9].copy_from_slice(&src);
    buf[FN_OFFSET] = fc as u8;
}

/// Build a sync, poll or response frame, ready for the radio's TX buffer.
pub fn base_frame(fc: FunctionCode, seq: u8, dst: [u8; 2], src: [u8; 2]) -> [u8; BASE_FRAME_LEN] {
    let mut buf = [0; BASE_FRAME_LEN];
    header(&mut buf, fc, seq, dst, src);
    buf
}

/// Build the anchor's final frame with the two measured intervals embedded.
pub fn final_frame(
    seq: u8,
    dst: [u8; 2],
    src: [u8; 2],
    tround1: u64,
    treply2: u64,
) -> [u8; FINAL_FRAME_LEN] {
    let mut buf = [0; FINAL_FRAME_LEN];
    header(&mut buf, FunctionCode::Final, seq, dst, src);
    buf[TROUND1_OFFSET..TROUND1_OFFSET + 5].copy_from_slice(&encode_embedded_interval(tround1));
    buf[TREPLY2_OFFSET..TREPLY2_OFFSET + 5].copy_from_slice(&encode_embedded_interval(treply2));
    buf
}

/// Encode an interval for the final frame's 5-byte fields, in the layout
/// deployed responders transmit: shifts 0, 8, 16, 32. Byte 3 carries bits
/// 32..39 and byte 4 is left clear; bits 24..31 are never transmitted.
/// Initiators decode these fields as plain 5-byte little-endian, so the two
/// sides only agree for values below 2^24 — which holds for the reply
/// delays in use, but must not be "fixed" on one side alone.
// TODO: confirm against a captured peer trace whether omitting bits 24..31
// is intentional before touching either side of this encoding.
pub fn encode_embedded_interval(value: u64) -> [u8; 5] {
    [
        value as u8,
        (value >> 8) as u8,
        (value >> 16) as u8,
        (value >> 32) as u8,
        0,
    ]
}

/// Decode the two intervals from a received final frame (without FCS).
pub fn final_intervals(buf: &[u8]) -> (u64, u64) {
    let tround1 = codec::decode_40(buf[TROUND1_OFFSET..TROUND1_OFFSET + 5].try_into().unwrap());
    let treply2 = codec::decode_40(buf[TREPLY2_OFFSET..TREPLY2_OFFSET + 5].try_into().unwrap());
    (tround1, treply2)
}

/// Sequence number of a received frame.
pub fn sequence_number(buf: &[u8]) -> u8 {
    buf[SEQ_OFFSET]
}

/// Validate a received frame against the expected function code and, when
/// the round already fixes it, the expected sequence number. The caller has
/// already checked the on-air length against the inbox report.
pub fn validate(buf: &[u8], fc: FunctionCode, seq: Option<u8>) -> Result<(), FrameError> {
    if buf.len() < BASE_FRAME_LEN {
        return Err(FrameError::Length { got: buf.len() });
    }
    if buf[0..2] != FRAME_CTRL {
        return Err(FrameError::FrameControl);
    }
    if buf[FN_OFFSET] != fc as u8 {
        return Err(FrameError::FunctionCode { got: buf[FN_OFFSET] });
    }
    if let Some(expected) = seq {
        if buf[SEQ_OFFSET] != expected {
            return Err(FrameError::SequenceNumber { got: buf[SEQ_OFFSET] });
        }
    }
    Ok(())
}
