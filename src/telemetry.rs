//! Host-facing console: human-readable lines interleaved with length-tagged
//! binary blobs on one serial stream.
//!
//! Every blob is announced by a `"BLOB / <kind> / v<N> / <bytes>\n"` header
//! line, followed by exactly that many raw bytes and a closing newline. The
//! host parser keys on the `BLOB / ` prefix and may ignore every other
//! line, so debug output can be sprinkled in freely.
//!
//! Records are serialized field by field, little-endian, so the wire layout
//! is pinned here and nowhere else.

use core::fmt::{self, Write as _};

use heapless::String;

use crate::radio::{CirSegmentDiag, RxDiagnostics, StsQuality};

/// Blob format versions, bumped whenever a record layout changes.
pub const TOA_VERSION: u8 = 3;
pub const CIR_ANALYSIS_VERSION: u8 = 1;
pub const CIR_VERSION: u8 = 1;
pub const TWR_VERSION: u8 = 2;

pub const TOA_WIRE_LEN: usize = 43;
pub const CIR_ANALYSIS_WIRE_LEN: usize = 24;
pub const TWR_WIRE_LEN: usize = 40;

/// Byte sink behind the console; on the target this is the UART TX line.
/// Serial output is best-effort: a dropped byte must not abort a ranging
/// round, so the sink does not report errors.
pub trait SerialSink {
    fn write(&mut self, bytes: &[u8]);
}

/// Line/blob writer over a [`SerialSink`].
pub struct Console<W: SerialSink> {
    sink: W,
}

impl<W: SerialSink> Console<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    /// Write a pre-formatted line. The caller includes the newline.
    pub fn line(&mut self, line: &str) {
        self.sink.write(line.as_bytes());
    }

    /// Format into the 64-byte print buffer and write the result. Output
    /// beyond the buffer is truncated, like the `snprintf` it replaces.
    pub fn fmt_line(&mut self, args: fmt::Arguments) {
        struct Trunc(String<64>);

        impl fmt::Write for Trunc {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                for c in s.chars() {
                    if self.0.push(c).is_err() {
                        break;
                    }
                }
                Ok(())
            }
        }

        let mut buf = Trunc(String::new());
        let _ = buf.write_fmt(args);
        self.sink.write(buf.0.as_bytes());
    }

    /// Emit one length-tagged blob.
    pub fn blob(&mut self, kind: &str, version: u8, payload: &[u8]) {
        self.fmt_line(format_args!(
            "BLOB / {} / v{} / {}\n",
            kind,
            version,
            payload.len()
        ));
        self.sink.write(payload);
        self.sink.write(b"\n");
    }
}

/// Per-round ranging result, `twr` blob.
#[derive(Clone, Copy, Default, Debug)]
pub struct TwrRecord {
    pub treply1: u64,
    pub treply2: u64,
    pub tround1: u64,
    pub tround2: u64,
    pub dist_mm: u32,
    pub twr_count: u16,
    pub rotation_deg: u16,
}

impl TwrRecord {
    pub fn to_bytes(&self) -> [u8; TWR_WIRE_LEN] {
        let mut buf = [0; TWR_WIRE_LEN];
        buf[0..8].copy_from_slice(&self.treply1.to_le_bytes());
        buf[8..16].copy_from_slice(&self.treply2.to_le_bytes());
        buf[16..24].copy_from_slice(&self.tround1.to_le_bytes());
        buf[24..32].copy_from_slice(&self.tround2.to_le_bytes());
        buf[32..36].copy_from_slice(&self.dist_mm.to_le_bytes());
        buf[36..38].copy_from_slice(&self.twr_count.to_le_bytes());
        buf[38..40].copy_from_slice(&self.rotation_deg.to_le_bytes());
        buf
    }
}

/// Serialize the `toa` diagnostics record: times and phases of arrival for
/// all three receiver pipelines plus the frame-level CIA outputs.
pub fn encode_toa(diag: &RxDiagnostics, sts: StsQuality) -> [u8; TOA_WIRE_LEN] {
    let mut buf = [0; TOA_WIRE_LEN];
    buf[0..4].copy_from_slice(&diag.cia_diag_1.to_le_bytes());
    buf[4..6].copy_from_slice(&diag.ip_poa.to_le_bytes());
    buf[6..8].copy_from_slice(&diag.sts1_poa.to_le_bytes());
    buf[8..10].copy_from_slice(&diag.sts2_poa.to_le_bytes());
    buf[10..12].copy_from_slice(&diag.pdoa.to_le_bytes());
    buf[12..14].copy_from_slice(&diag.xtal_offset.to_le_bytes());
    buf[14] = sts.score.clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8;
    buf[15..17].copy_from_slice(&sts.index.to_le_bytes());
    buf[17..22].copy_from_slice(&diag.tdoa[..5]);
    // TDoA is 41 bits; bit 40 is the sign, in the low bit of the sixth byte.
    buf[22] = diag.tdoa[5] & 0x01;
    buf[23..28].copy_from_slice(&diag.ip_toa);
    buf[28] = diag.ip_toa_status;
    buf[29..34].copy_from_slice(&diag.sts1_toa);
    buf[34] = diag.sts1_toa_status;
    buf[35..40].copy_from_slice(&diag.sts2_toa);
    buf[40] = diag.sts2_toa_status;
    buf[41] = diag.fp_threshold_test;
    buf[42] = diag.dgc_decision;
    buf
}

/// Serialize one `cir analysis` record (first-path neighborhood of one
/// receiver pipeline).
pub fn encode_cir_analysis(seg: &CirSegmentDiag) -> [u8; CIR_ANALYSIS_WIRE_LEN] {
    let mut buf = [0; CIR_ANALYSIS_WIRE_LEN];
    buf[0..4].copy_from_slice(&seg.peak.to_le_bytes());
    buf[4..8].copy_from_slice(&seg.power.to_le_bytes());
    buf[8..12].copy_from_slice(&seg.f1.to_le_bytes());
    buf[12..16].copy_from_slice(&seg.f2.to_le_bytes());
    buf[16..20].copy_from_slice(&seg.f3.to_le_bytes());
    buf[20..22].copy_from_slice(&seg.fp_index.to_le_bytes());
    buf[22..24].copy_from_slice(&seg.accum_count.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecSink(Vec<u8>);

    impl SerialSink for VecSink {
        fn write(&mut self, bytes: &[u8]) {
            self.0.extend_from_slice(bytes);
        }
    }

    #[test]
    fn blob_framing() {
        let mut console = Console::new(VecSink::default());
        console.blob("twr", TWR_VERSION, &[0xaa; 40]);

        let out = console.sink.0;
        let header = b"BLOB / twr / v2 / 40\n";
        assert_eq!(&out[..header.len()], header);
        assert_eq!(&out[header.len()..header.len() + 40], &[0xaa; 40]);
        assert_eq!(out[header.len() + 40], b'\n');
        assert_eq!(out.len(), header.len() + 41);
    }

    #[test]
    fn blob_header_for_cir_dump() {
        let mut console = Console::new(VecSink::default());
        let payload = vec![0u8; 12288];
        console.blob("cir", CIR_VERSION, &payload);
        assert!(console.sink.0.starts_with(b"BLOB / cir / v1 / 12288\n"));
        assert_eq!(console.sink.0.len(), 24 + 12288 + 1);
    }

    #[test]
    fn fmt_line_truncates_at_print_buffer() {
        let mut console = Console::new(VecSink::default());
        let long = "x".repeat(100);
        console.fmt_line(format_args!("{long}"));
        assert_eq!(console.sink.0.len(), 64);
    }

    #[test]
    fn twr_record_wire_layout() {
        let rec = TwrRecord {
            treply1: 0x0102_0304_0506_0708,
            treply2: 2,
            tround1: 3,
            tround2: 4,
            dist_mm: 0xdead_beef,
            twr_count: 0x1122,
            rotation_deg: 359,
        };
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[8..16], &[2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[32..36], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(&bytes[36..38], &[0x22, 0x11]);
        assert_eq!(&bytes[38..40], &[0x67, 0x01]);
    }

    #[test]
    fn toa_record_wire_layout() {
        let mut diag = RxDiagnostics::default();
        diag.cia_diag_1 = 0x0403_0201;
        diag.ip_poa = 0x1111;
        diag.sts1_poa = 0x2222;
        diag.sts2_poa = 0x3333;
        diag.pdoa = -2;
        diag.xtal_offset = -3;
        diag.tdoa = [0x51, 0x52, 0x53, 0x54, 0x55, 0xff];
        diag.ip_toa = [0x61, 0x62, 0x63, 0x64, 0x65];
        diag.ip_toa_status = 0x71;
        diag.sts1_toa = [0x81, 0x82, 0x83, 0x84, 0x85];
        diag.sts1_toa_status = 0x91;
        diag.sts2_toa = [0xa1, 0xa2, 0xa3, 0xa4, 0xa5];
        diag.sts2_toa_status = 0xb1;
        diag.fp_threshold_test = 1;
        diag.dgc_decision = 6;

        let bytes = encode_toa(&diag, StsQuality { score: -5, index: 0x0102 });
        assert_eq!(bytes.len(), 43);
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..6], &[0x11, 0x11]);
        assert_eq!(&bytes[10..12], &[0xfe, 0xff]); // pdoa = -2
        assert_eq!(bytes[14], 0xfb); // sts score -5 as a signed byte
        assert_eq!(&bytes[15..17], &[0x02, 0x01]);
        assert_eq!(&bytes[17..22], &[0x51, 0x52, 0x53, 0x54, 0x55]);
        assert_eq!(bytes[22], 0x01); // only the sign bit of tdoa[5]
        assert_eq!(&bytes[23..28], &[0x61, 0x62, 0x63, 0x64, 0x65]);
        assert_eq!(bytes[28], 0x71);
        assert_eq!(bytes[34], 0x91);
        assert_eq!(bytes[40], 0xb1);
        assert_eq!(bytes[41], 1);
        assert_eq!(bytes[42], 6);
    }

    #[test]
    fn cir_analysis_record_wire_layout() {
        let seg = CirSegmentDiag {
            peak: 1,
            power: 2,
            f1: 3,
            f2: 4,
            f3: 5,
            fp_index: (745 << 6) | 13, // fixed-point first-path index
            accum_count: 64,
        };
        let bytes = encode_cir_analysis(&seg);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[16..20], &[5, 0, 0, 0]);
        assert_eq!(u16::from_le_bytes([bytes[20], bytes[21]]) >> 6, 745);
        assert_eq!(&bytes[22..24], &[64, 0]);
    }
}
