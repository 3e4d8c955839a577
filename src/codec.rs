//! MDR wire frame codec.
//!
//! Wire layout: `START(1) | KIND(1) | SEQ(1) | LEN_BE(4) | PAYLOAD(LEN) | CHECKSUM(1) | END(1)`.
//! Bytes equal to [START], [END] or [ESCAPE] appearing between `KIND` and `CHECKSUM`
//! (inclusive) are escaped on the wire as `ESCAPE, byte ^ ESCAPE_MASK`.
//!
//! The decoder is a pull parser: [Decoder::feed] appends bytes received from the
//! link layer and [Decoder::poll] yields the next decoded frame, [Poll::NeedMore]
//! if the buffered bytes do not yet contain a full frame, or [Poll::BadFrame] if
//! the buffered frame is malformed. A `BadFrame` never poisons the decoder: the
//! next `poll` resynchronizes to the following [START] byte.

/// Marks the start of a frame on the wire.
pub const START: u8 = 0x3E;
/// Marks the end of a frame on the wire.
pub const END: u8 = 0x3C;
/// Escape byte used for byte-stuffing [START], [END] and itself.
pub const ESCAPE: u8 = 0x3D;
/// XOR mask applied to an escaped byte's value.
const ESCAPE_MASK: u8 = 0x20;

/// Upper bound on a single frame's payload length.
///
/// Not a wire limitation (`LEN_BE` is four bytes), but the bound
/// [crate::dispatcher::Dispatcher::call] enforces before it attempts to
/// frame an application request.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

/// Frame kind, the first byte of a frame's body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FrameKind {
    /// Acknowledgement of a received DATA frame.
    Ack,
    /// Application data frame, acknowledged by the peer.
    DataMdr,
    /// Application data frame on the secondary (NO2) channel, acknowledged by the peer.
    DataMdrNo2,
    /// Fire-and-forget frame; never acknowledged.
    Shot,
}

impl FrameKind {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Ack => 0x01,
            Self::DataMdr => 0x0C,
            Self::DataMdrNo2 => 0x0E,
            Self::Shot => 0x09,
        }
    }

    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ack),
            0x0C => Some(Self::DataMdr),
            0x0E => Some(Self::DataMdrNo2),
            0x09 => Some(Self::Shot),
            _ => None,
        }
    }

    /// Whether a frame of this kind carries an application payload that must
    /// be acknowledged by the receiver.
    pub const fn is_data(self) -> bool {
        matches!(self, Self::DataMdr | Self::DataMdrNo2)
    }
}

/// A fully decoded wire frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Per-direction sequence bit (0 or 1).
    pub seq: u8,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Encodes `(kind, seq, payload)` into its escaped, checksummed wire representation.
///
/// `seq` must be 0 or 1; any other value is a programmer error (the link layer
/// never produces one).
pub fn encode(kind: FrameKind, seq: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(seq <= 1, "sequence number is a single bit");

    let len = payload.len() as u32;
    let mut body = Vec::with_capacity(6 + payload.len() + 1);
    body.push(kind.to_byte());
    body.push(seq);
    body.extend_from_slice(&len.to_be_bytes());
    body.extend_from_slice(payload);
    let checksum = checksum(&body);
    body.push(checksum);

    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(START);
    for &b in &body {
        if b == START || b == END || b == ESCAPE {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_MASK);
        } else {
            out.push(b);
        }
    }
    out.push(END);
    out
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Outcome of [Decoder::poll].
#[derive(Debug, Eq, PartialEq)]
pub enum Poll {
    /// A complete, valid frame was decoded.
    Frame(Frame),
    /// The buffered bytes do not yet contain a complete frame.
    NeedMore,
    /// The buffered frame was malformed; the decoder has resynchronized past it.
    BadFrame(String),
}

/// Incremental pull parser over a stream of inbound bytes.
#[derive(Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes received from the link to the decode buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode the next frame from the buffered bytes.
    ///
    /// Call repeatedly after a [Poll::Frame] or [Poll::BadFrame] to drain
    /// every frame already buffered; stop once [Poll::NeedMore] is returned.
    pub fn poll(&mut self) -> Poll {
        if self.buf.first() != Some(&START) {
            match self.buf.iter().position(|&b| b == START) {
                Some(pos) => self.buf.drain(0..pos),
                None => {
                    self.buf.clear();
                    return Poll::NeedMore;
                }
            };
        }
        if self.buf.is_empty() {
            return Poll::NeedMore;
        }

        let mut unescaped = Vec::new();
        let mut i = 1;
        let end_idx = loop {
            if i >= self.buf.len() {
                return Poll::NeedMore;
            }
            match self.buf[i] {
                ESCAPE => {
                    if i + 1 >= self.buf.len() {
                        return Poll::NeedMore;
                    }
                    unescaped.push(self.buf[i + 1] ^ ESCAPE_MASK);
                    i += 2;
                }
                END => break i,
                START => {
                    // An unescaped START before END: the previous frame was truncated.
                    // Resynchronize to this new START and report the truncation.
                    self.buf.drain(0..i);
                    return Poll::BadFrame("unescaped START before END".to_string());
                }
                b => {
                    unescaped.push(b);
                    i += 1;
                }
            }
        };
        self.buf.drain(0..=end_idx);

        if unescaped.len() < 7 {
            return Poll::BadFrame(format!("frame too short ({} bytes)", unescaped.len()));
        }
        let kind_byte = unescaped[0];
        let seq = unescaped[1];
        let len = u32::from_be_bytes([unescaped[2], unescaped[3], unescaped[4], unescaped[5]]) as usize;
        if unescaped.len() != 6 + len + 1 {
            return Poll::BadFrame(format!(
                "length mismatch: header declares {len} byte payload, frame has {}",
                unescaped.len().saturating_sub(7)
            ));
        }

        let computed = checksum(&unescaped[..6 + len]);
        let received = unescaped[6 + len];
        if computed != received {
            return Poll::BadFrame(format!("checksum mismatch: computed {computed:#04x}, got {received:#04x}"));
        }

        let Some(kind) = FrameKind::from_byte(kind_byte) else {
            return Poll::BadFrame(format!("unknown frame kind {kind_byte:#04x}"));
        };
        if seq > 1 {
            return Poll::BadFrame(format!("invalid sequence bit {seq}"));
        }

        let payload = unescaped[6..6 + len].to_vec();
        Poll::Frame(Frame { kind, seq, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(wire: &[u8]) -> Poll {
        let mut dec = Decoder::new();
        dec.feed(wire);
        dec.poll()
    }

    #[test]
    fn round_trip_empty_payload() {
        let wire = encode(FrameKind::Ack, 1, &[]);
        match decode_one(&wire) {
            Poll::Frame(f) => {
                assert_eq!(f.kind, FrameKind::Ack);
                assert_eq!(f.seq, 1);
                assert!(f.payload.is_empty());
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_arbitrary_payload() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let wire = encode(FrameKind::DataMdr, 0, &payload);
        match decode_one(&wire) {
            Poll::Frame(f) => {
                assert_eq!(f.kind, FrameKind::DataMdr);
                assert_eq!(f.seq, 0);
                assert_eq!(f.payload, payload);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_every_single_byte_value() {
        // Escape safety must hold regardless of which byte value appears.
        for b in 0..=255u8 {
            let payload = vec![b; 4];
            let wire = encode(FrameKind::DataMdrNo2, 0, &payload);
            match decode_one(&wire) {
                Poll::Frame(f) => assert_eq!(f.payload, payload),
                other => panic!("byte {b:#04x}: expected Frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn escaped_frames_contain_no_unescaped_markers() {
        let payload = vec![START, END, ESCAPE, 0x00, 0xFF];
        let wire = encode(FrameKind::DataMdr, 1, &payload);
        // First and last byte are the real START/END; nothing in between may
        // be an unescaped START, END, or dangling ESCAPE.
        let body = &wire[1..wire.len() - 1];
        let mut i = 0;
        while i < body.len() {
            match body[i] {
                ESCAPE => i += 2,
                START | END => panic!("unescaped marker byte in frame body"),
                _ => i += 1,
            }
        }
    }

    #[test]
    fn single_byte_payload_mutation_causes_bad_frame() {
        let wire = encode(FrameKind::DataMdr, 0, b"hello");
        // Flip a bit inside the payload region (safely, away from escape sequences).
        let payload_start = wire.iter().position(|&b| b == b'h').unwrap();
        let mut mutated = wire.clone();
        mutated[payload_start] ^= 0x01;
        match decode_one(&mutated) {
            Poll::BadFrame(_) => {}
            other => panic!("expected BadFrame after mutation, got {other:?}"),
        }
    }

    #[test]
    fn need_more_until_frame_complete() {
        let wire = encode(FrameKind::Ack, 0, b"partial");
        let mut dec = Decoder::new();
        dec.feed(&wire[..wire.len() - 2]);
        assert_eq!(dec.poll(), Poll::NeedMore);
        dec.feed(&wire[wire.len() - 2..]);
        assert!(matches!(dec.poll(), Poll::Frame(_)));
    }

    #[test]
    fn bad_frame_resyncs_to_next_start() {
        let good = encode(FrameKind::Ack, 0, b"ok");
        let mut garbage = vec![0xAA, 0xBB, START, 0xFF]; // malformed leading frame
        garbage.extend_from_slice(&good);

        let mut dec = Decoder::new();
        dec.feed(&garbage);
        // First poll(s) report the malformed leading bytes, never panicking,
        // and the decoder eventually recovers the well-formed trailing frame.
        let mut recovered = false;
        for _ in 0..4 {
            match dec.poll() {
                Poll::Frame(f) => {
                    assert_eq!(f.payload, b"ok");
                    recovered = true;
                    break;
                }
                Poll::BadFrame(_) => continue,
                Poll::NeedMore => break,
            }
        }
        assert!(recovered, "decoder did not resynchronize to the valid frame");
    }

    #[test]
    fn decoder_feed_is_incremental_across_many_frames() {
        let mut dec = Decoder::new();
        let frames: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; i as usize + 1]).collect();
        let mut wire = Vec::new();
        for payload in &frames {
            wire.extend(encode(FrameKind::DataMdr, (frames.iter().position(|p| p == payload).unwrap() % 2) as u8, payload));
        }
        dec.feed(&wire);
        let mut decoded = Vec::new();
        loop {
            match dec.poll() {
                Poll::Frame(f) => decoded.push(f.payload),
                Poll::NeedMore => break,
                Poll::BadFrame(reason) => panic!("unexpected bad frame: {reason}"),
            }
        }
        assert_eq!(decoded, frames);
    }
}
