//! Bulk-IN framing.
//!
//! Every packet the chip sends on its bulk-IN endpoint starts with two status
//! bytes (modem lines, then line status), followed by up to
//! `max_packet_size - 2` payload bytes. A single USB read may return several
//! packets back to back. [`FrameCodec`] removes the headers, concatenates the
//! payload and folds the line-error flags of every packet together.

use std::ops::{BitOr, BitOrAssign};

use crate::constants::{LSR_BREAK, LSR_FIFO, LSR_FRAMING, LSR_OVERRUN, LSR_PARITY};
use crate::error::{Error, Result, TransportError};
use crate::types::ModemStatus;

/// Length of the status header at the start of every bulk-IN packet.
pub const STATUS_LEN: usize = 2;

/// Receive-side error flags reported in the line status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LineErrors(u8);

impl LineErrors {
    /// No errors.
    pub const NONE: Self = Self(0);
    /// Receive overrun.
    pub const OVERRUN: Self = Self(LSR_OVERRUN);
    /// Parity error.
    pub const PARITY: Self = Self(LSR_PARITY);
    /// Framing error.
    pub const FRAMING: Self = Self(LSR_FRAMING);
    /// Break condition received.
    pub const BREAK: Self = Self(LSR_BREAK);
    /// Error in the receive FIFO.
    pub const FIFO: Self = Self(LSR_FIFO);

    const MASK: u8 = LSR_OVERRUN | LSR_PARITY | LSR_FRAMING | LSR_BREAK | LSR_FIFO;

    /// Extract the error flags from a line status byte.
    pub fn from_line_status(byte: u8) -> Self {
        Self(byte & Self::MASK)
    }

    /// Raw flag bits, in line status register positions.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether no error flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every flag in `other` is also set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LineErrors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LineErrors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Result of decoding one raw bulk-IN read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frames {
    /// Payload bytes of every packet, in arrival order.
    pub payload: Vec<u8>,
    /// Status header of the last packet.
    pub status: Option<ModemStatus>,
    /// Union of the line-error flags of every packet.
    pub errors: LineErrors,
    /// Number of packets decoded.
    pub packets: usize,
}

/// Splits outgoing data and decodes incoming packets for one endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_packet_size: usize,
}

impl FrameCodec {
    /// Create a codec for the given bulk max-packet size.
    pub fn new(max_packet_size: usize) -> Result<Self> {
        if max_packet_size <= STATUS_LEN {
            return Err(Error::InvalidArgument(
                "max packet size must exceed the status header",
            ));
        }
        Ok(Self { max_packet_size })
    }

    /// The bulk max-packet size this codec was built for.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Largest payload a single bulk-IN packet can carry.
    pub fn payload_per_packet(&self) -> usize {
        self.max_packet_size - STATUS_LEN
    }

    /// Split outgoing data into bulk-OUT transfers of at most `chunk_size`
    /// bytes.
    ///
    /// The size is rounded down to a whole number of packets (at least one),
    /// so every split point falls on a packet boundary.
    pub fn chunks<'a>(&self, data: &'a [u8], chunk_size: usize) -> std::slice::Chunks<'a, u8> {
        let packets = (chunk_size / self.max_packet_size).max(1);
        data.chunks(packets * self.max_packet_size)
    }

    /// Decode a raw bulk-IN read into its payload and status.
    ///
    /// A read that is empty, or that ends in a packet with fewer than two
    /// bytes, is malformed.
    pub fn decode(&self, raw: &[u8]) -> Result<Frames> {
        let mut frames = Frames::default();
        self.decode_into(raw, &mut frames.payload).map(|(status, errors, packets)| {
            frames.status = Some(status);
            frames.errors = errors;
            frames.packets = packets;
            frames
        })
    }

    /// Like [`decode`](Self::decode), appending the payload to `out`.
    ///
    /// Returns the last status header, the union of line errors and the
    /// packet count. On error nothing is appended.
    pub fn decode_into(
        &self,
        raw: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(ModemStatus, LineErrors, usize)> {
        if raw.len() < STATUS_LEN {
            return Err(TransportError::ShortFrame { len: raw.len() }.into());
        }
        if let Some(last) = raw.chunks(self.max_packet_size).last() {
            if last.len() < STATUS_LEN {
                return Err(TransportError::ShortFrame { len: last.len() }.into());
            }
        }

        let mut status = ModemStatus::default();
        let mut errors = LineErrors::NONE;
        let mut packets = 0;

        for packet in raw.chunks(self.max_packet_size) {
            status = ModemStatus::from_bytes(packet[0], packet[1]);
            errors |= LineErrors::from_line_status(packet[1]);
            out.extend_from_slice(&packet[STATUS_LEN..]);
            packets += 1;
        }

        if !errors.is_empty() {
            log::debug!("line errors in bulk-IN packets: {:#04x}", errors.bits());
        }

        Ok((status, errors, packets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_packet() {
        // A 64-byte packet with 2 status + 62 payload
        let mut data = vec![0u8; 64];
        data[0] = 0x01;
        data[1] = 0x60;
        for (i, byte) in data.iter_mut().enumerate().skip(2) {
            *byte = i as u8;
        }

        let codec = FrameCodec::new(64).unwrap();
        let frames = codec.decode(&data).unwrap();
        assert_eq!(frames.payload.len(), 62);
        for (i, byte) in frames.payload.iter().enumerate() {
            assert_eq!(*byte, (i + 2) as u8);
        }
        assert_eq!(frames.packets, 1);
        assert!(frames.errors.is_empty());
    }

    #[test]
    fn multiple_packets() {
        let codec = FrameCodec::new(8).unwrap();
        // Two full packets: [S S 2 3 4 5 6 7] [S S A B C D E F] and a short one
        let data = [
            0xAA, 0x60, 2, 3, 4, 5, 6, 7, //
            0xCC, 0x60, 10, 11, 12, 13, 14, 15, //
            0x01, 0x60, 20,
        ];

        let frames = codec.decode(&data).unwrap();
        assert_eq!(
            frames.payload,
            [2, 3, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15, 20]
        );
        assert_eq!(frames.packets, 3);
        assert_eq!(frames.status, Some(ModemStatus::from_bytes(0x01, 0x60)));
    }

    #[test]
    fn status_only() {
        let codec = FrameCodec::new(64).unwrap();
        let frames = codec.decode(&[0x01, 0x60]).unwrap();
        assert!(frames.payload.is_empty());
        assert_eq!(frames.packets, 1);
    }

    #[test]
    fn short_frames_are_rejected() {
        let codec = FrameCodec::new(64).unwrap();
        for raw in [&[][..], &[0x01][..]] {
            match codec.decode(raw) {
                Err(Error::Transport(TransportError::ShortFrame { len })) => {
                    assert_eq!(len, raw.len())
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        // Trailing one-byte packet after a full one
        let codec = FrameCodec::new(4).unwrap();
        let mut out = vec![0xEE];
        assert!(codec.decode_into(&[1, 0x60, 7, 8, 1], &mut out).is_err());
        assert_eq!(out, [0xEE]);
    }

    #[test]
    fn errors_accumulate_across_packets() {
        let codec = FrameCodec::new(4).unwrap();
        let data = [0x01, 0x60 | 0x02, 1, 2, 0x01, 0x60 | 0x08, 3, 4];
        let frames = codec.decode(&data).unwrap();
        assert!(frames.errors.contains(LineErrors::OVERRUN));
        assert!(frames.errors.contains(LineErrors::FRAMING));
        assert!(!frames.errors.contains(LineErrors::PARITY));
        assert_eq!(frames.payload, [1, 2, 3, 4]);
    }

    #[test]
    fn chunks_fall_on_packet_boundaries() {
        let codec = FrameCodec::new(64).unwrap();
        let data = vec![0u8; 300];

        let sizes: Vec<usize> = codec.chunks(&data, 100).map(<[u8]>::len).collect();
        assert_eq!(sizes, [64, 64, 64, 64, 44]);

        let sizes: Vec<usize> = codec.chunks(&data, 10).map(<[u8]>::len).collect();
        assert_eq!(sizes, [64, 64, 64, 64, 44]);

        let sizes: Vec<usize> = codec.chunks(&data, 4096).map(<[u8]>::len).collect();
        assert_eq!(sizes, [300]);
    }

    #[test]
    fn tiny_packet_size_rejected() {
        assert!(FrameCodec::new(2).is_err());
        assert!(FrameCodec::new(0).is_err());
    }
}
