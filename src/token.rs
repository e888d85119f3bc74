//! PID validation and packet field decoding.
//!
//! The first byte of every USB packet carries its type in the low
//! nibble and that nibble's complement in the high nibble. Packets
//! failing the complement check are rejected and reported, not
//! propagated. SPLIT packets share one PID value; start- and
//! complete-splits are told apart by bit 7 of the byte that follows.

use std::convert::TryFrom;
use std::fmt;

use num_enum::TryFromPrimitive;

use crate::{crc, Packet, Tic};

/// The canonical (low-nibble) USB packet identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Pid {
    Out = 0x1,
    Ack = 0x2,
    Data0 = 0x3,
    Ping = 0x4,
    Sof = 0x5,
    Nyet = 0x6,
    Data2 = 0x7,
    Split = 0x8,
    In = 0x9,
    Nak = 0xa,
    Data1 = 0xb,
    PreErr = 0xc,
    Setup = 0xd,
    Stall = 0xe,
    Mdata = 0xf,
}

/// A validated packet type, with SPLIT refined into its two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TokenKind {
    Out,
    Ack,
    Data0,
    Ping,
    Sof,
    Nyet,
    Data2,
    In,
    Nak,
    Data1,
    PreErr,
    Setup,
    Stall,
    Mdata,
    SSplit,
    CSplit,
}

impl TokenKind {
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Out => "OUT",
            TokenKind::Ack => "ACK",
            TokenKind::Data0 => "DATA0",
            TokenKind::Ping => "PING",
            TokenKind::Sof => "SOF",
            TokenKind::Nyet => "NYET",
            TokenKind::Data2 => "DATA2",
            TokenKind::In => "IN",
            TokenKind::Nak => "NAK",
            TokenKind::Data1 => "DATA1",
            TokenKind::PreErr => "PRE_ERR",
            TokenKind::Setup => "SETUP",
            TokenKind::Stall => "STALL",
            TokenKind::Mdata => "MDATA",
            TokenKind::SSplit => "SSPLIT",
            TokenKind::CSplit => "CSPLIT",
        }
    }

    /// IN, OUT or SETUP: the kinds the grammar calls `token`.
    pub fn is_token(self) -> bool {
        matches!(self, TokenKind::In | TokenKind::Out | TokenKind::Setup)
    }

    pub fn is_data(self) -> bool {
        matches!(
            self,
            TokenKind::Data0 | TokenKind::Data1 | TokenKind::Data2 | TokenKind::Mdata
        )
    }

    /// DATA0 or DATA1: the only data packets low-speed devices send.
    pub fn is_low_speed_data(self) -> bool {
        matches!(self, TokenKind::Data0 | TokenKind::Data1)
    }

    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            TokenKind::Ack | TokenKind::Nak | TokenKind::Stall | TokenKind::Nyet
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a packet did not yield a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PidError {
    /// The high nibble is not the complement of the low nibble, or the
    /// canonical value is not a defined PID.
    #[error("pid complement check failed")]
    BadComplement,

    /// A SPLIT packet ended before the byte telling SSPLIT from CSPLIT.
    #[error("split token too short to classify")]
    ShortSplit,
}

/// Maps a packet's first byte to its [`TokenKind`].
pub fn classify(packet: &Packet) -> Result<TokenKind, PidError> {
    let octets = packet.octets();
    let pid = match octets.first() {
        Some(&pid) => pid,
        None => return Err(PidError::BadComplement),
    };
    let canonical = pid & 0xf;
    if canonical != (!pid >> 4) & 0xf {
        return Err(PidError::BadComplement);
    }
    let pid = Pid::try_from(canonical).map_err(|_| PidError::BadComplement)?;
    Ok(match pid {
        Pid::Out => TokenKind::Out,
        Pid::Ack => TokenKind::Ack,
        Pid::Data0 => TokenKind::Data0,
        Pid::Ping => TokenKind::Ping,
        Pid::Sof => TokenKind::Sof,
        Pid::Nyet => TokenKind::Nyet,
        Pid::Data2 => TokenKind::Data2,
        Pid::In => TokenKind::In,
        Pid::Nak => TokenKind::Nak,
        Pid::Data1 => TokenKind::Data1,
        Pid::PreErr => TokenKind::PreErr,
        Pid::Setup => TokenKind::Setup,
        Pid::Stall => TokenKind::Stall,
        Pid::Mdata => TokenKind::Mdata,
        Pid::Split => match octets.get(1) {
            Some(&next) if next & 0x80 != 0 => TokenKind::CSplit,
            Some(_) => TokenKind::SSplit,
            None => return Err(PidError::ShortSplit),
        },
    })
}

/// A validated packet.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Token {
    pub kind: TokenKind,
    pub packet: Packet,
}

impl Token {
    pub fn tic(&self) -> Tic {
        self.packet.tic()
    }

    /// The device address this token targets: the token field for
    /// IN/OUT/SETUP/PING, the hub address for splits.
    pub fn address(&self) -> Option<u8> {
        match self.kind {
            TokenKind::In | TokenKind::Out | TokenKind::Setup | TokenKind::Ping => {
                token_fields(self.packet.octets()).map(|fields| fields.address)
            }
            TokenKind::SSplit | TokenKind::CSplit => {
                split_fields(self.packet.octets()).map(|fields| fields.hub)
            }
            _ => None,
        }
    }

    /// The endpoint this token targets. Splits address a hub, not an
    /// endpoint.
    pub fn endpoint(&self) -> Option<u8> {
        match self.kind {
            TokenKind::In | TokenKind::Out | TokenKind::Setup | TokenKind::Ping => {
                token_fields(self.packet.octets()).map(|fields| fields.endpoint)
            }
            _ => None,
        }
    }
}

/// Decoded IN/OUT/SETUP/PING token fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TokenFields {
    pub address: u8,
    pub endpoint: u8,
    pub crc: u8,
    pub crc_error: bool,
}

/// Decodes a 3-byte token packet (PID included).
pub fn token_fields(bytes: &[u8]) -> Option<TokenFields> {
    if bytes.len() != 3 {
        return None;
    }
    Some(TokenFields {
        address: bytes[1] & 0x7f,
        endpoint: (bytes[1] >> 7) | ((bytes[2] & 0x7) << 1),
        crc: bytes[2] >> 3,
        crc_error: !crc::crc5_valid(&bytes[1..]),
    })
}

/// Decoded DATA0/DATA1/DATA2/MDATA packet fields.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataFields {
    pub data: Vec<u8>,
    pub crc: u16,
    pub crc_error: bool,
}

/// Decodes a data packet (PID, payload, 16-bit CRC).
pub fn data_fields(bytes: &[u8]) -> Option<DataFields> {
    if bytes.len() < 3 {
        return None;
    }
    Some(DataFields {
        data: bytes[1..bytes.len() - 2].to_vec(),
        crc: u16::from(bytes[bytes.len() - 1]) | u16::from(bytes[bytes.len() - 2]) << 8,
        crc_error: !crc::crc16_valid(&bytes[1..]),
    })
}

/// Decoded SOF token fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SofFields {
    pub frame: u16,
    pub crc: u8,
    pub crc_error: bool,
}

/// Decodes a 3-byte SOF packet (PID included).
pub fn sof_fields(bytes: &[u8]) -> Option<SofFields> {
    if bytes.len() != 3 {
        return None;
    }
    Some(SofFields {
        frame: u16::from(bytes[1]) | u16::from(bytes[2] & 0x7) << 8,
        crc: bytes[2] >> 3,
        crc_error: !crc::crc5_valid(&bytes[1..]),
    })
}

/// The endpoint type a SPLIT token announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Position of an isochronous OUT split within its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsoContinuation {
    Middle,
    End,
    Beginning,
    Whole,
}

/// The S/E bits, whose meaning depends on the endpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SplitDetail {
    Isochronous { continuation: IsoContinuation },
    Other { low_speed: bool, end: bool },
}

/// Decoded SSPLIT/CSPLIT token fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SplitFields {
    pub hub: u8,
    pub port: u8,
    pub endpoint_type: EndpointType,
    pub crc: u8,
    pub crc_error: bool,
    pub detail: SplitDetail,
}

/// Decodes a 4-byte SPLIT packet (PID included).
pub fn split_fields(bytes: &[u8]) -> Option<SplitFields> {
    if bytes.len() != 4 {
        return None;
    }
    let endpoint_type = match (bytes[3] >> 1) & 0x3 {
        0 => EndpointType::Control,
        1 => EndpointType::Isochronous,
        2 => EndpointType::Bulk,
        _ => EndpointType::Interrupt,
    };
    let s = bytes[2] >> 7 != 0;
    let e = bytes[3] & 1 != 0;
    let detail = if endpoint_type == EndpointType::Isochronous {
        SplitDetail::Isochronous {
            continuation: match (s, e) {
                (false, false) => IsoContinuation::Middle,
                (false, true) => IsoContinuation::End,
                (true, false) => IsoContinuation::Beginning,
                (true, true) => IsoContinuation::Whole,
            },
        }
    } else {
        SplitDetail::Other {
            low_speed: s,
            end: e,
        }
    };
    Some(SplitFields {
        hub: bytes[1] & 0x7f,
        port: bytes[2] & 0x7f,
        endpoint_type,
        crc: bytes[3] >> 3,
        crc_error: !crc::crc5_valid(&bytes[1..]),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(bytes: &[u8]) -> Packet {
        let mut packet = Packet::new();
        for (offset, &byte) in bytes.iter().enumerate() {
            packet.push(offset as Tic, byte);
        }
        packet
    }

    fn pid_byte(nibble: u8) -> u8 {
        nibble | ((nibble ^ 0xf) << 4)
    }

    #[test]
    fn classify_all_plain_pids() {
        for &(nibble, kind) in &[
            (0x1, TokenKind::Out),
            (0x2, TokenKind::Ack),
            (0x3, TokenKind::Data0),
            (0x4, TokenKind::Ping),
            (0x5, TokenKind::Sof),
            (0x6, TokenKind::Nyet),
            (0x7, TokenKind::Data2),
            (0x9, TokenKind::In),
            (0xa, TokenKind::Nak),
            (0xb, TokenKind::Data1),
            (0xc, TokenKind::PreErr),
            (0xd, TokenKind::Setup),
            (0xe, TokenKind::Stall),
            (0xf, TokenKind::Mdata),
        ] {
            assert_eq!(classify(&packet(&[pid_byte(nibble)])), Ok(kind));
        }
    }

    #[test]
    fn classify_rejects_bad_complement() {
        assert_eq!(
            classify(&packet(&[0x50, 0xab, 0xcd])),
            Err(PidError::BadComplement),
        );
        // 0xf0 passes the complement check but names no packet type.
        assert_eq!(classify(&packet(&[0xf0])), Err(PidError::BadComplement));
    }

    #[test]
    fn classify_refines_split() {
        assert_eq!(
            classify(&packet(&[pid_byte(0x8), 0x05, 0x00, 0x00])),
            Ok(TokenKind::SSplit),
        );
        assert_eq!(
            classify(&packet(&[pid_byte(0x8), 0x85, 0x00, 0x00])),
            Ok(TokenKind::CSplit),
        );
        assert_eq!(
            classify(&packet(&[pid_byte(0x8)])),
            Err(PidError::ShortSplit),
        );
    }

    #[test]
    fn token_field_decode() {
        let crc = crc::token_crc5(0x15, 0xa);
        let bytes = [pid_byte(0xd), 0x15, 0x5 | (crc << 3)];
        let fields = token_fields(&bytes).unwrap();
        assert_eq!(fields.address, 0x15);
        assert_eq!(fields.endpoint, 0xa);
        assert_eq!(fields.crc, crc);
        assert!(!fields.crc_error);

        let corrupt = [bytes[0], bytes[1] ^ 0x01, bytes[2]];
        assert!(token_fields(&corrupt).unwrap().crc_error);
        assert!(token_fields(&bytes[..2]).is_none());
    }

    #[test]
    fn data_field_decode() {
        let payload = b"\x80\x06\x00\x01";
        let crc = crc::data_crc16(payload);
        let mut bytes = vec![pid_byte(0x3)];
        bytes.extend_from_slice(payload);
        bytes.push((crc & 0xff) as u8);
        bytes.push((crc >> 8) as u8);
        let fields = data_fields(&bytes).unwrap();
        assert_eq!(fields.data, payload.to_vec());
        assert!(!fields.crc_error);

        bytes[1] ^= 0xff;
        assert!(data_fields(&bytes).unwrap().crc_error);
    }

    #[test]
    fn sof_field_decode() {
        let frame = 0x2c9;
        let crc = crc::sof_crc5(frame);
        let bytes = [
            pid_byte(0x5),
            (frame & 0xff) as u8,
            ((frame >> 8) as u8 & 0x7) | (crc << 3),
        ];
        let fields = sof_fields(&bytes).unwrap();
        assert_eq!(fields.frame, frame);
        assert!(!fields.crc_error);
    }

    #[test]
    fn split_field_decode() {
        // SSPLIT, hub 5, port 3, low-speed interrupt, end bit set.
        let bits = 0x05u32 | (0x03 | 0x80) << 8 | (0x1 | 0x3 << 1) << 16;
        let crc = crc::split_crc5(bits);
        let bytes = [
            pid_byte(0x8),
            0x05,
            0x83,
            0x1 | (0x3 << 1) | (crc << 3),
        ];
        let fields = split_fields(&bytes).unwrap();
        assert_eq!(fields.hub, 5);
        assert_eq!(fields.port, 3);
        assert_eq!(fields.endpoint_type, EndpointType::Interrupt);
        assert_eq!(
            fields.detail,
            SplitDetail::Other {
                low_speed: true,
                end: true,
            },
        );
        assert!(!fields.crc_error);
    }

    #[test]
    fn split_iso_continuation() {
        let bytes = [pid_byte(0x8), 0x05, 0x83, 0x1 | (0x1 << 1)];
        let fields = split_fields(&bytes).unwrap();
        assert_eq!(fields.endpoint_type, EndpointType::Isochronous);
        assert_eq!(
            fields.detail,
            SplitDetail::Isochronous {
                continuation: IsoContinuation::Whole,
            },
        );
    }

    #[test]
    fn token_addressing() {
        let crc = crc::token_crc5(2, 1);
        let token = Token {
            kind: TokenKind::In,
            packet: packet(&[pid_byte(0x9), 2 | 1 << 7, crc << 3]),
        };
        assert_eq!(token.address(), Some(2));
        assert_eq!(token.endpoint(), Some(1));

        let ack = Token {
            kind: TokenKind::Ack,
            packet: packet(&[pid_byte(0x2)]),
        };
        assert_eq!(ack.address(), None);
        assert_eq!(ack.endpoint(), None);
    }
}
