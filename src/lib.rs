//! A decoder for capture streams produced by the ITI1480A USB bus
//! analyzer.
//!
//! The analyzer's FPGA front-end emits a compact binary stream of
//! ULPI-level line events, RxCmd status words, raw bus bytes and timing
//! deltas. This crate turns that stream into semantically meaningful USB
//! events: bus resets, EOP markers, speed transitions, device
//! connections, individual packets, full transactions and endpoint-zero
//! control transfers.
//!
//! The pipeline is layered, single-threaded and push-driven:
//!
//! - [`Framer`](framer::Framer) reconstructs variable-length timestamped
//!   records from the byte-swapped 16-bit on-disk words;
//! - [`Packetiser`](packetiser::Packetiser) tracks bus state and groups
//!   bus bytes between RxActive edges into [`Packet`]s;
//! - [`token`] validates packet PIDs and decodes token fields;
//! - [`TransactionAggregator`](transaction::TransactionAggregator)
//!   groups tokens into USB 2.0 transactions;
//! - [`PipeRouter`](pipe::PipeRouter) dispatches transactions to
//!   per-pipe aggregators, composing endpoint-zero control
//!   [`Transfer`]s along the way.
//!
//! [`Decoder`] wires the layers together behind a chunk-oriented `push`
//! interface:
//!
//! ```
//! use iti1480a::{Decoder, Message, Status, Tic};
//!
//! let mut decoder = Decoder::new(Vec::<(Tic, Message)>::new());
//! // a null time-delta record: advances nothing, emits nothing
//! let status = decoder.push(&[0x00, 0x00]).unwrap();
//! assert_eq!(status, Status::Running);
//! decoder.finish().unwrap();
//! assert!(decoder.into_sink().is_empty());
//! ```
//!
//! Common abbreviations:
//!
//! - tic: one period of the analyzer's 60 MHz clock, i.e. 100/6 ns;
//! - RxCmd: the ULPI PHY status word (line state, VBus, RxActive);
//! - SE0: single-ended zero, both data lines low (EOP and reset);
//! - PID: the leading USB packet byte, type nibble plus its complement.

pub mod crc;
pub mod framer;
pub mod packetiser;
pub mod pipe;
pub mod time;
pub mod token;
pub mod transaction;
pub mod transfer;

mod decoder;

pub use decoder::{Decoder, Status};
pub use framer::{Framer, MalformedStream};
pub use packetiser::{BusEvent, CaptureDone, Packetiser, RxCmd};
pub use token::{PidError, Token, TokenKind};

/// One period of the analyzer's 60 MHz time base: 100/6 ns.
///
/// Tic values are non-decreasing over the life of a capture.
pub type Tic = u64;

/// The payload-bearing record kinds produced by the
/// [`Framer`](framer::Framer).
///
/// The wire format also carries payload-less time-delta records; those
/// only advance the tic counter and never surface as a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RecordKind {
    /// One byte describing a bus-level event (connection, chirp,
    /// capture control).
    Event,

    /// One byte seen on the wire while RxActive is asserted.
    Data,

    /// One ULPI RxCmd status byte.
    RxCmd,
}

/// A single demultiplexed capture record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    /// Absolute tic at which the record was captured.
    pub tic: Tic,

    /// What the payload byte describes.
    pub kind: RecordKind,

    /// The payload byte.
    pub payload: u8,
}

/// An on-the-wire USB packet: the bytes captured between an
/// RxActive-rising edge and the following falling edge, each with the
/// tic it was seen at. Never empty once emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Packet {
    tics: Vec<Tic>,
    bytes: Vec<u8>,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    pub(crate) fn push(&mut self, tic: Tic, byte: u8) {
        self.tics.push(tic);
        self.bytes.push(byte);
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Tic of the first packet byte. The packet's transactions inherit
    /// this timestamp.
    pub fn tic(&self) -> Tic {
        self.tics.first().copied().unwrap_or(0)
    }

    /// The packet bytes, PID first.
    pub fn octets(&self) -> &[u8] {
        &self.bytes
    }

    /// Per-byte capture tics, parallel to [`octets`](Self::octets).
    pub fn tics(&self) -> &[Tic] {
        &self.tics
    }

    pub fn samples(&self) -> impl Iterator<Item = (Tic, u8)> + '_ {
        self.tics.iter().copied().zip(self.bytes.iter().copied())
    }

    /// Renders the packet bytes as `0x50 0xab 0xcd`, the form used by
    /// bad-PID diagnostics.
    pub fn hex(&self) -> String {
        let mut out = String::new();
        for byte in &self.bytes {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("{:#04x}", byte));
        }
        out
    }
}

/// A completed transaction: one accepted production of the USB 2.0
/// transaction grammar, token marker first.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transaction {
    pub tokens: Vec<Token>,
}

impl Transaction {
    /// Tic of the first token's first byte.
    pub fn tic(&self) -> Tic {
        self.tokens.first().map_or(0, Token::tic)
    }

    /// The transaction's token marker, skipping a low-speed preamble.
    pub fn lead_token(&self) -> Option<&Token> {
        self.tokens.iter().find(|token| token.kind != TokenKind::PreErr)
    }
}

/// An endpoint-zero control transfer: the transactions of one
/// SETUP/data/status exchange, in bus order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transfer {
    pub transactions: Vec<Transaction>,
}

impl Transfer {
    pub fn tic(&self) -> Tic {
        self.transactions.first().map_or(0, Transaction::tic)
    }
}

/// Everything the pipeline reports to its observer.
///
/// Duration-carrying variants measure in tics; see [`time`] for
/// rendering helpers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    /// A short human-readable label: device events, VBus changes,
    /// unknown events, bad PIDs.
    Raw(String),

    /// A bus reset, reported at the tic the SE0 condition began.
    Reset { duration: Tic },

    /// A full-speed device holding SE0 long enough to begin the
    /// high-speed chirp handshake.
    FsToChirp { duration: Tic },

    /// A low-speed end-of-packet marker.
    LsEop { duration: Tic },

    /// A full-speed end-of-packet marker.
    FsEop { duration: Tic },

    /// A completed transaction on a non-control pipe (or one flushed
    /// from a control pipe during error recovery).
    Transaction(Transaction),

    /// A completed endpoint-zero control transfer.
    Transfer(Transfer),

    /// Tokens that could not extend to any valid transaction.
    Incomplete(Vec<Token>),

    /// A transaction-layer parser diagnostic.
    TransactionError(String),

    /// A transfer-layer parser diagnostic.
    TransferError(String),
}

/// The observer contract shared by every pipeline layer.
///
/// Implementations must not assume tics across different message kinds
/// are monotonic: a transaction is reported at its first token's tic,
/// once its last token completed it.
pub trait MessageSink {
    fn message(&mut self, tic: Tic, message: Message);
}

/// Collects messages verbatim; the sink used throughout the test suite.
impl MessageSink for Vec<(Tic, Message)> {
    fn message(&mut self, tic: Tic, message: Message) {
        self.push((tic, message));
    }
}
