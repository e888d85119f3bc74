//! Demultiplexes the analyzer's on-disk stream into timestamped
//! records.
//!
//! The capture is a concatenation of 1 to 5 logical-byte records,
//! stored as little-endian 16-bit words whose high byte is logical byte
//! 0 (the on-disk bytes are swapped within each pair). Logical byte 0
//! carries the record kind, the number of extra timestamp bytes and the
//! low 4 bits of the tic increment; extra timestamp bytes OR in at bit
//! offsets 4, 12 and 20; kinds other than time-delta then carry one
//! payload byte. Records are padded to word boundaries, and the
//! 5-logical-byte form keeps its payload in the high byte of a
//! dedicated word whose low byte must be zero.

use bitmatch::bitmatch;

use crate::{Record, RecordKind, Tic};

/// The stream cannot be decoded further. There is no resynchronization
/// point in the wire format, so these are fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MalformedStream {
    /// The capture holds an odd number of bytes.
    #[error("capture stream ends in the middle of a 16-bit word")]
    TrailingByte,

    /// A 5-byte record's payload word carries data in its pad byte.
    #[error("payload word {word:#06x} carries a non-zero pad byte")]
    DirtyPadding { word: u16 },
}

/// Incremental record demultiplexer.
///
/// Chunks of any size may be [fed](Framer::feed) in; up to one
/// incomplete record (at most two words and a dangling byte) is carried
/// over to the next call, so splitting the input at any boundary yields
/// identical emissions.
#[derive(Debug, Default)]
pub struct Framer {
    residue: Vec<u8>,
    tic: Tic,
}

impl Framer {
    pub fn new() -> Framer {
        Framer::default()
    }

    /// The running tic counter, including time-delta records that
    /// emitted nothing.
    pub fn tic(&self) -> Tic {
        self.tic
    }

    /// Decodes `chunk` (plus any carried residue) into records.
    ///
    /// The returned iterator borrows the framer; it stores the
    /// unconsumed tail back into the framer when it ends or is dropped.
    pub fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> Records<'a> {
        Records {
            framer: self,
            chunk,
            pos: 0,
            fused: false,
        }
    }

    /// Declares end of input: fails if a dangling byte remains.
    pub fn finish(&self) -> Result<(), MalformedStream> {
        if self.residue.len() % 2 != 0 {
            Err(MalformedStream::TrailingByte)
        } else {
            Ok(())
        }
    }
}

enum Step {
    Emit(Record),
    Advance,
    Starved,
    Failed(MalformedStream),
}

/// Iterator over the records of one fed chunk. See [`Framer::feed`].
pub struct Records<'a> {
    framer: &'a mut Framer,
    chunk: &'a [u8],
    pos: usize,
    fused: bool,
}

impl Records<'_> {
    fn byte(&self, index: usize) -> Option<u8> {
        let residue = &self.framer.residue;
        if index < residue.len() {
            Some(residue[index])
        } else {
            self.chunk.get(index - residue.len()).copied()
        }
    }

    fn word(&self, index: usize) -> Option<u16> {
        Some(u16::from(self.byte(index)?) | u16::from(self.byte(index + 1)?) << 8)
    }

    fn stash(&mut self) {
        if self.fused {
            return;
        }
        self.fused = true;
        let residue_len = self.framer.residue.len();
        if self.pos >= residue_len {
            self.framer.residue = self.chunk[self.pos - residue_len..].to_vec();
        } else {
            self.framer.residue.drain(..self.pos);
            self.framer.residue.extend_from_slice(self.chunk);
        }
    }

    #[bitmatch]
    fn decode(&mut self) -> Step {
        let base = self.pos;
        let word0 = match self.word(base) {
            Some(word) => word,
            None => return Step::Starved,
        };
        #[bitmatch]
        let "kkee_tttt" = (word0 >> 8) as u8;
        let kind = match k {
            0b01 => Some(RecordKind::Event),
            0b10 => Some(RecordKind::Data),
            0b11 => Some(RecordKind::RxCmd),
            _ => None, // time delta
        };
        let mut increment = Tic::from(t);
        let (payload, consumed) = match (e, kind) {
            (0, None) => (None, 2),
            (0, Some(_)) => (Some((word0 & 0xff) as u8), 2),
            (1, None) => {
                increment |= Tic::from(word0 & 0xff) << 4;
                (None, 2)
            }
            (1, Some(_)) => {
                increment |= Tic::from(word0 & 0xff) << 4;
                let word1 = match self.word(base + 2) {
                    Some(word) => word,
                    None => return Step::Starved,
                };
                (Some((word1 >> 8) as u8), 4)
            }
            (_, _) => {
                increment |= Tic::from(word0 & 0xff) << 4;
                let word1 = match self.word(base + 2) {
                    Some(word) => word,
                    None => return Step::Starved,
                };
                increment |= Tic::from(word1 >> 8) << 12;
                if e == 2 {
                    match kind {
                        None => (None, 4),
                        Some(_) => (Some((word1 & 0xff) as u8), 4),
                    }
                } else {
                    increment |= Tic::from(word1 & 0xff) << 20;
                    match kind {
                        None => (None, 4),
                        Some(_) => {
                            let word2 = match self.word(base + 4) {
                                Some(word) => word,
                                None => return Step::Starved,
                            };
                            if word2 & 0xff != 0 {
                                return Step::Failed(MalformedStream::DirtyPadding {
                                    word: word2,
                                });
                            }
                            (Some((word2 >> 8) as u8), 6)
                        }
                    }
                }
            }
        };
        self.pos = base + consumed;
        self.framer.tic += increment;
        match (kind, payload) {
            (Some(kind), Some(payload)) => Step::Emit(Record {
                tic: self.framer.tic,
                kind,
                payload,
            }),
            _ => Step::Advance,
        }
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Record, MalformedStream>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.fused {
                return None;
            }
            match self.decode() {
                Step::Emit(record) => return Some(Ok(record)),
                Step::Advance => continue,
                Step::Starved => {
                    self.stash();
                    return None;
                }
                Step::Failed(error) => {
                    // Nothing past this point can be trusted.
                    self.fused = true;
                    self.framer.residue.clear();
                    return Some(Err(error));
                }
            }
        }
    }
}

impl Drop for Records<'_> {
    fn drop(&mut self) {
        self.stash();
    }
}
