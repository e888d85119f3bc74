//! Composes endpoint-zero transactions into control transfers.
//!
//! Each incoming transaction is first rewritten into a synthetic token
//! pairing its initiating token kind with its concluding one (`IN_ACK`,
//! `OUT_NAK`, ...). SETUP transactions split on the direction bit of
//! bmRequestType, the first byte of their DATA0 payload. The rewritten
//! stream is then parsed by a second push parser:
//!
//! ```text
//! transfer := SETUP_OUT out_data in_data
//!          |  SETUP_OUT in_data
//!          |  SETUP_IN  in_data out_handshake
//! out_handshake := OUT_ACK
//!               |  (OUT_NAK | PING_ACK | PING_NAK) out_handshake
//! in_data  := IN_ACK | IN_STALL | (IN_ACK | IN_NAK) in_data
//! out_data := OUT_ACK | OUT_STALL | OUT_ACK out_data
//!          |  OUT_NAK out_data
//!          |  PING_ACK (OUT_ACK | OUT_NYET)
//!          |  PING_NAK out_data
//! ```
//!
//! Parse failures never stall the pipe: the diagnostic is surfaced, the
//! buffered transactions are flushed individually and the current
//! transaction retried against a fresh parse.

use std::mem;

use crate::token::TokenKind;
use crate::{Message, MessageSink, Transaction, Transfer};

/// The rewritten vocabulary the transfer grammar is defined over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlToken {
    SetupOut,
    SetupIn,
    InAck,
    InNak,
    InStall,
    OutAck,
    OutNak,
    OutNyet,
    OutStall,
    PingAck,
    PingNak,
}

impl ControlToken {
    fn name(self) -> &'static str {
        match self {
            ControlToken::SetupOut => "SETUP_OUT",
            ControlToken::SetupIn => "SETUP_IN",
            ControlToken::InAck => "IN_ACK",
            ControlToken::InNak => "IN_NAK",
            ControlToken::InStall => "IN_STALL",
            ControlToken::OutAck => "OUT_ACK",
            ControlToken::OutNak => "OUT_NAK",
            ControlToken::OutNyet => "OUT_NYET",
            ControlToken::OutStall => "OUT_STALL",
            ControlToken::PingAck => "PING_ACK",
            ControlToken::PingNak => "PING_NAK",
        }
    }
}

/// Pairs the transaction's initiating and concluding token kinds.
fn rewrite(transaction: &Transaction) -> Result<ControlToken, String> {
    let lead = match transaction.lead_token() {
        Some(token) => token,
        None => return Err("empty transaction on a control pipe".to_string()),
    };
    let concluding = match transaction.tokens.last() {
        Some(token) => token.kind,
        None => return Err("empty transaction on a control pipe".to_string()),
    };
    match lead.kind {
        TokenKind::Setup => {
            let data = transaction
                .tokens
                .iter()
                .find(|token| token.kind == TokenKind::Data0)
                .ok_or_else(|| "SETUP transaction without a DATA0 stage".to_string())?;
            match data.packet.octets().get(1) {
                Some(request_type) if request_type & 0x80 != 0 => Ok(ControlToken::SetupIn),
                Some(_) => Ok(ControlToken::SetupOut),
                None => Err("SETUP transaction with an empty DATA0 stage".to_string()),
            }
        }
        TokenKind::In => match concluding {
            TokenKind::Ack => Ok(ControlToken::InAck),
            TokenKind::Nak => Ok(ControlToken::InNak),
            TokenKind::Stall => Ok(ControlToken::InStall),
            other => Err(format!("IN transaction concluded by {}", other)),
        },
        TokenKind::Out => match concluding {
            TokenKind::Ack => Ok(ControlToken::OutAck),
            TokenKind::Nak => Ok(ControlToken::OutNak),
            TokenKind::Nyet => Ok(ControlToken::OutNyet),
            TokenKind::Stall => Ok(ControlToken::OutStall),
            other => Err(format!("OUT transaction concluded by {}", other)),
        },
        TokenKind::Ping => match concluding {
            TokenKind::Ack => Ok(ControlToken::PingAck),
            TokenKind::Nak => Ok(ControlToken::PingNak),
            other => Err(format!("PING transaction concluded by {}", other)),
        },
        other => Err(format!("{} transaction on a control pipe", other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// SETUP_OUT alone.
    WriteSetup,
    /// out_data in progress; `complete` when it may stop here.
    WriteData { complete: bool },
    /// out_data just saw PING_ACK: only OUT_ACK or OUT_NYET follow.
    WritePing,
    /// out_data closed (OUT_STALL, or PING_ACK then OUT_ACK/OUT_NYET).
    WriteDataDone,
    /// Status in_data of a write; `complete` once it may stop here.
    WriteStatus { complete: bool },
    /// SETUP_IN alone.
    ReadSetup,
    /// Data-stage in_data of a read; `complete` when it may stop here.
    ReadData { complete: bool },
    /// Data stage ended in IN_STALL; the status stage must follow.
    ReadDataDone,
    /// out_handshake in progress; only OUT_ACK ends it.
    ReadStatus,
}

enum Advance {
    Shift(State),
    Complete,
    Reduce,
    Reject,
}

fn advance(state: State, token: ControlToken) -> Advance {
    use Advance::*;
    use ControlToken::*;
    use State::*;

    match state {
        Idle => match token {
            SetupOut => Shift(WriteSetup),
            SetupIn => Shift(ReadSetup),
            _ => Reject,
        },
        WriteSetup | WriteData { .. } => {
            let complete = match state {
                WriteData { complete } => complete,
                _ => false,
            };
            match token {
                OutAck => Shift(WriteData { complete: true }),
                OutNak | PingNak => Shift(WriteData { complete: false }),
                PingAck => Shift(WritePing),
                OutStall => Shift(WriteDataDone),
                InAck if state == WriteSetup || complete => {
                    Shift(WriteStatus { complete: true })
                }
                InNak if state == WriteSetup || complete => {
                    Shift(WriteStatus { complete: false })
                }
                InStall if state == WriteSetup || complete => Complete,
                _ => Reject,
            }
        }
        WritePing => match token {
            OutAck | OutNyet => Shift(WriteDataDone),
            _ => Reject,
        },
        WriteDataDone => match token {
            InAck => Shift(WriteStatus { complete: true }),
            InNak => Shift(WriteStatus { complete: false }),
            InStall => Complete,
            _ => Reject,
        },
        WriteStatus { complete } => match token {
            InAck => Shift(WriteStatus { complete: true }),
            InNak => Shift(WriteStatus { complete: false }),
            InStall => Complete,
            _ if complete => Reduce,
            _ => Reject,
        },
        ReadSetup => match token {
            InAck => Shift(ReadData { complete: true }),
            InNak => Shift(ReadData { complete: false }),
            InStall => Shift(ReadDataDone),
            _ => Reject,
        },
        ReadData { complete } => match token {
            InAck => Shift(ReadData { complete: true }),
            InNak => Shift(ReadData { complete: false }),
            InStall => Shift(ReadDataDone),
            OutAck if complete => Complete,
            OutNak | PingAck | PingNak if complete => Shift(ReadStatus),
            _ => Reject,
        },
        ReadDataDone | ReadStatus => match token {
            OutAck => Complete,
            OutNak | PingAck | PingNak => Shift(ReadStatus),
            _ => Reject,
        },
    }
}

/// Push-mode control transfer parser. One per `(address, 0)` pipe.
#[derive(Debug)]
pub struct TransferAggregator {
    state: State,
    buffer: Vec<Transaction>,
}

impl Default for TransferAggregator {
    fn default() -> TransferAggregator {
        TransferAggregator::new()
    }
}

impl TransferAggregator {
    pub fn new() -> TransferAggregator {
        TransferAggregator {
            state: State::Idle,
            buffer: Vec::new(),
        }
    }

    /// Feeds one transaction, reporting completed transfers and
    /// recovery fallout to `sink`.
    pub fn push<S: MessageSink>(&mut self, transaction: Transaction, sink: &mut S) {
        let token = match rewrite(&transaction) {
            Ok(token) => token,
            Err(reason) => {
                sink.message(transaction.tic(), Message::Raw(reason));
                sink.message(transaction.tic(), Message::Transaction(transaction));
                return;
            }
        };
        let mut pending = Some(transaction);
        while let Some(transaction) = pending.take() {
            match advance(self.state, token) {
                Advance::Shift(next) => {
                    self.buffer.push(transaction);
                    self.state = next;
                }
                Advance::Complete => {
                    self.buffer.push(transaction);
                    self.emit(sink);
                }
                Advance::Reduce => {
                    self.emit(sink);
                    pending = Some(transaction);
                }
                Advance::Reject => {
                    if self.buffer.is_empty() {
                        sink.message(
                            transaction.tic(),
                            Message::TransferError(format!(
                                "{} cannot start a control transfer",
                                token.name(),
                            )),
                        );
                        sink.message(transaction.tic(), Message::Transaction(transaction));
                    } else {
                        sink.message(
                            transaction.tic(),
                            Message::TransferError(format!(
                                "{} cannot continue a control transfer",
                                token.name(),
                            )),
                        );
                        self.flush(sink);
                        pending = Some(transaction);
                    }
                }
            }
        }
    }

    /// Flushes pending state: a stoppable transfer is emitted whole,
    /// anything else is reported and its transactions surfaced
    /// individually.
    pub fn stop<S: MessageSink>(&mut self, sink: &mut S) {
        if self.buffer.is_empty() {
            self.state = State::Idle;
            return;
        }
        if self.state == (State::WriteStatus { complete: true }) {
            self.emit(sink);
        } else {
            let tic = self.buffer.first().map_or(0, Transaction::tic);
            sink.message(
                tic,
                Message::TransferError("control transfer cut short".to_string()),
            );
            self.flush(sink);
        }
    }

    fn emit<S: MessageSink>(&mut self, sink: &mut S) {
        self.state = State::Idle;
        let transactions = mem::take(&mut self.buffer);
        let tic = transactions.first().map_or(0, Transaction::tic);
        sink.message(tic, Message::Transfer(Transfer { transactions }));
    }

    fn flush<S: MessageSink>(&mut self, sink: &mut S) {
        self.state = State::Idle;
        for transaction in mem::take(&mut self.buffer) {
            sink.message(transaction.tic(), Message::Transaction(transaction));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Token, TokenKind};
    use crate::{crc, Packet, Tic};

    fn pid_byte(nibble: u8) -> u8 {
        nibble | ((nibble ^ 0xf) << 4)
    }

    fn packet(tic: Tic, bytes: &[u8]) -> Packet {
        let mut packet = Packet::new();
        for (offset, &byte) in bytes.iter().enumerate() {
            packet.push(tic + offset as Tic, byte);
        }
        packet
    }

    fn plain_token(tic: Tic, kind: TokenKind, nibble: u8) -> Token {
        Token {
            kind,
            packet: packet(tic, &[pid_byte(nibble)]),
        }
    }

    fn setup_transaction(tic: Tic, request_type: u8) -> Transaction {
        let crc = crc::token_crc5(1, 0);
        let setup = Token {
            kind: TokenKind::Setup,
            packet: packet(tic, &[pid_byte(0xd), 0x01, crc << 3]),
        };
        let payload = [request_type, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let data_crc = crc::data_crc16(&payload);
        let mut data_bytes = vec![pid_byte(0x3)];
        data_bytes.extend_from_slice(&payload);
        data_bytes.push((data_crc & 0xff) as u8);
        data_bytes.push((data_crc >> 8) as u8);
        let data = Token {
            kind: TokenKind::Data0,
            packet: packet(tic + 10, &data_bytes),
        };
        let ack = plain_token(tic + 30, TokenKind::Ack, 0x2);
        Transaction {
            tokens: vec![setup, data, ack],
        }
    }

    fn simple_transaction(tic: Tic, lead: TokenKind, concluding: TokenKind) -> Transaction {
        let lead_nibble = match lead {
            TokenKind::Out => 0x1,
            TokenKind::In => 0x9,
            TokenKind::Ping => 0x4,
            _ => panic!("unexpected lead"),
        };
        let concluding_nibble = match concluding {
            TokenKind::Ack => 0x2,
            TokenKind::Nak => 0xa,
            TokenKind::Stall => 0xe,
            TokenKind::Nyet => 0x6,
            _ => panic!("unexpected conclusion"),
        };
        Transaction {
            tokens: vec![
                plain_token(tic, lead, lead_nibble),
                plain_token(tic + 5, concluding, concluding_nibble),
            ],
        }
    }

    fn transfers(messages: &[(Tic, Message)]) -> Vec<usize> {
        messages
            .iter()
            .filter_map(|(_, message)| match message {
                Message::Transfer(transfer) => Some(transfer.transactions.len()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn control_read() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x80), &mut sink);
        aggregator.push(simple_transaction(100, In, Ack), &mut sink);
        aggregator.push(simple_transaction(200, In, Ack), &mut sink);
        aggregator.push(simple_transaction(300, Out, Ack), &mut sink);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].0, 0);
        assert_eq!(transfers(&sink), vec![4]);
    }

    #[test]
    fn control_read_with_nak_retries() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x80), &mut sink);
        aggregator.push(simple_transaction(100, In, Nak), &mut sink);
        aggregator.push(simple_transaction(200, In, Ack), &mut sink);
        aggregator.push(simple_transaction(300, Out, Nak), &mut sink);
        aggregator.push(simple_transaction(400, Out, Ack), &mut sink);
        assert_eq!(transfers(&sink), vec![5]);
    }

    #[test]
    fn control_write_completes_on_next_setup() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x00), &mut sink);
        aggregator.push(simple_transaction(100, Out, Ack), &mut sink);
        aggregator.push(simple_transaction(200, In, Ack), &mut sink);
        assert!(sink.is_empty());
        // The status stage could keep collecting INs; the next SETUP
        // reduces it.
        aggregator.push(setup_transaction(300, 0x80), &mut sink);
        assert_eq!(transfers(&sink), vec![3]);
    }

    #[test]
    fn write_with_ping_flow_control() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x00), &mut sink);
        aggregator.push(simple_transaction(100, Ping, Ack), &mut sink);
        aggregator.push(simple_transaction(200, Out, Nyet), &mut sink);
        aggregator.push(simple_transaction(300, In, Stall), &mut sink);
        assert_eq!(transfers(&sink), vec![4]);
    }

    #[test]
    fn stalled_status_completes() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x00), &mut sink);
        aggregator.push(simple_transaction(100, In, Stall), &mut sink);
        assert_eq!(transfers(&sink), vec![2]);
    }

    #[test]
    fn unmapped_transaction_is_surfaced() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        // An IN transaction with no handshake has no synthetic token.
        let transaction = Transaction {
            tokens: vec![
                plain_token(0, In, 0x9),
                Token {
                    kind: Data0,
                    packet: packet(5, &[pid_byte(0x3), 0x00, 0x00]),
                },
            ],
        };
        aggregator.push(transaction.clone(), &mut sink);
        assert_eq!(sink.len(), 2);
        assert_eq!(
            sink[0].1,
            Message::Raw("IN transaction concluded by DATA0".to_string()),
        );
        assert_eq!(sink[1].1, Message::Transaction(transaction));
    }

    #[test]
    fn orphan_status_recovers() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(simple_transaction(0, In, Ack), &mut sink);
        assert_eq!(sink.len(), 2);
        assert!(matches!(sink[0].1, Message::TransferError(_)));
        assert!(matches!(sink[1].1, Message::Transaction(_)));
    }

    #[test]
    fn failed_transfer_flushes_buffer() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x80), &mut sink);
        // OUT_STALL cannot appear in a read's data stage.
        aggregator.push(simple_transaction(100, Out, Stall), &mut sink);
        assert_eq!(sink.len(), 4);
        assert!(matches!(sink[0].1, Message::TransferError(_)));
        assert!(matches!(sink[1].1, Message::Transaction(_)));
        assert!(matches!(sink[2].1, Message::TransferError(_)));
        assert!(matches!(sink[3].1, Message::Transaction(_)));
    }

    #[test]
    fn stop_emits_waiting_write() {
        use TokenKind::*;
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x00), &mut sink);
        aggregator.push(simple_transaction(100, Out, Ack), &mut sink);
        aggregator.push(simple_transaction(200, In, Ack), &mut sink);
        aggregator.stop(&mut sink);
        assert_eq!(transfers(&sink), vec![3]);
    }

    #[test]
    fn stop_reports_cut_transfer() {
        let mut aggregator = TransferAggregator::new();
        let mut sink: Vec<(Tic, Message)> = Vec::new();
        aggregator.push(setup_transaction(0, 0x80), &mut sink);
        aggregator.stop(&mut sink);
        assert_eq!(sink.len(), 2);
        assert!(matches!(sink[0].1, Message::TransferError(_)));
        assert!(matches!(sink[1].1, Message::Transaction(_)));
    }
}
