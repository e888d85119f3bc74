//! Groups validated tokens into USB 2.0 transactions.
//!
//! The grammar is small (one token marker, an optional data packet, an
//! optional handshake, plus low-speed preamble and split forms) and no
//! production needs more than one token of lookahead, so the parser is
//! an explicit shift-reduce state machine rather than a generated LR
//! table:
//!
//! ```text
//! transaction := SETUP DATA0 ACK
//!             |  SSPLIT token (data)? (handshake)?
//!             |  CSPLIT (token)? (PRE_ERR | data | handshake)?
//!             |  PRE_ERR SETUP PRE_ERR DATA0 ACK
//!             |  IN (data ACK? | NAK | STALL)
//!             |  PRE_ERR IN (low_speed_data PRE_ERR ACK | NAK | STALL)
//!             |  OUT data handshake?
//!             |  PRE_ERR OUT PRE_ERR low_speed_data low_speed_handshake
//!             |  PING (ACK | NAK | STALL)
//!             |  SOF
//! ```
//!
//! Extension is greedy: a reducible prefix (say `IN DATA0`) is kept
//! open until a token arrives that cannot extend it, at which point the
//! transaction is emitted and the token retried from the start state. A
//! stuck prefix that is not reducible is reported as incomplete and the
//! current token retried the same way.

use std::mem;

use crate::token::{Token, TokenKind};
use crate::Transaction;

/// One parser result.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// An accepted production.
    Transaction(Transaction),

    /// A prefix no production can extend. Surfaced to the observer.
    Incomplete(Vec<Token>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Setup,
    SetupData,
    In,
    InData,
    Out,
    OutData,
    Ping,
    Pre,
    PreSetup,
    PreSetupPre,
    PreSetupData,
    PreIn,
    PreInData,
    PreInDataPre,
    PreOut,
    PreOutPre,
    PreOutData,
    SsplitStart,
    SsplitToken,
    SsplitData,
    CsplitStart,
    CsplitToken,
}

enum Advance {
    /// Consume the token and move on.
    Shift(State),

    /// The token ends a production; emit everything.
    Complete,

    /// The stack alone is a production; emit it and retry the token.
    Reduce,

    /// Neither the stack nor the stack plus token parse.
    Reject,
}

fn advance(state: State, kind: TokenKind) -> Advance {
    use Advance::*;
    use State::*;

    match state {
        Idle => match kind {
            TokenKind::Sof => Complete,
            TokenKind::Setup => Shift(Setup),
            TokenKind::In => Shift(In),
            TokenKind::Out => Shift(Out),
            TokenKind::Ping => Shift(Ping),
            TokenKind::PreErr => Shift(Pre),
            TokenKind::SSplit => Shift(SsplitStart),
            TokenKind::CSplit => Shift(CsplitStart),
            _ => Reject,
        },
        Setup => match kind {
            TokenKind::Data0 => Shift(SetupData),
            _ => Reject,
        },
        SetupData => match kind {
            TokenKind::Ack => Complete,
            _ => Reject,
        },
        In => match kind {
            _ if kind.is_data() => Shift(InData),
            TokenKind::Nak | TokenKind::Stall => Complete,
            _ => Reject,
        },
        InData => match kind {
            TokenKind::Ack => Complete,
            _ => Reduce,
        },
        Out => match kind {
            _ if kind.is_data() => Shift(OutData),
            _ => Reject,
        },
        OutData => match kind {
            _ if kind.is_handshake() => Complete,
            _ => Reduce,
        },
        Ping => match kind {
            TokenKind::Ack | TokenKind::Nak | TokenKind::Stall => Complete,
            _ => Reject,
        },
        Pre => match kind {
            TokenKind::Setup => Shift(PreSetup),
            TokenKind::In => Shift(PreIn),
            TokenKind::Out => Shift(PreOut),
            _ => Reject,
        },
        PreSetup => match kind {
            TokenKind::PreErr => Shift(PreSetupPre),
            _ => Reject,
        },
        PreSetupPre => match kind {
            TokenKind::Data0 => Shift(PreSetupData),
            _ => Reject,
        },
        PreSetupData => match kind {
            TokenKind::Ack => Complete,
            _ => Reject,
        },
        PreIn => match kind {
            _ if kind.is_low_speed_data() => Shift(PreInData),
            TokenKind::Nak | TokenKind::Stall => Complete,
            _ => Reject,
        },
        PreInData => match kind {
            TokenKind::PreErr => Shift(PreInDataPre),
            _ => Reject,
        },
        PreInDataPre => match kind {
            TokenKind::Ack => Complete,
            _ => Reject,
        },
        PreOut => match kind {
            TokenKind::PreErr => Shift(PreOutPre),
            _ => Reject,
        },
        PreOutPre => match kind {
            _ if kind.is_low_speed_data() => Shift(PreOutData),
            _ => Reject,
        },
        PreOutData => match kind {
            TokenKind::Ack | TokenKind::Nak | TokenKind::Stall => Complete,
            _ => Reject,
        },
        SsplitStart => match kind {
            _ if kind.is_token() => Shift(SsplitToken),
            _ => Reject,
        },
        SsplitToken => match kind {
            _ if kind.is_data() => Shift(SsplitData),
            _ if kind.is_handshake() => Complete,
            _ => Reduce,
        },
        SsplitData => match kind {
            _ if kind.is_handshake() => Complete,
            _ => Reduce,
        },
        CsplitStart => match kind {
            _ if kind.is_token() => Shift(CsplitToken),
            TokenKind::PreErr => Complete,
            _ if kind.is_data() || kind.is_handshake() => Complete,
            _ => Reduce,
        },
        CsplitToken => match kind {
            TokenKind::PreErr => Complete,
            _ if kind.is_data() || kind.is_handshake() => Complete,
            _ => Reduce,
        },
    }
}

/// Whether a stack parked in `state` is itself a full production.
fn reducible(state: State) -> bool {
    matches!(
        state,
        State::InData
            | State::OutData
            | State::SsplitToken
            | State::SsplitData
            | State::CsplitStart
            | State::CsplitToken
    )
}

/// Push-mode transaction parser. One per bus.
#[derive(Debug)]
pub struct TransactionAggregator {
    state: State,
    stack: Vec<Token>,
}

impl Default for TransactionAggregator {
    fn default() -> TransactionAggregator {
        TransactionAggregator::new()
    }
}

impl TransactionAggregator {
    pub fn new() -> TransactionAggregator {
        TransactionAggregator {
            state: State::Idle,
            stack: Vec::new(),
        }
    }

    /// Feeds one token, appending results to `out`.
    pub fn push(&mut self, token: Token, out: &mut Vec<Output>) {
        let mut pending = Some(token);
        while let Some(token) = pending.take() {
            match advance(self.state, token.kind) {
                Advance::Shift(next) => {
                    self.stack.push(token);
                    self.state = next;
                }
                Advance::Complete => {
                    self.stack.push(token);
                    out.push(Output::Transaction(Transaction {
                        tokens: self.take_stack(),
                    }));
                }
                Advance::Reduce => {
                    out.push(Output::Transaction(Transaction {
                        tokens: self.take_stack(),
                    }));
                    pending = Some(token);
                }
                Advance::Reject => {
                    if self.stack.is_empty() {
                        out.push(Output::Incomplete(vec![token]));
                    } else {
                        out.push(Output::Incomplete(self.take_stack()));
                        pending = Some(token);
                    }
                }
            }
        }
    }

    /// Flushes a pending prefix: a reducible one as a transaction,
    /// anything else as incomplete.
    pub fn stop(&mut self, out: &mut Vec<Output>) {
        if self.stack.is_empty() {
            return;
        }
        let complete = reducible(self.state);
        let tokens = self.take_stack();
        out.push(if complete {
            Output::Transaction(Transaction { tokens })
        } else {
            Output::Incomplete(tokens)
        });
    }

    fn take_stack(&mut self) -> Vec<Token> {
        self.state = State::Idle;
        mem::take(&mut self.stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Packet, Tic};

    fn token(tic: Tic, kind: TokenKind) -> Token {
        let mut packet = Packet::new();
        // Canonical PID byte; field bytes do not matter to the grammar.
        let nibble = match kind {
            TokenKind::Out => 0x1,
            TokenKind::Ack => 0x2,
            TokenKind::Data0 => 0x3,
            TokenKind::Ping => 0x4,
            TokenKind::Sof => 0x5,
            TokenKind::Nyet => 0x6,
            TokenKind::Data2 => 0x7,
            TokenKind::In => 0x9,
            TokenKind::Nak => 0xa,
            TokenKind::Data1 => 0xb,
            TokenKind::PreErr => 0xc,
            TokenKind::Setup => 0xd,
            TokenKind::Stall => 0xe,
            TokenKind::Mdata => 0xf,
            TokenKind::SSplit | TokenKind::CSplit => 0x8,
        };
        packet.push(tic, nibble | ((nibble ^ 0xf) << 4));
        Token { kind, packet }
    }

    fn kinds(output: &Output) -> Vec<TokenKind> {
        match output {
            Output::Transaction(transaction) => {
                transaction.tokens.iter().map(|t| t.kind).collect()
            }
            Output::Incomplete(tokens) => tokens.iter().map(|t| t.kind).collect(),
        }
    }

    fn run(sequence: &[TokenKind]) -> (TransactionAggregator, Vec<Output>) {
        let mut aggregator = TransactionAggregator::new();
        let mut out = Vec::new();
        for (offset, &kind) in sequence.iter().enumerate() {
            aggregator.push(token(offset as Tic, kind), &mut out);
        }
        (aggregator, out)
    }

    #[test]
    fn setup_transaction() {
        use TokenKind::*;
        let (_, out) = run(&[Setup, Data0, Ack]);
        assert_eq!(out.len(), 1);
        assert_eq!(kinds(&out[0]), vec![Setup, Data0, Ack]);
        match &out[0] {
            Output::Transaction(transaction) => assert_eq!(transaction.tic(), 0),
            other => panic!("expected a transaction, got {:?}", other),
        }
    }

    #[test]
    fn in_nak() {
        use TokenKind::*;
        let (_, out) = run(&[In, Nak]);
        assert_eq!(out.len(), 1);
        assert_eq!(kinds(&out[0]), vec![In, Nak]);
    }

    #[test]
    fn sof_is_a_whole_transaction() {
        use TokenKind::*;
        let (_, out) = run(&[Sof, Sof]);
        assert_eq!(out.len(), 2);
        assert_eq!(kinds(&out[0]), vec![Sof]);
    }

    #[test]
    fn unacked_in_reduces_on_lookahead() {
        use TokenKind::*;
        let (_, out) = run(&[In, Data0, In, Data1, Ack]);
        assert_eq!(out.len(), 2);
        assert_eq!(kinds(&out[0]), vec![In, Data0]);
        assert_eq!(kinds(&out[1]), vec![In, Data1, Ack]);
    }

    #[test]
    fn out_without_handshake_reduces() {
        use TokenKind::*;
        let (_, out) = run(&[Out, Mdata, Sof]);
        assert_eq!(out.len(), 2);
        assert_eq!(kinds(&out[0]), vec![Out, Mdata]);
        assert_eq!(kinds(&out[1]), vec![Sof]);
    }

    #[test]
    fn ping_forms() {
        use TokenKind::*;
        let (_, out) = run(&[Ping, Ack, Ping, Nak, Ping, Stall]);
        assert_eq!(out.len(), 3);
        assert_eq!(kinds(&out[0]), vec![Ping, Ack]);
        assert_eq!(kinds(&out[1]), vec![Ping, Nak]);
        assert_eq!(kinds(&out[2]), vec![Ping, Stall]);
    }

    #[test]
    fn low_speed_control() {
        use TokenKind::*;
        let (_, out) = run(&[PreErr, Setup, PreErr, Data0, Ack]);
        assert_eq!(out.len(), 1);
        assert_eq!(kinds(&out[0]), vec![PreErr, Setup, PreErr, Data0, Ack]);
    }

    #[test]
    fn low_speed_in_forms() {
        use TokenKind::*;
        let (_, out) = run(&[PreErr, In, Data1, PreErr, Ack, PreErr, In, Nak]);
        assert_eq!(out.len(), 2);
        assert_eq!(kinds(&out[0]), vec![PreErr, In, Data1, PreErr, Ack]);
        assert_eq!(kinds(&out[1]), vec![PreErr, In, Nak]);
    }

    #[test]
    fn low_speed_out() {
        use TokenKind::*;
        let (_, out) = run(&[PreErr, Out, PreErr, Data0, Ack]);
        assert_eq!(out.len(), 1);
        assert_eq!(kinds(&out[0]), vec![PreErr, Out, PreErr, Data0, Ack]);
    }

    #[test]
    fn split_forms() {
        use TokenKind::*;
        let (_, out) = run(&[
            SSplit, Setup, Data0, Ack, // full start-split
            CSplit, Setup, Nyet, // complete-split with handshake
            SSplit, In, Sof, // bare SSPLIT token, reduced by SOF
        ]);
        assert_eq!(out.len(), 4);
        assert_eq!(kinds(&out[0]), vec![SSplit, Setup, Data0, Ack]);
        assert_eq!(kinds(&out[1]), vec![CSplit, Setup, Nyet]);
        assert_eq!(kinds(&out[2]), vec![SSplit, In]);
        assert_eq!(kinds(&out[3]), vec![Sof]);
    }

    #[test]
    fn csplit_pre_err() {
        use TokenKind::*;
        let (_, out) = run(&[CSplit, PreErr, CSplit, In, Data0]);
        assert_eq!(out.len(), 2);
        assert_eq!(kinds(&out[0]), vec![CSplit, PreErr]);
        assert_eq!(kinds(&out[1]), vec![CSplit, In, Data0]);
    }

    #[test]
    fn stray_handshake_is_incomplete() {
        use TokenKind::*;
        let (_, out) = run(&[Ack, Setup, Data0, Ack]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Output::Incomplete(vec![token(0, Ack)]));
        assert_eq!(kinds(&out[1]), vec![Setup, Data0, Ack]);
    }

    #[test]
    fn stuck_prefix_recovers() {
        use TokenKind::*;
        // SETUP DATA1 parses nowhere: the prefix is dropped as
        // incomplete and DATA1 retried (and itself rejected).
        let (_, out) = run(&[Setup, Data1, In, Nak]);
        assert_eq!(out.len(), 3);
        assert_eq!(kinds(&out[0]), vec![Setup]);
        assert_eq!(kinds(&out[1]), vec![Data1]);
        assert_eq!(kinds(&out[2]), vec![In, Nak]);
    }

    #[test]
    fn stop_flushes_reducible_prefix_as_transaction() {
        use TokenKind::*;
        let (mut aggregator, mut out) = run(&[In, Data0]);
        assert!(out.is_empty());
        aggregator.stop(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], {
            let tokens = vec![token(0, In), token(1, Data0)];
            Output::Transaction(Transaction { tokens })
        });
    }

    #[test]
    fn stop_flushes_stuck_prefix_as_incomplete() {
        use TokenKind::*;
        let (mut aggregator, mut out) = run(&[Setup, Data0]);
        assert!(out.is_empty());
        aggregator.stop(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(kinds(&out[0]), vec![Setup, Data0]);
        assert!(matches!(out[0], Output::Incomplete(_)));
    }
}
