//! Wires the pipeline layers together behind a chunk-push interface.

use crate::framer::{Framer, MalformedStream};
use crate::packetiser::{self, Packetiser};
use crate::pipe::PipeRouter;
use crate::token::{self, PidError};
use crate::transaction::{self, TransactionAggregator};
use crate::{Message, MessageSink, Packet, Tic, Token};

/// Whether the capture is still producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,

    /// A terminal capture-stopped event was decoded. The driver should
    /// now call [`Decoder::stop`].
    Done,
}

/// The full decode pipeline: framer, packetiser, transaction
/// aggregator and pipe router, emitting into one observer.
///
/// Single-threaded and synchronous: every `push` drives records all the
/// way down before returning.
pub struct Decoder<S: MessageSink> {
    framer: Framer,
    packetiser: Packetiser,
    aggregator: TransactionAggregator,
    router: PipeRouter,
    sink: S,
    done: bool,
    stopped: bool,
}

impl<S: MessageSink> Decoder<S> {
    pub fn new(sink: S) -> Decoder<S> {
        Decoder {
            framer: Framer::new(),
            packetiser: Packetiser::new(),
            aggregator: TransactionAggregator::new(),
            router: PipeRouter::new(),
            sink,
            done: false,
            stopped: false,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// The running tic counter.
    pub fn tic(&self) -> Tic {
        self.framer.tic()
    }

    /// Decodes one chunk of capture bytes. Chunk boundaries are
    /// immaterial; residue is carried internally.
    ///
    /// Returns [`Status::Done`] once the capture reported its own end;
    /// later pushes are no-ops. A [`MalformedStream`] is fatal.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Status, MalformedStream> {
        if self.done {
            return Ok(Status::Done);
        }
        let mut outputs = Vec::new();
        for record in self.framer.feed(chunk) {
            let record = match record {
                Ok(record) => record,
                Err(error) => {
                    self.done = true;
                    return Err(error);
                }
            };
            let flow = self.packetiser.push(record, &mut outputs);
            Self::drain(
                &mut self.aggregator,
                &mut self.router,
                &mut self.sink,
                &mut outputs,
            );
            if flow.is_err() {
                self.done = true;
                return Ok(Status::Done);
            }
        }
        Ok(Status::Running)
    }

    /// Propagates `stop` through every layer, flushing pending output.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.done = true;
        let mut outputs = Vec::new();
        self.packetiser.stop(&mut outputs);
        Self::drain(
            &mut self.aggregator,
            &mut self.router,
            &mut self.sink,
            &mut outputs,
        );
        let mut parses = Vec::new();
        self.aggregator.stop(&mut parses);
        Self::dispatch(&mut self.router, &mut self.sink, parses);
        self.router.stop(&mut self.sink);
    }

    /// Declares end of input: checks stream completeness, then stops.
    pub fn finish(&mut self) -> Result<(), MalformedStream> {
        let result = self.framer.finish();
        self.stop();
        result
    }

    fn drain(
        aggregator: &mut TransactionAggregator,
        router: &mut PipeRouter,
        sink: &mut S,
        outputs: &mut Vec<packetiser::Output>,
    ) {
        for output in outputs.drain(..) {
            match output {
                packetiser::Output::Message(tic, message) => sink.message(tic, message),
                packetiser::Output::Packet(packet) => {
                    Self::feed_packet(aggregator, router, sink, packet)
                }
            }
        }
    }

    fn feed_packet(
        aggregator: &mut TransactionAggregator,
        router: &mut PipeRouter,
        sink: &mut S,
        packet: Packet,
    ) {
        let kind = match token::classify(&packet) {
            Ok(kind) => kind,
            Err(PidError::BadComplement) => {
                sink.message(
                    packet.tic(),
                    Message::Raw(format!("(bad pid) {}", packet.hex())),
                );
                return;
            }
            Err(PidError::ShortSplit) => {
                sink.message(
                    packet.tic(),
                    Message::TransactionError(format!(
                        "split token too short: {}",
                        packet.hex(),
                    )),
                );
                return;
            }
        };
        let mut parses = Vec::new();
        aggregator.push(Token { kind, packet }, &mut parses);
        Self::dispatch(router, sink, parses);
    }

    fn dispatch(router: &mut PipeRouter, sink: &mut S, parses: Vec<transaction::Output>) {
        for parse in parses {
            match parse {
                transaction::Output::Transaction(transaction) => {
                    router.route(transaction, sink)
                }
                transaction::Output::Incomplete(tokens) => {
                    let tic = tokens.first().map_or(0, Token::tic);
                    sink.message(tic, Message::Incomplete(tokens));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_after_done_is_a_noop() {
        let mut decoder = Decoder::new(Vec::<(Tic, Message)>::new());
        // Event record: capture stopped (user), head 0x40, payload 0xf1.
        assert_eq!(decoder.push(&[0xf1, 0x40]), Ok(Status::Done));
        assert_eq!(decoder.push(&[0xf1, 0x40]), Ok(Status::Done));
        decoder.stop();
        let sink = decoder.into_sink();
        assert_eq!(
            sink,
            vec![(0, Message::Raw("Capture stopped (user)".to_string()))],
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let mut decoder = Decoder::new(Vec::<(Tic, Message)>::new());
        decoder.push(&[0x00, 0x00]).unwrap();
        decoder.stop();
        decoder.stop();
        assert!(decoder.into_sink().is_empty());
    }

    #[test]
    fn malformed_stream_is_fatal() {
        let mut decoder = Decoder::new(Vec::<(Tic, Message)>::new());
        // A 5-byte record with a dirty pad byte.
        let result = decoder.push(&[0x00, 0xf0, 0x00, 0x00, 0x05, 0x0c]);
        assert_eq!(
            result,
            Err(MalformedStream::DirtyPadding { word: 0x0c05 }),
        );
        assert_eq!(decoder.push(&[0x00, 0x00]), Ok(Status::Done));
    }
}
