//! Dispatches transactions to per-pipe aggregators.
//!
//! A pipe is identified by the `(device address, endpoint)` pair of the
//! transaction's token marker (the hub address alone for splits).
//! Children are created on first use and live until `stop`: endpoint
//! zero gets a control-transfer aggregator, every other pipe and hub a
//! passthrough that reports transactions as-is. Addressless
//! transactions (SOF, undecodable tokens) go straight to the observer.

use std::collections::BTreeMap;

use crate::transfer::TransferAggregator;
use crate::{Message, MessageSink, Transaction};

#[derive(Debug)]
enum PipeAggregator {
    Control(TransferAggregator),
    Stream,
}

impl PipeAggregator {
    fn push<S: MessageSink>(&mut self, transaction: Transaction, sink: &mut S) {
        match self {
            PipeAggregator::Control(aggregator) => aggregator.push(transaction, sink),
            PipeAggregator::Stream => {
                sink.message(transaction.tic(), Message::Transaction(transaction))
            }
        }
    }

    fn stop<S: MessageSink>(&mut self, sink: &mut S) {
        if let PipeAggregator::Control(aggregator) = self {
            aggregator.stop(sink);
        }
    }
}

/// Keyed dispatch of transactions to lazily-created aggregators.
#[derive(Debug, Default)]
pub struct PipeRouter {
    pipes: BTreeMap<(u8, u8), PipeAggregator>,
    hubs: BTreeMap<u8, PipeAggregator>,
}

impl PipeRouter {
    pub fn new() -> PipeRouter {
        PipeRouter::default()
    }

    /// Number of distinct `(address, endpoint)` pipes seen so far.
    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }

    pub fn route<S: MessageSink>(&mut self, transaction: Transaction, sink: &mut S) {
        let (address, endpoint) = match transaction.lead_token() {
            Some(token) => (token.address(), token.endpoint()),
            None => (None, None),
        };
        match (address, endpoint) {
            (None, _) => {
                sink.message(transaction.tic(), Message::Transaction(transaction))
            }
            (Some(address), None) => {
                self.hubs
                    .entry(address)
                    .or_insert(PipeAggregator::Stream)
                    .push(transaction, sink);
            }
            (Some(address), Some(endpoint)) => {
                self.pipes
                    .entry((address, endpoint))
                    .or_insert_with(|| {
                        if endpoint == 0 {
                            PipeAggregator::Control(TransferAggregator::new())
                        } else {
                            PipeAggregator::Stream
                        }
                    })
                    .push(transaction, sink);
            }
        }
    }

    /// Broadcasts `stop` to every created aggregator.
    pub fn stop<S: MessageSink>(&mut self, sink: &mut S) {
        for aggregator in self.pipes.values_mut() {
            aggregator.stop(sink);
        }
        for aggregator in self.hubs.values_mut() {
            aggregator.stop(sink);
        }
    }
}
