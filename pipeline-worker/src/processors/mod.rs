//! The seven stage kinds.
//!
//! Parameter types are public so pipelines can be defined. The compiled
//! processors are private to the engine and are dispatched by `Stage`.
use pipeline_common::message::Envelope;

use crate::error::ProcessingError;
use crate::graph::Next;

pub mod batch;
pub mod broker;
pub mod dedupe;
pub mod mapping;
pub mod rate_limit;
pub mod switch;
mod try_catch;

pub(crate) use batch::Batcher;
pub(crate) use broker::Broker;
pub(crate) use dedupe::Dedupe;
pub(crate) use mapping::Mapping;
pub(crate) use rate_limit::RateLimit;
pub(crate) use switch::Switch;
pub(crate) use try_catch::TryCatch;

pub(crate) enum Processor {
    Mapping(Mapping),
    Switch(Switch),
    Dedupe(Dedupe),
    Batch(Batcher),
    RateLimit(RateLimit),
    TryCatch(TryCatch),
    Broker(Broker),
}

/// What a processor did with an envelope.
pub(crate) enum Flow<'a> {
    /// Hand the result to the stage's successor.
    Continue(Envelope),
    /// Hand the result to a nested route instead (a switch case, a try body).
    Enter(&'a Next, Envelope),
    /// Send the envelope to the stage's error path.
    Divert(Envelope, ProcessingError),
    /// Nothing left to forward: held, filtered, or already settled.
    Done,
}
