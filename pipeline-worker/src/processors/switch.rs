use std::sync::Arc;

use pipeline_common::message::{Envelope, Message};

use crate::graph::Next;
use crate::pipeline::Pipeline;
use crate::processors::mapping::MappingError;
use crate::processors::Flow;

/// Decides whether a message takes a switch case.
pub trait Predicate: Send + Sync {
    fn matches(&self, message: &Message) -> Result<bool, MappingError>;
}

impl<F> Predicate for F
where
    F: Fn(&Message) -> Result<bool, MappingError> + Send + Sync,
{
    fn matches(&self, message: &Message) -> Result<bool, MappingError> {
        self(message)
    }
}

/// A branch of a switch: messages matching `predicate` run through `pipeline`
/// and then continue after the switch.
#[derive(Clone)]
pub struct SwitchCase {
    pub(crate) predicate: Arc<dyn Predicate>,
    pub(crate) pipeline: Pipeline,
}

impl SwitchCase {
    pub fn new(predicate: impl Predicate + 'static, pipeline: Pipeline) -> Self {
        Self {
            predicate: Arc::new(predicate),
            pipeline,
        }
    }

    /// A case with an infallible predicate.
    pub fn when<F>(predicate: F, pipeline: Pipeline) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::new(
            move |message: &Message| -> Result<bool, MappingError> { Ok(predicate(message)) },
            pipeline,
        )
    }

    /// A case that matches everything. Only useful as the last case.
    pub fn otherwise(pipeline: Pipeline) -> Self {
        Self::when(|_| true, pipeline)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

pub(crate) struct Switch {
    cases: Vec<(Arc<dyn Predicate>, Next)>,
}

impl Switch {
    pub(crate) fn new(cases: Vec<(Arc<dyn Predicate>, Next)>) -> Self {
        Self { cases }
    }

    /// Route to the first matching case. A batch takes a case only when every
    /// message matches. Without a match the envelope continues unchanged.
    pub(crate) fn process(&self, envelope: Envelope) -> Flow<'_> {
        for (predicate, branch) in &self.cases {
            match all_match(predicate.as_ref(), &envelope) {
                Ok(true) => return Flow::Enter(branch, envelope),
                Ok(false) => {}
                Err(error) => return Flow::Divert(envelope, error.into()),
            }
        }
        Flow::Continue(envelope)
    }
}

fn all_match(predicate: &dyn Predicate, envelope: &Envelope) -> Result<bool, MappingError> {
    for message in envelope.messages() {
        if !predicate.matches(message)? {
            return Ok(false);
        }
    }
    Ok(true)
}
