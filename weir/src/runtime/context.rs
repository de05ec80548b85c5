//! Process-wide state, constructed once at startup and passed by reference
//! into every operation: the registry, the ring channel, the rule engine
//! slot and the control channel. Nothing in the core reaches for implicit
//! globals.

use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use crate::{
    control::ControlChannel,
    filter::registry::FilterRegistry,
    pipeline::PacketPipeline,
    ring::RingBuffer,
    rules::{BasicRuleEngine, RuleEngine, RulesHost},
    runtime::{
        cli::Cli,
        conf::{Conf, ConfError},
    },
};

pub struct Context {
    pub conf: Conf,
    pub pipeline: Arc<PacketPipeline>,
    pub control: ControlChannel,
}

impl Context {
    /// Parse the CLI, load configuration and build the filter core.
    pub fn new() -> Result<Self, ContextError> {
        let cli = Cli::parse();
        let conf = Conf::new(cli)?;
        Ok(Self::from_conf(conf))
    }

    /// Build the filter core from an already-loaded configuration, with
    /// the reference rule engine installed.
    pub fn from_conf(conf: Conf) -> Self {
        Self::with_engine(conf, Arc::new(BasicRuleEngine::new()))
    }

    /// Build the filter core around a caller-supplied rule engine.
    pub fn with_engine(conf: Conf, engine: Arc<dyn RuleEngine>) -> Self {
        let (capture_tx, capture_rx) = RingBuffer::with_capacity(conf.ring_capacity).split();
        let registry = Arc::new(FilterRegistry::new());
        let rules = Arc::new(RulesHost::new(engine));
        let pipeline = Arc::new(PacketPipeline::new(registry, rules, capture_tx));
        let control = ControlChannel::new(pipeline.clone(), capture_rx);

        Self {
            conf,
            pipeline,
            control,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Conf(#[from] ConfError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_builds_from_default_conf() {
        let ctx = Context::from_conf(Conf::default());
        assert!(ctx.pipeline.registry().is_empty());
        // The session slot starts free.
        let session = ctx.control.open().unwrap();
        drop(session);
    }
}
