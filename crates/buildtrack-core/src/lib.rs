//! buildtrack core - domain types, collaborator contracts, and error handling

pub mod error;
pub mod event;
pub mod output;
pub mod rule;
pub mod service;
pub mod types;

pub use error::{Error, Result};
pub use event::{event_channel, Ack, EventReceiver, EventSender, RuleEvent};
pub use output::{LogSink, RuleOutput, RuleOutputFactory};
pub use rule::{
    BuildGraph, GraphEngine, GraphOptions, LabelParts, Rule, RunOptions, SourceUnit, PHONY_ALL,
};
pub use service::{
    AnalysisStore, BuildDataFs, BuildDataSource, ImportOptions, Importer, StoreClient,
    TrackingService,
};
pub use types::*;
