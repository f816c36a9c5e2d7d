//! Routing Module
//!
//! Compiles policy text into a [`CompiledMatcher`]:
//! parse -> key refinement -> external data -> merge & sort -> dedup -> build.

pub mod datafile;
pub mod error;
pub mod matcher;
pub mod optimizer;
pub mod parser;
pub mod trie;
pub mod types;

use std::path::PathBuf;

use tracing::{debug, enabled, trace, Level};

pub use datafile::DataFileOptimizer;
pub use error::RoutingError;
pub use matcher::{CompiledMatcher, OutboundTable};
pub use optimizer::{
    apply_optimizers, DeduplicateOptimizer, MergeAndSortOptimizer, RefineParamKeyOptimizer,
    RulesOptimizer,
};
pub use parser::parse_policy;
pub use types::*;

/// Parser plus an ordered optimizer pipeline
pub struct RoutingCompiler {
    optimizers: Vec<Box<dyn RulesOptimizer>>,
}

impl RoutingCompiler {
    /// Standard pipeline resolving external lists under `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_optimizers(vec![
            Box::new(RefineParamKeyOptimizer),
            Box::new(DataFileOptimizer::new(data_dir)),
            Box::new(MergeAndSortOptimizer),
            Box::new(DeduplicateOptimizer),
        ])
    }

    pub fn with_optimizers(optimizers: Vec<Box<dyn RulesOptimizer>>) -> Self {
        Self { optimizers }
    }

    /// Parse and optimize policy text
    pub fn compile(&self, text: &str) -> Result<RoutingPolicy, RoutingError> {
        let policy = parse_policy(text)?;
        debug!("Parsed {} routing rules", policy.rules.len());

        let policy = apply_optimizers(policy, &self.optimizers)?;
        if enabled!(Level::TRACE) {
            trace!("Optimized routing policy:\n{}", policy);
        }
        Ok(policy)
    }

    /// Compile and bind to `table`
    pub fn build(
        &self,
        text: &str,
        table: &OutboundTable,
    ) -> Result<CompiledMatcher, RoutingError> {
        let policy = self.compile(text)?;
        CompiledMatcher::build(&policy, table)
    }
}
