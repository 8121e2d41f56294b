pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod pearson;
pub mod pipeline;
pub mod rank;
pub mod rdm;
pub mod rsa;
pub mod spearman;
pub mod store;
pub mod upper;

pub use config::{AnalysisConfig, EngineConfig, Execution, RsaConfig};
pub use engine::{BlockProgress, RdmEngine};
pub use error::{RdmError, RdmResult};
pub use pipeline::{
    AccumulatedGroups, GroupKey, GroupRdm, GroupSkip, LabelMap, Pipeline, PipelineOutput,
    SessionAccumulator, SessionRsa, SkipReason,
};
pub use rank::{rank_data, RankedMatrix};
pub use rdm::{Edge, Rdm};
pub use rsa::{compare, compare_exact, compare_subsampled, sample_indices, CompareMode, RsaMatrix};
pub use spearman::{distance_matrix, spearman};
pub use store::{LazyRdm, RdmSource, RdmStore};
