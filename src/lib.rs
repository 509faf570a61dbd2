pub mod autofunc;
pub mod bidirectional;
pub mod block;
pub mod block_seq_func;
pub mod bptt;
pub mod cost;
pub mod dataset;
pub mod dense_block;
pub mod errors;
pub mod model_config;
pub mod model_persistence;
pub mod seq_func;
pub mod seq_prop;
pub mod serializer;
// Re-export key structs for easier access
pub use autofunc::{Gradient, RGradient, RValue, RVariable, RVector, Value, VarId, Variable, Vector};
pub use bidirectional::Bidirectional;
pub use block::{
    Block, BlockInput, BlockOutput, BlockRInput, BlockROutput, UpstreamGradient,
    UpstreamRGradient,
};
pub use block_seq_func::BlockSeqFunc;
pub use bptt::{Bptt, total_cost};
pub use cost::{CostFunc, SquaredError};
pub use dataset::delayed_echo;
pub use dense_block::DenseBlock;
pub use errors::{Result, RnnError};
pub use model_config::{BlockConfig, BpttConfig, TrainingConfig};
pub use model_persistence::{VersionedModel, load_seq_func, save_seq_func};
pub use seq_func::{RResultSeqs, ResultSeqs, SeqFunc};
pub use seq_prop::{Sample, SeqProp, SeqRProp};
pub use serializer::Component;
