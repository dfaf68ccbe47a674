//! Training loop, its collaborators and checkpoint management

pub mod batch;
pub mod checkpoint;
pub mod checkpointer;
pub mod data_loader;
pub mod engine;
pub mod loss;
pub mod metric_logger;
pub mod optimizer;
pub mod scheduler;
pub mod state;

pub use batch::{padded_collate, Batch, IgnoreLabelCache};

pub use checkpoint::{
    CheckpointBundle,
    CheckpointManager,
    RecipeStateFields,
    SaveRequest,
};

pub use checkpointer::{Checkpointer, SafetensorsCheckpointer};

pub use data_loader::{
    ConcatDataset,
    DataLoader,
    DataPipeline,
    Dataset,
    EpochSampler,
    JsonlDataset,
    PretokenizedTokenizer,
    TokenizedSample,
    Tokenizer,
};

pub use engine::{
    EngineSettings,
    GradientAccumulator,
    LoopComponents,
    MemoryProfileWindow,
    TrainingEngine,
};

pub use loss::{ChunkedCrossEntropyLoss, CrossEntropyLoss, LossFn};
pub use metric_logger::{DiskLogger, MetricLogger, Metrics, StdoutLogger};
pub use optimizer::{AdamW, GradMap, Optimizer, OptimizerState, Sgd};
pub use scheduler::{ConstantLr, CosineWithWarmup, LrScheduler};
pub use state::RecipeState;
