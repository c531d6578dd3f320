pub mod backend;
pub mod dataset;
pub mod ml_model;
pub mod preprocess;
pub mod training;
pub mod inference;

pub use dataset::{load_dataset, LoafBatch, LoafBatcher, LoafDataset, LoafItem, LoafLabel, LoafTargets};
pub use ml_model::{LoafNet, ModelConfig};
pub use preprocess::{PreprocessedImage, Preprocessor, IMAGE_SIZE};
pub use training::{fit, train_from_store, EpochMetric, EpochReport, FittedModel, TrainingOutcome};
pub use inference::{
    ArchiveModelLoader, Explanation, ExplanationThresholds, InferenceContext, InferenceEngine, LoafScorer,
    ModelLoader, Prediction,
};
