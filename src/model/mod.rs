pub mod model_metadata;
pub mod model_storage;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{
    archive_path, load_metadata, load_model_with_metadata, log_metadata_info, model_exists, save_model_with_metadata,
};
pub use config::{AppConfig, DeviceType, ModelSettings, StoreSettings, TrainingSettings};
