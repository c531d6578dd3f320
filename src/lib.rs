//! 猫の「香箱座り」写真を評価するライブラリ
//!
//! 画像ストアへの保存、学習データの読み込み、CNNの学習と推論を提供します。

pub mod error;
pub mod types;
pub mod store;

// 機械学習
pub mod ml;
pub mod model;

pub mod service;

pub use error::{LoafError, Result};
pub use ml::{ExplanationThresholds, Prediction, Preprocessor};
pub use model::AppConfig;
pub use service::{LoafService, TrainingStatus};
pub use store::ImageStore;
pub use types::{Bucket, Category, LabelScheme, Rating};
