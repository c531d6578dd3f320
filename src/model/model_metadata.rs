//! モデルメタデータの定義
//!
//! 重みと一緒に保存し、推論時にモデル構造を復元するために使用します。

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{LoafError, Result};
use crate::ml::ModelConfig;
use crate::model::config::TrainingSettings;
use crate::types::LabelScheme;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// ラベル方式（出力層の形を決める）
    pub label_scheme: LabelScheme,

    /// クラスラベル（出力順）
    /// 例: ["loaf", "not_loaf"]、回帰の場合は ["1", ..., "10"]
    #[serde(default)]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（通常128x128）
    pub model_input_size: usize,

    /// 学習エポック数
    pub num_epochs: usize,

    /// バッチサイズ
    pub batch_size: usize,

    /// 学習率
    pub learning_rate: f64,

    /// 学習に使用した画像数
    pub num_samples: usize,

    /// 最終エポックの損失
    pub final_loss: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        model_config: &ModelConfig,
        training: &TrainingSettings,
        num_samples: usize,
        final_loss: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();
        let class_labels = model_config
            .label_scheme
            .buckets()
            .iter()
            .map(|b| b.dir_name())
            .collect();

        Self {
            label_scheme: model_config.label_scheme,
            class_labels,
            model_input_size: model_config.image_size,
            num_epochs: training.num_epochs,
            batch_size: training.batch_size,
            learning_rate: training.learning_rate,
            num_samples,
            final_loss,
            trained_at,
        }
    }

    /// 推論用のモデル設定を復元
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.label_scheme).with_image_size(self.model_input_size)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LoafError::Archive(format!("metadata.json の解析に失敗: {}", e)))
    }
}
