//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、画像ストア、モデル、学習設定などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ml::inference::ExplanationThresholds;
use crate::ml::preprocess::IMAGE_SIZE;
use crate::types::LabelScheme;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド（`wgpu` feature が必要）
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 画像ストア設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// 画像ストアのルートディレクトリ
    pub root: String,
    /// ラベル方式
    #[serde(default)]
    pub label_scheme: LabelScheme,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: "dataset".to_string(),
            label_scheme: LabelScheme::Regression,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 学習済みモデルの保存ディレクトリ
    pub model_dir: String,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_dir: "loaf_model".to_string(),
            image_size: IMAGE_SIZE,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率（Adam）
    pub learning_rate: f64,
    /// データのシャッフル用シード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 16,
            learning_rate: 1e-3,
            seed: 42,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 画像ストア設定
    #[serde(default)]
    pub store: StoreSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 説明文の閾値
    #[serde(default)]
    pub explanation: ExplanationThresholds,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.explanation.validate()?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// デフォルトパスに設定を保存する
    pub fn save_default(&self) -> anyhow::Result<()> {
        let path = Self::default_path();
        self.save(&path)?;
        info!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("画像ストア: {} ({})", self.store.root, self.store.label_scheme);
        info!("モデルディレクトリ: {}", self.model.model_dir);
        info!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}",
            self.training.num_epochs, self.training.batch_size, self.training.learning_rate
        );
        info!(
            "説明文の閾値: partial={}, good={}, perfect={}",
            self.explanation.partial, self.explanation.good, self.explanation.perfect
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.model.image_size, 128);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.store.label_scheme, LabelScheme::Regression);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.model_dir, deserialized.model.model_dir);
        assert_eq!(config.explanation, deserialized.explanation);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "store": { "root": "cats", "label_scheme": "classification" } }"#).unwrap();
        assert_eq!(config.store.root, "cats");
        assert_eq!(config.store.label_scheme, LabelScheme::Classification);
        assert_eq!(config.training.learning_rate, 1e-3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.training.num_epochs = 3;
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load_or_default_from(&path).training.num_epochs, 3);
    }

    #[test]
    fn test_broken_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ broken").unwrap();
        assert_eq!(AppConfig::load_or_default_from(&path).training.num_epochs, 10);
    }

    #[test]
    fn test_unordered_thresholds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "explanation": { "partial": 8, "good": 5, "perfect": 9 } }"#,
        )
        .unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("partial <= good <= perfect"));

        let config = AppConfig::load_or_default_from(&path);
        assert_eq!(config.explanation, ExplanationThresholds::default());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
