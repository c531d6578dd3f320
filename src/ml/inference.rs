//! モデル推論機能
//!
//! 学習済みモデルをモデルディレクトリから遅延読み込みし、アップロードされた画像に
//! 0〜10 のスコアと説明文を付けて返します。

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LoafError, Result};
use crate::ml::ml_model::LoafNet;
use crate::ml::preprocess::{PreprocessedImage, Preprocessor};
use crate::model::{load_model_with_metadata, log_metadata_info, model_exists, ModelMetadata};
use crate::types::{Category, LabelScheme};

/// 説明文の閾値（スコアがこの値以上で上の段階になる）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExplanationThresholds {
    pub partial: u8,
    pub good: u8,
    pub perfect: u8,
}

impl Default for ExplanationThresholds {
    fn default() -> Self {
        Self {
            partial: 4,
            good: 7,
            perfect: 9,
        }
    }
}

impl ExplanationThresholds {
    /// partial <= good <= perfect <= 10 であることを確認
    pub fn validate(&self) -> Result<()> {
        if self.partial <= self.good && self.good <= self.perfect && self.perfect <= 10 {
            Ok(())
        } else {
            Err(LoafError::InvalidConfig(format!(
                "説明文の閾値は partial <= good <= perfect <= 10 である必要があります: {:?}",
                self
            )))
        }
    }

    pub fn explain(&self, score: u8) -> Explanation {
        if score >= self.perfect {
            Explanation::PerfectLoaf
        } else if score >= self.good {
            Explanation::GoodLoaf
        } else if score >= self.partial {
            Explanation::PartialLoaf
        } else {
            Explanation::NotALoaf
        }
    }
}

/// スコアの段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Explanation {
    NotALoaf,
    PartialLoaf,
    GoodLoaf,
    PerfectLoaf,
}

impl Explanation {
    pub fn text(&self) -> &'static str {
        match self {
            Explanation::NotALoaf => "Not a loaf: legs visible, bad shape.",
            Explanation::PartialLoaf => "Partial loaf: tail visible, minor issues.",
            Explanation::GoodLoaf => "Good loaf, but slight misalignment.",
            Explanation::PerfectLoaf => "Perfect loaf!",
        }
    }
}

/// 推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// 0〜10
    pub score: u8,
    pub explanation: String,
    pub verdict: Explanation,
}

/// [0,1] の生出力を 0〜10 の整数スコアに変換
pub fn score_from_raw(raw: f32) -> u8 {
    (raw.clamp(0.0, 1.0) * 10.0).round() as u8
}

/// 前処理済み画像を [0,1] の値で評価するもの
pub trait LoafScorer: Send {
    /// 期待する入力サイズ
    fn input_size(&self) -> usize;

    fn score(&self, image: &PreprocessedImage) -> Result<f32>;
}

/// モデルの読み込み元
pub trait ModelLoader: Send + Sync {
    type Scorer: LoafScorer;

    /// モデルがまだ存在しない場合は `Ok(None)`
    fn load(&self) -> Result<Option<Self::Scorer>>;
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: LoafNet<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load(model_dir: &Path, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_dir)?;
        log_metadata_info(&metadata);

        let model = metadata.model_config().init::<B>(device)?;

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, device)
            .map_err(|e| LoafError::Archive(format!("モデル重みの読み込みエラー: {:?}", e)))?;
        let model = model.load_record(record);

        Ok(Self {
            model,
            metadata,
            device: device.clone(),
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

impl<B: Backend> LoafScorer for InferenceEngine<B> {
    fn input_size(&self) -> usize {
        self.metadata.model_input_size
    }

    fn score(&self, image: &PreprocessedImage) -> Result<f32> {
        let size = self.input_size();
        if image.size != size {
            return Err(LoafError::InvalidConfig(format!(
                "入力サイズが一致しません: 画像 {} / モデル {}",
                image.size, size
            )));
        }

        // [1, 3, size, size]
        let tensor = Tensor::<B, 1>::from_floats(image.data.as_slice(), &self.device).reshape([1, 3, size, size]);
        let output = self.model.forward(tensor);

        let raw = match self.metadata.label_scheme {
            LabelScheme::Regression => {
                let values = output
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| LoafError::Inference(format!("推論結果の取得エラー: {:?}", e)))?;
                let value = values.first().copied().unwrap_or(f32::NAN);
                if !value.is_finite() {
                    return Err(LoafError::Inference(format!("モデル出力が不正です: {}", value)));
                }
                value.clamp(0.0, 1.0)
            }
            LabelScheme::Classification => {
                let probs = softmax(output, 1)
                    .into_data()
                    .to_vec::<f32>()
                    .map_err(|e| LoafError::Inference(format!("推論結果の取得エラー: {:?}", e)))?;
                let best = probs
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i);
                debug!("クラス確率: {:?}", probs);
                match best.and_then(Category::from_index) {
                    Some(Category::Loaf) => 1.0,
                    _ => 0.0,
                }
            }
        };

        Ok(raw)
    }
}

/// モデルディレクトリのアーカイブから読み込むローダー
pub struct ArchiveModelLoader<B: Backend> {
    model_dir: PathBuf,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend> ArchiveModelLoader<B> {
    pub fn new(model_dir: impl Into<PathBuf>, device: B::Device) -> Self {
        Self {
            model_dir: model_dir.into(),
            device,
            _backend: PhantomData,
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }
}

impl<B: Backend> ModelLoader for ArchiveModelLoader<B> {
    type Scorer = InferenceEngine<B>;

    fn load(&self) -> Result<Option<InferenceEngine<B>>> {
        if !model_exists(&self.model_dir) {
            return Ok(None);
        }
        info!("モデルを読み込んでいます: {}", self.model_dir.display());
        InferenceEngine::load(&self.model_dir, &self.device).map(Some)
    }
}

/// 推論コンテキスト
///
/// 最初の推論時にモデルを読み込み、`invalidate` されるまで使い回します。
pub struct InferenceContext<L: ModelLoader> {
    loader: L,
    thresholds: ExplanationThresholds,
    scorer: Mutex<Option<L::Scorer>>,
}

impl<L: ModelLoader> InferenceContext<L> {
    pub fn new(loader: L, thresholds: ExplanationThresholds) -> Self {
        Self {
            loader,
            thresholds,
            scorer: Mutex::new(None),
        }
    }

    pub fn thresholds(&self) -> &ExplanationThresholds {
        &self.thresholds
    }

    pub fn is_loaded(&self) -> bool {
        self.scorer.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// 画像を評価
    ///
    /// モデルが存在しない場合は画像を見る前に `ModelNotTrained` を返します。
    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        let mut guard = self.scorer.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = self.loader.load()?;
        }
        let scorer = guard.as_ref().ok_or(LoafError::ModelNotTrained)?;

        let image = Preprocessor::new(scorer.input_size()).preprocess(image_bytes)?;
        let raw = scorer.score(&image)?;
        let score = score_from_raw(raw);
        let verdict = self.thresholds.explain(score);
        info!("推論結果: score = {} ({:.3})", score, raw);

        Ok(Prediction {
            score,
            explanation: verdict.text().to_string(),
            verdict,
        })
    }

    /// 読み込み済みモデルを破棄（次の推論で再読み込み）
    pub fn invalidate(&self) {
        *self.scorer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
