//! モデル学習機能

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use serde::Serialize;
use tracing::info;

use crate::error::{LoafError, Result};
use crate::ml::dataset::{load_dataset, LoafBatcher, LoafDataset, LoafTargets};
use crate::ml::ml_model::{LoafNet, ModelConfig};
use crate::ml::preprocess::Preprocessor;
use crate::model::config::TrainingSettings;
use crate::model::{save_model_with_metadata, ModelMetadata};
use crate::store::ImageStore;
use crate::types::LabelScheme;

/// エポックごとの評価指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochMetric {
    /// 平均絶対誤差（回帰）
    MeanAbsoluteError(f64),
    /// 正解率（分類）
    Accuracy(f64),
}

impl std::fmt::Display for EpochMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EpochMetric::MeanAbsoluteError(v) => write!(f, "mae = {:.4}", v),
            EpochMetric::Accuracy(v) => write!(f, "accuracy = {:.4}", v),
        }
    }
}

/// 1エポック分の学習結果
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    /// 1始まり
    pub epoch: usize,
    pub total_epochs: usize,
    pub loss: f64,
    pub metric: EpochMetric,
}

/// 学習済みモデル（推論用バックエンド上）
pub struct FittedModel<B: Backend> {
    pub model: LoafNet<B>,
    pub config: ModelConfig,
    pub epochs: Vec<EpochReport>,
}

impl<B: Backend> FittedModel<B> {
    pub fn final_loss(&self) -> f64 {
        self.epochs.last().map_or(f64::NAN, |r| r.loss)
    }
}

/// `train_from_store` の結果
#[derive(Debug, Clone, Serialize)]
pub struct TrainingOutcome {
    pub final_loss: f64,
    pub num_samples: usize,
    pub epochs: Vec<EpochReport>,
    pub model_path: PathBuf,
}

/// データセットにモデルを学習させる
///
/// モデルは毎回ランダムに初期化されます。キャンセルはエポックの境界で確認し、
/// キャンセルされた場合は `Cancelled` を返します（途中のモデルは返さない）。
pub fn fit<B: AutodiffBackend>(
    dataset: LoafDataset,
    model_config: &ModelConfig,
    settings: &TrainingSettings,
    device: &B::Device,
    cancel_flag: &AtomicBool,
    mut on_epoch: impl FnMut(&EpochReport),
) -> Result<FittedModel<B::InnerBackend>> {
    if dataset.scheme() != model_config.label_scheme {
        return Err(LoafError::InvalidConfig(format!(
            "データセットのラベル方式 ({}) とモデル ({}) が一致しません",
            dataset.scheme(),
            model_config.label_scheme
        )));
    }
    if dataset.image_size() != model_config.image_size {
        return Err(LoafError::InvalidConfig(format!(
            "画像サイズが一致しません: データセット {} / モデル {}",
            dataset.image_size(),
            model_config.image_size
        )));
    }
    if settings.num_epochs == 0 || settings.batch_size == 0 {
        return Err(LoafError::InvalidConfig(
            "エポック数とバッチサイズは1以上を指定してください".to_string(),
        ));
    }

    let num_epochs = settings.num_epochs;
    let num_samples = dataset.len();
    info!(
        "学習を開始します: {} 枚, エポック数: {}, バッチサイズ: {}, 学習率: {}",
        num_samples, num_epochs, settings.batch_size, settings.learning_rate
    );

    let batcher = LoafBatcher::<B>::new(device.clone(), model_config.image_size, model_config.label_scheme);
    let dataloader = DataLoaderBuilder::new(batcher)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(0)
        .build(dataset);

    let mut model = model_config.init::<B>(device)?;
    let mut optim = AdamConfig::new().init();
    let mut reports = Vec::with_capacity(num_epochs);

    for epoch in 1..=num_epochs {
        if cancel_flag.load(Ordering::SeqCst) {
            info!("エポック {} の開始前にキャンセルされました", epoch);
            return Err(LoafError::Cancelled);
        }

        let mut loss_sum = 0.0;
        let mut metric_sum = 0.0;
        let mut seen = 0usize;

        for batch in dataloader.iter() {
            let (loss, batch_metric, batch_len) = match batch.targets {
                LoafTargets::Scores(targets) => {
                    let item = model.forward_regression(batch.images, targets);
                    let batch_len = item.targets.dims()[0];
                    let abs_err_sum: f64 = (item.output.clone() - item.targets.clone())
                        .abs()
                        .sum()
                        .into_scalar()
                        .elem();
                    (item.loss, abs_err_sum, batch_len)
                }
                LoafTargets::Classes(targets) => {
                    let item = model.forward_classification(batch.images, targets);
                    let batch_len = item.targets.dims()[0];
                    let correct: f64 = item
                        .output
                        .clone()
                        .argmax(1)
                        .flatten::<1>(0, 1)
                        .equal(item.targets.clone())
                        .int()
                        .sum()
                        .into_scalar()
                        .elem();
                    (item.loss, correct, batch_len)
                }
            };

            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(LoafError::Training(format!(
                    "エポック {} で損失が発散しました ({})",
                    epoch, loss_value
                )));
            }

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);

            loss_sum += loss_value * batch_len as f64;
            metric_sum += batch_metric;
            seen += batch_len;
        }

        let seen_f = seen.max(1) as f64;
        let metric = match model_config.label_scheme {
            LabelScheme::Regression => EpochMetric::MeanAbsoluteError(metric_sum / seen_f),
            LabelScheme::Classification => EpochMetric::Accuracy(metric_sum / seen_f),
        };
        let report = EpochReport {
            epoch,
            total_epochs: num_epochs,
            loss: loss_sum / seen_f,
            metric,
        };

        info!("Epoch {}/{}: loss = {:.6}, {}", epoch, num_epochs, report.loss, report.metric);
        on_epoch(&report);
        reports.push(report);
    }

    // 最終エポック後のキャンセルも保存前に反映する
    if cancel_flag.load(Ordering::SeqCst) {
        info!("学習完了直後にキャンセルされました");
        return Err(LoafError::Cancelled);
    }

    info!("学習が完了しました (パラメータ数: {})", model.num_params());

    Ok(FittedModel {
        model: model.valid(),
        config: model_config.clone(),
        epochs: reports,
    })
}

/// モデルの重みをバイナリに変換
pub fn model_to_bytes<B: Backend>(model: LoafNet<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.into_record(), ())
        .map_err(|e| LoafError::Training(format!("モデル重みの書き出しエラー: {:?}", e)))
}

/// 画像ストアから学習してモデルディレクトリに保存
///
/// データセットが空の場合はモデルを作る前に `EmptyDataset` で中断し、何も保存しません。
/// 既存のモデルは学習が成功した場合にのみ置き換えられます。
pub fn train_from_store<B: AutodiffBackend>(
    store: &ImageStore,
    model_config: &ModelConfig,
    settings: &TrainingSettings,
    model_dir: &Path,
    device: &B::Device,
    cancel_flag: &AtomicBool,
    on_epoch: impl FnMut(&EpochReport),
) -> Result<TrainingOutcome> {
    if store.scheme() != model_config.label_scheme {
        return Err(LoafError::InvalidConfig(format!(
            "画像ストアのラベル方式 ({}) とモデル ({}) が一致しません",
            store.scheme(),
            model_config.label_scheme
        )));
    }

    let dataset = load_dataset(store, &Preprocessor::new(model_config.image_size))?;
    let num_samples = dataset.len();

    let fitted = fit::<B>(dataset, model_config, settings, device, cancel_flag, on_epoch)?;
    let final_loss = fitted.final_loss();

    let model_binary = model_to_bytes(fitted.model)?;
    let metadata = ModelMetadata::new(model_config, settings, num_samples, final_loss);
    let model_path = save_model_with_metadata(model_dir, &metadata, &model_binary)?;

    Ok(TrainingOutcome {
        final_loss,
        num_samples,
        epochs: fitted.epochs,
        model_path,
    })
}
