//! サービス層
//!
//! 画像ストア・学習・推論をまとめて所有します。学習はバックグラウンドで実行し、
//! 状態の取得とエポック境界でのキャンセルができます。

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use burn::tensor::backend::AutodiffBackend;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{LoafError, Result};
use crate::ml::inference::{ArchiveModelLoader, InferenceContext, Prediction};
use crate::ml::ml_model::ModelConfig;
use crate::ml::training::{train_from_store, TrainingOutcome};
use crate::model::config::{AppConfig, TrainingSettings};
use crate::store::ImageStore;
use crate::types::Bucket;

type ServiceInference<B> = InferenceContext<ArchiveModelLoader<<B as AutodiffBackend>::InnerBackend>>;

/// 学習の状態
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainingStatus {
    Idle,
    Running {
        /// 完了したエポック数
        epoch: usize,
        total_epochs: usize,
        last_loss: Option<f64>,
    },
    Succeeded {
        final_loss: f64,
        num_samples: usize,
        epochs: usize,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

impl TrainingStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TrainingStatus::Running { .. })
    }
}

/// 1回の学習実行に必要なもの（バックグラウンドスレッドへ移動する）
struct TrainingJob<B: AutodiffBackend> {
    store: ImageStore,
    model_config: ModelConfig,
    settings: TrainingSettings,
    model_dir: PathBuf,
    device: B::Device,
    cancel_flag: Arc<AtomicBool>,
    status: Arc<Mutex<TrainingStatus>>,
    inference: Arc<ServiceInference<B>>,
}

impl<B: AutodiffBackend> TrainingJob<B> {
    fn run(self) -> Result<TrainingOutcome> {
        let status = Arc::clone(&self.status);
        let result = train_from_store::<B>(
            &self.store,
            &self.model_config,
            &self.settings,
            &self.model_dir,
            &self.device,
            &self.cancel_flag,
            |report| {
                set_status(
                    &status,
                    TrainingStatus::Running {
                        epoch: report.epoch,
                        total_epochs: report.total_epochs,
                        last_loss: Some(report.loss),
                    },
                );
            },
        );

        let next = match &result {
            Ok(outcome) => {
                // 次の推論で新しいモデルを読み込む
                self.inference.invalidate();
                info!("学習が成功しました: final_loss = {:.6}", outcome.final_loss);
                TrainingStatus::Succeeded {
                    final_loss: outcome.final_loss,
                    num_samples: outcome.num_samples,
                    epochs: outcome.epochs.len(),
                }
            }
            Err(LoafError::Cancelled) => {
                info!("学習はキャンセルされました");
                TrainingStatus::Cancelled
            }
            Err(e) => {
                warn!("学習に失敗しました: {}", e);
                TrainingStatus::Failed { message: e.to_string() }
            }
        };
        set_status(&self.status, next);
        result
    }
}

fn set_status(status: &Mutex<TrainingStatus>, next: TrainingStatus) {
    *status.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

/// ブロッキングスレッドで学習を実行し、パニックした場合も状態を Failed にする
fn spawn_tracked<F>(
    handle: &tokio::runtime::Handle,
    status: Arc<Mutex<TrainingStatus>>,
    job: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Result<TrainingOutcome> + Send + 'static,
{
    handle.spawn_blocking(move || {
        // 正常終了時の結果は job 側で status に反映済み
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("学習スレッドが異常終了しました");
            set_status(
                &status,
                TrainingStatus::Failed {
                    message: "学習スレッドが異常終了しました".to_string(),
                },
            );
        }
    })
}

/// 猫の「香箱座り」評価サービス
pub struct LoafService<B: AutodiffBackend> {
    config: AppConfig,
    store: ImageStore,
    device: B::Device,
    inference: Arc<ServiceInference<B>>,
    status: Arc<Mutex<TrainingStatus>>,
    cancel_flag: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: AutodiffBackend> LoafService<B> {
    pub fn new(config: AppConfig, device: B::Device) -> Self {
        let store = ImageStore::new(&config.store.root, config.store.label_scheme)
            .with_image_size(config.model.image_size);
        let loader = ArchiveModelLoader::new(&config.model.model_dir, device.clone());
        let inference = Arc::new(InferenceContext::new(loader, config.explanation));

        Self {
            config,
            store,
            device,
            inference,
            status: Arc::new(Mutex::new(TrainingStatus::Idle)),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn image_store(&self) -> &ImageStore {
        &self.store
    }

    /// 画像をラベル付きで保存
    pub fn store(&self, image_bytes: &[u8], bucket: Bucket) -> Result<PathBuf> {
        let path = self.store.store(image_bytes, bucket)?;
        info!("画像を保存しました: {}", path.display());
        Ok(path)
    }

    pub fn list_by_bucket(&self) -> Result<BTreeMap<Bucket, Vec<PathBuf>>> {
        self.store.list_by_bucket()
    }

    /// 画像を評価（モデルが無い場合は `ModelNotTrained`）
    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        self.inference.predict(image_bytes)
    }

    /// `predict` と同じ推論で画像を解析
    pub fn analyze(&self, image_bytes: &[u8]) -> Result<Prediction> {
        self.predict(image_bytes)
    }

    fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.config.store.label_scheme).with_image_size(self.config.model.image_size)
    }

    /// 状態を Running にして学習ジョブを作る（実行中なら拒否）
    fn begin_training(&self) -> Result<TrainingJob<B>> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_running() {
            return Err(LoafError::TrainingInProgress);
        }
        self.cancel_flag.store(false, Ordering::SeqCst);
        *status = TrainingStatus::Running {
            epoch: 0,
            total_epochs: self.config.training.num_epochs,
            last_loss: None,
        };

        Ok(TrainingJob {
            store: self.store.clone(),
            model_config: self.model_config(),
            settings: self.config.training.clone(),
            model_dir: PathBuf::from(&self.config.model.model_dir),
            device: self.device.clone(),
            cancel_flag: Arc::clone(&self.cancel_flag),
            status: Arc::clone(&self.status),
            inference: Arc::clone(&self.inference),
        })
    }

    /// 学習を同期実行
    pub fn train(&self) -> Result<TrainingOutcome> {
        self.begin_training()?.run()
    }

    /// 学習をバックグラウンドで開始（tokio ランタイム内で呼ぶこと）
    pub fn start_training(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| LoafError::InvalidConfig(format!("tokio ランタイムが必要です: {}", e)))?;

        let job = self.begin_training()?;
        info!("バックグラウンドで学習を開始します");
        let task = spawn_tracked(&handle, Arc::clone(&self.status), move || job.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// 次のエポック境界で学習を止める
    pub fn cancel_training(&self) {
        if self.training_status().is_running() {
            info!("学習のキャンセルを要求しました");
            self.cancel_flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn training_status(&self) -> TrainingStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// バックグラウンド学習の終了を待って最終状態を返す
    pub async fn wait_for_training(&self) -> TrainingStatus {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("学習スレッドエラー: {}", e);
                set_status(
                    &self.status,
                    TrainingStatus::Failed {
                        message: format!("学習スレッドエラー: {}", e),
                    },
                );
            }
        }
        self.training_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backend::{cpu_device, CpuTrainBackend};
    use crate::ml::preprocess::tests::solid_png;
    use crate::model::model_exists;
    use crate::types::{LabelScheme, Rating};
    use std::path::Path;

    fn test_config(dir: &Path, num_epochs: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.store.root = dir.join("dataset").to_string_lossy().to_string();
        config.model.model_dir = dir.join("model").to_string_lossy().to_string();
        config.model.image_size = 32;
        config.training.num_epochs = num_epochs;
        config.training.batch_size = 4;
        config
    }

    fn rating(v: u8) -> Bucket {
        Bucket::Rating(Rating::new(v).unwrap())
    }

    fn fill_store(service: &LoafService<CpuTrainBackend>, per_bucket: u8) {
        for i in 0..per_bucket {
            service
                .store(&solid_png(48, 40, [240, 200 + i, 150]), rating(8))
                .unwrap();
            service.store(&solid_png(48, 40, [30, 20 + i, 60]), rating(3)).unwrap();
        }
    }

    #[test]
    fn predict_before_training_is_not_trained() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoafService::<CpuTrainBackend>::new(test_config(dir.path(), 1), cpu_device());
        let result = service.predict(&solid_png(32, 32, [100, 100, 100]));
        assert!(matches!(result, Err(LoafError::ModelNotTrained)));
    }

    #[test]
    fn training_an_empty_store_fails_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1);
        let model_dir = PathBuf::from(&config.model.model_dir);
        let service = LoafService::<CpuTrainBackend>::new(config, cpu_device());

        assert!(matches!(service.train(), Err(LoafError::EmptyDataset { .. })));
        assert!(!model_exists(&model_dir));
        assert!(matches!(service.training_status(), TrainingStatus::Failed { .. }));
        assert!(matches!(
            service.predict(&solid_png(8, 8, [0, 0, 0])),
            Err(LoafError::ModelNotTrained)
        ));
    }

    #[test]
    fn store_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoafService::<CpuTrainBackend>::new(test_config(dir.path(), 1), cpu_device());
        fill_store(&service, 2);

        let listing = service.list_by_bucket().unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[&rating(8)].len(), 2);
        assert_eq!(listing[&rating(3)].len(), 2);
        assert_eq!(service.image_store().scheme(), LabelScheme::Regression);
    }

    #[test]
    fn synchronous_training_enables_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoafService::<CpuTrainBackend>::new(test_config(dir.path(), 2), cpu_device());
        fill_store(&service, 2);

        let outcome = service.train().unwrap();
        assert_eq!(outcome.num_samples, 4);
        assert!(matches!(service.training_status(), TrainingStatus::Succeeded { epochs: 2, .. }));

        let prediction = service.analyze(&solid_png(64, 64, [220, 210, 160])).unwrap();
        assert!(prediction.score <= 10);
        assert!(!prediction.explanation.is_empty());
    }

    #[tokio::test]
    async fn background_training_rejects_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoafService::<CpuTrainBackend>::new(test_config(dir.path(), 2), cpu_device());
        fill_store(&service, 2);

        service.start_training().unwrap();
        assert!(matches!(service.start_training(), Err(LoafError::TrainingInProgress)));

        let status = service.wait_for_training().await;
        assert!(matches!(status, TrainingStatus::Succeeded { num_samples: 4, .. }));
        assert!(service.predict(&solid_png(32, 32, [200, 200, 200])).unwrap().score <= 10);
    }

    #[tokio::test]
    async fn cancelled_training_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 50);
        let model_dir = PathBuf::from(&config.model.model_dir);
        let service = LoafService::<CpuTrainBackend>::new(config, cpu_device());
        fill_store(&service, 2);

        service.start_training().unwrap();
        service.cancel_training();

        assert_eq!(service.wait_for_training().await, TrainingStatus::Cancelled);
        assert!(!model_exists(&model_dir));
        assert!(matches!(
            service.predict(&solid_png(8, 8, [0, 0, 0])),
            Err(LoafError::ModelNotTrained)
        ));
    }

    #[tokio::test]
    async fn panicking_training_thread_is_reported_as_failed() {
        let status = Arc::new(Mutex::new(TrainingStatus::Running {
            epoch: 0,
            total_epochs: 10,
            last_loss: None,
        }));
        let task = spawn_tracked(&tokio::runtime::Handle::current(), Arc::clone(&status), || -> Result<TrainingOutcome> {
            panic!("学習中の異常")
        });

        task.await.unwrap();
        let status = status.lock().unwrap().clone();
        assert!(matches!(status, TrainingStatus::Failed { .. }));
        assert!(!status.is_running());
    }

    #[test]
    fn start_training_outside_runtime_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = LoafService::<CpuTrainBackend>::new(test_config(dir.path(), 1), cpu_device());
        assert!(matches!(service.start_training(), Err(LoafError::InvalidConfig(_))));
        assert_eq!(service.training_status(), TrainingStatus::Idle);
    }

    /// 8 と 3 の2群を既定の学習設定で学習し、それぞれ元の評価の近くに戻ることを確認する
    #[test]
    fn trained_model_separates_two_ratings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 1);
        config.training = TrainingSettings::default();
        let service = LoafService::<CpuTrainBackend>::new(config, cpu_device());
        fill_store(&service, 5);

        let outcome = service.train().unwrap();
        assert_eq!(outcome.epochs.len(), 10);

        let high = service.predict(&solid_png(48, 40, [240, 202, 150])).unwrap().score;
        assert!((5..=10).contains(&high), "bucket 8 score = {}", high);

        let low = service.predict(&solid_png(48, 40, [30, 22, 60])).unwrap().score;
        assert!(low.abs_diff(3) < low.abs_diff(8), "bucket 3 score = {}", low);
    }
}
