//! 機械学習モデルの共通定義
//!
//! ルーフ度推定用のCNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::{CrossEntropyLossConfig, MseLoss, Reduction},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::{ClassificationOutput, RegressionOutput},
};

use crate::error::{LoafError, Result};
use crate::types::LabelScheme;

/// 全結合隠れ層のユニット数
pub const HIDDEN_UNITS: usize = 128;

/// 入力画像の最小サイズ
pub const MIN_IMAGE_SIZE: usize = 10;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// ラベル方式（出力層の形が決まる）
    pub label_scheme: LabelScheme,
    /// 入力画像サイズ（正方形）
    #[config(default = 128)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 特徴抽出部の出力サイズ
    ///
    /// - Conv (3x3, no padding): size -> size - 2
    /// - Pool (2x2, stride 2): size -> (size - 2) / 2 + 1
    ///
    /// 入力が小さすぎる場合はNone
    pub fn feature_map_size(&self) -> Option<usize> {
        if self.image_size < MIN_IMAGE_SIZE {
            return None;
        }
        let conv = |n: usize| n.checked_sub(2);
        let pool = |n: usize| n.checked_sub(2).map(|m| m / 2 + 1);

        let after_pool1 = conv(self.image_size).and_then(pool)?;
        let after_pool2 = conv(after_pool1).and_then(pool)?;
        (after_pool2 > 0).then_some(after_pool2)
    }

    /// モデルを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<LoafNet<B>> {
        let feature_map_size = self.feature_map_size().ok_or_else(|| {
            LoafError::InvalidConfig(format!(
                "入力サイズが小さすぎます: {} (最小{}x{}が必要)",
                self.image_size, MIN_IMAGE_SIZE, MIN_IMAGE_SIZE
            ))
        })?;

        // 特徴次元 d = 64チャネル * feature_map_size * feature_map_size
        let d = 64 * feature_map_size * feature_map_size;

        Ok(LoafNet {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.label_scheme.output_width()).init(device),
            activation: Relu::new(),
        })
    }
}

/// ルーフ度推定用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 2層 (32, 64チャネル)
/// - Flatten
/// - FC: d -> 128 + ReLU
/// - FC: 128 -> 1 (回帰、恒等出力) または 2 (分類、softmaxは損失/推論側で適用)
#[derive(Module, Debug)]
pub struct LoafNet<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,

    fc1: Linear<B>, // d -> 128
    fc2: Linear<B>, // 128 -> 出力幅

    activation: Relu,
}

impl<B: Backend> LoafNet<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - [batch_size, 出力幅]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// 順伝播と損失計算（回帰、平均二乗誤差）
    ///
    /// - `targets`: [batch_size, 1]、評価値 / 10
    pub fn forward_regression(&self, images: Tensor<B, 4>, targets: Tensor<B, 2>) -> RegressionOutput<B> {
        let output = self.forward(images);
        let loss = MseLoss::new().forward(output.clone(), targets.clone(), Reduction::Mean);

        RegressionOutput::new(loss, output, targets)
    }

    /// 順伝播と損失計算（分類、交差エントロピー）
    ///
    /// - `targets`: クラスID [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}
