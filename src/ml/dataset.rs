//! 学習データセット
//!
//! 画像ストアの各バケットを走査し、全画像を前処理してメモリ上に保持します。
//! ミニバッチへの分割は `LoafBatcher` が行います。

use std::collections::BTreeMap;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use tracing::{info, warn};

use crate::error::{LoafError, Result};
use crate::ml::preprocess::Preprocessor;
use crate::store::ImageStore;
use crate::types::{Bucket, LabelScheme};

/// 学習ターゲット
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoafLabel {
    /// 評価値 / 10
    Score(f32),
    /// クラスID
    Class(usize),
}

impl LoafLabel {
    pub fn from_bucket(bucket: &Bucket) -> Self {
        match bucket {
            Bucket::Rating(rating) => LoafLabel::Score(rating.normalized()),
            Bucket::Category(category) => LoafLabel::Class(category.index()),
        }
    }
}

/// データセットアイテム（前処理済み画像とラベル）
#[derive(Clone, Debug)]
pub struct LoafItem {
    /// (C, H, W) 順の画素値
    pub pixels: Vec<f32>,
    pub label: LoafLabel,
}

/// 学習データセット（全画像をメモリ上に保持）
pub struct LoafDataset {
    items: Vec<LoafItem>,
    scheme: LabelScheme,
    image_size: usize,
    bucket_counts: BTreeMap<Bucket, usize>,
}

impl LoafDataset {
    pub fn scheme(&self) -> LabelScheme {
        self.scheme
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// バケットごとの読み込み枚数
    pub fn bucket_counts(&self) -> &BTreeMap<Bucket, usize> {
        &self.bucket_counts
    }
}

impl Dataset<LoafItem> for LoafDataset {
    fn get(&self, index: usize) -> Option<LoafItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// 画像ストアから学習データを読み込む
///
/// デコードできない画像は警告を出してスキップします。
/// 1枚も読み込めなかった場合は `EmptyDataset` を返します。
pub fn load_dataset(store: &ImageStore, preprocessor: &Preprocessor) -> Result<LoafDataset> {
    info!("データセットを読み込んでいます: {}", store.root().display());

    let mut items = Vec::new();
    let mut bucket_counts = BTreeMap::new();

    for (bucket, paths) in store.list_by_bucket()? {
        let label = LoafLabel::from_bucket(&bucket);
        let mut count = 0;

        for path in paths {
            let bytes = std::fs::read(&path).map_err(|e| LoafError::storage(&path, e))?;
            match preprocessor.preprocess(&bytes) {
                Ok(image) => {
                    items.push(LoafItem {
                        pixels: image.data,
                        label,
                    });
                    count += 1;
                }
                Err(e) => {
                    warn!("画像をスキップします {}: {}", path.display(), e);
                }
            }
        }

        info!("  バケット '{}': {} 枚", bucket, count);
        bucket_counts.insert(bucket, count);
    }

    if items.is_empty() {
        return Err(LoafError::EmptyDataset {
            root: store.root().to_path_buf(),
        });
    }

    info!("{} 枚の画像を読み込みました", items.len());
    Ok(LoafDataset {
        items,
        scheme: store.scheme(),
        image_size: preprocessor.size(),
        bucket_counts,
    })
}

/// バッチのターゲット
#[derive(Clone, Debug)]
pub enum LoafTargets<B: Backend> {
    /// [batch_size, 1]
    Scores(Tensor<B, 2>),
    /// [batch_size]
    Classes(Tensor<B, 1, Int>),
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LoafBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: LoafTargets<B>,
}

/// バッチャー
#[derive(Clone)]
pub struct LoafBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    scheme: LabelScheme,
}

impl<B: Backend> LoafBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, scheme: LabelScheme) -> Self {
        Self {
            device,
            image_size,
            scheme,
        }
    }
}

impl<B: Backend> Batcher<B, LoafItem, LoafBatch<B>> for LoafBatcher<B> {
    fn batch(&self, items: Vec<LoafItem>, _device: &B::Device) -> LoafBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut scores = Vec::with_capacity(batch_size);
        let mut classes = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            match item.label {
                LoafLabel::Score(score) => scores.push(score),
                LoafLabel::Class(class) => classes.push(class as i64),
            }
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);

        let targets = match self.scheme {
            LabelScheme::Regression => LoafTargets::Scores(
                Tensor::<B, 1>::from_floats(scores.as_slice(), &self.device).reshape([batch_size, 1]),
            ),
            LabelScheme::Classification => {
                LoafTargets::Classes(Tensor::<B, 1, Int>::from_ints(classes.as_slice(), &self.device))
            }
        };

        LoafBatch { images, targets }
    }
}
