use serde::{Deserialize, Serialize};

use crate::error::{LoafError, Result};

/// 評価値の最小値
pub const MIN_RATING: u8 = 1;
/// 評価値の最大値
pub const MAX_RATING: u8 = 10;

/// ラベル方式（1つの画像ストア・1つのモデルで混在させない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LabelScheme {
    /// 1〜10の評価値を [0,1] の連続値として回帰
    #[default]
    Regression,
    /// loaf / not_loaf の2クラス分類
    Classification,
}

impl LabelScheme {
    /// 出力層の幅
    pub fn output_width(&self) -> usize {
        match self {
            LabelScheme::Regression => 1,
            LabelScheme::Classification => 2,
        }
    }

    /// この方式で有効なバケット一覧
    pub fn buckets(&self) -> Vec<Bucket> {
        match self {
            LabelScheme::Regression => (MIN_RATING..=MAX_RATING)
                .map(|v| Bucket::Rating(Rating(v)))
                .collect(),
            LabelScheme::Classification => Category::ALL
                .iter()
                .map(|c| Bucket::Category(*c))
                .collect(),
        }
    }
}

impl std::fmt::Display for LabelScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelScheme::Regression => write!(f, "regression"),
            LabelScheme::Classification => write!(f, "classification"),
        }
    }
}

/// ルーフ度の評価値（1〜10）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub fn new(value: u8) -> Result<Self> {
        if (MIN_RATING..=MAX_RATING).contains(&value) {
            Ok(Self(value))
        } else {
            Err(LoafError::InvalidLabel(format!(
                "評価値は{}〜{}の範囲で指定してください: {}",
                MIN_RATING, MAX_RATING, value
            )))
        }
    }

    /// 範囲外の値を1〜10に丸める（アップロード時の入力用）
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(MIN_RATING as i64, MAX_RATING as i64) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// 学習ターゲット（評価値 / 10）
    pub fn normalized(&self) -> f32 {
        self.0 as f32 / 10.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = LoafError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// 2クラス分類のカテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Loaf,
    NotLoaf,
}

impl Category {
    /// クラスID順
    pub const ALL: [Category; 2] = [Category::Loaf, Category::NotLoaf];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Category::Loaf => "loaf",
            Category::NotLoaf => "not_loaf",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Category::Loaf => 0,
            Category::NotLoaf => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// 画像ストアの区画（ラベルごと）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Rating(Rating),
    Category(Category),
}

impl Bucket {
    pub fn scheme(&self) -> LabelScheme {
        match self {
            Bucket::Rating(_) => LabelScheme::Regression,
            Bucket::Category(_) => LabelScheme::Classification,
        }
    }

    /// ディスク上のディレクトリ名
    pub fn dir_name(&self) -> String {
        match self {
            Bucket::Rating(rating) => rating.value().to_string(),
            Bucket::Category(category) => category.dir_name().to_string(),
        }
    }

    /// ディレクトリ名からバケットを復元（方式に合わない名前はNone）
    pub fn parse(dir_name: &str, scheme: LabelScheme) -> Option<Self> {
        match scheme {
            LabelScheme::Regression => dir_name
                .parse::<u8>()
                .ok()
                .and_then(|v| Rating::new(v).ok())
                .map(Bucket::Rating)
                // "08" や "+8" は別ディレクトリとして扱わない
                .filter(|b| b.dir_name() == dir_name),
            LabelScheme::Classification => Category::ALL
                .iter()
                .find(|c| c.dir_name() == dir_name)
                .map(|c| Bucket::Category(*c)),
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}
