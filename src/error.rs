//! エラー定義

use std::path::PathBuf;

/// ライブラリ全体で使用するエラー
#[derive(Debug, thiserror::Error)]
pub enum LoafError {
    /// 画像としてデコードできない（対象の1枚だけを拒否する）
    #[error("画像のデコードに失敗しました: {0}")]
    Decode(#[from] image::ImageError),

    /// 学習データが1枚も見つからない（学習は中断される）
    #[error("学習データが見つかりません: {root}")]
    EmptyDataset { root: PathBuf },

    /// 学習済みモデルがまだ存在しない
    #[error("モデルが学習されていません。先に学習を実行してください")]
    ModelNotTrained,

    /// ディスクの読み書きに失敗
    #[error("ストレージエラー ({path}): {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("不正なラベル: {0}")]
    InvalidLabel(String),

    #[error("不正な設定: {0}")]
    InvalidConfig(String),

    /// 保存されたモデルアーカイブが壊れている
    #[error("モデルアーカイブが不正です: {0}")]
    Archive(String),

    #[error("学習に失敗しました: {0}")]
    Training(String),

    #[error("推論に失敗しました: {0}")]
    Inference(String),

    #[error("学習がキャンセルされました")]
    Cancelled,

    #[error("学習はすでに実行中です")]
    TrainingInProgress,
}

impl LoafError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

impl serde::Serialize for LoafError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub type Result<T> = std::result::Result<T, LoafError>;
