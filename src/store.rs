//! 画像ストア
//!
//! アップロードされた画像をラベル（バケット）ごとのディレクトリに保存します。
//!
//! ディレクトリ構成:
//! - 回帰: `<root>/1` 〜 `<root>/10`
//! - 分類: `<root>/loaf`, `<root>/not_loaf`

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use image::ImageFormat;
use tracing::{debug, warn};

use crate::error::{LoafError, Result};
use crate::ml::preprocess::Preprocessor;
use crate::types::{Bucket, LabelScheme};

/// 一時ファイル名の連番（プロセス内で一意）
static UPLOAD_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
    scheme: LabelScheme,
    preprocessor: Preprocessor,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>, scheme: LabelScheme) -> Self {
        Self {
            root: root.into(),
            scheme,
            preprocessor: Preprocessor::default(),
        }
    }

    /// 保存時のリサイズ後サイズを指定
    pub fn with_image_size(mut self, size: usize) -> Self {
        self.preprocessor = Preprocessor::new(size);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scheme(&self) -> LabelScheme {
        self.scheme
    }

    pub fn bucket_dir(&self, bucket: &Bucket) -> PathBuf {
        self.root.join(bucket.dir_name())
    }

    /// 画像を保存して保存先パスを返す
    ///
    /// 画像はリサイズ後JPEGとして書き込まれます。一時ファイルに書いてから最終名にリンクするため、
    /// 書き込み途中のファイルが一覧や学習データに現れることはありません。
    pub fn store(&self, bytes: &[u8], bucket: Bucket) -> Result<PathBuf> {
        if bucket.scheme() != self.scheme {
            return Err(LoafError::InvalidLabel(format!(
                "バケット '{}' は {} 方式のストアには保存できません",
                bucket, self.scheme
            )));
        }

        let img = self.preprocessor.decode_resized(bytes)?;

        let dir = self.bucket_dir(&bucket);
        fs::create_dir_all(&dir).map_err(|e| LoafError::storage(&dir, e))?;

        let tmp_path = dir.join(format!(
            ".upload-{}-{}.tmp",
            std::process::id(),
            UPLOAD_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = img
            .save_with_format(&tmp_path, ImageFormat::Jpeg)
            .map_err(|e| match e {
                image::ImageError::IoError(err) => LoafError::storage(&tmp_path, err),
                other => LoafError::Decode(other),
            })
            .and_then(|()| publish(&tmp_path, &dir, &bucket));
        fs::remove_file(&tmp_path).ok();
        let path = written?;

        debug!("画像を保存しました: {}", path.display());
        Ok(path)
    }

    /// バケットごとの保存画像一覧（ファイル名順）
    pub fn list_by_bucket(&self) -> Result<BTreeMap<Bucket, Vec<PathBuf>>> {
        let mut buckets = BTreeMap::new();

        if !self.root.exists() {
            return Ok(buckets);
        }

        let entries = fs::read_dir(&self.root).map_err(|e| LoafError::storage(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LoafError::storage(&self.root, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(bucket) = Bucket::parse(name, self.scheme) else {
                warn!("不明なディレクトリを無視します: {}", path.display());
                continue;
            };

            buckets.insert(bucket, list_images(&path)?);
        }

        Ok(buckets)
    }
}

/// 一時ファイルを最終名で公開する
///
/// ハードリンクは既存ファイルを上書きしないため、同一ミリ秒の保存が重なっても
/// 連番で別名になります。
fn publish(tmp_path: &Path, dir: &Path, bucket: &Bucket) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
    let base = format!("loaf_{}_{}", bucket.dir_name(), stamp);

    let mut suffix = 0;
    loop {
        let name = if suffix == 0 {
            format!("{}.jpg", base)
        } else {
            format!("{}_{}.jpg", base, suffix)
        };
        let path = dir.join(name);
        match fs::hard_link(tmp_path, &path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(LoafError::storage(&path, e)),
        }
    }
}

/// 隠しファイル以外の通常ファイル（画像かどうかはデコード時に判定）
fn is_candidate_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    !hidden && path.is_file()
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| LoafError::storage(dir, e))? {
        let entry = entry.map_err(|e| LoafError::storage(dir, e))?;
        let path = entry.path();
        if is_candidate_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::preprocess::tests::solid_png;
    use crate::types::{Category, Rating};

    #[test]
    fn store_then_list_every_rating() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Regression).with_image_size(16);

        let mut stored = Vec::new();
        for v in 1..=10u8 {
            let bucket = Bucket::Rating(Rating::new(v).unwrap());
            let path = store.store(&solid_png(20, 20, [v * 20, 0, 0]), bucket).unwrap();
            assert!(path.starts_with(store.bucket_dir(&bucket)));
            stored.push((bucket, path));
        }

        let listing = store.list_by_bucket().unwrap();
        assert_eq!(listing.len(), 10);
        for (bucket, path) in stored {
            let files = &listing[&bucket];
            assert_eq!(files.iter().filter(|p| **p == path).count(), 1);
        }
    }

    #[test]
    fn rapid_uploads_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Regression).with_image_size(8);
        let bucket = Bucket::Rating(Rating::new(8).unwrap());

        for _ in 0..5 {
            store.store(&solid_png(8, 8, [1, 2, 3]), bucket).unwrap();
        }

        let listing = store.list_by_bucket().unwrap();
        assert_eq!(listing[&bucket].len(), 5);
    }

    #[test]
    fn stored_image_is_resized() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Regression).with_image_size(12);
        let path = store
            .store(&solid_png(50, 30, [0, 255, 0]), Bucket::Rating(Rating::new(3).unwrap()))
            .unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (12, 12));
    }

    #[test]
    fn rejects_bucket_of_other_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Regression);
        let err = store
            .store(&solid_png(8, 8, [0, 0, 0]), Bucket::Category(Category::Loaf))
            .unwrap_err();
        assert!(matches!(err, LoafError::InvalidLabel(_)));
    }

    #[test]
    fn rejects_undecodable_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Classification);
        let err = store
            .store(b"definitely not a jpeg", Bucket::Category(Category::NotLoaf))
            .unwrap_err();
        assert!(matches!(err, LoafError::Decode(_)));
        assert!(store.list_by_bucket().unwrap().is_empty());
    }

    #[test]
    fn listing_ignores_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Regression);
        fs::create_dir_all(dir.path().join("loaf")).unwrap();
        fs::create_dir_all(dir.path().join("5")).unwrap();
        fs::write(dir.path().join("5").join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("5").join(".half.jpg.tmp"), "x").unwrap();

        let listing = store.list_by_bucket().unwrap();
        assert_eq!(listing.len(), 1);
        // 非画像ファイルは学習データの読み込み時にスキップされる
        assert_eq!(
            listing[&Bucket::Rating(Rating::new(5).unwrap())],
            vec![dir.path().join("5").join("notes.txt")]
        );
    }

    #[test]
    fn zero_padded_directory_does_not_shadow_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Regression).with_image_size(8);
        let bucket = Bucket::Rating(Rating::new(8).unwrap());
        let path = store.store(&solid_png(8, 8, [9, 9, 9]), bucket).unwrap();
        fs::create_dir_all(dir.path().join("08")).unwrap();
        fs::create_dir_all(dir.path().join("+8")).unwrap();

        let listing = store.list_by_bucket().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[&bucket], vec![path]);
    }

    #[test]
    fn concurrent_uploads_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), LabelScheme::Regression).with_image_size(8);
        let bucket = Bucket::Rating(Rating::new(6).unwrap());
        let png = solid_png(8, 8, [40, 50, 60]);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..3 {
                        store.store(&png, bucket).unwrap();
                    }
                });
            }
        });

        let listing = store.list_by_bucket().unwrap();
        assert_eq!(listing[&bucket].len(), 24);
        let leftovers = fs::read_dir(store.bucket_dir(&bucket))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("nope"), LabelScheme::Regression);
        assert!(store.list_by_bucket().unwrap().is_empty());
    }
}
