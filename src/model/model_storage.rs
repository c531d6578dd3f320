//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（モデルディレクトリ内）:
//! - loaf_model.tar.gz
//!   - metadata.json   - メタデータ（ラベル方式、入力サイズなど）
//!   - model.bin       - モデルの重み（バイナリ）
//!
//! 保存は一時ファイルへの書き込み後にリネームで置き換えるため、
//! 推論側が書き込み途中のアーカイブを読むことはありません。

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::info;

use crate::error::{LoafError, Result};
use crate::model::model_metadata::ModelMetadata;

/// アーカイブのファイル名
const ARCHIVE_NAME: &str = "loaf_model.tar.gz";
const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// モデルディレクトリ内のアーカイブパス
pub fn archive_path(model_dir: &Path) -> PathBuf {
    model_dir.join(ARCHIVE_NAME)
}

/// 学習済みモデルが存在するか
pub fn model_exists(model_dir: &Path) -> bool {
    archive_path(model_dir).is_file()
}

/// メタデータと共にモデルをTar.gz形式で保存（既存のモデルは置き換え）
pub fn save_model_with_metadata(
    model_dir: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    std::fs::create_dir_all(model_dir).map_err(|e| LoafError::storage(model_dir, e))?;

    let final_path = archive_path(model_dir);
    let tmp_path = model_dir.join(format!(".{}.tmp", ARCHIVE_NAME));

    if let Err(e) = write_archive(&tmp_path, metadata, model_binary) {
        std::fs::remove_file(&tmp_path).ok();
        return Err(e);
    }

    std::fs::rename(&tmp_path, &final_path).map_err(|e| {
        std::fs::remove_file(&tmp_path).ok();
        LoafError::storage(&final_path, e)
    })?;

    info!(
        "モデルを保存しました: {} ({:.2} MB)",
        final_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    Ok(final_path)
}

fn write_archive(path: &Path, metadata: &ModelMetadata, model_binary: &[u8]) -> Result<()> {
    let storage_err = |e: std::io::Error| LoafError::storage(path, e);

    let tar_gz_file = File::create(path).map_err(storage_err)?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata
        .to_json_string()
        .map_err(|e| LoafError::Archive(e.to_string()))?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes()).map_err(storage_err)?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary).map_err(storage_err)?;

    // tarアーカイブを完成させてディスクに反映
    let encoder = tar_builder.into_inner().map_err(storage_err)?;
    let mut file = encoder.finish().map_err(storage_err)?;
    file.flush().map_err(storage_err)?;
    file.sync_all().map_err(storage_err)?;
    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)
}

/// アーカイブからメタデータを読み込む
pub fn load_metadata(model_dir: &Path) -> Result<ModelMetadata> {
    let (metadata, _) = read_archive(model_dir, false)?;
    metadata.ok_or_else(|| LoafError::Archive(format!("{} が見つかりません", METADATA_ENTRY)))
}

/// メタデータとモデルバイナリを共に読み込む
///
/// アーカイブが存在しない場合は `ModelNotTrained` を返します。
pub fn load_model_with_metadata(model_dir: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    match read_archive(model_dir, true)? {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(LoafError::Archive(format!("{} が見つかりません", METADATA_ENTRY))),
        (_, None) => Err(LoafError::Archive(format!("{} が見つかりません", MODEL_ENTRY))),
    }
}

fn read_archive(model_dir: &Path, with_binary: bool) -> Result<(Option<ModelMetadata>, Option<Vec<u8>>)> {
    let path = archive_path(model_dir);
    let tar_gz_file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(LoafError::ModelNotTrained),
        Err(e) => return Err(LoafError::storage(&path, e)),
    };
    let archive_err = |e: std::io::Error| LoafError::Archive(format!("{}: {}", path.display(), e));

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt = None;
    let mut model_binary_opt = None;

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let entry_path = entry.path().map_err(archive_err)?.to_string_lossy().to_string();

        match entry_path.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str).map_err(archive_err)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
                if !with_binary {
                    break;
                }
            }
            MODEL_ENTRY if with_binary => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer).map_err(archive_err)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    Ok((metadata_opt, model_binary_opt))
}

/// メタデータをログに出力
pub fn log_metadata_info(metadata: &ModelMetadata) {
    info!("=== モデルメタデータ ===");
    info!("ラベル方式: {}", metadata.label_scheme);
    info!("クラスラベル: {}", metadata.class_labels.join(", "));
    info!("モデル入力サイズ: {}x{}", metadata.model_input_size, metadata.model_input_size);
    info!("学習エポック数: {}", metadata.num_epochs);
    info!("学習画像数: {}", metadata.num_samples);
    info!("最終損失: {:.6}", metadata.final_loss);
    info!("学習日時: {}", metadata.trained_at);
}
