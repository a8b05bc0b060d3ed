//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラスラベル、構造、入力サイズなど）
//! - model.bin       - モデルの重み（バイナリ）

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先のパスを決定（.gzで終わらない場合は.tar.gzを付ける）
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 実際に書き込んだパスを返します。
pub fn save_model_with_metadata(output_path: &Path, metadata: &ModelMetadata, model_binary: &[u8]) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path).map_err(|e| PipelineError::io(&tar_gz_path, e))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())
        .map_err(|e| PipelineError::io(&tar_gz_path, e))?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary).map_err(|e| PipelineError::io(&tar_gz_path, e))?;

    // gzipの末尾まで書き切る
    let encoder = tar_builder.into_inner().map_err(|e| PipelineError::io(&tar_gz_path, e))?;
    encoder.finish().map_err(|e| PipelineError::io(&tar_gz_path, e))?;

    info!("モデルを保存しました: {}", tar_gz_path.display());
    Ok(tar_gz_path)
}

/// アーカイブを走査し、名前が一致したエントリを読み込む
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
    if !tar_gz_path.exists() {
        return Err(PipelineError::NotFound(tar_gz_path.to_path_buf()));
    }
    let tar_gz_file = File::open(tar_gz_path).map_err(|e| PipelineError::io(tar_gz_path, e))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut found = vec![None; wanted.len()];
    let entries = archive.entries().map_err(|e| PipelineError::io(tar_gz_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| PipelineError::io(tar_gz_path, e))?;
        let name = entry
            .path()
            .map_err(|e| PipelineError::io(tar_gz_path, e))?
            .to_string_lossy()
            .into_owned();

        if let Some(slot) = wanted.iter().position(|w| *w == name) {
            let mut buffer = Vec::new();
            entry
                .read_to_end(&mut buffer)
                .map_err(|e| PipelineError::io(tar_gz_path, e))?;
            found[slot] = Some(buffer);
        }
    }
    Ok(found)
}

fn parse_metadata(bytes: Vec<u8>) -> Result<ModelMetadata> {
    let json_str = String::from_utf8(bytes)
        .map_err(|_| PipelineError::InvalidModel("metadata.json is not valid UTF-8".to_string()))?;
    ModelMetadata::from_json_string(&json_str)
}

fn missing(name: &str) -> PipelineError {
    PipelineError::InvalidModel(format!("{} not found in tar.gz archive", name))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut found = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    match found.pop().flatten() {
        Some(bytes) => parse_metadata(bytes),
        None => Err(missing(METADATA_ENTRY)),
    }
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut found = read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])?.into_iter();
    let metadata = found.next().flatten();
    let binary = found.next().flatten();

    match (metadata, binary) {
        (Some(metadata), Some(binary)) => Ok((parse_metadata(metadata)?, binary)),
        (None, _) => Err(missing(METADATA_ENTRY)),
        (_, None) => Err(missing(MODEL_ENTRY)),
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラスラベル: {}", metadata.class_labels.join(", "));
    println!("アーキテクチャ: {}", metadata.architecture);
    println!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    println!("学習エポック数: {}", metadata.num_epochs);
    println!("バッチサイズ: {}", metadata.batch_size);
    println!("学習率: {}", metadata.learning_rate);
    println!("シード: {}", metadata.seed);
    println!("学習サンプル数: {}", metadata.train_samples);
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Architecture, LabelKeyMap};
    use tempfile::TempDir;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(
            &LabelKeyMap::from_labels(["cat", "dog"]),
            Architecture::CompactCnn,
            64,
            3,
            4,
            0.01,
            1,
            10,
        )
    }

    #[test]
    fn test_archive_path_appends_extension() {
        assert_eq!(archive_path(Path::new("models/m")), PathBuf::from("models/m.tar.gz"));
        assert_eq!(archive_path(Path::new("models/m.tar.gz")), PathBuf::from("models/m.tar.gz"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let weights = vec![1u8, 2, 3, 4, 5];
        let saved = save_model_with_metadata(&dir.path().join("out/model"), &metadata(), &weights).unwrap();
        assert!(saved.ends_with("out/model.tar.gz"));

        let (loaded, binary) = load_model_with_metadata(&saved).unwrap();
        assert_eq!(loaded.class_labels, vec!["cat", "dog"]);
        assert_eq!(loaded.architecture, Architecture::CompactCnn);
        assert_eq!(binary, weights);
        assert_eq!(load_metadata(&saved).unwrap(), loaded);
    }

    #[test]
    fn test_missing_archive() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_metadata(&dir.path().join("none.tar.gz")),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_archive_without_weights() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.tar.gz");
        {
            let file = File::create(&path).unwrap();
            let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
            let json = metadata().to_json_string().unwrap();
            append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        assert!(load_metadata(&path).is_ok());
        match load_model_with_metadata(&path) {
            Err(PipelineError::InvalidModel(msg)) => assert!(msg.contains("model.bin")),
            other => panic!("unexpected result: {:?}", other.map(|(m, _)| m)),
        }
    }
}
