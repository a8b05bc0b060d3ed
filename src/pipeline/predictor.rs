//! バッチ推論

use std::path::Path;

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::assembler::read_image_bytes;
use crate::pipeline::catalog::has_image_extension;
use crate::pipeline::orchestrator::FittedPipeline;
use crate::types::{InMemoryImage, PredictionRecord};

/// フォルダ直下の画像をメモリに読み込む（サブフォルダは対象外、ファイル名順）
pub fn load_images(dir: &Path) -> Result<Vec<InMemoryImage>> {
    if !dir.is_dir() {
        return Err(PipelineError::NotFound(dir.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let path = entry.path();
        if path.is_file() && has_image_extension(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = read_image_bytes(&path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        images.push(InMemoryImage::new(bytes, file_name));
    }

    debug!("Loaded {} images for prediction from {}", images.len(), dir.display());
    Ok(images)
}

/// 画像ごとに1件ずつ推論（入力順を保持）
pub fn predict_all(pipeline: &FittedPipeline, images: &[InMemoryImage]) -> Result<Vec<PredictionRecord>> {
    images
        .iter()
        .map(|image| {
            let prediction = pipeline.predict(&image.bytes)?;
            Ok(PredictionRecord {
                image_file_name: image.file_name.clone(),
                scores: prediction.scores,
                predicted_label: prediction.predicted_label,
            })
        })
        .collect()
}
