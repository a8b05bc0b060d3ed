//! 画像分類パイプラインの段取り
//!
//! scan → assemble → split → train → evaluate → predict の順に、
//! 前段の出力が揃ってから次段を実行します。

pub mod assembler;
pub mod catalog;
pub mod evaluator;
pub mod orchestrator;
pub mod predictor;
pub mod report;
pub mod splitter;

use std::path::PathBuf;

use tracing::info;

use crate::error::{PipelineError, Result};
use crate::types::{EpochMetrics, PredictionRecord};

pub use assembler::{Dataset, DatasetAssembler, LabelKeyMap};
pub use catalog::{scan, ImageCatalog, LabelMode};
pub use evaluator::{evaluate, EvaluationMetrics};
pub use orchestrator::{
    Architecture, BackboneTrainer, ClassScorer, FittedPipeline, Prediction, TrainingConfig,
    TrainingOrchestrator,
};
pub use predictor::{load_images, predict_all};
pub use splitter::Splitter;

/// 1回の実行に必要な設定
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub image_folder: PathBuf,
    pub use_folder_name_as_label: bool,
    pub test_fraction: f64,
    pub seed: u64,
    pub architecture: Architecture,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// 推論対象フォルダ（未指定なら推論を行わない）
    pub predict_folder: Option<PathBuf>,
}

/// 実行結果
pub struct RunOutcome {
    pub pipeline: FittedPipeline,
    pub metrics: EvaluationMetrics,
    pub predictions: Vec<PredictionRecord>,
    pub train_len: usize,
    pub test_len: usize,
}

/// パイプライン全体を実行
pub fn run(
    options: &RunOptions,
    trainer: &dyn BackboneTrainer,
    on_epoch_metrics: impl FnMut(&EpochMetrics),
) -> Result<RunOutcome> {
    // 分割比率は読み込み前に検証する
    let splitter = Splitter::new(options.test_fraction, options.seed)?;

    let records = catalog::collect_records(&options.image_folder, options.use_folder_name_as_label)?;
    info!("{} images found under {}", records.len(), options.image_folder.display());

    let dataset = DatasetAssembler::new(options.seed).assemble(records)?;
    let (train_set, test_set) = splitter.split(dataset);
    if train_set.is_empty() || test_set.is_empty() {
        return Err(PipelineError::Config(format!(
            "split of {} images with test fraction {} leaves {} for training and {} for evaluation",
            train_set.len() + test_set.len(),
            options.test_fraction,
            train_set.len(),
            test_set.len()
        )));
    }

    let config = TrainingConfig::new(options.architecture)
        .with_epochs(options.epochs)
        .with_batch_size(options.batch_size)
        .with_learning_rate(options.learning_rate)
        .with_validation_set(&test_set)
        .with_seed(options.seed)
        .on_epoch_metrics(on_epoch_metrics);

    let pipeline = TrainingOrchestrator::new(trainer).train(&train_set, config)?;

    let metrics = evaluate(&pipeline, &test_set)?;

    let predictions = match &options.predict_folder {
        Some(folder) => {
            let images = load_images(folder)?;
            predict_all(&pipeline, &images)?
        }
        None => Vec::new(),
    };

    Ok(RunOutcome {
        pipeline,
        metrics,
        predictions,
        train_len: train_set.len(),
        test_len: test_set.len(),
    })
}
