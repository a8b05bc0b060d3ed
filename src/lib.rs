//! 転移学習による画像分類パイプライン
//!
//! 画像フォルダの走査、データセットの組み立てと分割、バックボーンの学習、
//! 評価、フォルダ単位の推論を順に実行します。

#![recursion_limit = "256"]

pub mod error;
pub mod logging;
pub mod types;

// パイプライン本体（学習器に依存しない）
pub mod pipeline;
pub mod model;
#[cfg(feature = "ml")]
pub mod ml;

pub use error::{PipelineError, Result};
pub use model::{AppConfig, DeviceType};
pub use pipeline::{
    run, Architecture, BackboneTrainer, ClassScorer, Dataset, EvaluationMetrics, FittedPipeline, LabelKeyMap,
    RunOptions, RunOutcome, TrainingConfig,
};
pub use types::{EpochMetrics, ImageRecord, InMemoryImage, LabeledSample, PredictionRecord};
