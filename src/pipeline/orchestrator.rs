//! 学習の段取り
//!
//! 数値最適化そのものは [`BackboneTrainer`] に委譲し、ここでは
//! 設定の検証、学習ターゲット（ラベルキー）の受け渡し、
//! 学習後のキー→ラベル逆変換ステージの付与を担当します。

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::assembler::{Dataset, LabelKeyMap};
use crate::types::EpochMetrics;

/// 転移学習に使うバックボーン
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// ImageNet事前学習済みMobileNetV2（重みファイルが必要）
    #[default]
    MobilenetV2,
    /// 3層の小型CNN（事前学習なし）
    CompactCnn,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::MobilenetV2 => write!(f, "MobilenetV2"),
            Architecture::CompactCnn => write!(f, "CompactCnn"),
        }
    }
}

impl std::str::FromStr for Architecture {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mobilenetv2" | "mobilenet_v2" | "mobilenet-v2" => Ok(Architecture::MobilenetV2),
            "compactcnn" | "compact_cnn" | "compact-cnn" | "compact" => Ok(Architecture::CompactCnn),
            other => Err(PipelineError::Config(format!("unknown architecture '{}'", other))),
        }
    }
}

/// エポックごとに同期的に呼ばれるコールバック
pub type EpochCallback<'a> = Box<dyn FnMut(&EpochMetrics) + 'a>;

/// 学習設定（1回の学習で消費される）
pub struct TrainingConfig<'a> {
    pub architecture: Architecture,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// エポック毎の検証に使うデータ（通常は評価用データ）
    pub validation_set: Option<&'a Dataset>,
    pub on_epoch_metrics: EpochCallback<'a>,
    /// ミニバッチ順序のシャッフルに使うシード
    pub seed: u64,
}

impl<'a> TrainingConfig<'a> {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            epochs: 50,
            batch_size: 10,
            learning_rate: 0.01,
            validation_set: None,
            on_epoch_metrics: Box::new(|_: &EpochMetrics| {}),
            seed: 1,
        }
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_validation_set(mut self, validation_set: &'a Dataset) -> Self {
        self.validation_set = Some(validation_set);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn on_epoch_metrics(mut self, callback: impl FnMut(&EpochMetrics) + 'a) -> Self {
        self.on_epoch_metrics = Box::new(callback);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(PipelineError::Config("epochs must be greater than 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch size must be greater than 0".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(PipelineError::Config(format!(
                "learning rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// 学習済みモデルのスコア計算
pub trait ClassScorer {
    /// 出力クラス数
    fn num_classes(&self) -> usize;

    /// 画像バイト列ごとのクラス確率（キー順）
    fn score(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>>;

    /// 重みをバイト列として書き出す
    fn export_weights(&self) -> Result<Vec<u8>> {
        Err(PipelineError::Dependency(
            "this scorer cannot export its weights".to_string(),
        ))
    }
}

/// 外部の学習器（事前学習済みバックボーンの微調整）
pub trait BackboneTrainer {
    /// `train_set` の `label_key` を学習ターゲットとして学習する
    ///
    /// エポック終了毎に `config.on_epoch_metrics` を同期的に呼び出し、完了までブロックします。
    fn fit(&self, train_set: &Dataset, config: &mut TrainingConfig<'_>) -> Result<Box<dyn ClassScorer>>;
}

/// 1画像の推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub scores: Vec<f32>,
    pub predicted_key: usize,
    pub predicted_label: String,
}

/// 学習済みパイプライン
///
/// ラベル→キー対応表、学習済みスコア計算器、キー→ラベル逆変換を保持します。
/// 作成後は読み取り専用です。
pub struct FittedPipeline {
    scorer: Box<dyn ClassScorer>,
    label_map: LabelKeyMap,
    key_to_label: Vec<String>,
}

impl FittedPipeline {
    /// スコア計算器とラベル対応表からパイプラインを組み立てる
    pub fn from_parts(scorer: Box<dyn ClassScorer>, label_map: LabelKeyMap) -> Result<Self> {
        if scorer.num_classes() != label_map.len() {
            return Err(PipelineError::InvalidModel(format!(
                "scorer has {} classes but label map has {}",
                scorer.num_classes(),
                label_map.len()
            )));
        }
        let key_to_label = label_map.labels().to_vec();
        Ok(Self {
            scorer,
            label_map,
            key_to_label,
        })
    }

    pub fn label_map(&self) -> &LabelKeyMap {
        &self.label_map
    }

    pub fn num_classes(&self) -> usize {
        self.key_to_label.len()
    }

    pub fn scorer(&self) -> &dyn ClassScorer {
        self.scorer.as_ref()
    }

    /// キー→ラベル逆変換
    pub fn label_for_key(&self, key: usize) -> Option<&str> {
        self.key_to_label.get(key).map(String::as_str)
    }

    /// 複数画像のスコアを計算
    pub fn score_batch(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>> {
        let scores = self.scorer.score(images)?;
        if scores.len() != images.len() {
            return Err(PipelineError::Training(format!(
                "scorer returned {} results for {} images",
                scores.len(),
                images.len()
            )));
        }
        if let Some(bad) = scores.iter().find(|s| s.len() != self.num_classes()) {
            return Err(PipelineError::Training(format!(
                "scorer returned {} scores, expected {}",
                bad.len(),
                self.num_classes()
            )));
        }
        Ok(scores)
    }

    /// 1画像を推論
    pub fn predict(&self, image: &[u8]) -> Result<Prediction> {
        let mut scores = self.score_batch(&[image])?;
        let scores = scores.pop().unwrap_or_default();
        let predicted_key = argmax(&scores);
        let predicted_label = self
            .label_for_key(predicted_key)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Training(format!("predicted key {} is out of range", predicted_key)))?;
        Ok(Prediction {
            scores,
            predicted_key,
            predicted_label,
        })
    }
}

/// 最大スコアのインデックス（同値は先頭を採用）
pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// 学習の段取りを行う
pub struct TrainingOrchestrator<'t> {
    trainer: &'t dyn BackboneTrainer,
}

impl<'t> TrainingOrchestrator<'t> {
    pub fn new(trainer: &'t dyn BackboneTrainer) -> Self {
        Self { trainer }
    }

    /// 学習を実行してパイプラインを作成
    pub fn train(&self, train_set: &Dataset, mut config: TrainingConfig<'_>) -> Result<FittedPipeline> {
        config.validate()?;

        if train_set.is_empty() {
            return Err(PipelineError::Config("training set is empty".to_string()));
        }

        let num_classes = train_set.num_classes();
        if let Some(sample) = train_set.samples().iter().find(|s| s.label_key >= num_classes) {
            return Err(PipelineError::Config(format!(
                "label key {} of '{}' is outside the label map ({} classes)",
                sample.label_key,
                sample.image_path.display(),
                num_classes
            )));
        }
        if let Some(validation) = config.validation_set {
            if validation.label_map() != train_set.label_map() {
                return Err(PipelineError::Config(
                    "validation set uses a different label map".to_string(),
                ));
            }
        }

        info!(
            "学習を開始します: {} / エポック数: {}, バッチサイズ: {}, 学習率: {}",
            config.architecture, config.epochs, config.batch_size, config.learning_rate
        );

        let scorer = self.trainer.fit(train_set, &mut config)?;

        // 逆変換ステージを付与
        let pipeline = FittedPipeline::from_parts(scorer, train_set.label_map().clone())?;
        info!("学習完了: {} クラス", pipeline.num_classes());
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LabeledSample;
    use std::cell::RefCell;
    use std::path::PathBuf;

    /// 画像の先頭バイトをクラスキーとみなすスコア計算器
    struct FirstByteScorer {
        classes: usize,
    }

    impl ClassScorer for FirstByteScorer {
        fn num_classes(&self) -> usize {
            self.classes
        }

        fn score(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>> {
            Ok(images
                .iter()
                .map(|img| {
                    let hot = img.first().copied().unwrap_or(0) as usize % self.classes;
                    (0..self.classes).map(|k| if k == hot { 0.9 } else { 0.1 / (self.classes - 1) as f32 }).collect()
                })
                .collect())
        }
    }

    struct StubTrainer;

    impl BackboneTrainer for StubTrainer {
        fn fit(&self, train_set: &Dataset, config: &mut TrainingConfig<'_>) -> Result<Box<dyn ClassScorer>> {
            for epoch in 1..=config.epochs {
                (config.on_epoch_metrics)(&EpochMetrics {
                    epoch,
                    total_epochs: config.epochs,
                    train_loss: 1.0 / epoch as f64,
                    train_accuracy: 0.5,
                    validation_loss: None,
                    validation_accuracy: None,
                    learning_rate: config.learning_rate,
                    batches_processed: train_set.len().div_ceil(config.batch_size),
                });
            }
            Ok(Box::new(FirstByteScorer {
                classes: train_set.num_classes(),
            }))
        }
    }

    fn dataset() -> Dataset {
        let labels = LabelKeyMap::from_labels(["mask", "nomask"]);
        let samples = (0..4)
            .map(|i| LabeledSample {
                image_path: PathBuf::from(format!("{}.png", i)),
                label: labels.label_of(i % 2).unwrap().to_string(),
                label_key: i % 2,
                image_bytes: vec![(i % 2) as u8],
            })
            .collect();
        Dataset::new(samples, labels)
    }

    #[test]
    fn test_callback_called_once_per_epoch_in_order() {
        let data = dataset();
        let seen = RefCell::new(Vec::new());
        let config = TrainingConfig::new(Architecture::CompactCnn)
            .with_epochs(3)
            .with_batch_size(2)
            .on_epoch_metrics(|m| seen.borrow_mut().push(m.epoch));

        let pipeline = TrainingOrchestrator::new(&StubTrainer).train(&data, config).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
        assert_eq!(pipeline.num_classes(), 2);
    }

    #[test]
    fn test_pipeline_outputs_label_strings() {
        let data = dataset();
        let pipeline = TrainingOrchestrator::new(&StubTrainer)
            .train(&data, TrainingConfig::new(Architecture::CompactCnn).with_epochs(1))
            .unwrap();

        let prediction = pipeline.predict(&[1]).unwrap();
        assert_eq!(prediction.predicted_key, 1);
        assert_eq!(prediction.predicted_label, "nomask");
        assert_eq!(prediction.scores.len(), 2);

        for key in 0..pipeline.num_classes() {
            let label = pipeline.label_for_key(key).unwrap();
            assert_eq!(pipeline.label_map().key_of(label), Some(key));
        }
    }

    #[test]
    fn test_invalid_training_config_is_rejected() {
        let data = dataset();
        let orchestrator = TrainingOrchestrator::new(&StubTrainer);
        let cases = vec![
            TrainingConfig::new(Architecture::CompactCnn).with_epochs(0),
            TrainingConfig::new(Architecture::CompactCnn).with_batch_size(0),
            TrainingConfig::new(Architecture::CompactCnn).with_learning_rate(0.0),
            TrainingConfig::new(Architecture::CompactCnn).with_learning_rate(f64::NAN),
        ];
        for config in cases {
            assert!(matches!(orchestrator.train(&data, config), Err(PipelineError::Config(_))));
        }
    }

    #[test]
    fn test_empty_training_set_is_rejected() {
        let empty = Dataset::new(Vec::new(), LabelKeyMap::from_labels(["a"]));
        let result = TrainingOrchestrator::new(&StubTrainer)
            .train(&empty, TrainingConfig::new(Architecture::CompactCnn));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_from_parts_checks_class_count() {
        let result = FittedPipeline::from_parts(
            Box::new(FirstByteScorer { classes: 3 }),
            LabelKeyMap::from_labels(["a", "b"]),
        );
        assert!(matches!(result, Err(PipelineError::InvalidModel(_))));
    }

    #[test]
    fn test_argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[1.0]), 0);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_architecture_from_str() {
        assert_eq!("MobilenetV2".parse::<Architecture>().unwrap(), Architecture::MobilenetV2);
        assert_eq!("compact".parse::<Architecture>().unwrap(), Architecture::CompactCnn);
        assert!("resnet".parse::<Architecture>().is_err());
        assert_eq!(Architecture::default(), Architecture::MobilenetV2);
    }
}
