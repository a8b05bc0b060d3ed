//! 学習器をスタブに置き換えたパイプライン全体の動作確認

use std::cell::Cell;
use std::fs;
use std::path::Path;

use mask_detector_lib::pipeline::{self, report, Architecture, BackboneTrainer, ClassScorer, Dataset, TrainingConfig};
use mask_detector_lib::{EpochMetrics, PipelineError, Result, RunOptions};
use tempfile::TempDir;

/// 先頭バイトが偶数ならクラス0、奇数ならクラス1と答える
struct ParityScorer;

impl ClassScorer for ParityScorer {
    fn num_classes(&self) -> usize {
        2
    }

    fn score(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>> {
        Ok(images
            .iter()
            .map(|img| match img.first() {
                Some(b) if b % 2 == 1 => vec![0.1, 0.9],
                _ => vec![0.9, 0.1],
            })
            .collect())
    }
}

struct ParityTrainer;

impl BackboneTrainer for ParityTrainer {
    fn fit(&self, train_set: &Dataset, config: &mut TrainingConfig<'_>) -> Result<Box<dyn ClassScorer>> {
        for epoch in 1..=config.epochs {
            let metrics = EpochMetrics {
                epoch,
                total_epochs: config.epochs,
                train_loss: 1.0 / epoch as f64,
                train_accuracy: 1.0,
                validation_loss: config.validation_set.map(|_| 0.1),
                validation_accuracy: config.validation_set.map(|_| 1.0),
                learning_rate: config.learning_rate,
                batches_processed: train_set.len().div_ceil(config.batch_size),
            };
            (config.on_epoch_metrics)(&metrics);
        }
        Ok(Box::new(ParityScorer))
    }
}

/// 呼ばれた回数だけ数える
struct CountingTrainer {
    calls: Cell<usize>,
}

impl BackboneTrainer for CountingTrainer {
    fn fit(&self, train_set: &Dataset, config: &mut TrainingConfig<'_>) -> Result<Box<dyn ClassScorer>> {
        self.calls.set(self.calls.get() + 1);
        ParityTrainer.fit(train_set, config)
    }
}

/// cat は偶数バイト、dog は奇数バイトで始まる
fn write_images(root: &Path) {
    for i in 0..5u8 {
        fs::create_dir_all(root.join("cat")).unwrap();
        fs::create_dir_all(root.join("dog")).unwrap();
        fs::write(root.join(format!("cat/{}.jpg", i)), [2 * i, 0]).unwrap();
        fs::write(root.join(format!("dog/{}.png", i)), [2 * i + 1, 0]).unwrap();
    }
    fs::write(root.join("cat/readme.txt"), b"ignored").unwrap();
}

fn options(root: &Path) -> RunOptions {
    RunOptions {
        image_folder: root.to_path_buf(),
        use_folder_name_as_label: true,
        test_fraction: 0.2,
        seed: 1,
        architecture: Architecture::CompactCnn,
        epochs: 3,
        batch_size: 2,
        learning_rate: 0.01,
        predict_folder: None,
    }
}

#[test]
fn test_full_run_with_stub_trainer() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    write_images(&images);

    let predict = dir.path().join("predict");
    fs::create_dir_all(&predict).unwrap();
    fs::write(predict.join("b.png"), [7u8]).unwrap();
    fs::write(predict.join("a.jpg"), [4u8]).unwrap();
    fs::write(predict.join("c.jpeg"), [1u8]).unwrap();

    let mut opts = options(&images);
    opts.predict_folder = Some(predict);

    let mut epochs = Vec::new();
    let outcome = pipeline::run(&opts, &ParityTrainer, |m| epochs.push(m.epoch)).unwrap();

    assert_eq!(epochs, vec![1, 2, 3]);
    assert_eq!(outcome.train_len, 8);
    assert_eq!(outcome.test_len, 2);

    // フォルダ名ラベル、走査順の最初は cat
    assert_eq!(outcome.pipeline.label_map().labels(), &["cat".to_string(), "dog".to_string()]);

    assert_eq!(outcome.metrics.micro_accuracy, 1.0);
    assert_eq!(outcome.metrics.num_samples, 2);
    assert_eq!(outcome.metrics.per_class_log_loss.len(), 2);

    let lines: Vec<String> = outcome.predictions.iter().map(report::format_prediction).collect();
    assert_eq!(
        lines,
        vec![
            "Image Filename : [a.jpg], Scores : [0.9,0.1], Predicted Label : cat",
            "Image Filename : [b.png], Scores : [0.1,0.9], Predicted Label : dog",
        ]
    );
}

#[test]
fn test_same_seed_gives_same_split() {
    let dir = TempDir::new().unwrap();
    write_images(dir.path());

    let first = pipeline::run(&options(dir.path()), &ParityTrainer, |_| {}).unwrap();
    let second = pipeline::run(&options(dir.path()), &ParityTrainer, |_| {}).unwrap();
    assert_eq!(first.metrics, second.metrics);
}

#[test]
fn test_invalid_fraction_fails_before_reading_images() {
    let dir = TempDir::new().unwrap();
    let mut opts = options(&dir.path().join("does-not-exist"));
    opts.test_fraction = 1.5;

    let result = pipeline::run(&opts, &ParityTrainer, |_| {});
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_missing_image_folder() {
    let dir = TempDir::new().unwrap();
    let result = pipeline::run(&options(&dir.path().join("missing")), &ParityTrainer, |_| {});
    assert!(matches!(result, Err(PipelineError::NotFound(_))));
}

#[test]
fn test_zero_epochs_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_images(dir.path());
    let mut opts = options(dir.path());
    opts.epochs = 0;

    let mut called = false;
    let result = pipeline::run(&opts, &ParityTrainer, |_| called = true);
    assert!(matches!(result, Err(PipelineError::Config(_))));
    assert!(!called);
}

#[test]
fn test_empty_test_split_is_rejected_before_training() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("cat")).unwrap();
    fs::create_dir_all(dir.path().join("dog")).unwrap();
    fs::write(dir.path().join("cat/0.jpg"), [0u8]).unwrap();
    fs::write(dir.path().join("dog/0.jpg"), [1u8]).unwrap();

    // round(0.2 * 2) == 0
    let trainer = CountingTrainer { calls: Cell::new(0) };
    let mut epochs = 0;
    let result = pipeline::run(&options(dir.path()), &trainer, |_| epochs += 1);

    assert!(matches!(result, Err(PipelineError::Config(_))));
    assert_eq!(trainer.calls.get(), 0);
    assert_eq!(epochs, 0);
}
