//! モデル学習
//!
//! `BackboneTrainer` の Burn 実装です。エポックごとにメトリクスを同期的に
//! コールバックへ渡すため、Learner は使わずに学習ループを回します。

use std::path::PathBuf;
use std::sync::Arc;

use burn::{
    backend::{Autodiff, Wgpu},
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer, SgdConfig},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::ml::inference::BurnScorer;
use crate::ml::ml_model::{decode_rgb, normalize_rgb, Classifier, ModelConfig, DEFAULT_IMAGE_SIZE};
use crate::model::config::{DeviceType, TrainingSettings};
use crate::pipeline::{Architecture, BackboneTrainer, ClassScorer, Dataset, TrainingConfig};
use crate::types::EpochMetrics;

/// デコード済みの学習サンプル
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// リサイズ済みRGB（HWC順）
    pub rgb: Arc<[u8]>,
    pub label: usize,
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, _device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            normalize_rgb(&item.rgb, &mut all_pixels);
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// Burnでの学習に使う設定（パイプライン側の設定に含まれないもの）
#[derive(Debug, Clone)]
pub struct BurnTrainerSettings {
    pub device: DeviceType,
    pub image_size: usize,
    pub dropout: f64,
    pub pretrained_dir: PathBuf,
    pub freeze_backbone: bool,
}

impl Default for BurnTrainerSettings {
    fn default() -> Self {
        Self {
            device: DeviceType::default(),
            image_size: DEFAULT_IMAGE_SIZE,
            dropout: 0.2,
            pretrained_dir: PathBuf::from("models/pretrained"),
            freeze_backbone: true,
        }
    }
}

impl BurnTrainerSettings {
    pub fn from_training(device: DeviceType, training: &TrainingSettings) -> Self {
        Self {
            device,
            image_size: training.image_size,
            dropout: training.dropout,
            pretrained_dir: training.pretrained_dir.clone(),
            freeze_backbone: training.freeze_backbone,
        }
    }
}

/// Burnによるバックボーン学習
pub struct BurnTrainer {
    settings: BurnTrainerSettings,
}

impl BurnTrainer {
    pub fn new(settings: BurnTrainerSettings) -> Self {
        Self { settings }
    }
}

impl BackboneTrainer for BurnTrainer {
    fn fit(&self, train_set: &Dataset, config: &mut TrainingConfig<'_>) -> Result<Box<dyn ClassScorer>> {
        match self.settings.device {
            DeviceType::Wgpu => {
                let scorer = fit_on::<Autodiff<Wgpu>>(WgpuDevice::default(), &self.settings, train_set, config)?;
                Ok(Box::new(scorer))
            }
            DeviceType::Cpu => {
                let scorer = fit_on::<Autodiff<NdArray>>(NdArrayDevice::Cpu, &self.settings, train_set, config)?;
                Ok(Box::new(scorer))
            }
        }
    }
}

/// 全サンプルを先にデコードする（壊れた画像は学習開始前に検出）
fn decode_items(dataset: &Dataset, image_size: usize) -> Result<Vec<ImageItem>> {
    dataset
        .samples()
        .iter()
        .map(|sample| {
            let rgb = decode_rgb(&sample.image_bytes, image_size)
                .map_err(|e| PipelineError::Image(format!("'{}': {}", sample.image_path.display(), e)))?;
            Ok(ImageItem {
                rgb: rgb.into(),
                label: sample.label_key,
            })
        })
        .collect()
}

/// 学習前のモデルを作成
fn build_model<B: Backend>(
    settings: &BurnTrainerSettings,
    architecture: Architecture,
    num_classes: usize,
    device: &B::Device,
) -> Result<Classifier<B>> {
    let model = ModelConfig::new(num_classes)
        .with_dropout(settings.dropout)
        .with_image_size(settings.image_size)
        .init::<B>(architecture, device)?;

    match architecture {
        Architecture::MobilenetV2 => {
            model.with_pretrained_backbone(&settings.pretrained_dir, settings.freeze_backbone, device)
        }
        Architecture::CompactCnn => Ok(model),
    }
}

/// 予測が正解と一致した数
fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// 検証データでの平均損失と正解率
fn validate<B: Backend>(
    model: &Classifier<B>,
    items: &[ImageItem],
    batcher: &ImageBatcher<B>,
    batch_size: usize,
    device: &B::Device,
) -> (f64, f64) {
    let mut loss_sum = 0.0;
    let mut correct = 0;

    for chunk in items.chunks(batch_size) {
        let batch = batcher.batch(chunk.to_vec(), device);
        let output = model.forward_classification(batch.images, batch.targets);
        let loss: f64 = output.loss.into_scalar().elem();
        loss_sum += loss * chunk.len() as f64;
        correct += count_correct(output.output, output.targets);
    }

    let total = items.len().max(1) as f64;
    (loss_sum / total, correct as f64 / total)
}

/// 指定バックエンドで学習を実行
fn fit_on<B: AutodiffBackend>(
    device: B::Device,
    settings: &BurnTrainerSettings,
    train_set: &Dataset,
    config: &mut TrainingConfig<'_>,
) -> Result<BurnScorer<B::InnerBackend>> {
    info!("使用デバイス: {:?}", device);

    let image_size = settings.image_size;
    let num_classes = train_set.num_classes();
    let train_items = decode_items(train_set, image_size)?;
    let valid_items = match config.validation_set {
        Some(valid_set) => decode_items(valid_set, image_size)?,
        None => Vec::new(),
    };
    info!(
        "学習データ: {} 枚, 検証データ: {} 枚, クラス数: {}",
        train_items.len(),
        valid_items.len(),
        num_classes
    );

    let mut model = build_model::<B>(settings, config.architecture, num_classes, &device)?;
    let mut optimizer = SgdConfig::new().init();

    let batcher = ImageBatcher::<B>::new(device.clone(), image_size);
    let valid_batcher = ImageBatcher::<B::InnerBackend>::new(device.clone(), image_size);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut order: Vec<usize> = (0..train_items.len()).collect();

    for epoch in 1..=config.epochs {
        order.shuffle(&mut rng);

        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut batches = 0;

        for chunk in order.chunks(config.batch_size) {
            let items: Vec<ImageItem> = chunk.iter().map(|&i| train_items[i].clone()).collect();
            let batch = batcher.batch(items, &device);

            let output = model.forward_classification(batch.images, batch.targets);
            let loss_value: f64 = output.loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(PipelineError::Training(format!(
                    "loss became {} at epoch {}, batch {}",
                    loss_value,
                    epoch,
                    batches + 1
                )));
            }

            loss_sum += loss_value * chunk.len() as f64;
            correct += count_correct(output.output.clone(), output.targets.clone());

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(config.learning_rate, model, grads);
            batches += 1;
        }

        let total = train_items.len() as f64;
        let (validation_loss, validation_accuracy) = if valid_items.is_empty() {
            (None, None)
        } else {
            let (loss, accuracy) = validate(&model.valid(), &valid_items, &valid_batcher, config.batch_size, &device);
            (Some(loss), Some(accuracy))
        };

        let metrics = EpochMetrics {
            epoch,
            total_epochs: config.epochs,
            train_loss: loss_sum / total,
            train_accuracy: correct as f64 / total,
            validation_loss,
            validation_accuracy,
            learning_rate: config.learning_rate,
            batches_processed: batches,
        };
        debug!("{}", metrics);
        (config.on_epoch_metrics)(&metrics);
    }

    Ok(BurnScorer::new(model.valid(), device, image_size, num_classes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{DatasetAssembler, LabelKeyMap};
    use crate::types::{ImageRecord, LabeledSample};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::PathBuf;

    type TestBackend = NdArray;

    fn png_bytes(color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(24, 24, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn color_dataset() -> Dataset {
        let records = vec![ImageRecord::new("red/a.png", "red"), ImageRecord::new("blue/b.png", "blue")];
        let label_map = LabelKeyMap::from_records(&records);
        let mut samples = Vec::new();
        for i in 0..4 {
            for (label, color) in [("red", [250, 10, 10]), ("blue", [10, 10, 250])] {
                samples.push(LabeledSample {
                    image_path: PathBuf::from(format!("{}/{}.png", label, i)),
                    label: label.to_string(),
                    label_key: label_map.key_of(label).unwrap(),
                    image_bytes: png_bytes(color),
                });
            }
        }
        Dataset::new(DatasetAssembler::new(1).shuffle(samples), label_map)
    }

    fn cpu_settings() -> BurnTrainerSettings {
        BurnTrainerSettings {
            device: DeviceType::Cpu,
            image_size: 24,
            dropout: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_batcher_shapes() {
        let batcher = ImageBatcher::<TestBackend>::new(NdArrayDevice::Cpu, 2);
        let item = ImageItem {
            rgb: vec![0u8; 2 * 2 * 3].into(),
            label: 1,
        };
        let batch = batcher.batch(vec![item.clone(), item], &NdArrayDevice::Cpu);
        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.targets.dims(), [2]);
    }

    #[test]
    fn test_corrupt_image_fails_before_training() {
        let (mut samples, label_map) = color_dataset().into_parts();
        samples[0].image_bytes = b"broken".to_vec();
        let dataset = Dataset::new(samples, label_map);

        let trainer = BurnTrainer::new(cpu_settings());
        let mut config = TrainingConfig::new(Architecture::CompactCnn).with_epochs(1);
        let result = trainer.fit(&dataset, &mut config);
        assert!(matches!(result, Err(PipelineError::Image(_))));
    }

    #[test]
    fn test_missing_pretrained_weights_is_dependency_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = BurnTrainerSettings {
            image_size: 32,
            pretrained_dir: dir.path().to_path_buf(),
            ..cpu_settings()
        };
        let trainer = BurnTrainer::new(settings);
        let mut config = TrainingConfig::new(Architecture::MobilenetV2).with_epochs(1);
        let result = trainer.fit(&color_dataset(), &mut config);
        assert!(matches!(result, Err(PipelineError::Dependency(_))));
    }

    #[test]
    fn test_compact_cnn_reports_every_epoch() {
        let dataset = color_dataset();
        let trainer = BurnTrainer::new(cpu_settings());

        let mut seen = Vec::new();
        let scorer = {
            let mut config = TrainingConfig::new(Architecture::CompactCnn)
                .with_epochs(3)
                .with_batch_size(4)
                .with_learning_rate(0.01)
                .with_validation_set(&dataset)
                .on_epoch_metrics(|m| seen.push((m.epoch, m.batches_processed, m.validation_accuracy.is_some())));
            trainer.fit(&dataset, &mut config).unwrap()
        };

        assert_eq!(seen, vec![(1, 2, true), (2, 2, true), (3, 2, true)]);
        assert_eq!(scorer.num_classes(), 2);

        let image = png_bytes([250, 10, 10]);
        let scores = scorer.score(&[image.as_slice()]).unwrap();
        assert_eq!(scores.len(), 1);
        let sum: f32 = scores[0].iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }
}
