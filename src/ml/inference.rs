//! モデル推論機能

use std::path::Path;

use burn::{
    backend::Wgpu,
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::ml::ml_model::{decode_rgb, normalize_rgb, Classifier, ModelConfig};
use crate::model::config::DeviceType;
use crate::model::{load_model_with_metadata, InferenceConfig};
use crate::pipeline::{ClassScorer, FittedPipeline};

/// 学習済みモデルによるスコア計算
pub struct BurnScorer<B: Backend> {
    model: Classifier<B>,
    device: B::Device,
    image_size: usize,
    num_classes: usize,
}

impl<B: Backend> BurnScorer<B> {
    pub fn new(model: Classifier<B>, device: B::Device, image_size: usize, num_classes: usize) -> Self {
        Self {
            model,
            device,
            image_size,
            num_classes,
        }
    }

    /// 保存済みの重みから復元
    pub fn from_weights(config: &InferenceConfig, weights: Vec<u8>, device: B::Device) -> Result<Self> {
        let model = ModelConfig::new(config.num_classes())
            .with_image_size(config.image_size)
            .init::<B>(config.architecture, &device)?;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(weights, &device)
            .map_err(|e| PipelineError::InvalidModel(format!("failed to load model weights: {:?}", e)))?;
        let model = model.load_record(record);

        Ok(Self::new(model, device, config.image_size, config.num_classes()))
    }
}

impl<B: Backend> ClassScorer for BurnScorer<B> {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn score(&self, images: &[&[u8]]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.image_size;
        let mut pixels = Vec::with_capacity(images.len() * 3 * size * size);
        for (i, bytes) in images.iter().enumerate() {
            let rgb = decode_rgb(bytes, size).map_err(|e| PipelineError::Image(format!("#{}: {}", i, e)))?;
            normalize_rgb(&rgb, &mut pixels);
        }

        let tensor = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device).reshape([images.len(), 3, size, size]);
        let probabilities = softmax(self.model.forward(tensor), 1);

        let flat = probabilities
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| PipelineError::Training(format!("failed to read scores: {:?}", e)))?;

        Ok(flat.chunks(self.num_classes).map(|row| row.to_vec()).collect())
    }

    fn export_weights(&self) -> Result<Vec<u8>> {
        BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(self.model.clone().into_record(), ())
            .map_err(|e| PipelineError::InvalidModel(format!("failed to serialize model weights: {:?}", e)))
    }
}

/// 推論エンジン
///
/// tar.gzのモデルから推論用のパイプラインを組み立てます。
pub struct InferenceEngine;

impl InferenceEngine {
    /// モデルを読み込んでパイプラインを復元
    pub fn load<P: AsRef<Path>>(model_path: P, device_type: DeviceType) -> Result<FittedPipeline> {
        let (metadata, weights) = load_model_with_metadata(model_path.as_ref())?;
        let config = InferenceConfig::from_metadata(&metadata);
        info!(
            "モデルを読み込みました: {} ({}, {} クラス)",
            model_path.as_ref().display(),
            config.architecture,
            config.num_classes()
        );

        let scorer: Box<dyn ClassScorer> = match device_type {
            DeviceType::Wgpu => Box::new(BurnScorer::<Wgpu>::from_weights(&config, weights, WgpuDevice::default())?),
            DeviceType::Cpu => Box::new(BurnScorer::<NdArray>::from_weights(&config, weights, NdArrayDevice::Cpu)?),
        };

        FittedPipeline::from_parts(scorer, config.label_map())
    }
}
