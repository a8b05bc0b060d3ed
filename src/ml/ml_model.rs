//! 機械学習モデルの共通定義
//!
//! バックボーン（MobileNetV2 / 小型CNN）と分類ヘッド、画像の前処理を提供します。

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use image::imageops::FilterType;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::pipeline::Architecture;

/// MobileNetV2の入力サイズ
pub const DEFAULT_IMAGE_SIZE: usize = 224;

/// MobileNetV2の特徴次元
pub const MOBILENET_FEATURES: usize = 1280;

/// 小型CNNの特徴次元
pub const COMPACT_FEATURES: usize = 128;

/// 事前学習済み重みのファイル名（拡張子はレコーダが付ける）
pub const PRETRAINED_FILE_STEM: &str = "mobilenet_v2";

/// ImageNetの平均
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 逆残差ブロックの構成 (拡張率 t, 出力チャネル c, 繰り返し n, ストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// Conv + BatchNorm（活性化は呼び出し側で行う）
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(channels: [usize; 2], kernel: usize, stride: usize, groups: usize, device: &B::Device) -> Self {
        let padding = kernel / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// MobileNetV2の逆残差ブロック
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    project: ConvBn<B>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, expand_ratio: usize, device: &B::Device) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = if expand_ratio != 1 {
            Some(ConvBn::new([in_channels, hidden], 1, 1, 1, device))
        } else {
            None
        };

        Self {
            expand,
            depthwise: ConvBn::new([hidden, hidden], 3, stride, hidden, device),
            project: ConvBn::new([hidden, out_channels], 1, 1, 1, device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let Some(expand) = &self.expand {
            x = relu6(expand.forward(x));
        }
        x = relu6(self.depthwise.forward(x));
        x = self.project.forward(x);

        // ストライド1かつチャネル数が同じときだけ形状が一致する
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV2の特徴抽出部（分類層を除く）
#[derive(Module, Debug)]
pub struct MobileNetV2Features<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<InvertedResidual<B>>,
    last: ConvBn<B>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> MobileNetV2Features<B> {
    pub fn new(device: &B::Device) -> Self {
        let stem_channels = 32;
        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for (t, c, n, s) in INVERTED_RESIDUAL_SETTINGS {
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                blocks.push(InvertedResidual::new(in_channels, c, stride, t, device));
                in_channels = c;
            }
        }

        Self {
            stem: ConvBn::new([3, stem_channels], 3, 2, 1, device),
            blocks,
            last: ConvBn::new([in_channels, MOBILENET_FEATURES], 1, 1, 1, device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    /// [batch, 3, H, W] -> [batch, 1280]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();
        let mut x = relu6(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = relu6(self.last.forward(x));
        self.pool.forward(x).reshape([batch_size, MOBILENET_FEATURES])
    }
}

/// 事前学習なしの小型CNN
///
/// {Conv 3x3 (no padding) + ReLU + MaxPool} x 2, Conv 3x3 + ReLU, Global Average Pooling
#[derive(Module, Debug)]
pub struct CompactFeatures<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    global_pool: AdaptiveAvgPool2d,
    activation: Relu,
}

impl<B: Backend> CompactFeatures<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([64, COMPACT_FEATURES], [3, 3]).init(device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
        }
    }

    /// [batch, 3, H, W] -> [batch, 128]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.activation.forward(self.conv1.forward(images));
        let x = self.pool1.forward(x);
        let x = self.activation.forward(self.conv2.forward(x));
        let x = self.pool2.forward(x);
        let x = self.activation.forward(self.conv3.forward(x));

        self.global_pool.forward(x).reshape([batch_size, COMPACT_FEATURES])
    }
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ヘッドのドロップアウト率
    #[config(default = 0.2)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 小型CNNの最小入力サイズ（3回の3x3畳み込みと2回のプーリング後に1x1以上残る）
    pub const MIN_COMPACT_IMAGE_SIZE: usize = 18;

    /// 重みを初期化したモデルを作成
    pub fn init<B: Backend>(&self, architecture: Architecture, device: &B::Device) -> crate::error::Result<Classifier<B>> {
        if self.num_classes == 0 {
            return Err(PipelineError::Config("model needs at least one class".to_string()));
        }

        let (mobilenet, compact, features) = match architecture {
            Architecture::MobilenetV2 => {
                if self.image_size < 32 {
                    return Err(PipelineError::Config(format!(
                        "image size {} is too small for MobilenetV2 (min 32)",
                        self.image_size
                    )));
                }
                (Some(MobileNetV2Features::new(device)), None, MOBILENET_FEATURES)
            }
            Architecture::CompactCnn => {
                if self.image_size < Self::MIN_COMPACT_IMAGE_SIZE {
                    return Err(PipelineError::Config(format!(
                        "image size {} is too small for CompactCnn (min {})",
                        self.image_size,
                        Self::MIN_COMPACT_IMAGE_SIZE
                    )));
                }
                (None, Some(CompactFeatures::new(device)), COMPACT_FEATURES)
            }
        };

        debug!(
            "[Model] {}: 入力 {}x{}, 特徴次元 {}, クラス数 {}",
            architecture, self.image_size, self.image_size, features, self.num_classes
        );

        Ok(Classifier {
            mobilenet,
            compact,
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(features, self.num_classes).init(device),
        })
    }
}

/// バックボーン + 分類ヘッド
///
/// `mobilenet` と `compact` のどちらか一方だけを持ちます。
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    mobilenet: Option<MobileNetV2Features<B>>,
    compact: Option<CompactFeatures<B>>,
    dropout: Dropout,
    head: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    /// 事前学習済みのMobileNetV2重みを読み込む
    ///
    /// `freeze` が true の場合はバックボーンの勾配を止め、ヘッドだけを学習します。
    pub fn with_pretrained_backbone(mut self, pretrained_dir: &Path, freeze: bool, device: &B::Device) -> crate::error::Result<Self> {
        let Some(backbone) = self.mobilenet.take() else {
            return Err(PipelineError::Dependency(
                "pretrained weights are only available for MobilenetV2".to_string(),
            ));
        };

        let weights = pretrained_weights_path(pretrained_dir);
        if !weights.exists() {
            return Err(PipelineError::Dependency(format!(
                "MobilenetV2 pretrained weights not found: {}",
                weights.display()
            )));
        }

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let backbone = backbone
            .load_file(pretrained_dir.join(PRETRAINED_FILE_STEM), &recorder, device)
            .map_err(|e| PipelineError::Dependency(format!("failed to load {}: {:?}", weights.display(), e)))?;
        info!("事前学習済み重みを読み込みました: {}", weights.display());

        self.mobilenet = Some(if freeze { backbone.no_grad() } else { backbone });
        Ok(self)
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = match (&self.mobilenet, &self.compact) {
            (Some(backbone), _) => backbone.forward(images),
            (None, Some(backbone)) => backbone.forward(images),
            (None, None) => unreachable!("classifier is always built with a backbone"),
        };
        self.head.forward(self.dropout.forward(features))
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 事前学習済み重みファイルのパス
pub fn pretrained_weights_path(pretrained_dir: &Path) -> PathBuf {
    pretrained_dir.join(format!("{}.mpk", PRETRAINED_FILE_STEM))
}

/// 画像をデコードし、正方形にリサイズしたRGB（HWC順）を返す
pub fn decode_rgb(bytes: &[u8], image_size: usize) -> image::ImageResult<Vec<u8>> {
    let size = image_size as u32;
    let img = image::load_from_memory(bytes)?;
    Ok(img.resize_exact(size, size, FilterType::Triangle).to_rgb8().into_raw())
}

/// RGB（HWC順）をImageNetの平均と標準偏差で正規化し、(C, H, W) の順で平坦化
pub fn normalize_rgb(rgb: &[u8], out: &mut Vec<f32>) {
    let pixels = rgb.len() / 3;
    out.reserve(rgb.len());
    for channel in 0..3 {
        for pixel in 0..pixels {
            let value = rgb[pixel * 3 + channel] as f32 / 255.0;
            out.push((value - MEAN[channel]) / STD[channel]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    type TestBackend = NdArray;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_rgb_resizes_to_square() {
        let rgb = decode_rgb(&png_bytes(40, 20, [255, 0, 0]), 16).unwrap();
        assert_eq!(rgb.len(), 16 * 16 * 3);
        assert_eq!(&rgb[..3], &[255, 0, 0]);
    }

    #[test]
    fn test_decode_rgb_rejects_garbage() {
        assert!(decode_rgb(b"not an image", 16).is_err());
    }

    #[test]
    fn test_normalize_rgb_is_channel_major() {
        // 2ピクセル: 白, 黒
        let mut out = Vec::new();
        normalize_rgb(&[255, 255, 255, 0, 0, 0], &mut out);
        assert_eq!(out.len(), 6);
        assert!((out[0] - (1.0 - MEAN[0]) / STD[0]).abs() < 1e-6);
        assert!((out[1] - (0.0 - MEAN[0]) / STD[0]).abs() < 1e-6);
        assert!((out[5] - (0.0 - MEAN[2]) / STD[2]).abs() < 1e-6);
    }

    #[test]
    fn test_compact_classifier_output_shape() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(3)
            .with_image_size(32)
            .init::<TestBackend>(Architecture::CompactCnn, &device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(model.forward(images).dims(), [2, 3]);
    }

    #[test]
    fn test_mobilenet_classifier_output_shape() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(2)
            .with_image_size(32)
            .init::<TestBackend>(Architecture::MobilenetV2, &device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.forward(images).dims(), [1, 2]);
    }

    #[test]
    fn test_model_config_json_round_trip() {
        let config = ModelConfig::new(3).with_dropout(0.5).with_image_size(96);
        let json = serde_json::to_string(&config).unwrap();
        let restored: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.num_classes, 3);
        assert_eq!(restored.dropout, 0.5);
        assert_eq!(restored.image_size, 96);

        let defaults: ModelConfig = serde_json::from_str(r#"{"num_classes":2}"#).unwrap();
        assert_eq!(defaults.dropout, 0.2);
        assert_eq!(defaults.image_size, DEFAULT_IMAGE_SIZE);
    }

    #[test]
    fn test_too_small_input_is_rejected() {
        let result = ModelConfig::new(2)
            .with_image_size(8)
            .init::<TestBackend>(Architecture::CompactCnn, &NdArrayDevice::Cpu);
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_missing_pretrained_weights() {
        let dir = tempfile::TempDir::new().unwrap();
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new(2)
            .with_image_size(32)
            .init::<TestBackend>(Architecture::MobilenetV2, &device)
            .unwrap();
        let result = model.with_pretrained_backbone(dir.path(), true, &device);
        assert!(matches!(result, Err(PipelineError::Dependency(_))));
    }
}
