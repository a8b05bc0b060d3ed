pub mod ml_model;
pub mod training;
pub mod inference;

pub use ml_model::{Classifier, ModelConfig, DEFAULT_IMAGE_SIZE, decode_rgb, normalize_rgb, pretrained_weights_path};
pub use training::{BurnTrainer, BurnTrainerSettings, ImageBatch, ImageBatcher, ImageItem};
pub use inference::{BurnScorer, InferenceEngine};
