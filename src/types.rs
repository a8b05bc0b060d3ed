use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// カタログ上の1画像（パスと導出されたラベル）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub label: String,
}

impl ImageRecord {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }
}

/// メモリに読み込まれた学習サンプル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSample {
    pub image_path: PathBuf,
    pub label: String,
    pub label_key: usize,
    pub image_bytes: Vec<u8>,
}

/// 推論対象の画像（ファイル内容とファイル名）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryImage {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

impl InMemoryImage {
    pub fn new(bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        Self {
            bytes,
            file_name: file_name.into(),
        }
    }
}

/// 1画像分の予測結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub image_file_name: String,
    // クラスキー順
    pub scores: Vec<f32>,
    pub predicted_label: String,
}

/// 1エポック終了時の学習メトリクス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1始まりのエポック番号
    pub epoch: usize,
    pub total_epochs: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub validation_loss: Option<f64>,
    pub validation_accuracy: Option<f64>,
    pub learning_rate: f64,
    pub batches_processed: usize,
}

impl std::fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Phase: Training, Epoch: {:3}/{}, Batches: {:4}, Learning Rate: {}, Accuracy: {:.4}, Cross-Entropy: {:.4}",
            self.epoch,
            self.total_epochs,
            self.batches_processed,
            self.learning_rate,
            self.train_accuracy,
            self.train_loss,
        )?;
        if let (Some(acc), Some(loss)) = (self.validation_accuracy, self.validation_loss) {
            write!(f, " | Validation Accuracy: {:.4}, Cross-Entropy: {:.4}", acc, loss)?;
        }
        Ok(())
    }
}
