//! モデルメタデータの定義
//!
//! 学習済みモデルを再構築するための情報（クラスラベル、構造、入力サイズ）と
//! 学習条件を保持します。

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pipeline::{Architecture, LabelKeyMap};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（キー順）
    /// 例: ["mask", "nomask"]
    pub class_labels: Vec<String>,

    /// バックボーンのアーキテクチャ
    pub architecture: Architecture,

    /// モデル入力サイズ（正方形）
    pub image_size: u32,

    /// 学習エポック数
    pub num_epochs: u32,

    /// バッチサイズ
    pub batch_size: u32,

    /// 学習率
    pub learning_rate: f64,

    /// シャッフルと分割に使ったシード
    pub seed: u64,

    /// 学習に使ったサンプル数
    #[serde(default)]
    pub train_samples: usize,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        label_map: &LabelKeyMap,
        architecture: Architecture,
        image_size: u32,
        num_epochs: u32,
        batch_size: u32,
        learning_rate: f64,
        seed: u64,
        train_samples: usize,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels: label_map.labels().to_vec(),
            architecture,
            image_size,
            num_epochs,
            batch_size,
            learning_rate,
            seed,
            train_samples,
            trained_at,
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::InvalidModel(format!("failed to serialize metadata: {}", e)))
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: ModelMetadata = serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidModel(format!("failed to parse metadata.json: {}", e)))?;
        if metadata.class_labels.is_empty() {
            return Err(PipelineError::InvalidModel("metadata has no class labels".to_string()));
        }
        Ok(metadata)
    }
}
