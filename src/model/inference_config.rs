//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータから推論に必要な情報を取り出します。

use crate::model::model_metadata::ModelMetadata;
use crate::pipeline::{Architecture, LabelKeyMap};

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラスラベル（キー順）
    pub class_labels: Vec<String>,

    /// バックボーンのアーキテクチャ
    pub architecture: Architecture,

    /// モデル入力解像度
    pub image_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            architecture: metadata.architecture,
            image_size: metadata.image_size as usize,
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// キー⇔ラベルの対応表を復元
    pub fn label_map(&self) -> LabelKeyMap {
        LabelKeyMap::from_labels(self.class_labels.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_map_restores_key_order() {
        let metadata = ModelMetadata::new(
            &LabelKeyMap::from_labels(["nomask", "mask"]),
            Architecture::MobilenetV2,
            224,
            1,
            10,
            0.01,
            1,
            2,
        );
        let config = InferenceConfig::from_metadata(&metadata);
        let map = config.label_map();
        assert_eq!(config.num_classes(), 2);
        assert_eq!(map.key_of("nomask"), Some(0));
        assert_eq!(map.label_of(1), Some("mask"));
        assert_eq!(config.image_size, 224);
    }
}
