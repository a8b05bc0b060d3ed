//! データセットの組み立て
//!
//! ラベル→キー対応表の作成、シード付きシャッフル、画像バイト列の読み込みを行います。

use std::collections::HashMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::types::{ImageRecord, LabeledSample};

/// ラベル文字列と密な整数キーの対応表
///
/// キーは入力順で最初に現れた順に 0 から割り当てられます。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelKeyMap {
    labels: Vec<String>,
    keys: HashMap<String, usize>,
}

impl LabelKeyMap {
    /// シャッフル前のレコード列から対応表を作成
    pub fn from_records(records: &[ImageRecord]) -> Self {
        Self::from_labels(records.iter().map(|r| r.label.as_str()))
    }

    /// ラベル列から対応表を作成（重複は最初の出現位置を採用）
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut map = Self::default();
        for label in labels {
            if !map.keys.contains_key(label) {
                map.keys.insert(label.to_string(), map.labels.len());
                map.labels.push(label.to_string());
            }
        }
        map
    }

    pub fn key_of(&self, label: &str) -> Option<usize> {
        self.keys.get(label).copied()
    }

    pub fn label_of(&self, key: usize) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// キー順のラベル一覧
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// ラベル付きサンプル列と共有のラベル対応表
#[derive(Debug, Clone)]
pub struct Dataset {
    samples: Vec<LabeledSample>,
    label_map: LabelKeyMap,
}

impl Dataset {
    pub fn new(samples: Vec<LabeledSample>, label_map: LabelKeyMap) -> Self {
        Self { samples, label_map }
    }

    pub fn samples(&self) -> &[LabeledSample] {
        &self.samples
    }

    pub fn label_map(&self) -> &LabelKeyMap {
        &self.label_map
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.label_map.len()
    }

    /// 指定キーのサンプル数
    pub fn class_count(&self, key: usize) -> usize {
        self.samples.iter().filter(|s| s.label_key == key).count()
    }

    pub(crate) fn into_parts(self) -> (Vec<LabeledSample>, LabelKeyMap) {
        (self.samples, self.label_map)
    }
}

/// データセット組み立て器
///
/// シードはプロセス開始時に一度だけ決めた値を渡します。
#[derive(Debug, Clone, Copy)]
pub struct DatasetAssembler {
    seed: u64,
}

impl DatasetAssembler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// レコード列からデータセットを作成
    ///
    /// 1ファイルでも読めなければ全体を中断します。
    pub fn assemble(&self, records: Vec<ImageRecord>) -> Result<Dataset> {
        if records.is_empty() {
            return Err(PipelineError::Config("dataset is empty: no images found".to_string()));
        }

        // キーはシャッフル前に確定させる
        let label_map = LabelKeyMap::from_records(&records);
        info!(
            "Loaded {} images from {} classes: {}",
            records.len(),
            label_map.len(),
            label_map.labels().join(", ")
        );

        let shuffled = self.shuffle(records);

        let mut samples = Vec::with_capacity(shuffled.len());
        for record in shuffled {
            let label_key = label_map
                .key_of(&record.label)
                .ok_or_else(|| PipelineError::Config(format!("unknown label '{}'", record.label)))?;
            let image_bytes = read_image_bytes(&record.path)?;
            samples.push(LabeledSample {
                image_path: record.path,
                label: record.label,
                label_key,
                image_bytes,
            });
        }

        let dataset = Dataset::new(samples, label_map);
        for (key, label) in dataset.label_map().labels().iter().enumerate() {
            debug!("  Class {}: {} ({} samples)", key, label, dataset.class_count(key));
        }

        Ok(dataset)
    }

    /// シード付きの並べ替え
    pub fn shuffle<T>(&self, mut items: Vec<T>) -> Vec<T> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        items.shuffle(&mut rng);
        items
    }
}

/// 画像ファイルを丸ごと読み込む
pub fn read_image_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| PipelineError::io(path, e))
}
