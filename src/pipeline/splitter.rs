//! 学習用/評価用データセットへの分割

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::assembler::Dataset;

/// 評価用データの既定の割合
pub const DEFAULT_TEST_FRACTION: f64 = 0.2;

/// 分割器
///
/// 組み立て器と同じシードを受け取り、インデックスを独立に並べ替えて分割します。
#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    test_fraction: f64,
    seed: u64,
}

impl Splitter {
    /// `test_fraction` は 0 と 1 の間（両端を含まない）
    pub fn new(test_fraction: f64, seed: u64) -> Result<Self> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(PipelineError::Config(format!(
                "test fraction must be between 0 and 1 (exclusive), got {}",
                test_fraction
            )));
        }
        Ok(Self { test_fraction, seed })
    }

    /// 評価用サンプル数 `round(f * N)`
    pub fn test_len(&self, total: usize) -> usize {
        ((self.test_fraction * total as f64).round() as usize).min(total)
    }

    /// (学習用, 評価用) に分割
    ///
    /// どちらも元のデータセット内の順序を保ちます。
    pub fn split(&self, dataset: Dataset) -> (Dataset, Dataset) {
        let (samples, label_map) = dataset.into_parts();
        let total = samples.len();
        let test_len = self.test_len(total);

        let mut indices: Vec<usize> = (0..total).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        indices.shuffle(&mut rng);

        let mut is_test = vec![false; total];
        for &idx in &indices[..test_len] {
            is_test[idx] = true;
        }

        let mut train = Vec::with_capacity(total - test_len);
        let mut test = Vec::with_capacity(test_len);
        for (sample, in_test) in samples.into_iter().zip(is_test) {
            if in_test {
                test.push(sample);
            } else {
                train.push(sample);
            }
        }

        info!("学習データ: {} 枚, 検証データ: {} 枚", train.len(), test.len());

        (
            Dataset::new(train, label_map.clone()),
            Dataset::new(test, label_map),
        )
    }
}
