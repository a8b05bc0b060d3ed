//! 多クラス分類の評価
//!
//! - micro accuracy: 全サンプル中の正解率
//! - macro accuracy: 評価データに含まれるクラスごとの正解率の平均
//! - log-loss: 正解クラス確率の負の対数の平均（確率は 1e-15 で下限を切る）
//! - per-class log-loss: 正解クラスごとの log-loss（サンプルのないクラスは 0）
//! - log-loss reduction: クラス事前分布に対する log-loss の改善率

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::assembler::Dataset;
use crate::pipeline::orchestrator::{argmax, FittedPipeline};

/// 確率の下限
const PROBABILITY_EPSILON: f64 = 1e-15;

/// スコア計算時のバッチサイズ
const EVALUATION_BATCH_SIZE: usize = 32;

/// 評価結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub macro_accuracy: f64,
    pub micro_accuracy: f64,
    pub log_loss: f64,
    pub log_loss_reduction: f64,
    /// キー順
    pub per_class_log_loss: Vec<f64>,
    /// 行: 正解キー, 列: 予測キー
    pub confusion_matrix: Vec<Vec<usize>>,
    pub num_samples: usize,
}

/// 評価データ全体をパイプラインに通して評価
pub fn evaluate(pipeline: &FittedPipeline, test_set: &Dataset) -> Result<EvaluationMetrics> {
    if test_set.is_empty() {
        return Err(PipelineError::Config("cannot evaluate an empty test set".to_string()));
    }

    let mut scored = Vec::with_capacity(test_set.len());
    for chunk in test_set.samples().chunks(EVALUATION_BATCH_SIZE) {
        let images: Vec<&[u8]> = chunk.iter().map(|s| s.image_bytes.as_slice()).collect();
        let scores = pipeline.score_batch(&images)?;
        for (sample, scores) in chunk.iter().zip(scores) {
            scored.push((sample.label_key, scores));
        }
    }

    compute_metrics(pipeline.num_classes(), &scored)
}

/// (正解キー, クラス確率) の組から指標を計算
pub fn compute_metrics(num_classes: usize, scored: &[(usize, Vec<f32>)]) -> Result<EvaluationMetrics> {
    if scored.is_empty() {
        return Err(PipelineError::Config("cannot evaluate an empty test set".to_string()));
    }

    let mut confusion_matrix = vec![vec![0usize; num_classes]; num_classes];
    let mut class_loss_sum = vec![0.0f64; num_classes];
    let mut class_count = vec![0usize; num_classes];
    let mut total_loss = 0.0f64;
    let mut correct = 0usize;

    for (truth, scores) in scored {
        let truth = *truth;
        if truth >= num_classes || scores.len() != num_classes {
            return Err(PipelineError::Config(format!(
                "sample with key {} and {} scores does not fit {} classes",
                truth,
                scores.len(),
                num_classes
            )));
        }

        let predicted = argmax(scores);
        confusion_matrix[truth][predicted] += 1;
        if predicted == truth {
            correct += 1;
        }

        let p = (scores[truth] as f64).max(PROBABILITY_EPSILON);
        let loss = -p.ln();
        total_loss += loss;
        class_loss_sum[truth] += loss;
        class_count[truth] += 1;
    }

    let total = scored.len();
    let micro_accuracy = correct as f64 / total as f64;

    let present: Vec<usize> = (0..num_classes).filter(|&k| class_count[k] > 0).collect();
    let macro_accuracy = present
        .iter()
        .map(|&k| confusion_matrix[k][k] as f64 / class_count[k] as f64)
        .sum::<f64>()
        / present.len() as f64;

    let log_loss = total_loss / total as f64;
    let per_class_log_loss: Vec<f64> = (0..num_classes)
        .map(|k| {
            if class_count[k] > 0 {
                class_loss_sum[k] / class_count[k] as f64
            } else {
                0.0
            }
        })
        .collect();

    // 事前分布（評価データのクラス頻度）の log-loss
    let prior_log_loss: f64 = present
        .iter()
        .map(|&k| {
            let prior = class_count[k] as f64 / total as f64;
            -prior * prior.ln()
        })
        .sum();
    let log_loss_reduction = if prior_log_loss > 0.0 {
        1.0 - log_loss / prior_log_loss
    } else {
        0.0
    };

    debug!(total, correct, log_loss, "evaluation finished");

    Ok(EvaluationMetrics {
        macro_accuracy,
        micro_accuracy,
        log_loss,
        log_loss_reduction,
        per_class_log_loss,
        confusion_matrix,
        num_samples: total,
    })
}
