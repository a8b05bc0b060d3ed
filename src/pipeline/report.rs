//! コンソール出力とCSV出力

use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::pipeline::evaluator::EvaluationMetrics;
use crate::types::PredictionRecord;

/// 小数点以下4桁まで、末尾の0を省いて表示
pub fn format_metric(value: f64) -> String {
    let text = format!("{:.4}", value);
    let text = if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    };
    if text == "-0" {
        "0".to_string()
    } else {
        text
    }
}

/// 評価結果のブロックを作成
pub fn format_evaluation(metrics: &EvaluationMetrics, model_name: &str) -> String {
    let mut lines = Vec::new();
    lines.push("*".repeat(60));
    lines.push(format!(
        "* Metrics for {} transfer learning multi-class classification model",
        model_name
    ));
    lines.push(format!("*{}", "-".repeat(59)));
    lines.push(format!(
        " AccuracyMacro = {}, a value between 0 and 1, the closer to 1, the better",
        format_metric(metrics.macro_accuracy)
    ));
    lines.push(format!(
        " AccuracyMicro = {}, a value between 0 and 1, the closer to 1, the better",
        format_metric(metrics.micro_accuracy)
    ));
    lines.push(format!(
        " LogLoss = {}, the closer to 0, the better",
        format_metric(metrics.log_loss)
    ));
    lines.push(format!(
        " LogLossReduction = {}, the closer to 1, the better",
        format_metric(metrics.log_loss_reduction)
    ));
    for (i, loss) in metrics.per_class_log_loss.iter().enumerate() {
        lines.push(format!(
            " LogLoss for class {} = {}, the closer to 0, the better",
            i + 1,
            format_metric(*loss)
        ));
    }
    lines.push("*".repeat(60));
    lines.join("\n")
}

pub fn print_evaluation(metrics: &EvaluationMetrics, model_name: &str) {
    println!("{}", format_evaluation(metrics, model_name));
}

/// 予測結果1行
pub fn format_prediction(record: &PredictionRecord) -> String {
    let scores: Vec<String> = record.scores.iter().map(|s| s.to_string()).collect();
    format!(
        "Image Filename : [{}], Scores : [{}], Predicted Label : {}",
        record.image_file_name,
        scores.join(","),
        record.predicted_label
    )
}

pub fn print_predictions(records: &[PredictionRecord]) {
    for record in records {
        println!("{}", format_prediction(record));
    }
}

/// 予測結果をCSVに書き出す
///
/// 列: image_file_name, predicted_label, score_<ラベル>...
pub fn write_predictions_csv(path: &Path, labels: &[String], records: &[PredictionRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
    }

    let mut writer = csv::Writer::from_path(path).map_err(|e| PipelineError::io(path, e.into()))?;

    let mut header = vec!["image_file_name".to_string(), "predicted_label".to_string()];
    header.extend(labels.iter().map(|l| format!("score_{}", l)));
    writer
        .write_record(&header)
        .map_err(|e| PipelineError::io(path, e.into()))?;

    for record in records {
        let mut row = vec![record.image_file_name.clone(), record.predicted_label.clone()];
        row.extend(record.scores.iter().map(|s| s.to_string()));
        writer
            .write_record(&row)
            .map_err(|e| PipelineError::io(path, e.into()))?;
    }

    writer.flush().map_err(|e| PipelineError::io(path, e))?;
    Ok(())
}
