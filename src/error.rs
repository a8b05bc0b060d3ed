//! パイプライン共通のエラー型
//!
//! どのステージで失敗しても即座に呼び出し元へ伝播し、実行全体を中断します。
//! リトライや部分結果の返却は行いません。

use std::path::{Path, PathBuf};

use thiserror::Error;

/// パイプラインのエラー
#[derive(Error, Debug)]
pub enum PipelineError {
    /// ルートフォルダ、クラスフォルダ、モデルファイルが存在しない
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// 画像ファイルなどの読み込み失敗
    #[error("Failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 画像としてデコードできない
    #[error("Failed to decode image {0}")]
    Image(String),

    /// 事前学習済みバックボーンが利用できない
    #[error("Dependency unavailable: {0}")]
    Dependency(String),

    /// 学習の失敗（発散を含む）
    #[error("Training failed: {0}")]
    Training(String),

    /// 設定値の不正（分割比率、エポック数、空のデータセットなど）
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// モデルアーカイブの内容が不正
    #[error("Invalid model archive: {0}")]
    InvalidModel(String),
}

impl PipelineError {
    /// パス付きのIOエラーを作成
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
