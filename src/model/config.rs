//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット、学習、出力先の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::splitter::DEFAULT_TEST_FRACTION;
use crate::pipeline::{Architecture, RunOptions};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(PipelineError::Config(format!("unknown device type: {}", other))),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// 学習画像のルートフォルダ
    pub image_folder: PathBuf,
    /// 推論対象の画像フォルダ
    pub predict_folder: Option<PathBuf>,
    /// true: 親フォルダ名をラベルにする / false: ファイル名の先頭の英字部分
    pub use_folder_name_as_label: bool,
    /// テストデータの割合
    pub test_fraction: f64,
    /// シャッフルと分割のランダムシード
    pub seed: u64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            image_folder: PathBuf::from("assets/images"),
            predict_folder: Some(PathBuf::from("assets/mask_dataset")),
            use_folder_name_as_label: true,
            test_fraction: DEFAULT_TEST_FRACTION,
            seed: 1,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// バックボーンのアーキテクチャ
    pub architecture: Architecture,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// ヘッドのドロップアウト率
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// 事前学習済み重み（mobilenet_v2.mpk）を置くフォルダ
    pub pretrained_dir: PathBuf,
    /// バックボーンの重みを固定してヘッドのみ学習する
    pub freeze_backbone: bool,
}

fn default_dropout() -> f64 {
    0.2
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            architecture: Architecture::MobilenetV2,
            num_epochs: 50,
            batch_size: 10,
            learning_rate: 0.01,
            image_size: 224,
            dropout: default_dropout(),
            pretrained_dir: PathBuf::from("models/pretrained"),
            freeze_backbone: true,
        }
    }
}

/// 出力設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// 学習済みモデル（tar.gz）の保存先。未指定なら保存しない
    pub model_path: Option<PathBuf>,
    /// 予測結果CSVの保存先。未指定なら保存しない
    pub predictions_csv: Option<PathBuf>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            model_path: Some(PathBuf::from("models/mask_detector.tar.gz")),
            predictions_csv: None,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセット設定
    pub data: DataSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// 出力設定
    #[serde(default)]
    pub output: OutputSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// ファイルが存在するのに読めない場合はデフォルトに戻さずエラーにします。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            info!("設定ファイルを読み込みました: {}", path.display());
            Ok(config)
        } else {
            warn!("設定ファイルが存在しません。デフォルト設定を使用します: {}", path.display());
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
            }
        }
        fs::write(path, content).map_err(|e| PipelineError::io(path, e))?;
        info!("設定ファイルを保存しました: {}", path.display());
        Ok(())
    }

    /// パイプライン実行用の設定に変換
    pub fn to_run_options(&self) -> RunOptions {
        RunOptions {
            image_folder: self.data.image_folder.clone(),
            use_folder_name_as_label: self.data.use_folder_name_as_label,
            test_fraction: self.data.test_fraction,
            seed: self.data.seed,
            architecture: self.training.architecture,
            epochs: self.training.num_epochs,
            batch_size: self.training.batch_size,
            learning_rate: self.training.learning_rate,
            predict_folder: self.data.predict_folder.clone(),
        }
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("画像フォルダ: {}", self.data.image_folder.display());
        match &self.data.predict_folder {
            Some(folder) => println!("推論フォルダ: {}", folder.display()),
            None => println!("推論フォルダ: (なし)"),
        }
        println!(
            "ラベル: {}",
            if self.data.use_folder_name_as_label { "フォルダ名" } else { "ファイル名" }
        );
        println!("テストデータの割合: {}", self.data.test_fraction);
        println!("シード: {}", self.data.seed);
        println!("\n--- トレーニング設定 ---");
        println!("アーキテクチャ: {}", self.training.architecture);
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("入力サイズ: {}x{}", self.training.image_size, self.training.image_size);
        println!("事前学習済み重み: {}", self.training.pretrained_dir.display());
        println!("バックボーン固定: {}", self.training.freeze_backbone);
        if let Some(ref model) = self.output.model_path {
            println!("\nモデル保存先: {}", model.display());
        }
        if let Some(ref csv) = self.output.predictions_csv {
            println!("予測CSV: {}", csv.display());
        }
        println!("========================\n");
    }
}
