//! mask_detector CLI
//!
//! 画像フォルダから分類器を学習し、評価結果と推論結果をコンソールに出力します。

#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use mask_detector_lib::logging::{self, LogConfig};
use mask_detector_lib::model::{
    load_metadata, print_metadata_info, save_model_with_metadata, AppConfig, DeviceType, ModelMetadata,
};
use mask_detector_lib::pipeline::{self, report, Architecture, BackboneTrainer, FittedPipeline};

/// 転移学習による画像分類
#[derive(Parser, Debug)]
#[command(name = "mask_detector")]
#[command(version)]
#[command(about = "Transfer-learning image classifier: train, evaluate and predict", long_about = None)]
struct Cli {
    /// 詳細なログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 設定ファイル（JSON）
    #[arg(short, long, global = true, default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 学習、評価、推論をまとめて実行
    Run {
        /// 学習画像のルートフォルダ
        #[arg(long)]
        image_folder: Option<PathBuf>,

        /// 推論対象の画像フォルダ
        #[arg(long)]
        predict_folder: Option<PathBuf>,

        /// 推論を行わない
        #[arg(long, conflicts_with = "predict_folder")]
        no_predict: bool,

        /// ファイル名の先頭の英字部分をラベルにする（既定はフォルダ名）
        #[arg(long)]
        filename_labels: bool,

        /// バックボーン (mobilenetv2 / compactcnn)
        #[arg(short, long)]
        architecture: Option<Architecture>,

        /// エポック数
        #[arg(short, long)]
        epochs: Option<usize>,

        /// バッチサイズ
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// 学習率
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// テストデータの割合
        #[arg(long)]
        test_fraction: Option<f64>,

        /// ランダムシード
        #[arg(long)]
        seed: Option<u64>,

        /// 計算デバイス (wgpu / cpu)
        #[arg(short, long)]
        device: Option<DeviceType>,

        /// 学習済みモデルの保存先
        #[arg(short, long)]
        model_out: Option<PathBuf>,

        /// 予測結果CSVの保存先
        #[arg(long)]
        predictions_csv: Option<PathBuf>,
    },

    /// 保存済みモデルでフォルダ内の画像を推論
    Predict {
        /// モデルファイル (.tar.gz)
        #[arg(short, long)]
        model: PathBuf,

        /// 推論対象の画像フォルダ
        folder: PathBuf,

        /// 計算デバイス (wgpu / cpu)
        #[arg(short, long)]
        device: Option<DeviceType>,

        /// 予測結果CSVの保存先
        #[arg(long)]
        predictions_csv: Option<PathBuf>,
    },

    /// モデルファイルのメタデータを表示
    Info {
        /// モデルファイル (.tar.gz)
        model: PathBuf,
    },

    /// 既定の設定ファイルを書き出す
    InitConfig {
        /// 既存のファイルを上書きする
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig::from_verbose(cli.verbose));

    match cli.command {
        Commands::Run {
            image_folder,
            predict_folder,
            no_predict,
            filename_labels,
            architecture,
            epochs,
            batch_size,
            learning_rate,
            test_fraction,
            seed,
            device,
            model_out,
            predictions_csv,
        } => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            if let Some(folder) = image_folder {
                config.data.image_folder = folder;
            }
            if let Some(folder) = predict_folder {
                config.data.predict_folder = Some(folder);
            }
            if no_predict {
                config.data.predict_folder = None;
            }
            if filename_labels {
                config.data.use_folder_name_as_label = false;
            }
            if let Some(architecture) = architecture {
                config.training.architecture = architecture;
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(learning_rate) = learning_rate {
                config.training.learning_rate = learning_rate;
            }
            if let Some(test_fraction) = test_fraction {
                config.data.test_fraction = test_fraction;
            }
            if let Some(seed) = seed {
                config.data.seed = seed;
            }
            if let Some(device) = device {
                config.device_type = device;
            }
            if model_out.is_some() {
                config.output.model_path = model_out;
            }
            if predictions_csv.is_some() {
                config.output.predictions_csv = predictions_csv;
            }
            run(&config)
        }
        Commands::Predict {
            model,
            folder,
            device,
            predictions_csv,
        } => {
            let config = AppConfig::load_or_default(&cli.config)?;
            let device = device.unwrap_or(config.device_type);
            let pipeline = load_pipeline(&model, device)?;
            let images = pipeline::load_images(&folder)?;
            let predictions = pipeline::predict_all(&pipeline, &images)?;
            report::print_predictions(&predictions);
            if let Some(csv) = predictions_csv {
                report::write_predictions_csv(&csv, pipeline.label_map().labels(), &predictions)?;
                info!("予測結果を保存しました: {}", csv.display());
            }
            Ok(())
        }
        Commands::Info { model } => {
            let metadata = load_metadata(&model)
                .with_context(|| format!("Failed to read model metadata: {}", model.display()))?;
            print_metadata_info(&metadata);
            Ok(())
        }
        Commands::InitConfig { force } => {
            if cli.config.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    cli.config.display()
                );
            }
            AppConfig::default().save(&cli.config)?;
            println!("設定ファイルを作成しました: {}", cli.config.display());
            Ok(())
        }
    }
}

/// 学習から推論までを実行し、結果を出力
fn run(config: &AppConfig) -> Result<()> {
    config.display();

    let options = config.to_run_options();
    let trainer = make_trainer(config)?;

    let outcome = pipeline::run(&options, trainer.as_ref(), |metrics| println!("{}", metrics))
        .context("Pipeline run failed")?;
    info!("学習データ: {} 枚, 評価データ: {} 枚", outcome.train_len, outcome.test_len);

    report::print_evaluation(&outcome.metrics, &options.architecture.to_string());

    if !outcome.predictions.is_empty() {
        report::print_predictions(&outcome.predictions);
    }
    if let Some(csv) = &config.output.predictions_csv {
        report::write_predictions_csv(csv, outcome.pipeline.label_map().labels(), &outcome.predictions)?;
        info!("予測結果を保存しました: {}", csv.display());
    }

    if let Some(model_path) = &config.output.model_path {
        save_pipeline(config, &outcome.pipeline, outcome.train_len, model_path)?;
    }

    Ok(())
}

/// 学習済みパイプラインをtar.gzに保存
fn save_pipeline(config: &AppConfig, pipeline: &FittedPipeline, train_len: usize, model_path: &Path) -> Result<()> {
    let weights = pipeline
        .scorer()
        .export_weights()
        .context("Failed to export model weights")?;
    let metadata = ModelMetadata::new(
        pipeline.label_map(),
        config.training.architecture,
        config.training.image_size as u32,
        config.training.num_epochs as u32,
        config.training.batch_size as u32,
        config.training.learning_rate,
        config.data.seed,
        train_len,
    );
    let saved = save_model_with_metadata(model_path, &metadata, &weights)?;
    println!("モデルを保存しました: {}", saved.display());
    Ok(())
}

#[cfg(feature = "ml")]
fn make_trainer(config: &AppConfig) -> Result<Box<dyn BackboneTrainer>> {
    use mask_detector_lib::ml::{BurnTrainer, BurnTrainerSettings};

    let settings = BurnTrainerSettings::from_training(config.device_type, &config.training);
    Ok(Box::new(BurnTrainer::new(settings)))
}

#[cfg(not(feature = "ml"))]
fn make_trainer(_config: &AppConfig) -> Result<Box<dyn BackboneTrainer>> {
    anyhow::bail!("this build has no trainer; rebuild with `--features ml`")
}

#[cfg(feature = "ml")]
fn load_pipeline(model_path: &Path, device: DeviceType) -> Result<FittedPipeline> {
    mask_detector_lib::ml::InferenceEngine::load(model_path, device)
        .with_context(|| format!("Failed to load model: {}", model_path.display()))
}

#[cfg(not(feature = "ml"))]
fn load_pipeline(_model_path: &Path, _device: DeviceType) -> Result<FittedPipeline> {
    anyhow::bail!("this build cannot load models; rebuild with `--features ml`")
}
