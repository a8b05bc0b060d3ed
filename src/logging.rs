//! ログ設定
//!
//! `tracing` の出力先を標準エラーに設定します。評価結果や予測結果は
//! `println!` で標準出力に出すため、ログと混ざりません。
//! `RUST_LOG` が設定されている場合はそちらを優先します。

use tracing_subscriber::EnvFilter;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 既定のフィルタ（`RUST_LOG` 未設定時）
    pub default_filter: String,
    /// モジュールパスを表示するか
    pub include_target: bool,
    /// ANSIカラーを使うか
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// デバッグ用の詳細な設定
    pub fn verbose() -> Self {
        Self {
            default_filter: "debug".to_string(),
            include_target: true,
            ansi_colors: true,
        }
    }

    /// `--verbose` フラグに応じた設定
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::verbose()
        } else {
            Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// ログを初期化（2回目以降の呼び出しは無視される）
pub fn init(config: &LogConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(config.include_target)
        .with_ansi(config.ansi_colors)
        .with_writer(std::io::stderr)
        .try_init();
}
