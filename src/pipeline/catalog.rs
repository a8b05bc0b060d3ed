//! 画像カタログの構築
//!
//! ルートフォルダ以下を再帰的に走査し、拡張子でフィルタして
//! (パス, ラベル) のレコード列を遅延生成します。ファイル内容は開きません。

use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};
use crate::types::ImageRecord;

/// カタログ対象の拡張子（大文字小文字を区別、`.JPG` / `.jpeg` は対象外）
pub const IMAGE_EXTENSIONS: [&str; 2] = ["jpg", "png"];

/// ラベルの導出方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMode {
    /// 直上のフォルダ名をラベルにする
    FolderName,
    /// ファイル名の先頭から最初の非英字までをラベルにする
    FileNamePrefix,
}

impl LabelMode {
    pub fn from_flag(use_folder_name_as_label: bool) -> Self {
        if use_folder_name_as_label {
            LabelMode::FolderName
        } else {
            LabelMode::FileNamePrefix
        }
    }
}

/// 画像レコードの遅延イテレータ
pub struct ImageCatalog {
    entries: walkdir::IntoIter,
    mode: LabelMode,
}

/// ディレクトリを走査してカタログを作成
///
/// ルートが存在しない場合は `NotFound` を返します。
/// 走査途中のエラーはイテレータの要素として `Io` で返されます。
pub fn scan(root: &Path, use_folder_name_as_label: bool) -> Result<ImageCatalog> {
    if !root.is_dir() {
        return Err(PipelineError::NotFound(root.to_path_buf()));
    }

    debug!(root = %root.display(), use_folder_name_as_label, "scanning image folder");

    let entries = WalkDir::new(root).sort_by_file_name().into_iter();
    Ok(ImageCatalog {
        entries,
        mode: LabelMode::from_flag(use_folder_name_as_label),
    })
}

/// カタログを全件読み出す
pub fn collect_records(root: &Path, use_folder_name_as_label: bool) -> Result<Vec<ImageRecord>> {
    scan(root, use_folder_name_as_label)?.collect()
}

impl Iterator for ImageCatalog {
    type Item = Result<ImageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    let source = err.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop detected")
                    });
                    return Some(Err(PipelineError::io(path, source)));
                }
            };

            // シンボリックリンクはリンク先で判定
            if !entry.path().is_file() {
                continue;
            }

            let path = entry.into_path();
            if !has_image_extension(&path) {
                continue;
            }

            let label = derive_label(&path, self.mode);
            return Some(Ok(ImageRecord { path, label }));
        }
    }
}

/// ファイル名の最後の `.` 以降が `jpg` または `png` か（完全一致）
///
/// `.jpg` のようにドットで始まる名前も対象にします。
pub fn has_image_extension(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// パスからラベルを導出
pub fn derive_label(path: &Path, mode: LabelMode) -> String {
    match mode {
        LabelMode::FolderName => path
            .parent()
            .and_then(|parent| parent.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        LabelMode::FileNamePrefix => {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            label_from_file_name(&file_name)
        }
    }
}

/// ファイル名を最初の非英字の直前で切り詰める
pub fn label_from_file_name(file_name: &str) -> String {
    file_name.chars().take_while(|c| c.is_alphabetic()).collect()
}
