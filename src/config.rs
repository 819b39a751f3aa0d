use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::notify::protocol::MAX_PAYLOAD;

/// アプリケーション設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// レンダラーのソケットパス
    #[serde(default = "crate::notify::socket_path")]
    pub socket_path: PathBuf,
    /// ペイロード上限（終端NUL込み）
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// 書き込みタイムアウト（秒、未設定時は無制限）
    #[serde(default)]
    pub write_timeout_secs: Option<u64>,
    /// ログレベル
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_payload() -> usize {
    MAX_PAYLOAD
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: crate::notify::socket_path(),
            max_payload: default_max_payload(),
            write_timeout_secs: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み（存在しない場合はデフォルト）
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// 指定パスから読み込み
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        Ok(config)
    }

    /// 設定ファイルパスを取得
    pub fn config_path() -> Result<PathBuf> {
        // ~/.config/sfdroid-helpers/config.toml を使用
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))?;
        Ok(base_dirs.home_dir().join(".config/sfdroid-helpers/config.toml"))
    }

    /// 現在の設定をファイルに保存
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        // 0 は「タイムアウトなし」扱い（set_write_timeout は 0 を拒否する）
        self.write_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_points_at_renderer_handle() {
        let config = Config::default();
        assert_eq!(
            config.socket_path,
            PathBuf::from("/tmp/sfdroid/app_helpers_handle")
        );
        assert_eq!(config.max_payload, 5120);
        assert_eq!(config.write_timeout(), None);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("write_timeout_secs = 3\n").unwrap();
        assert_eq!(config.write_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.socket_path, crate::notify::socket_path());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let config = Config {
            write_timeout_secs: Some(0),
            ..Config::default()
        };
        assert_eq!(config.write_timeout(), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let config = Config {
            socket_path: dir.path().join("handle"),
            max_payload: 256,
            write_timeout_secs: Some(5),
            log_level: "debug".to_string(),
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_load_from_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_payload = \"lots\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
