use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// 指定配置文件路径的环境变量。
pub const CONFIG_ENV: &str = "EMF_CONFIG";

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub editor: EditorConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl AppConfig {
    /// 从显式路径加载配置。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 自动发现配置文件：优先读取环境变量 `EMF_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 新建地图的尺寸，宽高以方格计。
#[derive(Debug, Clone, Deserialize)]
pub struct MapConfig {
    #[serde(default = "MapConfig::default_squares")]
    pub width: u32,
    #[serde(default = "MapConfig::default_squares")]
    pub height: u32,
    #[serde(default = "MapConfig::default_square_size")]
    pub square_size: u32,
    #[serde(default = "MapConfig::default_layers")]
    pub layers: usize,
}

impl MapConfig {
    fn default_squares() -> u32 {
        10
    }

    fn default_square_size() -> u32 {
        72
    }

    fn default_layers() -> usize {
        1
    }

    /// 像素尺寸。
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width * self.square_size, self.height * self.square_size)
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            width: Self::default_squares(),
            height: Self::default_squares(),
            square_size: Self::default_square_size(),
            layers: Self::default_layers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditorConfig {
    /// 点选半径的平方（像素²）。
    #[serde(default = "EditorConfig::default_select_threshold")]
    pub select_threshold: f64,
    #[serde(default = "EditorConfig::default_demo_shape")]
    pub demo_shape: bool,
}

impl EditorConfig {
    fn default_select_threshold() -> f64 {
        100.0
    }

    fn default_demo_shape() -> bool {
        true
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            select_threshold: Self::default_select_threshold(),
            demo_shape: Self::default_demo_shape(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
}
