use std::path::PathBuf;

use emf_config::{AppConfig, ConfigError};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod cli;

use cli::SessionOptions;

fn main() {
    let mut args = std::env::args().skip(1);
    let mut config_override: Option<PathBuf> = None;
    let mut options = SessionOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_override = Some(PathBuf::from(required(&mut args, "--config", "配置文件路径"))),
            "--open" => options.open = Some(PathBuf::from(required(&mut args, "--open", "地图文件路径"))),
            "--save" => options.save = Some(PathBuf::from(required(&mut args, "--save", "保存路径"))),
            "--script" => options.script = Some(PathBuf::from(required(&mut args, "--script", "命令脚本路径"))),
            "--command" | "-c" => options.commands.push(required(&mut args, "--command", "命令文本")),
            "--export" => {
                let ranges = required(&mut args, "--export", "图层区间（如 1,2-3）");
                let path = PathBuf::from(required(&mut args, "--export", "导出路径"));
                options.export = Some((ranges, path));
            }
            other => {
                eprintln!("未知参数：{other}");
                std::process::exit(1);
            }
        }
    }

    let config = load_configuration(config_override);
    init_logging(&config);
    info!("启动 EMF 地图编辑器");

    if let Err(err) = cli::run_session(&config, &options) {
        error!(error = %err, "会话执行失败");
        std::process::exit(1);
    }
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str, what: &str) -> String {
    args.next().unwrap_or_else(|| {
        eprintln!("`{flag}` 需要提供{what}");
        std::process::exit(1);
    })
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        warn!(path = %path.display(), error = %err, "加载默认配置失败，使用内建默认值");
                    }
                    ConfigError::Context { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
