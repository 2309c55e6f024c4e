use std::fs;
use std::path::{Path, PathBuf};

use emf_config::AppConfig;
use emf_core::attributes::{AttributeValue, Rgba};
use emf_core::display::StyleRegistry;
use emf_core::graph::EntityRef;
use emf_core::layer::LayerId;
use emf_core::map::Map;
use emf_core::styles;
use emf_engine::command::{CommandBus, CommandContext, CommandRequest};
use emf_engine::editor::Editor;
use emf_engine::errors::EngineError;
use emf_io::{DocumentLoader, DocumentSaver, IoError, JsonFacade, PngExporter};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("读取命令脚本 {path:?} 失败: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// 一次命令行会话要做的事。
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub open: Option<PathBuf>,
    pub save: Option<PathBuf>,
    pub export: Option<(String, PathBuf)>,
    pub script: Option<PathBuf>,
    pub commands: Vec<String>,
}

/// 把一行文本拆成命令名与参数，空行与 `#` 注释返回 `None`。
pub fn parse_command(line: &str) -> Option<CommandRequest> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let name = parts.next()?;
    Some(CommandRequest::with_args(name, parts))
}

/// 打开或新建地图，依次执行命令，最后按需保存与导出。
pub fn run_session(config: &AppConfig, options: &SessionOptions) -> Result<Editor, AppError> {
    let facade = JsonFacade::new();
    let map = match &options.open {
        Some(path) => facade.load(path)?,
        None => new_map(config),
    };
    let mut editor = Editor::new(map).with_select_threshold(config.editor.select_threshold);
    if options.open.is_none() && config.editor.demo_shape {
        let demo = editor.populate_demo()?;
        info!(shape = demo.shape.get(), "已创建演示方形");
        attach_demo_styles(editor.map_mut())?;
    }

    let mut lines = options.commands.clone();
    if let Some(path) = &options.script {
        let script = fs::read_to_string(path).map_err(|source| AppError::Script {
            path: path.clone(),
            source,
        })?;
        lines.extend(script.lines().map(str::to_string));
    }

    let bus = CommandBus::new();
    for request in lines.iter().filter_map(|line| parse_command(line)) {
        let response = bus.dispatch(&request, &mut CommandContext { editor: &mut editor });
        let message = response.message.unwrap_or_default();
        if response.success {
            println!("[{}] {}", request.name, message);
        } else {
            warn!(command = %request.name, %message, "命令执行失败");
            println!("[{}] 失败: {}", request.name, message);
        }
    }

    print_summary(&editor);

    if let Some(path) = &options.save {
        facade.save(editor.map(), path)?;
        println!("已保存到 {}", path.display());
    }
    if let Some((ranges, path)) = &options.export {
        let path = export_path(config, path);
        let written = PngExporter::new().export(editor.map_mut(), ranges, &path)?;
        for path in written {
            println!("已导出 {}", path.display());
        }
    }
    Ok(editor)
}

fn new_map(config: &AppConfig) -> Map {
    Map::with_squares(
        config.map.width,
        config.map.height,
        config.map.square_size,
        config.map.layers.max(1),
    )
}

/// 相对路径放到配置的导出目录下。
fn export_path(config: &AppConfig, path: &Path) -> PathBuf {
    match &config.export.directory {
        Some(directory) if path.is_relative() => directory.join(path),
        _ => path.to_path_buf(),
    }
}

/// 为演示地图挂上背景、网格与形状/线/节点的基础样式。
fn attach_demo_styles(map: &mut Map) -> Result<(), EngineError> {
    let registry = StyleRegistry::new();
    let Some(layer) = map.current_layer().map(|layer| layer.id()) else {
        return Err(EngineError::NoLayer);
    };
    let register = |map: &mut Map, name: &str, style: &'static str| {
        registry
            .create(style)
            .map(|style| map.register_display_item(name, style))
    };

    let floor = register(map, "Floor", styles::COLOR_BACKGROUND);
    let grid = register(map, "Grid", styles::GRID);
    let rooms = register(map, "Rooms", styles::COLOR_SHAPE);
    let walls = register(map, "Walls", styles::COLOR_LINE);
    let posts = register(map, "Posts", styles::COLOR_CIRCLE);

    if let Some(floor) = floor {
        map.update_shared_attribute(floor, "FillColor", AttributeValue::Color(Rgba::WHITE))?;
        map.attach(layer, EntityRef::Layer, floor, None)?;
    }
    if let Some(grid) = grid {
        map.attach(layer, EntityRef::Layer, grid, None)?;
    }
    if let Some(rooms) = rooms {
        map.update_shared_attribute(rooms, "FillColor", AttributeValue::Color(Rgba::new(180, 160, 120, 255)))?;
    }
    let (nodes, lines, shapes) = targets(map, layer)?;
    for (item, targets) in [(rooms, shapes), (walls, lines), (posts, nodes)] {
        let Some(item) = item else { continue };
        for target in targets {
            map.attach(layer, target, item, None)?;
        }
    }
    Ok(())
}

type Targets = (Vec<EntityRef>, Vec<EntityRef>, Vec<EntityRef>);

fn targets(map: &Map, layer: LayerId) -> Result<Targets, EngineError> {
    let layer = map.layer(layer)?;
    Ok((
        layer.nodes().map(|(id, _)| EntityRef::Node(id)).collect(),
        layer.lines().map(|(id, _)| EntityRef::Line(id)).collect(),
        layer.shapes().map(|(id, _)| EntityRef::Shape(id)).collect(),
    ))
}

fn print_summary(editor: &Editor) {
    let map = editor.map();
    println!("EMF 地图编辑器 CLI");
    println!(
        "地图尺寸 {}x{} 像素，每格 {} 像素",
        map.width(),
        map.height(),
        map.square_size()
    );
    println!("图层：");
    for (index, layer) in map.layers().iter().enumerate() {
        let marker = if index == map.current_layer_index() { "*" } else { " " };
        println!(
            " {marker} {} 节点={} 线={} 形状={}",
            layer.name(),
            layer.node_count(),
            layer.line_count(),
            layer.shape_count()
        );
    }
    println!("显示项：");
    for item in map.display_items() {
        println!("  - {} ({}) 成员={}", item.name(), item.style_name(), item.members().len());
    }
    println!(
        "选择类别={} 已选={} 交互={:?}",
        editor.selection_type(),
        editor.selection_len(),
        editor.interaction_mode()
    );
}
