use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use emf_core::attributes::{AttributeBag, DisplayItemId};
use emf_core::display::StyleRegistry;
use emf_core::errors::MapError;
use emf_core::geometry::Point2;
use emf_core::graph::{EntityRef, NodeId, ShapeId};
use emf_core::layer::{AttachOutcome, Layer, LayerId};
use emf_core::map::{Map, parse_layer_ranges};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode image {path:?}: {source}")]
    ImageError {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
    #[error(transparent)]
    Map(#[from] MapError),
}

pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Map, IoError>;
}

pub trait DocumentSaver {
    fn save(&self, map: &Map, path: &Path) -> Result<(), IoError>;
}

/// 持久化格式中的挂载表：显示项在文档列表中的序号到独立属性值。
type ItemBags = BTreeMap<usize, AttributeBag>;

#[derive(Debug, Serialize, Deserialize)]
struct MapRecord {
    width: u32,
    height: u32,
    #[serde(default)]
    display_items: Vec<DisplayItemRecord>,
    #[serde(default)]
    layers: Vec<LayerRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DisplayItemRecord {
    name: String,
    style: String,
    #[serde(default)]
    shared: AttributeBag,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerRecord {
    name: String,
    width: u32,
    height: u32,
    #[serde(default)]
    display_items: ItemBags,
    #[serde(default)]
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    lines: Vec<LineRecord>,
    #[serde(default)]
    shapes: Vec<ShapeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    x: i32,
    y: i32,
    #[serde(default)]
    display_items: ItemBags,
}

#[derive(Debug, Serialize, Deserialize)]
struct LineRecord {
    nodes: [usize; 2],
    /// 建出这条线的形状在 `shapes` 中的下标。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formed_by: Option<usize>,
    #[serde(default)]
    display_items: ItemBags,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShapeRecord {
    nodes: Vec<usize>,
    #[serde(default)]
    display_items: ItemBags,
}

/// JSON 文档读写。样式名通过注册表还原为显示项模板。
#[derive(Debug, Default)]
pub struct JsonFacade {
    registry: StyleRegistry,
}

impl JsonFacade {
    pub fn new() -> Self {
        Self::with_registry(StyleRegistry::new())
    }

    pub fn with_registry(registry: StyleRegistry) -> Self {
        Self { registry }
    }

    pub fn to_json(&self, map: &Map) -> Result<String, IoError> {
        Ok(serde_json::to_string_pretty(&snapshot(map))?)
    }

    pub fn from_json(&self, text: &str) -> Result<Map, IoError> {
        let record: MapRecord = serde_json::from_str(text)?;
        self.rebuild(record)
    }

    fn rebuild(&self, record: MapRecord) -> Result<Map, IoError> {
        let mut map = Map::new(record.width, record.height);
        let mut items = Vec::with_capacity(record.display_items.len());
        for item in record.display_items {
            let style = self.registry.create(&item.style).ok_or_else(|| {
                IoError::InvalidDocument(format!("unknown display style `{}`", item.style))
            })?;
            let id = map.register_display_item(item.name, style);
            for (name, value) in item.shared {
                map.update_shared_attribute(id, &name, value)?;
            }
            items.push(id);
        }

        for layer in record.layers {
            let layer_id = map.add_layer(layer.name.clone());
            rebuild_layer(&mut map, layer_id, &items, layer)?;
        }
        info!(
            layers = map.layer_count(),
            display_items = map.display_items().len(),
            "地图文档已加载"
        );
        Ok(map)
    }
}

impl DocumentLoader for JsonFacade {
    fn load(&self, path: &Path) -> Result<Map, IoError> {
        let data = fs::read_to_string(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.from_json(&data)
    }
}

impl DocumentSaver for JsonFacade {
    fn save(&self, map: &Map, path: &Path) -> Result<(), IoError> {
        let data = self.to_json(map)?;
        fs::write(path, data).map_err(|source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, "地图文档已保存");
        Ok(())
    }
}

fn snapshot(map: &Map) -> MapRecord {
    let display_items = map
        .display_items()
        .iter()
        .map(|item| DisplayItemRecord {
            name: item.name().to_string(),
            style: item.style_name().to_string(),
            shared: item.shared_values().clone(),
        })
        .collect();
    let layers = map.layers().iter().map(|layer| snapshot_layer(map, layer)).collect();
    MapRecord {
        width: map.width(),
        height: map.height(),
        display_items,
        layers,
    }
}

fn snapshot_layer(map: &Map, layer: &Layer) -> LayerRecord {
    let bags = |target: EntityRef| -> ItemBags {
        layer
            .current_display_items(target)
            .into_iter()
            .filter_map(|id| {
                let index = map.display_item_index(id)?;
                Some((index, layer.values_for(target, id)?.clone()))
            })
            .collect()
    };

    let node_index: BTreeMap<NodeId, usize> = layer
        .nodes()
        .enumerate()
        .map(|(index, (id, _))| (id, index))
        .collect();
    let nodes = layer
        .nodes()
        .map(|(id, node)| NodeRecord {
            x: node.position().x(),
            y: node.position().y(),
            display_items: bags(EntityRef::Node(id)),
        })
        .collect();
    let shape_index: BTreeMap<ShapeId, usize> = layer
        .shapes()
        .enumerate()
        .map(|(index, (id, _))| (id, index))
        .collect();
    let lines = layer
        .lines()
        .filter_map(|(id, line)| {
            let (a, b) = line.nodes();
            Some(LineRecord {
                nodes: [*node_index.get(&a)?, *node_index.get(&b)?],
                formed_by: line.formed_by().and_then(|shape| shape_index.get(&shape).copied()),
                display_items: bags(EntityRef::Line(id)),
            })
        })
        .collect();
    let shapes = layer
        .shapes()
        .filter_map(|(id, shape)| {
            let nodes = shape
                .nodes()
                .iter()
                .map(|node| node_index.get(node).copied())
                .collect::<Option<Vec<_>>>()?;
            Some(ShapeRecord {
                nodes,
                display_items: bags(EntityRef::Shape(id)),
            })
        })
        .collect();

    LayerRecord {
        name: layer.name().to_string(),
        width: layer.width(),
        height: layer.height(),
        display_items: bags(EntityRef::Layer),
        nodes,
        lines,
        shapes,
    }
}

/// 先节点后线再形状，形状因此复用已保存的线。
fn rebuild_layer(
    map: &mut Map,
    layer_id: LayerId,
    items: &[DisplayItemId],
    record: LayerRecord,
) -> Result<(), IoError> {
    let layer = map.layer_mut(layer_id)?;
    if (layer.width(), layer.height()) != (record.width, record.height) {
        layer.set_dimensions(record.width, record.height, 0, 0);
    }

    let mut attachments = vec![(EntityRef::Layer, record.display_items)];
    let mut nodes = Vec::with_capacity(record.nodes.len());
    for node in record.nodes {
        let id = layer.add_node(Point2::new(node.x, node.y));
        attachments.push((EntityRef::Node(id), node.display_items));
        nodes.push(id);
    }
    let lookup = |index: usize| {
        nodes.get(index).copied().ok_or_else(|| {
            IoError::InvalidDocument(format!("node index {index} out of range"))
        })
    };
    let mut tagged = Vec::new();
    for line in record.lines {
        let id = layer.create_line(lookup(line.nodes[0])?, lookup(line.nodes[1])?)?;
        if let Some(shape) = line.formed_by {
            tagged.push((id, shape));
        }
        attachments.push((EntityRef::Line(id), line.display_items));
    }
    let mut shapes = Vec::with_capacity(record.shapes.len());
    for shape in record.shapes {
        let vertices = shape
            .nodes
            .iter()
            .map(|index| lookup(*index))
            .collect::<Result<Vec<_>, _>>()?;
        let id = layer.create_shape(&vertices, false)?;
        attachments.push((EntityRef::Shape(id), shape.display_items));
        shapes.push(id);
    }
    for (line, index) in tagged {
        let shape = shapes.get(index).copied().ok_or_else(|| {
            IoError::InvalidDocument(format!("shape index {index} out of range"))
        })?;
        if !layer.mark_formed_by(line, shape)? {
            return Err(IoError::InvalidDocument(format!(
                "line tagged with shape {index} is not on its boundary"
            )));
        }
    }

    for (target, bags) in attachments {
        for (index, bag) in bags {
            let item = items.get(index).copied().ok_or_else(|| {
                IoError::InvalidDocument(format!("display item index {index} out of range"))
            })?;
            if let AttachOutcome::Rejected { expected, found } =
                map.attach(layer_id, target, item, Some(bag))?
            {
                return Err(IoError::InvalidDocument(format!(
                    "display item {index} accepts {expected}, found {found}"
                )));
            }
        }
    }
    Ok(())
}

/// 导出对话框的两种预设区间。
pub fn single_image_ranges(layer_count: usize) -> String {
    match layer_count {
        0 | 1 => "1".to_string(),
        count => format!("1-{count}"),
    }
}

pub fn image_per_layer_ranges(layer_count: usize) -> String {
    (1..=layer_count.max(1))
        .map(|index| index.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// 按区间字符串把合成图写成 PNG。多个分组时文件名追加 `_序号`（0 起始）。
#[derive(Debug, Default)]
pub struct PngExporter;

impl PngExporter {
    pub fn new() -> Self {
        Self
    }

    /// 输出路径去掉 `.png` 后缀作为前缀。
    pub fn output_paths(&self, path: &Path, groups: usize) -> Vec<PathBuf> {
        let base = path.to_string_lossy();
        let base = base.strip_suffix(".png").unwrap_or(&*base);
        if groups <= 1 {
            return vec![PathBuf::from(format!("{base}.png"))];
        }
        (0..groups)
            .map(|index| PathBuf::from(format!("{base}_{index}.png")))
            .collect()
    }

    pub fn export(&self, map: &mut Map, ranges: &str, path: &Path) -> Result<Vec<PathBuf>, IoError> {
        let groups = parse_layer_ranges(ranges)?.len();
        let images = map.export(ranges)?;
        let paths = self.output_paths(path, groups);
        for (image, path) in images.iter().zip(&paths) {
            image
                .save_with_format(path, image::ImageFormat::Png)
                .map_err(|source| IoError::ImageError {
                    path: path.clone(),
                    source,
                })?;
            debug!(?path, "已导出图像");
        }
        info!(ranges, images = paths.len(), "导出完成");
        Ok(paths)
    }
}
