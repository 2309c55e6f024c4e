use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::attributes::{AttributeBag, AttributeValue, DisplayItemId};
use crate::display::{DisplayItem, DisplayStyle};
use crate::errors::MapError;
use crate::graph::EntityRef;
use crate::layer::{AttachOutcome, Layer, LayerId, Removal};
use crate::raster::Canvas;

/// 每个地图方格的像素边长。
pub const SQUARE_SIZE: u32 = 72;

/// 导出时的图层区间，1 起始且两端包含。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRange {
    pub start: usize,
    pub end: usize,
}

impl LayerRange {
    pub fn single(index: usize) -> Self {
        Self {
            start: index,
            end: index,
        }
    }
}

/// 解析形如 `1,2-3,5` 的区间列表，每个逗号分组对应一张导出图。
pub fn parse_layer_ranges(text: &str) -> Result<Vec<LayerRange>, MapError> {
    let invalid = || MapError::InvalidLayerRange(text.to_string());
    text.split(',')
        .map(|group| {
            let group = group.trim();
            let parse = |value: &str| value.trim().parse::<usize>().map_err(|_| invalid());
            let range = match group.split_once('-') {
                Some((start, end)) if !start.trim().is_empty() => LayerRange {
                    start: parse(start)?,
                    end: parse(end)?,
                },
                Some(_) => return Err(invalid()),
                None => LayerRange::single(parse(group)?),
            };
            if range.start == 0 || range.start > range.end {
                return Err(invalid());
            }
            Ok(range)
        })
        .collect()
}

/// 地图文档：有序图层列表、当前图层以及文档级显示项列表。
///
/// 显示项的成员表与实体上的挂载由本类型同时维护，两侧不会分叉。
#[derive(Debug)]
pub struct Map {
    width: u32,
    height: u32,
    square_size: u32,
    layers: Vec<Layer>,
    current_layer: usize,
    display_items: Vec<DisplayItem>,
    next_layer: u64,
    next_display_item: u64,
}

impl Map {
    /// 创建不含图层的空地图，尺寸单位为像素。
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            square_size: SQUARE_SIZE,
            layers: Vec::new(),
            current_layer: 0,
            display_items: Vec::new(),
            next_layer: 0,
            next_display_item: 0,
        }
    }

    /// 以方格为单位创建地图并添加 `layers` 个空图层。
    pub fn with_squares(width: u32, height: u32, square_size: u32, layers: usize) -> Self {
        let mut map = Self::new(width * square_size, height * square_size);
        map.square_size = square_size;
        for index in 0..layers {
            map.add_layer(format!("Layer {}", index + 1));
        }
        map
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn square_size(&self) -> u32 {
        self.square_size
    }

    // ---------------------------------------------------------------
    // 图层
    // ---------------------------------------------------------------

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_index(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|layer| layer.id() == id)
    }

    pub fn layer(&self, id: LayerId) -> Result<&Layer, MapError> {
        self.layers
            .iter()
            .find(|layer| layer.id() == id)
            .ok_or(MapError::LayerNotFound(id.get()))
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer, MapError> {
        find_layer_mut(&mut self.layers, id)
    }

    /// 新图层追加在末尾并使用地图当前尺寸。
    pub fn add_layer(&mut self, name: impl Into<String>) -> LayerId {
        let id = LayerId::new(self.next_layer);
        self.next_layer += 1;
        self.layers.push(Layer::new(id, name, self.width, self.height));
        debug!(layer = id.get(), count = self.layers.len(), "新增图层");
        id
    }

    #[inline]
    pub fn current_layer_index(&self) -> usize {
        self.current_layer
    }

    pub fn current_layer(&self) -> Option<&Layer> {
        self.layers.get(self.current_layer)
    }

    pub fn current_layer_mut(&mut self) -> Option<&mut Layer> {
        self.layers.get_mut(self.current_layer)
    }

    pub fn set_current_layer(&mut self, index: usize) -> Result<(), MapError> {
        if index >= self.layers.len() {
            return Err(MapError::LayerIndexOutOfRange {
                index,
                count: self.layers.len(),
            });
        }
        self.current_layer = index;
        Ok(())
    }

    // ---------------------------------------------------------------
    // 显示项
    // ---------------------------------------------------------------

    pub fn display_items(&self) -> &[DisplayItem] {
        &self.display_items
    }

    pub fn display_item_index(&self, id: DisplayItemId) -> Option<usize> {
        self.display_items.iter().position(|item| item.id() == id)
    }

    pub fn display_item(&self, id: DisplayItemId) -> Result<&DisplayItem, MapError> {
        self.display_items
            .iter()
            .find(|item| item.id() == id)
            .ok_or(MapError::DisplayItemNotFound(id.get()))
    }

    fn item_position(&self, id: DisplayItemId) -> Result<usize, MapError> {
        self.display_item_index(id)
            .ok_or(MapError::DisplayItemNotFound(id.get()))
    }

    /// 注册新的显示项，追加到列表末尾（绘制时位于最下层）。
    pub fn register_display_item(&mut self, name: impl Into<String>, style: Box<dyn DisplayStyle>) -> DisplayItemId {
        let id = DisplayItemId::new(self.next_display_item);
        self.next_display_item += 1;
        let item = DisplayItem::new(id, name, style);
        debug!(item = id.get(), style = item.style_name(), "注册显示项");
        self.display_items.push(item);
        id
    }

    pub fn rename_display_item(&mut self, id: DisplayItemId, name: impl Into<String>) -> Result<(), MapError> {
        let index = self.item_position(id)?;
        self.display_items[index].set_name(name);
        Ok(())
    }

    /// 调整显示项顺序。绘制次序改变，因此所有图层都被标脏。
    pub fn move_display_item(&mut self, id: DisplayItemId, to: usize) -> Result<(), MapError> {
        let from = self.item_position(id)?;
        let to = to.min(self.display_items.len() - 1);
        if from == to {
            return Ok(());
        }
        let item = self.display_items.remove(from);
        self.display_items.insert(to, item);
        self.layers.iter_mut().for_each(Layer::mark_dirty);
        Ok(())
    }

    /// 移除显示项并从全部成员上卸载。
    pub fn remove_display_item(&mut self, id: DisplayItemId) -> Result<DisplayItem, MapError> {
        let index = self.item_position(id)?;
        let mut item = self.display_items.remove(index);
        for membership in item.take_members() {
            if let Ok(layer) = find_layer_mut(&mut self.layers, membership.layer) {
                layer.detach(membership.target, id)?;
            }
        }
        info!(item = id.get(), "显示项已移除");
        Ok(item)
    }

    /// 挂载显示项并同步成员表。类别不符时返回 `Rejected`，不视为错误。
    pub fn attach(
        &mut self,
        layer: LayerId,
        target: EntityRef,
        item: DisplayItemId,
        values: Option<AttributeBag>,
    ) -> Result<AttachOutcome, MapError> {
        let index = self.item_position(item)?;
        let owner = find_layer_mut(&mut self.layers, layer)?;
        let display_item = &mut self.display_items[index];
        let outcome = owner.attach(target, display_item, values)?;
        match outcome {
            AttachOutcome::Attached | AttachOutcome::AlreadyAttached => {
                display_item.add_member(layer, target);
            }
            AttachOutcome::Rejected { expected, found } => {
                warn!(
                    item = item.get(),
                    expected = expected.label(),
                    found = found.label(),
                    "显示项类别不匹配，忽略挂载"
                );
            }
        }
        Ok(outcome)
    }

    /// 同时解除实体挂载与显示项成员关系；未挂载时返回 `None`。
    pub fn detach(
        &mut self,
        layer: LayerId,
        target: EntityRef,
        item: DisplayItemId,
    ) -> Result<Option<AttributeBag>, MapError> {
        let index = self.item_position(item)?;
        let removed = find_layer_mut(&mut self.layers, layer)?.detach(target, item)?;
        self.display_items[index].remove_member(layer, target);
        Ok(removed)
    }

    pub fn update_attribute_value(
        &mut self,
        layer: LayerId,
        target: EntityRef,
        item: DisplayItemId,
        name: &str,
        value: AttributeValue,
    ) -> Result<bool, MapError> {
        self.item_position(item)?;
        find_layer_mut(&mut self.layers, layer)?.update_attribute_value(target, item, name, value)
    }

    /// 修改共享属性，并通知所有成员所在的图层重绘。
    pub fn update_shared_attribute(
        &mut self,
        item: DisplayItemId,
        name: &str,
        value: AttributeValue,
    ) -> Result<usize, MapError> {
        let index = self.item_position(item)?;
        let display_item = &mut self.display_items[index];
        display_item.set_shared_value(name, value);
        let mut notified = 0;
        for layer in &mut self.layers {
            if display_item.members().iter().any(|m| m.layer == layer.id()) {
                layer.mark_dirty();
                notified += 1;
            }
        }
        debug!(item = item.get(), attribute = name, layers = notified, "共享属性已更新");
        Ok(notified)
    }

    /// 把同一个独立属性值写入全部成员，返回写入的实体数。
    pub fn broadcast_individual_value(
        &mut self,
        item: DisplayItemId,
        name: &str,
        value: AttributeValue,
    ) -> Result<usize, MapError> {
        let index = self.item_position(item)?;
        let members = self.display_items[index].members().to_vec();
        let mut written = 0;
        for membership in members {
            let layer = find_layer_mut(&mut self.layers, membership.layer)?;
            if layer.update_attribute_value(membership.target, item, name, value.clone())? {
                written += 1;
            }
        }
        Ok(written)
    }

    // ---------------------------------------------------------------
    // 拓扑编辑
    // ---------------------------------------------------------------

    /// 级联删除实体，并从显示项成员表中移除被删除的实体。
    pub fn delete(&mut self, layer: LayerId, targets: &[EntityRef]) -> Result<Removal, MapError> {
        let removal = find_layer_mut(&mut self.layers, layer)?.delete_many(targets);
        for (target, items) in &removal.detached {
            for item in items {
                if let Some(index) = self.display_item_index(*item) {
                    self.display_items[index].remove_member(layer, *target);
                }
            }
        }
        Ok(removal)
    }

    // ---------------------------------------------------------------
    // 渲染与导出
    // ---------------------------------------------------------------

    pub fn render_layer(&mut self, id: LayerId) -> Result<&RgbaImage, MapError> {
        let layer = find_layer_mut(&mut self.layers, id)?;
        Ok(layer.render(&self.display_items))
    }

    /// 每个图层的光栅；只重绘脏图层。
    pub fn layer_images(&mut self) -> Vec<&RgbaImage> {
        for layer in &mut self.layers {
            if layer.raster().is_none() {
                layer.render(&self.display_items);
            }
        }
        self.layers.iter().filter_map(Layer::raster).collect()
    }

    /// 按区间合成图层，序号大的图层覆盖在上。
    pub fn composite(&mut self, range: LayerRange) -> Result<RgbaImage, MapError> {
        let count = self.layers.len();
        if range.start == 0 || range.start > range.end || range.end > count {
            return Err(MapError::InvalidLayerRange(format!("{}-{}", range.start, range.end)));
        }
        let (width, height) = (self.width, self.height);
        let images = self.layer_images();
        let mut canvas = Canvas::new(width, height);
        for image in &images[range.start - 1..range.end] {
            canvas.draw_image(image);
        }
        Ok(canvas.into_image())
    }

    /// 按区间字符串导出，每个分组一张合成图。
    pub fn export(&mut self, ranges: &str) -> Result<Vec<RgbaImage>, MapError> {
        parse_layer_ranges(ranges)?
            .into_iter()
            .map(|range| self.composite(range))
            .collect()
    }

    /// 调整全部图层的尺寸（像素）并平移节点。
    pub fn set_dimensions(&mut self, width: u32, height: u32, x_offset: i32, y_offset: i32) {
        self.width = width;
        self.height = height;
        for layer in &mut self.layers {
            layer.set_dimensions(width, height, x_offset, y_offset);
        }
        info!(width, height, x_offset, y_offset, "地图尺寸已调整");
    }

    /// 以方格为单位调整尺寸，偏移同样以方格计。
    pub fn resize_squares(&mut self, width: u32, height: u32, x_offset: i32, y_offset: i32) {
        let square = self.square_size;
        self.set_dimensions(
            width * square,
            height * square,
            x_offset * square as i32,
            y_offset * square as i32,
        );
    }
}

fn find_layer_mut(layers: &mut [Layer], id: LayerId) -> Result<&mut Layer, MapError> {
    layers
        .iter_mut()
        .find(|layer| layer.id() == id)
        .ok_or(MapError::LayerNotFound(id.get()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Rgba;
    use crate::geometry::Point2;
    use crate::graph::{EntityClass, NodeId};
    use crate::styles;

    fn map_with_node() -> (Map, LayerId, EntityRef) {
        let mut map = Map::with_squares(2, 2, SQUARE_SIZE, 2);
        let layer = map.layers()[0].id();
        let node = map
            .layer_mut(layer)
            .map(|layer| layer.add_node(Point2::new(36, 36)))
            .expect("layer");
        (map, layer, EntityRef::Node(node))
    }

    #[test]
    fn ranges_follow_dialog_syntax() {
        assert_eq!(
            parse_layer_ranges("1, 2-3,5").expect("valid"),
            vec![
                LayerRange::single(1),
                LayerRange { start: 2, end: 3 },
                LayerRange::single(5),
            ]
        );
        for bad in ["", "0", "3-1", "-2", "a", "1,,2"] {
            assert!(parse_layer_ranges(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn attach_and_detach_keep_membership_in_sync() {
        let (mut map, layer, node) = map_with_node();
        let circle = map.register_display_item("Pillars", Box::new(styles::ColorCircle));

        assert_eq!(map.attach(layer, node, circle, None), Ok(AttachOutcome::Attached));
        assert_eq!(map.attach(layer, node, circle, None), Ok(AttachOutcome::AlreadyAttached));
        assert_eq!(map.display_item(circle).expect("item").members().len(), 1);

        assert!(map.detach(layer, node, circle).expect("detach").is_some());
        assert!(map.display_item(circle).expect("item").members().is_empty());
        assert!(map.detach(layer, node, circle).expect("detach").is_none());

        let missing = DisplayItemId::new(42);
        assert_eq!(
            map.attach(layer, node, missing, None),
            Err(MapError::DisplayItemNotFound(42))
        );
        assert_eq!(
            map.attach(LayerId::new(9), node, circle, None),
            Err(MapError::LayerNotFound(9))
        );
    }

    #[test]
    fn mismatched_class_is_rejected_without_membership() {
        let (mut map, layer, node) = map_with_node();
        let background = map.register_display_item("Floor", Box::new(styles::ColorBackground));
        assert_eq!(
            map.attach(layer, node, background, None),
            Ok(AttachOutcome::Rejected {
                expected: EntityClass::Layer,
                found: EntityClass::Node,
            })
        );
        assert!(map.display_item(background).expect("item").members().is_empty());
    }

    #[test]
    fn shared_update_dirties_member_layers_only() {
        let (mut map, layer, node) = map_with_node();
        let other = map.layers()[1].id();
        let circle = map.register_display_item("Pillars", Box::new(styles::ColorCircle));
        map.attach(layer, node, circle, None).expect("attach");
        map.layer_images();
        assert!(map.layers().iter().all(|layer| !layer.is_dirty()));

        let notified = map
            .update_shared_attribute(circle, "FillColor", AttributeValue::Color(Rgba::WHITE))
            .expect("update");
        assert_eq!(notified, 1);
        assert!(map.layer(layer).expect("layer").is_dirty());
        assert!(!map.layer(other).expect("layer").is_dirty());
    }

    #[test]
    fn broadcast_writes_every_member() {
        let (mut map, layer, node) = map_with_node();
        let second = map
            .layer_mut(layer)
            .map(|layer| EntityRef::Node(layer.add_node(Point2::new(100, 100))))
            .expect("layer");
        let circle = map.register_display_item("Pillars", Box::new(styles::ColorCircle));
        map.attach(layer, node, circle, None).expect("attach");
        map.attach(layer, second, circle, None).expect("attach");

        let written = map
            .broadcast_individual_value(circle, "Size", AttributeValue::Int(60))
            .expect("broadcast");
        assert_eq!(written, 2);
        let layer = map.layer(layer).expect("layer");
        for target in [node, second] {
            assert_eq!(
                layer.values_for(target, circle).and_then(|bag| bag.get("Size")),
                Some(&AttributeValue::Int(60))
            );
        }
    }

    #[test]
    fn delete_and_remove_drop_memberships() {
        let (mut map, layer, node) = map_with_node();
        let circle = map.register_display_item("Pillars", Box::new(styles::ColorCircle));
        let floor = map.register_display_item("Floor", Box::new(styles::ColorBackground));
        map.attach(layer, node, circle, None).expect("attach");
        map.attach(layer, EntityRef::Layer, floor, None).expect("attach");

        let removal = map.delete(layer, &[node]).expect("delete");
        assert_eq!(removal.detached, vec![(node, vec![circle])]);
        assert!(map.display_item(circle).expect("item").members().is_empty());

        let removed = map.remove_display_item(floor).expect("remove");
        assert_eq!(removed.name(), "Floor");
        assert!(map
            .layer(layer)
            .expect("layer")
            .values_for(EntityRef::Layer, floor)
            .is_none());
        assert_eq!(map.display_items().len(), 1);

        // 不存在的实体删除为空操作
        let removal = map.delete(layer, &[EntityRef::Node(NodeId::new(77))]).expect("delete");
        assert!(removal.is_empty());
    }

    #[test]
    fn reorder_dirties_every_layer() {
        let (mut map, _, _) = map_with_node();
        let first = map.register_display_item("A", Box::new(styles::Grid));
        let second = map.register_display_item("B", Box::new(styles::Grid));
        map.layer_images();
        map.move_display_item(second, 0).expect("move");
        assert_eq!(map.display_items()[0].id(), second);
        assert_eq!(map.display_items()[1].id(), first);
        assert!(map.layers().iter().all(Layer::is_dirty));
    }

    #[test]
    fn composite_draws_higher_layers_on_top() {
        let mut map = Map::new(4, 4);
        let bottom = map.add_layer("bottom");
        let top = map.add_layer("top");
        let white = map.register_display_item("White", Box::new(styles::ColorBackground));
        let black = map.register_display_item("Black", Box::new(styles::ColorBackground));
        map.update_shared_attribute(white, "FillColor", AttributeValue::Color(Rgba::WHITE))
            .expect("update");
        map.attach(bottom, EntityRef::Layer, white, None).expect("attach");
        map.attach(top, EntityRef::Layer, black, None).expect("attach");

        let both = map.composite(LayerRange { start: 1, end: 2 }).expect("composite");
        assert_eq!(both.get_pixel(0, 0).0, Rgba::BLACK.0);
        let lower = map.composite(LayerRange::single(1)).expect("composite");
        assert_eq!(lower.get_pixel(0, 0).0, Rgba::WHITE.0);
        assert!(map.composite(LayerRange::single(3)).is_err());

        let exported = map.export("1,1-2").expect("export");
        assert_eq!(exported.len(), 2);
    }

    #[test]
    fn resize_in_squares_translates_all_layers() {
        let (mut map, layer, node) = map_with_node();
        map.resize_squares(4, 3, 1, -1);
        assert_eq!((map.width(), map.height()), (288, 216));
        let layer = map.layer(layer).expect("layer");
        assert_eq!((layer.width(), layer.height()), (288, 216));
        let EntityRef::Node(node) = node else { unreachable!() };
        assert_eq!(layer.position(node), Some(Point2::new(108, -36)));

        assert!(map.set_current_layer(1).is_ok());
        assert!(map.set_current_layer(5).is_err());
    }
}
