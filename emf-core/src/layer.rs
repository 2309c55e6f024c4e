use std::collections::{BTreeMap, BTreeSet};

use glam::{DVec2, IVec2};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::attributes::{AttributeBag, AttributeHolder, AttributeHost, AttributeValue, DisplayItemId};
use crate::display::{DisplayItem, RenderSubject};
use crate::errors::MapError;
use crate::geometry::{self, Point2};
use crate::graph::{EntityClass, EntityRef, Line, LineId, Node, NodeId, Shape, ShapeId};
use crate::raster::Canvas;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(u64);

impl LayerId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 挂载尝试的结果。类别不匹配不是错误，而是告知调用方的可恢复结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
    Rejected {
        expected: EntityClass,
        found: EntityClass,
    },
}

/// 一次删除实际移除的实体，以及随之卸载的显示项。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    pub nodes: Vec<NodeId>,
    pub lines: Vec<LineId>,
    pub shapes: Vec<ShapeId>,
    pub detached: Vec<(EntityRef, Vec<DisplayItemId>)>,
}

impl Removal {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.lines.is_empty() && self.shapes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.lines.len() + self.shapes.len()
    }

    pub fn contains(&self, target: EntityRef) -> bool {
        match target {
            EntityRef::Layer => false,
            EntityRef::Node(id) => self.nodes.contains(&id),
            EntityRef::Line(id) => self.lines.contains(&id),
            EntityRef::Shape(id) => self.shapes.contains(&id),
        }
    }

    fn merge(&mut self, other: Removal) {
        self.nodes.extend(other.nodes);
        self.lines.extend(other.lines);
        self.shapes.extend(other.shapes);
        self.detached.extend(other.detached);
    }
}

/// 图层：节点、线、形状三个按 id 去重的集合，外加脏标记与光栅缓存。
///
/// id 单调递增且不复用，`BTreeMap` 的遍历顺序即创建顺序。
#[derive(Debug, Clone)]
pub struct Layer {
    id: LayerId,
    name: String,
    width: u32,
    height: u32,
    nodes: BTreeMap<NodeId, Node>,
    lines: BTreeMap<LineId, Line>,
    shapes: BTreeMap<ShapeId, Shape>,
    next_entity: u64,
    attributes: AttributeHolder,
    dirty: bool,
    raster: Option<RgbaImage>,
}

impl Layer {
    pub fn new(id: LayerId, name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id,
            name: name.into(),
            width,
            height,
            nodes: BTreeMap::new(),
            lines: BTreeMap::new(),
            shapes: BTreeMap::new(),
            next_entity: 0,
            attributes: AttributeHolder::new(),
            dirty: true,
            raster: None,
        }
    }

    #[inline]
    pub fn id(&self) -> LayerId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
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
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// 仅在缓存有效（未脏）时返回光栅。
    pub fn raster(&self) -> Option<&RgbaImage> {
        if self.dirty { None } else { self.raster.as_ref() }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn line(&self, id: LineId) -> Option<&Line> {
        self.lines.get(&id)
    }

    pub fn shape(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    pub fn lines(&self) -> impl Iterator<Item = (LineId, &Line)> + '_ {
        self.lines.iter().map(|(id, line)| (*id, line))
    }

    pub fn shapes(&self) -> impl Iterator<Item = (ShapeId, &Shape)> + '_ {
        self.shapes.iter().map(|(id, shape)| (*id, shape))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }

    /// 某一类别下全部实体的句柄，按创建顺序。
    pub fn entities_of(&self, class: EntityClass) -> Vec<EntityRef> {
        match class {
            EntityClass::Node => self.nodes.keys().map(|id| EntityRef::Node(*id)).collect(),
            EntityClass::Line => self.lines.keys().map(|id| EntityRef::Line(*id)).collect(),
            EntityClass::Shape => self.shapes.keys().map(|id| EntityRef::Shape(*id)).collect(),
            EntityClass::Layer => vec![EntityRef::Layer],
        }
    }

    pub fn contains(&self, target: EntityRef) -> bool {
        match target {
            EntityRef::Layer => true,
            EntityRef::Node(id) => self.nodes.contains_key(&id),
            EntityRef::Line(id) => self.lines.contains_key(&id),
            EntityRef::Shape(id) => self.shapes.contains_key(&id),
        }
    }

    fn allocate(&mut self) -> u64 {
        let raw = self.next_entity;
        self.next_entity += 1;
        raw
    }

    fn missing(&self, target: EntityRef) -> MapError {
        let raw = match target {
            EntityRef::Layer => self.id.get(),
            EntityRef::Node(id) => id.get(),
            EntityRef::Line(id) => id.get(),
            EntityRef::Shape(id) => id.get(),
        };
        MapError::EntityNotFound(target.class(), raw)
    }

    // ---------------------------------------------------------------
    // 拓扑构建
    // ---------------------------------------------------------------

    pub fn add_node(&mut self, position: Point2) -> NodeId {
        let id = NodeId::new(self.allocate());
        let mut node = Node::new(position);
        node.set_owner(Some(self.id));
        self.nodes.insert(id, node);
        self.dirty = true;
        trace!(layer = self.id.get(), node = id.get(), x = position.x(), y = position.y(), "新增节点");
        id
    }

    /// 两个节点之间已有的线（两端关联集合的交集）。
    pub fn existing_line(&self, a: NodeId, b: NodeId) -> Option<LineId> {
        let first = self.nodes.get(&a)?;
        let second = self.nodes.get(&b)?;
        first.lines().find(|line| second.has_line(*line))
    }

    /// 已存在时直接返回原有的线。
    pub fn create_line(&mut self, a: NodeId, b: NodeId) -> Result<LineId, MapError> {
        self.build_line(a, b, None)
    }

    fn build_line(&mut self, a: NodeId, b: NodeId, formed_by: Option<ShapeId>) -> Result<LineId, MapError> {
        if a == b {
            return Err(MapError::DegenerateLine);
        }
        for node in [a, b] {
            if !self.nodes.contains_key(&node) {
                return Err(self.missing(EntityRef::Node(node)));
            }
        }
        if let Some(existing) = self.existing_line(a, b) {
            return Ok(existing);
        }

        let id = LineId::new(self.allocate());
        let mut line = Line::new(a, b, formed_by);
        line.set_owner(Some(self.id));
        self.lines.insert(id, line);
        for node in [a, b] {
            if let Some(node) = self.nodes.get_mut(&node) {
                node.link_line(id);
            }
        }
        self.dirty = true;
        trace!(layer = self.id.get(), line = id.get(), "新增线");
        Ok(id)
    }

    /// 把线标记为由 `shape` 所建（读档恢复用）。线不在该形状边界上时不做修改并返回 `false`。
    pub fn mark_formed_by(&mut self, line: LineId, shape: ShapeId) -> Result<bool, MapError> {
        let on_boundary = self
            .shapes
            .get(&shape)
            .ok_or_else(|| self.missing(EntityRef::Shape(shape)))?
            .lines()
            .contains(&line);
        let missing = self.missing(EntityRef::Line(line));
        let target = self.lines.get_mut(&line).ok_or(missing)?;
        if on_boundary {
            target.set_formed_by(Some(shape));
        }
        Ok(on_boundary)
    }

    /// 顶点集合与给定节点完全一致的形状。
    pub fn existing_shape(&self, nodes: &[NodeId]) -> Option<ShapeId> {
        let vertices: BTreeSet<NodeId> = nodes.iter().copied().collect();
        nodes
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .flat_map(|node| node.shapes())
            .find(|shape| {
                self.shapes
                    .get(shape)
                    .is_some_and(|shape| shape.has_vertex_set(&vertices))
            })
    }

    /// 由节点构建形状。`need_sort` 时先按绕质心角度排序，再按已有连线整理边界顺序；
    /// 相邻节点（含首尾）之间复用已有的线，否则新建并标记为本形状所建。
    pub fn create_shape(&mut self, nodes: &[NodeId], need_sort: bool) -> Result<ShapeId, MapError> {
        let mut seen = BTreeSet::new();
        let unique: Vec<NodeId> = nodes.iter().copied().filter(|id| seen.insert(*id)).collect();
        if unique.len() < 3 {
            return Err(MapError::DegenerateShape(unique.len()));
        }
        if let Some(missing) = unique.iter().find(|id| !self.nodes.contains_key(*id)) {
            return Err(self.missing(EntityRef::Node(*missing)));
        }
        if let Some(existing) = self.existing_shape(&unique) {
            debug!(layer = self.id.get(), shape = existing.get(), "形状已存在，直接复用");
            return Ok(existing);
        }

        let ordered = if need_sort {
            let points: Vec<(NodeId, Point2)> = unique
                .iter()
                .filter_map(|id| self.nodes.get(id).map(|node| (*id, node.position())))
                .collect();
            let sorted = geometry::sort_node_group(&points, None);
            geometry::order_boundary(sorted, |a, b| self.existing_line(a, b).is_some())
        } else {
            unique
        };

        let id = ShapeId::new(self.allocate());
        let count = ordered.len();
        let mut boundary = Vec::with_capacity(count);
        for index in 0..count {
            let line = self.build_line(ordered[index], ordered[(index + 1) % count], Some(id))?;
            if let Some(line) = self.lines.get_mut(&line) {
                line.link_shape(id);
            }
            boundary.push(line);
        }
        for node in &ordered {
            if let Some(node) = self.nodes.get_mut(node) {
                node.link_shape(id);
            }
        }
        let mut shape = Shape::new(ordered, boundary);
        shape.set_owner(Some(self.id));
        self.shapes.insert(id, shape);
        self.dirty = true;
        debug!(layer = self.id.get(), shape = id.get(), vertices = count, "新增形状");
        Ok(id)
    }

    // ---------------------------------------------------------------
    // 级联删除
    // ---------------------------------------------------------------

    /// 仅移除形状本身，边界线与节点保留。
    pub fn delete_shape(&mut self, id: ShapeId) -> Removal {
        let mut removal = Removal::default();
        let Some(mut shape) = self.shapes.remove(&id) else {
            return removal;
        };
        for line in shape.lines() {
            if let Some(line) = self.lines.get_mut(line) {
                line.unlink_shape(id);
            }
        }
        for node in shape.nodes() {
            if let Some(node) = self.nodes.get_mut(node) {
                node.unlink_shape(id);
            }
        }
        shape.set_owner(None);
        let detached = shape.attributes_mut().detach_all();
        removal.shapes.push(id);
        if !detached.is_empty() {
            removal.detached.push((EntityRef::Shape(id), detached));
        }
        self.dirty = true;
        removal
    }

    /// 先删除用到该线的全部形状，再从两端节点解除关联。
    pub fn delete_line(&mut self, id: LineId) -> Removal {
        let mut removal = Removal::default();
        let Some(shapes) = self.lines.get(&id).map(|line| line.shapes().collect::<Vec<_>>()) else {
            return removal;
        };
        for shape in shapes {
            removal.merge(self.delete_shape(shape));
        }
        let Some(mut line) = self.lines.remove(&id) else {
            return removal;
        };
        let (first, second) = line.nodes();
        for node in [first, second] {
            if let Some(node) = self.nodes.get_mut(&node) {
                node.unlink_line(id);
            }
        }
        line.set_owner(None);
        let detached = line.attributes_mut().detach_all();
        removal.lines.push(id);
        if !detached.is_empty() {
            removal.detached.push((EntityRef::Line(id), detached));
        }
        self.dirty = true;
        removal
    }

    /// 删除节点及其关联的全部线与形状。
    pub fn delete_node(&mut self, id: NodeId) -> Removal {
        let mut removal = Removal::default();
        let Some(node) = self.nodes.get(&id) else {
            return removal;
        };
        let lines: Vec<LineId> = node.lines().collect();
        let shapes: Vec<ShapeId> = node.shapes().collect();
        for shape in shapes {
            removal.merge(self.delete_shape(shape));
        }
        for line in lines {
            removal.merge(self.delete_line(line));
        }
        let Some(mut node) = self.nodes.remove(&id) else {
            return removal;
        };
        node.set_owner(None);
        let detached = node.attributes_mut().detach_all();
        removal.nodes.push(id);
        if !detached.is_empty() {
            removal.detached.push((EntityRef::Node(id), detached));
        }
        self.dirty = true;
        debug!(
            layer = self.id.get(),
            node = id.get(),
            lines = removal.lines.len(),
            shapes = removal.shapes.len(),
            "节点已删除"
        );
        removal
    }

    /// 不在图层中的实体视为空操作。
    pub fn delete(&mut self, target: EntityRef) -> Removal {
        match target {
            EntityRef::Layer => Removal::default(),
            EntityRef::Node(id) => self.delete_node(id),
            EntityRef::Line(id) => self.delete_line(id),
            EntityRef::Shape(id) => self.delete_shape(id),
        }
    }

    pub fn delete_many(&mut self, targets: &[EntityRef]) -> Removal {
        let mut removal = Removal::default();
        for target in targets {
            removal.merge(self.delete(*target));
        }
        removal
    }

    // ---------------------------------------------------------------
    // 变换驱动：对一组节点原子地推进同一步变换
    // ---------------------------------------------------------------

    /// 返回实际进入变换状态的节点数。
    pub fn begin_transform(&mut self, nodes: &[NodeId], pivot: Point2) -> usize {
        let mut started = 0;
        for id in nodes {
            if let Some(node) = self.nodes.get_mut(id) {
                if node.begin_transform(pivot) {
                    started += 1;
                }
            }
        }
        started
    }

    pub fn grab(&mut self, nodes: &[NodeId], offset: IVec2, snap: bool) -> bool {
        self.step_transform(nodes, |node| node.grab(offset, snap))
    }

    pub fn rotate(&mut self, nodes: &[NodeId], delta: f64, snap: bool) -> bool {
        self.step_transform(nodes, |node| node.rotate(delta, snap))
    }

    pub fn scale(&mut self, nodes: &[NodeId], factor: f64, snap: bool) -> bool {
        self.step_transform(nodes, |node| node.scale(factor, snap))
    }

    pub fn apply_transform(&mut self, nodes: &[NodeId]) -> bool {
        self.step_transform(nodes, Node::apply_transform)
    }

    pub fn cancel_transform(&mut self, nodes: &[NodeId]) -> bool {
        self.step_transform(nodes, Node::cancel_transform)
    }

    fn step_transform<F>(&mut self, nodes: &[NodeId], mut step: F) -> bool
    where
        F: FnMut(&mut Node) -> bool,
    {
        let mut changed = false;
        for id in nodes {
            if let Some(node) = self.nodes.get_mut(id) {
                changed |= step(node);
            }
        }
        if changed {
            self.dirty = true;
        }
        changed
    }

    // ---------------------------------------------------------------
    // 属性挂载
    // ---------------------------------------------------------------

    fn holder(&self, target: EntityRef) -> Option<&AttributeHolder> {
        match target {
            EntityRef::Layer => Some(&self.attributes),
            EntityRef::Node(id) => self.nodes.get(&id).map(AttributeHost::attributes),
            EntityRef::Line(id) => self.lines.get(&id).map(AttributeHost::attributes),
            EntityRef::Shape(id) => self.shapes.get(&id).map(AttributeHost::attributes),
        }
    }

    fn holder_mut(&mut self, target: EntityRef) -> Option<&mut AttributeHolder> {
        match target {
            EntityRef::Layer => Some(&mut self.attributes),
            EntityRef::Node(id) => self.nodes.get_mut(&id).map(Node::attributes_mut),
            EntityRef::Line(id) => self.lines.get_mut(&id).map(Line::attributes_mut),
            EntityRef::Shape(id) => self.shapes.get_mut(&id).map(Shape::attributes_mut),
        }
    }

    /// 挂载显示项。`values` 缺省时使用显示项的独立属性默认值。
    pub fn attach(
        &mut self,
        target: EntityRef,
        item: &DisplayItem,
        values: Option<AttributeBag>,
    ) -> Result<AttachOutcome, MapError> {
        let found = target.class();
        if !item.accepts(found) {
            return Ok(AttachOutcome::Rejected {
                expected: item.allowed_class(),
                found,
            });
        }
        let missing = self.missing(target);
        let holder = self.holder_mut(target).ok_or(missing)?;
        if holder.is_attached(item.id()) {
            return Ok(AttachOutcome::AlreadyAttached);
        }
        holder.attach(item.id(), values.unwrap_or_else(|| item.individual_defaults()));
        self.dirty = true;
        Ok(AttachOutcome::Attached)
    }

    /// 返回是否写入；未挂载时不修改任何内容。
    pub fn update_attribute_value(
        &mut self,
        target: EntityRef,
        item: DisplayItemId,
        name: &str,
        value: AttributeValue,
    ) -> Result<bool, MapError> {
        let missing = self.missing(target);
        let holder = self.holder_mut(target).ok_or(missing)?;
        let written = holder.update_value(item, name, value);
        if written {
            self.dirty = true;
        }
        Ok(written)
    }

    pub fn detach(&mut self, target: EntityRef, item: DisplayItemId) -> Result<Option<AttributeBag>, MapError> {
        let missing = self.missing(target);
        let holder = self.holder_mut(target).ok_or(missing)?;
        let removed = holder.detach(item);
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// 卸载图层内所有实体上的某个显示项，返回受影响的实体。
    pub fn detach_everywhere(&mut self, item: DisplayItemId) -> Vec<EntityRef> {
        let mut affected = Vec::new();
        if self.attributes.detach(item).is_some() {
            affected.push(EntityRef::Layer);
        }
        for (id, node) in self.nodes.iter_mut() {
            if node.attributes_mut().detach(item).is_some() {
                affected.push(EntityRef::Node(*id));
            }
        }
        for (id, line) in self.lines.iter_mut() {
            if line.attributes_mut().detach(item).is_some() {
                affected.push(EntityRef::Line(*id));
            }
        }
        for (id, shape) in self.shapes.iter_mut() {
            if shape.attributes_mut().detach(item).is_some() {
                affected.push(EntityRef::Shape(*id));
            }
        }
        if !affected.is_empty() {
            self.dirty = true;
        }
        affected
    }

    /// 未挂载或实体不存在时为 `None`。
    pub fn values_for(&self, target: EntityRef, item: DisplayItemId) -> Option<&AttributeBag> {
        self.holder(target)?.values_for(item)
    }

    pub fn current_display_items(&self, target: EntityRef) -> Vec<DisplayItemId> {
        self.holder(target)
            .map(|holder| holder.current_display_items().collect())
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------
    // 几何查询
    // ---------------------------------------------------------------

    pub fn position(&self, node: NodeId) -> Option<Point2> {
        self.nodes.get(&node).map(Node::position)
    }

    pub fn line_endpoints(&self, line: LineId) -> Option<(Point2, Point2)> {
        let (first, second) = self.lines.get(&line)?.nodes();
        Some((self.position(first)?, self.position(second)?))
    }

    pub fn shape_polygon(&self, shape: ShapeId) -> Option<Vec<Point2>> {
        self.shapes
            .get(&shape)?
            .nodes()
            .iter()
            .map(|node| self.position(*node))
            .collect()
    }

    /// 展开混合实体列表为去重后的节点列表（保持首次出现顺序）。
    pub fn nodes_of(&self, items: &[EntityRef]) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut nodes = Vec::new();
        let mut push = |id: NodeId| {
            if seen.insert(id) {
                nodes.push(id);
            }
        };
        for item in items {
            match *item {
                EntityRef::Layer => {}
                EntityRef::Node(id) => {
                    if self.nodes.contains_key(&id) {
                        push(id);
                    }
                }
                EntityRef::Line(id) => {
                    if let Some(line) = self.lines.get(&id) {
                        let (first, second) = line.nodes();
                        push(first);
                        push(second);
                    }
                }
                EntityRef::Shape(id) => {
                    if let Some(shape) = self.shapes.get(&id) {
                        shape.nodes().iter().copied().for_each(&mut push);
                    }
                }
            }
        }
        nodes
    }

    pub fn median(&self, items: &[EntityRef]) -> Option<Point2> {
        let positions: Vec<Point2> = self
            .nodes_of(items)
            .into_iter()
            .filter_map(|id| self.position(id))
            .collect();
        geometry::mean_point(&positions)
    }

    pub fn closest_point_on_line(&self, line: LineId, point: Point2) -> Option<DVec2> {
        let (start, end) = self.line_endpoints(line)?;
        Some(geometry::closest_point_on_segment(point, start, end))
    }

    pub fn point_on_line(&self, line: LineId, t: f64) -> Option<DVec2> {
        let (start, end) = self.line_endpoints(line)?;
        Some(geometry::point_on_segment(start, end, t))
    }

    /// 点选判定：节点与线按距离平方比较阈值，形状按多边形包含。
    pub fn in_select_range(&self, target: EntityRef, cursor: Point2, threshold: f64) -> bool {
        match target {
            EntityRef::Layer => false,
            EntityRef::Node(id) => self
                .position(id)
                .is_some_and(|p| geometry::distance_squared(cursor, p) <= threshold),
            EntityRef::Line(id) => self.line_endpoints(id).is_some_and(|(start, end)| {
                geometry::segment_distance_squared(cursor, start, end) <= threshold
            }),
            EntityRef::Shape(id) => self
                .shape_polygon(id)
                .is_some_and(|polygon| geometry::polygon_contains(&polygon, cursor)),
        }
    }

    /// 指定类别中所有命中光标的实体，按创建顺序。
    pub fn hit_test(&self, class: EntityClass, cursor: Point2, threshold: f64) -> Vec<EntityRef> {
        if class == EntityClass::Layer {
            return Vec::new();
        }
        self.entities_of(class)
            .into_iter()
            .filter(|target| self.in_select_range(*target, cursor, threshold))
            .collect()
    }

    // ---------------------------------------------------------------
    // 尺寸与渲染
    // ---------------------------------------------------------------

    /// 调整画布尺寸并整体平移全部节点。
    pub fn set_dimensions(&mut self, width: u32, height: u32, x_offset: i32, y_offset: i32) {
        self.width = width;
        self.height = height;
        self.translate_all(IVec2::new(x_offset, y_offset));
        self.raster = None;
        self.dirty = true;
        debug!(layer = self.id.get(), width, height, x_offset, y_offset, "图层尺寸已调整");
    }

    fn translate_all(&mut self, offset: IVec2) {
        if offset == IVec2::ZERO {
            return;
        }
        for node in self.nodes.values_mut() {
            node.translate(offset);
        }
    }

    /// 重新绘制光栅并清除脏标记。显示项按逆序绘制，因此先注册的位于最上层。
    pub fn render(&mut self, items: &[DisplayItem]) -> &RgbaImage {
        let mut canvas = Canvas::new(self.width, self.height);
        for item in items.iter().rev() {
            self.render_item(&mut canvas, item);
        }
        self.dirty = false;
        debug!(layer = self.id.get(), items = items.len(), "图层已重绘");
        self.raster.insert(canvas.into_image())
    }

    fn render_item(&self, canvas: &mut Canvas, item: &DisplayItem) {
        let id = item.id();
        match item.allowed_class() {
            EntityClass::Layer => {
                if let Some(values) = self.attributes.values_for(id) {
                    let subject = RenderSubject::Layer {
                        width: self.width,
                        height: self.height,
                    };
                    item.render(canvas, values, &subject);
                }
            }
            EntityClass::Shape => {
                for (shape_id, shape) in &self.shapes {
                    let Some(values) = shape.values_for(id) else {
                        continue;
                    };
                    if let Some(polygon) = self.shape_polygon(*shape_id) {
                        item.render(canvas, values, &RenderSubject::Shape(&polygon));
                    }
                }
            }
            EntityClass::Line => {
                for (line_id, line) in &self.lines {
                    let Some(values) = line.values_for(id) else {
                        continue;
                    };
                    if let Some((start, end)) = self.line_endpoints(*line_id) {
                        item.render(canvas, values, &RenderSubject::Line(start, end));
                    }
                }
            }
            EntityClass::Node => {
                for node in self.nodes.values() {
                    if let Some(values) = node.values_for(id) {
                        item.render(canvas, values, &RenderSubject::Node(node.position()));
                    }
                }
            }
        }
    }
}

impl AttributeHost for Layer {
    fn attributes(&self) -> &AttributeHolder {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Rgba;
    use crate::styles;

    fn layer() -> Layer {
        Layer::new(LayerId::new(0), "Layer 1", 200, 200)
    }

    fn square(layer: &mut Layer) -> [NodeId; 4] {
        [(0, 0), (100, 0), (100, 100), (0, 100)].map(|(x, y)| layer.add_node(Point2::new(x, y)))
    }

    fn item(id: u64, style: Box<dyn crate::display::DisplayStyle>) -> DisplayItem {
        DisplayItem::new(DisplayItemId::new(id), format!("item {id}"), style)
    }

    #[test]
    fn create_line_reuses_existing() {
        let mut layer = layer();
        let a = layer.add_node(Point2::new(0, 0));
        let b = layer.add_node(Point2::new(10, 0));
        let line = layer.create_line(a, b).expect("line");
        assert_eq!(layer.create_line(b, a).expect("reuse"), line);
        assert_eq!(layer.existing_line(a, b), Some(line));
        assert_eq!(layer.line_count(), 1);
        assert!(layer.node(a).is_some_and(|n| n.has_line(line)));
        assert!(layer.node(b).is_some_and(|n| n.has_line(line)));
        assert_eq!(layer.line(line).and_then(Line::owner), Some(layer.id()));

        assert!(matches!(layer.create_line(a, a), Err(MapError::DegenerateLine)));
        assert!(matches!(
            layer.create_line(a, NodeId::new(99)),
            Err(MapError::EntityNotFound(EntityClass::Node, 99))
        ));
    }

    #[test]
    fn square_shape_traces_perimeter_with_new_lines() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let shape_id = layer.create_shape(&nodes, true).expect("shape");
        let shape = layer.shape(shape_id).expect("stored");

        assert_eq!(shape.nodes(), &[nodes[1], nodes[2], nodes[3], nodes[0]]);
        assert_eq!(shape.lines().len(), 4);
        assert_eq!(layer.line_count(), 4);
        for (index, line_id) in shape.lines().iter().enumerate() {
            let line = layer.line(*line_id).expect("boundary line");
            assert_eq!(line.formed_by(), Some(shape_id));
            assert!(line.has_shape(shape_id));
            let a = shape.nodes()[index];
            let b = shape.nodes()[(index + 1) % 4];
            assert!(line.connects(a, b));
        }
        // 没有对角线
        assert_eq!(layer.existing_line(nodes[0], nodes[2]), None);
        assert_eq!(layer.existing_line(nodes[1], nodes[3]), None);
    }

    #[test]
    fn shape_reuses_lines_and_respects_connectivity() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let shared = layer.create_line(nodes[1], nodes[2]).expect("line");
        let shape_id = layer.create_shape(&nodes, true).expect("shape");

        let shape = layer.shape(shape_id).expect("shape");
        assert_eq!(shape.nodes(), &[nodes[1], nodes[2], nodes[3], nodes[0]]);
        assert_eq!(shape.lines()[0], shared);
        let line = layer.line(shared).expect("line");
        assert_eq!(line.formed_by(), None);
        assert!(line.has_shape(shape_id));
        assert_eq!(layer.line_count(), 4);

        // 顶点集合相同则返回已有形状
        let reversed = [nodes[3], nodes[2], nodes[1], nodes[0]];
        assert_eq!(layer.create_shape(&reversed, true).expect("same"), shape_id);
        assert_eq!(layer.existing_shape(&reversed), Some(shape_id));
        assert_eq!(layer.shape_count(), 1);

        assert!(matches!(
            layer.create_shape(&[nodes[0], nodes[1], nodes[1]], true),
            Err(MapError::DegenerateShape(2))
        ));
    }

    #[test]
    fn mark_formed_by_requires_boundary_line() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let edge = layer.create_line(nodes[0], nodes[1]).expect("line");
        let stray = layer.add_node(Point2::new(150, 150));
        let spur = layer.create_line(nodes[2], stray).expect("line");
        let shape = layer.create_shape(&nodes, true).expect("shape");
        assert_eq!(layer.line(edge).and_then(Line::formed_by), None);

        assert_eq!(layer.mark_formed_by(edge, shape), Ok(true));
        assert_eq!(layer.line(edge).and_then(Line::formed_by), Some(shape));
        assert_eq!(layer.mark_formed_by(spur, shape), Ok(false));
        assert_eq!(layer.line(spur).and_then(Line::formed_by), None);
        assert!(matches!(
            layer.mark_formed_by(spur, ShapeId::new(999)),
            Err(MapError::EntityNotFound(EntityClass::Shape, 999))
        ));
    }

    #[test]
    fn deleting_node_cascades_to_lines_and_shapes() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let shape_id = layer.create_shape(&nodes, true).expect("shape");
        let doomed = layer.existing_line(nodes[0], nodes[1]).expect("edge");
        let survivor = layer.existing_line(nodes[1], nodes[2]).expect("edge");

        let removal = layer.delete_node(nodes[0]);
        assert_eq!(removal.nodes, vec![nodes[0]]);
        assert_eq!(removal.shapes, vec![shape_id]);
        assert_eq!(removal.lines.len(), 2);
        assert!(layer.shape(shape_id).is_none());
        assert!(layer.line(doomed).is_none());
        assert!(layer.line(survivor).is_some());
        assert!(!layer.node(nodes[1]).expect("kept").has_line(doomed));
        assert!(!layer.node(nodes[2]).expect("kept").has_shape(shape_id));
        assert!(!layer.line(survivor).expect("kept").has_shape(shape_id));

        // 再删一次是空操作
        assert!(layer.delete_node(nodes[0]).is_empty());
    }

    #[test]
    fn deleting_line_removes_shapes_using_it() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let shape_id = layer.create_shape(&nodes, true).expect("shape");
        let edge = layer.existing_line(nodes[2], nodes[3]).expect("edge");

        let removal = layer.delete(EntityRef::Line(edge));
        assert_eq!(removal.shapes, vec![shape_id]);
        assert_eq!(removal.lines, vec![edge]);
        assert_eq!(layer.node_count(), 4);
        assert_eq!(layer.line_count(), 3);
        assert!(!layer.node(nodes[2]).expect("node").has_line(edge));
    }

    #[test]
    fn deleting_shape_keeps_boundary() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let shape_id = layer.create_shape(&nodes, true).expect("shape");

        let removal = layer.delete_shape(shape_id);
        assert_eq!(removal.shapes, vec![shape_id]);
        assert_eq!(layer.line_count(), 4);
        assert_eq!(layer.node_count(), 4);
        assert!(layer.lines().all(|(_, line)| !line.has_shape(shape_id)));
        assert!(layer.nodes().all(|(_, node)| !node.has_shape(shape_id)));
    }

    #[test]
    fn attach_is_idempotent_and_filtered() {
        let mut layer = layer();
        let node = EntityRef::Node(layer.add_node(Point2::new(5, 5)));
        let circle = item(0, Box::new(styles::ColorCircle));
        let outline = item(1, Box::new(styles::ColorShape));

        assert_eq!(layer.attach(node, &circle, None), Ok(AttachOutcome::Attached));
        layer
            .update_attribute_value(node, circle.id(), "Size", AttributeValue::Int(40))
            .expect("update");
        assert_eq!(layer.attach(node, &circle, None), Ok(AttachOutcome::AlreadyAttached));
        assert_eq!(
            layer.values_for(node, circle.id()).and_then(|bag| bag.get("Size")),
            Some(&AttributeValue::Int(40))
        );
        assert_eq!(layer.current_display_items(node), vec![circle.id()]);

        assert_eq!(
            layer.attach(node, &outline, None),
            Ok(AttachOutcome::Rejected {
                expected: EntityClass::Shape,
                found: EntityClass::Node,
            })
        );
        assert!(layer.values_for(node, outline.id()).is_none());
        assert!(layer.detach(node, outline.id()).expect("node exists").is_none());
    }

    #[test]
    fn render_clears_dirty_flag_until_next_update() {
        let mut layer = layer();
        let node = EntityRef::Node(layer.add_node(Point2::new(50, 50)));
        let circle = item(0, Box::new(styles::ColorCircle));
        layer.attach(node, &circle, None).expect("attach");
        assert!(layer.is_dirty());
        assert!(layer.raster().is_none());

        let items = [circle];
        layer.render(&items);
        assert!(!layer.is_dirty());
        assert!(layer.raster().is_some());

        layer
            .update_attribute_value(node, items[0].id(), "Opacity", AttributeValue::Int(10))
            .expect("update");
        assert!(layer.is_dirty());
        assert!(layer.raster().is_none());
        layer.render(&items);
        assert!(!layer.is_dirty());
    }

    #[test]
    fn earlier_items_paint_on_top() {
        let mut layer = Layer::new(LayerId::new(0), "bg", 4, 4);
        let mut white = item(0, Box::new(styles::ColorBackground));
        white.set_shared_value("FillColor", AttributeValue::Color(Rgba::WHITE));
        let black = item(1, Box::new(styles::ColorBackground));
        layer.attach(EntityRef::Layer, &white, None).expect("attach");
        layer.attach(EntityRef::Layer, &black, None).expect("attach");

        let image = layer.render(&[white, black]);
        assert_eq!(image.get_pixel(0, 0).0, Rgba::WHITE.0);
    }

    #[test]
    fn transforms_mark_dirty_and_cancel_restores() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        layer.render(&[]);

        let pivot = layer.median(&[EntityRef::Node(nodes[0]), EntityRef::Node(nodes[2])]).expect("median");
        assert_eq!(pivot, Point2::new(50, 50));
        assert_eq!(layer.begin_transform(&nodes, pivot), 4);
        assert!(!layer.is_dirty());
        assert!(layer.grab(&nodes, IVec2::new(10, 0), false));
        assert!(layer.is_dirty());
        assert_eq!(layer.position(nodes[0]), Some(Point2::new(10, 0)));

        layer.render(&[]);
        assert!(layer.cancel_transform(&nodes));
        assert!(layer.is_dirty());
        assert_eq!(layer.position(nodes[0]), Some(Point2::new(0, 0)));
    }

    #[test]
    fn begin_transform_counts_only_fresh_nodes() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let pivot = Point2::new(50, 50);

        assert_eq!(layer.begin_transform(&nodes[..2], pivot), 2);
        // 已在变换中的节点与未知节点都不计数
        assert_eq!(layer.begin_transform(&[nodes[0], nodes[1], NodeId::new(99)], pivot), 0);
        assert_eq!(layer.begin_transform(&nodes, pivot), 2);
        // 位置未动，应用后不标脏
        assert!(!layer.apply_transform(&nodes));
        assert!(layer.nodes().all(|(_, node)| !node.is_transforming()));
        assert_eq!(layer.begin_transform(&nodes, pivot), 4);
    }

    #[test]
    fn render_mid_grab_previews_provisional_position() {
        let mut layer = layer();
        let node = layer.add_node(Point2::new(20, 20));
        let circle = item(0, Box::new(styles::ColorCircle));
        layer.attach(EntityRef::Node(node), &circle, None).expect("attach");
        let items = [circle];

        assert_eq!(layer.begin_transform(&[node], Point2::new(20, 20)), 1);
        assert!(layer.grab(&[node], IVec2::new(80, 80), false));
        let image = layer.render(&items);
        assert_eq!(image.get_pixel(100, 100).0, [0, 0, 0, 255]);
        assert_eq!(image.get_pixel(20, 20).0, [0, 0, 0, 0]);

        assert!(layer.cancel_transform(&[node]));
        let image = layer.render(&items);
        assert_eq!(image.get_pixel(20, 20).0, [0, 0, 0, 255]);
        assert_eq!(image.get_pixel(100, 100).0, [0, 0, 0, 0]);
    }

    #[test]
    fn set_dimensions_translates_nodes() {
        let mut layer = layer();
        let node = layer.add_node(Point2::new(10, 10));
        layer.render(&[]);
        layer.set_dimensions(300, 100, 72, -5);
        assert!(layer.is_dirty());
        assert_eq!((layer.width(), layer.height()), (300, 100));
        assert_eq!(layer.position(node), Some(Point2::new(82, 5)));
    }

    #[test]
    fn hit_testing_uses_threshold_and_polygon() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let shape = layer.create_shape(&nodes, true).expect("shape");
        let top = layer.existing_line(nodes[0], nodes[1]).expect("edge");

        assert_eq!(
            layer.hit_test(EntityClass::Node, Point2::new(6, 8), 100.0),
            vec![EntityRef::Node(nodes[0])]
        );
        assert!(layer.hit_test(EntityClass::Node, Point2::new(8, 8), 100.0).is_empty());
        assert!(layer.in_select_range(EntityRef::Line(top), Point2::new(50, 10), 100.0));
        assert!(!layer.in_select_range(EntityRef::Line(top), Point2::new(50, 11), 100.0));
        assert!(layer.in_select_range(EntityRef::Shape(shape), Point2::new(50, 50), 100.0));
        assert!(!layer.in_select_range(EntityRef::Shape(shape), Point2::new(150, 50), 100.0));

        let mid = layer.point_on_line(top, 0.25).expect("line");
        assert_eq!(mid, DVec2::new(25.0, 0.0));
        let closest = layer.closest_point_on_line(top, Point2::new(40, 30)).expect("line");
        assert_eq!(closest, DVec2::new(40.0, 0.0));
    }

    #[test]
    fn nodes_of_deduplicates_mixed_items() {
        let mut layer = layer();
        let nodes = square(&mut layer);
        let shape = layer.create_shape(&nodes, true).expect("shape");
        let line = layer.existing_line(nodes[0], nodes[1]).expect("edge");
        let expanded = layer.nodes_of(&[
            EntityRef::Line(line),
            EntityRef::Shape(shape),
            EntityRef::Node(nodes[0]),
        ]);
        assert_eq!(expanded.len(), 4);
        assert_eq!(layer.median(&[EntityRef::Shape(shape)]), Some(Point2::new(50, 50)));
        assert_eq!(layer.median(&[]), None);
    }
}
