use std::collections::BTreeSet;
use std::fmt;

use glam::{DVec2, IVec2};
use serde::{Deserialize, Serialize};

use crate::attributes::{AttributeHolder, AttributeHost};
use crate::geometry::{
    self, GRAB_SNAP, MIN_PIVOT_DISTANCE, Point2, ROTATE_SNAP, SCALE_SNAP, snap_down,
    snap_down_i32,
};
use crate::layer::LayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineId(u64);

impl LineId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeId(u64);

impl ShapeId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 显示项允许挂载的实体类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityClass {
    Node,
    Line,
    Shape,
    Layer,
}

impl EntityClass {
    pub fn label(self) -> &'static str {
        match self {
            EntityClass::Node => "node",
            EntityClass::Line => "line",
            EntityClass::Shape => "shape",
            EntityClass::Layer => "layer",
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 图层内实体的句柄。`Layer` 指图层自身（背景、网格等图层级显示项）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityRef {
    Layer,
    Node(NodeId),
    Line(LineId),
    Shape(ShapeId),
}

impl EntityRef {
    pub fn class(self) -> EntityClass {
        match self {
            EntityRef::Layer => EntityClass::Layer,
            EntityRef::Node(_) => EntityClass::Node,
            EntityRef::Line(_) => EntityClass::Line,
            EntityRef::Shape(_) => EntityClass::Shape,
        }
    }
}

impl From<NodeId> for EntityRef {
    fn from(value: NodeId) -> Self {
        EntityRef::Node(value)
    }
}

impl From<LineId> for EntityRef {
    fn from(value: LineId) -> Self {
        EntityRef::Line(value)
    }
}

impl From<ShapeId> for EntityRef {
    fn from(value: ShapeId) -> Self {
        EntityRef::Shape(value)
    }
}

/// 变换开始时记录的临时数据。
#[derive(Debug, Clone, Copy, PartialEq)]
struct TransformState {
    snapshot: Point2,
    pivot: Point2,
    offset: DVec2,
    angle: f64,
    distance: f64,
}

/// 图中的点。位置只能通过变换状态机修改。
#[derive(Debug, Clone)]
pub struct Node {
    position: Point2,
    lines: BTreeSet<LineId>,
    shapes: BTreeSet<ShapeId>,
    transform: Option<TransformState>,
    owner: Option<LayerId>,
    attributes: AttributeHolder,
}

impl Node {
    pub(crate) fn new(position: Point2) -> Self {
        Self {
            position,
            lines: BTreeSet::new(),
            shapes: BTreeSet::new(),
            transform: None,
            owner: None,
            attributes: AttributeHolder::new(),
        }
    }

    #[inline]
    pub fn position(&self) -> Point2 {
        self.position
    }

    pub fn lines(&self) -> impl Iterator<Item = LineId> + '_ {
        self.lines.iter().copied()
    }

    pub fn shapes(&self) -> impl Iterator<Item = ShapeId> + '_ {
        self.shapes.iter().copied()
    }

    #[inline]
    pub fn has_line(&self, line: LineId) -> bool {
        self.lines.contains(&line)
    }

    #[inline]
    pub fn has_shape(&self, shape: ShapeId) -> bool {
        self.shapes.contains(&shape)
    }

    /// 当前所属图层；未插入图层时为 `None`。
    #[inline]
    pub fn owner(&self) -> Option<LayerId> {
        self.owner
    }

    #[inline]
    pub fn is_transforming(&self) -> bool {
        self.transform.is_some()
    }

    /// 以 `pivot` 为枢轴开始变换。已在变换中时不做任何事并返回 `false`。
    pub fn begin_transform(&mut self, pivot: Point2) -> bool {
        if self.transform.is_some() {
            return false;
        }
        let relation = geometry::comparison(pivot, self.position, true);
        self.transform = Some(TransformState {
            snapshot: self.position,
            pivot,
            offset: self.position.as_dvec2() - pivot.as_dvec2(),
            angle: relation.angle,
            distance: relation.distance,
        });
        true
    }

    /// 位置 = 快照 + 偏移。返回位置是否变化；未在变换中时忽略。
    pub fn grab(&mut self, offset: IVec2, snap: bool) -> bool {
        let Some(state) = self.transform else {
            return false;
        };
        let offset = if snap {
            IVec2::new(
                snap_down_i32(offset.x, GRAB_SNAP),
                snap_down_i32(offset.y, GRAB_SNAP),
            )
        } else {
            offset
        };
        self.move_to(state.snapshot.translate(offset))
    }

    /// 绕枢轴顺时针（屏幕坐标）旋转 `delta` 度。
    pub fn rotate(&mut self, delta: f64, snap: bool) -> bool {
        let Some(state) = self.transform else {
            return false;
        };
        let delta = if snap { snap_down(delta, ROTATE_SNAP) } else { delta };
        // 角度从正上方起算，换成 x 轴起算的屏幕角需减 90 度
        let radians = (state.angle + delta - 90.0).to_radians();
        let target = state.pivot.as_dvec2() + DVec2::new(radians.cos(), radians.sin()) * state.distance;
        self.move_to(Point2::from_dvec2_rounded(target))
    }

    /// 相对枢轴按 `factor` 缩放。吸附时将新的枢轴距离向下取整到 36 的倍数后再求比例。
    pub fn scale(&mut self, factor: f64, snap: bool) -> bool {
        let Some(state) = self.transform else {
            return false;
        };
        let ratio = if snap {
            snap_down(state.distance * factor, SCALE_SNAP) / state.distance.max(MIN_PIVOT_DISTANCE)
        } else {
            factor
        };
        let target = state.pivot.as_dvec2() + state.offset * ratio;
        self.move_to(Point2::from_dvec2_rounded(target))
    }

    /// 提交变换，返回最终位置是否不同于快照。
    pub fn apply_transform(&mut self) -> bool {
        match self.transform.take() {
            Some(state) => state.snapshot != self.position,
            None => false,
        }
    }

    /// 恢复快照位置，返回位置是否变化。
    pub fn cancel_transform(&mut self) -> bool {
        match self.transform.take() {
            Some(state) => self.move_to(state.snapshot),
            None => false,
        }
    }

    fn move_to(&mut self, target: Point2) -> bool {
        let changed = self.position != target;
        self.position = target;
        changed
    }

    /// 整体平移（调整画布尺寸时使用），变换中的快照与枢轴一同平移。
    pub(crate) fn translate(&mut self, offset: IVec2) {
        self.position = self.position.translate(offset);
        if let Some(state) = self.transform.as_mut() {
            state.snapshot = state.snapshot.translate(offset);
            state.pivot = state.pivot.translate(offset);
        }
    }

    pub(crate) fn link_line(&mut self, line: LineId) {
        self.lines.insert(line);
    }

    pub(crate) fn unlink_line(&mut self, line: LineId) {
        self.lines.remove(&line);
    }

    pub(crate) fn link_shape(&mut self, shape: ShapeId) {
        self.shapes.insert(shape);
    }

    pub(crate) fn unlink_shape(&mut self, shape: ShapeId) {
        self.shapes.remove(&shape);
    }

    pub(crate) fn set_owner(&mut self, owner: Option<LayerId>) {
        self.owner = owner;
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut AttributeHolder {
        &mut self.attributes
    }
}

impl AttributeHost for Node {
    fn attributes(&self) -> &AttributeHolder {
        &self.attributes
    }
}

/// 连接两个不同节点的边。
#[derive(Debug, Clone)]
pub struct Line {
    nodes: (NodeId, NodeId),
    shapes: BTreeSet<ShapeId>,
    formed_by: Option<ShapeId>,
    owner: Option<LayerId>,
    attributes: AttributeHolder,
}

impl Line {
    pub(crate) fn new(first: NodeId, second: NodeId, formed_by: Option<ShapeId>) -> Self {
        debug_assert_ne!(first, second);
        Self {
            nodes: (first, second),
            shapes: BTreeSet::new(),
            formed_by,
            owner: None,
            attributes: AttributeHolder::new(),
        }
    }

    #[inline]
    pub fn nodes(&self) -> (NodeId, NodeId) {
        self.nodes
    }

    /// 无序比较两个端点。
    pub fn connects(&self, a: NodeId, b: NodeId) -> bool {
        self.nodes == (a, b) || self.nodes == (b, a)
    }

    pub fn other_end(&self, node: NodeId) -> Option<NodeId> {
        match self.nodes {
            (first, second) if first == node => Some(second),
            (first, second) if second == node => Some(first),
            _ => None,
        }
    }

    pub fn shapes(&self) -> impl Iterator<Item = ShapeId> + '_ {
        self.shapes.iter().copied()
    }

    #[inline]
    pub fn has_shape(&self, shape: ShapeId) -> bool {
        self.shapes.contains(&shape)
    }

    /// 由哪个形状在构建边界时创建；独立创建的线为 `None`。
    #[inline]
    pub fn formed_by(&self) -> Option<ShapeId> {
        self.formed_by
    }

    #[inline]
    pub fn owner(&self) -> Option<LayerId> {
        self.owner
    }

    pub(crate) fn link_shape(&mut self, shape: ShapeId) {
        self.shapes.insert(shape);
    }

    pub(crate) fn unlink_shape(&mut self, shape: ShapeId) {
        self.shapes.remove(&shape);
    }

    pub(crate) fn set_formed_by(&mut self, shape: Option<ShapeId>) {
        self.formed_by = shape;
    }

    pub(crate) fn set_owner(&mut self, owner: Option<LayerId>) {
        self.owner = owner;
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut AttributeHolder {
        &mut self.attributes
    }
}

impl AttributeHost for Line {
    fn attributes(&self) -> &AttributeHolder {
        &self.attributes
    }
}

/// 闭合多边形：`nodes[i]` 与 `nodes[(i + 1) % n]` 之间的边为 `lines[i]`。
#[derive(Debug, Clone)]
pub struct Shape {
    nodes: Vec<NodeId>,
    lines: Vec<LineId>,
    owner: Option<LayerId>,
    attributes: AttributeHolder,
}

impl Shape {
    pub(crate) fn new(nodes: Vec<NodeId>, lines: Vec<LineId>) -> Self {
        debug_assert_eq!(nodes.len(), lines.len());
        Self {
            nodes,
            lines,
            owner: None,
            attributes: AttributeHolder::new(),
        }
    }

    #[inline]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    #[inline]
    pub fn lines(&self) -> &[LineId] {
        &self.lines
    }

    /// 顶点集合是否与给定集合完全一致（忽略顺序）。
    pub fn has_vertex_set(&self, vertices: &BTreeSet<NodeId>) -> bool {
        self.nodes.len() == vertices.len() && self.nodes.iter().all(|n| vertices.contains(n))
    }

    #[inline]
    pub fn owner(&self) -> Option<LayerId> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Option<LayerId>) {
        self.owner = owner;
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut AttributeHolder {
        &mut self.attributes
    }
}

impl AttributeHost for Shape {
    fn attributes(&self) -> &AttributeHolder {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node_at(x: i32, y: i32) -> Node {
        Node::new(Point2::new(x, y))
    }

    #[test]
    fn grab_offsets_from_snapshot() {
        let cases = [
            ((10, 10), (10, 10), (20, 20)),
            ((10, 10), (-10, -10), (0, 0)),
            ((0, 0), (10, 10), (20, 20)),
            ((0, 0), (0, 0), (10, 10)),
        ];
        for (pivot, offset, expected) in cases {
            let mut node = node_at(10, 10);
            assert!(node.begin_transform(pivot.into()));
            node.grab(IVec2::new(offset.0, offset.1), false);
            node.grab(IVec2::new(offset.0, offset.1), false);
            node.apply_transform();
            assert_eq!(node.position(), expected.into());
            assert!(!node.is_transforming());
        }
    }

    #[test]
    fn grab_snap_floors_each_component() {
        let mut node = node_at(0, 0);
        node.begin_transform(Point2::ORIGIN);
        node.grab(IVec2::new(20, -4), true);
        assert_eq!(node.position(), Point2::new(18, -9));
    }

    #[test]
    fn begin_is_noop_while_transforming() {
        let mut node = node_at(10, 10);
        assert!(node.begin_transform(Point2::ORIGIN));
        node.grab(IVec2::new(5, 0), false);
        assert!(!node.begin_transform(Point2::new(50, 50)));
        node.cancel_transform();
        assert_eq!(node.position(), Point2::new(10, 10));
    }

    #[test]
    fn rotate_turns_clockwise_around_pivot() {
        let cases = [
            ((10, 10), 90.0, (10, 10)),
            ((20, 10), 0.0, (10, 10)),
            ((20, 10), 90.0, (20, 0)),
            ((20, 10), 180.0, (30, 10)),
            ((20, 10), 270.0, (20, 20)),
            ((20, 10), 360.0, (10, 10)),
        ];
        for (pivot, delta, expected) in cases {
            let mut node = node_at(10, 10);
            node.begin_transform(pivot.into());
            node.rotate(delta, false);
            node.apply_transform();
            assert_eq!(node.position(), expected.into(), "pivot {pivot:?} delta {delta}");
        }
    }

    #[test]
    fn rotate_snap_floors_delta() {
        let mut node = node_at(10, 10);
        node.begin_transform(Point2::new(20, 10));
        node.rotate(100.0, true);
        // 100 向下取整为 90
        assert_eq!(node.position(), Point2::new(20, 0));
    }

    #[test]
    fn scale_moves_along_pivot_offset() {
        let cases = [
            ((10, 10), 2.0, (10, 10)),
            ((20, 10), 0.0, (20, 10)),
            ((20, 10), 0.5, (15, 10)),
            ((20, 10), 2.0, (0, 10)),
            ((10, 0), 0.5, (10, 5)),
            ((10, 0), 2.0, (10, 20)),
        ];
        for (pivot, factor, expected) in cases {
            let mut node = node_at(10, 10);
            node.begin_transform(pivot.into());
            node.scale(factor, false);
            node.apply_transform();
            assert_eq!(node.position(), expected.into());
        }
    }

    #[test]
    fn scale_snap_uses_floored_distance() {
        let mut node = node_at(100, 0);
        node.begin_transform(Point2::ORIGIN);
        // 新距离 150 -> 144
        node.scale(1.5, true);
        assert_eq!(node.position(), Point2::new(144, 0));

        // 零距离不会崩溃
        let mut coincident = node_at(5, 5);
        coincident.begin_transform(Point2::new(5, 5));
        coincident.scale(3.0, true);
        coincident.rotate(45.0, true);
        assert_eq!(coincident.position(), Point2::new(5, 5));
    }

    #[test]
    fn updates_outside_transform_are_ignored() {
        let mut node = node_at(3, 4);
        assert!(!node.grab(IVec2::new(10, 10), false));
        assert!(!node.rotate(90.0, false));
        assert!(!node.scale(2.0, false));
        assert!(!node.apply_transform());
        assert!(!node.cancel_transform());
        assert_eq!(node.position(), Point2::new(3, 4));
    }

    #[test]
    fn line_endpoints_are_unordered() {
        let line = Line::new(NodeId::new(1), NodeId::new(2), None);
        assert!(line.connects(NodeId::new(2), NodeId::new(1)));
        assert_eq!(line.other_end(NodeId::new(2)), Some(NodeId::new(1)));
        assert_eq!(line.other_end(NodeId::new(3)), None);
    }

    proptest! {
        #[test]
        fn zero_grab_then_apply_keeps_position(
            x in -5_000i32..5_000, y in -5_000i32..5_000,
            px in -5_000i32..5_000, py in -5_000i32..5_000,
        ) {
            let mut node = node_at(x, y);
            node.begin_transform(Point2::new(px, py));
            node.grab(IVec2::ZERO, false);
            node.apply_transform();
            prop_assert_eq!(node.position(), Point2::new(x, y));
        }

        #[test]
        fn cancel_restores_exact_position(
            x in -5_000i32..5_000, y in -5_000i32..5_000,
            dx in -5_000i32..5_000, dy in -5_000i32..5_000,
            snap in any::<bool>(),
        ) {
            let mut node = node_at(x, y);
            node.begin_transform(Point2::new(dx / 2, dy / 3));
            node.grab(IVec2::new(dx, dy), snap);
            node.cancel_transform();
            prop_assert_eq!(node.position(), Point2::new(x, y));
        }

        #[test]
        fn identity_rotation_and_scale_keep_position(
            x in -5_000i32..5_000, y in -5_000i32..5_000,
            px in -5_000i32..5_000, py in -5_000i32..5_000,
        ) {
            let origin = Point2::new(x, y);
            let pivot = Point2::new(px, py);

            let mut node = node_at(x, y);
            node.begin_transform(pivot);
            node.rotate(0.0, false);
            prop_assert!(geometry::distance(node.position(), origin) <= 1.5);
            node.rotate(360.0, false);
            prop_assert!(geometry::distance(node.position(), origin) <= 1.5);
            node.scale(1.0, false);
            prop_assert_eq!(node.position(), origin);
        }
    }
}
