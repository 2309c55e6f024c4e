pub mod command;

pub mod errors {
    use emf_core::errors::MapError;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("map has no layers")]
        NoLayer,
        #[error(transparent)]
        Map(#[from] MapError),
    }
}

pub mod editor {
    use emf_core::errors::MapError;
    use emf_core::geometry::{
        self, GRAB_SNAP, MIN_PIVOT_DISTANCE, Point2, ROTATE_SNAP, SCALE_SNAP, snap_down,
        snap_down_i32,
    };
    use emf_core::graph::{EntityClass, EntityRef, LineId, NodeId, ShapeId};
    use emf_core::layer::{Layer, LayerId, Removal};
    use emf_core::map::Map;
    use glam::IVec2;
    use tracing::debug;

    use crate::errors::EngineError;

    /// 点选半径的默认平方值。
    pub const DEFAULT_SELECT_THRESHOLD: f64 = 100.0;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum InteractionMode {
        Select,
        Grab,
        Rotate,
        Scale,
    }

    /// 进行中的交互：起始光标、枢轴以及参与变换的节点。
    #[derive(Debug, Clone)]
    struct Interaction {
        mode: InteractionMode,
        layer: LayerId,
        anchor: Point2,
        pivot: Point2,
        nodes: Vec<NodeId>,
    }

    /// 由调用方提供的通知接口，替代隐式的全局信号。两个方法都有空默认实现。
    pub trait EditorObserver {
        fn selection_changed(&mut self, _selection: &[EntityRef], _median: Option<Point2>) {}

        /// 图层内容变化，光栅需要重新拉取。
        fn layer_invalidated(&mut self, _layer: LayerId) {}
    }

    #[derive(Debug, Clone, Copy)]
    pub struct DemoEntities {
        pub nodes: [NodeId; 4],
        pub shape: ShapeId,
    }

    /// 编辑器状态：地图文档、当前选择集、选择中值与交互会话。
    pub struct Editor {
        map: Map,
        selection_type: EntityClass,
        selected: Vec<EntityRef>,
        median: Option<Point2>,
        cursor: Point2,
        interaction: Option<Interaction>,
        select_threshold: f64,
        observer: Option<Box<dyn EditorObserver>>,
    }

    impl std::fmt::Debug for Editor {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Editor")
                .field("map", &self.map)
                .field("selection_type", &self.selection_type)
                .field("selected", &self.selected)
                .field("median", &self.median)
                .field("interaction", &self.interaction)
                .field("observed", &self.observer.is_some())
                .finish()
        }
    }

    impl Editor {
        pub fn new(map: Map) -> Self {
            Self {
                map,
                selection_type: EntityClass::Node,
                selected: Vec::new(),
                median: None,
                cursor: Point2::ORIGIN,
                interaction: None,
                select_threshold: DEFAULT_SELECT_THRESHOLD,
                observer: None,
            }
        }

        pub fn set_observer(&mut self, observer: Box<dyn EditorObserver>) {
            self.observer = Some(observer);
        }

        pub fn take_observer(&mut self) -> Option<Box<dyn EditorObserver>> {
            self.observer.take()
        }

        fn notify_layer(&mut self, layer: LayerId) {
            if let Some(observer) = self.observer.as_mut() {
                observer.layer_invalidated(layer);
            }
        }

        fn notify_current_layer(&mut self) {
            if let Ok(layer) = self.layer_id() {
                self.notify_layer(layer);
            }
        }

        pub fn with_select_threshold(mut self, threshold: f64) -> Self {
            self.select_threshold = threshold;
            self
        }

        #[inline]
        pub fn map(&self) -> &Map {
            &self.map
        }

        #[inline]
        pub fn map_mut(&mut self) -> &mut Map {
            &mut self.map
        }

        pub fn into_map(self) -> Map {
            self.map
        }

        /// 替换文档并重置运行时状态。
        pub fn load_map(&mut self, map: Map) {
            self.map = map;
            self.selected.clear();
            self.median = None;
            self.interaction = None;
        }

        fn layer_id(&self) -> Result<LayerId, EngineError> {
            self.map
                .current_layer()
                .map(Layer::id)
                .ok_or(EngineError::NoLayer)
        }

        pub fn layer(&self) -> Result<&Layer, EngineError> {
            self.map.current_layer().ok_or(EngineError::NoLayer)
        }

        fn layer_mut(&mut self) -> Result<&mut Layer, EngineError> {
            current_layer_mut(&mut self.map)
        }

        /// 切换当前图层。会结束进行中的交互并清空选择。
        pub fn switch_layer(&mut self, index: usize) -> Result<(), EngineError> {
            self.cancel_interaction()?;
            self.map.set_current_layer(index)?;
            self.clear_selection();
            Ok(())
        }

        // ---------------------------------------------------------------
        // 选择
        // ---------------------------------------------------------------

        #[inline]
        pub fn selection_type(&self) -> EntityClass {
            self.selection_type
        }

        #[inline]
        pub fn selection(&self) -> &[EntityRef] {
            &self.selected
        }

        #[inline]
        pub fn selection_len(&self) -> usize {
            self.selected.len()
        }

        #[inline]
        pub fn is_selected(&self, target: EntityRef) -> bool {
            self.selected.contains(&target)
        }

        #[inline]
        pub fn median(&self) -> Option<Point2> {
            self.median
        }

        #[inline]
        pub fn cursor(&self) -> Point2 {
            self.cursor
        }

        #[inline]
        pub fn interaction_mode(&self) -> InteractionMode {
            self.interaction
                .as_ref()
                .map_or(InteractionMode::Select, |interaction| interaction.mode)
        }

        #[inline]
        fn is_selecting(&self) -> bool {
            self.interaction.is_none()
        }

        /// 切换选择类别（节点/线/形状），切换时清空选择。交互中忽略。
        pub fn set_selection_type(&mut self, class: EntityClass) -> bool {
            if class == EntityClass::Layer || class == self.selection_type || !self.is_selecting() {
                return false;
            }
            self.selection_type = class;
            self.clear_selection();
            true
        }

        fn update_median(&mut self) {
            self.median = match self.map.current_layer() {
                Some(layer) if !self.selected.is_empty() => layer.median(&self.selected),
                _ => None,
            };
            if let Some(observer) = self.observer.as_mut() {
                observer.selection_changed(&self.selected, self.median);
            }
        }

        /// 选中光标下第一个尚未选中的实体；`inclusive` 为 false 时先清空原选择。
        pub fn select_at(&mut self, cursor: Point2, inclusive: bool) -> Result<Option<EntityRef>, EngineError> {
            self.cursor = cursor;
            let hit = self
                .layer()?
                .hit_test(self.selection_type, cursor, self.select_threshold)
                .into_iter()
                .find(|target| !self.selected.contains(target));
            if !inclusive {
                self.selected.clear();
            }
            if let Some(target) = hit {
                self.selected.push(target);
            }
            self.update_median();
            Ok(hit)
        }

        /// `single` 时只取消光标下的一个已选实体，否则清空选择。
        pub fn deselect_at(&mut self, cursor: Point2, single: bool) -> Result<Option<EntityRef>, EngineError> {
            self.cursor = cursor;
            let mut removed = None;
            if single {
                let hit = self
                    .layer()?
                    .hit_test(self.selection_type, cursor, self.select_threshold)
                    .into_iter()
                    .find(|target| self.selected.contains(target));
                if let Some(target) = hit {
                    self.selected.retain(|selected| *selected != target);
                    removed = Some(target);
                }
            } else {
                self.selected.clear();
            }
            self.update_median();
            Ok(removed)
        }

        /// 在“全选”与“全不选”之间切换。
        pub fn select_all(&mut self) -> Result<usize, EngineError> {
            let all = self.layer()?.entities_of(self.selection_type);
            if all.len() == self.selected.len() {
                self.selected.clear();
            } else {
                self.selected = all;
            }
            self.update_median();
            Ok(self.selected.len())
        }

        pub fn clear_selection(&mut self) {
            self.selected.clear();
            self.update_median();
        }

        // ---------------------------------------------------------------
        // 拓扑编辑
        // ---------------------------------------------------------------

        /// 在光标处新增节点并加入选择。
        pub fn add_node(&mut self, cursor: Point2) -> Result<NodeId, EngineError> {
            self.cursor = cursor;
            let node = self.layer_mut()?.add_node(cursor);
            self.selected.push(EntityRef::Node(node));
            self.update_median();
            self.notify_current_layer();
            Ok(node)
        }

        /// 两个尚未相连的节点组成线；三个及以上节点组成形状。
        pub fn form_item(&mut self) -> Result<Option<EntityRef>, EngineError> {
            if !self.is_selecting() || self.selection_type == EntityClass::Shape {
                return Ok(None);
            }
            let layer = current_layer_mut(&mut self.map)?;
            let nodes = layer.nodes_of(&self.selected);
            let formed = match nodes.as_slice() {
                [a, b] if layer.existing_line(*a, *b).is_none() => {
                    Some(EntityRef::Line(layer.create_line(*a, *b)?))
                }
                [_, _, _, ..] => Some(EntityRef::Shape(layer.create_shape(&nodes, true)?)),
                _ => None,
            };
            if let Some(item) = formed {
                debug!(?item, nodes = nodes.len(), "已组成新实体");
                self.notify_current_layer();
            }
            Ok(formed)
        }

        /// 删除选择；`touching_nodes` 时改为删除选择涉及的全部节点。
        pub fn delete_items(&mut self, touching_nodes: bool) -> Result<Removal, EngineError> {
            if !self.is_selecting() {
                return Ok(Removal::default());
            }
            let layer_id = self.layer_id()?;
            let targets: Vec<EntityRef> = if touching_nodes {
                self.layer()?
                    .nodes_of(&self.selected)
                    .into_iter()
                    .map(EntityRef::Node)
                    .collect()
            } else {
                self.selected.clone()
            };
            let removal = self.map.delete(layer_id, &targets)?;
            self.selected.clear();
            self.update_median();
            if !removal.is_empty() {
                self.notify_layer(layer_id);
            }
            debug!(removed = removal.len(), "已删除选择");
            Ok(removal)
        }

        /// 挤出：节点生成新节点与连线；线生成平行线与四边形；形状直接复制。随后开始平移。
        pub fn extrude_items(&mut self) -> Result<Vec<EntityRef>, EngineError> {
            if !self.is_selecting() {
                return Ok(Vec::new());
            }
            let created = match self.selection_type {
                EntityClass::Node if self.selected.is_empty() => {
                    vec![EntityRef::Node(self.add_node(self.cursor)?)]
                }
                EntityClass::Node => self.extrude_nodes()?,
                EntityClass::Line => self.extrude_lines()?,
                EntityClass::Shape => self.duplicate_shapes()?,
                EntityClass::Layer => Vec::new(),
            };
            self.finish_copy(created)
        }

        /// 复制选择（共享被复制的顶点），随后开始平移。
        pub fn duplicate_items(&mut self) -> Result<Vec<EntityRef>, EngineError> {
            if !self.is_selecting() {
                return Ok(Vec::new());
            }
            let created = match self.selection_type {
                EntityClass::Node => self.duplicate_nodes()?,
                EntityClass::Line => self.duplicate_lines()?,
                EntityClass::Shape => self.duplicate_shapes()?,
                EntityClass::Layer => Vec::new(),
            };
            self.finish_copy(created)
        }

        fn finish_copy(&mut self, created: Vec<EntityRef>) -> Result<Vec<EntityRef>, EngineError> {
            if created.is_empty() {
                return Ok(created);
            }
            self.selected = created.clone();
            self.update_median();
            self.notify_current_layer();
            self.begin_interaction(InteractionMode::Grab)?;
            Ok(created)
        }

        fn selected_of<T>(&self, pick: impl Fn(EntityRef) -> Option<T>) -> Vec<T> {
            self.selected.iter().copied().filter_map(pick).collect()
        }

        fn extrude_nodes(&mut self) -> Result<Vec<EntityRef>, EngineError> {
            let nodes = self.selected_of(|target| match target {
                EntityRef::Node(id) => Some(id),
                _ => None,
            });
            let layer = self.layer_mut()?;
            let mut created = Vec::with_capacity(nodes.len());
            for node in nodes {
                let Some(position) = layer.position(node) else {
                    continue;
                };
                let copy = layer.add_node(position);
                layer.create_line(node, copy)?;
                created.push(EntityRef::Node(copy));
            }
            Ok(created)
        }

        fn extrude_lines(&mut self) -> Result<Vec<EntityRef>, EngineError> {
            let lines = self.selected_of(|target| match target {
                EntityRef::Line(id) => Some(id),
                _ => None,
            });
            let layer = self.layer_mut()?;
            let mut copies = NodeCopies::default();
            let mut created = Vec::with_capacity(lines.len());
            for line in lines {
                let Some((a, b)) = layer.line(line).map(|line| line.nodes()) else {
                    continue;
                };
                let (a_copy, a_new) = copies.copy(layer, a)?;
                let (b_copy, b_new) = copies.copy(layer, b)?;
                if a_new {
                    layer.create_line(a, a_copy)?;
                }
                if b_new {
                    layer.create_line(b, b_copy)?;
                }
                let parallel = layer.create_line(a_copy, b_copy)?;
                layer.create_shape(&[a, b, b_copy, a_copy], false)?;
                created.push(EntityRef::Line(parallel));
            }
            Ok(created)
        }

        fn duplicate_nodes(&mut self) -> Result<Vec<EntityRef>, EngineError> {
            let nodes = self.selected_of(|target| match target {
                EntityRef::Node(id) => Some(id),
                _ => None,
            });
            let layer = self.layer_mut()?;
            let mut created = Vec::with_capacity(nodes.len());
            for node in nodes {
                if let Some(position) = layer.position(node) {
                    created.push(EntityRef::Node(layer.add_node(position)));
                }
            }
            Ok(created)
        }

        fn duplicate_lines(&mut self) -> Result<Vec<EntityRef>, EngineError> {
            let lines: Vec<LineId> = self.selected_of(|target| match target {
                EntityRef::Line(id) => Some(id),
                _ => None,
            });
            let layer = self.layer_mut()?;
            let mut copies = NodeCopies::default();
            let mut created = Vec::with_capacity(lines.len());
            for line in lines {
                let Some((a, b)) = layer.line(line).map(|line| line.nodes()) else {
                    continue;
                };
                let (a_copy, _) = copies.copy(layer, a)?;
                let (b_copy, _) = copies.copy(layer, b)?;
                created.push(EntityRef::Line(layer.create_line(a_copy, b_copy)?));
            }
            Ok(created)
        }

        fn duplicate_shapes(&mut self) -> Result<Vec<EntityRef>, EngineError> {
            let shapes = self.selected_of(|target| match target {
                EntityRef::Shape(id) => Some(id),
                _ => None,
            });
            let layer = self.layer_mut()?;
            let mut copies = NodeCopies::default();
            let mut created = Vec::with_capacity(shapes.len());
            for shape in shapes {
                let Some(vertices) = layer.shape(shape).map(|shape| shape.nodes().to_vec()) else {
                    continue;
                };
                let mut copied = Vec::with_capacity(vertices.len());
                for vertex in vertices {
                    copied.push(copies.copy(layer, vertex)?.0);
                }
                created.push(EntityRef::Shape(layer.create_shape(&copied, false)?));
            }
            Ok(created)
        }

        /// 演示用的起始方形，与新建地图时的初始内容一致。
        pub fn populate_demo(&mut self) -> Result<DemoEntities, EngineError> {
            self.clear_selection();
            let layer = self.layer_mut()?;
            let nodes = [(72, 72), (144, 72), (144, 144), (72, 144)]
                .map(|(x, y)| layer.add_node(Point2::new(x, y)));
            let shape = layer.create_shape(&nodes, true)?;
            debug!(shape = shape.get(), "已创建演示方形");
            self.notify_current_layer();
            Ok(DemoEntities { nodes, shape })
        }

        // ---------------------------------------------------------------
        // 交互：开始 -> 多次更新 -> 应用 | 取消
        // ---------------------------------------------------------------

        /// 以选择中值为枢轴开始交互。已有其他交互时先取消；选择为空时不做任何事。
        pub fn begin_interaction(&mut self, mode: InteractionMode) -> Result<bool, EngineError> {
            if mode == InteractionMode::Select || mode == self.interaction_mode() {
                return Ok(false);
            }
            if self.selected.is_empty() {
                return Ok(false);
            }
            self.cancel_interaction()?;
            // 枢轴固定为开始时的中值
            let Some(pivot) = self.median else {
                return Ok(false);
            };

            let layer_id = self.layer_id()?;
            let anchor = self.cursor;
            let layer = current_layer_mut(&mut self.map)?;
            let nodes = layer.nodes_of(&self.selected);
            layer.begin_transform(&nodes, pivot);
            debug!(?mode, nodes = nodes.len(), "开始交互");
            self.interaction = Some(Interaction {
                mode,
                layer: layer_id,
                anchor,
                pivot,
                nodes,
            });
            Ok(true)
        }

        /// 移动光标并推进当前交互。`snap` 对应按住 Shift 的增量模式。
        pub fn update_interaction(&mut self, cursor: Point2, snap: bool) -> Result<bool, EngineError> {
            self.cursor = cursor;
            let Some(interaction) = self.interaction.as_ref() else {
                return Ok(false);
            };
            let layer_id = interaction.layer;
            let layer = self.map.layer_mut(layer_id)?;
            let nodes = &interaction.nodes;
            let changed = match interaction.mode {
                InteractionMode::Select => false,
                InteractionMode::Grab => {
                    let offset = interaction.anchor.offset_to(cursor);
                    let offset = if snap {
                        IVec2::new(snap_down_i32(offset.x, GRAB_SNAP), snap_down_i32(offset.y, GRAB_SNAP))
                    } else {
                        offset
                    };
                    layer.grab(nodes, offset, false)
                }
                InteractionMode::Rotate => {
                    let delta = geometry::angle_of(interaction.pivot, cursor)
                        - geometry::angle_of(interaction.pivot, interaction.anchor);
                    let delta = if snap { snap_down(delta, ROTATE_SNAP) } else { delta };
                    layer.rotate(nodes, delta, false)
                }
                InteractionMode::Scale => {
                    let old = geometry::distance(interaction.pivot, interaction.anchor);
                    let old = if old == 0.0 { MIN_PIVOT_DISTANCE } else { old };
                    let new = geometry::distance(interaction.pivot, cursor);
                    let new = if snap { snap_down(new, SCALE_SNAP) } else { new };
                    layer.scale(nodes, new / old, false)
                }
            };
            self.update_median();
            if changed {
                self.notify_layer(layer_id);
            }
            Ok(changed)
        }

        pub fn apply_interaction(&mut self) -> Result<bool, EngineError> {
            self.finish_interaction(Layer::apply_transform)
        }

        pub fn cancel_interaction(&mut self) -> Result<bool, EngineError> {
            self.finish_interaction(Layer::cancel_transform)
        }

        fn finish_interaction(
            &mut self,
            finish: fn(&mut Layer, &[NodeId]) -> bool,
        ) -> Result<bool, EngineError> {
            let Some(interaction) = self.interaction.take() else {
                return Ok(false);
            };
            let layer = self.map.layer_mut(interaction.layer)?;
            let changed = finish(layer, &interaction.nodes);
            self.update_median();
            if changed {
                self.notify_layer(interaction.layer);
            }
            debug!(mode = ?interaction.mode, changed, "交互结束");
            Ok(changed)
        }
    }

    fn current_layer_mut(map: &mut Map) -> Result<&mut Layer, EngineError> {
        map.current_layer_mut().ok_or(EngineError::NoLayer)
    }

    /// 一次复制操作中旧节点到新节点的映射，保证共享顶点只复制一次。
    #[derive(Debug, Default)]
    struct NodeCopies {
        pairs: Vec<(NodeId, NodeId)>,
    }

    impl NodeCopies {
        /// 返回副本以及它是否为本次新建。
        fn copy(&mut self, layer: &mut Layer, node: NodeId) -> Result<(NodeId, bool), EngineError> {
            if let Some((_, copy)) = self.pairs.iter().find(|(source, _)| *source == node) {
                return Ok((*copy, false));
            }
            let position = layer
                .position(node)
                .ok_or(MapError::EntityNotFound(EntityClass::Node, node.get()))?;
            let copy = layer.add_node(position);
            self.pairs.push((node, copy));
            Ok((copy, true))
        }
    }

}
