use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::attributes::{AttributeBag, AttributeValue, DisplayItemId};
use crate::geometry::Point2;
use crate::graph::{EntityClass, EntityRef};
use crate::layer::LayerId;
use crate::raster::Canvas;
use crate::styles;

/// 属性编辑控件提示，供界面层选择编辑器。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeWidget {
    Slider { min: i64, max: i64 },
    Spin { min: i64, max: i64 },
    Color,
    File,
}

/// 属性定义：默认值与控件提示。
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDefinition {
    pub value: AttributeValue,
    pub widget: AttributeWidget,
}

impl AttributeDefinition {
    pub fn slider(value: i64, min: i64, max: i64) -> Self {
        Self {
            value: AttributeValue::Int(value),
            widget: AttributeWidget::Slider { min, max },
        }
    }

    pub fn spin(value: i64, min: i64, max: i64) -> Self {
        Self {
            value: AttributeValue::Int(value),
            widget: AttributeWidget::Spin { min, max },
        }
    }

    pub fn color(value: crate::attributes::Rgba) -> Self {
        Self {
            value: AttributeValue::Color(value),
            widget: AttributeWidget::Color,
        }
    }

    /// 文件路径，默认为空串（未选择）。
    pub fn file() -> Self {
        Self {
            value: AttributeValue::Text(String::new()),
            widget: AttributeWidget::File,
        }
    }
}

pub type AttributeDefinitions = BTreeMap<String, AttributeDefinition>;

/// 渲染回调看到的实体几何。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderSubject<'a> {
    Layer { width: u32, height: u32 },
    Node(Point2),
    Line(Point2, Point2),
    Shape(&'a [Point2]),
}

/// 显示项模板：名称、允许挂载的实体类别、共享/独立属性定义以及绘制回调。
pub trait DisplayStyle: fmt::Debug + Send + Sync {
    fn style_name(&self) -> &'static str;

    fn allowed_class(&self) -> EntityClass;

    fn shared_attributes(&self) -> AttributeDefinitions;

    fn individual_attributes(&self) -> AttributeDefinitions;

    /// `values` 为该实体自己的独立属性；缺失的键应回退到默认值。
    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    );
}

fn defaults_of(definitions: AttributeDefinitions) -> AttributeBag {
    definitions
        .into_iter()
        .map(|(name, definition)| (name, definition.value))
        .collect()
}

/// 显示项的一个挂载点。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Membership {
    pub layer: LayerId,
    pub target: EntityRef,
}

/// 文档级显示项：一个样式实例、它的共享属性值以及挂载成员表。
#[derive(Debug)]
pub struct DisplayItem {
    id: DisplayItemId,
    name: String,
    style: Box<dyn DisplayStyle>,
    shared: AttributeBag,
    members: Vec<Membership>,
}

impl DisplayItem {
    pub fn new(id: DisplayItemId, name: impl Into<String>, style: Box<dyn DisplayStyle>) -> Self {
        let shared = defaults_of(style.shared_attributes());
        Self {
            id,
            name: name.into(),
            style,
            shared,
            members: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> DisplayItemId {
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
    pub fn style_name(&self) -> &'static str {
        self.style.style_name()
    }

    #[inline]
    pub fn allowed_class(&self) -> EntityClass {
        self.style.allowed_class()
    }

    #[inline]
    pub fn accepts(&self, class: EntityClass) -> bool {
        self.style.allowed_class() == class
    }

    pub fn shared_values(&self) -> &AttributeBag {
        &self.shared
    }

    pub fn shared_definitions(&self) -> AttributeDefinitions {
        self.style.shared_attributes()
    }

    pub fn individual_definitions(&self) -> AttributeDefinitions {
        self.style.individual_attributes()
    }

    /// 新挂载实体的初始独立属性值。
    pub fn individual_defaults(&self) -> AttributeBag {
        defaults_of(self.style.individual_attributes())
    }

    pub fn members(&self) -> &[Membership] {
        &self.members
    }

    pub fn has_member(&self, layer: LayerId, target: EntityRef) -> bool {
        self.members.contains(&Membership { layer, target })
    }

    pub fn render(&self, canvas: &mut Canvas, values: &AttributeBag, subject: &RenderSubject<'_>) {
        self.style.render(canvas, &self.shared, values, subject);
    }

    pub(crate) fn set_shared_value(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.shared.insert(name.into(), value);
    }

    pub(crate) fn add_member(&mut self, layer: LayerId, target: EntityRef) {
        let membership = Membership { layer, target };
        if !self.members.contains(&membership) {
            self.members.push(membership);
        }
    }

    pub(crate) fn remove_member(&mut self, layer: LayerId, target: EntityRef) -> bool {
        let before = self.members.len();
        self.members
            .retain(|m| !(m.layer == layer && m.target == target));
        self.members.len() != before
    }

    pub(crate) fn take_members(&mut self) -> Vec<Membership> {
        std::mem::take(&mut self.members)
    }
}

pub type StyleConstructor = fn() -> Box<dyn DisplayStyle>;

/// 样式名到构造函数的注册表，反序列化时据此重建显示项。
pub struct StyleRegistry {
    constructors: HashMap<&'static str, StyleConstructor>,
}

impl StyleRegistry {
    /// 预注册全部内置样式。
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(styles::COLOR_CIRCLE, || Box::new(styles::ColorCircle));
        registry.register(styles::CIRCLE_SHADOW, || Box::new(styles::CircleShadow));
        registry.register(styles::COLOR_LINE, || Box::new(styles::ColorLine));
        registry.register(styles::LINE_SHADOW, || Box::new(styles::LineShadow));
        registry.register(styles::COLOR_SHAPE, || Box::new(styles::ColorShape));
        registry.register(styles::COLOR_BACKGROUND, || Box::new(styles::ColorBackground));
        registry.register(styles::GRID, || Box::new(styles::Grid));
        registry.register(styles::COLOR_DOOR, || Box::new(styles::ColorDoor));
        registry.register(styles::LINE_SHADOW_LENGTH, || Box::new(styles::LineShadowLength));
        registry.register(styles::IMAGE, || Box::new(styles::ImageNode::default()));
        registry.register(styles::IMAGE_LINE, || Box::new(styles::ImageLine::default()));
        registry.register(styles::IMAGE_DOOR, || Box::new(styles::ImageDoor::default()));
        registry.register(styles::IMAGE_SHAPE, || Box::new(styles::ImageShape::default()));
        registry.register(styles::IMAGE_BACKGROUND, || Box::new(styles::ImageBackground::default()));
        registry
    }

    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, constructor: StyleConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn DisplayStyle>> {
        self.constructors.get(name).map(|constructor| constructor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.constructors.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for StyleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StyleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StyleRegistry")
            .field("styles", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Rgba;
    use crate::graph::NodeId;

    #[test]
    fn new_item_seeds_shared_values_from_style() {
        let registry = StyleRegistry::new();
        let style = registry.create(styles::COLOR_CIRCLE).expect("builtin");
        let item = DisplayItem::new(DisplayItemId::new(0), "Pillars", style);

        assert_eq!(item.allowed_class(), EntityClass::Node);
        assert!(item.accepts(EntityClass::Node));
        assert!(!item.accepts(EntityClass::Shape));
        assert_eq!(
            item.shared_values().get("FillColor"),
            Some(&AttributeValue::Color(Rgba::BLACK))
        );
        let defaults = item.individual_defaults();
        assert_eq!(defaults.get("Size"), Some(&AttributeValue::Int(24)));
        assert_eq!(defaults.get("Opacity"), Some(&AttributeValue::Int(100)));
    }

    #[test]
    fn registry_knows_builtin_styles() {
        let registry = StyleRegistry::new();
        assert_eq!(registry.names().len(), 14);
        assert!(registry.contains(styles::GRID));
        assert!(registry.create("hex_grid").is_none());

        let door = registry.create(styles::IMAGE_DOOR).expect("builtin");
        assert_eq!(door.allowed_class(), EntityClass::Line);
        let image = door.shared_attributes().remove("Image").expect("image path");
        assert_eq!(image.widget, AttributeWidget::File);
        assert_eq!(image.value, AttributeValue::Text(String::new()));
        assert!(StyleRegistry::empty().names().is_empty());
    }

    #[test]
    fn membership_is_deduplicated() {
        let mut item = DisplayItem::new(DisplayItemId::new(1), "Walls", Box::new(styles::ColorLine));
        let layer = LayerId::new(0);
        let node = EntityRef::Node(NodeId::new(4));
        item.add_member(layer, node);
        item.add_member(layer, node);
        assert_eq!(item.members().len(), 1);
        assert!(item.remove_member(layer, node));
        assert!(!item.remove_member(layer, node));
    }
}
