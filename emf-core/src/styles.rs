//! 内置显示样式。

use std::sync::{Arc, Mutex};

use glam::DVec2;
use image::RgbaImage;
use tracing::{debug, warn};

use crate::attributes::{AttributeBag, AttributeValue, Rgba};
use crate::display::{AttributeDefinition, AttributeDefinitions, DisplayStyle, RenderSubject};
use crate::geometry;
use crate::graph::EntityClass;
use crate::raster::Canvas;

pub const COLOR_CIRCLE: &str = "color_circle";
pub const CIRCLE_SHADOW: &str = "circle_shadow";
pub const COLOR_LINE: &str = "color_line";
pub const LINE_SHADOW: &str = "line_shadow";
pub const COLOR_SHAPE: &str = "color_shape";
pub const COLOR_BACKGROUND: &str = "color_background";
pub const GRID: &str = "grid";
pub const COLOR_DOOR: &str = "color_door";
pub const LINE_SHADOW_LENGTH: &str = "line_shadow_length";
pub const IMAGE: &str = "image";
pub const IMAGE_LINE: &str = "image_line";
pub const IMAGE_DOOR: &str = "image_door";
pub const IMAGE_SHAPE: &str = "image_shape";
pub const IMAGE_BACKGROUND: &str = "image_background";

const DEFAULT_SIZE: i64 = 24;
const DEFAULT_WIDTH: i64 = 24;
const DEFAULT_OPACITY: i64 = 100;
const DEFAULT_SHADOW_START: i64 = 50;
const DEFAULT_SHADOW_END: i64 = 0;
const DEFAULT_GRID_SPACING: i64 = 72;
const DEFAULT_DOOR_LENGTH: i64 = 24;
const DEFAULT_SIZE_RATIO: i64 = 100;
const DEFAULT_ROTATION: i64 = 0;
const DEFAULT_POSITIONING: i64 = 50;
const GRID_COLOR: Rgba = Rgba([0, 0, 0, 96]);
const OUTLINE_WIDTH: f64 = 2.0;

fn number(bag: &AttributeBag, name: &str, fallback: i64) -> f64 {
    bag.get(name)
        .and_then(|value| value.as_float())
        .unwrap_or(fallback as f64)
}

fn color(bag: &AttributeBag, name: &str, fallback: Rgba) -> Rgba {
    bag.get(name)
        .and_then(|value| value.as_color())
        .unwrap_or(fallback)
}

fn definitions<const N: usize>(entries: [(&str, AttributeDefinition); N]) -> AttributeDefinitions {
    entries
        .into_iter()
        .map(|(name, definition)| (name.to_string(), definition))
        .collect()
}

fn opacity_slider(value: i64) -> AttributeDefinition {
    AttributeDefinition::slider(value, 0, 100)
}

/// 节点处的实心圆，带描边。
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorCircle;

impl DisplayStyle for ColorCircle {
    fn style_name(&self) -> &'static str {
        COLOR_CIRCLE
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Node
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("FillColor", AttributeDefinition::color(Rgba::BLACK)),
            ("LineColor", AttributeDefinition::color(Rgba::BLACK)),
        ])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("Size", AttributeDefinition::spin(DEFAULT_SIZE, 0, 1024)),
            ("Opacity", opacity_slider(DEFAULT_OPACITY)),
        ])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Node(position) = subject else {
            return;
        };
        let radius = number(values, "Size", DEFAULT_SIZE) / 2.0;
        let opacity = number(values, "Opacity", DEFAULT_OPACITY);
        let center = position.as_dvec2();
        canvas.fill_circle(center, radius, color(shared, "LineColor", Rgba::BLACK).with_opacity(opacity));
        canvas.fill_circle(
            center,
            radius - OUTLINE_WIDTH,
            color(shared, "FillColor", Rgba::BLACK).with_opacity(opacity),
        );
    }
}

/// 节点周围的径向渐变阴影。
#[derive(Debug, Clone, Copy, Default)]
pub struct CircleShadow;

impl DisplayStyle for CircleShadow {
    fn style_name(&self) -> &'static str {
        CIRCLE_SHADOW
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Node
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([("FillColor", AttributeDefinition::color(Rgba::BLACK))])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("Size", AttributeDefinition::spin(DEFAULT_SIZE, 0, 1024)),
            ("StartOpacity", opacity_slider(DEFAULT_SHADOW_START)),
            ("EndOpacity", opacity_slider(DEFAULT_SHADOW_END)),
        ])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Node(position) = subject else {
            return;
        };
        canvas.radial_shadow(
            position.as_dvec2(),
            number(values, "Size", DEFAULT_SIZE),
            color(shared, "FillColor", Rgba::BLACK),
            number(values, "StartOpacity", DEFAULT_SHADOW_START),
            number(values, "EndOpacity", DEFAULT_SHADOW_END),
        );
    }
}

/// 纯色粗线。
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorLine;

impl DisplayStyle for ColorLine {
    fn style_name(&self) -> &'static str {
        COLOR_LINE
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Line
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("FillColor", AttributeDefinition::color(Rgba::BLACK)),
            ("LineColor", AttributeDefinition::color(Rgba::BLACK)),
        ])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("Width", AttributeDefinition::slider(DEFAULT_WIDTH, 0, 36)),
            ("Opacity", opacity_slider(DEFAULT_OPACITY)),
        ])
    }

    /// 整条线先用描边色画满宽度，再在内侧用填充色覆盖。
    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Line(start, end) = subject else {
            return;
        };
        let opacity = number(values, "Opacity", DEFAULT_OPACITY);
        let width = number(values, "Width", DEFAULT_WIDTH);
        let (start, end) = (start.as_dvec2(), end.as_dvec2());
        canvas.stroke_segment(
            start,
            end,
            width,
            color(shared, "LineColor", Rgba::BLACK).with_opacity(opacity),
        );
        canvas.stroke_segment(
            start,
            end,
            width - 2.0 * OUTLINE_WIDTH,
            color(shared, "FillColor", Rgba::BLACK).with_opacity(opacity),
        );
    }
}

/// 线中点处的门：沿线方向长 `Length`、垂直方向宽 `Width` 的矩形。
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorDoor;

impl DisplayStyle for ColorDoor {
    fn style_name(&self) -> &'static str {
        COLOR_DOOR
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Line
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("FillColor", AttributeDefinition::color(Rgba::BLACK)),
            ("LineColor", AttributeDefinition::color(Rgba::BLACK)),
        ])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("Length", AttributeDefinition::slider(DEFAULT_DOOR_LENGTH, 0, 36)),
            ("Width", AttributeDefinition::slider(DEFAULT_WIDTH, 0, 36)),
            ("Opacity", opacity_slider(DEFAULT_OPACITY)),
        ])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Line(start, end) = subject else {
            return;
        };
        let Some(along) = (end.as_dvec2() - start.as_dvec2()).try_normalize() else {
            return;
        };
        let center = (start.as_dvec2() + end.as_dvec2()) / 2.0;
        let half_length = along * number(values, "Length", DEFAULT_DOOR_LENGTH) / 2.0;
        let half_width = along.perp() * number(values, "Width", DEFAULT_WIDTH) / 2.0;
        let corners = [
            center - half_length - half_width,
            center + half_length - half_width,
            center + half_length + half_width,
            center - half_length + half_width,
        ];
        let opacity = number(values, "Opacity", DEFAULT_OPACITY);
        canvas.fill_polygon(&corners, color(shared, "FillColor", Rgba::BLACK).with_opacity(opacity));
        canvas.stroke_polygon(
            &corners,
            OUTLINE_WIDTH,
            color(shared, "LineColor", Rgba::BLACK).with_opacity(opacity),
        );
    }
}

/// 沿线两侧的渐变阴影。
#[derive(Debug, Clone, Copy, Default)]
pub struct LineShadow;

impl DisplayStyle for LineShadow {
    fn style_name(&self) -> &'static str {
        LINE_SHADOW
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Line
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([("FillColor", AttributeDefinition::color(Rgba::BLACK))])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("Size", AttributeDefinition::spin(DEFAULT_SIZE, 0, 1024)),
            ("StartOpacity", opacity_slider(DEFAULT_SHADOW_START)),
            ("EndOpacity", opacity_slider(DEFAULT_SHADOW_END)),
        ])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Line(start, end) = subject else {
            return;
        };
        canvas.segment_shadow(
            start.as_dvec2(),
            end.as_dvec2(),
            number(values, "Size", DEFAULT_SIZE),
            color(shared, "FillColor", Rgba::BLACK),
            number(values, "StartOpacity", DEFAULT_SHADOW_START),
            number(values, "EndOpacity", DEFAULT_SHADOW_END),
        );
    }
}

/// 沿线长方向渐隐的色带：起点处 `StartOpacity`，终点处 `EndOpacity`。
#[derive(Debug, Clone, Copy, Default)]
pub struct LineShadowLength;

impl DisplayStyle for LineShadowLength {
    fn style_name(&self) -> &'static str {
        LINE_SHADOW_LENGTH
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Line
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([("FillColor", AttributeDefinition::color(Rgba::BLACK))])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("Width", AttributeDefinition::slider(DEFAULT_WIDTH, 0, 36)),
            ("StartOpacity", opacity_slider(DEFAULT_SHADOW_START)),
            ("EndOpacity", opacity_slider(DEFAULT_SHADOW_END)),
        ])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Line(start, end) = subject else {
            return;
        };
        canvas.segment_gradient(
            start.as_dvec2(),
            end.as_dvec2(),
            number(values, "Width", DEFAULT_WIDTH),
            color(shared, "FillColor", Rgba::BLACK),
            number(values, "StartOpacity", DEFAULT_SHADOW_START),
            number(values, "EndOpacity", DEFAULT_SHADOW_END),
        );
    }
}

/// 填充多边形并描边。
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorShape;

impl DisplayStyle for ColorShape {
    fn style_name(&self) -> &'static str {
        COLOR_SHAPE
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Shape
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("FillColor", AttributeDefinition::color(Rgba::BLACK)),
            ("LineColor", AttributeDefinition::color(Rgba::BLACK)),
        ])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([("Opacity", opacity_slider(DEFAULT_OPACITY))])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Shape(polygon) = subject else {
            return;
        };
        let opacity = number(values, "Opacity", DEFAULT_OPACITY);
        let points: Vec<DVec2> = polygon.iter().map(|p| p.as_dvec2()).collect();
        canvas.fill_polygon(&points, color(shared, "FillColor", Rgba::BLACK).with_opacity(opacity));
        canvas.stroke_polygon(
            &points,
            OUTLINE_WIDTH,
            color(shared, "LineColor", Rgba::BLACK).with_opacity(opacity),
        );
    }
}

/// 图层背景色。
#[derive(Debug, Clone, Copy, Default)]
pub struct ColorBackground;

impl DisplayStyle for ColorBackground {
    fn style_name(&self) -> &'static str {
        COLOR_BACKGROUND
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Layer
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([("FillColor", AttributeDefinition::color(Rgba::BLACK))])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([("Opacity", opacity_slider(DEFAULT_OPACITY))])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        if !matches!(subject, RenderSubject::Layer { .. }) {
            return;
        }
        let opacity = number(values, "Opacity", DEFAULT_OPACITY);
        canvas.fill(color(shared, "FillColor", Rgba::BLACK).with_opacity(opacity));
    }
}

/// 方格网格，默认间距与地图方格一致。
#[derive(Debug, Clone, Copy, Default)]
pub struct Grid;

impl DisplayStyle for Grid {
    fn style_name(&self) -> &'static str {
        GRID
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Layer
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("LineColor", AttributeDefinition::color(GRID_COLOR)),
            ("Spacing", AttributeDefinition::spin(DEFAULT_GRID_SPACING, 1, 1024)),
        ])
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        AttributeDefinitions::new()
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        _values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        if !matches!(subject, RenderSubject::Layer { .. }) {
            return;
        }
        let spacing = number(shared, "Spacing", DEFAULT_GRID_SPACING).max(1.0) as u32;
        canvas.draw_grid(spacing, color(shared, "LineColor", GRID_COLOR));
    }
}

// ---------------------------------------------------------------
// 贴图样式：共享属性 `Image` 为图片文件路径
// ---------------------------------------------------------------

/// 按路径缓存最近一次成功加载的贴图，路径变化时重新加载。
#[derive(Debug, Default)]
struct TextureCache {
    loaded: Mutex<Option<(String, Arc<RgbaImage>)>>,
}

impl TextureCache {
    /// 路径为空或加载失败时返回 `None`，该显示项本次不绘制。
    fn texture(&self, shared: &AttributeBag) -> Option<Arc<RgbaImage>> {
        let path = shared
            .get("Image")
            .and_then(AttributeValue::as_text)
            .filter(|path| !path.is_empty())?;
        let mut loaded = self.loaded.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((cached, texture)) = loaded.as_ref() {
            if cached == path {
                return Some(Arc::clone(texture));
            }
        }
        match image::open(path) {
            Ok(image) => {
                let texture = Arc::new(image.to_rgba8());
                debug!(path, width = texture.width(), height = texture.height(), "贴图已加载");
                *loaded = Some((path.to_string(), Arc::clone(&texture)));
                Some(texture)
            }
            Err(err) => {
                warn!(path, error = %err, "加载贴图失败，跳过绘制");
                None
            }
        }
    }
}

fn image_only() -> AttributeDefinitions {
    definitions([("Image", AttributeDefinition::file())])
}

/// 以节点为中心的图片，可缩放与旋转。
#[derive(Debug, Default)]
pub struct ImageNode {
    cache: TextureCache,
}

impl DisplayStyle for ImageNode {
    fn style_name(&self) -> &'static str {
        IMAGE
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Node
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        image_only()
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([
            ("SizeRatio", AttributeDefinition::slider(DEFAULT_SIZE_RATIO, 0, 1000)),
            ("Rotation", AttributeDefinition::slider(DEFAULT_ROTATION, -180, 180)),
        ])
    }

    /// `SizeRatio` 为百分比；`Rotation` 以度计，屏幕上顺时针为正。
    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Node(position) = subject else {
            return;
        };
        let Some(texture) = self.cache.texture(shared) else {
            return;
        };
        canvas.draw_transformed_image(
            &texture,
            position.as_dvec2(),
            number(values, "SizeRatio", DEFAULT_SIZE_RATIO) / 100.0,
            number(values, "Rotation", DEFAULT_ROTATION).to_radians(),
            100.0,
        );
    }
}

/// 沿线平铺的图片。
#[derive(Debug, Default)]
pub struct ImageLine {
    cache: TextureCache,
}

impl DisplayStyle for ImageLine {
    fn style_name(&self) -> &'static str {
        IMAGE_LINE
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Line
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        image_only()
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        AttributeDefinitions::new()
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        _values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Line(start, end) = subject else {
            return;
        };
        if let Some(texture) = self.cache.texture(shared) {
            canvas.tile_along_segment(&texture, start.as_dvec2(), end.as_dvec2(), 100.0);
        }
    }
}

/// 放在线上某处、随线方向旋转的单张图片。`Positioning` 为沿线百分比。
#[derive(Debug, Default)]
pub struct ImageDoor {
    cache: TextureCache,
}

impl DisplayStyle for ImageDoor {
    fn style_name(&self) -> &'static str {
        IMAGE_DOOR
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Line
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        image_only()
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([("Positioning", AttributeDefinition::slider(DEFAULT_POSITIONING, 0, 100))])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Line(start, end) = subject else {
            return;
        };
        let Some(texture) = self.cache.texture(shared) else {
            return;
        };
        let t = number(values, "Positioning", DEFAULT_POSITIONING) / 100.0;
        let center = geometry::point_on_segment(*start, *end, t);
        let direction = end.as_dvec2() - start.as_dvec2();
        canvas.draw_transformed_image(&texture, center, 1.0, direction.y.atan2(direction.x), 100.0);
    }
}

/// 裁剪到形状内的平铺图片。
#[derive(Debug, Default)]
pub struct ImageShape {
    cache: TextureCache,
}

impl DisplayStyle for ImageShape {
    fn style_name(&self) -> &'static str {
        IMAGE_SHAPE
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Shape
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        image_only()
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([("Opacity", opacity_slider(DEFAULT_OPACITY))])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        let RenderSubject::Shape(polygon) = subject else {
            return;
        };
        let Some(texture) = self.cache.texture(shared) else {
            return;
        };
        let points: Vec<DVec2> = polygon.iter().map(|p| p.as_dvec2()).collect();
        canvas.tile_polygon(&points, &texture, number(values, "Opacity", DEFAULT_OPACITY));
    }
}

/// 平铺整个图层的背景图片。
#[derive(Debug, Default)]
pub struct ImageBackground {
    cache: TextureCache,
}

impl DisplayStyle for ImageBackground {
    fn style_name(&self) -> &'static str {
        IMAGE_BACKGROUND
    }

    fn allowed_class(&self) -> EntityClass {
        EntityClass::Layer
    }

    fn shared_attributes(&self) -> AttributeDefinitions {
        image_only()
    }

    fn individual_attributes(&self) -> AttributeDefinitions {
        definitions([("Opacity", opacity_slider(DEFAULT_OPACITY))])
    }

    fn render(
        &self,
        canvas: &mut Canvas,
        shared: &AttributeBag,
        values: &AttributeBag,
        subject: &RenderSubject<'_>,
    ) {
        if !matches!(subject, RenderSubject::Layer { .. }) {
            return;
        }
        if let Some(texture) = self.cache.texture(shared) {
            canvas.tile_image(&texture, number(values, "Opacity", DEFAULT_OPACITY));
        }
    }
}
