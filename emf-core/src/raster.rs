use glam::DVec2;
use image::{Rgba as Pixel, RgbaImage};

use crate::attributes::Rgba;

/// 图层光栅的绘制目标。所有图元按非预乘 alpha 叠加（source-over）。
#[derive(Debug, Clone)]
pub struct Canvas {
    image: RgbaImage,
}

impl Canvas {
    /// 创建全透明画布。
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[inline]
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x < self.width() && y < self.height() {
            Some(Rgba(self.image.get_pixel(x, y).0))
        } else {
            None
        }
    }

    /// 越界坐标直接忽略。
    pub fn blend_pixel(&mut self, x: i64, y: i64, color: Rgba) {
        if color.alpha() == 0 || x < 0 || y < 0 {
            return;
        }
        let (x, y) = (x as u32, y as u32);
        if x >= self.width() || y >= self.height() {
            return;
        }
        let destination = self.image.get_pixel_mut(x, y);
        *destination = Pixel(blend(Rgba(destination.0), color).0);
    }

    pub fn fill(&mut self, color: Rgba) {
        for pixel in self.image.pixels_mut() {
            *pixel = Pixel(blend(Rgba(pixel.0), color).0);
        }
    }

    pub fn fill_circle(&mut self, center: DVec2, radius: f64, color: Rgba) {
        if radius <= 0.0 {
            return;
        }
        self.for_each_pixel_near(center, center, radius, |canvas, x, y, sample| {
            if sample.distance(center) <= radius {
                canvas.blend_pixel(x, y, color);
            }
        });
    }

    /// 圆形渐变阴影：圆心处为 `start` 不透明度，边缘处为 `end`（均为百分比）。
    pub fn radial_shadow(&mut self, center: DVec2, radius: f64, color: Rgba, start: f64, end: f64) {
        if radius <= 0.0 {
            return;
        }
        self.for_each_pixel_near(center, center, radius, |canvas, x, y, sample| {
            let distance = sample.distance(center);
            if distance <= radius {
                let t = distance / radius;
                canvas.blend_pixel(x, y, color.with_opacity(start + (end - start) * t));
            }
        });
    }

    /// 粗线段，`width` 为总宽度。
    pub fn stroke_segment(&mut self, start: DVec2, end: DVec2, width: f64, color: Rgba) {
        let half = width / 2.0;
        if half <= 0.0 {
            return;
        }
        self.for_each_pixel_near(start, end, half, |canvas, x, y, sample| {
            if distance_to_segment(sample, start, end) <= half {
                canvas.blend_pixel(x, y, color);
            }
        });
    }

    /// 沿线段两侧的渐变阴影，与线段距离为 0 处取 `start`，距离 `radius` 处取 `end`。
    pub fn segment_shadow(
        &mut self,
        start: DVec2,
        end: DVec2,
        radius: f64,
        color: Rgba,
        start_opacity: f64,
        end_opacity: f64,
    ) {
        if radius <= 0.0 {
            return;
        }
        self.for_each_pixel_near(start, end, radius, |canvas, x, y, sample| {
            let distance = distance_to_segment(sample, start, end);
            if distance <= radius {
                let t = distance / radius;
                let opacity = start_opacity + (end_opacity - start_opacity) * t;
                canvas.blend_pixel(x, y, color.with_opacity(opacity));
            }
        });
    }

    /// 奇偶规则的扫描线填充，采样点为像素中心。
    pub fn fill_polygon(&mut self, points: &[DVec2], color: Rgba) {
        self.scan_polygon(points, |canvas, x, y| canvas.blend_pixel(x, y, color));
    }

    /// 以画布坐标平铺贴图并裁剪到多边形内，相邻形状的纹理因此无缝衔接。
    pub fn tile_polygon(&mut self, points: &[DVec2], texture: &RgbaImage, opacity: f64) {
        if texture.width() == 0 || texture.height() == 0 {
            return;
        }
        self.scan_polygon(points, |canvas, x, y| {
            let texel = tiled_texel(texture, x, y);
            canvas.blend_pixel(x, y, texel.with_opacity(opacity));
        });
    }

    /// 平铺贴图铺满整幅画布。
    pub fn tile_image(&mut self, texture: &RgbaImage, opacity: f64) {
        if texture.width() == 0 || texture.height() == 0 {
            return;
        }
        for y in 0..i64::from(self.height()) {
            for x in 0..i64::from(self.width()) {
                let texel = tiled_texel(texture, x, y);
                self.blend_pixel(x, y, texel.with_opacity(opacity));
            }
        }
    }

    /// 以 `center` 为中心绘制缩放并旋转（弧度，屏幕坐标下顺时针）后的贴图，最近邻采样。
    pub fn draw_transformed_image(
        &mut self,
        texture: &RgbaImage,
        center: DVec2,
        scale: f64,
        rotation: f64,
        opacity: f64,
    ) {
        if scale <= 0.0 || texture.width() == 0 || texture.height() == 0 {
            return;
        }
        let half = DVec2::new(f64::from(texture.width()), f64::from(texture.height())) / 2.0;
        let inverse = DVec2::from_angle(-rotation);
        self.for_each_pixel_near(center, center, half.length() * scale, |canvas, x, y, sample| {
            let local = inverse.rotate(sample - center) / scale + half;
            if let Some(texel) = texel(texture, local) {
                canvas.blend_pixel(x, y, texel.with_opacity(opacity));
            }
        });
    }

    /// 沿线段平铺贴图：贴图的 x 轴沿线段方向，高度方向以线段为中线。
    pub fn tile_along_segment(&mut self, texture: &RgbaImage, start: DVec2, end: DVec2, opacity: f64) {
        let length = start.distance(end);
        if length == 0.0 || texture.width() == 0 || texture.height() == 0 {
            return;
        }
        let along = (end - start) / length;
        let across = along.perp();
        let half_height = f64::from(texture.height()) / 2.0;
        let width = f64::from(texture.width());
        self.for_each_pixel_near(start, end, half_height, |canvas, x, y, sample| {
            let offset = sample - start;
            let u = offset.dot(along);
            let v = offset.dot(across) + half_height;
            if !(0.0..=length).contains(&u) {
                return;
            }
            if let Some(texel) = texel(texture, DVec2::new(u.rem_euclid(width), v)) {
                canvas.blend_pixel(x, y, texel.with_opacity(opacity));
            }
        });
    }

    /// 宽度为 `width` 的线段色带，透明度从起点的 `start_opacity` 线性过渡到终点的 `end_opacity`。
    pub fn segment_gradient(
        &mut self,
        start: DVec2,
        end: DVec2,
        width: f64,
        color: Rgba,
        start_opacity: f64,
        end_opacity: f64,
    ) {
        let half = width / 2.0;
        let segment = end - start;
        let length_sq = segment.length_squared();
        if half <= 0.0 || length_sq == 0.0 {
            return;
        }
        self.for_each_pixel_near(start, end, half, |canvas, x, y, sample| {
            if distance_to_segment(sample, start, end) > half {
                return;
            }
            let t = ((sample - start).dot(segment) / length_sq).clamp(0.0, 1.0);
            let opacity = start_opacity + (end_opacity - start_opacity) * t;
            canvas.blend_pixel(x, y, color.with_opacity(opacity));
        });
    }

    pub fn stroke_polygon(&mut self, points: &[DVec2], width: f64, color: Rgba) {
        if points.len() < 2 {
            return;
        }
        for (index, &start) in points.iter().enumerate() {
            let end = points[(index + 1) % points.len()];
            self.stroke_segment(start, end, width, color);
        }
    }

    /// 以 `spacing` 像素为间隔绘制 1 像素宽的网格线。
    pub fn draw_grid(&mut self, spacing: u32, color: Rgba) {
        if spacing == 0 {
            return;
        }
        let (width, height) = (self.width(), self.height());
        for x in (0..width).step_by(spacing as usize) {
            for y in 0..height {
                self.blend_pixel(i64::from(x), i64::from(y), color);
            }
        }
        for y in (0..height).step_by(spacing as usize) {
            for x in 0..width {
                if x % spacing != 0 {
                    self.blend_pixel(i64::from(x), i64::from(y), color);
                }
            }
        }
    }

    /// 将另一幅图像叠加到左上角。
    pub fn draw_image(&mut self, other: &RgbaImage) {
        let width = self.width().min(other.width());
        let height = self.height().min(other.height());
        for y in 0..height {
            for x in 0..width {
                self.blend_pixel(i64::from(x), i64::from(y), Rgba(other.get_pixel(x, y).0));
            }
        }
    }

    fn scan_polygon<F>(&mut self, points: &[DVec2], mut visit: F)
    where
        F: FnMut(&mut Self, i64, i64),
    {
        if points.len() < 3 {
            return;
        }
        let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        let first_row = min_y.floor().max(0.0) as i64;
        let last_row = (max_y.ceil() as i64).min(i64::from(self.height()));

        let mut crossings = Vec::new();
        for row in first_row..last_row {
            let sample_y = row as f64 + 0.5;
            crossings.clear();
            let mut previous = points[points.len() - 1];
            for &current in points {
                if (current.y > sample_y) != (previous.y > sample_y) {
                    let t = (sample_y - current.y) / (previous.y - current.y);
                    crossings.push(current.x + t * (previous.x - current.x));
                }
                previous = current;
            }
            crossings.sort_by(f64::total_cmp);
            for pair in crossings.chunks_exact(2) {
                let from = (pair[0] - 0.5).ceil() as i64;
                let to = (pair[1] - 0.5).floor() as i64;
                for column in from.max(0)..=to.min(i64::from(self.width()) - 1) {
                    visit(self, column, row);
                }
            }
        }
    }

    fn for_each_pixel_near<F>(&mut self, a: DVec2, b: DVec2, margin: f64, mut visit: F)
    where
        F: FnMut(&mut Self, i64, i64, DVec2),
    {
        let min = a.min(b) - DVec2::splat(margin);
        let max = a.max(b) + DVec2::splat(margin);
        let x0 = (min.x.floor() as i64).max(0);
        let y0 = (min.y.floor() as i64).max(0);
        let x1 = (max.x.ceil() as i64).min(i64::from(self.width()) - 1);
        let y1 = (max.y.ceil() as i64).min(i64::from(self.height()) - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let sample = DVec2::new(x as f64 + 0.5, y as f64 + 0.5);
                visit(self, x, y, sample);
            }
        }
    }
}

fn distance_to_segment(point: DVec2, start: DVec2, end: DVec2) -> f64 {
    let segment = end - start;
    let length_sq = segment.length_squared();
    if length_sq == 0.0 {
        return point.distance(start);
    }
    let t = ((point - start).dot(segment) / length_sq).clamp(0.0, 1.0);
    point.distance(start + segment * t)
}

/// 越界返回 `None`。
fn texel(texture: &RgbaImage, at: DVec2) -> Option<Rgba> {
    if at.x < 0.0 || at.y < 0.0 {
        return None;
    }
    let (x, y) = (at.x.floor() as u32, at.y.floor() as u32);
    (x < texture.width() && y < texture.height()).then(|| Rgba(texture.get_pixel(x, y).0))
}

fn tiled_texel(texture: &RgbaImage, x: i64, y: i64) -> Rgba {
    let x = x.rem_euclid(i64::from(texture.width())) as u32;
    let y = y.rem_euclid(i64::from(texture.height())) as u32;
    Rgba(texture.get_pixel(x, y).0)
}

/// 非预乘 source-over 混合。
fn blend(destination: Rgba, source: Rgba) -> Rgba {
    let source_alpha = f64::from(source.alpha()) / 255.0;
    if source_alpha >= 1.0 {
        return source;
    }
    let destination_alpha = f64::from(destination.alpha()) / 255.0;
    let out_alpha = source_alpha + destination_alpha * (1.0 - source_alpha);
    if out_alpha <= 0.0 {
        return Rgba::TRANSPARENT;
    }
    let mut out = [0u8; 4];
    for channel in 0..3 {
        let s = f64::from(source.0[channel]);
        let d = f64::from(destination.0[channel]);
        let value = (s * source_alpha + d * destination_alpha * (1.0 - source_alpha)) / out_alpha;
        out[channel] = value.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_alpha * 255.0).round() as u8;
    Rgba(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba = Rgba([255, 0, 0, 255]);

    #[test]
    fn half_transparent_over_opaque_mixes_channels() {
        let mut canvas = Canvas::new(2, 2);
        canvas.fill(Rgba::WHITE);
        canvas.blend_pixel(0, 0, Rgba::new(0, 0, 0, 128));
        let pixel = canvas.pixel(0, 0).expect("inside");
        assert_eq!(pixel.alpha(), 255);
        assert!((126..=128).contains(&pixel.0[0]));
        assert_eq!(canvas.pixel(1, 1), Some(Rgba::WHITE));

        // 越界写入被忽略
        canvas.blend_pixel(-1, 5, RED);
        assert_eq!(canvas.pixel(5, 5), None);
    }

    #[test]
    fn circle_covers_center_only() {
        let mut canvas = Canvas::new(20, 20);
        canvas.fill_circle(DVec2::new(10.0, 10.0), 3.0, RED);
        assert_eq!(canvas.pixel(10, 10), Some(RED));
        assert_eq!(canvas.pixel(0, 0), Some(Rgba::TRANSPARENT));
        assert_eq!(canvas.pixel(15, 10), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn polygon_fill_matches_square_interior() {
        let mut canvas = Canvas::new(10, 10);
        let square = [
            DVec2::new(2.0, 2.0),
            DVec2::new(6.0, 2.0),
            DVec2::new(6.0, 6.0),
            DVec2::new(2.0, 6.0),
        ];
        canvas.fill_polygon(&square, RED);
        let filled = canvas.image().pixels().filter(|p| p.0 == RED.0).count();
        assert_eq!(filled, 16);
        assert_eq!(canvas.pixel(2, 2), Some(RED));
        assert_eq!(canvas.pixel(6, 6), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn segment_stroke_and_shadow_fade() {
        let mut canvas = Canvas::new(20, 20);
        canvas.stroke_segment(DVec2::new(0.0, 10.0), DVec2::new(20.0, 10.0), 2.0, RED);
        assert_eq!(canvas.pixel(5, 9), Some(RED));
        assert_eq!(canvas.pixel(5, 5), Some(Rgba::TRANSPARENT));

        let mut shadow = Canvas::new(20, 20);
        shadow.segment_shadow(
            DVec2::new(0.0, 10.0),
            DVec2::new(20.0, 10.0),
            8.0,
            Rgba::BLACK,
            100.0,
            0.0,
        );
        let near = shadow.pixel(5, 10).expect("inside").alpha();
        let far = shadow.pixel(5, 16).expect("inside").alpha();
        assert!(near > far);
    }

    #[test]
    fn grid_marks_multiples_of_spacing() {
        let mut canvas = Canvas::new(10, 10);
        canvas.draw_grid(5, RED);
        assert_eq!(canvas.pixel(0, 3), Some(RED));
        assert_eq!(canvas.pixel(5, 7), Some(RED));
        assert_eq!(canvas.pixel(3, 5), Some(RED));
        assert_eq!(canvas.pixel(3, 3), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn draw_image_composites_over_existing_content() {
        let mut base = Canvas::new(4, 4);
        base.fill(Rgba::WHITE);
        let mut top = Canvas::new(2, 2);
        top.fill(RED);
        base.draw_image(top.image());
        assert_eq!(base.pixel(1, 1), Some(RED));
        assert_eq!(base.pixel(3, 3), Some(Rgba::WHITE));
    }

    fn checker() -> RgbaImage {
        RgbaImage::from_fn(2, 2, |x, y| {
            if (x + y) % 2 == 0 { Pixel(RED.0) } else { Pixel(Rgba::WHITE.0) }
        })
    }

    #[test]
    fn tiled_fills_repeat_texture_in_canvas_space() {
        let mut canvas = Canvas::new(6, 6);
        canvas.tile_image(&checker(), 100.0);
        assert_eq!(canvas.pixel(0, 0), Some(RED));
        assert_eq!(canvas.pixel(1, 0), Some(Rgba::WHITE));
        assert_eq!(canvas.pixel(4, 4), Some(RED));

        let mut clipped = Canvas::new(6, 6);
        let square = [
            DVec2::new(2.0, 2.0),
            DVec2::new(4.0, 2.0),
            DVec2::new(4.0, 4.0),
            DVec2::new(2.0, 4.0),
        ];
        clipped.tile_polygon(&square, &checker(), 50.0);
        assert_eq!(clipped.pixel(2, 2).map(Rgba::alpha), Some(128));
        assert_eq!(clipped.pixel(3, 2).map(|p| p.0[1]), Some(255));
        assert_eq!(clipped.pixel(0, 0), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn transformed_image_scales_and_rotates_around_center() {
        // 4x2 贴图：左半红，右半白
        let texture = RgbaImage::from_fn(4, 2, |x, _| {
            if x < 2 { Pixel(RED.0) } else { Pixel(Rgba::WHITE.0) }
        });
        let mut canvas = Canvas::new(20, 20);
        canvas.draw_transformed_image(&texture, DVec2::new(10.0, 10.0), 2.0, 0.0, 100.0);
        assert_eq!(canvas.pixel(7, 10), Some(RED));
        assert_eq!(canvas.pixel(12, 10), Some(Rgba::WHITE));
        assert_eq!(canvas.pixel(10, 14), Some(Rgba::TRANSPARENT));

        // 顺时针转 90 度后左半落到上方
        let mut turned = Canvas::new(20, 20);
        turned.draw_transformed_image(&texture, DVec2::new(10.0, 10.0), 2.0, std::f64::consts::FRAC_PI_2, 100.0);
        assert_eq!(turned.pixel(10, 7), Some(RED));
        assert_eq!(turned.pixel(10, 12), Some(Rgba::WHITE));
        assert_eq!(turned.pixel(7, 10), Some(Rgba::TRANSPARENT));
    }

    #[test]
    fn segment_texture_and_gradient_follow_direction() {
        let mut canvas = Canvas::new(20, 20);
        canvas.tile_along_segment(&checker(), DVec2::new(0.0, 10.0), DVec2::new(20.0, 10.0), 100.0);
        assert_eq!(canvas.pixel(0, 9), Some(RED));
        assert_eq!(canvas.pixel(1, 9), Some(Rgba::WHITE));
        assert_eq!(canvas.pixel(5, 12), Some(Rgba::TRANSPARENT));

        let mut fade = Canvas::new(20, 20);
        fade.segment_gradient(
            DVec2::new(0.0, 10.0),
            DVec2::new(20.0, 10.0),
            4.0,
            Rgba::BLACK,
            100.0,
            0.0,
        );
        let head = fade.pixel(1, 10).expect("inside").alpha();
        let tail = fade.pixel(18, 10).expect("inside").alpha();
        assert!(head > 200 && tail < 30);
        assert_eq!(fade.pixel(10, 15), Some(Rgba::TRANSPARENT));
    }
}
