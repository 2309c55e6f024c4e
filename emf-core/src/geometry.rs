use glam::{DVec2, IVec2};
use serde::{Deserialize, Serialize};

/// 平移吸附步长（像素）。
pub const GRAB_SNAP: i32 = 9;
/// 旋转吸附步长（度）。
pub const ROTATE_SNAP: f64 = 15.0;
/// 缩放吸附步长（像素，作用于新的枢轴距离）。
pub const SCALE_SNAP: f64 = 36.0;
/// 枢轴距离的下限，避免零距离时除零。
pub const MIN_PIVOT_DISTANCE: f64 = 0.1;

/// 地图上的整数坐标点。屏幕坐标系：x 向右，y 向下。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point2(pub IVec2);

impl Point2 {
    pub const ORIGIN: Point2 = Point2(IVec2::ZERO);

    #[inline]
    pub fn new(x: i32, y: i32) -> Self {
        Self(IVec2::new(x, y))
    }

    #[inline]
    pub fn x(self) -> i32 {
        self.0.x
    }

    #[inline]
    pub fn y(self) -> i32 {
        self.0.y
    }

    #[inline]
    pub fn as_dvec2(self) -> DVec2 {
        self.0.as_dvec2()
    }

    /// 将浮点位置四舍五入（远离零）到整数坐标。
    #[inline]
    pub fn from_dvec2_rounded(value: DVec2) -> Self {
        Self::new(value.x.round() as i32, value.y.round() as i32)
    }

    /// 坐标越界时饱和到 `i32` 边界。
    #[inline]
    pub fn translate(self, offset: IVec2) -> Self {
        Self(self.0.saturating_add(offset))
    }

    #[inline]
    pub fn offset_to(self, other: Point2) -> IVec2 {
        other.0.saturating_sub(self.0)
    }
}

impl From<IVec2> for Point2 {
    fn from(value: IVec2) -> Self {
        Self(value)
    }
}

impl From<(i32, i32)> for Point2 {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x, y)
    }
}

/// 以 `base` 为原点，从正上方顺时针量到 `point` 的角度，范围 [0, 360)。
pub fn angle_of(base: Point2, point: Point2) -> f64 {
    let dx = f64::from(point.x()) - f64::from(base.x());
    let dy = f64::from(point.y()) - f64::from(base.y());
    if dx == 0.0 {
        return if dy <= 0.0 { 0.0 } else { 180.0 };
    }
    let angle = (dy / dx).abs().atan().to_degrees();
    if dy < 0.0 {
        if dx >= 0.0 { 90.0 - angle } else { 270.0 + angle }
    } else if dx >= 0.0 {
        90.0 + angle
    } else {
        270.0 - angle
    }
}

#[inline]
pub fn distance_squared(a: Point2, b: Point2) -> f64 {
    let dx = (i64::from(a.x()) - i64::from(b.x())) as f64;
    let dy = (i64::from(a.y()) - i64::from(b.y())) as f64;
    dx * dx + dy * dy
}

#[inline]
pub fn distance(a: Point2, b: Point2) -> f64 {
    distance_squared(a, b).sqrt()
}

/// 某点相对基准点的角度与距离。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub angle: f64,
    pub distance: f64,
}

/// `square_root` 为 false 时 `distance` 为距离平方，排序时足够且更便宜。
pub fn comparison(base: Point2, point: Point2, square_root: bool) -> Comparison {
    let distance = if square_root {
        distance(base, point)
    } else {
        distance_squared(base, point)
    };
    Comparison {
        angle: angle_of(base, point),
        distance,
    }
}

/// 各分量取均值后四舍五入；空输入返回 `None`。
pub fn mean_point(points: &[Point2]) -> Option<Point2> {
    if points.is_empty() {
        return None;
    }
    let (sum_x, sum_y) = points.iter().fold((0i64, 0i64), |(sx, sy), p| {
        (sx + i64::from(p.x()), sy + i64::from(p.y()))
    });
    let count = points.len() as f64;
    Some(Point2::from_dvec2_rounded(DVec2::new(
        sum_x as f64 / count,
        sum_y as f64 / count,
    )))
}

/// 点在线段上的最近点。零长度线段退化为起点。
pub fn closest_point_on_segment(point: Point2, start: Point2, end: Point2) -> DVec2 {
    let origin = start.as_dvec2();
    let segment = end.as_dvec2() - origin;
    let length_sq = segment.length_squared();
    if length_sq == 0.0 {
        return origin;
    }
    let t = ((point.as_dvec2() - origin).dot(segment) / length_sq).clamp(0.0, 1.0);
    origin + segment * t
}

/// 点到线段的距离平方，用于线的点选判定。
pub fn segment_distance_squared(point: Point2, start: Point2, end: Point2) -> f64 {
    point
        .as_dvec2()
        .distance_squared(closest_point_on_segment(point, start, end))
}

/// 线段上参数 `t`（限制在 [0, 1]）处的插值点。
#[inline]
pub fn point_on_segment(start: Point2, end: Point2, t: f64) -> DVec2 {
    start.as_dvec2().lerp(end.as_dvec2(), t.clamp(0.0, 1.0))
}

/// 按绕中心的角度升序、距离升序排序。`center` 缺省为各点均值。
pub fn sort_node_group<K: Copy>(points: &[(K, Point2)], center: Option<Point2>) -> Vec<K> {
    let Some(center) = center.or_else(|| {
        let positions: Vec<Point2> = points.iter().map(|(_, p)| *p).collect();
        mean_point(&positions)
    }) else {
        return Vec::new();
    };
    let mut keyed: Vec<(K, Comparison)> = points
        .iter()
        .map(|(key, point)| (*key, comparison(center, *point, false)))
        .collect();
    keyed.sort_by(|(_, a), (_, b)| {
        a.angle
            .total_cmp(&b.angle)
            .then(a.distance.total_cmp(&b.distance))
    });
    keyed.into_iter().map(|(key, _)| key).collect()
}

/// 连通性整理：从排序结果的首元素出发，每一步在剩余元素里优先取与上一个已连通、
/// 且在剩余序列中下标最大的候选；没有连通候选时取剩余序列的第一个。
pub fn order_boundary<K, F>(sorted: Vec<K>, mut connected: F) -> Vec<K>
where
    K: Copy,
    F: FnMut(K, K) -> bool,
{
    let mut remaining = sorted;
    if remaining.is_empty() {
        return remaining;
    }
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut last = remaining.remove(0);
    ordered.push(last);
    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .rposition(|&candidate| connected(last, candidate))
            .unwrap_or(0);
        last = remaining.remove(next);
        ordered.push(last);
    }
    ordered
}

/// 奇偶规则下多边形是否包含该点。
pub fn polygon_contains(polygon: &[Point2], point: Point2) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let p = point.as_dvec2();
    let mut inside = false;
    let mut previous = polygon[polygon.len() - 1].as_dvec2();
    for vertex in polygon {
        let current = vertex.as_dvec2();
        if (current.y > p.y) != (previous.y > p.y) {
            let cross_x =
                current.x + (p.y - current.y) * (previous.x - current.x) / (previous.y - current.y);
            if p.x < cross_x {
                inside = !inside;
            }
        }
        previous = current;
    }
    inside
}

/// 向下取整到 `step` 的整数倍（负数同样向下）。
#[inline]
pub fn snap_down_i32(value: i32, step: i32) -> i32 {
    value.saturating_sub(value.rem_euclid(step))
}

#[inline]
pub fn snap_down(value: f64, step: f64) -> f64 {
    value - value.rem_euclid(step)
}
