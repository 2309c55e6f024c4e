use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DisplayItemId(u64);

impl DisplayItemId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DisplayItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "di#{}", self.0)
    }
}

/// 非预乘的 RGBA 颜色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const BLACK: Rgba = Rgba([0, 0, 0, 255]);
    pub const WHITE: Rgba = Rgba([255, 255, 255, 255]);
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);

    #[inline]
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self([r, g, b, a])
    }

    #[inline]
    pub fn alpha(self) -> u8 {
        self.0[3]
    }

    /// 按百分比（0-100）缩放透明度。
    pub fn with_opacity(self, percent: f64) -> Self {
        let factor = (percent / 100.0).clamp(0.0, 1.0);
        let [r, g, b, a] = self.0;
        Self([r, g, b, (f64::from(a) * factor).round() as u8])
    }
}

/// 显示项属性值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Color(Rgba),
    Text(String),
}

impl AttributeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(value) => Some(*value),
            AttributeValue::Float(value) => Some(value.round() as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(value) => Some(*value as f64),
            AttributeValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<Rgba> {
        match self {
            AttributeValue::Color(color) => Some(*color),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// 单个实体为单个显示项保存的属性值。
pub type AttributeBag = BTreeMap<String, AttributeValue>;

/// 实体上挂载的显示项及其各自的属性值，保持挂载顺序。
///
/// 只负责存储；脏标记由持有实体的 [`Layer`](crate::layer::Layer) 在包装方法中处理。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeHolder {
    entries: Vec<(DisplayItemId, AttributeBag)>,
}

impl AttributeHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已挂载时不做任何修改并返回 `false`。
    pub fn attach(&mut self, item: DisplayItemId, values: AttributeBag) -> bool {
        if self.is_attached(item) {
            return false;
        }
        self.entries.push((item, values));
        true
    }

    #[inline]
    pub fn is_attached(&self, item: DisplayItemId) -> bool {
        self.entries.iter().any(|(id, _)| *id == item)
    }

    /// 仅在已挂载时覆盖，返回是否写入。
    pub fn update_value(
        &mut self,
        item: DisplayItemId,
        name: impl Into<String>,
        value: AttributeValue,
    ) -> bool {
        match self.entries.iter_mut().find(|(id, _)| *id == item) {
            Some((_, bag)) => {
                bag.insert(name.into(), value);
                true
            }
            None => false,
        }
    }

    pub fn detach(&mut self, item: DisplayItemId) -> Option<AttributeBag> {
        let index = self.entries.iter().position(|(id, _)| *id == item)?;
        Some(self.entries.remove(index).1)
    }

    /// 清空全部挂载，返回被移除的显示项（按挂载顺序）。
    pub fn detach_all(&mut self) -> Vec<DisplayItemId> {
        self.entries.drain(..).map(|(id, _)| id).collect()
    }

    pub fn current_display_items(&self) -> impl Iterator<Item = DisplayItemId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn values_for(&self, item: DisplayItemId) -> Option<&AttributeBag> {
        self.entries
            .iter()
            .find(|(id, _)| *id == item)
            .map(|(_, bag)| bag)
    }

    pub fn entries(&self) -> impl Iterator<Item = (DisplayItemId, &AttributeBag)> + '_ {
        self.entries.iter().map(|(id, bag)| (*id, bag))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 节点、线、形状与图层共用的属性挂载能力。
pub trait AttributeHost {
    fn attributes(&self) -> &AttributeHolder;

    fn current_display_items(&self) -> Vec<DisplayItemId> {
        self.attributes().current_display_items().collect()
    }

    fn values_for(&self, item: DisplayItemId) -> Option<&AttributeBag> {
        self.attributes().values_for(item)
    }

    fn is_attached(&self, item: DisplayItemId) -> bool {
        self.attributes().is_attached(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(entries: &[(&str, i64)]) -> AttributeBag {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), AttributeValue::Int(*value)))
            .collect()
    }

    #[test]
    fn attach_is_idempotent() {
        let mut holder = AttributeHolder::new();
        let item = DisplayItemId::new(3);
        assert!(holder.attach(item, bag(&[("Size", 24)])));
        assert!(!holder.attach(item, bag(&[("Size", 99)])));

        assert_eq!(holder.current_display_items().collect::<Vec<_>>(), vec![item]);
        assert_eq!(holder.values_for(item), Some(&bag(&[("Size", 24)])));
    }

    #[test]
    fn update_only_touches_attached_items() {
        let mut holder = AttributeHolder::new();
        let attached = DisplayItemId::new(1);
        let missing = DisplayItemId::new(2);
        holder.attach(attached, AttributeBag::new());

        assert!(holder.update_value(attached, "Opacity", AttributeValue::Int(40)));
        assert!(!holder.update_value(missing, "Opacity", AttributeValue::Int(40)));
        assert_eq!(
            holder.values_for(attached).and_then(|b| b.get("Opacity")),
            Some(&AttributeValue::Int(40))
        );
        assert!(holder.values_for(missing).is_none());
    }

    #[test]
    fn detach_and_detach_all_preserve_order() {
        let mut holder = AttributeHolder::new();
        for raw in [5, 1, 9] {
            holder.attach(DisplayItemId::new(raw), AttributeBag::new());
        }
        assert!(holder.detach(DisplayItemId::new(1)).is_some());
        assert!(holder.detach(DisplayItemId::new(1)).is_none());

        let removed = holder.detach_all();
        assert_eq!(removed, vec![DisplayItemId::new(5), DisplayItemId::new(9)]);
        assert!(holder.is_empty());
    }

    #[test]
    fn numeric_values_convert() {
        assert_eq!(AttributeValue::Float(2.6).as_int(), Some(3));
        assert_eq!(AttributeValue::Int(4).as_float(), Some(4.0));
        assert!(AttributeValue::Text("x".into()).as_color().is_none());
        assert_eq!(Rgba::BLACK.with_opacity(50.0).alpha(), 128);
    }
}
