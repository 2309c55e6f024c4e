pub mod attributes;
pub mod display;
pub mod geometry;
pub mod graph;
pub mod layer;
pub mod map;
pub mod raster;
pub mod styles;

pub mod errors {
    use thiserror::Error;

    use crate::graph::EntityClass;

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum MapError {
        #[error("layer {0} not found")]
        LayerNotFound(u64),
        #[error("layer index {index} out of range ({count} layers)")]
        LayerIndexOutOfRange { index: usize, count: usize },
        #[error("{0} with id {1} not found")]
        EntityNotFound(EntityClass, u64),
        #[error("display item {0} not found")]
        DisplayItemNotFound(u64),
        #[error("a line needs two distinct nodes")]
        DegenerateLine,
        #[error("a shape needs at least 3 distinct nodes, got {0}")]
        DegenerateShape(usize),
        #[error("invalid layer range `{0}`")]
        InvalidLayerRange(String),
    }
}
