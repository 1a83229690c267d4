//! The draw-call surface of the backend.

mod backend;
pub mod vertex;

pub use backend::{RenderBackend, ScenePush};
pub use vertex::{
    fan_to_list, vertex_attribute_descriptions, vertex_binding_description, ArenaCursor,
    SceneVertex, VertexArena, DEFAULT_ARENA_CAPACITY, VERTEX_STRIDE,
};
