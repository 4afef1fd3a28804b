//! Vertex/index geometry owned by a drawable.
//!
//! This module provides:
//!
//! - [`QuadVertex`] and [`TriangleVertex`]: the vertex formats of the stock geometry
//! - [`GpuMesh`]: a vertex array plus its vertex buffer and optional index buffer
//! - [`MeshBinding`]: a scoped binding that issues draws and unbinds on drop
//!
//! # Vertex Layout
//!
//! The full-screen quad uses `[x, y, z, u, v]` per vertex (20 bytes):
//!
//! | Attribute | Components | Offset | Location |
//! |-----------|------------|--------|----------|
//! | position  | 3          | 0      | 0        |
//! | texcoord  | 2          | 12     | 1        |
//!
//! The triangle only carries a position at location 0.
//!
//! ```ignore
//! let mesh = GpuMesh::quad(&mut ctx)?;
//! {
//!     let binding = mesh.bind_for_draw(&mut ctx);
//!     binding.draw();
//! } // vertex array unbound here
//! mesh.release(&mut ctx);
//! ```

use crate::backend::{BufferId, BufferTarget, GpuApi, VertexArrayId, VertexAttribute};
use crate::error::ResourceError;

/// A vertex of the textured quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 3],
    /// Texture coordinate, `(0, 0)` at the bottom-left of the image.
    pub uv: [f32; 2],
}

impl QuadVertex {
    pub const LAYOUT: [VertexAttribute; 2] = [
        VertexAttribute::new(0, 3, std::mem::size_of::<QuadVertex>() as u32, 0),
        VertexAttribute::new(1, 2, std::mem::size_of::<QuadVertex>() as u32, 12),
    ];

    pub const fn new(position: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, uv }
    }
}

/// A vertex of the plain coloured triangle.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TriangleVertex {
    pub position: [f32; 3],
}

impl TriangleVertex {
    pub const LAYOUT: [VertexAttribute; 1] = [VertexAttribute::new(
        0,
        3,
        std::mem::size_of::<TriangleVertex>() as u32,
        0,
    )];
}

/// Full-screen quad, counter-clockwise from the top right.
pub const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex::new([1.0, 1.0, 0.0], [1.0, 1.0]),   // top right
    QuadVertex::new([1.0, -1.0, 0.0], [1.0, 0.0]),  // bottom right
    QuadVertex::new([-1.0, -1.0, 0.0], [0.0, 0.0]), // bottom left
    QuadVertex::new([-1.0, 1.0, 0.0], [0.0, 1.0]),  // top left
];

/// Two triangles sharing the top-right/bottom-left diagonal.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 3, 1, 2, 3];

pub const TRIANGLE_VERTICES: [TriangleVertex; 3] = [
    TriangleVertex {
        position: [-0.5, -0.5, 0.0],
    },
    TriangleVertex {
        position: [0.5, -0.5, 0.0],
    },
    TriangleVertex {
        position: [0.0, 0.5, 0.0],
    },
];

/// Geometry resident in a context: one vertex array, one vertex buffer, and an index
/// buffer when the mesh is indexed.
#[derive(Debug)]
pub struct GpuMesh {
    vertex_array: VertexArrayId,
    vertex_buffer: BufferId,
    index_buffer: Option<BufferId>,
    layout: Vec<VertexAttribute>,
    vertex_count: u32,
    index_count: u32,
}

impl GpuMesh {
    /// Uploads `vertices` (and `indices`, when non-empty) described by `layout`.
    ///
    /// Everything is validated before the first object is created. On return the
    /// vertex array and array buffer binding points are unbound.
    pub fn upload(
        ctx: &mut impl GpuApi,
        vertices: &[f32],
        indices: &[u32],
        layout: &[VertexAttribute],
    ) -> Result<Self, ResourceError> {
        let vertex_count = validate(vertices, indices, layout)?;

        let vertex_array = ctx.create_vertex_array();
        ctx.bind_vertex_array(Some(vertex_array));

        let vertex_buffer = ctx.create_buffer();
        ctx.bind_buffer(BufferTarget::Array, Some(vertex_buffer));
        ctx.buffer_data(BufferTarget::Array, bytemuck::cast_slice(vertices));

        let index_buffer = if indices.is_empty() {
            None
        } else {
            let ebo = ctx.create_buffer();
            ctx.bind_buffer(BufferTarget::ElementArray, Some(ebo));
            ctx.buffer_data(BufferTarget::ElementArray, bytemuck::cast_slice(indices));
            Some(ebo)
        };

        for attribute in layout {
            ctx.vertex_attrib_pointer(attribute);
            ctx.enable_vertex_attrib_array(attribute.index);
        }

        // The element buffer stays recorded in the vertex array.
        ctx.bind_buffer(BufferTarget::Array, None);
        ctx.bind_vertex_array(None);

        log::debug!(
            "uploaded mesh: vao {}, {} vertices, {} indices",
            vertex_array.get(),
            vertex_count,
            indices.len()
        );

        Ok(Self {
            vertex_array,
            vertex_buffer,
            index_buffer,
            layout: layout.to_vec(),
            vertex_count,
            index_count: indices.len() as u32,
        })
    }

    /// The stock full-screen textured quad.
    pub fn quad(ctx: &mut impl GpuApi) -> Result<Self, ResourceError> {
        Self::upload(
            ctx,
            bytemuck::cast_slice(&QUAD_VERTICES),
            &QUAD_INDICES,
            &QuadVertex::LAYOUT,
        )
    }

    /// The stock single triangle, drawn without indices.
    pub fn triangle(ctx: &mut impl GpuApi) -> Result<Self, ResourceError> {
        Self::upload(
            ctx,
            bytemuck::cast_slice(&TRIANGLE_VERTICES),
            &[],
            &TriangleVertex::LAYOUT,
        )
    }

    pub fn vertex_array(&self) -> VertexArrayId {
        self.vertex_array
    }

    pub fn layout(&self) -> &[VertexAttribute] {
        &self.layout
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn is_indexed(&self) -> bool {
        self.index_buffer.is_some()
    }

    /// Binds the vertex array until the returned guard is dropped.
    pub fn bind_for_draw<'a, C: GpuApi>(&'a self, ctx: &'a mut C) -> MeshBinding<'a, C> {
        ctx.bind_vertex_array(Some(self.vertex_array));
        MeshBinding { mesh: self, ctx }
    }

    /// Deletes the vertex array and buffers.
    pub fn release(self, ctx: &mut impl GpuApi) {
        log::debug!("deleting mesh vao {}", self.vertex_array.get());
        ctx.delete_vertex_array(self.vertex_array);
        ctx.delete_buffer(self.vertex_buffer);
        if let Some(ebo) = self.index_buffer {
            ctx.delete_buffer(ebo);
        }
    }
}

/// A mesh bound for drawing. Dropping it unbinds the vertex array.
pub struct MeshBinding<'a, C: GpuApi> {
    mesh: &'a GpuMesh,
    ctx: &'a mut C,
}

impl<C: GpuApi> MeshBinding<'_, C> {
    /// Draws the whole mesh as a triangle list.
    pub fn draw(&mut self) {
        if self.mesh.is_indexed() {
            self.ctx.draw_elements(self.mesh.index_count);
        } else {
            self.ctx.draw_arrays(0, self.mesh.vertex_count);
        }
    }

    /// The context, for state changes between draws.
    pub fn ctx(&mut self) -> &mut C {
        self.ctx
    }
}

impl<C: GpuApi> Drop for MeshBinding<'_, C> {
    fn drop(&mut self) {
        self.ctx.bind_vertex_array(None);
    }
}

/// Returns the vertex count when `vertices`, `indices` and `layout` agree.
fn validate(vertices: &[f32], indices: &[u32], layout: &[VertexAttribute]) -> Result<u32, ResourceError> {
    let Some(first) = layout.first() else {
        return Err(ResourceError::InvalidLayout("no attributes".to_owned()));
    };
    let stride = first.stride;
    if stride == 0 || stride % 4 != 0 {
        return Err(ResourceError::InvalidLayout(format!(
            "stride {stride} is not a non-zero multiple of 4"
        )));
    }
    for attribute in layout {
        if attribute.stride != stride {
            return Err(ResourceError::InvalidLayout(format!(
                "attribute {} has stride {}, expected {stride}",
                attribute.index, attribute.stride
            )));
        }
        if !(1..=4).contains(&attribute.components) {
            return Err(ResourceError::InvalidLayout(format!(
                "attribute {} has {} components",
                attribute.index, attribute.components
            )));
        }
        if attribute.offset % 4 != 0 || attribute.offset + attribute.byte_size() > stride {
            return Err(ResourceError::InvalidLayout(format!(
                "attribute {} at offset {} does not fit the {stride}-byte stride",
                attribute.index, attribute.offset
            )));
        }
    }

    let floats_per_vertex = (stride / 4) as usize;
    if vertices.is_empty() || vertices.len() % floats_per_vertex != 0 {
        return Err(ResourceError::VertexDataLength {
            len: vertices.len(),
            floats_per_vertex,
        });
    }
    let vertex_count = vertices.len() / floats_per_vertex;

    if let Some((position, &index)) = indices
        .iter()
        .enumerate()
        .find(|(_, i)| **i as usize >= vertex_count)
    {
        return Err(ResourceError::IndexOutOfRange {
            position,
            index,
            vertex_count,
        });
    }
    Ok(vertex_count as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftContext;

    fn triangle_area(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> f32 {
        ((b[0] - a[0]) * (c[1] - a[1]) - (c[0] - a[0]) * (b[1] - a[1])).abs() / 2.0
    }

    #[test]
    fn quad_indices_cover_the_quad_exactly() {
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));

        let total: f32 = QUAD_INDICES
            .chunks_exact(3)
            .map(|t| {
                triangle_area(
                    QUAD_VERTICES[t[0] as usize].position,
                    QUAD_VERTICES[t[1] as usize].position,
                    QUAD_VERTICES[t[2] as usize].position,
                )
            })
            .sum();
        // The quad spans [-1, 1] on both axes.
        assert!((total - 4.0).abs() < 1e-6);
    }

    #[test]
    fn upload_leaves_bindings_at_baseline() {
        let mut ctx = SoftContext::new(2, 2);
        let mesh = GpuMesh::quad(&mut ctx).unwrap();
        assert!(ctx.binding_state().is_baseline());
        assert_eq!(ctx.take_error(), None);
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.index_count(), 6);

        let counts = ctx.object_counts();
        assert_eq!((counts.vertex_arrays, counts.buffers), (1, 2));
        mesh.release(&mut ctx);
        assert_eq!(ctx.object_counts().total(), 0);
    }

    #[test]
    fn triangle_has_no_index_buffer() {
        let mut ctx = SoftContext::new(2, 2);
        let mesh = GpuMesh::triangle(&mut ctx).unwrap();
        assert!(!mesh.is_indexed());
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(ctx.object_counts().buffers, 1);
    }

    #[test]
    fn out_of_range_index_creates_nothing() {
        let mut ctx = SoftContext::new(2, 2);
        let err = GpuMesh::upload(
            &mut ctx,
            bytemuck::cast_slice(&QUAD_VERTICES),
            &[0, 1, 4],
            &QuadVertex::LAYOUT,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ResourceError::IndexOutOfRange {
                position: 2,
                index: 4,
                vertex_count: 4
            }
        );
        assert_eq!(ctx.object_counts().total(), 0);
    }

    #[test]
    fn partial_vertex_is_rejected() {
        let mut ctx = SoftContext::new(2, 2);
        let err = GpuMesh::upload(&mut ctx, &[0.0; 7], &[], &QuadVertex::LAYOUT).unwrap_err();
        assert!(matches!(err, ResourceError::VertexDataLength { len: 7, .. }));

        let bad_layout = [VertexAttribute::new(0, 5, 20, 0)];
        let err = GpuMesh::upload(&mut ctx, &[0.0; 5], &[], &bad_layout).unwrap_err();
        assert!(matches!(err, ResourceError::InvalidLayout(_)));
    }

    #[test]
    fn binding_guard_unbinds_on_drop() {
        let mut ctx = SoftContext::new(2, 2);
        let mesh = GpuMesh::quad(&mut ctx).unwrap();
        {
            let mut binding = mesh.bind_for_draw(&mut ctx);
            assert_eq!(
                binding.ctx().binding_state().vertex_array,
                Some(mesh.vertex_array())
            );
        }
        assert_eq!(ctx.binding_state().vertex_array, None);
    }
}
