//! GPU-resident quad buffers mirroring the cell grids.
//!
//! The one rule that matters here: an upload with the same element count as
//! the previous one patches buffer contents in place, an upload with a
//! different count reallocates. Content-only changes (typing, highlight
//! updates) must never pay for a reallocation; only topology changes (grid
//! resize, glyph count change) do.

use bytemuck::{Pod, Zeroable};
use tracing::trace;
use wgpu::util::DeviceExt;

use crate::grid::GridSet;

/// One vertex of a cell quad. `textured` selects between a flat background
/// quad (0) and an atlas-sampled glyph quad (1) in the shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
    pub textured: f32,
}

/// Buffer update policy decision, kept pure so it is testable without a
/// device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// Element count changed: allocate a new buffer and upload everything.
    Reallocate,
    /// Same element count: write contents into the existing allocation.
    Patch,
}

pub fn upload_kind(previous_len: usize, new_len: usize) -> UploadKind {
    if previous_len == new_len {
        UploadKind::Patch
    } else {
        UploadKind::Reallocate
    }
}

/// UV lookup into the externally managed glyph atlas. Rasterization and
/// packing happen elsewhere; we only need rectangles.
pub trait GlyphAtlas {
    /// `[u0, v0, u1, v1]` for a glyph, or `None` when it has no rendered
    /// form (whitespace, unresolved).
    fn uv(&self, glyph: char) -> Option<[f32; 4]>;
}

fn rgb_to_f32(rgb: u32, alpha: f32) -> [f32; 4] {
    [
        ((rgb >> 16) & 0xff) as f32 / 255.0,
        ((rgb >> 8) & 0xff) as f32 / 255.0,
        (rgb & 0xff) as f32 / 255.0,
        alpha,
    ]
}

fn push_quad(
    vertices: &mut Vec<Vertex>,
    indices: &mut Vec<u32>,
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    uv: [f32; 4],
    color: [f32; 4],
    textured: f32,
) {
    let base = vertices.len() as u32;
    vertices.push(Vertex {
        position: [x, y],
        uv: [uv[0], uv[1]],
        color,
        textured,
    });
    vertices.push(Vertex {
        position: [x + w, y],
        uv: [uv[2], uv[1]],
        color,
        textured,
    });
    vertices.push(Vertex {
        position: [x + w, y + h],
        uv: [uv[2], uv[3]],
        color,
        textured,
    });
    vertices.push(Vertex {
        position: [x, y + h],
        uv: [uv[0], uv[3]],
        color,
        textured,
    });
    indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
}

/// Rebuild quad geometry for every grid: one background quad per cell plus
/// one glyph quad per cell that has a drawable glyph. Invariant: six
/// indices per four vertices, always.
pub fn build_geometry(
    grids: &GridSet,
    atlas: &dyn GlyphAtlas,
    cell_width: f32,
    cell_height: f32,
    transparency: f32,
) -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    let mut ids: Vec<u64> = grids.grids().map(|grid| grid.id).collect();
    ids.sort_unstable();

    for id in ids {
        let Some(grid) = grids.grid(id) else { continue };
        for row in 0..grid.rows {
            for col in 0..grid.cols {
                let Some(cell) = grid.cell(row, col) else {
                    continue;
                };
                let attr = grids.hl_attr(cell.hl_id);
                let (mut fg, mut bg) = (
                    attr.foreground.unwrap_or(grids.default_foreground),
                    attr.background.unwrap_or(grids.default_background),
                );
                if attr.reverse {
                    std::mem::swap(&mut fg, &mut bg);
                }
                let x = col as f32 * cell_width;
                let y = row as f32 * cell_height;
                push_quad(
                    &mut vertices,
                    &mut indices,
                    x,
                    y,
                    cell_width,
                    cell_height,
                    [0.0; 4],
                    rgb_to_f32(bg, transparency),
                    0.0,
                );
                if cell.glyph != ' ' {
                    if let Some(uv) = atlas.uv(cell.glyph) {
                        push_quad(
                            &mut vertices,
                            &mut indices,
                            x,
                            y,
                            cell_width,
                            cell_height,
                            uv,
                            rgb_to_f32(fg, 1.0),
                            1.0,
                        );
                    }
                }
            }
        }
    }

    (vertices, indices)
}

/// Column-major orthographic projection mapping pixel space (origin top
/// left, y down) onto clip space.
fn ortho_projection(width: f32, height: f32) -> [[f32; 4]; 4] {
    [
        [2.0 / width, 0.0, 0.0, 0.0],
        [0.0, -2.0 / height, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [-1.0, 1.0, 0.0, 1.0],
    ]
}

/// Owns the vertex/index buffers and the quad pipeline for one window.
/// Lives on the application thread only; created at initialization and
/// dropped at teardown.
pub struct FrameBuffer {
    pipeline: wgpu::RenderPipeline,
    projection_buffer: wgpu::Buffer,
    projection_bind_group: wgpu::BindGroup,
    atlas_layout: wgpu::BindGroupLayout,
    vertex_buffer: Option<wgpu::Buffer>,
    index_buffer: Option<wgpu::Buffer>,
    vertex_len: usize,
    index_len: usize,
    viewport: (u32, u32),
}

impl FrameBuffer {
    pub fn new(device: &wgpu::Device, surface_format: wgpu::TextureFormat) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("quadro cell shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("quad.wgsl").into()),
        });

        let projection_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("quadro projection layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let atlas_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("quadro atlas layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let projection_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quadro projection"),
            contents: bytemuck::cast_slice(&ortho_projection(1.0, 1.0)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let projection_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("quadro projection bind group"),
            layout: &projection_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: projection_buffer.as_entire_binding(),
            }],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("quadro pipeline layout"),
            bind_group_layouts: &[&projection_layout, &atlas_layout],
            push_constant_ranges: &[],
        });

        let vertex_layout = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &wgpu::vertex_attr_array![
                0 => Float32x2,
                1 => Float32x2,
                2 => Float32x4,
                3 => Float32,
            ],
        };

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("quadro cell pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[vertex_layout],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            projection_buffer,
            projection_bind_group,
            atlas_layout,
            vertex_buffer: None,
            index_buffer: None,
            vertex_len: 0,
            index_len: 0,
            viewport: (0, 0),
        }
    }

    /// Layout for the caller-built atlas texture/sampler bind group.
    pub fn atlas_layout(&self) -> &wgpu::BindGroupLayout {
        &self.atlas_layout
    }

    /// Upload the frame geometry, reallocating only when the element count
    /// changed since the previous upload.
    pub fn update(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        vertices: &[Vertex],
        indices: &[u32],
    ) {
        match upload_kind(self.vertex_len, vertices.len()) {
            UploadKind::Reallocate => {
                trace!(len = vertices.len(), "reallocating vertex buffer");
                self.vertex_buffer =
                    Some(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("quadro vertices"),
                        contents: bytemuck::cast_slice(vertices),
                        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                    }));
                self.vertex_len = vertices.len();
            }
            UploadKind::Patch => {
                if let Some(buffer) = &self.vertex_buffer {
                    queue.write_buffer(buffer, 0, bytemuck::cast_slice(vertices));
                }
            }
        }
        match upload_kind(self.index_len, indices.len()) {
            UploadKind::Reallocate => {
                trace!(len = indices.len(), "reallocating index buffer");
                self.index_buffer =
                    Some(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("quadro indices"),
                        contents: bytemuck::cast_slice(indices),
                        usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
                    }));
                self.index_len = indices.len();
            }
            UploadKind::Patch => {
                if let Some(buffer) = &self.index_buffer {
                    queue.write_buffer(buffer, 0, bytemuck::cast_slice(indices));
                }
            }
        }
    }

    /// One indexed draw over the current index count. Meaningful only after
    /// at least one successful [`update`](FrameBuffer::update).
    pub fn render(&self, pass: &mut wgpu::RenderPass<'_>, atlas_bind_group: &wgpu::BindGroup) {
        let (Some(vertex_buffer), Some(index_buffer)) =
            (&self.vertex_buffer, &self.index_buffer)
        else {
            return;
        };
        if self.index_len == 0 {
            return;
        }
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.projection_bind_group, &[]);
        pass.set_bind_group(1, atlas_bind_group, &[]);
        pass.set_vertex_buffer(0, vertex_buffer.slice(..));
        pass.set_index_buffer(index_buffer.slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed(0..self.index_len as u32, 0, 0..1);
    }

    /// Recompute the orthographic projection for a new surface size.
    /// Idempotent; a repeated size is a no-op.
    pub fn set_viewport(&mut self, queue: &wgpu::Queue, width: u32, height: u32) {
        if width == 0 || height == 0 || self.viewport == (width, height) {
            return;
        }
        self.viewport = (width, height);
        let projection = ortho_projection(width as f32, height as f32);
        queue.write_buffer(
            &self.projection_buffer,
            0,
            bytemuck::cast_slice(&projection),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSet;
    use crate::nvim::UpdateBatch;
    use rmpv::Value;

    struct FixedAtlas;

    impl GlyphAtlas for FixedAtlas {
        fn uv(&self, glyph: char) -> Option<[f32; 4]> {
            (!glyph.is_whitespace()).then_some([0.0, 0.0, 0.5, 0.5])
        }
    }

    #[test]
    fn equal_counts_patch_differing_counts_reallocate() {
        assert_eq!(upload_kind(120, 120), UploadKind::Patch);
        assert_eq!(upload_kind(120, 124), UploadKind::Reallocate);
        assert_eq!(upload_kind(0, 4), UploadKind::Reallocate);
        // First-ever empty upload has nothing to change.
        assert_eq!(upload_kind(0, 0), UploadKind::Patch);
    }

    #[test]
    fn geometry_keeps_six_indices_per_four_vertices() {
        let mut grids = GridSet::new();
        grids.apply(&UpdateBatch(vec![Value::Array(vec![
            Value::from("grid_resize"),
            Value::Array(vec![Value::from(1u64), Value::from(4u64), Value::from(2u64)]),
        ])]));
        grids.apply(&UpdateBatch(vec![Value::Array(vec![
            Value::from("grid_line"),
            Value::Array(vec![
                Value::from(1u64),
                Value::from(0u64),
                Value::from(0u64),
                Value::Array(vec![Value::Array(vec![Value::from("x")])]),
            ]),
        ])]));

        let (vertices, indices) = build_geometry(&grids, &FixedAtlas, 8.0, 16.0, 1.0);
        assert!(!vertices.is_empty());
        assert_eq!(vertices.len() % 4, 0);
        assert_eq!(indices.len(), vertices.len() / 4 * 6);
        // 8 cells background + 1 glyph quad.
        assert_eq!(vertices.len(), (8 + 1) * 4);
    }

    #[test]
    fn glyph_quads_are_textured_background_quads_are_not() {
        let mut grids = GridSet::new();
        grids.apply(&UpdateBatch(vec![Value::Array(vec![
            Value::from("grid_resize"),
            Value::Array(vec![Value::from(1u64), Value::from(1u64), Value::from(1u64)]),
        ])]));
        grids.apply(&UpdateBatch(vec![Value::Array(vec![
            Value::from("grid_line"),
            Value::Array(vec![
                Value::from(1u64),
                Value::from(0u64),
                Value::from(0u64),
                Value::Array(vec![Value::Array(vec![Value::from("q")])]),
            ]),
        ])]));

        let (vertices, _) = build_geometry(&grids, &FixedAtlas, 8.0, 16.0, 1.0);
        assert_eq!(vertices.len(), 8);
        assert!(vertices[..4].iter().all(|v| v.textured == 0.0));
        assert!(vertices[4..].iter().all(|v| v.textured == 1.0));
    }

    #[test]
    fn projection_maps_corners_to_clip_space() {
        let m = ortho_projection(800.0, 600.0);
        // Top-left pixel to (-1, 1), bottom-right to (1, -1).
        let apply = |m: &[[f32; 4]; 4], x: f32, y: f32| {
            (
                m[0][0] * x + m[1][0] * y + m[3][0],
                m[0][1] * x + m[1][1] * y + m[3][1],
            )
        };
        assert_eq!(apply(&m, 0.0, 0.0), (-1.0, 1.0));
        assert_eq!(apply(&m, 800.0, 600.0), (1.0, -1.0));
    }
}
