//! wgpu implementation of the reduction runtime.
//!
//! One submission reduces one tile: a seed pass copies the tile's texel
//! rect out of the R32Float source heightfield into mip 0 of an RG32Float
//! scratch texture as (min, max) pairs, then one compute pass per mip
//! transition folds 2x2 blocks until the last mip holds a single texel.
//! That texel is copied into an 8-byte readback buffer whose `map_async`
//! callback signals the slot through a channel. Completion is observed by
//! draining the channel after a non-blocking device poll, never by
//! waiting on the queue.

use std::sync::mpsc;

use height_protocol::{HeightRange, TexelRect};

use crate::runtime::{
    ReduceReadbackError, ReduceRuntime, ReduceSubmitError, ScratchCreateError, ScratchExtent,
    ScratchRequest, SlotStatus,
};

const WORKGROUP_EDGE: u32 = 8;
const READBACK_BYTES: u64 = 8;

/// Pooled reduction target. All descriptors are written once, at
/// creation: one storage view per mip, the seed bind group (source plus
/// mip 0 plus the per-scratch params uniform) and one step bind group per
/// mip transition. Submissions only update the params buffer contents.
pub struct ScratchImage {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
    mip_level_count: u32,
    params: wgpu::Buffer,
    seed_bind_group: wgpu::BindGroup,
    step_bind_groups: Vec<wgpu::BindGroup>,
}

impl ScratchExtent for ScratchImage {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }
}

/// Reusable completion slot: an 8-byte mappable buffer plus the channel
/// its `map_async` callback reports through. `signaled` is sticky until
/// the slot is reset, so repeated polls after completion stay cheap.
pub struct ReadbackSlot {
    buffer: wgpu::Buffer,
    done_receiver: Option<mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>>,
    signaled: bool,
    lost: Option<String>,
}

pub struct WgpuReduceRuntime {
    device: wgpu::Device,
    queue: wgpu::Queue,
    source_view: wgpu::TextureView,
    loaded_views: Vec<wgpu::TextureView>,
    seed_bind_group_layout: wgpu::BindGroupLayout,
    step_bind_group_layout: wgpu::BindGroupLayout,
    seed_pipeline: wgpu::ComputePipeline,
    step_pipeline: wgpu::ComputePipeline,
}

impl WgpuReduceRuntime {
    /// `source` is the full R32Float heightfield; it must carry
    /// `TEXTURE_BINDING` usage so the seed pass can sample it.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, source: &wgpu::Texture) -> Self {
        assert_eq!(
            source.format(),
            wgpu::TextureFormat::R32Float,
            "source heightfield must be R32Float"
        );
        assert!(
            source.usage().contains(wgpu::TextureUsages::TEXTURE_BINDING),
            "source heightfield must allow texture binding"
        );

        let source_view = source.create_view(&wgpu::TextureViewDescriptor {
            label: Some("height_tiles.source.view"),
            format: Some(wgpu::TextureFormat::R32Float),
            dimension: Some(wgpu::TextureViewDimension::D2),
            usage: None,
            aspect: wgpu::TextureAspect::All,
            base_mip_level: 0,
            mip_level_count: Some(1),
            base_array_layer: 0,
            array_layer_count: None,
        });

        let seed_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("height_tiles.reduce_seed.layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::Rg32Float,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

        let step_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("height_tiles.reduce_step.layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::Rg32Float,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                ],
            });

        let seed_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("height_tiles.reduce_seed"),
            source: wgpu::ShaderSource::Wgsl(include_str!("reduce_seed.wgsl").into()),
        });
        let step_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("height_tiles.reduce_step"),
            source: wgpu::ShaderSource::Wgsl(include_str!("reduce_step.wgsl").into()),
        });

        let seed_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("height_tiles.reduce_seed.pipeline_layout"),
                bind_group_layouts: &[&seed_bind_group_layout],
                immediate_size: 0,
            });
        let step_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("height_tiles.reduce_step.pipeline_layout"),
                bind_group_layouts: &[&step_bind_group_layout],
                immediate_size: 0,
            });

        let seed_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("height_tiles.reduce_seed.pipeline"),
            layout: Some(&seed_pipeline_layout),
            module: &seed_shader,
            entry_point: Some("seed_range"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        let step_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("height_tiles.reduce_step.pipeline"),
            layout: Some(&step_pipeline_layout),
            module: &step_shader,
            entry_point: Some("reduce_step"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let loaded_views = vec![source_view.clone()];
        Self {
            device,
            queue,
            source_view,
            loaded_views,
            seed_bind_group_layout,
            step_bind_group_layout,
            seed_pipeline,
            step_pipeline,
        }
    }

    /// View of the source heightfield, for callers that bind it elsewhere.
    pub fn source_view(&self) -> &wgpu::TextureView {
        &self.source_view
    }

    /// Every view a renderer may sample: the source heightfield first,
    /// then any registered auxiliary views.
    pub fn loaded_image_views(&self) -> &[wgpu::TextureView] {
        &self.loaded_views
    }

    pub fn register_auxiliary_view(&mut self, view: wgpu::TextureView) {
        self.loaded_views.push(view);
    }
}

impl crate::HeightTileCache<WgpuReduceRuntime> {
    pub fn loaded_tile_image_views(&self) -> &[wgpu::TextureView] {
        self.runtime().loaded_image_views()
    }
}

fn mip_extent(edge: u32, level: u32) -> u32 {
    (edge >> level).max(1)
}

fn dispatch_groups(texels: u32) -> u32 {
    texels.div_ceil(WORKGROUP_EDGE)
}

impl ReduceRuntime for WgpuReduceRuntime {
    type Scratch = ScratchImage;
    type Slot = ReadbackSlot;

    fn create_scratch(
        &mut self,
        request: ScratchRequest,
    ) -> Result<Self::Scratch, ScratchCreateError> {
        let oom_scope = self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let validation_scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("height_tiles.scratch"),
            size: wgpu::Extent3d {
                width: request.width,
                height: request.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: request.mip_level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rg32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let mip_views: Vec<wgpu::TextureView> = (0..request.mip_level_count)
            .map(|level| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("height_tiles.scratch.mip_view"),
                    format: Some(wgpu::TextureFormat::Rg32Float),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    usage: None,
                    aspect: wgpu::TextureAspect::All,
                    base_mip_level: level,
                    mip_level_count: Some(1),
                    base_array_layer: 0,
                    array_layer_count: None,
                })
            })
            .collect();

        let params = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("height_tiles.scratch.params"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let seed_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("height_tiles.scratch.seed_bind_group"),
            layout: &self.seed_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&self.source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&mip_views[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        });

        let step_bind_groups: Vec<wgpu::BindGroup> = (1..request.mip_level_count as usize)
            .map(|level| {
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("height_tiles.scratch.step_bind_group"),
                    layout: &self.step_bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&mip_views[level - 1]),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&mip_views[level]),
                        },
                    ],
                })
            })
            .collect();

        let validation_error = pollster::block_on(validation_scope.pop());
        let oom_error = pollster::block_on(oom_scope.pop());
        if let Some(error) = oom_error {
            return Err(ScratchCreateError::OutOfMemory {
                message: error.to_string(),
            });
        }
        if let Some(error) = validation_error {
            return Err(ScratchCreateError::Validation {
                message: error.to_string(),
            });
        }

        Ok(ScratchImage {
            texture,
            width: request.width,
            height: request.height,
            mip_level_count: request.mip_level_count,
            params,
            seed_bind_group,
            step_bind_groups,
        })
    }

    fn create_slot(&mut self) -> Self::Slot {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("height_tiles.readback"),
            size: READBACK_BYTES,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        ReadbackSlot {
            buffer,
            done_receiver: None,
            signaled: false,
            lost: None,
        }
    }

    fn submit(
        &mut self,
        scratch: &Self::Scratch,
        slot: &mut Self::Slot,
        source_rect: TexelRect,
    ) -> Result<(), ReduceSubmitError> {
        if slot.done_receiver.is_some() || slot.signaled {
            return Err(ReduceSubmitError::Rejected {
                reason: "readback slot already in flight",
            });
        }
        if source_rect.width > scratch.width || source_rect.height > scratch.height {
            return Err(ReduceSubmitError::Rejected {
                reason: "tile rect exceeds scratch extent",
            });
        }

        let words = [
            source_rect.x,
            source_rect.y,
            source_rect.width,
            source_rect.height,
        ];
        let mut params_bytes = [0u8; 16];
        for (chunk, word) in params_bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.queue.write_buffer(&scratch.params, 0, &params_bytes);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("height_tiles.reduce"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("height_tiles.reduce.seed"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.seed_pipeline);
            pass.set_bind_group(0, &scratch.seed_bind_group, &[]);
            pass.dispatch_workgroups(
                dispatch_groups(scratch.width),
                dispatch_groups(scratch.height),
                1,
            );
        }

        // One pass per mip transition; the pass boundary is the barrier
        // between reading mip N and writing mip N+1.
        for level in 1..scratch.mip_level_count {
            let out_width = mip_extent(scratch.width, level);
            let out_height = mip_extent(scratch.height, level);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("height_tiles.reduce.step"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.step_pipeline);
            pass.set_bind_group(0, &scratch.step_bind_groups[level as usize - 1], &[]);
            pass.dispatch_workgroups(dispatch_groups(out_width), dispatch_groups(out_height), 1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &scratch.texture,
                mip_level: scratch.mip_level_count - 1,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &slot.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: None,
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );

        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        slot.buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        slot.done_receiver = Some(receiver);
        Ok(())
    }

    fn poll_device(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }

    fn poll_slot(&mut self, slot: &mut Self::Slot) -> SlotStatus {
        if slot.signaled {
            return SlotStatus::Signaled;
        }
        if slot.lost.is_some() {
            return SlotStatus::Lost;
        }
        let Some(receiver) = slot.done_receiver.as_ref() else {
            return SlotStatus::NotSignaled;
        };
        match receiver.try_recv() {
            Ok(Ok(())) => {
                slot.signaled = true;
                SlotStatus::Signaled
            }
            Ok(Err(error)) => {
                slot.lost = Some(error.to_string());
                SlotStatus::Lost
            }
            Err(mpsc::TryRecvError::Empty) => SlotStatus::NotSignaled,
            Err(mpsc::TryRecvError::Disconnected) => {
                slot.lost = Some("map callback dropped without reporting".to_string());
                SlotStatus::Lost
            }
        }
    }

    fn take_result(&mut self, slot: &mut Self::Slot) -> Result<HeightRange, ReduceReadbackError> {
        if !slot.signaled {
            return Err(ReduceReadbackError::SlotNotSignaled);
        }
        let range = {
            let mapped = slot.buffer.slice(..).get_mapped_range();
            let min = f32::from_le_bytes(
                mapped[0..4]
                    .try_into()
                    .expect("readback buffer shorter than one texel"),
            );
            let max = f32::from_le_bytes(
                mapped[4..8]
                    .try_into()
                    .expect("readback buffer shorter than one texel"),
            );
            HeightRange { min, max }
        };
        slot.buffer.unmap();
        Ok(range)
    }

    fn reset_slot(&mut self, slot: &mut Self::Slot) {
        slot.done_receiver = None;
        slot.signaled = false;
        slot.lost = None;
    }
}
