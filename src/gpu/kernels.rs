//! GPU compute kernel for the distance function (WGSL, f64)
//!
//! One invocation per row, 256 invocations per workgroup. Requires
//! `SHADER_F64`. Vulkan's GLSL.std.450 trigonometry is 32-bit only, so
//! `sin`, `cos` and `asin` are implemented in the shader:
//! - `sin`/`cos`: Cody-Waite reduction by pi/2, then Taylor polynomials on
//!   `[-pi/4, pi/4]`
//! - `asin`: power series for `|x| <= 0.5`, otherwise
//!   `pi/2 - 2 * asin(sqrt((1 - |x|) / 2))`
//!
//! Only `sqrt`, `floor`, `abs` and `clamp` come from the driver.

use crate::backend::ColumnBatch;
use crate::{Error, Result};
use wgpu::util::DeviceExt;

/// Workgroup size (256 threads = 8 warps on NVIDIA)
pub const WORKGROUP_SIZE: u32 = 256;

/// Rows per dispatch (4M rows = 32 MB per column buffer, 16384 workgroups)
pub const MAX_ROWS_PER_DISPATCH: usize = 4 * 1024 * 1024;

/// Shader entry point
pub const ENTRY_POINT: &str = "haversine";

/// WGSL source of the distance kernel
pub const HAVERSINE_SHADER: &str = r"
@group(0) @binding(0) var<storage, read> x0: array<f64>;
@group(0) @binding(1) var<storage, read> y0: array<f64>;
@group(0) @binding(2) var<storage, read> x1: array<f64>;
@group(0) @binding(3) var<storage, read> y1: array<f64>;
@group(0) @binding(4) var<storage, read_write> dist: array<f64>;

const EARTH_RADIUS_KM: f64 = 6372.8lf;
const DEG_TO_RAD: f64 = 0.017453292519943295lf;
const HALF_PI: f64 = 1.5707963267948966lf;
const TWO_OVER_PI: f64 = 0.6366197723675814lf;
// pi/2 = HALF_PI_HI + HALF_PI_LO, HALF_PI_HI has 33 significant bits
const HALF_PI_HI: f64 = 1.5707963267341256lf;
const HALF_PI_LO: f64 = 6.077100506506192e-11lf;

// sin(r) for |r| <= pi/4
fn sin_poly(r: f64) -> f64 {
    let r2 = r * r;
    var p = -7.647163731819816e-13lf;       // -1/15!
    p = p * r2 + 1.6059043836821613e-10lf;  //  1/13!
    p = p * r2 - 2.505210838544172e-8lf;    // -1/11!
    p = p * r2 + 2.7557319223985893e-6lf;   //  1/9!
    p = p * r2 - 1.984126984126984e-4lf;    // -1/7!
    p = p * r2 + 8.333333333333333e-3lf;    //  1/5!
    p = p * r2 - 1.6666666666666666e-1lf;   // -1/3!
    return r + r * r2 * p;
}

// cos(r) for |r| <= pi/4
fn cos_poly(r: f64) -> f64 {
    let r2 = r * r;
    var p = 4.779477332387385e-14lf;        //  1/16!
    p = p * r2 - 1.1470745597729725e-11lf;  // -1/14!
    p = p * r2 + 2.08767569878681e-9lf;     //  1/12!
    p = p * r2 - 2.755731922398589e-7lf;    // -1/10!
    p = p * r2 + 2.48015873015873e-5lf;     //  1/8!
    p = p * r2 - 1.3888888888888889e-3lf;   // -1/6!
    p = p * r2 + 4.1666666666666664e-2lf;   //  1/4!
    p = p * r2 - 0.5lf;                     // -1/2!
    return 1.0lf + r2 * p;
}

// sin(x + quarter * pi/2)
fn sin_shifted(x: f64, quarter: f64) -> f64 {
    let k = floor(x * TWO_OVER_PI + 0.5lf);
    let r = (x - k * HALF_PI_HI) - k * HALF_PI_LO;
    let q = k + quarter;
    let m = q - 4.0lf * floor(q * 0.25lf);
    if (m == 0.0lf) {
        return sin_poly(r);
    }
    if (m == 1.0lf) {
        return cos_poly(r);
    }
    if (m == 2.0lf) {
        return -sin_poly(r);
    }
    return -cos_poly(r);
}

fn sin64(x: f64) -> f64 {
    return sin_shifted(x, 0.0lf);
}

fn cos64(x: f64) -> f64 {
    return sin_shifted(x, 1.0lf);
}

// asin(x) for |x| <= 0.5
fn asin_series(x: f64) -> f64 {
    let x2 = x * x;
    var term = x;
    var sum = x;
    var n = 0.0lf;
    for (var i = 0; i < 40; i++) {
        let a = 2.0lf * n + 1.0lf;
        term = term * x2 * a * a / ((a + 1.0lf) * (a + 2.0lf));
        sum = sum + term;
        n = n + 1.0lf;
    }
    return sum;
}

fn asin64(x: f64) -> f64 {
    let ax = abs(x);
    if (ax <= 0.5lf) {
        return asin_series(x);
    }
    let folded = HALF_PI - 2.0lf * asin_series(sqrt((1.0lf - ax) * 0.5lf));
    if (x < 0.0lf) {
        return -folded;
    }
    return folded;
}

@compute @workgroup_size(256)
fn haversine(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= arrayLength(&dist)) {
        return;
    }

    let lat0 = y0[i] * DEG_TO_RAD;
    let lat1 = y1[i] * DEG_TO_RAD;
    let delta_lat = (y1[i] - y0[i]) * DEG_TO_RAD;
    let delta_lon = (x1[i] - x0[i]) * DEG_TO_RAD;

    let s_lat = sin64(delta_lat / 2.0lf);
    let s_lon = sin64(delta_lon / 2.0lf);
    let a = s_lat * s_lat + cos64(lat0) * cos64(lat1) * (s_lon * s_lon);
    let central_angle = 2.0lf * asin64(clamp(sqrt(a), -1.0lf, 1.0lf));

    dist[i] = EARTH_RADIUS_KM * central_angle;
}
";

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Compiled shader pipeline and its bind group layout
pub struct HaversinePipeline {
    /// Bindings 0..=3 read-only inputs, 4 read-write output
    pub layout: wgpu::BindGroupLayout,
    /// Compute pipeline for [`ENTRY_POINT`]
    pub pipeline: wgpu::ComputePipeline,
}

/// Compile the distance shader into a compute pipeline
///
/// # Errors
/// Returns `CompilationFailure` if the driver rejects the shader
pub async fn create_pipeline(device: &wgpu::Device) -> Result<HaversinePipeline> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("Haversine f64 Shader"),
        source: wgpu::ShaderSource::Wgsl(HAVERSINE_SHADER.into()),
    });

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Haversine Bind Group Layout"),
        entries: &[
            storage_entry(0, true),
            storage_entry(1, true),
            storage_entry(2, true),
            storage_entry(3, true),
            storage_entry(4, false),
        ],
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Haversine Pipeline Layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("Haversine Pipeline"),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: ENTRY_POINT,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    });

    if let Some(e) = device.pop_error_scope().await {
        return Err(Error::CompilationFailure {
            method: "gpu".to_string(),
            reason: e.to_string(),
        });
    }

    Ok(HaversinePipeline { layout, pipeline })
}

/// Compute distances for one batch on the device
///
/// Splits the batch into dispatches of at most [`MAX_ROWS_PER_DISPATCH`]
/// rows. Buffers are scoped to each dispatch and released on every path.
///
/// # Errors
/// Returns `DeviceError` on allocation, validation or readback failure
pub async fn haversine_f64(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pipeline: &HaversinePipeline,
    batch: &ColumnBatch<'_>,
    out: &mut [f64],
) -> Result<()> {
    batch.check_output(out)?;

    let mut start = 0;
    while start < batch.len() {
        let rows = (batch.len() - start).min(MAX_ROWS_PER_DISPATCH);
        dispatch_chunk(
            device,
            queue,
            pipeline,
            &batch.slice(start, rows),
            &mut out[start..start + rows],
        )
        .await?;
        start += rows;
    }

    // The device is not required to preserve NaN payloads or IEEE
    // behaviour for non-finite operands; match the CPU result exactly.
    for (i, slot) in out.iter_mut().enumerate() {
        if batch.row(i).iter().any(|v| !v.is_finite()) {
            *slot = f64::NAN;
        }
    }
    Ok(())
}

/// Outcome of the two error scopes around a dispatch, innermost first
///
/// Both scopes must already be popped so a failed call leaves the device's
/// scope stack as it found it.
fn scope_errors(out_of_memory: Option<wgpu::Error>, validation: Option<wgpu::Error>) -> Result<()> {
    if let Some(e) = out_of_memory {
        return Err(Error::DeviceError(format!("out of device memory: {e}")));
    }
    if let Some(e) = validation {
        return Err(Error::DeviceError(format!("dispatch rejected: {e}")));
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
async fn dispatch_chunk(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pipeline: &HaversinePipeline,
    chunk: &ColumnBatch<'_>,
    out: &mut [f64],
) -> Result<()> {
    let byte_len = std::mem::size_of_val(out) as u64;

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

    let input = |label: &str, column: &[f64]| {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(column),
            usage: wgpu::BufferUsages::STORAGE,
        })
    };
    let x0 = input("Haversine x0", chunk.x0());
    let y0 = input("Haversine y0", chunk.y0());
    let x1 = input("Haversine x1", chunk.x1());
    let y1 = input("Haversine y1", chunk.y1());

    let output = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Haversine Output"),
        size: byte_len,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Haversine Staging Buffer"),
        size: byte_len,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Haversine Bind Group"),
        layout: &pipeline.layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: x0.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: y0.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: x1.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: y1.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: output.as_entire_binding(),
            },
        ],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Haversine Encoder"),
    });
    {
        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Haversine Pass"),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(&pipeline.pipeline);
        compute_pass.set_bind_group(0, &bind_group, &[]);
        let workgroup_count = (out.len() as u32).div_ceil(WORKGROUP_SIZE);
        compute_pass.dispatch_workgroups(workgroup_count, 1, 1);
    }
    encoder.copy_buffer_to_buffer(&output, 0, &staging, 0, byte_len);
    queue.submit(Some(encoder.finish()));

    let out_of_memory = device.pop_error_scope().await;
    let validation = device.pop_error_scope().await;
    scope_errors(out_of_memory, validation)?;

    let buffer_slice = staging.slice(..);
    let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        tx.send(result).ok();
    });
    device.poll(wgpu::Maintain::Wait);

    rx.receive()
        .await
        .ok_or_else(|| Error::DeviceError("failed to receive buffer map result".to_string()))?
        .map_err(|e| Error::DeviceError(format!("buffer mapping failed: {e}")))?;

    {
        let view = buffer_slice.get_mapped_range();
        for (slot, bytes) in out.iter_mut().zip(view.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(bytes);
            *slot = f64::from_le_bytes(le);
        }
    }
    staging.unmap();

    Ok(())
}
