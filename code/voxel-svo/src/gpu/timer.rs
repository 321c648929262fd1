//! GPU timestamps written between command-encoder commands.

use super::GpuContext;
use crate::error::Result;
use std::time::Duration;

const QUERY_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Features a device needs for [`GpuTimer`].
pub fn timer_features() -> wgpu::Features {
    wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS
}

/// A fixed number of timestamp slots resolved into one buffer.
pub struct GpuTimer {
    queries: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    count: u32,
}

impl GpuTimer {
    /// `None` when the device was created without [`timer_features`].
    pub fn new(ctx: &GpuContext, count: u32) -> Option<Self> {
        if !ctx.device.features().contains(timer_features()) || count == 0 {
            return None;
        }
        let queries = ctx.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("gpu_timer_queries"),
            ty: wgpu::QueryType::Timestamp,
            count,
        });
        let resolve = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu_timer_resolve"),
            size: count as u64 * QUERY_SIZE,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Some(Self { queries, resolve, count })
    }

    pub fn write(&self, encoder: &mut wgpu::CommandEncoder, slot: u32) {
        encoder.write_timestamp(&self.queries, slot);
    }

    /// Record the resolve. Call once after the last [`write`](Self::write).
    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.resolve_query_set(&self.queries, 0..self.count, &self.resolve, 0);
    }

    /// Raw ticks of every slot; the resolving submission must have completed.
    pub fn read_ticks(&self, ctx: &GpuContext) -> Result<Vec<u64>> {
        ctx.read_buffer::<u64>(&self.resolve, self.count as u64)
    }

    /// Elapsed time between two slots.
    pub fn span(ctx: &GpuContext, ticks: &[u64], from: usize, to: usize) -> Duration {
        let (Some(a), Some(b)) = (ticks.get(from), ticks.get(to)) else {
            return Duration::ZERO;
        };
        let nanos = b.saturating_sub(*a) as f64 * ctx.queue.get_timestamp_period() as f64;
        Duration::from_nanos(nanos as u64)
    }
}
