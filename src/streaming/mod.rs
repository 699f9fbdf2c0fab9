//! Chunk generation pipeline: LOD policy, budgets, task and compute dispatch

pub mod lod;
pub mod budget;
pub mod tasks;
pub mod buffers;
pub mod compute;
pub mod scheduler;

pub use lod::{LodPolicy, TransitionChange};
pub use budget::AdaptiveBudget;
pub use tasks::{InlineScheduler, TaskHandle, TaskScheduler, TaskState, WorkerPool};
pub use buffers::{BufferDesc, BufferHandle, BufferPool, BufferStats, BufferUsage, RecyclingBufferPool};
pub use compute::{
    ComputeBackend, ComputeBuffers, ComputeError, ComputeResources, DispatchId, HostComputeBackend, KernelJob,
    KernelOutput, Readback, WorkKind,
};
pub use scheduler::{ChunkPhase, GenerationScheduler, MeshingSettings, SchedulerEvent};
