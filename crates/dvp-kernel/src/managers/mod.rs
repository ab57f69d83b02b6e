//! Built-in graph managers.
//!
//! - **[`cpu`]** -- runs kernels on the host's blocking thread pool.
//! - **[`dsp`]** -- runs the same kernels on a remote core over RPC.

pub mod cpu;
pub mod dsp;

pub use cpu::CpuManager;
pub use dsp::{DSP_REMOTE_CORE, DspManager};
