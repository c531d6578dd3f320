//! バックエンド型の定義

use burn::backend::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

/// CPU (NdArray) 推論用バックエンド
pub type CpuBackend = NdArray<f32>;

/// CPU (NdArray) 学習用バックエンド
pub type CpuTrainBackend = Autodiff<CpuBackend>;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// WGPU (GPU) 推論用バックエンド
#[cfg(feature = "wgpu")]
pub type WgpuBackend = burn_wgpu::Wgpu;

/// WGPU (GPU) 学習用バックエンド
#[cfg(feature = "wgpu")]
pub type WgpuTrainBackend = Autodiff<WgpuBackend>;

#[cfg(feature = "wgpu")]
pub fn wgpu_device() -> burn_wgpu::WgpuDevice {
    burn_wgpu::WgpuDevice::default()
}
