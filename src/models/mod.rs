pub mod m2m100;
pub mod tokenizer;

use crate::error::Result;
use candle::Device;

/// A loaded translation model shared read-only by every request.
pub trait TranslationModel: Send + Sync {
    fn name(&self) -> &str;

    /// Every language code the model knows.
    fn languages(&self) -> Vec<String>;

    /// Whether `code` maps to a usable generation target id.
    fn resolves(&self, code: &str) -> bool;

    /// Blocking; run it off the async workers.
    fn translate(&self, text: &str, source: &str, target: &str, max_length: usize) -> Result<String>;
}

/// CUDA, then Metal, then CPU.
pub fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    Ok(Device::Cpu)
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
