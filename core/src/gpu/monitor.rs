// core/src/gpu/monitor.rs
use anyhow::{Context, Result};
use nvml_wrapper::Nvml;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_total: u64, // bytes
}

/// Thin NVML handle used as the last-resort CUDA probe.
pub struct GpuMonitor {
    nvml: Nvml,
}

/// NVML encodes the driver's CUDA version as `major * 1000 + minor * 10`.
pub fn decode_cuda_driver_version(raw: i32) -> Option<(u32, u32)> {
    if raw <= 0 {
        return None;
    }
    let raw = raw as u32;
    Some((raw / 1000, (raw % 1000) / 10))
}

impl GpuMonitor {
    pub fn new() -> Result<Self> {
        let nvml = Nvml::init().context("NVML initialization failed")?;
        Ok(Self { nvml })
    }

    pub fn device_count(&self) -> Result<u32> {
        self.nvml.device_count().context("Failed to get device count")
    }

    /// Highest CUDA version the installed driver supports.
    pub fn driver_cuda_version(&self) -> Result<(u32, u32)> {
        let raw = self
            .nvml
            .sys_cuda_driver_version()
            .context("Failed to query CUDA driver version")?;
        decode_cuda_driver_version(raw).with_context(|| format!("Invalid CUDA driver version: {}", raw))
    }

    pub fn devices(&self) -> Result<Vec<GpuDevice>> {
        let count = self.device_count()?;
        let mut out = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .with_context(|| format!("Failed to access GPU device {}", index))?;
            out.push(GpuDevice {
                index,
                name: device.name().unwrap_or_else(|_| "unknown".to_string()),
                memory_total: device.memory_info().map(|m| m.total).unwrap_or(0),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_version_decoding() {
        assert_eq!(decode_cuda_driver_version(12040), Some((12, 4)));
        assert_eq!(decode_cuda_driver_version(11080), Some((11, 8)));
        assert_eq!(decode_cuda_driver_version(13000), Some((13, 0)));
        assert_eq!(decode_cuda_driver_version(0), None);
    }

    #[test]
    fn monitor_initialization_when_available() -> Result<()> {
        // Machines without an NVIDIA driver simply skip.
        let Ok(monitor) = GpuMonitor::new() else {
            return Ok(());
        };
        let devices = monitor.devices()?;
        assert_eq!(devices.len() as u32, monitor.device_count()?);
        Ok(())
    }
}
