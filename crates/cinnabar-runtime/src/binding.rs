//! Explicit I/O binding: the zero-copy execution path.
//!
//! Inputs and outputs are pre-attached to named slots before running the
//! graph. An output may be bound to a provided tensor (the engine writes
//! into the caller's buffer) or to a bare device location, meaning "the
//! engine allocates on this device and the caller retrieves the handle".

use crate::options::RunOptions;
use crate::session::Session;
use cinnabar_core::{Error, MemoryLocation, Result, Tensor};
use cinnabar_wgpu::GpuTensorBuffer;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a bound output's result should land.
enum BoundOutput {
    /// Caller-provided tensor; results are written into it.
    Provided(Arc<Tensor>),
    /// Engine allocates at this location and owns the result until the
    /// caller releases the retrieved handle.
    Device(MemoryLocation),
}

/// Pre-bound inputs and outputs for [`Session::run_with_binding`].
pub struct IoBinding {
    inputs: HashMap<String, Arc<Tensor>>,
    outputs: Vec<(String, BoundOutput)>,
    bound_values: Vec<Arc<Tensor>>,
}

impl IoBinding {
    pub fn new() -> Self {
        Self {
            inputs: HashMap::new(),
            outputs: Vec::new(),
            bound_values: Vec::new(),
        }
    }

    /// Attach an input tensor to a named slot.
    pub fn bind_input(&mut self, name: impl Into<String>, tensor: Arc<Tensor>) {
        self.inputs.insert(name.into(), tensor);
    }

    /// Attach a caller-provided output tensor to a named slot.
    pub fn bind_output(&mut self, name: impl Into<String>, tensor: Arc<Tensor>) {
        self.outputs.push((name.into(), BoundOutput::Provided(tensor)));
    }

    /// Bind an output slot to a device location with no tensor: the engine
    /// allocates there.
    pub fn bind_output_to_device(
        &mut self,
        name: impl Into<String>,
        location: MemoryLocation,
    ) -> Result<()> {
        self.outputs
            .push((name.into(), BoundOutput::Device(location)));
        Ok(())
    }

    /// Drop all bound outputs and retrieved values.
    pub fn clear_bound_outputs(&mut self) {
        self.outputs.clear();
        self.bound_values.clear();
    }

    /// Output values retrieved by the last `run_with_binding`, in binding
    /// order.
    pub fn bound_values(&self) -> &[Arc<Tensor>] {
        &self.bound_values
    }
}

impl Default for IoBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Execute the graph with pre-bound I/O.
    ///
    /// Pre-bound outputs are retrieved (stored on the binding), not
    /// recreated; run again with the same binding to refresh them.
    pub fn run_with_binding(
        &self,
        binding: &mut IoBinding,
        run_options: Option<&RunOptions>,
    ) -> Result<()> {
        let inputs: Vec<(&str, Arc<Tensor>)> = binding
            .inputs
            .iter()
            .map(|(name, tensor)| (name.as_str(), Arc::clone(tensor)))
            .collect();
        let output_names: Vec<&str> =
            binding.outputs.iter().map(|(name, _)| name.as_str()).collect();

        let results = self.run(&inputs, &output_names, run_options)?;

        let mut bound_values = Vec::with_capacity(results.len());
        for ((_, target), result) in binding.outputs.iter().zip(results) {
            bound_values.push(self.place_output(target, result)?);
        }
        binding.bound_values = bound_values;
        Ok(())
    }

    fn place_output(&self, target: &BoundOutput, result: Arc<Tensor>) -> Result<Arc<Tensor>> {
        match target {
            BoundOutput::Provided(tensor) => {
                if tensor.dtype() != result.dtype() || tensor.shape() != result.shape() {
                    return Err(Error::InvalidArgument(format!(
                        "bound output expects {:?} {:?}, produced {:?} {:?}",
                        tensor.dtype(),
                        tensor.shape(),
                        result.dtype(),
                        result.shape()
                    )));
                }
                if tensor.is_owned() {
                    // A provided engine-owned tensor only declares shape and
                    // type; the retrieved value replaces it.
                    Ok(result)
                } else {
                    tensor.write_external(result.as_bytes()?)?;
                    Ok(Arc::clone(tensor))
                }
            }
            BoundOutput::Device(location) => match location {
                MemoryLocation::None | MemoryLocation::Cpu | MemoryLocation::CpuPinned => {
                    Ok(result)
                }
                MemoryLocation::GpuBuffer => {
                    let gpu = self.gpu().ok_or_else(|| {
                        Error::InvalidArgument(
                            "output bound to the GPU, but the GPU provider is not enabled"
                                .to_string(),
                        )
                    })?;
                    let bytes = result.as_bytes()?;
                    let buffer = gpu.upload(bytes, "cinnabar_bound_output");
                    Ok(Arc::new(Tensor::from_device(
                        Arc::new(GpuTensorBuffer::new(
                            Arc::clone(gpu),
                            buffer,
                            bytes.len(),
                        )),
                        result.shape(),
                        result.dtype(),
                    )))
                }
                MemoryLocation::AcceleratorTensor => Err(Error::NotImplemented(
                    "accelerator tensor outputs are not available in this build".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_bound_outputs() {
        let mut binding = IoBinding::new();
        binding.bind_output("y", Arc::new(Tensor::from_vec(vec![0.0f32], &[1])));
        binding
            .bind_output_to_device("z", MemoryLocation::Cpu)
            .unwrap();
        assert_eq!(binding.outputs.len(), 2);
        binding.clear_bound_outputs();
        assert!(binding.outputs.is_empty());
        assert!(binding.bound_values().is_empty());
    }
}
