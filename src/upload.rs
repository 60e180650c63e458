use bytemuck::Pod;

use crate::{
    descriptor::DescriptorHeap,
    error::Result,
    hal::{
        self, align_to, Api, Buffer as _, BufferUses, Device as _, GpuAddress, MemoryLocation,
        ResourceState, CONSTANT_BUFFER_ALIGNMENT,
    },
};

/// CPU-writable upload-heap buffer, optionally visible through a CBV slot.
pub struct UploadBuffer<A: Api> {
    buffer: A::Buffer,
    cbv_index: Option<u32>,
}

impl<A: Api> UploadBuffer<A> {
    pub fn new(device: &A::Device, label: &str, size: u64) -> Result<Self> {
        let buffer = device.create_buffer(&hal::BufferDescriptor {
            label,
            size,
            location: MemoryLocation::CpuToGpu,
            usage: BufferUses::empty(),
            initial_state: ResourceState::GenericRead,
        })?;
        Ok(Self {
            buffer,
            cbv_index: None,
        })
    }

    pub fn with_data(device: &A::Device, label: &str, data: &[u8]) -> Result<Self> {
        let this = Self::new(device, label, data.len() as u64)?;
        device.write_buffer(&this.buffer, 0, data)?;
        Ok(this)
    }

    /// Constant buffer holding `value`, with a CBV in the next free heap slot.
    pub fn with_constant_buffer_view<T: Pod>(
        device: &A::Device,
        heap: &mut DescriptorHeap<A>,
        label: &str,
        value: &T,
    ) -> Result<Self> {
        let size = constant_buffer_size(std::mem::size_of::<T>() as u64);
        let mut this = Self::new(device, label, size)?;
        device.write_buffer(&this.buffer, 0, bytemuck::bytes_of(value))?;

        let index = heap.next_available_index()?;
        device.create_constant_buffer_view(&this.buffer, size, heap.cpu_handle_at(index));
        this.cbv_index = Some(index);
        Ok(this)
    }

    pub fn update(&self, device: &A::Device, data: &[u8]) -> Result<()> {
        device.write_buffer(&self.buffer, 0, data)
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.buffer.gpu_address()
    }

    pub fn cbv_index(&self) -> Option<u32> {
        self.cbv_index
    }

    pub fn raw(&self) -> &A::Buffer {
        &self.buffer
    }
}

/// Constant buffer views must cover a multiple of 256 bytes.
pub fn constant_buffer_size(size: u64) -> u64 {
    align_to(size.max(1), CONSTANT_BUFFER_ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{self, DescriptorView};
    use crate::hal::DescriptorHeapKind;

    #[test]
    fn constant_buffers_round_to_256() {
        assert_eq!(constant_buffer_size(16), 256);
        assert_eq!(constant_buffer_size(256), 256);
        assert_eq!(constant_buffer_size(257), 512);
    }

    #[test]
    fn cbv_lands_in_the_next_slot() {
        let device = headless::Device::new();
        let mut heap =
            DescriptorHeap::<headless::Api>::new(&device, "test", DescriptorHeapKind::CbvSrvUav, 4)
                .unwrap();
        heap.next_available_index().unwrap();

        let value = [1.0f32, 2.0, 3.0, 4.0];
        let buffer = UploadBuffer::with_constant_buffer_view(&device, &mut heap, "cb", &value).unwrap();
        assert_eq!(buffer.cbv_index(), Some(1));
        assert_eq!(
            heap.raw().view_at(1),
            Some(DescriptorView::ConstantBuffer {
                address: buffer.gpu_address(),
                size: 256
            })
        );
        assert_eq!(&buffer.raw().contents()[..16], bytemuck::bytes_of(&value));
    }
}
