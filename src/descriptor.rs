use crate::{
    error::{Error, Result},
    hal::{self, Api, CpuDescriptorHandle, DescriptorHeap as _, DescriptorHeapKind, GpuDescriptorHandle},
};

/// Fixed-capacity, shader-visible descriptor heap with a bump allocator.
///
/// Slots are handed out in order and never returned, matching resources that
/// live as long as the renderer. Running out of slots is an error, never a
/// wrap-around.
pub struct DescriptorHeap<A: Api> {
    raw: A::DescriptorHeap,
    kind: DescriptorHeapKind,
    capacity: u32,
    increment: u32,
    next: u32,
}

impl<A: Api> DescriptorHeap<A> {
    pub fn new(device: &A::Device, label: &str, kind: DescriptorHeapKind, capacity: u32) -> Result<Self> {
        use hal::Device as _;

        let raw = device.create_descriptor_heap(&hal::DescriptorHeapDescriptor {
            label,
            kind,
            capacity,
            shader_visible: kind == DescriptorHeapKind::CbvSrvUav,
        })?;
        log::info!("Created descriptor heap `{}` with {} slots", label, capacity);
        Ok(Self {
            raw,
            kind,
            capacity,
            increment: device.descriptor_increment(kind),
            next: 0,
        })
    }

    /// Reserve one slot.
    pub fn next_available_index(&mut self) -> Result<u32> {
        self.allocate_range(1)
    }

    /// Reserve `count` contiguous slots and return the first index.
    pub fn allocate_range(&mut self, count: u32) -> Result<u32> {
        let end = self
            .next
            .checked_add(count)
            .filter(|&end| end <= self.capacity)
            .ok_or(Error::DescriptorHeapExhausted {
                capacity: self.capacity,
            })?;
        let first = self.next;
        self.next = end;
        Ok(first)
    }

    pub fn cpu_handle_at(&self, index: u32) -> CpuDescriptorHandle {
        assert!(index < self.capacity, "descriptor index {} out of bounds", index);
        CpuDescriptorHandle(self.raw.cpu_start().0 + (index * self.increment) as usize)
    }

    pub fn gpu_handle_at(&self, index: u32) -> GpuDescriptorHandle {
        assert!(index < self.capacity, "descriptor index {} out of bounds", index);
        GpuDescriptorHandle(self.raw.gpu_start().0 + u64::from(index * self.increment))
    }

    pub fn raw(&self) -> &A::DescriptorHeap {
        &self.raw
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless;

    fn heap(capacity: u32) -> DescriptorHeap<headless::Api> {
        let device = headless::Device::new();
        DescriptorHeap::new(&device, "test", DescriptorHeapKind::CbvSrvUav, capacity).unwrap()
    }

    #[test]
    fn indices_grow_monotonically() {
        let mut heap = heap(8);
        assert_eq!(heap.next_available_index().unwrap(), 0);
        assert_eq!(heap.allocate_range(4).unwrap(), 1);
        assert_eq!(heap.next_available_index().unwrap(), 5);
        assert_eq!(heap.allocated(), 6);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut heap = heap(2);
        heap.allocate_range(2).unwrap();
        let err = heap.next_available_index().unwrap_err();
        assert!(matches!(err, Error::DescriptorHeapExhausted { capacity: 2 }));
        // a failed allocation does not consume anything
        assert_eq!(heap.allocated(), 2);
    }

    #[test]
    fn handles_step_by_increment() {
        let heap = heap(4);
        let first = heap.gpu_handle_at(0);
        let third = heap.gpu_handle_at(2);
        assert_eq!(third.0 - first.0, 64);
        assert_eq!(heap.cpu_handle_at(1).0 - heap.cpu_handle_at(0).0, 32);
    }

    #[test]
    #[should_panic]
    fn handles_are_bounds_checked() {
        heap(4).cpu_handle_at(4);
    }
}
