//! Unit tests for growable_buffer.rs

use std::sync::Arc;

use crate::device::Device;
use crate::driver::mock::mock_device;
use crate::error::Error;
use crate::growable_buffer::GrowableBuffer;
use crate::types::{BufferUsageFlags, MemoryLocation};

fn vector<T: bytemuck::Pod>(device: &Device) -> GrowableBuffer<T> {
    GrowableBuffer::new(device.context(), "instances", BufferUsageFlags::STORAGE_BUFFER, MemoryLocation::CpuToGpu)
        .unwrap()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Instance {
    offset: [f32; 3],
    material: u32,
}

unsafe impl bytemuck::Zeroable for Instance {}
unsafe impl bytemuck::Pod for Instance {}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_new_allocates_nothing() {
    let (device, driver) = mock_device();
    let v = vector::<u32>(&device);
    assert_eq!(v.len(), 0);
    assert_eq!(v.capacity(), 0);
    assert!(v.buffer().is_none());
    assert_eq!(driver.count("create_buffer"), 0);
}

#[test]
fn test_device_local_location_is_rejected() {
    let (device, _driver) = mock_device();
    let result = GrowableBuffer::<u32>::new(
        device.context(),
        "gpu_only",
        BufferUsageFlags::STORAGE_BUFFER,
        MemoryLocation::GpuOnly,
    );
    assert!(matches!(result, Err(Error::InvalidUsage(_))));
}

#[test]
fn test_zero_sized_elements_are_rejected() {
    let (device, _driver) = mock_device();
    let result =
        GrowableBuffer::<()>::new(device.context(), "unit", BufferUsageFlags::empty(), MemoryLocation::CpuToGpu);
    assert!(result.is_err());
}

// ============================================================================
// Growth
// ============================================================================

#[test]
fn test_push_five_u32() {
    let (device, _driver) = mock_device();
    let mut v = vector::<u32>(&device);

    for value in [10u32, 20, 30, 40, 50] {
        v.push(value).unwrap();
    }

    assert_eq!(v.len(), 5);
    assert!(v.capacity() >= 5);
    assert_eq!(v.as_slice(), &[10, 20, 30, 40, 50]);
    assert_eq!(*v.at(4).unwrap(), 50);
}

#[test]
fn test_growth_sequence_is_geometric() {
    let (device, _driver) = mock_device();
    let mut v = vector::<u32>(&device);

    let mut capacities = Vec::new();
    for i in 0..10u32 {
        v.push(i).unwrap();
        if capacities.last() != Some(&v.capacity()) {
            capacities.push(v.capacity());
        }
    }
    assert_eq!(capacities, vec![1, 2, 3, 4, 6, 9, 13]);
}

#[test]
fn test_reserve_is_monotonic_and_preserves_data() {
    let (device, driver) = mock_device();
    let mut v = vector::<u64>(&device);
    for i in 0..4u64 {
        v.push(i * 3).unwrap();
    }

    let mut previous = v.capacity();
    for request in [2u64, 16, 8, 17, 100, 0, 50] {
        v.reserve(request).unwrap();
        assert!(v.capacity() >= previous);
        assert!(v.capacity() >= request);
        assert_eq!(v.as_slice(), &[0, 3, 6, 9]);
        previous = v.capacity();
    }

    let buffers_created = driver.count("create_buffer");
    v.reserve(previous).unwrap();
    assert_eq!(driver.count("create_buffer"), buffers_created);
}

#[test]
fn test_old_buffer_survives_while_viewed() {
    let (device, driver) = mock_device();
    let mut v = vector::<u32>(&device);
    v.push(7).unwrap();

    let view = v.view().unwrap();
    v.reserve(64).unwrap();
    assert_eq!(driver.count("destroy_buffer"), 0);
    assert!(!Arc::ptr_eq(view.buffer(), v.buffer().unwrap()));
    assert_eq!(view.buffer().read_pod::<u32>(0, 1).unwrap(), vec![7]);

    drop(view);
    assert_eq!(driver.count("destroy_buffer"), 1);
}

#[test]
fn test_resize_grows_with_defaults_and_shrinks() {
    let (device, _driver) = mock_device();
    let mut v = vector::<u32>(&device);
    v.push(5).unwrap();

    v.resize(4).unwrap();
    assert_eq!(v.as_slice(), &[5, 0, 0, 0]);

    let capacity = v.capacity();
    v.resize(2).unwrap();
    assert_eq!(v.as_slice(), &[5, 0]);
    assert_eq!(v.capacity(), capacity);
}

// ============================================================================
// Removal
// ============================================================================

#[test]
fn test_erase_shifts_tail() {
    let (device, _driver) = mock_device();
    let mut v = vector::<u32>(&device);
    for value in 1..=5u32 {
        v.push(value).unwrap();
    }

    assert_eq!(v.erase(1).unwrap(), 2);
    assert_eq!(v.as_slice(), &[1, 3, 4, 5]);
    assert_eq!(v.erase(3).unwrap(), 5);
    assert_eq!(v.as_slice(), &[1, 3, 4]);
    assert!(matches!(v.erase(3), Err(Error::InvalidUsage(_))));
}

#[test]
fn test_pop_and_out_of_range_access() {
    let (device, _driver) = mock_device();
    let mut v = vector::<u32>(&device);
    assert_eq!(v.pop(), None);
    assert!(v.at(0).is_err());

    v.push(1).unwrap();
    v.push(2).unwrap();
    assert_eq!(v.pop(), Some(2));
    assert_eq!(v.len(), 1);
    assert!(v.at(1).is_err());
    assert_eq!(v.get(1), None);

    *v.get_mut(0).unwrap() = 9;
    assert_eq!(v.get(0), Some(&9));
}

#[test]
fn test_struct_elements_roundtrip_through_backing_buffer() {
    let (device, _driver) = mock_device();
    let mut v = vector::<Instance>(&device);
    for i in 0..5u32 {
        v.push(Instance { offset: [i as f32, 0.0, 1.0], material: i }).unwrap();
    }
    assert_eq!(v.erase(0).unwrap().material, 0);
    v.truncate(3);

    let raw = v.buffer().unwrap().read_pod::<Instance>(0, 3).unwrap();
    assert_eq!(raw, v.as_slice());
    assert_eq!(raw.iter().map(|i| i.material).collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn test_raw_writes_stay_valid_elements() {
    let (device, _driver) = mock_device();
    let mut v = vector::<Instance>(&device);
    v.push(Instance { offset: [1.0, 2.0, 3.0], material: 7 }).unwrap();

    v.buffer().unwrap().write(0, &[0u8; 16]).unwrap();
    assert_eq!(v[0], Instance::default());
}

// ============================================================================
// Views and copies
// ============================================================================

#[test]
fn test_view_requires_backing_buffer() {
    let (device, _driver) = mock_device();
    let mut v = vector::<u32>(&device);
    assert!(v.view().is_err());

    v.push(3).unwrap();
    v.push(4).unwrap();
    let view = v.view().unwrap();
    assert_eq!(view.len(), 2);
    assert_eq!(view.size_bytes(), 8);
}

#[test]
fn test_try_clone_is_independent() {
    let (device, _driver) = mock_device();
    let mut v = vector::<u32>(&device);
    for value in [1u32, 2, 3] {
        v.push(value).unwrap();
    }

    let mut copy = v.try_clone().unwrap();
    copy[0] = 99;
    assert_eq!(copy.capacity(), 3);
    assert_eq!(copy.as_slice(), &[99, 2, 3]);
    assert_eq!(v.as_slice(), &[1, 2, 3]);
}
