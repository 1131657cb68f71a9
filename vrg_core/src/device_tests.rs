//! Unit tests for device.rs

use std::sync::Arc;
use std::thread;

use crate::buffer::{Buffer, BufferDesc};
use crate::command_buffer::CommandBufferState;
use crate::device::*;
use crate::driver::mock::{mock_device, MockDriver};
use crate::driver::{QueueFamilyProperties, SwapchainHandle};
use crate::error::Error;
use crate::resource::DeviceResource;
use crate::sync::Semaphore;
use crate::types::*;

fn primary(device: &Device, name: &str) -> crate::command_buffer::CommandBuffer {
    device.get_command_buffer(name, QueueFlags::GRAPHICS, CommandBufferLevel::Primary).unwrap()
}

// ============================================================================
// Creation
// ============================================================================

#[test]
fn test_device_without_queue_family_fails() {
    let result = Device::new(Arc::new(MockDriver::with_families(Vec::new())), DeviceConfig::default());
    assert!(matches!(result, Err(Error::CreationFailure(_))));
}

#[test]
fn test_device_creates_shared_descriptor_pool() {
    let (device, driver) = mock_device();
    assert_eq!(driver.count("create_descriptor_pool(8192)"), 1);
    assert_eq!(device.queue_families().len(), 2);
    assert_eq!(device.config(), &DeviceConfig::default());

    drop(device);
    assert_eq!(driver.count("destroy_descriptor_pool"), 1);
}

#[test]
fn test_family_selection_uses_first_match() {
    let (device, _driver) = mock_device();

    let transfer = device.get_command_buffer("copy", QueueFlags::TRANSFER, CommandBufferLevel::Primary).unwrap();
    assert_eq!(transfer.family_index(), 0);
    assert_eq!(transfer.queue(), device.queue_families()[0].queue());

    let sparse = device.get_command_buffer("sparse", QueueFlags::SPARSE_BINDING, CommandBufferLevel::Primary);
    assert!(matches!(sparse, Err(Error::InvalidUsage(_))));
}

#[test]
fn test_family_selection_skips_families_missing_flags() {
    let driver = Arc::new(MockDriver::with_families(vec![
        QueueFamilyProperties { index: 0, flags: QueueFlags::TRANSFER, queue_count: 1 },
        QueueFamilyProperties { index: 1, flags: QueueFlags::GRAPHICS | QueueFlags::TRANSFER, queue_count: 2 },
    ]));
    let device = Device::new(driver.clone(), DeviceConfig::default()).unwrap();

    assert_eq!(primary(&device, "draw").family_index(), 1);
    assert_eq!(driver.count("create_command_pool(1)"), 1);
}

// ============================================================================
// Pooling
// ============================================================================

#[test]
fn test_pool_is_created_once_per_thread() {
    let (device, driver) = mock_device();
    let a = primary(&device, "a");
    let b = primary(&device, "b");

    assert_eq!(driver.count("create_command_pool"), 1);
    assert_eq!(driver.count("allocate_command_buffer(Primary)"), 2);
    drop((a, b));
}

#[test]
fn test_unsignaled_buffer_is_never_recycled() {
    let (device, driver) = mock_device();
    drop(device.execute(primary(&device, "frame0")).unwrap());

    let next = primary(&device, "frame1");
    assert_eq!(next.name(), "frame1");
    assert_eq!(driver.count("allocate_command_buffer"), 2);
    assert_eq!(driver.count("reset_command_buffer"), 0);
    assert_eq!(device.queue_families()[0].pending_buffers(), 1);
}

#[test]
fn test_completed_buffer_is_recycled_under_new_name() {
    let (device, driver) = mock_device();
    let submitted = device.execute(primary(&device, "frame0")).unwrap();
    let handle = submitted.handle();
    driver.signal_all_fences();
    drop(submitted);

    let recycled = primary(&device, "frame1");
    assert_eq!(recycled.handle(), handle);
    assert_eq!(recycled.name(), "frame1");
    assert_eq!(recycled.state(), CommandBufferState::Recording);
    assert!(!recycled.completion_fence().status().unwrap());
    assert_eq!(driver.count("allocate_command_buffer"), 1);
    assert_eq!(driver.count("reset_command_buffer"), 1);
    assert_eq!(device.queue_families()[0].pending_buffers(), 0);
}

#[test]
fn test_externally_held_buffer_is_not_recycled() {
    let (device, driver) = mock_device();
    let submitted = device.execute(primary(&device, "frame0")).unwrap();
    driver.signal_all_fences();

    let next = primary(&device, "frame1");
    assert_ne!(next.handle(), submitted.handle());
    assert_eq!(submitted.state(), CommandBufferState::Done);
    assert_eq!(device.queue_families()[0].pending_buffers(), 1);
    assert_eq!(driver.count("reset_command_buffer"), 0);
}

#[test]
fn test_extra_completed_buffers_are_pruned() {
    let (device, driver) = mock_device();
    for name in ["a", "b", "c"] {
        drop(device.execute(primary(&device, name)).unwrap());
    }
    driver.signal_all_fences();

    let _recycled = primary(&device, "d");
    assert_eq!(driver.count("free_command_buffer"), 2);
    assert_eq!(driver.count("reset_command_buffer"), 1);
    assert_eq!(device.queue_families()[0].pending_buffers(), 0);
}

#[test]
fn test_secondary_buffers_are_not_executed_or_recycled() {
    let (device, driver) = mock_device();
    drop(device.execute(primary(&device, "frame0")).unwrap());
    driver.signal_all_fences();

    let secondary = device.get_command_buffer("bundle", QueueFlags::GRAPHICS, CommandBufferLevel::Secondary).unwrap();
    assert_eq!(secondary.level(), CommandBufferLevel::Secondary);
    assert_eq!(driver.count("allocate_command_buffer(Secondary)"), 1);
    assert_eq!(driver.count("reset_command_buffer"), 0);

    assert!(matches!(device.execute(secondary), Err(Error::InvalidUsage(_))));
    assert_eq!(driver.count("queue_submit"), 1);
}

#[test]
fn test_each_thread_gets_its_own_pool() {
    let (device, driver) = mock_device();
    drop(device.execute(primary(&device, "main")).unwrap());

    thread::scope(|scope| {
        scope.spawn(|| {
            drop(device.execute(primary(&device, "worker")).unwrap());
        });
    });

    assert_eq!(driver.count("create_command_pool"), 2);
    assert_eq!(device.queue_families()[0].pending_buffers(), 2);
}

#[test]
fn test_buffer_returns_to_allocating_thread() {
    let (device, driver) = mock_device();
    let cmd = primary(&device, "recorded_here");
    let handle = cmd.handle();

    thread::scope(|scope| {
        scope.spawn(|| {
            drop(device.execute(cmd).unwrap());
        });
    });
    assert_eq!(driver.count("create_command_pool"), 1);

    driver.signal_all_fences();
    assert_eq!(primary(&device, "again").handle(), handle);
}

// ============================================================================
// Flush and present
// ============================================================================

#[test]
fn test_flush_releases_held_resources() {
    let (device, driver) = mock_device();
    let mut cmd = primary(&device, "upload");
    let staging = Buffer::new(
        device.context(),
        "staging",
        &BufferDesc {
            size: 128,
            usage: BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            ..Default::default()
        },
    )
    .unwrap();
    cmd.hold_resource(&staging);
    drop(staging);

    let cmd = device.execute(cmd).unwrap();
    assert_eq!(driver.count("destroy_buffer"), 0);

    device.flush().unwrap();
    assert_eq!(driver.count("device_wait_idle"), 1);
    assert_eq!(cmd.state(), CommandBufferState::Done);
    assert_eq!(driver.count("destroy_buffer"), 1);
}

#[test]
fn test_flush_keeps_fences_signaled_until_recycle() {
    let (device, driver) = mock_device();
    let cmd = device.execute(primary(&device, "frame0")).unwrap();

    device.flush().unwrap();
    assert!(cmd.completion_fence().status().unwrap());
    assert!(cmd.completion_fence().wait(0).unwrap());
    assert_eq!(driver.count("reset_fence"), 0);

    let handle = cmd.handle();
    drop(cmd);
    driver.clear_commands();

    let recycled = primary(&device, "frame1");
    assert_eq!(recycled.handle(), handle);
    assert_eq!(driver.count("reset_fence"), 1);
    assert_eq!(driver.count("reset_command_buffer"), 1);
    assert!(!recycled.completion_fence().status().unwrap());
}

#[test]
fn test_present_uses_matching_queue() {
    let (device, driver) = mock_device();
    let rendered = Semaphore::new(device.context(), "rendered").unwrap();

    let suboptimal = device.present(QueueFlags::GRAPHICS, SwapchainHandle(9), 2, &[rendered]).unwrap();
    assert!(!suboptimal);
    assert_eq!(driver.count("queue_present(2)"), 1);

    assert!(device.present(QueueFlags::SPARSE_BINDING, SwapchainHandle(9), 0, &[]).is_err());
}

#[test]
fn test_drop_waits_and_releases_pools() {
    let (device, driver) = mock_device();
    drop(device.execute(primary(&device, "last")).unwrap());

    drop(device);
    assert_eq!(driver.count("device_wait_idle"), 1);
    assert_eq!(driver.count("free_command_buffer"), 1);
    assert_eq!(driver.count("destroy_command_pool"), 1);
    assert_eq!(driver.count("destroy_descriptor_pool"), 1);
}
