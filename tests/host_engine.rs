//! Engine behavior through the public API only

mod common;

use common::MockController;
use imxrt_ehci_host::ehci::UsbSts;
use imxrt_ehci_host::{Direction, HostOps, PipeKind, Speed, UsbHost};

type TestHost = UsbHost<MockController>;

fn started_host() -> TestHost {
    let mut host = TestHost::new(MockController::new());
    host.start();
    host
}

#[test]
fn attach_is_mutually_exclusive_while_enumerating() {
    let mut host = started_host();

    let first = host.attach_device(Speed::High, 0, 0);
    assert!(first.is_some());
    // Address 0 is occupied until the first device finishes enumerating
    assert!(host.attach_device(Speed::Full, 1, 2).is_none());
    assert_eq!(host.pool_stats().devices.in_use, 1);
}

#[test]
fn attach_starts_enumeration_immediately() {
    let mut host = started_host();
    let device = host.attach_device(Speed::High, 0, 0).unwrap();

    let stats = host.pool_stats();
    // Control pipe plus its in-flight first request (SETUP, data, STATUS
    // stages and the reserved halt marker)
    assert_eq!(stats.pipes.in_use, 1);
    assert_eq!(stats.transfers.in_use, 4);
    assert!(host.controller_mut().async_enabled);
    assert_ne!(host.controller_mut().async_list, 0);

    let info = host.device_info(device).unwrap();
    assert_eq!(info.speed, Speed::High);
    assert_eq!(info.address, 0); // not yet assigned
}

#[test]
fn periodic_admission_rejects_without_leaking() {
    let mut host = started_host();
    let device = host.attach_device(Speed::High, 0, 0).unwrap();

    let mut granted = 0;
    loop {
        let pipe = host.create_pipe(device, PipeKind::Interrupt, 1, Direction::In, 1024, 1);
        match pipe {
            Some(_) => granted += 1,
            None => break,
        }
        assert!(granted < 16, "admission never rejected");
    }
    assert!(granted >= 1);
    assert!(host.controller_mut().periodic_enabled);
    assert_ne!(host.controller_mut().periodic_base, 0);

    // The rejected request left no records behind
    let stats = host.pool_stats();
    assert_eq!(stats.pipes.in_use, 1 + granted);
    assert_eq!(stats.transfers.in_use, 4 + granted);
}

#[test]
fn isochronous_pipes_are_not_supported() {
    let mut host = started_host();
    let device = host.attach_device(Speed::High, 0, 0).unwrap();
    assert!(host
        .create_pipe(device, PipeKind::Isochronous, 1, Direction::In, 1024, 1)
        .is_none());
}

#[test]
fn async_pipe_release_waits_for_doorbell() {
    let mut host = started_host();
    let device = host.attach_device(Speed::High, 0, 0).unwrap();
    let bulk = host
        .create_pipe(device, PipeKind::Bulk, 2, Direction::Out, 512, 0)
        .unwrap();
    let before = host.pool_stats();

    host.delete_pipe(bulk);
    assert_eq!(host.controller_mut().doorbell_rings, 1);
    // Still parked: the controller has not confirmed it moved past the QH
    assert_eq!(host.pool_stats().pipes.in_use, before.pipes.in_use);

    host.controller_mut().raise(UsbSts::ASYNC_ADVANCE);
    host.on_interrupt();
    assert_eq!(host.pool_stats().pipes.in_use, before.pipes.in_use - 1);
    assert_eq!(host.pool_stats().transfers.in_use, before.transfers.in_use - 1);
}

#[test]
fn detach_reclaims_every_record() {
    let mut host = started_host();
    let device = host.attach_device(Speed::Full, 0, 0).unwrap();
    host.create_pipe(device, PipeKind::Bulk, 1, Direction::In, 64, 0)
        .unwrap();
    host.create_pipe(device, PipeKind::Interrupt, 2, Direction::In, 8, 8)
        .unwrap();

    host.detach_device(device);
    host.controller_mut().raise(UsbSts::ASYNC_ADVANCE);
    host.on_interrupt();

    let stats = host.pool_stats();
    assert_eq!(stats.devices.in_use, 0);
    assert_eq!(stats.pipes.in_use, 0);
    assert_eq!(stats.transfers.in_use, 0);

    // And address 0 is free for the next device
    assert!(host.attach_device(Speed::High, 0, 0).is_some());
}
