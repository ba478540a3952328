//! Integration tests for device memory and command streams.
//!
//! These exercise the patterns the batch decoder depends on: staging through
//! pinned memory, writing disjoint regions of one output buffer from a
//! single stream, and reading results back after a synchronization point.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use pf_common::DeviceError;
use pf_device::{Device, EMULATED_DEVICE_COUNT};

// ---------------------------------------------------------------------------
// Staging and readback
// ---------------------------------------------------------------------------

#[test]
fn staged_uploads_land_in_their_regions() {
    let dev = Device::open(0).unwrap();
    let stream = dev.create_stream().unwrap();
    let output = dev.alloc(12).unwrap();

    // Three samples of 4 bytes each, uploaded in reverse order.
    let mut staging = Vec::new();
    for i in 0..3u8 {
        let p = dev.alloc_pinned(4).unwrap();
        p.write(0, &[i + 1; 4]).unwrap();
        staging.push(p);
    }
    for i in (0..3).rev() {
        let region = output.region(i * 4, 4).unwrap();
        stream
            .copy_htod(format!("sample-{i}"), &staging[i], 0, &region)
            .unwrap();
    }
    stream.synchronize().unwrap();

    let mut host = vec![0u8; 12];
    output.copy_to_host(0, &mut host).unwrap();
    assert_eq!(host, [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
}

#[test]
fn upload_then_kernel_sees_uploaded_data() {
    let dev = Device::open(0).unwrap();
    let stream = dev.create_stream().unwrap();
    let pinned = dev.alloc_pinned(4).unwrap();
    pinned.write(0, &[1, 2, 3, 4]).unwrap();
    let scratch = dev.alloc(4).unwrap();
    let out = dev.alloc(4).unwrap();

    stream
        .copy_htod("upload", &pinned, 0, &scratch.full_region())
        .unwrap();
    let src = scratch.full_region();
    let dst = out.full_region();
    stream
        .enqueue("double", move || {
            src.with(|s| {
                dst.with_mut(|d| {
                    for (o, i) in d.iter_mut().zip(s) {
                        *o = i * 2;
                    }
                })
            });
            Ok(())
        })
        .unwrap();
    stream.synchronize().unwrap();

    let mut host = [0u8; 4];
    out.copy_to_host(0, &mut host).unwrap();
    assert_eq!(host, [2, 4, 6, 8]);
}

#[test]
fn replaced_staging_handle_stays_alive_for_queued_copy() {
    let dev = Device::open(0).unwrap();
    let stream = dev.create_stream().unwrap();
    let out = dev.alloc(4).unwrap();
    let mut pinned = dev.alloc_pinned(4).unwrap();
    pinned.write(0, &[9, 9, 9, 9]).unwrap();

    stream
        .copy_htod("upload", &pinned, 0, &out.full_region())
        .unwrap();
    // Grow (replace) the staging buffer before the copy is known to have run.
    assert!(dev.ensure_pinned(&mut pinned, 64, 0).unwrap());
    stream.synchronize().unwrap();

    let mut host = [0u8; 4];
    out.copy_to_host(0, &mut host).unwrap();
    assert_eq!(host, [9, 9, 9, 9]);
}

// ---------------------------------------------------------------------------
// Ordering across submitting threads
// ---------------------------------------------------------------------------

#[test]
fn shared_stream_preserves_per_thread_order() {
    let dev = Device::open(0).unwrap();
    let stream = Arc::new(dev.create_stream().unwrap());
    let log = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let stream = stream.clone();
            let log = log.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let log = log.clone();
                    stream
                        .enqueue("log", move || {
                            log.lock().push((t, i));
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    stream.synchronize().unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 200);
    for t in 0..4 {
        let seq: Vec<_> = log.iter().filter(|(tt, _)| *tt == t).map(|(_, i)| *i).collect();
        assert_eq!(seq, (0..50).collect::<Vec<_>>());
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn first_failure_wins() {
    let dev = Device::open(0).unwrap();
    let stream = dev.create_stream().unwrap();
    stream.enqueue("first", || Err("one".into())).unwrap();
    stream.enqueue("second", || Err("two".into())).unwrap();

    match stream.synchronize() {
        Err(DeviceError::CommandFailed { label, .. }) => assert_eq!(label, "first"),
        other => panic!("unexpected: {other:?}"),
    }
    let stats = stream.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.skipped, 1);
}

#[test]
fn out_of_range_ordinal() {
    let err = Device::open(EMULATED_DEVICE_COUNT).unwrap_err();
    assert!(err.to_string().contains("ordinal"));
}
