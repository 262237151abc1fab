//! Integration tests for streaming
//!
//! These tests validate DMA channel streaming on a probed device:
//! - Shared pipeline start/stop across two endpoints
//! - Buffer completion through the automatic engine
//! - Flushing on stop and unwinding on failed starts
//! - Completions racing a stop from another thread

#![cfg(feature = "mock-hardware")]

mod common;

use common::builders::{buffers, loopback_topology, sensor_filter_topology};
use common::mock_helpers::{auto_engine, bound_device, config_with, manual_engine, probe};
use common::{test_timeout, TEST_TRANSFER_SIZE};
use evpipe::dma::MockTransferEngine;
use evpipe::error::{ChannelError, EngineError};
use evpipe::graph::{BusCode, PixelFormat};
use evpipe::{BufferState, EvPipeError, PipelineState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_two_endpoint_barrier() {
    let config = config_with(loopback_topology());
    let rig = bound_device(&config, manual_engine());
    let capture = rig.device.channel(0).unwrap();
    let output = rig.device.channel(1).unwrap();
    let isp = rig.node("isp");

    capture.start_streaming().unwrap();
    let pipe = capture.pipeline().unwrap();
    assert_eq!(pipe.num_endpoints(), 2);
    assert_eq!(pipe.stream_count(), 1);
    assert!(!isp.is_streaming());

    output.start_streaming().unwrap();
    assert!(Arc::ptr_eq(&pipe, &output.pipeline().unwrap()));
    assert_eq!(
        pipe.state(),
        PipelineState::Streaming {
            endpoints: 2,
            streaming: 2
        }
    );
    assert!(isp.is_streaming());
    assert_eq!(isp.starts(), 1);

    capture.stop_streaming();
    assert_eq!(pipe.stream_count(), 1);
    assert!(isp.is_streaming());

    output.stop_streaming();
    assert_eq!(pipe.stream_count(), 0);
    assert!(!isp.is_streaming());
    assert_eq!(isp.stops(), 1);
    assert_eq!(pipe.state(), PipelineState::Empty);
    assert!(!rig.device.graph().is_frozen());
}

#[test]
fn test_auto_engine_completes_in_order() {
    let config = config_with(sensor_filter_topology());
    let rig = bound_device(&config, auto_engine(Duration::from_millis(1)));
    let channel = rig.device.channel(0).unwrap();

    for buffer in buffers(4, TEST_TRANSFER_SIZE) {
        channel.enqueue(buffer).unwrap();
    }
    channel.start_streaming().unwrap();
    assert!(rig.node("sensor").is_streaming());
    assert!(rig.node("filter").is_streaming());

    let mut sequences = Vec::new();
    for _ in 0..4 {
        let buffer = channel
            .dequeue_timeout(test_timeout())
            .expect("buffer completed");
        assert_eq!(buffer.state, BufferState::Done);
        assert_eq!(buffer.bytes_used, TEST_TRANSFER_SIZE);
        sequences.push(buffer.sequence);
    }
    assert_eq!(sequences, vec![0, 1, 2, 3]);

    channel.stop_streaming();
    let stats = channel.stats();
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.total_bytes, 4 * TEST_TRANSFER_SIZE as u64);
    assert_eq!(stats.success_rate(), 100.0);
}

#[test]
fn test_requeue_while_streaming() {
    let config = config_with(sensor_filter_topology());
    let rig = bound_device(&config, auto_engine(Duration::from_millis(1)));
    let channel = rig.device.channel(0).unwrap();

    for buffer in buffers(2, TEST_TRANSFER_SIZE) {
        channel.enqueue(buffer).unwrap();
    }
    channel.start_streaming().unwrap();

    let mut done = 0;
    while done < 10 {
        let buffer = channel
            .dequeue_timeout(test_timeout())
            .expect("buffer completed");
        assert_eq!(buffer.state, BufferState::Done);
        done += 1;
        channel.enqueue(evpipe::Buffer::new(buffer.handle)).unwrap();
    }
    channel.stop_streaming();
    assert_eq!(channel.in_flight(), 0);
}

#[test]
fn test_stop_flushes_outstanding_buffers() {
    let config = config_with(sensor_filter_topology());
    let rig = bound_device(&config, manual_engine());
    let channel = rig.device.channel(0).unwrap();
    let engine = rig.engine_channel(0);

    for buffer in buffers(3, TEST_TRANSFER_SIZE) {
        channel.enqueue(buffer).unwrap();
    }
    channel.start_streaming().unwrap();
    assert!(engine.complete_next(16));

    channel.stop_streaming();
    assert_eq!(channel.in_flight(), 0);
    assert!(!rig.node("sensor").is_streaming());
    assert!(engine.terminations() >= 1);

    let first = channel.try_dequeue().unwrap();
    assert_eq!(first.state, BufferState::Done);
    assert_eq!(first.bytes_used, TEST_TRANSFER_SIZE - 16);
    let rest: Vec<_> = std::iter::from_fn(|| channel.try_dequeue()).collect();
    assert_eq!(rest.len(), 2);
    assert!(rest.iter().all(|b| b.state == BufferState::Errored));

    // A late completion after the flush is dropped
    assert!(!engine.complete_next(0));
    assert!(channel.try_dequeue().is_none());
}

#[test]
fn test_failed_start_reclaims_and_retry_works() {
    let config = config_with(sensor_filter_topology());
    let rig = bound_device(&config, manual_engine());
    let channel = rig.device.channel(0).unwrap();
    let sensor = rig.node("sensor");

    for buffer in buffers(2, TEST_TRANSFER_SIZE) {
        channel.enqueue(buffer).unwrap();
    }
    sensor.set_fail_start(true);
    assert!(matches!(
        channel.start_streaming(),
        Err(ChannelError::Subdevice(_))
    ));
    assert!(!channel.is_streaming());
    assert!(!rig.device.graph().is_frozen());
    let reclaimed: Vec<_> = std::iter::from_fn(|| channel.try_dequeue()).collect();
    assert_eq!(reclaimed.len(), 2);
    assert!(reclaimed.iter().all(|b| b.state == BufferState::Reclaimed));

    sensor.set_fail_start(false);
    for buffer in reclaimed {
        channel.enqueue(evpipe::Buffer::new(buffer.handle)).unwrap();
    }
    channel.start_streaming().unwrap();
    assert!(sensor.is_streaming());
    channel.stop_streaming();
}

#[test]
fn test_format_follows_upstream_node() {
    let mut topology = sensor_filter_topology();
    topology.nodes[1].format = Some(evpipe::graph::MediaBusFormat {
        code: BusCode::Evt21,
        width: 640,
        height: 480,
    });
    let config = config_with(topology);
    let rig = bound_device(&config, manual_engine());
    let channel = rig.device.channel(0).unwrap();

    let format = channel.set_format().unwrap();
    assert_eq!(format.pixel_format, Some(PixelFormat::Evt21));
    assert_eq!((format.width, format.height), (640, 480));
    assert_eq!(format.size_image, TEST_TRANSFER_SIZE);
    assert_eq!(format.bytes_per_line, 0);

    channel.start_streaming().unwrap();
    assert!(matches!(
        channel.set_format(),
        Err(ChannelError::Busy { .. })
    ));
    channel.stop_streaming();
}

#[test]
fn test_deferred_engine_channel() {
    let config = config_with(sensor_filter_topology());
    let engine = Arc::new(MockTransferEngine::manual().with_deferred("port0"));

    let err = probe(&config, engine.clone()).unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        EvPipeError::Channel(ChannelError::EngineUnavailable(EngineError::Deferred(_)))
    ));

    engine.set_ready("port0");
    let device = probe(&config, engine.clone()).unwrap();
    assert_eq!(device.channels().len(), 1);
    assert_eq!(engine.channel_count(), 1);
    device.remove();
    assert_eq!(engine.channel_count(), 0);
}

#[test]
fn test_remove_while_streaming() {
    let config = config_with(sensor_filter_topology());
    let rig = bound_device(&config, manual_engine());
    let channel = rig.device.channel(0).unwrap().clone();
    for buffer in buffers(2, TEST_TRANSFER_SIZE) {
        channel.enqueue(buffer).unwrap();
    }
    channel.start_streaming().unwrap();

    let sensor = rig.node("sensor").clone();
    let engine = rig.engine.clone();
    rig.device.remove();

    assert!(!channel.is_streaming());
    assert!(!sensor.is_streaming());
    assert_eq!(engine.channel_count(), 0);
    let flushed: Vec<_> = std::iter::from_fn(|| channel.try_dequeue()).collect();
    assert_eq!(flushed.len(), 2);
}

#[test]
fn test_completions_racing_stop_hand_back_each_buffer_once() {
    let config = config_with(sensor_filter_topology());
    let rig = bound_device(&config, manual_engine());
    let channel = rig.device.channel(0).unwrap();
    let engine = rig.engine_channel(0);

    for _ in 0..20 {
        let mut pool = buffers(8, TEST_TRANSFER_SIZE).into_iter();
        for buffer in pool.by_ref().take(4) {
            channel.enqueue(buffer).unwrap();
        }

        let done = Arc::new(AtomicBool::new(false));
        let completer = {
            let (engine, done) = (engine.clone(), done.clone());
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    if !engine.complete_next(0) {
                        thread::yield_now();
                    }
                }
            })
        };

        channel.start_streaming().unwrap();
        for buffer in pool {
            channel.enqueue(buffer).unwrap();
        }
        channel.stop_streaming();
        done.store(true, Ordering::Release);
        completer.join().unwrap();

        let handed_back: Vec<_> = std::iter::from_fn(|| channel.try_dequeue()).collect();
        let mut indices: Vec<_> = handed_back.iter().map(|b| b.handle.index).collect();
        indices.sort();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert!(handed_back
            .iter()
            .all(|b| matches!(b.state, BufferState::Done | BufferState::Errored)));
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(engine.outstanding(), 0);
    }
}
