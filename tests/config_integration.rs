//! Integration tests for device configuration files
//!
//! These tests validate that shipped configurations load and describe
//! devices that probe, and that saved configurations load back unchanged.

#![cfg(feature = "mock-hardware")]

mod common;

use common::builders::loopback_topology;
use common::mock_helpers::{bound_device, config_with, manual_engine};
use evpipe::config::{DeviceConfig, CONFIG_FILE};
use evpipe::dma::DmaDirection;
use evpipe::graph::{BusCode, PixelFormat};
use std::path::PathBuf;
use tempfile::TempDir;

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join(name)
}

#[test]
fn test_demo_configs_load() {
    for name in ["sensor_filter.toml", "loopback.toml"] {
        let config = DeviceConfig::load(&demo(name)).unwrap();
        assert!(!config.topology.nodes.is_empty(), "{}", name);
    }
}

#[test]
fn test_loopback_demo_probes() {
    let config = DeviceConfig::load(&demo("loopback.toml")).unwrap();
    assert_eq!(config.topology.ports[1].direction(), DmaDirection::Output);
    assert_eq!(
        config.topology.node("isp").unwrap().format.unwrap().code,
        BusCode::Evt21
    );

    let rig = bound_device(&config, manual_engine());
    assert_eq!(rig.device.channel(0).unwrap().name(), "evloop output 0");
    assert_eq!(rig.device.channel(1).unwrap().name(), "evloop input 1");
    assert_eq!(rig.device.graph().link_count(), 2);

    let format = rig.device.channel(0).unwrap().format().unwrap();
    assert_eq!(format.pixel_format, Some(PixelFormat::Evt21));
    assert_eq!(format.size_image, 65536);
}

#[test]
fn test_saved_config_probes_identically() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(CONFIG_FILE);

    let config = config_with(loopback_topology());
    config.save(&path).unwrap();
    let loaded = DeviceConfig::load(&path).unwrap();
    assert_eq!(loaded, config);

    let rig = bound_device(&loaded, manual_engine());
    assert_eq!(rig.device.snapshot().entities.len(), 3);
}

#[test]
fn test_packetizer_programmed_from_config() {
    let config = DeviceConfig::load(&demo("loopback.toml")).unwrap();
    let rig = bound_device(&config, manual_engine());
    let channel = rig.device.channel(0).unwrap();

    assert_eq!(channel.read_register(0x4).unwrap(), 0);
    assert_eq!(channel.read_register(0x8).unwrap(), 65536 / 8);
    assert!(channel.read_register(0x100).is_err());
}
