//! Tape device facade tests against the virtual backend.

use std::path::PathBuf;

use anyhow::Error;

use tvs_api_types::{ErrorKind, VolumeLabel};

use tapevault::tape::ltfs::LtfsTools;
use tapevault::tape::{open_tape_drive, TapeHandle};

struct TestDir(PathBuf);

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn open_virtual(name: &str) -> (TapeHandle, TestDir) {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "tapevault-device-test-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();

    let config_text = format!(
        "virtual: drive0\n\tpath {}\n",
        path.join("vtape").display()
    );
    let config = tvs_config::drive::CONFIG.parse("tape.cfg", &config_text).unwrap();

    let device = open_tape_drive(&config, "drive0", LtfsTools::default()).unwrap();
    (device, TestDir(path))
}

#[test]
fn test_ready_without_medium() -> Result<(), Error> {
    let (mut device, _dir) = open_virtual("ready");

    assert!(!device.ready()?);

    device.load()?;
    assert!(device.ready()?);

    Ok(())
}

// load(); unload() returns the drive to idle with the position at BOP
#[test]
fn test_load_unload_round_trip() -> Result<(), Error> {
    let (mut device, _dir) = open_virtual("roundtrip");

    device.load()?;
    let position = device.position()?;
    assert!(position.at_bop);
    assert_eq!(position.logical_block, 0);

    device.write_filemark(2)?;
    let position = device.position()?;
    assert!(!position.at_bop);

    device.unload()?;
    assert!(!device.ready()?);

    device.load()?;
    let position = device.position()?;
    assert!(position.at_bop);
    assert_eq!(position.logical_block, 0);

    Ok(())
}

#[test]
fn test_format_and_label_round_trip() -> Result<(), Error> {
    let (mut device, _dir) = open_virtual("format");

    device.load()?;
    assert!(device.read_volume_label()?.is_none());

    let label: VolumeLabel = "TP20250107".parse()?;
    device.format(&label, false, false)?;

    let (read_back, _source) = device.read_volume_label()?.unwrap();
    assert_eq!(read_back, label);

    // erase drops the volume and its label
    device.erase(true)?;
    assert!(device.read_volume_label()?.is_none());

    Ok(())
}

#[test]
fn test_position_cache_invalidation() -> Result<(), Error> {
    let (mut device, _dir) = open_virtual("poscache");

    device.load()?;
    device.space_records(5)?;

    let position = device.position()?;
    assert_eq!(position.logical_block, 5);
    assert_eq!(device.last_known_position(), Some(position));

    // moving the tape drops the cached position
    device.space_records(-2)?;
    assert_eq!(device.last_known_position(), None);
    assert_eq!(device.position()?.logical_block, 3);

    device.rewind()?;
    assert_eq!(device.position()?.logical_block, 0);

    Ok(())
}

#[test]
fn test_operations_need_a_medium() {
    let (mut device, _dir) = open_virtual("nomedium");

    match device.rewind() {
        Err(err) => assert_eq!(err.kind(), ErrorKind::NotReady),
        Ok(()) => panic!("rewind without medium must fail"),
    }

    match device.position() {
        Err(err) => assert_eq!(err.kind(), ErrorKind::NotReady),
        Ok(_) => panic!("position without medium must fail"),
    }
}
