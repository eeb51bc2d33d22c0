//! Drive-level hardware encryption control (SPIN/SPOUT).
//!
//! The key blob is supplied opaquely (32 byte AES-256-GCM key) and is
//! always loaded in mixed mode, so volumes written without encryption
//! stay readable while the key is set.

use std::io::Write;
use std::os::unix::prelude::AsRawFd;

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use tvs_api_types::TapeError;

use crate::sgutils2::{alloc_page_aligned_buffer, SgRaw};

/// Set or clear the data encryption key.
///
/// Clearing on a drive without hardware encryption is a no-op; setting
/// a key on such a drive fails `InvalidCommand`. After the SPOUT the
/// reported mode is verified, so a drive silently ignoring the page
/// surfaces as `HardwareError`.
pub fn set_encryption<F: AsRawFd>(file: &mut F, key: Option<[u8; 32]>) -> Result<(), TapeError> {
    let caps = match spin_data_encryption_caps(file) {
        Ok(caps) => caps,
        Err(_) if key.is_none() => {
            // no hardware encryption - we can simply ignore the
            // clear key request
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let algorithm_index = find_aes_gcm_descriptor(&caps)
        .map_err(|err| TapeError::InvalidCommand(err.to_string()))?;

    spout_set_encryption(file, algorithm_index, key)?;

    let data = spin_data_encryption_status(file)?;
    let mode = decode_data_encryption_mode(&data)
        .map_err(|err| TapeError::HardwareError(err.to_string()))?;

    match mode {
        DataEncryptionMode::Off if key.is_none() => Ok(()),
        DataEncryptionMode::Mixed if key.is_some() => Ok(()),
        mode => Err(TapeError::HardwareError(format!(
            "got unexpected encryption mode {:?}",
            mode
        ))),
    }
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspSetDataEncryptionPage {
    page_code: u16,
    page_len: u16,
    scope_byte: u8,
    control_byte_5: u8,
    encryption_mode: u8,
    decryption_mode: u8,
    algorithm_index: u8,
    key_format: u8,
    reserved: [u8; 8],
    key_len: u16,
    /* key follows */
}

fn spout_set_encryption<F: AsRawFd>(
    file: &mut F,
    algorithm_index: u8,
    key: Option<[u8; 32]>,
) -> Result<(), TapeError> {
    let mut sg_raw = SgRaw::new(file, 0)
        .map_err(|err| TapeError::HardwareError(format!("set encryption - {}", err)))?;

    let mut outbuf_len = std::mem::size_of::<SspSetDataEncryptionPage>();
    if let Some(ref key) = key {
        outbuf_len += key.len();
    }

    let page = SspSetDataEncryptionPage {
        page_code: 0x10,
        page_len: (outbuf_len - 4) as u16,
        scope_byte: (0b10 << 5), // all IT nexus
        control_byte_5: 0,       // CKOD=0
        encryption_mode: if key.is_some() { 2 } else { 0 },
        decryption_mode: if key.is_some() { 3 } else { 0 }, // mixed mode
        algorithm_index,
        key_format: 0,
        reserved: [0u8; 8],
        key_len: if let Some(ref key) = key {
            key.len() as u16
        } else {
            0
        },
    };

    let outbuf = proxmox_lang::try_block!({
        let mut outbuf = alloc_page_aligned_buffer(outbuf_len)?;
        let mut writer = &mut outbuf[..];
        unsafe { writer.write_be_value(page)? };
        if let Some(ref key) = key {
            writer.write_all(key)?;
        }
        Ok(outbuf)
    })
    .map_err(|err: Error| TapeError::HardwareError(format!("set encryption - {}", err)))?;

    let mut cmd = vec![0xB5]; // SECURITY PROTOCOL OUT (SPOUT)
    cmd.push(0x20); // Tape Data Encryption Page
    cmd.push(0);
    cmd.push(0x10); // Set Data Encryption page
    cmd.push(0);
    cmd.push(0);
    cmd.extend((outbuf_len as u32).to_be_bytes()); // data out len
    cmd.push(0);
    cmd.push(0);

    sg_raw
        .do_out_command(&cmd, &outbuf)
        .map_err(|err| err.into_tape_error("set data encryption SPOUT(20h[0010h])"))
}

// SECURITY PROTOCOL IN on the Tape Data Encryption protocol
//
// Warning: this blocks and fails if there is no media loaded
fn spin_tape_data_encryption<F: AsRawFd>(
    file: &mut F,
    page: u16,
    what: &str,
) -> Result<Vec<u8>, TapeError> {
    let allocation_len: u32 = 8192 + 4;

    let mut sg_raw = SgRaw::new(file, allocation_len as usize)
        .map_err(|err| TapeError::HardwareError(format!("{} - {}", what, err)))?;

    let mut cmd = vec![0xA2]; // SECURITY PROTOCOL IN (SPIN)
    cmd.push(0x20); // Tape Data Encryption Page
    cmd.extend(page.to_be_bytes());
    cmd.push(0);
    cmd.push(0);
    cmd.extend(allocation_len.to_be_bytes());
    cmd.push(0);
    cmd.push(0);

    sg_raw
        .do_command(&cmd)
        .map(|data| data.to_vec())
        .map_err(|err| err.into_tape_error(what))
}

fn spin_data_encryption_status<F: AsRawFd>(file: &mut F) -> Result<Vec<u8>, TapeError> {
    spin_tape_data_encryption(file, 0x20, "read data encryption status SPIN(20h[0020h])")
}

fn spin_data_encryption_caps<F: AsRawFd>(file: &mut F) -> Result<Vec<u8>, TapeError> {
    spin_tape_data_encryption(file, 0x10, "read data encryption caps SPIN(20h[0010h])")
}

#[derive(Debug)]
enum DataEncryptionMode {
    On,
    Mixed,
    RawRead,
    Off,
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspDataEncryptionCapabilityPage {
    page_code: u16,
    page_len: u16,
    reserved: [u8; 16],
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspDataEncryptionAlgorithmDescriptor {
    algorithm_index: u8,
    reserved1: u8,
    descriptor_len: u16,
    control_byte_4: u8,
    control_byte_5: u8,
    max_ucad_bytes: u16,
    max_acad_bytes: u16,
    key_size: u16,
    control_byte_12: u8,
    reserved2: u8,
    msdk_count: u16,
    reserved3: [u8; 4],
    algorithm_code: u32,
}

// Search the capability page for AES-GCM with 256bit keys and return
// its algorithm index.
fn find_aes_gcm_descriptor(data: &[u8]) -> Result<u8, Error> {
    proxmox_lang::try_block!({
        let mut reader = data;
        let _page: SspDataEncryptionCapabilityPage = unsafe { reader.read_be_value()? };

        loop {
            if reader.is_empty() {
                break;
            };
            let desc: SspDataEncryptionAlgorithmDescriptor = unsafe { reader.read_be_value()? };
            if desc.descriptor_len != 0x14 {
                bail!("got wrong key descriptor len");
            }
            if (desc.control_byte_4 & 0b00000011) != 2 {
                continue; // can't encrypt in hardware
            }
            if ((desc.control_byte_4 & 0b00001100) >> 2) != 2 {
                continue; // can't decrypt in hardware
            }
            if desc.algorithm_code == 0x00010014 && desc.key_size == 32 {
                return Ok(desc.algorithm_index);
            }
        }

        bail!("drive does not support AES-GCM encryption");
    })
    .map_err(|err: Error| format_err!("decode data encryption caps page failed - {}", err))
}

#[derive(Endian)]
#[repr(C, packed)]
struct SspDataEncryptionStatusPage {
    page_code: u16,
    page_len: u16,
    scope_byte: u8,
    encryption_mode: u8,
    decryption_mode: u8,
    algorithm_index: u8,
    key_instance_counter: u32,
    control_byte: u8,
    key_format: u8,
    key_len: u16,
    reserved: [u8; 8],
}

fn decode_data_encryption_mode(data: &[u8]) -> Result<DataEncryptionMode, Error> {
    proxmox_lang::try_block!({
        let mut reader = data;
        let page: SspDataEncryptionStatusPage = unsafe { reader.read_be_value()? };

        if page.page_code != 0x20 {
            bail!("invalid response");
        }

        match (page.encryption_mode, page.decryption_mode) {
            (0, 0) => Ok(DataEncryptionMode::Off),
            (2, 1) => Ok(DataEncryptionMode::RawRead),
            (2, 2) => Ok(DataEncryptionMode::On),
            (2, 3) => Ok(DataEncryptionMode::Mixed),
            _ => bail!("unknown encryption mode"),
        }
    })
    .map_err(|err: Error| format_err!("decode data encryption status page failed - {}", err))
}
