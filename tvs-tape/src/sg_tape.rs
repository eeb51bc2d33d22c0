//! SCSI pass-through tape back-end.
//!
//! Control-path only: archive data travels through LTFS file I/O on
//! the mounted volume, never through raw WRITE CDBs.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

mod encryption;
pub use encryption::*;

mod volume_statistics;
pub use volume_statistics::*;

mod tape_alert_flags;
pub use tape_alert_flags::*;

use proxmox_io::{ReadExt, WriteExt};
use proxmox_sys::error::SysResult;

use tvs_api_types::{TapeDensity, TapeError, TapePosition};

use crate::sgutils2::{
    alloc_page_aligned_buffer, scsi_cmd_mode_select10, scsi_cmd_mode_select6, scsi_inquiry,
    scsi_mode_sense, scsi_receive_diagnostic, scsi_request_sense, InquiryInfo,
    ModeBlockDescriptor, ModeParameterHeader, ScsiError, SgRaw,
};

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct ReadPositionLongPage {
    flags: u8,
    reserved: [u8; 3],
    partition_number: u32,
    logical_object_number: u64,
    logical_file_id: u64,
    obsolete: [u8; 8],
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct DataCompressionModePage {
    page_code: u8,   // 0x0f
    page_length: u8, // 0x0e
    flags2: u8,
    flags3: u8,
    compression_algorithm: u32,
    decompression_algorithm: u32,
    reserved: [u8; 4],
}

impl DataCompressionModePage {
    pub fn set_compression(&mut self, enable: bool) {
        if enable {
            self.flags2 |= 128;
        } else {
            self.flags2 &= 127;
        }
    }

    pub fn compression_enabled(&self) -> bool {
        (self.flags2 & 0b1000_0000) != 0
    }
}

#[repr(C, packed)]
#[derive(Endian)]
struct MediumConfigurationModePage {
    page_code: u8,   // 0x1d
    page_length: u8, // 0x1e
    flags2: u8,
    reserved: [u8; 29],
}

impl MediumConfigurationModePage {
    pub fn is_worm(&self) -> bool {
        (self.flags2 & 1) == 1
    }
}

#[derive(Debug)]
pub struct ScsiDriveStatus {
    pub block_length: u32,
    pub density_code: u8,
    pub buffer_mode: u8,
    pub write_protect: bool,
    pub compression: bool,
}

/// A SCSI-generic tape drive handle.
pub struct SgTape {
    file: File,
    info: InquiryInfo,
    encryption_key_loaded: bool,
}

impl SgTape {
    const SCSI_TAPE_DEFAULT_TIMEOUT: usize = 60 * 10; // 10 minutes

    /// Create a new instance
    ///
    /// Uses scsi_inquiry to check the device type.
    pub fn new(mut file: File) -> Result<Self, Error> {
        let info = scsi_inquiry(&mut file)?;

        if info.peripheral_type != 1 {
            bail!(
                "not a tape device (peripheral_type = {})",
                info.peripheral_type
            );
        }

        Ok(Self {
            file,
            info,
            encryption_key_loaded: false,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<SgTape, Error> {
        // do not wait for media, use O_NONBLOCK
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        // then clear O_NONBLOCK
        let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).into_io_result()?;

        let mut flags = OFlag::from_bits_truncate(flags);
        flags.remove(OFlag::O_NONBLOCK);

        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags)).into_io_result()?;

        Self::new(file)
    }

    pub fn info(&self) -> &InquiryInfo {
        &self.info
    }

    /// Run a command, mapping failures to the taxonomy.
    ///
    /// On a pass-through timeout we issue a REQUEST SENSE probe so the
    /// last sense state of the drive is part of the error message.
    fn run_cdb(&mut self, what: &str, cmd: &[u8], timeout: usize) -> Result<(), TapeError> {
        let result = {
            let mut sg_raw = SgRaw::new(&mut self.file, 16)
                .map_err(|err| TapeError::HardwareError(format!("{} - {}", what, err)))?;
            sg_raw.set_timeout(timeout);
            sg_raw.do_command(cmd).map(|_| ())
        };

        match result {
            Ok(()) => Ok(()),
            Err(ScsiError::Timeout) => {
                let probe = match scsi_request_sense(&mut self.file) {
                    Ok(sense) => format!("last sense: {}", sense.sense_info()),
                    Err(err) => format!("sense probe failed: {}", err),
                };
                Err(TapeError::Timeout(format!(
                    "{} exceeded deadline ({})",
                    what, probe
                )))
            }
            Err(err) => Err(err.into_tape_error(what)),
        }
    }

    pub fn test_unit_ready(&mut self) -> Result<(), TapeError> {
        let cmd = &[0x00, 0, 0, 0, 0, 0]; // TEST UNIT READY
        self.run_cdb("test_unit_ready", cmd, 30)
    }

    /// Poll TEST UNIT READY until the drive settles or the timeout hits.
    pub fn wait_until_ready(&mut self, timeout: Option<u64>) -> Result<(), TapeError> {
        let start = SystemTime::now();
        let timeout = timeout.unwrap_or(Self::SCSI_TAPE_DEFAULT_TIMEOUT as u64);
        let max_wait = std::time::Duration::new(timeout, 0);

        loop {
            match self.test_unit_ready() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    std::thread::sleep(std::time::Duration::new(1, 0));
                    let elapsed = start.elapsed().unwrap_or(max_wait);
                    if elapsed > max_wait {
                        return Err(TapeError::Timeout(format!(
                            "wait_until_ready timed out - {}",
                            err
                        )));
                    }
                }
            }
        }
    }

    pub fn load(&mut self) -> Result<(), TapeError> {
        let cmd = &[0x1B, 0, 0, 0, 0b0000_0001, 0]; // LOAD/UNLOAD HOLD=0, LOAD=1
        self.run_cdb("load media", cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)
    }

    pub fn eject(&mut self) -> Result<(), TapeError> {
        let cmd = &[0x1B, 0, 0, 0, 0, 0]; // LOAD/UNLOAD HOLD=0, LOAD=0
        self.run_cdb("eject media", cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)
    }

    pub fn rewind(&mut self) -> Result<(), TapeError> {
        let cmd = &[0x01, 0, 0, 0, 0, 0]; // REWIND
        self.run_cdb("rewind", cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)
    }

    /// Erase medium.
    ///
    /// EOD is written at the current position, which marks it as end
    /// of data.
    pub fn erase_media(&mut self, fast: bool) -> Result<(), TapeError> {
        let mut cmd = vec![0x19];
        if fast {
            cmd.push(0); // LONG=0
        } else {
            cmd.push(1); // LONG=1
        }
        cmd.extend([0, 0, 0, 0]);

        self.run_cdb("erase", &cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)
    }

    /// Low-level format, single partition.
    ///
    /// FORMAT(04h) requires LTO5 or newer; older generations fall back
    /// to rewind + erase.
    pub fn format_media(&mut self, fast: bool) -> Result<(), TapeError> {
        let density = match self.read_medium_configuration_page() {
            Ok((_head, block_descriptor, page)) => {
                if page.is_worm() {
                    // WORM media cannot be reformatted
                    return Err(TapeError::WriteProtected);
                }
                TapeDensity::try_from(block_descriptor.density_code)
                    .unwrap_or(TapeDensity::Unknown)
            }
            Err(_) => TapeDensity::Unknown,
        };

        self.rewind()?;

        if density >= TapeDensity::LTO5 && density <= TapeDensity::LTO8 {
            let cmd = &[0x04, 0, 0, 0, 0, 0]; // FORMAT
            self.run_cdb("format", cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)?;
            if !fast {
                self.erase_media(false)?; // overwrite everything
            }
        } else if density >= TapeDensity::LTO9 && !fast {
            let cmd = &[0x04, 0x01, 0, 0, 0, 0]; // FORMAT, set IMMED
            self.run_cdb("format", cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)?;
            // LTO9+ media initialization can take up to two hours
            self.wait_until_ready(Some(60 * 60 * 2))?;
            self.erase_media(false)?;
        } else {
            // we also do this for LTO9+ fast mode to avoid reinitialization
            self.erase_media(fast)?;
        }

        Ok(())
    }

    /// Lock/Unlock drive door
    pub fn set_medium_removal(&mut self, allow: bool) -> Result<(), TapeError> {
        let mut cmd = vec![0x1E, 0, 0, 0];
        if allow {
            cmd.push(0);
        } else {
            cmd.push(1);
        }
        cmd.push(0); // control

        self.run_cdb("set_medium_removal", &cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)
    }

    fn space(&mut self, count: isize, blocks: bool) -> Result<(), TapeError> {
        let mut cmd = Vec::new();

        // Use short command if possible (supported by all drives)
        if (count <= 0x7fffff) && (count > -0x7fffff) {
            cmd.push(0x11); // SPACE(6)
            if blocks {
                cmd.push(0); // blocks
            } else {
                cmd.push(1); // filemarks
            }
            cmd.push(((count >> 16) & 0xff) as u8);
            cmd.push(((count >> 8) & 0xff) as u8);
            cmd.push((count & 0xff) as u8);
            cmd.push(0); // control byte
        } else {
            cmd.push(0x91); // SPACE(16)
            if blocks {
                cmd.push(0);
            } else {
                cmd.push(1);
            }
            cmd.extend([0, 0]); // reserved
            let count: i64 = count as i64;
            cmd.extend(count.to_be_bytes());
            cmd.extend([0, 0, 0, 0]); // reserved
        }

        self.run_cdb("space", &cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)
    }

    pub fn space_filemarks(&mut self, count: isize) -> Result<(), TapeError> {
        self.space(count, false)
    }

    pub fn space_blocks(&mut self, count: isize) -> Result<(), TapeError> {
        self.space(count, true)
    }

    /// Move to end of recorded data.
    pub fn move_to_eom(&mut self) -> Result<(), TapeError> {
        let cmd = &[0x11, 0x03, 0, 0, 0, 0]; // SPACE(6) move to EOD
        self.run_cdb("move to EOD", cmd, Self::SCSI_TAPE_DEFAULT_TIMEOUT)
    }

    pub fn write_filemarks(&mut self, count: usize, immediate: bool) -> Result<(), TapeError> {
        if count > 255 {
            return Err(TapeError::InvalidCommand(format!(
                "write_filemarks: got strange count '{}'",
                count
            )));
        }

        let mut cmd = vec![0x10];
        if immediate {
            cmd.push(1); // IMMED=1
        } else {
            cmd.push(0); // IMMED=0
        }
        cmd.extend([0, 0, count as u8]); // COUNT
        cmd.push(0); // control byte

        let mut sg_raw = SgRaw::new(&mut self.file, 16)
            .map_err(|err| TapeError::HardwareError(format!("write filemarks - {}", err)))?;
        sg_raw.set_timeout(Self::SCSI_TAPE_DEFAULT_TIMEOUT);

        match sg_raw.do_command(&cmd) {
            Ok(_) => Ok(()),
            Err(ScsiError::Sense(sense))
                if sense.sense_key == 0 && sense.asc == 0 && sense.ascq == 2 =>
            {
                Ok(()) // LEOM early warning - the filemark was still written
            }
            Err(err) => Err(err.into_tape_error("write filemarks")),
        }
    }

    // Flush tape buffers (WEOF with count 0 => flush)
    pub fn sync(&mut self) -> Result<(), TapeError> {
        self.write_filemarks(0, false)
    }

    fn read_position_page(&mut self) -> Result<ReadPositionLongPage, TapeError> {
        let expected_size = std::mem::size_of::<ReadPositionLongPage>();

        let mut sg_raw = SgRaw::new(&mut self.file, 32)
            .map_err(|err| TapeError::HardwareError(format!("read position - {}", err)))?;
        sg_raw.set_timeout(30); // use short timeout

        // READ POSITION LONG FORM works on LTO4 or newer (with recent
        // firmware)
        let cmd = &[0x34, 0x06, 0, 0, 0, 0, 0, 0, 0, 0];

        let data = sg_raw
            .do_command(cmd)
            .map_err(|err| err.into_tape_error("read position"))?;

        proxmox_lang::try_block!({
            if data.len() != expected_size {
                bail!(
                    "got unexpected data len ({} != {})",
                    data.len(),
                    expected_size
                );
            }

            let mut reader = data;

            let page: ReadPositionLongPage = unsafe { reader.read_be_value()? };

            Ok(page)
        })
        .map_err(|err: Error| TapeError::HardwareError(format!("decode position - {}", err)))
    }

    pub fn position(&mut self) -> Result<TapePosition, TapeError> {
        let page = self.read_position_page()?;

        if page.partition_number != 0 {
            return Err(TapeError::MediumError(
                "detected partitioned tape - not supported".to_string(),
            ));
        }

        Ok(TapePosition {
            partition: page.partition_number,
            logical_block: page.logical_object_number,
            at_bop: (page.flags & 0b1000_0000) != 0,
            at_eop: (page.flags & 0b0100_0000) != 0,
        })
    }

    pub fn current_file_number(&mut self) -> Result<u64, TapeError> {
        Ok(self.read_position_page()?.logical_file_id)
    }

    /// Read Tape Alert Flags
    pub fn tape_alert_flags(&mut self) -> Result<TapeAlertFlags, TapeError> {
        read_tape_alert_flags(&mut self.file)
    }

    /// Read Volume Statistics (LP 17h)
    pub fn volume_statistics(&mut self) -> Result<VolumeStatistics, Error> {
        read_volume_statistics(&mut self.file)
    }

    /// Raw self-test / diagnostic page, stored as opaque health blob.
    pub fn receive_diagnostic(&mut self, page_code: u8) -> Result<String, Error> {
        let data = scsi_receive_diagnostic(&mut self.file, page_code)?;
        Ok(hex::encode(data))
    }

    pub fn set_encryption(&mut self, key: Option<[u8; 32]>) -> Result<(), TapeError> {
        self.encryption_key_loaded = key.is_some();

        set_encryption(&mut self.file, key)
    }

    /// Set important drive options
    pub fn set_drive_options(
        &mut self,
        compression: Option<bool>,
        block_length: Option<u32>,
        buffer_mode: Option<bool>,
    ) -> Result<(), Error> {
        // Note: Read/Modify/Write

        let (mut head, mut block_descriptor, mut page) = self.read_compression_page()?;

        let mut sg_raw = SgRaw::new(&mut self.file, 0)?;
        sg_raw.set_timeout(Self::SCSI_TAPE_DEFAULT_TIMEOUT);

        head.reset_mode_data_len(); // mode_data_len need to be zero

        if let Some(compression) = compression {
            page.set_compression(compression);
        }

        if let Some(block_length) = block_length {
            block_descriptor.set_block_length(block_length)?;
        }

        if let Some(buffer_mode) = buffer_mode {
            head.set_buffer_mode(buffer_mode);
        }

        match head {
            ModeParameterHeader::Long(head) => {
                let mut data = Vec::new();
                unsafe {
                    data.write_be_value(head)?;
                    data.write_be_value(block_descriptor)?;
                    data.write_be_value(page)?;
                }

                let param_list_len: u16 = data.len() as u16;
                let cmd = scsi_cmd_mode_select10(param_list_len);

                let mut buffer = alloc_page_aligned_buffer(4096)?;

                buffer[..data.len()].copy_from_slice(&data[..]);

                sg_raw
                    .do_out_command(&cmd, &buffer[..data.len()])
                    .map_err(|err| {
                        format_err!("set drive options (mode select(10)) failed - {}", err)
                    })?;
            }
            ModeParameterHeader::Short(head) => {
                let mut data = Vec::new();
                unsafe {
                    data.write_be_value(head)?;
                    data.write_be_value(block_descriptor)?;
                    data.write_be_value(page)?;
                }

                if data.len() > u8::MAX as usize {
                    bail!("set drive options (mode select(6)) failed - parameters too long");
                }
                let cmd = scsi_cmd_mode_select6(data.len() as u8);

                let mut buffer = alloc_page_aligned_buffer(4096)?;

                buffer[..data.len()].copy_from_slice(&data[..]);

                sg_raw
                    .do_out_command(&cmd, &buffer[..data.len()])
                    .map_err(|err| {
                        format_err!("set drive options (mode select(6)) failed - {}", err)
                    })?;
            }
        }

        Ok(())
    }

    /// Toggle WORM behavior on the medium configuration page.
    ///
    /// Most drives treat WORM as a cartridge property and reject the
    /// mode select; the resulting `InvalidCommand` surfaces to the
    /// caller unchanged.
    pub fn set_worm(&mut self, enabled: bool) -> Result<(), TapeError> {
        let (mut head, block_descriptor, mut page) = self
            .read_medium_configuration_page()
            .map_err(|err| TapeError::HardwareError(err.to_string()))?;

        if page.is_worm() == enabled {
            return Ok(());
        }

        head.reset_mode_data_len();
        if enabled {
            page.flags2 |= 1;
        } else {
            page.flags2 &= !1;
        }

        let mut data = Vec::new();
        proxmox_lang::try_block!({
            match head {
                ModeParameterHeader::Long(head) => unsafe {
                    data.write_be_value(head)?;
                    data.write_be_value(block_descriptor)?;
                    data.write_be_value(page)?;
                },
                ModeParameterHeader::Short(head) => unsafe {
                    data.write_be_value(head)?;
                    data.write_be_value(block_descriptor)?;
                    data.write_be_value(page)?;
                },
            }
            Ok(())
        })
        .map_err(|err: Error| TapeError::HardwareError(format!("set_worm - {}", err)))?;

        let cmd = match head {
            ModeParameterHeader::Long(_) => scsi_cmd_mode_select10(data.len() as u16),
            ModeParameterHeader::Short(_) => scsi_cmd_mode_select6(data.len() as u8),
        };

        let mut buffer = alloc_page_aligned_buffer(4096)
            .map_err(|err| TapeError::HardwareError(format!("set_worm - {}", err)))?;
        buffer[..data.len()].copy_from_slice(&data[..]);

        let mut sg_raw = SgRaw::new(&mut self.file, 0)
            .map_err(|err| TapeError::HardwareError(format!("set_worm - {}", err)))?;
        sg_raw.set_timeout(Self::SCSI_TAPE_DEFAULT_TIMEOUT);

        sg_raw
            .do_out_command(&cmd, &buffer[..data.len()])
            .map_err(|err| err.into_tape_error("set_worm"))
    }

    fn read_medium_configuration_page(
        &mut self,
    ) -> Result<
        (
            ModeParameterHeader,
            ModeBlockDescriptor,
            MediumConfigurationModePage,
        ),
        Error,
    > {
        let (head, block_descriptor, page): (_, _, MediumConfigurationModePage) =
            scsi_mode_sense(&mut self.file, false, 0x1d, 0)?;

        proxmox_lang::try_block!({
            if (page.page_code & 0b0011_1111) != 0x1d {
                bail!("wrong page code {}", page.page_code);
            }
            if page.page_length != 0x1e {
                bail!("wrong page length {}", page.page_length);
            }

            let block_descriptor = match block_descriptor {
                Some(block_descriptor) => block_descriptor,
                None => bail!("missing block descriptor"),
            };

            Ok((head, block_descriptor, page))
        })
        .map_err(|err| format_err!("read_medium_configuration failed - {}", err))
    }

    fn read_compression_page(
        &mut self,
    ) -> Result<
        (
            ModeParameterHeader,
            ModeBlockDescriptor,
            DataCompressionModePage,
        ),
        Error,
    > {
        let (head, block_descriptor, page): (_, _, DataCompressionModePage) =
            scsi_mode_sense(&mut self.file, false, 0x0f, 0)?;

        proxmox_lang::try_block!({
            if (page.page_code & 0b0011_1111) != 0x0f {
                bail!("wrong page code {}", page.page_code);
            }
            if page.page_length != 0x0e {
                bail!("wrong page length {}", page.page_length);
            }

            let block_descriptor = match block_descriptor {
                Some(block_descriptor) => block_descriptor,
                None => bail!("missing block descriptor"),
            };

            Ok((head, block_descriptor, page))
        })
        .map_err(|err| format_err!("read_compression_page failed - {}", err))
    }

    /// Read drive options/status
    ///
    /// We read the drive compression page, including the
    /// block_descriptor. This is all information we need for now.
    pub fn read_drive_status(&mut self) -> Result<ScsiDriveStatus, Error> {
        // We do a Request Sense, but ignore the result.
        // This clears deferred error or media changed events.
        let _ = scsi_request_sense(&mut self.file);

        let (head, block_descriptor, page) = self.read_compression_page()?;

        Ok(ScsiDriveStatus {
            block_length: block_descriptor.block_length(),
            write_protect: head.write_protect(),
            buffer_mode: head.buffer_mode(),
            compression: page.compression_enabled(),
            density_code: block_descriptor.density_code,
        })
    }
}

impl Drop for SgTape {
    fn drop(&mut self) {
        // For security reasons, clear the encryption key
        if self.encryption_key_loaded {
            let _ = self.set_encryption(None);
        }
    }
}
