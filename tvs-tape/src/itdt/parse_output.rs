//! Parsers for ITDT output.
//!
//! ITDT prints human readable text; each payload-producing subcommand
//! gets one parser with a fixed grammar. Lines that do not match are
//! skipped (logged at debug), unknown keys are ignored.

use anyhow::{bail, Error};

use nom::bytes::complete::{tag, take_while, take_while1};

use tvs_api_types::TapePosition;

use tvs_tools::nom::{
    multispace0, multispace1, parse_complete_line, parse_error, parse_u32, parse_u64, IResult,
};

/// One device line from `itdt scan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItdtScanEntry {
    pub index: u64,
    /// Device special file (e.g. `/dev/sg0`)
    pub device_file: String,
    pub product_id: String,
    pub firmware: String,
    pub serial: String,
    /// SCSI address: host, bus, target, lun
    pub scsi_addr: (u32, u32, u32, u32),
    /// Serial of an attached changer, if the device reports one
    pub changer_serial: Option<String>,
    /// True for `IBM-Device` entries, false for `Generic-Device`
    pub ibm_device: bool,
}

/// Typed result of `itdt devinfo`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ItdtDeviceInfo {
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub serial: String,
}

fn bracketed(i: &str) -> IResult<&str, &str> {
    let (i, _) = tag("[")(i)?;
    let (i, inner) = take_while(|c| c != ']')(i)?;
    let (i, _) = tag("]")(i)?;
    Ok((i, inner))
}

// Recognizes: #N <device-file> - [<product-id>]-[<firmware>]
//             S/N:<serial> H<h>-B<b>-T<t>-L<l> [Changer:<chgsn>]
//             (IBM-Device|Generic-Device)
fn parse_scan_line(i: &str) -> IResult<&str, ItdtScanEntry> {
    let (i, _) = multispace0(i)?;
    let (i, _) = tag("#")(i)?;
    let (i, index) = parse_u64(i)?;
    let (i, _) = multispace1(i)?;
    let (i, device_file) = take_while1(|c| !(c == ' ' || c == '\t'))(i)?;
    let (i, _) = multispace1(i)?;
    let (i, _) = tag("-")(i)?;
    let (i, _) = multispace1(i)?;
    let (i, product_id) = bracketed(i)?;
    let (i, _) = tag("-")(i)?;
    let (i, firmware) = bracketed(i)?;
    let (i, _) = multispace1(i)?;
    let (i, _) = tag("S/N:")(i)?;
    let (i, serial) = take_while1(|c| !(c == ' ' || c == '\t'))(i)?;
    let (i, _) = multispace1(i)?;
    let (i, _) = tag("H")(i)?;
    let (i, host) = parse_u32(i)?;
    let (i, _) = tag("-B")(i)?;
    let (i, bus) = parse_u32(i)?;
    let (i, _) = tag("-T")(i)?;
    let (i, target) = parse_u32(i)?;
    let (i, _) = tag("-L")(i)?;
    let (i, lun) = parse_u32(i)?;
    let (i, _) = multispace1(i)?;

    let (i, changer_serial) = if let Some(rest) = i.strip_prefix("Changer:") {
        let (rest, changer) = take_while1(|c| !(c == ' ' || c == '\t'))(rest)?;
        let (rest, _) = multispace1(rest)?;
        (rest, Some(changer.to_string()))
    } else {
        (i, None)
    };

    let (i, ibm_device) = if let Some(rest) = i.strip_prefix("(IBM-Device)") {
        (rest, true)
    } else if let Some(rest) = i.strip_prefix("(Generic-Device)") {
        (rest, false)
    } else {
        return Err(parse_error(i, "expected device class marker"));
    };

    let (i, _) = multispace0(i)?;

    let entry = ItdtScanEntry {
        index,
        device_file: device_file.to_string(),
        product_id: product_id.trim().to_string(),
        firmware: firmware.trim().to_string(),
        serial: serial.to_string(),
        scsi_addr: (host, bus, target, lun),
        changer_serial,
        ibm_device,
    };

    Ok((i, entry))
}

/// Parses the output of `itdt scan`. Unknown lines are ignored.
pub fn parse_scan_output(output: &str) -> Result<Vec<ItdtScanEntry>, Error> {
    let mut list = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('#') {
            continue;
        }
        match parse_complete_line("itdt scan line", trimmed, parse_scan_line) {
            Ok(entry) => list.push(entry),
            Err(err) => {
                log::debug!("ignoring unparseable itdt scan line '{}': {}", trimmed, err);
            }
        }
    }

    Ok(list)
}

// Recognizes one "<label>....... <value>" line; returns (label, value).
fn split_dotted_line(line: &str) -> Option<(&str, &str)> {
    let dots = line.find("..")?;
    let label = line[..dots].trim();
    let value = line[dots..].trim_start_matches('.').trim();
    if label.is_empty() {
        return None;
    }
    Some((label, value))
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parses the output of `itdt qrypos`.
pub fn parse_qrypos(output: &str) -> Result<TapePosition, Error> {
    let mut partition = None;
    let mut logical_block = None;
    let mut at_bop = false;
    let mut at_eop = false;

    for line in output.lines() {
        let (label, value) = match split_dotted_line(line) {
            Some(found) => found,
            None => continue,
        };

        match label {
            "Partition Number" => {
                partition = Some(value.parse::<u32>()?);
            }
            "Tape Logical Position" | "Logical Block" => {
                logical_block = Some(value.parse::<u64>()?);
            }
            "BOP" => {
                at_bop = parse_bool_value(value).unwrap_or(false);
            }
            "EOP" => {
                at_eop = parse_bool_value(value).unwrap_or(false);
            }
            other => {
                log::debug!("ignoring unknown qrypos field '{}'", other);
            }
        }
    }

    match (partition, logical_block) {
        (Some(partition), Some(logical_block)) => Ok(TapePosition {
            partition,
            logical_block,
            at_bop: at_bop || logical_block == 0,
            at_eop,
        }),
        _ => bail!("missing position fields in qrypos output"),
    }
}

/// Parses the output of `itdt devinfo`.
pub fn parse_devinfo(output: &str) -> Result<ItdtDeviceInfo, Error> {
    let mut info = ItdtDeviceInfo::default();

    for line in output.lines() {
        let (label, value) = match split_dotted_line(line) {
            Some(found) => found,
            None => continue,
        };

        match label {
            "Vendor ID" => info.vendor = value.to_string(),
            "Product ID" => info.product = value.to_string(),
            "Product Rev" | "Firmware Revision" => info.revision = value.to_string(),
            "Serial Number" => info.serial = value.to_string(),
            other => {
                log::debug!("ignoring unknown devinfo field '{}'", other);
            }
        }
    }

    if info.product.is_empty() {
        bail!("missing 'Product ID' in devinfo output");
    }

    Ok(info)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scan_output() -> Result<(), Error> {
        let output = r###"Scanning SCSI Bus ...
#0 /dev/sg0 - [ULT3580-TD6]-[G9Q1] S/N:1013000655 H5-B0-T0-L0 (IBM-Device)
#1 /dev/sg1 - [ULT3580-TD9]-[Q3F2] S/N:1013000656 H5-B0-T1-L0 Changer:DE0FC02983 (IBM-Device)
#2 /dev/sg2 - [Ultrium 8-SCSI]-[Y8A3] S/N:HU1851A0CJ H6-B0-T0-L0 (Generic-Device)
some trailing status line
"###;

        let list = parse_scan_output(output)?;
        assert_eq!(list.len(), 3);

        assert_eq!(list[0].device_file, "/dev/sg0");
        assert_eq!(list[0].product_id, "ULT3580-TD6");
        assert_eq!(list[0].firmware, "G9Q1");
        assert_eq!(list[0].serial, "1013000655");
        assert_eq!(list[0].scsi_addr, (5, 0, 0, 0));
        assert_eq!(list[0].changer_serial, None);
        assert!(list[0].ibm_device);

        assert_eq!(list[1].changer_serial.as_deref(), Some("DE0FC02983"));
        assert_eq!(list[1].scsi_addr, (5, 0, 1, 0));

        assert!(!list[2].ibm_device);
        assert_eq!(list[2].product_id, "Ultrium 8-SCSI");

        Ok(())
    }

    #[test]
    fn test_qrypos_output() -> Result<(), Error> {
        let output = r###"Querying tape position ...
Partition Number.............. 0
Tape Logical Position......... 4711
BOP........................... No
EOP........................... No
Blocks in Buffer.............. 0
Exit with code: 0
"###;

        let pos = parse_qrypos(output)?;
        assert_eq!(pos.partition, 0);
        assert_eq!(pos.logical_block, 4711);
        assert!(!pos.at_bop);
        assert!(!pos.at_eop);

        Ok(())
    }

    #[test]
    fn test_qrypos_bop() -> Result<(), Error> {
        let output = r###"Partition Number.............. 0
Tape Logical Position......... 0
BOP........................... Yes
"###;

        let pos = parse_qrypos(output)?;
        assert!(pos.at_bop);
        assert_eq!(pos.logical_block, 0);

        Ok(())
    }

    #[test]
    fn test_devinfo_output() -> Result<(), Error> {
        let output = r###"Reading device information ...
Vendor ID..................... IBM
Product ID.................... ULT3580-TD6
Product Rev................... G9Q1
Serial Number................. 1013000655
Device Type................... Sequential Access Device
"###;

        let info = parse_devinfo(output)?;
        assert_eq!(info.vendor, "IBM");
        assert_eq!(info.product, "ULT3580-TD6");
        assert_eq!(info.revision, "G9Q1");
        assert_eq!(info.serial, "1013000655");

        Ok(())
    }

    #[test]
    fn test_devinfo_missing_product() {
        assert!(parse_devinfo("Exit with code: 0\n").is_err());
    }
}
