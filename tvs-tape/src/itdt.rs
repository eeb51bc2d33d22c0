//! ITDT tape back-end.
//!
//! Every operation spawns the IBM Tape Diagnostic Tool as a child
//! process with a scoped timeout, reads its output to completion and
//! translates the outcome into the shared error taxonomy. Commands
//! with parseable payloads (`scan`, `qrypos`, `devinfo`) go through a
//! fixed line-oriented grammar; unknown lines are ignored.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};

use tvs_api_types::{ItdtTapeDrive, TapeError, TapePosition};

pub mod parse_output;
pub use parse_output::{parse_devinfo, parse_qrypos, parse_scan_output, ItdtDeviceInfo, ItdtScanEntry};

const ITDT_DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 10);
const ITDT_SHORT_TIMEOUT: Duration = Duration::from_secs(30);
// long running operations (erase, formattape)
const ITDT_FORMAT_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 2);

/// Fixed mapping from ITDT error text onto the taxonomy.
///
/// The first matching substring wins; anything else becomes a
/// hardware-attributed failure carrying the captured text.
fn classify_itdt_error(what: &str, output: &str) -> TapeError {
    let text = output.trim();
    let lower = text.to_lowercase();

    let message = || format!("{} failed - {}", what, text);

    if lower.contains("becoming ready") {
        return TapeError::NotReady {
            message: message(),
            becoming_ready: true,
        };
    }
    if lower.contains("device not ready") || lower.contains("not ready") {
        return TapeError::NotReady {
            message: message(),
            becoming_ready: false,
        };
    }
    if lower.contains("medium not present") || lower.contains("no medium") {
        return TapeError::NotReady {
            message: message(),
            becoming_ready: false,
        };
    }
    if lower.contains("write protect") {
        return TapeError::WriteProtected;
    }
    if lower.contains("end of medium") || lower.contains("eom reached") {
        return TapeError::EndOfMedium;
    }
    if lower.contains("invalid command") || lower.contains("not supported") {
        return TapeError::InvalidCommand(message());
    }
    if lower.contains("medium error") {
        return TapeError::MediumError(message());
    }
    if lower.contains("no such device")
        || lower.contains("cannot open")
        || lower.contains("open failed")
    {
        return TapeError::DeviceUnavailable(message());
    }

    TapeError::HardwareError(message())
}

fn read_to_string_thread<R: Read + Send + 'static>(
    reader: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_string(&mut buffer);
        }
        buffer
    })
}

// Wait for the child within the deadline; kill it on expiry.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> Result<std::process::ExitStatus, TapeError> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TapeError::Timeout(format!(
                        "itdt did not finish within {} s",
                        timeout.as_secs()
                    )));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                return Err(TapeError::DeviceUnavailable(format!(
                    "wait for itdt failed - {}",
                    err
                )))
            }
        }
    }
}

fn run_itdt(
    itdt_path: &str,
    what: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, TapeError> {
    let mut command = Command::new(itdt_path);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    log::debug!("running {} {}", itdt_path, args.join(" "));

    let mut child = command.spawn().map_err(|err| {
        TapeError::DeviceUnavailable(format!("spawn of '{}' failed - {}", itdt_path, err))
    })?;

    let stdout_handle = read_to_string_thread(child.stdout.take());
    let stderr_handle = read_to_string_thread(child.stderr.take());

    let status = wait_with_deadline(&mut child, timeout)?;

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    if !status.success() {
        let output = if stderr.trim().is_empty() {
            &stdout
        } else {
            &stderr
        };
        return Err(classify_itdt_error(what, output));
    }

    Ok(stdout)
}

/// Run `itdt scan` and return the parsed device list.
pub fn itdt_scan(itdt_path: &str) -> Result<Vec<ItdtScanEntry>, Error> {
    let output = run_itdt(itdt_path, "scan", &["scan"], ITDT_SHORT_TIMEOUT)
        .map_err(|err| format_err!("{}", err))?;
    parse_scan_output(&output)
}

/// A tape drive driven through the external ITDT binary.
pub struct ItdtTape {
    itdt_path: String,
    device: String,
    work_mode: Option<u64>,
}

impl ItdtTape {
    pub fn open(config: &ItdtTapeDrive) -> Self {
        Self {
            itdt_path: config
                .itdt_path
                .clone()
                .unwrap_or_else(|| "/usr/bin/itdt".to_string()),
            device: config.device.clone(),
            work_mode: config.work_mode,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn run(&self, what: &str, subcommand: &[&str], timeout: Duration) -> Result<String, TapeError> {
        let work_mode;
        let mut args: Vec<&str> = vec!["-f", &self.device];
        if let Some(mode) = self.work_mode {
            work_mode = mode.to_string();
            args.push("-w");
            args.push(&work_mode);
        }
        args.extend_from_slice(subcommand);

        run_itdt(&self.itdt_path, what, &args, timeout)
    }

    pub fn test_unit_ready(&mut self) -> Result<(), TapeError> {
        self.run("tur", &["tur"], ITDT_SHORT_TIMEOUT).map(|_| ())
    }

    pub fn load(&mut self) -> Result<(), TapeError> {
        self.run("load", &["load"], ITDT_DEFAULT_TIMEOUT).map(|_| ())
    }

    pub fn unload(&mut self) -> Result<(), TapeError> {
        self.run("unload", &["unload"], ITDT_DEFAULT_TIMEOUT)
            .map(|_| ())
    }

    pub fn rewind(&mut self) -> Result<(), TapeError> {
        self.run("rewind", &["rewind"], ITDT_DEFAULT_TIMEOUT)
            .map(|_| ())
    }

    pub fn erase(&mut self, fast: bool) -> Result<(), TapeError> {
        if fast {
            self.run("erase", &["erase", "-short"], ITDT_DEFAULT_TIMEOUT)
        } else {
            self.run("erase", &["erase"], ITDT_FORMAT_TIMEOUT)
        }
        .map(|_| ())
    }

    pub fn format_tape(&mut self, immediate: bool, verify: bool) -> Result<(), TapeError> {
        let mut args = vec!["formattape"];
        if immediate {
            args.push("-immed");
        }
        if verify {
            args.push("-verify");
        }
        let timeout = if immediate {
            ITDT_DEFAULT_TIMEOUT
        } else {
            ITDT_FORMAT_TIMEOUT
        };
        self.run("formattape", &args, timeout).map(|_| ())
    }

    pub fn write_file(&mut self, local_path: &str) -> Result<(), TapeError> {
        self.run("write", &["write", "-s", local_path], ITDT_FORMAT_TIMEOUT)
            .map(|_| ())
    }

    pub fn read_file(&mut self, local_path: &str, count: Option<u64>) -> Result<(), TapeError> {
        let count_text;
        let mut args = vec!["read", "-d", local_path];
        if let Some(count) = count {
            count_text = count.to_string();
            args.push("-c");
            args.push(&count_text);
        }
        self.run("read", &args, ITDT_FORMAT_TIMEOUT).map(|_| ())
    }

    pub fn write_filemarks(&mut self, count: usize) -> Result<(), TapeError> {
        let count_text = count.to_string();
        self.run("weof", &["weof", &count_text], ITDT_DEFAULT_TIMEOUT)
            .map(|_| ())
    }

    pub fn space_filemarks(&mut self, count: isize) -> Result<(), TapeError> {
        let (subcommand, count) = if count >= 0 {
            ("fsf", count as u64)
        } else {
            ("bsf", (-count) as u64)
        };
        let count_text = count.to_string();
        self.run(subcommand, &[subcommand, &count_text], ITDT_DEFAULT_TIMEOUT)
            .map(|_| ())
    }

    pub fn space_records(&mut self, count: isize) -> Result<(), TapeError> {
        let (subcommand, count) = if count >= 0 {
            ("fsr", count as u64)
        } else {
            ("bsr", (-count) as u64)
        };
        let count_text = count.to_string();
        self.run(subcommand, &[subcommand, &count_text], ITDT_DEFAULT_TIMEOUT)
            .map(|_| ())
    }

    pub fn position(&mut self) -> Result<TapePosition, TapeError> {
        let output = self.run("qrypos", &["qrypos"], ITDT_SHORT_TIMEOUT)?;
        parse_qrypos(&output).map_err(|err| {
            TapeError::HardwareError(format!("decode qrypos output failed - {}", err))
        })
    }

    pub fn device_info(&mut self) -> Result<ItdtDeviceInfo, TapeError> {
        let output = self.run("devinfo", &["devinfo"], ITDT_SHORT_TIMEOUT)?;
        parse_devinfo(&output).map_err(|err| {
            TapeError::HardwareError(format!("decode devinfo output failed - {}", err))
        })
    }

    /// Raw inquiry page dump (diagnostic passthrough).
    pub fn inquiry(&mut self, page: Option<u8>) -> Result<String, TapeError> {
        let page_text;
        let mut args = vec!["inquiry"];
        if let Some(page) = page {
            page_text = page.to_string();
            args.push(&page_text);
        }
        self.run("inquiry", &args, ITDT_SHORT_TIMEOUT)
    }

    /// Raw log sense dump (diagnostic passthrough, stored unparsed).
    pub fn logsense(&mut self) -> Result<String, TapeError> {
        self.run("logsense", &["logsense"], ITDT_DEFAULT_TIMEOUT)
    }

    /// Raw vital product data dump (diagnostic passthrough).
    pub fn vpd(&mut self) -> Result<String, TapeError> {
        self.run("vpd", &["vpd"], ITDT_SHORT_TIMEOUT)
    }

    /// Path/link status of the device (diagnostic passthrough).
    pub fn qrypath(&mut self) -> Result<String, TapeError> {
        self.run("qrypath", &["qrypath"], ITDT_SHORT_TIMEOUT)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tvs_api_types::ErrorKind;

    #[test]
    fn test_error_classification() {
        let check = |output: &str, kind: ErrorKind| {
            let err = classify_itdt_error("tur", output);
            assert_eq!(err.kind(), kind, "output '{}'", output);
        };

        check("Device not ready!", ErrorKind::NotReady);
        check("Medium not present", ErrorKind::NotReady);
        check("Tape is Write Protected.", ErrorKind::WriteProtected);
        check("Invalid command operation code", ErrorKind::InvalidCommand);
        check("Medium Error detected", ErrorKind::MediumError);
        check("cannot open /dev/nst7", ErrorKind::DeviceUnavailable);
        check("End of medium reached", ErrorKind::EndOfMedium);
        check("frobnication failure", ErrorKind::HardwareError);
    }

    #[test]
    fn test_becoming_ready_is_transient() {
        let err = classify_itdt_error("tur", "Device in process of becoming ready");
        assert!(err.is_transient());

        let err = classify_itdt_error("tur", "Medium not present");
        assert!(!err.is_transient());
    }
}
