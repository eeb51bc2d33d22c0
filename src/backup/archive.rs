//! Streaming tar archive writer.
//!
//! Produces a POSIX tar stream (optionally gzip compressed) into a
//! file on the mounted LTFS volume. Memory stays bounded (one copy
//! buffer), entry order is stable (walk order sorted by file name),
//! and the byte/file counters are updated on every destination write.

use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tvs_api_types::TapeError;

use crate::backup::{TaskControl, TaskProgress};

struct CountingWriter<W> {
    inner: W,
    progress: Arc<TaskProgress>,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W, progress: Arc<TaskProgress>) -> Self {
        Self { inner, progress }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.progress.add_bytes(written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// File reader that honors the cancellation token on every chunk, so a
// cancel request interrupts even multi-gigabyte entries quickly.
struct CancelableReader<R> {
    inner: R,
    control: Arc<TaskControl>,
}

impl<R: Read> Read for CancelableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.control.abort_requested() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "task cancelled",
            ));
        }
        self.inner.read(buf)
    }
}

/// Streams an ordered list of source roots into one tar archive.
pub struct ArchiveWriter {
    source_roots: Vec<PathBuf>,
    destination: PathBuf,
    compress: bool,
    progress: Arc<TaskProgress>,
    control: Arc<TaskControl>,
}

/// Map a destination I/O failure onto the taxonomy.
///
/// A full LTFS volume surfaces as ENOSPC from file I/O, which is the
/// physical end-of-medium for the archive path.
fn classify_io_error(err: std::io::Error, control: &TaskControl) -> TapeError {
    if control.abort_requested() {
        return TapeError::Cancelled;
    }
    if err.raw_os_error() == Some(libc::ENOSPC) {
        return TapeError::EndOfMedium;
    }
    TapeError::MediumError(format!("archive write failed - {}", err))
}

impl ArchiveWriter {
    pub fn new(
        source_roots: &[String],
        destination: &Path,
        compress: bool,
        progress: Arc<TaskProgress>,
        control: Arc<TaskControl>,
    ) -> Self {
        Self {
            source_roots: source_roots.iter().map(PathBuf::from).collect(),
            destination: destination.to_owned(),
            compress,
            progress,
            control,
        }
    }

    /// Write the archive.
    ///
    /// On any error the destination file is flushed and closed before
    /// the error is returned unchanged; there is no in-place recovery.
    pub fn run(self) -> Result<(), TapeError> {
        let file = std::fs::File::create(&self.destination)
            .map_err(|err| classify_io_error(err, &self.control))?;
        let writer = CountingWriter::new(file, Arc::clone(&self.progress));

        let result = if self.compress {
            let encoder =
                flate2::write::GzEncoder::new(writer, flate2::Compression::default());
            match self.write_entries(encoder) {
                Ok(encoder) => encoder
                    .finish()
                    .map(|_| ())
                    .map_err(|err| classify_io_error(err, &self.control)),
                Err(err) => Err(err),
            }
        } else {
            match self.write_entries(writer) {
                Ok(mut writer) => writer
                    .flush()
                    .map_err(|err| classify_io_error(err, &self.control)),
                Err(err) => Err(err),
            }
        };

        // dropping the writer stack closed the destination on the
        // error path as well
        result
    }

    fn write_entries<W: Write>(&self, writer: W) -> Result<W, TapeError> {
        let mut builder = tar::Builder::new(writer);
        builder.mode(tar::HeaderMode::Complete);
        builder.follow_symlinks(false);

        for root in &self.source_roots {
            self.append_root(&mut builder, root)?;
        }

        let mut writer = builder
            .into_inner()
            .map_err(|err| classify_io_error(err, &self.control))?;
        writer
            .flush()
            .map_err(|err| classify_io_error(err, &self.control))?;

        Ok(writer)
    }

    fn append_root<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        root: &Path,
    ) -> Result<(), TapeError> {
        let walker = walkdir::WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name();

        let root_name = root
            .file_name()
            .map(|name| PathBuf::from(name))
            .unwrap_or_else(|| PathBuf::from("."));

        for entry in walker {
            // stable cancellation point between files
            self.control.check_abort()?;

            let entry = entry.map_err(|err| {
                TapeError::MediumError(format!("walking {:?} failed - {}", root, err))
            })?;

            let path = entry.path();
            let archive_path = if path == root {
                root_name.clone()
            } else {
                match path.strip_prefix(root) {
                    Ok(relative) => root_name.join(relative),
                    Err(_) => continue,
                }
            };

            let file_type = entry.file_type();

            if file_type.is_dir() {
                builder
                    .append_path_with_name(path, &archive_path)
                    .map_err(|err| classify_io_error(err, &self.control))?;
            } else if file_type.is_symlink() {
                builder
                    .append_path_with_name(path, &archive_path)
                    .map_err(|err| classify_io_error(err, &self.control))?;
                self.progress.add_file();
            } else if file_type.is_file() {
                self.append_file(builder, path, &archive_path)?;
                self.progress.add_file();
            } else {
                // device nodes, sockets and FIFOs are not archived
                log::warn!(
                    "skipping special file {:?}",
                    String::from_utf8_lossy(path.as_os_str().as_bytes())
                );
            }
        }

        Ok(())
    }

    fn append_file<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        path: &Path,
        archive_path: &Path,
    ) -> Result<(), TapeError> {
        let file = std::fs::File::open(path).map_err(|err| {
            TapeError::MediumError(format!("open source file {:?} failed - {}", path, err))
        })?;
        let metadata = file.metadata().map_err(|err| {
            TapeError::MediumError(format!("stat source file {:?} failed - {}", path, err))
        })?;

        let mut header = tar::Header::new_ustar();
        header.set_metadata_in_mode(&metadata, tar::HeaderMode::Complete);

        let reader = CancelableReader {
            inner: file,
            control: Arc::clone(&self.control),
        };

        builder
            .append_data(&mut header, archive_path, reader)
            .map_err(|err| classify_io_error(err, &self.control))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct TestDir(PathBuf);

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn test_dir(name: &str) -> TestDir {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "tapevault-archive-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        TestDir(path)
    }

    fn run_writer(
        roots: &[String],
        destination: &Path,
        compress: bool,
    ) -> (Result<(), TapeError>, Arc<TaskProgress>) {
        let progress = TaskProgress::new();
        let control = TaskControl::new();
        let writer = ArchiveWriter::new(
            roots,
            destination,
            compress,
            Arc::clone(&progress),
            control,
        );
        (writer.run(), progress)
    }

    #[test]
    fn test_empty_file_entry() {
        let dir = test_dir("empty");
        let source = dir.0.join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("empty.bin"), b"").unwrap();

        let destination = dir.0.join("archive.tar");
        let (result, progress) = run_writer(
            &[source.display().to_string()],
            &destination,
            false,
        );
        result.unwrap();

        // directory header + empty file header + trailer blocks
        assert!(progress.bytes_written() >= 512);
        assert_eq!(progress.files_written(), 1);

        // the archive must list the entry with size 0
        let file = std::fs::File::open(&destination).unwrap();
        let mut archive = tar::Archive::new(file);
        let sizes: Vec<u64> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().header().size().unwrap())
            .collect();
        assert!(sizes.contains(&0));
    }

    #[test]
    fn test_counters_and_content() {
        let dir = test_dir("content");
        let source = dir.0.join("source");
        std::fs::create_dir_all(source.join("sub")).unwrap();
        std::fs::write(source.join("one.bin"), vec![0x42u8; 1024 * 1024]).unwrap();
        std::fs::write(source.join("sub/two.txt"), b"hello").unwrap();

        let destination = dir.0.join("archive.tar");
        let (result, progress) = run_writer(
            &[source.display().to_string()],
            &destination,
            false,
        );
        result.unwrap();

        assert_eq!(progress.files_written(), 2);
        assert!(progress.bytes_written() > 1024 * 1024);

        let file = std::fs::File::open(&destination).unwrap();
        let mut archive = tar::Archive::new(file);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .display()
                    .to_string()
            })
            .collect();

        // paths are stored relative to the source root
        assert!(names.iter().any(|name| name == "source/one.bin"));
        assert!(names.iter().any(|name| name == "source/sub/two.txt"));
    }

    #[test]
    fn test_symlink_preserved() {
        let dir = test_dir("symlink");
        let source = dir.0.join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("target.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("target.txt", source.join("link")).unwrap();

        let destination = dir.0.join("archive.tar");
        let (result, _) = run_writer(&[source.display().to_string()], &destination, false);
        result.unwrap();

        let file = std::fs::File::open(&destination).unwrap();
        let mut archive = tar::Archive::new(file);
        let mut found_link = false;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.header().entry_type() == tar::EntryType::Symlink {
                assert_eq!(
                    entry.link_name().unwrap().unwrap().display().to_string(),
                    "target.txt"
                );
                found_link = true;
            }
        }
        assert!(found_link);
    }

    #[test]
    fn test_cancellation() {
        let dir = test_dir("cancel");
        let source = dir.0.join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("one.bin"), vec![0u8; 4096]).unwrap();

        let progress = TaskProgress::new();
        let control = TaskControl::new();
        control.request_abort();

        let destination = dir.0.join("archive.tar");
        let writer = ArchiveWriter::new(
            &[source.display().to_string()],
            &destination,
            false,
            progress,
            control,
        );

        match writer.run() {
            Err(TapeError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }

        // destination was created and closed (possibly partial)
        assert!(destination.exists());
    }

    #[test]
    fn test_gzip_archive() {
        let dir = test_dir("gzip");
        let source = dir.0.join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("zeros.bin"), vec![0u8; 256 * 1024]).unwrap();

        let destination = dir.0.join("archive.tar.gz");
        let (result, progress) = run_writer(
            &[source.display().to_string()],
            &destination,
            true,
        );
        result.unwrap();

        // compressed output of a zero run stays far below the input
        let compressed = std::fs::metadata(&destination).unwrap().len();
        assert!(compressed < 64 * 1024);
        assert_eq!(progress.bytes_written(), compressed);

        let file = std::fs::File::open(&destination).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        assert!(archive.entries().unwrap().count() >= 1);
    }
}
