//! `LoadedSound`: an opened WAV file plus its resident first chunk.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffering::{AllocatorHandle, DeviceBuffer};
use crate::error::{Result, WavStreamError};
use crate::format::{
    chunk::{ChunkPlan, ChunkSize},
    parse_header, FormatDescriptor,
};
use crate::output::WaveBuf;

/// A WAV file ready for playback.
///
/// The first chunk ("primer") is read at load time into a device buffer that
/// lives as long as the sound; every play and every loop restart starts from
/// it. Later chunks are read from `file` by the sync worker.
pub struct LoadedSound {
    path: PathBuf,
    format: FormatDescriptor,
    plan: ChunkPlan,
    file: Mutex<File>,
    primer: Mutex<Option<DeviceBuffer>>,
}

impl LoadedSound {
    /// Open `path`, parse its header, size the chunks and read the first one.
    ///
    /// Everything acquired along the way is released again on failure.
    ///
    /// # Errors
    /// `FileNotFound`, any parser error, `InvalidChunkDuration`, `OutOfMemory`,
    /// or `Io` if the first chunk cannot be read.
    pub fn open(path: &Path, size: ChunkSize, allocator: &AllocatorHandle) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => WavStreamError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => WavStreamError::Io(e),
        })?;

        let format = parse_header(&mut file)?;
        let plan = ChunkPlan::new(&format, size)?;

        allocator.ensure_available(plan.chunk_bytes)?;
        let primer = allocator.alloc(plan.chunk_bytes)?;

        let read = {
            let mut mem = primer.write();
            read_at(&mut file, format.data_offset, &mut mem[..])
        };
        match read {
            Ok(n) if n == plan.chunk_bytes => {}
            Ok(n) => {
                allocator.free(primer);
                return Err(WavStreamError::InvalidContainer(format!(
                    "data region ended after {n} of {} bytes",
                    plan.chunk_bytes
                )));
            }
            Err(e) => {
                allocator.free(primer);
                return Err(e.into());
            }
        }

        info!(
            path = %path.display(),
            rate = format.sample_rate,
            channels = format.channels,
            encoding = format.encoding.name(),
            chunk_bytes = plan.chunk_bytes,
            streamed = !plan.whole_file,
            "sound loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            plan,
            file: Mutex::new(file),
            primer: Mutex::new(Some(primer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Whether playback needs background refills.
    pub fn is_streamed(&self) -> bool {
        !self.plan.whole_file
    }

    /// File offset of the first byte not covered by the primer.
    pub fn first_refill_offset(&self) -> u64 {
        self.format.data_offset + self.plan.chunk_bytes as u64
    }

    /// Run `f` with the primer buffer, or return `None` once released.
    pub(crate) fn with_primer<R>(&self, f: impl FnOnce(&DeviceBuffer) -> R) -> Option<R> {
        self.primer.lock().as_ref().map(f)
    }

    /// Wave buffer covering the whole primer.
    pub(crate) fn primer_wave(&self, primer: &DeviceBuffer, looping: bool) -> WaveBuf {
        WaveBuf::new(primer.share(), self.plan.chunk_samples, looping)
    }

    /// Read `len` bytes at absolute file `offset` into `dst`.
    ///
    /// Whatever could not be read is zero-filled, so `dst` always holds
    /// `len` playable bytes. Returns the number of bytes actually read.
    pub(crate) fn read_chunk(&self, offset: u64, dst: &DeviceBuffer, len: usize) -> io::Result<usize> {
        let mut mem = dst.write();
        let len = len.min(mem.len());
        let result = {
            let mut file = self.file.lock();
            read_at(&mut *file, offset, &mut mem[..len])
        };
        let filled = match &result {
            Ok(n) => *n,
            Err(_) => 0,
        };
        mem[filled..len].fill(0);
        result
    }

    /// Return the primer to the pool. Idempotent.
    pub(crate) fn release(&self, allocator: &AllocatorHandle) {
        if let Some(primer) = self.primer.lock().take() {
            allocator.free(primer);
            info!(path = %self.path.display(), "sound unloaded");
        }
    }

    /// Multi-line summary of format, chunking and file size.
    pub fn describe(&self) -> String {
        format!(
            "-- WAV FILE --\n{}\n{}\nFile size:          {} bytes\n-- END --",
            self.format,
            self.plan,
            self.format.data_end()
        )
    }
}

impl Drop for LoadedSound {
    fn drop(&mut self) {
        if self.primer.get_mut().is_some() {
            warn!(path = %self.path.display(), "sound dropped without unload; primer not returned to pool");
        }
    }
}

impl std::fmt::Debug for LoadedSound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedSound")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, dst: &mut [u8]) -> io::Result<usize> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut filled = 0;
    while filled < dst.len() {
        match reader.read(&mut dst[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
