// SPDX-License-Identifier: MPL-2.0

use log::{debug, error};
use xsan_reactor::{BdevDesc, DmaBuf, IoChannel, Reactor};
use xsan_types::{DiskId, Errno, Error, Result, VolumeId};

/// Direction of one I/O request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoDirection {
    Read,
    Write,
}

enum Completion {
    Read(Box<dyn FnOnce(Result<Vec<u8>>)>),
    Write(Box<dyn FnOnce(Result<()>)>),
}

/// The per-operation context of the async I/O pipeline.
///
/// An `IoRequest` lives for exactly one asynchronous operation: it tracks
/// the target device, the DMA buffer and the descriptor/channel it uses
/// (and whether it owns them), and the user completion. The request is
/// consumed by [`submit_to_bdev`] and destroyed after its completion runs.
pub struct IoRequest {
    /// Volume this request serves, or nil for raw device I/O.
    pub volume_id: VolumeId,
    /// Disk resolved by the volume manager, or nil for raw device I/O.
    pub disk_id: DiskId,
    pub bdev_name: String,
    pub direction: IoDirection,
    /// Offset on the target device, in physical blocks.
    pub offset_blocks: u64,
    pub num_blocks: u32,
    /// Physical block size of the target device for this I/O.
    pub block_size: u32,
    pub length_bytes: u64,

    write_data: Option<Vec<u8>>,
    dma: Option<DmaBuf>,
    dma_is_internal: bool,
    desc: Option<BdevDesc>,
    channel: Option<IoChannel>,
    completion: Option<Completion>,
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("volume_id", &self.volume_id)
            .field("disk_id", &self.disk_id)
            .field("bdev_name", &self.bdev_name)
            .field("direction", &self.direction)
            .field("offset_blocks", &self.offset_blocks)
            .field("num_blocks", &self.num_blocks)
            .field("block_size", &self.block_size)
            .field("length_bytes", &self.length_bytes)
            .finish_non_exhaustive()
    }
}

impl IoRequest {
    /// Builds a read request; the completion receives the data read.
    ///
    /// `offset_bytes` and `length_bytes` must be multiples of `block_size`.
    pub fn read(
        volume_id: VolumeId,
        disk_id: DiskId,
        bdev_name: impl Into<String>,
        offset_bytes: u64,
        length_bytes: u64,
        block_size: u32,
        completion: impl FnOnce(Result<Vec<u8>>) + 'static,
    ) -> Result<Box<IoRequest>> {
        Self::build(
            volume_id,
            disk_id,
            bdev_name.into(),
            offset_bytes,
            length_bytes,
            block_size,
            IoDirection::Read,
            None,
            None,
            Completion::Read(Box::new(completion)),
        )
    }

    /// Builds a write request, copying `data` into the request.
    pub fn write(
        volume_id: VolumeId,
        disk_id: DiskId,
        bdev_name: impl Into<String>,
        offset_bytes: u64,
        block_size: u32,
        data: &[u8],
        completion: impl FnOnce(Result<()>) + 'static,
    ) -> Result<Box<IoRequest>> {
        Self::build(
            volume_id,
            disk_id,
            bdev_name.into(),
            offset_bytes,
            data.len() as u64,
            block_size,
            IoDirection::Write,
            Some(data.to_vec()),
            None,
            Completion::Write(Box::new(completion)),
        )
    }

    /// Builds a write request around a caller-provided DMA buffer, skipping
    /// the pipeline's internal allocation and copy.
    pub fn write_from_dma(
        volume_id: VolumeId,
        disk_id: DiskId,
        bdev_name: impl Into<String>,
        offset_bytes: u64,
        length_bytes: u64,
        block_size: u32,
        dma: DmaBuf,
        completion: impl FnOnce(Result<()>) + 'static,
    ) -> Result<Box<IoRequest>> {
        if dma.len() < length_bytes as usize {
            return Err(Error::with_msg(
                Errno::InvalidSize,
                "dma buffer smaller than io length",
            ));
        }
        Self::build(
            volume_id,
            disk_id,
            bdev_name.into(),
            offset_bytes,
            length_bytes,
            block_size,
            IoDirection::Write,
            None,
            Some(dma),
            Completion::Write(Box::new(completion)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        volume_id: VolumeId,
        disk_id: DiskId,
        bdev_name: String,
        offset_bytes: u64,
        length_bytes: u64,
        block_size: u32,
        direction: IoDirection,
        write_data: Option<Vec<u8>>,
        dma: Option<DmaBuf>,
        completion: Completion,
    ) -> Result<Box<IoRequest>> {
        if length_bytes == 0 || block_size == 0 {
            return Err(Error::with_msg(Errno::InvalidArgs, "zero-length io"));
        }
        if offset_bytes % block_size as u64 != 0 || length_bytes % block_size as u64 != 0 {
            return Err(Error::with_msg(
                Errno::InvalidArgs,
                "offset and length must be block aligned",
            ));
        }
        let dma_is_internal = dma.is_none();
        Ok(Box::new(IoRequest {
            volume_id,
            disk_id,
            bdev_name,
            direction,
            offset_blocks: offset_bytes / block_size as u64,
            num_blocks: (length_bytes / block_size as u64) as u32,
            block_size,
            length_bytes,
            write_data,
            dma,
            dma_is_internal,
            desc: None,
            channel: None,
            completion: Some(completion),
        }))
    }

    /// Reuses an already-open descriptor and channel; the request will not
    /// acquire or release its own.
    pub fn with_channel(mut self: Box<Self>, desc: BdevDesc, channel: IoChannel) -> Box<Self> {
        self.desc = Some(desc);
        self.channel = Some(channel);
        self
    }

    fn complete(mut self: Box<Self>, status: Result<()>) {
        // Owned descriptor, channel and DMA buffer are released when the
        // request drops, right after the callback returns.
        let data = match (&status, self.direction) {
            (Ok(()), IoDirection::Read) if self.dma_is_internal => {
                let dma = self.dma.as_ref();
                dma.map(|buf| buf.as_slice()[..self.length_bytes as usize].to_vec())
            }
            _ => None,
        };
        match self.completion.take() {
            Some(Completion::Read(callback)) => {
                callback(status.and_then(|()| data.ok_or(Error::new(Errno::IoFailed))))
            }
            Some(Completion::Write(callback)) => callback(status),
            None => error!("io request completed twice"),
        }
    }
}

/// Submits one request to its target block device.
///
/// On a submission-time failure the error is returned *and* the user
/// completion is invoked with the same status, exactly once, after any
/// internally acquired resources have been released.
pub fn submit_to_bdev(mut request: Box<IoRequest>) -> Result<()> {
    let reactor = match Reactor::current() {
        Ok(reactor) => reactor,
        Err(err) => return fail_submission(request, err),
    };

    // Step 1: the device must still exist.
    let Some(info) = reactor.bdev_info(&request.bdev_name) else {
        return fail_submission(request, Error::new(Errno::DeviceNotFound));
    };

    // Step 2: acquire descriptor and channel unless the caller provided
    // them.
    if request.desc.is_none() {
        match reactor.open_bdev(&request.bdev_name) {
            Ok(desc) => {
                request.channel = Some(desc.io_channel());
                request.desc = Some(desc);
            }
            Err(err) => return fail_submission(request, err),
        }
    } else if request.channel.is_none() {
        if let Some(desc) = request.desc.as_ref() {
            request.channel = Some(desc.io_channel());
        }
    }

    // Step 3: the request length must equal the physical I/O size.
    let physical_io = request.num_blocks as u64 * info.block_size as u64;
    if request.length_bytes != physical_io || request.block_size != info.block_size {
        return fail_submission(request, Error::with_msg(
            Errno::InvalidSize,
            "request length does not match physical io size",
        ));
    }

    // Step 4: make sure the data sits in a DMA-safe buffer.
    if request.dma.is_none() {
        let mut dma = match DmaBuf::alloc(physical_io as usize, info.buf_align) {
            Ok(dma) => dma,
            Err(err) => return fail_submission(request, err),
        };
        if request.direction == IoDirection::Write {
            let Some(data) = request.write_data.take() else {
                return fail_submission(
                    request,
                    Error::with_msg(Errno::InvalidArgs, "write request without data"),
                );
            };
            dma.as_mut_slice()[..data.len()].copy_from_slice(&data);
        }
        request.dma = Some(dma);
        request.dma_is_internal = true;
    }

    // Step 5: hand the DMA buffer to the device with the completion
    // trampoline. Validating here keeps ownership of the request on the
    // failure path; afterwards the channel call cannot fail synchronously.
    let Some(channel) = request.channel.take() else {
        return fail_submission(request, Error::new(Errno::IoFailed));
    };
    let dma_len = request.dma.as_ref().map(DmaBuf::len).unwrap_or(0);
    if let Err(err) = channel.validate_io(request.offset_blocks, request.num_blocks, dma_len) {
        return fail_submission(request, err);
    }
    let Some(dma) = request.dma.take() else {
        return fail_submission(request, Error::new(Errno::IoFailed));
    };

    let direction = request.direction;
    let offset_blocks = request.offset_blocks;
    let num_blocks = request.num_blocks;
    let trampoline = move |status: Result<()>, dma: DmaBuf| {
        let mut request = request;
        request.dma = Some(dma);
        debug!(
            "bdev '{}': {:?} of {} blocks at {} completed (ok={})",
            request.bdev_name,
            request.direction,
            request.num_blocks,
            request.offset_blocks,
            status.is_ok(),
        );
        // Device-level failures surface to the user as an I/O error.
        request.complete(status.map_err(|_| Error::new(Errno::IoFailed)));
    };
    let submitted = match direction {
        IoDirection::Read => channel.read_blocks(offset_blocks, num_blocks, dma, trampoline),
        IoDirection::Write => channel.write_blocks(offset_blocks, num_blocks, dma, trampoline),
    };
    if let Err(err) = submitted {
        // Unreachable after validate_io; kept for parity with the substrate
        // contract.
        error!("bdev submission failed after validation: {err}");
        return Err(err);
    }
    Ok(())
}

fn fail_submission(request: Box<IoRequest>, err: Error) -> Result<()> {
    error!(
        "io submission to bdev '{}' failed: {err}",
        request.bdev_name
    );
    request.complete(Err(err));
    Err(err)
}
