// SPDX-License-Identifier: MPL-2.0

use std::{cell::RefCell, rc::Rc, time::Duration};

use xsan_reactor::{BdevInfo, DmaBuf, Reactor};
use xsan_types::{DiskId, Errno, Error, Result, VolumeId};

use crate::{submit_to_bdev, IoRequest};

/// How long the synchronous helpers poll before giving up.
const SYNC_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of the block devices currently managed by this reactor.
pub fn enumerate() -> Result<Vec<BdevInfo>> {
    let reactor = Reactor::current()?;
    Ok(reactor
        .bdev_names()
        .into_iter()
        .filter_map(|name| reactor.bdev_info(&name))
        .collect())
}

/// Properties of one device.
pub fn info_by_name(name: &str) -> Result<BdevInfo> {
    let reactor = Reactor::current()?;
    reactor
        .bdev_info(name)
        .ok_or(Error::new(Errno::DeviceNotFound))
}

/// Required DMA alignment of a device's buffers, in bytes.
pub fn buf_align(name: &str) -> Result<usize> {
    Ok(info_by_name(name)?.buf_align)
}

/// Allocates a DMA-capable buffer.
pub fn dma_alloc(size: usize, align: usize) -> Result<DmaBuf> {
    DmaBuf::alloc(size, align)
}

/// Reads blocks synchronously by polling the current reactor.
///
/// Bootstrap/test utility only; the production I/O path is async.
pub fn read_sync(name: &str, offset_blocks: u64, num_blocks: u32, buf: &mut [u8]) -> Result<()> {
    let reactor = Reactor::current()?;
    let info = info_by_name(name)?;
    let length = num_blocks as u64 * info.block_size as u64;
    if (buf.len() as u64) < length {
        return Err(Error::with_msg(Errno::InvalidSize, "buffer too small"));
    }

    let outcome: Rc<RefCell<Option<Result<Vec<u8>>>>> = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    let request = IoRequest::read(
        VolumeId::nil(),
        DiskId::nil(),
        name,
        offset_blocks * info.block_size as u64,
        length,
        info.block_size,
        move |result| {
            *slot.borrow_mut() = Some(result);
        },
    )?;
    submit_to_bdev(request)?;
    reactor.poll_until(SYNC_IO_TIMEOUT, || outcome.borrow().is_some())?;
    let result = outcome
        .borrow_mut()
        .take()
        .unwrap_or(Err(Error::new(Errno::IoFailed)));
    let data = result?;
    buf[..data.len()].copy_from_slice(&data);
    Ok(())
}

/// Writes blocks synchronously by polling the current reactor.
///
/// Bootstrap/test utility only; the production I/O path is async.
pub fn write_sync(name: &str, offset_blocks: u64, num_blocks: u32, buf: &[u8]) -> Result<()> {
    let reactor = Reactor::current()?;
    let info = info_by_name(name)?;
    let length = num_blocks as u64 * info.block_size as u64;
    if (buf.len() as u64) < length {
        return Err(Error::with_msg(Errno::InvalidSize, "buffer too small"));
    }

    // Stage the data in a DMA buffer up front; the pipeline then submits
    // it as-is instead of allocating and copying internally.
    let mut dma = DmaBuf::alloc(length as usize, info.buf_align)?;
    dma.as_mut_slice().copy_from_slice(&buf[..length as usize]);

    let outcome: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    let request = IoRequest::write_from_dma(
        VolumeId::nil(),
        DiskId::nil(),
        name,
        offset_blocks * info.block_size as u64,
        length,
        info.block_size,
        dma,
        move |result| {
            *slot.borrow_mut() = Some(result);
        },
    )?;
    submit_to_bdev(request)?;
    reactor.poll_until(SYNC_IO_TIMEOUT, || outcome.borrow().is_some())?;
    let result = outcome
        .borrow_mut()
        .take()
        .unwrap_or(Err(Error::new(Errno::IoFailed)));
    result
}
