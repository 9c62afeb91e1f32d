// SPDX-License-Identifier: MPL-2.0

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    rc::Rc,
};

use log::{debug, warn};
use uuid::Uuid;
use xsan_types::{return_errno_with_msg, Errno, Error, Result};

use crate::{DmaBuf, Reactor};

/// Namespace for deriving stable uuids of file-backed devices from their
/// names, so a device keeps its identity across restarts.
const BDEV_UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9b, 0x1c, 0x6d, 0x3e, 0x5a, 0x0f, 0x4e, 0x7b, 0x8f, 0x26, 0xd0, 0x41, 0x77, 0x2a, 0xc5, 0x13,
]);

/// Descriptive properties of a reactor-managed block device.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BdevInfo {
    pub name: String,
    pub uuid: Uuid,
    /// Logical block size in bytes; a power of two.
    pub block_size: u32,
    pub num_blocks: u64,
    pub product_name: String,
    pub is_rotational: bool,
    pub optimal_io_boundary: u32,
    pub write_cache: bool,
    /// Required DMA buffer alignment in bytes.
    pub buf_align: usize,
}

impl BdevInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.num_blocks * self.block_size as u64
    }
}

/// What a device backend must provide to the substrate.
///
/// Backends are synchronous at this level; the substrate turns submissions
/// into deferred completions so the layers above always observe async
/// delivery.
pub trait BdevBackend: 'static {
    fn info(&self) -> &BdevInfo;

    /// Reads whole blocks starting at `offset_blocks` into `buf`.
    fn read(&mut self, offset_blocks: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes whole blocks starting at `offset_blocks` from `buf`.
    fn write(&mut self, offset_blocks: u64, buf: &[u8]) -> Result<()>;
}

/// A RAM-backed block device, for tests and volatile scratch space.
pub struct MemBdev {
    info: BdevInfo,
    data: Vec<u8>,
}

impl MemBdev {
    pub fn new(name: impl Into<String>, block_size: u32, num_blocks: u64) -> Self {
        let name = name.into();
        let info = BdevInfo {
            uuid: Uuid::new_v4(),
            block_size,
            num_blocks,
            product_name: "XSAN malloc disk".to_string(),
            is_rotational: false,
            optimal_io_boundary: 0,
            write_cache: false,
            buf_align: block_size as usize,
            name,
        };
        let data = vec![0u8; (num_blocks * block_size as u64) as usize];
        Self { info, data }
    }
}

impl BdevBackend for MemBdev {
    fn info(&self) -> &BdevInfo {
        &self.info
    }

    fn read(&mut self, offset_blocks: u64, buf: &mut [u8]) -> Result<()> {
        let start = (offset_blocks * self.info.block_size as u64) as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset_blocks: u64, buf: &[u8]) -> Result<()> {
        let start = (offset_blocks * self.info.block_size as u64) as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// A file-backed block device; the durable reference backend.
pub struct FileBdev {
    info: BdevInfo,
    file: File,
}

impl FileBdev {
    /// Creates the backing file sized to `num_blocks` and opens the device.
    pub fn create(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        block_size: u32,
        num_blocks: u64,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        file.set_len(num_blocks * block_size as u64)?;
        Ok(Self::from_file(name.into(), file, block_size, num_blocks))
    }

    /// Opens an existing backing file; capacity is derived from its length.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len == 0 || len % block_size as u64 != 0 {
            return_errno_with_msg!(Errno::InvalidSize, "backing file is not block aligned");
        }
        let num_blocks = len / block_size as u64;
        Ok(Self::from_file(name.into(), file, block_size, num_blocks))
    }

    fn from_file(name: String, file: File, block_size: u32, num_blocks: u64) -> Self {
        let info = BdevInfo {
            uuid: Uuid::new_v5(&BDEV_UUID_NAMESPACE, name.as_bytes()),
            block_size,
            num_blocks,
            product_name: "XSAN file disk".to_string(),
            is_rotational: false,
            optimal_io_boundary: 0,
            write_cache: true,
            buf_align: block_size as usize,
            name,
        };
        Self { info, file }
    }
}

impl BdevBackend for FileBdev {
    fn info(&self) -> &BdevInfo {
        &self.info
    }

    fn read(&mut self, offset_blocks: u64, buf: &mut [u8]) -> Result<()> {
        let offset = offset_blocks * self.info.block_size as u64;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write(&mut self, offset_blocks: u64, buf: &[u8]) -> Result<()> {
        let offset = offset_blocks * self.info.block_size as u64;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}

struct BdevEntry {
    info: BdevInfo,
    backend: RefCell<Box<dyn BdevBackend>>,
    open_count: Cell<u32>,
}

/// The per-reactor table of named block devices.
pub(crate) struct BdevTable {
    devices: RefCell<BTreeMap<String, Rc<BdevEntry>>>,
}

impl BdevTable {
    pub(crate) fn new() -> Self {
        Self {
            devices: RefCell::new(BTreeMap::new()),
        }
    }
}

impl Reactor {
    /// Adds a device to this reactor's table under its advertised name.
    pub fn register_bdev(&self, backend: Box<dyn BdevBackend>) -> Result<()> {
        let info = backend.info().clone();
        let mut devices = self.bdevs.devices.borrow_mut();
        if devices.contains_key(&info.name) {
            return_errno_with_msg!(Errno::AlreadyExists, "bdev name already registered");
        }
        debug!(
            "reactor {}: bdev '{}' registered ({} blocks of {} B)",
            self.id(),
            info.name,
            info.num_blocks,
            info.block_size
        );
        devices.insert(
            info.name.clone(),
            Rc::new(BdevEntry {
                info,
                backend: RefCell::new(backend),
                open_count: Cell::new(0),
            }),
        );
        Ok(())
    }

    /// Removes a device; fails while any descriptor is open.
    pub fn unregister_bdev(&self, name: &str) -> Result<()> {
        let mut devices = self.bdevs.devices.borrow_mut();
        let Some(entry) = devices.get(name) else {
            return_errno_with_msg!(Errno::DeviceNotFound, "no such bdev");
        };
        if entry.open_count.get() > 0 {
            return_errno_with_msg!(Errno::ResourceBusy, "bdev has open descriptors");
        }
        devices.remove(name);
        Ok(())
    }

    /// Snapshot of the names of all registered devices.
    pub fn bdev_names(&self) -> Vec<String> {
        self.bdevs.devices.borrow().keys().cloned().collect()
    }

    /// Properties of a device, if registered.
    pub fn bdev_info(&self, name: &str) -> Option<BdevInfo> {
        self.bdevs
            .devices
            .borrow()
            .get(name)
            .map(|entry| entry.info.clone())
    }

    /// Opens a descriptor on a device.
    pub fn open_bdev(&self, name: &str) -> Result<BdevDesc> {
        let devices = self.bdevs.devices.borrow();
        let Some(entry) = devices.get(name) else {
            return_errno_with_msg!(Errno::DeviceNotFound, "no such bdev");
        };
        entry.open_count.set(entry.open_count.get() + 1);
        Ok(BdevDesc {
            entry: entry.clone(),
        })
    }
}

/// An open descriptor on a block device.
///
/// Dropping the descriptor releases it. I/O goes through a channel obtained
/// from the descriptor; both are bound to the owning reactor thread.
pub struct BdevDesc {
    entry: Rc<BdevEntry>,
}

impl BdevDesc {
    pub fn info(&self) -> &BdevInfo {
        &self.entry.info
    }

    /// Obtains an I/O channel for submissions on the current reactor.
    pub fn io_channel(&self) -> IoChannel {
        IoChannel {
            entry: self.entry.clone(),
        }
    }
}

impl Drop for BdevDesc {
    fn drop(&mut self) {
        let count = self.entry.open_count.get();
        debug_assert!(count > 0);
        self.entry.open_count.set(count.saturating_sub(1));
    }
}

/// A per-reactor submission channel of one block device.
pub struct IoChannel {
    entry: Rc<BdevEntry>,
}

impl IoChannel {
    pub fn info(&self) -> &BdevInfo {
        &self.entry.info
    }

    /// Submits an asynchronous block read.
    ///
    /// On success the completion runs on a later tick of the submitting
    /// reactor with the filled buffer. A synchronous error means the
    /// completion will never run; the caller keeps responsibility for its
    /// own cleanup in that case.
    pub fn read_blocks(
        &self,
        offset_blocks: u64,
        num_blocks: u32,
        buf: DmaBuf,
        completion: impl FnOnce(Result<()>, DmaBuf) + 'static,
    ) -> Result<()> {
        self.submit(offset_blocks, num_blocks, buf, true, completion)
    }

    /// Submits an asynchronous block write. See [`Self::read_blocks`].
    pub fn write_blocks(
        &self,
        offset_blocks: u64,
        num_blocks: u32,
        buf: DmaBuf,
        completion: impl FnOnce(Result<()>, DmaBuf) + 'static,
    ) -> Result<()> {
        self.submit(offset_blocks, num_blocks, buf, false, completion)
    }

    /// Checks the preconditions a submission would enforce, without
    /// consuming a buffer or completion. Lets callers fail early and keep
    /// ownership of their resources.
    pub fn validate_io(&self, offset_blocks: u64, num_blocks: u32, buf_len: usize) -> Result<()> {
        let info = &self.entry.info;
        if num_blocks == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "zero-length io");
        }
        let end = offset_blocks
            .checked_add(num_blocks as u64)
            .ok_or(Error::new(Errno::InvalidOffset))?;
        if end > info.num_blocks {
            return_errno_with_msg!(Errno::OutOfBounds, "io range beyond device capacity");
        }
        let io_len = num_blocks as usize * info.block_size as usize;
        if buf_len < io_len {
            return_errno_with_msg!(Errno::InvalidSize, "dma buffer smaller than io");
        }
        Ok(())
    }

    fn submit(
        &self,
        offset_blocks: u64,
        num_blocks: u32,
        mut buf: DmaBuf,
        is_read: bool,
        completion: impl FnOnce(Result<()>, DmaBuf) + 'static,
    ) -> Result<()> {
        let reactor = Reactor::current()?;
        self.validate_io(offset_blocks, num_blocks, buf.len())?;
        let info = &self.entry.info;
        let io_len = num_blocks as usize * info.block_size as usize;

        let status = {
            let mut backend = self.entry.backend.borrow_mut();
            if is_read {
                backend.read(offset_blocks, &mut buf.as_mut_slice()[..io_len])
            } else {
                backend.write(offset_blocks, &buf.as_slice()[..io_len])
            }
        };
        if let Err(err) = &status {
            warn!(
                "bdev '{}': {} of {} blocks at {} failed: {}",
                info.name,
                if is_read { "read" } else { "write" },
                num_blocks,
                offset_blocks,
                err
            );
        }
        reactor.defer(move || completion(status, buf));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use super::MemBdev;
    use crate::{DmaBuf, Reactor};

    fn on_reactor(test: impl FnOnce(Rc<Reactor>) + Send + 'static) {
        std::thread::spawn(move || {
            let reactor = Reactor::init_current(0).unwrap();
            test(reactor);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn registry_lifecycle() {
        on_reactor(|reactor| {
            reactor
                .register_bdev(Box::new(MemBdev::new("mem0", 512, 128)))
                .unwrap();
            assert!(reactor
                .register_bdev(Box::new(MemBdev::new("mem0", 512, 128)))
                .is_err());
            assert_eq!(reactor.bdev_names(), vec!["mem0".to_string()]);
            let info = reactor.bdev_info("mem0").unwrap();
            assert_eq!(info.block_size, 512);
            assert_eq!(info.capacity_bytes(), 512 * 128);

            let desc = reactor.open_bdev("mem0").unwrap();
            assert!(reactor.unregister_bdev("mem0").is_err());
            drop(desc);
            reactor.unregister_bdev("mem0").unwrap();
            assert!(reactor.bdev_info("mem0").is_none());
        });
    }

    #[test]
    fn write_then_read_via_channel() {
        on_reactor(|reactor| {
            reactor
                .register_bdev(Box::new(MemBdev::new("mem0", 512, 128)))
                .unwrap();
            let desc = reactor.open_bdev("mem0").unwrap();
            let chan = desc.io_channel();

            let mut wbuf = DmaBuf::alloc(1024, 512).unwrap();
            wbuf.as_mut_slice().fill(0x5A);
            let wrote = Rc::new(Cell::new(false));
            let w = wrote.clone();
            chan.write_blocks(4, 2, wbuf, move |status, _buf| {
                status.unwrap();
                w.set(true);
            })
            .unwrap();
            assert!(!wrote.get(), "completion must not run inline");
            reactor
                .poll_until(Duration::from_secs(1), || wrote.get())
                .unwrap();

            let rbuf = DmaBuf::alloc(1024, 512).unwrap();
            let read_ok = Rc::new(Cell::new(false));
            let r = read_ok.clone();
            chan.read_blocks(4, 2, rbuf, move |status, buf| {
                status.unwrap();
                assert!(buf.as_slice().iter().all(|b| *b == 0x5A));
                r.set(true);
            })
            .unwrap();
            reactor
                .poll_until(Duration::from_secs(1), || read_ok.get())
                .unwrap();
        });
    }

    #[test]
    fn file_bdev_persists_across_reopen() {
        use super::{BdevBackend, FileBdev};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk0.img");

        let mut bdev = FileBdev::create("file0", &path, 512, 64).unwrap();
        let uuid = bdev.info().uuid;
        assert_eq!(bdev.info().capacity_bytes(), 512 * 64);
        bdev.write(3, &[7u8; 512]).unwrap();
        drop(bdev);

        let mut bdev = FileBdev::open("file0", &path, 512).unwrap();
        assert_eq!(bdev.info().num_blocks, 64);
        assert_eq!(bdev.info().uuid, uuid, "identity must survive reopen");
        let mut buf = [0u8; 512];
        bdev.read(3, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 7));

        assert!(FileBdev::create("file0", &path, 512, 64).is_err());
        assert!(FileBdev::open("file0", dir.path().join("nope.img"), 512).is_err());
    }

    #[test]
    fn submission_errors_are_synchronous() {
        on_reactor(|reactor| {
            reactor
                .register_bdev(Box::new(MemBdev::new("mem0", 512, 8)))
                .unwrap();
            let desc = reactor.open_bdev("mem0").unwrap();
            let chan = desc.io_channel();
            let buf = DmaBuf::alloc(512, 512).unwrap();
            let err = chan
                .read_blocks(8, 1, buf, |_, _| panic!("must not complete"))
                .unwrap_err();
            assert_eq!(err.errno(), xsan_types::Errno::OutOfBounds);
            reactor.poll();
        });
    }
}
