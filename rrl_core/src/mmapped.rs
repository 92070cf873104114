//! Named shared region with first-writer-wins initialization.
//!
//! The first process to create the region stamps a preamble plus the
//! caller's identity header, lays out its own state and then publishes.
//! Later processes wait for publication and attach only if their identity
//! header matches byte for byte. The last process to detach marks the
//! region dead and removes it together with its link file.
//!
//! A region whose creator exited before publishing is marked dead by the
//! first waiter that notices and recreated from scratch.

use crate::constants::{ATTACH_POLL, ATTACH_TIMEOUT, CACHE_LINE, REGION_MAGIC};
use crate::errors::Error;
use crate::helpers::align_up;
use crate::platform::unix::{make_os_id, platform_drop, process_alive};
use log::{debug, info, warn};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use xxhash_rust::xxh3::xxh3_64;

const OS_ID_PREFIX: &str = "rrl";

const STATE_INITIALIZING: u32 = 0;
const STATE_READY: u32 = 1;
/// Terminal. Nobody may join a dead region.
const STATE_DEAD: u32 = 2;

#[repr(C, align(64))]
struct Preamble {
    magic: u64,
    state: AtomicU32,
    attached: AtomicU32,
    /// pid of the creating process; 0 until the region is stamped.
    creator: AtomicU32,
    size: u64,
}

const PREAMBLE_LEN: usize = align_up(size_of::<Preamble>(), CACHE_LINE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This process created the region; finish laying it out, then call
    /// [`MmappedRegion::init_continue`].
    Created,
    /// A compatible region already existed and is now attached.
    Attached,
}

pub struct MmappedRegion {
    shmem: Shmem,
    preamble: NonNull<Preamble>,
    user: NonNull<u8>,
    size: usize,
    path: PathBuf,
}

// The mapping is process-wide; all mutable state behind it is atomic or
// written only before publication.
unsafe impl Send for MmappedRegion {}
unsafe impl Sync for MmappedRegion {}

enum Opened {
    Created(Shmem),
    Existing(Shmem),
}

enum Attach {
    Joined(MmappedRegion),
    /// The region is dead. `reclaimed` is set when it died of an abandoned
    /// initialization, which restarts the wait.
    Gone { reclaimed: bool },
}

impl MmappedRegion {
    /// Create or attach the region linked at `path` with `size` usable bytes.
    /// The first `identity.len()` usable bytes are the identity header.
    pub fn init(path: &Path, size: usize, identity: &[u8]) -> Result<(Self, InitOutcome), Error> {
        if identity.len() > size {
            return Err(Error::InvalidConfig(format!(
                "identity header of {} bytes exceeds region size {size}",
                identity.len()
            )));
        }
        let total = PREAMBLE_LEN
            .checked_add(size)
            .ok_or(Error::CapacityTooLarge)?;
        let os_id = make_os_id(OS_ID_PREFIX, xxh3_64(path.as_os_str().as_bytes()));
        let mut deadline = Instant::now() + ATTACH_TIMEOUT;

        loop {
            match Self::open_or_create(path, &os_id, total, deadline)? {
                Opened::Created(shmem) => {
                    info!("[MMAP] created {} ({} bytes, os_id={os_id})", path.display(), total);
                    return Ok((Self::stamp(shmem, path, size, identity)?, InitOutcome::Created));
                }
                Opened::Existing(shmem) => {
                    debug!("[MMAP] attaching to {} (os_id={})", path.display(), shmem.get_os_id());
                    match Self::attach(shmem, path, size, identity, deadline)? {
                        Attach::Joined(region) => return Ok((region, InitOutcome::Attached)),
                        Attach::Gone { reclaimed: true } => {
                            deadline = Instant::now() + ATTACH_TIMEOUT;
                        }
                        Attach::Gone { reclaimed: false } => {
                            // the last peer is still unlinking it
                            if Instant::now() >= deadline {
                                return Err(Error::AttachTimeout);
                            }
                            std::thread::sleep(ATTACH_POLL);
                        }
                    }
                }
            }
        }
    }

    fn open_or_create(path: &Path, os_id: &str, total: usize, deadline: Instant) -> Result<Opened, Error> {
        let mut recovered = false;
        loop {
            match ShmemConf::new().size(total).os_id(os_id).flink(path).create() {
                Ok(m) => return Ok(Opened::Created(m)),
                Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {}
                Err(ShmemError::LinkCreateFailed(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match ShmemConf::new()
                .flink(path)
                .open()
                .or_else(|_| ShmemConf::new().os_id(os_id).open())
            {
                Ok(m) if m.len() >= PREAMBLE_LEN => return Ok(Opened::Existing(m)),
                // a creator between shm_open and ftruncate looks like this too
                Ok(_) if Instant::now() < deadline => std::thread::sleep(ATTACH_POLL),
                Ok(m) if !recovered => {
                    warn!("[MMAP] {} maps only {} bytes; discarding it", path.display(), m.len());
                    Self::unlink(path, m.get_os_id());
                    recovered = true;
                }
                Err(e) if !recovered && path.exists() => {
                    // link left behind by peers that are all gone
                    warn!("[MMAP] stale link {}: {e}; recreating", path.display());
                    let _ = std::fs::remove_file(path);
                    recovered = true;
                }
                Ok(m) => {
                    return Err(Error::SizeMismatch { expected: total, found: m.len() });
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e.into());
                    }
                    std::thread::sleep(ATTACH_POLL);
                }
            }
        }
    }

    fn stamp(mut shmem: Shmem, path: &Path, size: usize, identity: &[u8]) -> Result<Self, Error> {
        let base = NonNull::new(shmem.as_ptr()).ok_or(Error::Other("null mapping".into()))?;
        let raw = base.as_ptr() as *mut Preamble;
        // SAFETY: a fresh mapping is zero-filled, which reads as an
        // initializing preamble; nobody reads magic or size before READY
        unsafe {
            ptr::addr_of_mut!((*raw).magic).write(REGION_MAGIC);
            ptr::addr_of_mut!((*raw).size).write(size as u64);
            ptr::copy_nonoverlapping(identity.as_ptr(), base.as_ptr().add(PREAMBLE_LEN), identity.len());
            let preamble = &*raw;
            preamble.attached.store(1, Ordering::Relaxed);
            preamble.creator.store(std::process::id(), Ordering::Release);
        }
        // lifetime is now governed by the attach count
        shmem.set_owner(false);
        Ok(Self::wrap(shmem, base, size, path))
    }

    fn attach(
        mut shmem: Shmem,
        path: &Path,
        size: usize,
        identity: &[u8],
        deadline: Instant,
    ) -> Result<Attach, Error> {
        shmem.set_owner(false);
        let base = NonNull::new(shmem.as_ptr()).ok_or(Error::Other("null mapping".into()))?;
        let preamble = unsafe { &*(base.as_ptr() as *const Preamble) };

        loop {
            match preamble.state.load(Ordering::Acquire) {
                STATE_READY => break,
                STATE_DEAD => return Ok(Attach::Gone { reclaimed: false }),
                _ => {}
            }
            let creator = preamble.creator.load(Ordering::Acquire);
            let abandoned = if creator == 0 {
                // died between create and stamp
                Instant::now() >= deadline
            } else {
                !process_alive(creator)
            };
            if abandoned {
                match preamble.state.compare_exchange(
                    STATE_INITIALIZING,
                    STATE_DEAD,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        warn!(
                            "[MMAP] creator (pid {creator}) of {} exited before publishing; reclaiming",
                            path.display()
                        );
                        Self::unlink(path, shmem.get_os_id());
                        return Ok(Attach::Gone { reclaimed: true });
                    }
                    Err(STATE_DEAD) => return Ok(Attach::Gone { reclaimed: true }),
                    Err(_) => continue,
                }
            }
            if Instant::now() >= deadline {
                warn!("[MMAP] {} was never published", path.display());
                return Err(Error::AttachTimeout);
            }
            std::thread::sleep(ATTACH_POLL);
        }
        if preamble.magic != REGION_MAGIC {
            return Err(Error::HeaderMismatch);
        }
        let found = preamble.size as usize;
        if found < identity.len() || shmem.len() < PREAMBLE_LEN + found {
            return Err(Error::SizeMismatch { expected: size, found });
        }
        // identity first: a peer with other parameters usually has another size too
        let existing = unsafe { std::slice::from_raw_parts(base.as_ptr().add(PREAMBLE_LEN), identity.len()) };
        if existing != identity {
            return Err(Error::HeaderMismatch);
        }
        if found != size {
            return Err(Error::SizeMismatch { expected: size, found });
        }

        // zero peers means the last one is already tearing it down
        if preamble
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n != 0).then(|| n + 1))
            .is_err()
        {
            return Ok(Attach::Gone { reclaimed: false });
        }
        Ok(Attach::Joined(Self::wrap(shmem, base, size, path)))
    }

    fn wrap(shmem: Shmem, base: NonNull<u8>, size: usize, path: &Path) -> Self {
        // SAFETY: PREAMBLE_LEN <= mapping length, checked by both callers
        let user = unsafe { NonNull::new_unchecked(base.as_ptr().add(PREAMBLE_LEN)) };
        Self {
            shmem,
            preamble: base.cast(),
            user,
            size,
            path: path.to_path_buf(),
        }
    }

    /// Link first: while the object still exists nobody can create a new one
    /// under the same os id, so the unlink below only ever hits ours.
    fn unlink(path: &Path, os_id: &str) {
        let _ = std::fs::remove_file(path);
        platform_drop(os_id);
    }

    fn preamble(&self) -> &Preamble {
        unsafe { self.preamble.as_ref() }
    }

    /// Publish a region this process created. Attachers blocked in
    /// [`MmappedRegion::init`] proceed once this returns.
    pub fn init_continue(&self) {
        self.preamble().state.store(STATE_READY, Ordering::Release);
        debug!("[MMAP] published {}", self.path.display());
    }

    /// Start of the usable bytes, 64-byte aligned.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.user
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live handles across all processes.
    pub fn attached(&self) -> u32 {
        self.preamble().attached.load(Ordering::Acquire)
    }
}

impl Drop for MmappedRegion {
    fn drop(&mut self) {
        let prev = self.preamble().attached.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.preamble().state.store(STATE_DEAD, Ordering::Release);
            info!("[MMAP] last peer detached; removing {}", self.path.display());
            Self::unlink(&self.path, self.shmem.get_os_id());
        }
        // Shmem never owns the region here, so its Drop only unmaps
    }
}
