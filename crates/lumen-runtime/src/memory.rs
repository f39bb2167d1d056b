//! GPU memory manager with size-bucketed pooling.
//!
//! Every device buffer the engine touches lives in an arena keyed by
//! [`BufferId`] and has exactly one [`BufferOwner`]. Released buffers are
//! parked as pending until the command stream that may still read them has
//! been flushed; [`MemoryManager::flush_pending`] then returns them to the
//! idle pool of their (bucket, usage) class or destroys them when the pool is
//! full.
//!
//! Ids are never reused: taking a buffer from the idle pool re-registers it
//! under a fresh id, so a stale id can never alias a buffer that changed
//! hands. Capture replay relies on this to detect invalidated bindings.

use crate::config::{BackendConfig, BucketSpec};
use crate::device::{BufferUsage, GpuDevice};
use crate::error::{Result, RuntimeError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Alignment of every allocation.
pub const BUFFER_ALIGNMENT: u64 = 16;

/// Size of the shared placeholder bound for zero-element tensors.
pub const PLACEHOLDER_SIZE: u64 = 16;

/// Handle to a device buffer tracked by the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a loaded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Who currently owns a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferOwner {
    /// Backs a live tensor (or a uniform block in flight).
    Tensor,
    /// Parked in the idle pool of its bucket.
    IdlePool,
    /// Released; waiting for the next flush before it may be reused.
    PendingRelease,
    /// Retained by a capture for replay.
    Capture,
    /// Supplied by the caller; never pooled or destroyed.
    External,
}

struct BufferRecord<B> {
    buffer: B,
    size: u64,
    requested: u64,
    bucket: Option<usize>,
    usage: BufferUsage,
    owner: BufferOwner,
    session: Option<SessionId>,
}

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Device buffers created since startup.
    pub created: usize,
    /// Device buffers destroyed since startup.
    pub destroyed: usize,
    /// Allocations served from the idle pool.
    pub reused: usize,
    pub in_use: usize,
    pub idle: usize,
    pub pending: usize,
    pub captured: usize,
    pub external: usize,
    /// Allocated bytes of buffers backing tensors or captures.
    pub bytes_in_use: u64,
}

/// Allocates, pools and transfers device buffers.
pub struct MemoryManager<D: GpuDevice> {
    device: Arc<D>,
    buckets: Vec<BucketSpec>,
    records: HashMap<BufferId, BufferRecord<D::Buffer>>,
    idle: HashMap<(usize, BufferUsage), Vec<BufferId>>,
    pending: Vec<BufferId>,
    next_id: u64,
    session: Option<SessionId>,
    capturing: Option<SessionId>,
    assert_capture_aliasing: bool,
    placeholder: Option<BufferId>,
    created: usize,
    destroyed: usize,
    reused: usize,
}

impl<D: GpuDevice> MemoryManager<D> {
    pub fn new(device: Arc<D>, config: &BackendConfig) -> Self {
        Self {
            device,
            buckets: config.buckets.clone(),
            records: HashMap::new(),
            idle: HashMap::new(),
            pending: Vec::new(),
            next_id: 0,
            session: None,
            capturing: None,
            assert_capture_aliasing: config.assert_capture_aliasing,
            placeholder: None,
            created: 0,
            destroyed: 0,
            reused: 0,
        }
    }

    /// Allocation size and bucket index for a request of `size` bytes.
    ///
    /// Sizes above the largest bucket get their exact aligned size and no
    /// bucket (not poolable). A request of 0 maps to the smallest bucket.
    pub fn bucket_for(&self, size: u64) -> (u64, Option<usize>) {
        match self.buckets.iter().position(|b| b.size >= size) {
            Some(index) => (self.buckets[index].size, Some(index)),
            None => (size.next_multiple_of(BUFFER_ALIGNMENT), None),
        }
    }

    /// Session that new allocations are attributed to.
    pub fn set_session(&mut self, session: Option<SessionId>) {
        self.session = session;
    }

    fn next_id(&mut self) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        id
    }

    fn record(&self, id: BufferId) -> Result<&BufferRecord<D::Buffer>> {
        self.records
            .get(&id)
            .ok_or_else(|| RuntimeError::ExecutionError(format!("Unknown buffer {id}")))
    }

    /// Allocate a buffer of at least `size` bytes, reusing an idle one if possible.
    pub fn allocate(&mut self, size: u64, usage: BufferUsage) -> Result<BufferId> {
        let (alloc_size, bucket) = self.bucket_for(size);

        if let Some(index) = bucket {
            let reusable = self
                .idle
                .get_mut(&(index, usage))
                .and_then(|ids| ids.pop());
            if let Some(old_id) = reusable {
                let mut record = self.records.remove(&old_id).ok_or_else(|| {
                    RuntimeError::ExecutionError(format!("Idle pool lost track of buffer {old_id}"))
                })?;
                record.owner = BufferOwner::Tensor;
                record.requested = size;
                record.session = self.session;
                let id = self.next_id();
                self.records.insert(id, record);
                self.reused += 1;
                trace!(%old_id, %id, size, alloc_size, "Reused pooled buffer");
                return Ok(id);
            }
        }

        let id = self.next_id();
        let label = format!("lumen_{usage:?}_{alloc_size}").to_lowercase();
        let buffer = self
            .device
            .create_buffer(&label, alloc_size, usage)
            .map_err(|e| match e {
                RuntimeError::Allocation(_) => e,
                other => RuntimeError::Allocation(other.to_string()),
            })?;
        self.records.insert(
            id,
            BufferRecord {
                buffer,
                size: alloc_size,
                requested: size,
                bucket,
                usage,
                owner: BufferOwner::Tensor,
                session: self.session,
            },
        );
        self.created += 1;
        trace!(%id, size, alloc_size, ?usage, "Created buffer");
        Ok(id)
    }

    /// Release a buffer, returning its logical size.
    ///
    /// The buffer becomes pending (or captured while its session records a
    /// capture); it is never destroyed here.
    pub fn release(&mut self, id: BufferId) -> Result<u64> {
        let capturing = self.capturing;
        let assert_aliasing = self.assert_capture_aliasing;
        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| RuntimeError::ExecutionError(format!("Release of unknown buffer {id}")))?;

        match record.owner {
            BufferOwner::External => Ok(0),
            BufferOwner::Tensor => {
                if capturing.is_some() && record.session == capturing {
                    record.owner = BufferOwner::Capture;
                    trace!(%id, "Retained buffer for capture");
                } else {
                    record.owner = BufferOwner::PendingRelease;
                    self.pending.push(id);
                }
                Ok(record.requested)
            }
            BufferOwner::Capture => {
                if assert_aliasing {
                    panic!("buffer {id} released while owned by a capture");
                }
                warn!(%id, "Buffer released while owned by a capture; the capture is invalidated");
                record.owner = BufferOwner::PendingRelease;
                self.pending.push(id);
                Ok(record.requested)
            }
            BufferOwner::IdlePool | BufferOwner::PendingRelease => Err(
                RuntimeError::ExecutionError(format!("Buffer {id} released twice")),
            ),
        }
    }

    /// Move pending buffers to their idle pools or destroy them.
    ///
    /// Must only be called once the work that may read them has been flushed.
    pub fn flush_pending(&mut self) {
        for id in std::mem::take(&mut self.pending) {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if record.owner != BufferOwner::PendingRelease {
                continue;
            }
            let key = record.bucket.map(|index| (index, record.usage));
            let has_room = key.is_some_and(|(index, usage)| {
                self.idle.get(&(index, usage)).map_or(0, Vec::len) < self.buckets[index].cap
            });
            match key {
                Some(key) if has_room => {
                    record.owner = BufferOwner::IdlePool;
                    record.session = None;
                    self.idle.entry(key).or_default().push(id);
                }
                _ => self.destroy(id),
            }
        }
    }

    fn destroy(&mut self, id: BufferId) {
        if let Some(record) = self.records.remove(&id) {
            if record.owner == BufferOwner::IdlePool {
                if let Some(index) = record.bucket {
                    if let Some(pool) = self.idle.get_mut(&(index, record.usage)) {
                        pool.retain(|&pooled| pooled != id);
                    }
                }
            }
            self.device.destroy_buffer(record.buffer);
            self.destroyed += 1;
            trace!(%id, size = record.size, "Destroyed buffer");
        }
    }

    /// Record a host-to-device copy into a live buffer.
    pub fn upload(&self, id: BufferId, data: &[u8]) -> Result<()> {
        let record = self.record(id)?;
        if matches!(record.owner, BufferOwner::IdlePool | BufferOwner::PendingRelease) {
            return Err(RuntimeError::ExecutionError(format!(
                "Upload into released buffer {id}"
            )));
        }
        if data.len() as u64 > record.size {
            return Err(RuntimeError::TensorError(format!(
                "Upload of {} bytes into buffer {id} of {} bytes",
                data.len(),
                record.size
            )));
        }
        self.device.write_buffer(&record.buffer, 0, data)
    }

    /// Record a device-side copy of `size` bytes between two live buffers.
    pub fn copy(&self, source: BufferId, target: BufferId, size: u64) -> Result<()> {
        let from = self.buffer(source)?;
        let to = self.buffer(target)?;
        self.device.copy_buffer(from, to, size)
    }

    /// Flush pending work and read back the first `len` bytes.
    pub async fn download(&self, id: BufferId, len: u64) -> Result<Vec<u8>> {
        let record = self.record(id)?;
        if len > record.size {
            return Err(RuntimeError::TensorError(format!(
                "Download of {len} bytes from buffer {id} of {} bytes",
                record.size
            )));
        }
        self.device.read_buffer(&record.buffer, len).await
    }

    /// Device buffer for binding; the buffer must be live.
    pub fn buffer(&self, id: BufferId) -> Result<&D::Buffer> {
        let record = self.record(id)?;
        match record.owner {
            BufferOwner::Tensor | BufferOwner::Capture | BufferOwner::External => {
                Ok(&record.buffer)
            }
            owner => Err(RuntimeError::ExecutionError(format!(
                "Buffer {id} is not live (owner {owner:?})"
            ))),
        }
    }

    pub fn owner(&self, id: BufferId) -> Option<BufferOwner> {
        self.records.get(&id).map(|r| r.owner)
    }

    pub fn session_of(&self, id: BufferId) -> Option<SessionId> {
        self.records.get(&id).and_then(|r| r.session)
    }

    /// Allocated size of a buffer.
    pub fn size_of(&self, id: BufferId) -> Option<u64> {
        self.records.get(&id).map(|r| r.size)
    }

    /// Shared buffer bound in place of zero-element tensors.
    pub fn placeholder(&mut self) -> Result<BufferId> {
        if let Some(id) = self.placeholder {
            return Ok(id);
        }
        let buffer = self
            .device
            .create_buffer("lumen_placeholder", PLACEHOLDER_SIZE, BufferUsage::Storage)?;
        let id = self.next_id();
        self.records.insert(
            id,
            BufferRecord {
                buffer,
                size: PLACEHOLDER_SIZE,
                requested: 0,
                bucket: None,
                usage: BufferUsage::Storage,
                owner: BufferOwner::Tensor,
                session: None,
            },
        );
        self.created += 1;
        self.placeholder = Some(id);
        Ok(id)
    }

    /// Track a caller-owned buffer so it can be bound like any other.
    pub fn register_external(&mut self, buffer: D::Buffer, size: u64) -> BufferId {
        let id = self.next_id();
        self.records.insert(
            id,
            BufferRecord {
                buffer,
                size,
                requested: size,
                bucket: None,
                usage: BufferUsage::Storage,
                owner: BufferOwner::External,
                session: None,
            },
        );
        debug!(%id, size, "Registered external buffer");
        id
    }

    /// Stop tracking an external buffer and hand it back.
    pub fn unregister_external(&mut self, id: BufferId) -> Option<D::Buffer> {
        match self.records.get(&id) {
            Some(record) if record.owner == BufferOwner::External => {
                self.records.remove(&id).map(|r| r.buffer)
            }
            _ => None,
        }
    }

    /// Start retaining released buffers of `session` for a capture.
    pub fn begin_capture(&mut self, session: SessionId) -> Result<()> {
        match self.capturing {
            Some(other) if other != session => Err(RuntimeError::Capture(format!(
                "{other} is already recording a capture"
            ))),
            _ => {
                self.capturing = Some(session);
                Ok(())
            }
        }
    }

    /// Stop retaining; captured buffers stay owned by the capture.
    pub fn end_capture(&mut self) {
        self.capturing = None;
    }

    /// Return every buffer captured for `session` to the normal release path.
    pub fn release_captured(&mut self, session: SessionId) {
        let ids: Vec<BufferId> = self
            .records
            .iter()
            .filter(|(_, r)| r.owner == BufferOwner::Capture && r.session == Some(session))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            if let Some(record) = self.records.get_mut(&id) {
                record.owner = BufferOwner::PendingRelease;
                self.pending.push(id);
            }
        }
    }

    /// Destroy every buffer tracked for `session`, bypassing the pools.
    pub fn dispose_session(&mut self, session: SessionId) {
        if self.capturing == Some(session) {
            self.capturing = None;
        }
        let ids: Vec<BufferId> = self
            .records
            .iter()
            .filter(|(_, r)| r.session == Some(session) && r.owner != BufferOwner::External)
            .map(|(&id, _)| id)
            .collect();
        let count = ids.len();
        for id in ids {
            self.destroy(id);
        }
        self.pending.retain(|id| self.records.contains_key(id));
        debug!(%session, count, "Disposed session buffers");
    }

    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            created: self.created,
            destroyed: self.destroyed,
            reused: self.reused,
            ..Default::default()
        };
        for record in self.records.values() {
            match record.owner {
                BufferOwner::Tensor => {
                    stats.in_use += 1;
                    stats.bytes_in_use += record.size;
                }
                BufferOwner::IdlePool => stats.idle += 1,
                BufferOwner::PendingRelease => stats.pending += 1,
                BufferOwner::Capture => {
                    stats.captured += 1;
                    stats.bytes_in_use += record.size;
                }
                BufferOwner::External => stats.external += 1,
            }
        }
        stats
    }
}

impl<D: GpuDevice> Drop for MemoryManager<D> {
    fn drop(&mut self) {
        let ids: Vec<BufferId> = self
            .records
            .iter()
            .filter(|(_, r)| r.owner != BufferOwner::External)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.destroy(id);
        }
    }
}
