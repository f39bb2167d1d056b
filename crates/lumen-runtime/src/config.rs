//! Backend and device configuration.

use lumen_core::shader::DEFAULT_WORKGROUP_SIZE;

/// One size class of the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    /// Allocation size in bytes for every request that rounds up to this bucket.
    pub size: u64,

    /// Maximum number of idle buffers kept per usage class.
    ///
    /// A cap of 0 disables pooling for this bucket.
    pub cap: usize,
}

impl BucketSpec {
    pub const fn new(size: u64, cap: usize) -> Self {
        Self { size, cap }
    }
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Default bucket table: many small buffers, few large ones.
pub const DEFAULT_BUCKETS: &[BucketSpec] = &[
    BucketSpec::new(64, 32),
    BucketSpec::new(128, 32),
    BucketSpec::new(256, 32),
    BucketSpec::new(512, 32),
    BucketSpec::new(KIB, 32),
    BucketSpec::new(2 * KIB, 24),
    BucketSpec::new(4 * KIB, 24),
    BucketSpec::new(8 * KIB, 16),
    BucketSpec::new(16 * KIB, 16),
    BucketSpec::new(32 * KIB, 16),
    BucketSpec::new(64 * KIB, 8),
    BucketSpec::new(128 * KIB, 8),
    BucketSpec::new(256 * KIB, 8),
    BucketSpec::new(512 * KIB, 8),
    BucketSpec::new(MIB, 4),
    BucketSpec::new(2 * MIB, 4),
    BucketSpec::new(4 * MIB, 2),
    BucketSpec::new(8 * MIB, 2),
    BucketSpec::new(16 * MIB, 2),
    BucketSpec::new(32 * MIB, 1),
    BucketSpec::new(64 * MIB, 1),
];

/// Tunables of a [`crate::Backend`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Ascending bucket table used to round allocation sizes.
    pub buckets: Vec<BucketSpec>,

    /// Invocations per workgroup passed to every kernel's shader helper.
    pub workgroup_size: u32,

    /// Override of the device's per-dimension workgroup count limit.
    pub max_workgroups_per_dimension: Option<u32>,

    /// Panic when a buffer owned by a frozen capture is released.
    ///
    /// When unset the release is logged and the capture's next replay fails
    /// with [`crate::RuntimeError::ReplayInvalidation`].
    pub assert_capture_aliasing: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.to_vec(),
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            max_workgroups_per_dimension: None,
            assert_capture_aliasing: cfg!(debug_assertions),
        }
    }
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the bucket table (sorted ascending by size).
    pub fn with_buckets(mut self, mut buckets: Vec<BucketSpec>) -> Self {
        buckets.sort_by_key(|b| b.size);
        self.buckets = buckets;
        self
    }

    pub fn with_workgroup_size(mut self, size: u32) -> Self {
        self.workgroup_size = size.max(1);
        self
    }

    pub fn with_max_workgroups_per_dimension(mut self, limit: u32) -> Self {
        self.max_workgroups_per_dimension = Some(limit.max(1));
        self
    }

    pub fn with_capture_aliasing_assert(mut self, enabled: bool) -> Self {
        self.assert_capture_aliasing = enabled;
        self
    }
}

/// Adapter selection for [`crate::WgpuDevice`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}
