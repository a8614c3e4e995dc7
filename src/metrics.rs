//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// `LinearAllocator`のメトリクス.
#[derive(Debug, Clone)]
pub struct LinearAllocatorMetrics {
    pub(crate) allocations: Counter,
    pub(crate) allocated_bytes: Counter,
    pub(crate) out_of_space_failures: Counter,
    pub(crate) platform_failures: Counter,
    pub(crate) commits: Counter,
    pub(crate) committed_bytes_total: Counter,
    pub(crate) decommitted_bytes: Counter,
    pub(crate) resets: Counter,
    pub(crate) releases: Counter,
    pub(crate) reserved_bytes: Gauge,
    pub(crate) committed_bytes: Gauge,
}
impl LinearAllocatorMetrics {
    /// 成功した割当の回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_allocations_total <COUNTER>
    /// ```
    pub fn allocations(&self) -> u64 {
        self.allocations.value() as u64
    }

    /// これまでに割り当てたバイト数の合計(アライメントによる隙間は含まない).
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_allocated_bytes_total <COUNTER>
    /// ```
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.value() as u64
    }

    /// 予約の上限に達したことによる割当失敗の回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_out_of_space_failures_total <COUNTER>
    /// ```
    pub fn out_of_space_failures(&self) -> u64 {
        self.out_of_space_failures.value() as u64
    }

    /// OSの仮想メモリ操作の失敗回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_platform_failures_total <COUNTER>
    /// ```
    pub fn platform_failures(&self) -> u64 {
        self.platform_failures.value() as u64
    }

    /// コミットの発行回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_commits_total <COUNTER>
    /// ```
    pub fn commits(&self) -> u64 {
        self.commits.value() as u64
    }

    /// これまでにデコミットしたバイト数の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_decommitted_bytes_total <COUNTER>
    /// ```
    pub fn decommitted_bytes(&self) -> u64 {
        self.decommitted_bytes.value() as u64
    }

    /// `reset_to`(スコープ終了時のものを含む)の呼び出し回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_resets_total <COUNTER>
    /// ```
    pub fn resets(&self) -> u64 {
        self.resets.value() as u64
    }

    /// 予約の解放回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_releases_total <COUNTER>
    /// ```
    pub fn releases(&self) -> u64 {
        self.releases.value() as u64
    }

    /// 現在予約しているバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_reserved_bytes <GAUGE>
    /// ```
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes.value() as u64
    }

    /// 現在コミットしているバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_committed_bytes <GAUGE>
    /// ```
    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes.value() as u64
    }

    /// これまでにコミットしたバイト数の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// vmlinear_linear_allocator_committed_bytes_total <COUNTER>
    /// ```
    pub fn committed_bytes_total(&self) -> u64 {
        self.committed_bytes_total.value() as u64
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("vmlinear").subsystem("linear_allocator");
        LinearAllocatorMetrics {
            allocations: builder
                .counter("allocations_total")
                .help("Number of allocations")
                .finish()
                .expect("Never fails"),
            allocated_bytes: builder
                .counter("allocated_bytes_total")
                .help("Number of allocated bytes")
                .finish()
                .expect("Never fails"),
            out_of_space_failures: builder
                .counter("out_of_space_failures_total")
                .help("Number of allocation failures caused by the reservation limit")
                .finish()
                .expect("Never fails"),
            platform_failures: builder
                .counter("platform_failures_total")
                .help("Number of failed virtual memory operations")
                .finish()
                .expect("Never fails"),
            commits: builder
                .counter("commits_total")
                .help("Number of commit requests")
                .finish()
                .expect("Never fails"),
            committed_bytes_total: builder
                .counter("committed_bytes_total")
                .help("Number of committed bytes")
                .finish()
                .expect("Never fails"),
            decommitted_bytes: builder
                .counter("decommitted_bytes_total")
                .help("Number of decommitted bytes")
                .finish()
                .expect("Never fails"),
            resets: builder
                .counter("resets_total")
                .help("Number of cursor resets")
                .finish()
                .expect("Never fails"),
            releases: builder
                .counter("releases_total")
                .help("Number of released reservations")
                .finish()
                .expect("Never fails"),
            reserved_bytes: builder
                .gauge("reserved_bytes")
                .help("Size of the current reservation")
                .finish()
                .expect("Never fails"),
            committed_bytes: builder
                .gauge("committed_bytes")
                .help("Size of the current committed region")
                .finish()
                .expect("Never fails"),
        }
    }

    pub(crate) fn count_commit(&self, bytes: usize, committed: usize) {
        self.commits.increment();
        self.committed_bytes_total.add_u64(bytes as u64);
        self.committed_bytes.set(committed as f64);
    }

    pub(crate) fn count_decommit(&self, bytes: usize, committed: usize) {
        self.decommitted_bytes.add_u64(bytes as u64);
        self.committed_bytes.set(committed as f64);
    }
}
