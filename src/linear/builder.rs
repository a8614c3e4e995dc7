use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::cmp;

use crate::align::Alignment;
use crate::linear::options::{
    FailurePolicy, LinearAllocatorOptions, DEFAULT_COMMIT_CHUNK_SIZE, DEFAULT_RESERVATION_SIZE,
};
use crate::linear::LinearAllocator;
use crate::metrics::LinearAllocatorMetrics;
use crate::vm::VirtualMemory;
use crate::{ErrorKind, Result};

/// `LinearAllocator`のビルダ.
#[derive(Debug, Clone)]
pub struct LinearAllocatorBuilder {
    reservation_size: usize,
    commit_chunk_size: Option<usize>,
    failure_policy: FailurePolicy,
    logger: Logger,
    metrics: MetricBuilder,
}
impl LinearAllocatorBuilder {
    /// 新しい`LinearAllocatorBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        LinearAllocatorBuilder {
            reservation_size: DEFAULT_RESERVATION_SIZE,
            commit_chunk_size: None,
            failure_policy: FailurePolicy::default(),
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// アロケータが予約するアドレス空間のサイズを設定する.
    ///
    /// これがアロケータ一つあたりの割当可能量の上限となる.
    /// 予約は最初の割当時に一度だけ行われ、その後にサイズが変わることはない.
    ///
    /// コミット単位の倍数である必要があり、そうではない場合には`finish()`がエラーを返す.
    ///
    /// デフォルト値は`DEFAULT_RESERVATION_SIZE`(64bit環境では4GB).
    pub fn reservation_size(&mut self, size: usize) -> &mut Self {
        self.reservation_size = size;
        self
    }

    /// コミット単位(チャンクサイズ)を設定する.
    ///
    /// カーソルがコミット済み領域を超える度に、不足分をこの値の倍数に切り上げたサイズがコミットされる.
    /// 大きくするほどシステムコールの回数は減るが、未使用の物理メモリが増えることになる.
    ///
    /// 二の冪、かつ、仮想メモリのページサイズの倍数である必要がある.
    ///
    /// デフォルト値は`DEFAULT_COMMIT_CHUNK_SIZE`と仮想メモリのページサイズの大きい方.
    pub fn commit_chunk_size(&mut self, size: usize) -> &mut Self {
        self.commit_chunk_size = Some(size);
        self
    }

    /// 仮想メモリ操作の失敗時の振る舞いを設定する.
    ///
    /// デフォルト値は`FailurePolicy::Panic`.
    pub fn failure_policy(&mut self, policy: FailurePolicy) -> &mut Self {
        self.failure_policy = policy;
        self
    }

    /// アロケータ用の logger を登録する.
    ///
    /// デフォルトでは、ログは破棄される.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// 指定の仮想メモリを用いる`LinearAllocator`インスタンスを生成する.
    ///
    /// この時点ではアドレス空間の予約は行われない.
    ///
    /// # Errors
    ///
    /// 以下の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される:
    ///
    /// - コミット単位が二の冪ではない
    /// - コミット単位がページサイズの倍数ではない
    /// - 予約サイズが`0`、もしくはコミット単位の倍数ではない
    pub fn finish<V>(&self, vm: V) -> Result<LinearAllocator<V>>
    where
        V: VirtualMemory,
    {
        let page_size = vm.page_size();
        let chunk_size = self
            .commit_chunk_size
            .unwrap_or_else(|| cmp::max(DEFAULT_COMMIT_CHUNK_SIZE, page_size));
        let chunk_size = track!(Alignment::new(chunk_size))?;
        track_assert!(
            chunk_size.as_usize() % page_size == 0,
            ErrorKind::InvalidInput,
            "Commit chunk size must be a multiple of the page size: chunk={}, page={}",
            chunk_size.as_usize(),
            page_size
        );
        track_assert!(
            self.reservation_size > 0 && chunk_size.is_aligned(self.reservation_size),
            ErrorKind::InvalidInput,
            "Reservation size must be a non-zero multiple of the commit chunk size: reservation={}, chunk={}",
            self.reservation_size,
            chunk_size.as_usize()
        );

        let options = LinearAllocatorOptions {
            reservation_size: self.reservation_size,
            commit_chunk_size: chunk_size,
            failure_policy: self.failure_policy,
        };
        let metrics = LinearAllocatorMetrics::new(&self.metrics);
        Ok(LinearAllocator::with_options(
            vm,
            options,
            self.logger.clone(),
            metrics,
        ))
    }
}
impl Default for LinearAllocatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
