//! 仮想アドレス空間上の線形(バンプポインタ)アロケータ.
//!
//! # 領域の構成
//!
//! ```text
//! base                cursor         committed                       base + reservation_size
//!  |-------------------|---------------|------------------------------|
//!  |   割当済み(in-use) |  コミット済み  |       予約のみ(物理メモリなし)  |
//! ```
//!
//! - 予約: 最初の割当時に`reservation_size`分のアドレス空間を一度だけ確保する
//! - コミット: カーソルがコミット済み領域を超える度に、チャンク単位で物理メモリを割り当てる
//! - 割当: カーソルをアライメント境界に揃えた上で、要求サイズ分だけ進める
//!
//! 個々のオブジェクトの解放は行わない.
//! 回収は「以前に記録した位置(`Mark`)へのリセット」か「予約全体の解放」のみ.
use slog::Logger;
use std::alloc::Layout;
use std::cell::{Cell, Ref, RefCell};
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use trackable::error::ErrorKindExt;

pub use self::builder::LinearAllocatorBuilder;
pub use self::options::{
    FailurePolicy, LinearAllocatorOptions, DEFAULT_COMMIT_CHUNK_SIZE, DEFAULT_RESERVATION_SIZE,
};
pub use self::scope::Scope;
pub use self::sub_arena::SubArena;

use crate::align::Alignment;
use crate::metrics::LinearAllocatorMetrics;
use crate::vm::VirtualMemory;
use crate::{Error, ErrorKind, Result};

mod builder;
mod options;
mod scope;
mod sub_arena;

/// アロケータ上の位置(カーソル値)を記録したもの.
///
/// `mark()`で取得し、`reset_to()`に渡すことで、その時点以降の割当を一括して回収できる.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mark(usize);
impl Mark {
    /// 領域の先頭からのオフセット(バイト単位)を返す.
    pub fn offset(self) -> usize {
        self.0
    }
}

/// バンプポインタ方式の割当を行うアロケータ群の共通インターフェース.
///
/// 実装者は`allocate_aligned`のみを提供すればよく、型付きの割当メソッド群はそれを元に実装される.
///
/// 返される参照は、アロケータが次に`&mut self`を要求する操作(e.g., `reset_to`)を行うまで有効である.
/// その制約は借用規則によって強制される.
///
/// 型付きの割当メソッド群は、`allocate_aligned`が返した領域の長さとアライメントを検証してから値を書き込む.
/// 要求を満たさない領域が返された場合には、種類が`ErrorKind::InconsistentState`のエラーとなる.
pub trait Allocate {
    /// アライメント境界に揃えた`size`バイトの領域を割り当てる.
    ///
    /// 返される領域は常にゼロで初期化されている.
    ///
    /// # Errors
    ///
    /// 領域が足りない場合には、種類が`ErrorKind::OutOfSpace`のエラーが返される.
    /// その際、アロケータの状態は変更されない.
    #[allow(clippy::mut_from_ref)]
    fn allocate_aligned(&self, size: usize, align: Alignment) -> Result<&mut [u8]>;

    /// `size`バイトの領域を、`align`の境界に揃えて割り当てる.
    ///
    /// `size`が`0`の場合も有効で、カーソルはアライメント境界までは進められる.
    ///
    /// # Errors
    ///
    /// - `align`が二の冪ではない場合には、種類が`ErrorKind::InvalidInput`のエラーが返される
    /// - 領域が足りない場合には、種類が`ErrorKind::OutOfSpace`のエラーが返される
    #[allow(clippy::mut_from_ref)]
    fn allocate(&self, size: usize, align: usize) -> Result<&mut [u8]> {
        let align = track!(Alignment::new(align))?;
        track!(self.allocate_aligned(size, align))
    }

    /// `layout`に従った領域を割り当てる.
    #[allow(clippy::mut_from_ref)]
    fn allocate_layout(&self, layout: Layout) -> Result<&mut [u8]> {
        let align = track!(Alignment::new(layout.align()))?;
        track!(self.allocate_aligned(layout.size(), align))
    }

    /// `value`を格納するための領域を割り当て、そこに`value`を移動する.
    ///
    /// 格納された値のデストラクタは実行されない.
    #[allow(clippy::mut_from_ref)]
    fn alloc<T>(&self, value: T) -> Result<&mut T> {
        let bytes = track!(self.allocate_layout(Layout::new::<T>()))?;
        let ptr = track!(typed_ptr::<T>(bytes, 1))?;
        unsafe {
            ptr::write(ptr, value);
            Ok(&mut *ptr)
        }
    }

    /// `src`の複製を割り当てる.
    #[allow(clippy::mut_from_ref)]
    fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<&mut [T]> {
        let layout = track!(
            Layout::array::<T>(src.len()).map_err(|e| ErrorKind::InvalidInput.cause(e))
        )?;
        let bytes = track!(self.allocate_layout(layout))?;
        let ptr = track!(typed_ptr::<T>(bytes, src.len()))?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len());
            Ok(slice::from_raw_parts_mut(ptr, src.len()))
        }
    }

    /// 要素数`len`の配列を割り当て、`i`番目の要素を`f(i)`で初期化する.
    ///
    /// 格納された値のデストラクタは実行されない.
    #[allow(clippy::mut_from_ref)]
    fn alloc_slice_fill_with<T, F>(&self, len: usize, mut f: F) -> Result<&mut [T]>
    where
        F: FnMut(usize) -> T,
    {
        let layout =
            track!(Layout::array::<T>(len).map_err(|e| ErrorKind::InvalidInput.cause(e)))?;
        let bytes = track!(self.allocate_layout(layout))?;
        let ptr = track!(typed_ptr::<T>(bytes, len))?;
        unsafe {
            for i in 0..len {
                ptr::write(ptr.add(i), f(i));
            }
            Ok(slice::from_raw_parts_mut(ptr, len))
        }
    }
}

/// `bytes`が要素数`len`の`T`の配列を格納可能かを検証した上で、その先頭ポインタを返す.
fn typed_ptr<T>(bytes: &mut [u8], len: usize) -> Result<*mut T> {
    let size = track_assert_some!(
        mem::size_of::<T>().checked_mul(len),
        ErrorKind::InvalidInput
    );
    track_assert!(
        bytes.len() >= size,
        ErrorKind::InconsistentState,
        "Too short region: len={}, required={}",
        bytes.len(),
        size
    );
    let ptr = bytes.as_mut_ptr();
    track_assert!(
        Alignment::of::<T>().is_aligned(ptr as usize),
        ErrorKind::InconsistentState,
        "Misaligned region: ptr={:p}, align={}",
        ptr,
        mem::align_of::<T>()
    );
    Ok(ptr as *mut T)
}

/// 予約済みのアドレス範囲とカーソルの状態.
///
/// `cursor`と`committed`は`base`からのオフセット.
#[derive(Debug, Clone, Copy)]
struct Region {
    base: NonNull<u8>,
    cursor: usize,
    committed: usize,
}

/// 仮想アドレス空間を段階的にコミットしながら割当を行う線形アロケータ.
///
/// 最初の割当時に`reservation_size`分のアドレス空間を予約し、
/// カーソルがコミット済み領域を超える度に、チャンク単位でコミットを行う.
///
/// 割り当てた領域を個別に解放することはできない.
/// `reset_to`で以前の位置までカーソルを戻すか、`release_all`で予約全体を解放する.
///
/// # スレッド安全性
///
/// 内部状態の更新に同期は行わないので、複数スレッドから同時に使用することはできない(`!Sync`).
/// 並行して割当を行いたい場合には、スレッド毎にインスタンスを用意すること.
///
/// # Examples
///
/// ```
/// use vmlinear::{Allocate, LinearAllocatorBuilder};
/// use vmlinear::vm::HeapVm;
///
/// let mut allocator = LinearAllocatorBuilder::new()
///     .reservation_size(1024 * 1024)
///     .finish(HeapVm::new())
///     .unwrap();
///
/// let mark = allocator.mark();
/// let x = allocator.alloc(10u32).unwrap();
/// let ys = allocator.alloc_slice_copy(&[1u64, 2, 3]).unwrap();
/// assert_eq!(*x, 10);
/// assert_eq!(ys, &[1, 2, 3]);
///
/// allocator.reset_to(mark);
/// assert_eq!(allocator.allocated_bytes(), 0);
/// ```
#[derive(Debug)]
pub struct LinearAllocator<V: VirtualMemory> {
    vm: RefCell<V>,
    region: Cell<Option<Region>>,
    options: LinearAllocatorOptions,
    logger: Logger,
    metrics: LinearAllocatorMetrics,
}
unsafe impl<V: VirtualMemory + Send> Send for LinearAllocator<V> {}
impl<V: VirtualMemory> LinearAllocator<V> {
    /// デフォルト設定で新しい`LinearAllocator`インスタンスを生成する.
    ///
    /// `LinearAllocatorBuilder::new().finish(vm)`と等しい.
    pub fn new(vm: V) -> Result<Self> {
        track!(LinearAllocatorBuilder::new().finish(vm))
    }

    pub(crate) fn with_options(
        vm: V,
        options: LinearAllocatorOptions,
        logger: Logger,
        metrics: LinearAllocatorMetrics,
    ) -> Self {
        LinearAllocator {
            vm: RefCell::new(vm),
            region: Cell::new(None),
            options,
            logger,
            metrics,
        }
    }

    /// アロケータの設定を返す.
    pub fn options(&self) -> &LinearAllocatorOptions {
        &self.options
    }

    /// アロケータのメトリクスを返す.
    pub fn metrics(&self) -> &LinearAllocatorMetrics {
        &self.metrics
    }

    /// 内部で使用している仮想メモリを返す.
    ///
    /// # Panics
    ///
    /// 割当処理の途中(e.g., `alloc_slice_fill_with`の初期化関数内)でコミットが発生している最中に
    /// 呼び出した場合にはパニックする. 通常の使い方では、そのような状況は起こらない.
    pub fn vm(&self) -> Ref<V> {
        self.vm.borrow()
    }

    /// アドレス空間の予約が行われているかどうかを返す.
    pub fn is_initialized(&self) -> bool {
        self.region.get().is_some()
    }

    /// 予約済みのバイト数を返す.
    ///
    /// 未初期化の場合には`0`.
    pub fn reserved_bytes(&self) -> usize {
        if self.is_initialized() {
            self.options.reservation_size
        } else {
            0
        }
    }

    /// コミット済みのバイト数を返す.
    pub fn committed_bytes(&self) -> usize {
        self.region.get().map_or(0, |r| r.committed)
    }

    /// 使用済み(カーソルより前方)のバイト数を返す.
    ///
    /// アライメントのための隙間も含まれる.
    pub fn allocated_bytes(&self) -> usize {
        self.region.get().map_or(0, |r| r.cursor)
    }

    /// 予約の先頭アドレスを返す.
    ///
    /// 未初期化の場合には`None`.
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.region.get().map(|r| r.base)
    }

    /// アライメント`align`の割当要求として、あと何バイトまで受け付け可能かを返す.
    ///
    /// 結果は`align`の倍数に切り捨てられる.
    pub fn aligned_bytes_left(&self, align: Alignment) -> usize {
        let reserved = self.options.reservation_size;
        let left = match self.region.get() {
            None => reserved,
            Some(region) => {
                let base = region.base.as_ptr() as usize;
                align
                    .ceil_align(base + region.cursor)
                    .map_or(0, |aligned| reserved.saturating_sub(aligned - base))
            }
        };
        align.floor_align(left)
    }

    /// 現在のカーソル位置を返す.
    ///
    /// 未初期化の場合には、先頭を指す`Mark`が返される.
    pub fn mark(&self) -> Mark {
        Mark(self.allocated_bytes())
    }

    /// カーソルを`mark`の位置まで戻す.
    ///
    /// `mark`以降に割り当てた領域は、以後の割当で再利用される.
    /// この時点ではデコミットもゼロ埋めも行われない(再利用時に割当処理がゼロ埋めを行う).
    ///
    /// # Panics
    ///
    /// `mark`が現在のカーソルよりも後方を指している場合にはパニックする.
    pub fn reset_to(&mut self, mark: Mark) {
        let cursor = self.allocated_bytes();
        assert!(
            mark.0 <= cursor,
            "Invalid mark: mark={}, cursor={}",
            mark.0,
            cursor
        );
        if let Some(mut region) = self.region.get() {
            region.cursor = mark.0;
            self.region.set(Some(region));
        }
        self.metrics.resets.increment();
        debug!(self.logger, "Reset cursor"; "from" => cursor, "to" => mark.0);
    }

    /// カーソルを先頭まで戻す.
    pub fn reset(&mut self) {
        self.reset_to(Mark(0));
    }

    /// スコープを開始する.
    ///
    /// 返り値のガードを通して割り当てた領域は、ガードの破棄時にまとめて回収される.
    pub fn scope(&mut self) -> Scope<V> {
        Scope::new(self)
    }

    /// `capacity`バイトの部分領域を割り当て、その上で動作する`SubArena`を生成する.
    ///
    /// # Errors
    ///
    /// 領域が足りない場合には、種類が`ErrorKind::OutOfSpace`のエラーが返される.
    pub fn sub_arena(&self, capacity: usize) -> Result<SubArena> {
        let bytes = track!(self.allocate_aligned(capacity, SubArena::ALIGN))?;
        Ok(SubArena::new(bytes))
    }

    /// カーソルより後方にある、未使用のチャンクをデコミットする.
    ///
    /// 解放されるのはチャンク全体がカーソルより後方にあるもののみ.
    pub fn trim(&mut self) -> Result<()> {
        let mut region = match self.region.get() {
            None => return Ok(()),
            Some(region) => region,
        };
        let keep = self
            .options
            .commit_chunk_size
            .ceil_align(region.cursor)
            .expect("Never fails");
        if keep >= region.committed {
            return Ok(());
        }

        let size = region.committed - keep;
        let address = unsafe { NonNull::new_unchecked(region.base.as_ptr().add(keep)) };
        if let Err(e) = unsafe { self.vm.get_mut().decommit(address, size) } {
            return Err(track!(self.handle_vm_error(e, "decommit")));
        }
        region.committed = keep;
        self.region.set(Some(region));

        self.metrics.count_decommit(size, keep);
        debug!(self.logger, "Decommitted {} bytes of memory", size; "committed" => keep);
        Ok(())
    }

    /// 予約全体を解放する.
    ///
    /// アロケータは未初期化状態に戻り、次の割当時に改めて予約が行われる.
    pub fn release_all(&mut self) -> Result<()> {
        let region = match self.region.get() {
            None => return Ok(()),
            Some(region) => region,
        };
        if let Err(e) = unsafe { self.vm.get_mut().release(region.base) } {
            return Err(track!(self.handle_vm_error(e, "release")));
        }
        self.region.set(None);

        self.metrics.releases.increment();
        self.metrics.reserved_bytes.set(0.0);
        self.metrics.committed_bytes.set(0.0);
        debug!(self.logger, "Released {} bytes of memory", self.options.reservation_size;
               "committed" => region.committed, "cursor" => region.cursor);
        Ok(())
    }

    fn region(&self) -> Result<Region> {
        if let Some(region) = self.region.get() {
            return Ok(region);
        }

        let size = self.options.reservation_size;
        let reserved = self.vm.borrow_mut().reserve(size);
        let base = match reserved {
            Ok(base) => base,
            Err(e) => return Err(track!(self.handle_vm_error(e, "reserve"))),
        };
        let region = Region {
            base,
            cursor: 0,
            committed: 0,
        };
        self.region.set(Some(region));

        self.metrics.reserved_bytes.set(size as f64);
        debug!(self.logger, "Reserved {} bytes of memory", size; "base" => format!("{:p}", base));
        Ok(region)
    }

    /// `end`(オフセット)までをカバーするようにコミット済み領域を広げる.
    fn grow(&self, region: &mut Region, end: usize) -> Result<()> {
        let reserved = self.options.reservation_size;
        debug_assert!(region.committed < end && end <= reserved);

        let overhang = end - region.committed;
        let size = self
            .options
            .commit_chunk_size
            .ceil_align(overhang)
            .unwrap_or(reserved)
            .min(reserved - region.committed);
        let address = unsafe { NonNull::new_unchecked(region.base.as_ptr().add(region.committed)) };
        let committed = self.vm.borrow_mut().commit(address, size);
        if let Err(e) = committed {
            return Err(track!(self.handle_vm_error(e, "commit")));
        }
        region.committed += size;

        self.metrics.count_commit(size, region.committed);
        debug!(self.logger, "Committed {} bytes of memory", size; "committed" => region.committed);
        Ok(())
    }

    fn handle_vm_error(&self, e: Error, operation: &str) -> Error {
        if *e.kind() != ErrorKind::PlatformFailure {
            return e;
        }
        self.metrics.platform_failures.increment();
        crit!(self.logger, "Virtual memory operation failed: {}", e; "operation" => operation);
        if self.options.failure_policy == FailurePolicy::Panic {
            panic!("Failed to {} virtual memory: {}", operation, e);
        }
        e
    }
}
impl<V: VirtualMemory> Allocate for LinearAllocator<V> {
    fn allocate_aligned(&self, size: usize, align: Alignment) -> Result<&mut [u8]> {
        let mut region = track!(self.region())?;
        let reserved = self.options.reservation_size;

        // 予約の先頭はページ境界に揃っているが、それより大きなアライメントにも対応するために実アドレスで計算する
        let base = region.base.as_ptr() as usize;
        let aligned = align
            .ceil_align(base + region.cursor)
            .map(|address| address - base);
        let end = aligned.and_then(|aligned| aligned.checked_add(size).map(|end| (aligned, end)));
        let (aligned, end) = match end {
            Some((aligned, end)) if end <= reserved => (aligned, end),
            _ => {
                self.metrics.out_of_space_failures.increment();
                track_panic!(
                    ErrorKind::OutOfSpace,
                    "size={}, align={}, cursor={}, reserved={}",
                    size,
                    align.as_usize(),
                    region.cursor,
                    reserved
                );
            }
        };

        if end > region.committed {
            track!(self.grow(&mut region, end))?;
        }

        let ptr = unsafe { region.base.as_ptr().add(aligned) };
        unsafe { ptr::write_bytes(ptr, 0, size) };
        region.cursor = end;
        self.region.set(Some(region));

        self.metrics.allocations.increment();
        self.metrics.allocated_bytes.add_u64(size as u64);
        debug!(self.logger, "Allocated {} bytes", size;
               "align" => align.as_usize(), "offset" => aligned, "cursor" => end);
        Ok(unsafe { slice::from_raw_parts_mut(ptr, size) })
    }
}
impl<V: VirtualMemory> Drop for LinearAllocator<V> {
    fn drop(&mut self) {
        if let Some(region) = self.region.get() {
            if let Err(e) = unsafe { self.vm.get_mut().release(region.base) } {
                warn!(self.logger, "Cannot release the reservation: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::vm::{HeapVm, HeapVmBuilder};

    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;

    fn allocator(reservation_size: usize) -> Result<LinearAllocator<HeapVm>> {
        track!(LinearAllocatorBuilder::new()
            .reservation_size(reservation_size)
            .commit_chunk_size(4 * KB)
            .finish(HeapVm::new()))
    }

    fn offset(allocator: &LinearAllocator<HeapVm>, bytes: &[u8]) -> usize {
        bytes.as_ptr() as usize - allocator.base().map_or(0, |b| b.as_ptr() as usize)
    }

    #[test]
    fn lazy_initialization() -> TestResult {
        let allocator = track!(allocator(MB))?;
        assert!(!allocator.is_initialized());
        assert_eq!(allocator.reserved_bytes(), 0);
        assert_eq!(allocator.vm().reservation_count(), 0);

        track!(allocator.allocate(1, 1))?;
        assert!(allocator.is_initialized());
        assert_eq!(allocator.reserved_bytes(), MB);
        assert_eq!(allocator.committed_bytes(), 4 * KB);
        assert_eq!(allocator.vm().reservation_count(), 1);
        assert_eq!(allocator.metrics().reserved_bytes(), MB as u64);
        Ok(())
    }

    #[test]
    fn example_scenario() -> TestResult {
        let allocator = track!(allocator(MB))?;

        let int = track!(allocator.allocate(4, 4))?;
        assert_eq!(offset(&allocator, int), 0);
        assert_eq!(allocator.allocated_bytes(), 4);
        assert_eq!(allocator.committed_bytes(), 4 * KB);

        let s = track!(allocator.allocate(16, 8))?;
        assert_eq!(offset(&allocator, s), 8);
        assert_eq!(allocator.allocated_bytes(), 24);

        let array = track!(allocator.allocate(80_000, 8))?;
        assert_eq!(offset(&allocator, array), 24);
        assert_eq!(allocator.allocated_bytes(), 80_024);
        assert_eq!(allocator.committed_bytes(), 81_920);
        assert_eq!(allocator.vm().committed_bytes(), 81_920);
        assert_eq!(allocator.metrics().commits(), 2);
        Ok(())
    }

    #[test]
    fn alignment_and_non_overlap() -> TestResult {
        let allocator = track!(allocator(MB))?;
        let mut prev_end = 0;
        let aligns = [1usize, 2, 8, 4, 16, 64, 1, 4096, 32];
        for (i, &align) in aligns.iter().cycle().take(200).enumerate() {
            let size = (i * 37) % 300;
            let before = allocator.allocated_bytes();
            let bytes = track!(allocator.allocate(size, align))?;
            assert_eq!(bytes.as_ptr() as usize % align, 0);
            assert_eq!(bytes.len(), size);

            let start = offset(&allocator, bytes);
            assert!(prev_end <= start);
            prev_end = start + size;
            assert!(before <= allocator.allocated_bytes());
            assert!(allocator.allocated_bytes() <= allocator.committed_bytes());
        }
        Ok(())
    }

    #[test]
    fn alignment_larger_than_page() -> TestResult {
        let allocator = track!(allocator(MB))?;
        track!(allocator.allocate(1, 1))?;
        let bytes = track!(allocator.allocate(8, 64 * KB))?;
        assert_eq!(bytes.as_ptr() as usize % (64 * KB), 0);
        Ok(())
    }

    #[test]
    fn invalid_alignment() -> TestResult {
        let allocator = track!(allocator(MB))?;
        assert_eq!(
            allocator.allocate(8, 3).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        assert_eq!(
            allocator.allocate(8, 0).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }

    #[test]
    fn zero_sized_allocation() -> TestResult {
        let allocator = track!(allocator(MB))?;
        track!(allocator.allocate(3, 1))?;
        let empty = track!(allocator.allocate(0, 8))?;
        assert!(empty.is_empty());
        assert_eq!(offset(&allocator, empty), 8);
        assert_eq!(allocator.allocated_bytes(), 8);
        Ok(())
    }

    #[test]
    fn zero_initialized_after_reset() -> TestResult {
        let mut allocator = track!(allocator(MB))?;
        let mark = allocator.mark();
        {
            let bytes = track!(allocator.allocate(10 * KB, 8))?;
            assert!(bytes.iter().all(|&b| b == 0));
            for b in bytes.iter_mut() {
                *b = 0xFF;
            }
        }
        allocator.reset_to(mark);
        assert_eq!(allocator.allocated_bytes(), 0);
        assert_eq!(allocator.committed_bytes(), 12 * KB);

        let bytes = track!(allocator.allocate(10 * KB, 8))?;
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(allocator.metrics().resets(), 1);
        Ok(())
    }

    #[test]
    fn reset_reproduces_addresses() -> TestResult {
        let mut allocator = track!(allocator(MB))?;
        track!(allocator.allocate(5, 1))?;
        let mark = allocator.mark();
        let first = track!(allocator.allocate(100, 16))?.as_ptr() as usize;
        track!(allocator.allocate(1000, 8))?;

        allocator.reset_to(mark);
        let second = track!(allocator.allocate(100, 16))?.as_ptr() as usize;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    #[should_panic]
    fn invalid_mark() {
        let mut allocator = allocator(MB).unwrap();
        allocator.allocate(100, 1).unwrap();
        let mark = allocator.mark();
        allocator.reset();
        allocator.reset_to(mark);
    }

    #[test]
    fn out_of_space() -> TestResult {
        let allocator = track!(allocator(64 * KB))?;
        track!(allocator.allocate(60 * KB, 1))?;
        let cursor = allocator.allocated_bytes();
        let committed = allocator.committed_bytes();

        assert_eq!(
            allocator.allocate(5 * KB, 1).err().map(|e| *e.kind()),
            Some(ErrorKind::OutOfSpace)
        );
        assert_eq!(
            allocator.allocate(usize::max_value(), 1).err().map(|e| *e.kind()),
            Some(ErrorKind::OutOfSpace)
        );
        assert_eq!(
            allocator.allocate(4 * KB + 1, 8).err().map(|e| *e.kind()),
            Some(ErrorKind::OutOfSpace)
        );
        assert_eq!(allocator.allocated_bytes(), cursor);
        assert_eq!(allocator.committed_bytes(), committed);
        assert_eq!(allocator.metrics().out_of_space_failures(), 3);

        // ちょうど収まる要求は成功する
        let rest = allocator.aligned_bytes_left(Alignment::default());
        assert_eq!(rest, 4 * KB);
        track!(allocator.allocate(rest, 1))?;
        assert_eq!(allocator.allocated_bytes(), 64 * KB);
        assert_eq!(allocator.committed_bytes(), 64 * KB);
        Ok(())
    }

    #[test]
    fn commit_growth() -> TestResult {
        let allocator = track!(allocator(MB))?;
        let mut prev_committed = 0;
        for _ in 0..50 {
            track!(allocator.allocate(3001, 8))?;
            let committed = allocator.committed_bytes();
            assert_eq!((committed - prev_committed) % (4 * KB), 0);
            assert!(committed >= allocator.allocated_bytes());
            prev_committed = committed;
        }
        assert_eq!(allocator.vm().committed_bytes(), prev_committed);
        assert_eq!(
            allocator.metrics().committed_bytes(),
            prev_committed as u64
        );
        Ok(())
    }

    #[test]
    fn trim_works() -> TestResult {
        let mut allocator = track!(allocator(MB))?;
        track!(allocator.allocate(100 * KB, 8))?;
        assert_eq!(allocator.committed_bytes(), 100 * KB);

        allocator.reset();
        track!(allocator.allocate(5 * KB, 8))?;
        track!(allocator.trim())?;
        assert_eq!(allocator.committed_bytes(), 8 * KB);
        assert_eq!(allocator.vm().committed_bytes(), 8 * KB);
        assert_eq!(allocator.metrics().decommitted_bytes(), 92 * KB as u64);

        // 再度コミットされた領域もゼロで初期化されている
        let bytes = track!(allocator.allocate(50 * KB, 8))?;
        assert!(bytes.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn release_all_and_reinitialize() -> TestResult {
        let mut allocator = track!(allocator(MB))?;
        track!(allocator.allocate(10 * KB, 8))?;
        track!(allocator.release_all())?;
        assert!(!allocator.is_initialized());
        assert_eq!(allocator.committed_bytes(), 0);
        assert_eq!(allocator.vm().reservation_count(), 0);
        assert_eq!(allocator.vm().committed_bytes(), 0);
        assert_eq!(allocator.metrics().releases(), 1);

        // 二重解放は何もしない
        track!(allocator.release_all())?;

        let bytes = track!(allocator.allocate(8, 8))?;
        assert_eq!(offset(&allocator, bytes), 0);
        assert_eq!(allocator.vm().reservation_count(), 1);
        Ok(())
    }

    #[test]
    fn typed_allocations() -> TestResult {
        #[derive(Debug, PartialEq)]
        struct Item {
            integer: i32,
            string: &'static str,
        }

        let allocator = track!(allocator(MB))?;
        let x = track!(allocator.alloc(1234u32))?;
        let item = track!(allocator.alloc(Item {
            integer: 1234,
            string: "TestString",
        }))?;
        assert_eq!(*x, 1234);
        assert_eq!(item.string, "TestString");
        assert_eq!(item as *mut Item as usize % mem::align_of::<Item>(), 0);

        let items = track!(allocator.alloc_slice_fill_with(1000, |i| Item {
            integer: i as i32,
            string: "TestStringArray",
        }))?;
        assert_eq!(items.len(), 1000);
        assert_eq!(items[999].integer, 999);

        let values = track!(allocator.alloc_slice_fill_with(10_000, |i| i as u64))?;
        assert!(values.iter().enumerate().all(|(i, &v)| v == i as u64));

        let copied = track!(allocator.alloc_slice_copy(&[1u16, 2, 3]))?;
        assert_eq!(copied, &[1, 2, 3]);

        let cursor = allocator.allocated_bytes();
        track!(allocator.alloc(()))?;
        assert_eq!(allocator.allocated_bytes(), cursor);
        Ok(())
    }

    #[test]
    fn nested_allocation_inside_initializer() -> TestResult {
        let allocator = track!(allocator(MB))?;
        let outer = track!(allocator.alloc_slice_fill_with(4, |i| {
            allocator.alloc(i).map(|v| *v).unwrap_or(0)
        }))?;
        assert_eq!(outer, &[0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn platform_failure_is_propagated() -> TestResult {
        let vm = track!(HeapVmBuilder::new().commit_limit(8 * KB).finish())?;
        let allocator = track!(LinearAllocatorBuilder::new()
            .reservation_size(MB)
            .failure_policy(FailurePolicy::Propagate)
            .finish(vm))?;

        track!(allocator.allocate(6 * KB, 8))?;
        let cursor = allocator.allocated_bytes();
        assert_eq!(
            allocator.allocate(4 * KB, 8).err().map(|e| *e.kind()),
            Some(ErrorKind::PlatformFailure)
        );
        assert_eq!(allocator.allocated_bytes(), cursor);
        assert_eq!(allocator.committed_bytes(), 8 * KB);
        assert_eq!(allocator.metrics().platform_failures(), 1);

        // コミット済みの範囲に収まる要求は引き続き成功する
        track!(allocator.allocate(KB, 8))?;
        Ok(())
    }

    #[test]
    #[should_panic]
    fn platform_failure_panics_by_default() {
        let vm = HeapVmBuilder::new().commit_limit(4 * KB).finish().unwrap();
        let allocator = LinearAllocatorBuilder::new()
            .reservation_size(MB)
            .finish(vm)
            .unwrap();
        let _ = allocator.allocate(8 * KB, 8);
    }

    #[test]
    fn reserve_failure_is_propagated() -> TestResult {
        let vm = track!(HeapVmBuilder::new().reserve_limit(MB / 2).finish())?;
        let allocator = track!(LinearAllocatorBuilder::new()
            .reservation_size(MB)
            .failure_policy(FailurePolicy::Propagate)
            .finish(vm))?;

        assert_eq!(
            allocator.allocate(8, 8).err().map(|e| *e.kind()),
            Some(ErrorKind::PlatformFailure)
        );
        assert!(!allocator.is_initialized());
        assert_eq!(allocator.reserved_bytes(), 0);
        assert_eq!(allocator.committed_bytes(), 0);
        assert_eq!(allocator.vm().reservation_count(), 0);
        assert_eq!(allocator.metrics().platform_failures(), 1);
        assert_eq!(allocator.metrics().reserved_bytes(), 0);
        Ok(())
    }

    #[test]
    #[should_panic]
    fn reserve_failure_panics_by_default() {
        let vm = HeapVmBuilder::new().reserve_limit(MB / 2).finish().unwrap();
        let allocator = LinearAllocatorBuilder::new()
            .reservation_size(MB)
            .finish(vm)
            .unwrap();
        let _ = allocator.allocate(8, 8);
    }

    /// デコミットが常に失敗する仮想メモリ.
    #[derive(Debug)]
    struct UndecommittableVm(HeapVm);
    impl VirtualMemory for UndecommittableVm {
        fn page_size(&self) -> usize {
            self.0.page_size()
        }
        fn reserve(&mut self, size: usize) -> Result<NonNull<u8>> {
            track!(self.0.reserve(size))
        }
        fn commit(&mut self, address: NonNull<u8>, size: usize) -> Result<()> {
            track!(self.0.commit(address, size))
        }
        unsafe fn decommit(&mut self, address: NonNull<u8>, size: usize) -> Result<()> {
            track_panic!(
                ErrorKind::PlatformFailure,
                "address={:p}, size={}",
                address,
                size
            );
        }
        unsafe fn release(&mut self, address: NonNull<u8>) -> Result<()> {
            track!(self.0.release(address))
        }
    }

    #[test]
    fn trim_failure_is_propagated() -> TestResult {
        let mut allocator = track!(LinearAllocatorBuilder::new()
            .reservation_size(MB)
            .failure_policy(FailurePolicy::Propagate)
            .finish(UndecommittableVm(HeapVm::new())))?;
        track!(allocator.allocate(100 * KB, 8))?;
        allocator.reset();
        track!(allocator.allocate(KB, 8))?;

        assert_eq!(
            allocator.trim().err().map(|e| *e.kind()),
            Some(ErrorKind::PlatformFailure)
        );
        assert_eq!(allocator.committed_bytes(), 100 * KB);
        assert_eq!(allocator.allocated_bytes(), KB);
        assert_eq!(allocator.vm().0.committed_bytes(), 100 * KB);
        assert_eq!(allocator.metrics().decommitted_bytes(), 0);
        assert_eq!(allocator.metrics().platform_failures(), 1);

        // 失敗後も割当は継続できる
        let bytes = track!(allocator.allocate(10 * KB, 8))?;
        assert!(bytes.iter().all(|&b| b == 0));
        Ok(())
    }

    /// 要求よりも短い、あるいはアライメントの揃っていない領域を返す`Allocate`実装.
    struct Misbehaving {
        len: usize,
        misaligned: bool,
    }
    impl Allocate for Misbehaving {
        fn allocate_aligned(&self, _size: usize, _align: Alignment) -> Result<&mut [u8]> {
            let buf: &'static mut [u8] = Box::leak(vec![0u8; self.len + 16].into_boxed_slice());
            let aligned = (16 - buf.as_ptr() as usize % 16) % 16;
            let start = if self.misaligned { aligned + 1 } else { aligned };
            Ok(&mut buf[start..start + self.len])
        }
    }

    #[test]
    fn typed_allocations_verify_returned_region() {
        let short = Misbehaving {
            len: 1,
            misaligned: false,
        };
        assert_eq!(
            short.alloc(0u64).err().map(|e| *e.kind()),
            Some(ErrorKind::InconsistentState)
        );
        assert_eq!(
            short.alloc_slice_copy(&[1u16, 2]).err().map(|e| *e.kind()),
            Some(ErrorKind::InconsistentState)
        );

        let misaligned = Misbehaving {
            len: 64,
            misaligned: true,
        };
        assert_eq!(
            misaligned.alloc(0u64).err().map(|e| *e.kind()),
            Some(ErrorKind::InconsistentState)
        );
        assert_eq!(
            misaligned
                .alloc_slice_fill_with(4, |i| i as u32)
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::InconsistentState)
        );

        let fine = Misbehaving {
            len: 64,
            misaligned: false,
        };
        assert_eq!(fine.alloc(7u64).ok().map(|v| *v), Some(7));
    }

    #[test]
    fn aligned_bytes_left_is_a_multiple_of_alignment() -> TestResult {
        let allocator = track!(allocator(64 * KB))?;
        assert_eq!(allocator.aligned_bytes_left(Alignment::default()), 64 * KB);

        track!(allocator.allocate(3, 1))?;
        for &align in &[1, 8, 4096, 16 * KB, MB] {
            let align = track!(Alignment::new(align))?;
            let left = allocator.aligned_bytes_left(align);
            assert!(align.is_aligned(left));
            assert!(left < 64 * KB);
        }

        let align = track!(Alignment::new(8))?;
        let left = allocator.aligned_bytes_left(align);
        assert_eq!(left, 64 * KB - 8);
        track!(allocator.allocate_aligned(left, align))?;
        assert_eq!(allocator.aligned_bytes_left(align), 0);
        assert!(allocator.allocate(1, 1).is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn os_backed_allocator_works() -> TestResult {
        use crate::vm::OsVm;

        let mut allocator = track!(LinearAllocator::new(OsVm::new()))?;
        let values = track!(allocator.alloc_slice_fill_with(10_000, |i| i as u64))?;
        assert_eq!(values[9_999], 9_999);
        assert!(allocator.committed_bytes() >= 80_000);
        assert_eq!(allocator.reserved_bytes(), DEFAULT_RESERVATION_SIZE);

        allocator.reset();
        let bytes = track!(allocator.allocate(80_000, 8))?;
        assert!(bytes.iter().all(|&b| b == 0));

        track!(allocator.trim())?;
        track!(allocator.release_all())?;
        Ok(())
    }
}
