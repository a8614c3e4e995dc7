use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use trackable::error::ErrorKindExt;

use crate::vm::{page_range, ReservationTable, VirtualMemory};
use crate::{ErrorKind, Result};

/// `HeapVm`のビルダ.
#[derive(Debug, Clone)]
pub struct HeapVmBuilder {
    page_size: usize,
    reserve_limit: Option<usize>,
    commit_limit: Option<usize>,
}
impl HeapVmBuilder {
    /// デフォルト設定で`HeapVmBuilder`インスタンスを生成する.
    ///
    /// デフォルトでは、ページサイズは`4096`で、予約量およびコミット量の上限はない.
    pub fn new() -> Self {
        HeapVmBuilder {
            page_size: 4096,
            reserve_limit: None,
            commit_limit: None,
        }
    }

    /// ページサイズを設定する.
    ///
    /// 二の冪である必要があり、そうではない場合には`finish()`がエラーを返す.
    pub fn page_size(&mut self, page_size: usize) -> &mut Self {
        self.page_size = page_size;
        self
    }

    /// 同時に予約可能なバイト数の上限を設定する.
    ///
    /// 上限を超える予約要求は、種類が`ErrorKind::PlatformFailure`のエラーとなる.
    /// アドレス空間の枯渇を模擬するために使用する.
    pub fn reserve_limit(&mut self, limit: usize) -> &mut Self {
        self.reserve_limit = Some(limit);
        self
    }

    /// 同時にコミット可能なバイト数の上限を設定する.
    ///
    /// 上限を超えるコミット要求は、種類が`ErrorKind::PlatformFailure`のエラーとなる.
    /// 物理メモリの枯渇を模擬するために使用する.
    pub fn commit_limit(&mut self, limit: usize) -> &mut Self {
        self.commit_limit = Some(limit);
        self
    }

    /// 新しい`HeapVm`インスタンスを生成する.
    pub fn finish(&self) -> Result<HeapVm> {
        track_assert!(
            self.page_size.is_power_of_two(),
            ErrorKind::InvalidInput,
            "Invalid page size: {}",
            self.page_size
        );
        Ok(HeapVm {
            page_size: self.page_size,
            reserve_limit: self.reserve_limit,
            commit_limit: self.commit_limit,
            reserved_bytes: 0,
            committed_bytes: 0,
            reservations: ReservationTable::new(),
        })
    }
}
impl Default for HeapVmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// ヒープ上のバッファを用いて仮想メモリ操作を模擬する`VirtualMemory`の実装.
///
/// 予約時に(ゼロ初期化済みの)バッファを確保し、コミット状態をページ単位で管理する.
/// デコミットされたページはゼロで埋め直されるので、再コミット時の内容はOSの実装と同様にゼロとなる.
///
/// # 注意
///
/// これは主にテストや、OS実装が提供されていない環境向けの実装であり、
/// 予約時点で(少なくともアドレス空間上は)バッファ全体が確保される.
#[derive(Debug)]
pub struct HeapVm {
    page_size: usize,
    reserve_limit: Option<usize>,
    commit_limit: Option<usize>,
    reserved_bytes: usize,
    committed_bytes: usize,
    reservations: ReservationTable<HeapReservation>,
}
impl HeapVm {
    /// デフォルト設定で新しい`HeapVm`インスタンスを生成する.
    pub fn new() -> Self {
        HeapVm {
            page_size: 4096,
            reserve_limit: None,
            commit_limit: None,
            reserved_bytes: 0,
            committed_bytes: 0,
            reservations: ReservationTable::new(),
        }
    }

    /// 現在予約されているバイト数の合計を返す.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// 現在コミットされているバイト数の合計を返す.
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    /// 現在の予約数を返す.
    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// `address`を含むページがコミット済みかどうかを判定する.
    pub fn is_committed(&self, address: NonNull<u8>) -> bool {
        let page_size = self.page_size;
        match self.reservations.find(address.as_ptr() as usize, 1) {
            Ok((base, _, reservation)) => {
                reservation.pages[(address.as_ptr() as usize - base) / page_size]
            }
            Err(_) => false,
        }
    }
}
impl Default for HeapVm {
    fn default() -> Self {
        Self::new()
    }
}
impl VirtualMemory for HeapVm {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&mut self, size: usize) -> Result<NonNull<u8>> {
        track_assert_ne!(size, 0, ErrorKind::InvalidInput);
        let size = track_assert_some!(
            size.checked_add(self.page_size - 1),
            ErrorKind::InvalidInput
        );
        let size = size & !(self.page_size - 1);
        if let Some(limit) = self.reserve_limit {
            track_assert!(
                self.reserved_bytes + size <= limit,
                ErrorKind::PlatformFailure,
                "Reserve limit exceeded: reserved={}, requested={}, limit={}",
                self.reserved_bytes,
                size,
                limit
            );
        }
        let layout = track!(Layout::from_size_align(size, self.page_size)
            .map_err(|e| ErrorKind::InvalidInput.cause(e)))?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = track_assert_some!(
            NonNull::new(ptr),
            ErrorKind::PlatformFailure,
            "Cannot reserve {} bytes",
            size
        );
        let reservation = HeapReservation {
            layout,
            pages: vec![false; size / self.page_size],
        };
        self.reservations
            .insert(ptr.as_ptr() as usize, size, reservation);
        self.reserved_bytes += size;
        Ok(ptr)
    }

    fn commit(&mut self, address: NonNull<u8>, size: usize) -> Result<()> {
        let page_size = self.page_size;
        let (start, len) = page_range(address.as_ptr() as usize, size, page_size);
        let (base, _, reservation) = track!(self.reservations.find_mut(start, len))?;

        let first = (start - base) / page_size;
        let pages = &mut reservation.pages[first..][..len / page_size];
        let newly = pages.iter().filter(|&&committed| !committed).count() * page_size;
        if let Some(limit) = self.commit_limit {
            track_assert!(
                self.committed_bytes + newly <= limit,
                ErrorKind::PlatformFailure,
                "Commit limit exceeded: committed={}, requested={}, limit={}",
                self.committed_bytes,
                newly,
                limit
            );
        }
        for page in pages.iter_mut() {
            *page = true;
        }
        self.committed_bytes += newly;
        Ok(())
    }

    unsafe fn decommit(&mut self, address: NonNull<u8>, size: usize) -> Result<()> {
        let page_size = self.page_size;
        let (address, size, base, reservation) =
            track!(self.reservations.resolve_mut(address.as_ptr() as usize, size))?;
        let (start, len) = page_range(address, size, page_size);

        let first = (start - base) / page_size;
        let mut released = 0;
        for page in &mut reservation.pages[first..][..len / page_size] {
            if *page {
                *page = false;
                released += page_size;
            }
        }
        ptr::write_bytes(start as *mut u8, 0, len);
        self.committed_bytes -= released;
        Ok(())
    }

    unsafe fn release(&mut self, address: NonNull<u8>) -> Result<()> {
        let (size, reservation) = track!(self.reservations.remove(address.as_ptr() as usize))?;
        self.reserved_bytes -= size;
        let committed = reservation.pages.iter().filter(|&&c| c).count();
        self.committed_bytes -= committed * self.page_size;
        alloc::dealloc(address.as_ptr(), reservation.layout);
        Ok(())
    }
}
impl Drop for HeapVm {
    fn drop(&mut self) {
        for (base, _, reservation) in self.reservations.drain() {
            unsafe { alloc::dealloc(base as *mut u8, reservation.layout) };
        }
    }
}

#[derive(Debug)]
struct HeapReservation {
    layout: Layout,
    pages: Vec<bool>,
}
