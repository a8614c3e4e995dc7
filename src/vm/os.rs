use libc::{self, c_int, c_void};
use std::io;
use std::ptr::NonNull;

use crate::vm::{page_range, ReservationTable, VirtualMemory};
use crate::{Error, ErrorKind, Result};

// `MAP_NORESERVE`は付けない(付けるとコミット時の`mprotect`が commit charge の対象外になる)
const RESERVE_FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

/// OSの仮想メモリ機構を用いた`VirtualMemory`の実装.
///
/// 各操作は以下のシステムコールに対応する:
///
/// - 予約: `mmap(PROT_NONE)`
/// - コミット: `mprotect(PROT_READ | PROT_WRITE)`
///   - 物理メモリの確保量(commit charge)が計上されるのはこの時点で、上限を超える場合には失敗する
/// - デコミット: 同じ範囲を`MAP_FIXED`で`PROT_NONE`の無名ページに置き換える
/// - 解放: `munmap`
///
/// 物理ページが実際に割り当てられるのは、コミット済みの範囲に初めてアクセスした時点となる.
/// また、新たに割り当てられたページの内容は常にゼロである.
///
/// インスタンスの破棄時には、解放されずに残っている予約は全て解放される.
#[derive(Debug)]
pub struct OsVm {
    page_size: usize,
    reservations: ReservationTable<()>,
}
impl OsVm {
    /// 新しい`OsVm`インスタンスを生成する.
    ///
    /// ページサイズは`sysconf(_SC_PAGESIZE)`から取得される.
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 {
            page_size as usize
        } else {
            4096
        };
        OsVm {
            page_size,
            reservations: ReservationTable::new(),
        }
    }

    fn map_none(&self, address: *mut c_void, size: usize, flags: c_int) -> Result<*mut c_void> {
        let ptr = unsafe { libc::mmap(address, size, libc::PROT_NONE, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(track!(Error::from(io::Error::last_os_error())));
        }
        Ok(ptr)
    }
}
impl Default for OsVm {
    fn default() -> Self {
        Self::new()
    }
}
impl VirtualMemory for OsVm {
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

        let ptr = track!(self.map_none(std::ptr::null_mut(), size, RESERVE_FLAGS))?;
        let ptr = track_assert_some!(
            NonNull::new(ptr as *mut u8),
            ErrorKind::PlatformFailure
        );
        self.reservations.insert(ptr.as_ptr() as usize, size, ());
        Ok(ptr)
    }

    fn commit(&mut self, address: NonNull<u8>, size: usize) -> Result<()> {
        let (start, len) = page_range(address.as_ptr() as usize, size, self.page_size);
        track!(self.reservations.find_mut(start, len))?;
        if len == 0 {
            return Ok(());
        }

        let status = unsafe {
            libc::mprotect(
                start as *mut c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if status != 0 {
            track_io!(Err(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    unsafe fn decommit(&mut self, address: NonNull<u8>, size: usize) -> Result<()> {
        let (address, size, _, _) =
            track!(self.reservations.resolve_mut(address.as_ptr() as usize, size))?;
        let (start, len) = page_range(address, size, self.page_size);
        if len == 0 {
            return Ok(());
        }

        // 無名マッピングで上書きすることで、物理ページを返却しつつ内容をゼロに戻す
        track!(self.map_none(start as *mut c_void, len, RESERVE_FLAGS | libc::MAP_FIXED))?;
        Ok(())
    }

    unsafe fn release(&mut self, address: NonNull<u8>) -> Result<()> {
        let (size, ()) = track!(self.reservations.remove(address.as_ptr() as usize))?;
        if libc::munmap(address.as_ptr() as *mut c_void, size) != 0 {
            track_io!(Err(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}
impl Drop for OsVm {
    fn drop(&mut self) {
        for (base, size, ()) in self.reservations.drain() {
            unsafe {
                libc::munmap(base as *mut c_void, size);
            }
        }
    }
}
