//! 仮想アドレス空間の予約・コミットを行うためのインターフェース定義と実装群.
//!
//! このモジュールは[LinearAllocator](../linear/struct.LinearAllocator.html)が利用する
//! アドレス空間を提供する. 割当ロジックは一切含まない.
use std::collections::BTreeMap;
use std::ptr::NonNull;

pub use self::heap::{HeapVm, HeapVmBuilder};
#[cfg(unix)]
pub use self::os::OsVm;

use crate::{ErrorKind, Result};

mod heap;
#[cfg(unix)]
mod os;

/// 仮想アドレス空間を表すトレイト.
///
/// 物理メモリを割り当てずにアドレス範囲だけを確保する"予約"と、
/// 予約済み範囲の一部に物理メモリを割り当てる"コミット"を分離して提供する.
///
/// 各操作は開始アドレスとバイト長で対象範囲を指定する.
/// コミットおよびデコミットの際には、範囲はページ境界に広げて扱われる.
///
/// 実行環境に起因する失敗(e.g., 物理メモリやアドレス空間の枯渇)は、
/// 種類が`ErrorKind::PlatformFailure`のエラーとして返される.
/// それを致命的なものとして扱うかどうかは、呼び出し側の判断に委ねられる.
pub trait VirtualMemory {
    /// コミットおよびデコミットの単位となるページサイズを返す.
    fn page_size(&self) -> usize;

    /// 物理メモリを伴わずに`size`バイトのアドレス空間を予約する.
    ///
    /// 返り値は予約範囲の先頭アドレス(ページ境界に揃っている).
    ///
    /// # Errors
    ///
    /// - `size`が`0`の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される
    /// - OSが予約に失敗した場合には、種類が`ErrorKind::PlatformFailure`のエラーが返される
    fn reserve(&mut self, size: usize) -> Result<NonNull<u8>>;

    /// 予約済み範囲の一部に物理メモリを割り当てる.
    ///
    /// 新たにコミットされたページの内容は、常にゼロで初期化されている.
    /// 既にコミット済みのページを再度コミットしても、その内容は変化しない.
    ///
    /// # Errors
    ///
    /// - 範囲がいずれの予約にも含まれない場合には、種類が`ErrorKind::InvalidInput`のエラーが返される
    /// - OSがコミットに失敗した場合には、種類が`ErrorKind::PlatformFailure`のエラーが返される
    fn commit(&mut self, address: NonNull<u8>, size: usize) -> Result<()>;

    /// 範囲の物理メモリをOSに返却する(アドレス範囲の予約は維持される).
    ///
    /// `size`が`0`の場合には、`address`を先頭とする予約全体がデコミットされる.
    ///
    /// 再度コミットされた際には、内容はゼロに戻っている.
    ///
    /// # Safety
    ///
    /// デコミット対象の範囲を指す参照が残っていてはならない.
    unsafe fn decommit(&mut self, address: NonNull<u8>, size: usize) -> Result<()>;

    /// `address`を先頭とする予約全体(残っているコミットも含む)をOSに返却する.
    ///
    /// # Safety
    ///
    /// 予約範囲を指す参照が残っていてはならない.
    unsafe fn release(&mut self, address: NonNull<u8>) -> Result<()>;
}

/// 予約済みアドレス範囲の一覧.
///
/// `VirtualMemory`の各実装が、引数の範囲の妥当性検証に使用する.
#[derive(Debug)]
pub(crate) struct ReservationTable<T> {
    entries: BTreeMap<usize, (usize, T)>,
}
impl<T> ReservationTable<T> {
    pub fn new() -> Self {
        ReservationTable {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, base: usize, size: usize, value: T) {
        self.entries.insert(base, (size, value));
    }

    pub fn remove(&mut self, base: usize) -> Result<(usize, T)> {
        let entry = track_assert_some!(
            self.entries.remove(&base),
            ErrorKind::InvalidInput,
            "Not a reservation base: {:#x}",
            base
        );
        Ok(entry)
    }

    /// `[address, address + size)`を完全に含む予約を探す.
    ///
    /// 返り値のタプルは`(予約の先頭, 予約のサイズ, 付随値)`.
    pub fn find(&self, address: usize, size: usize) -> Result<(usize, usize, &T)> {
        let base = track!(self.locate(address, size))?;
        let (reserved, value) = &self.entries[&base];
        Ok((base, *reserved, value))
    }

    /// `find`の可変版.
    pub fn find_mut(&mut self, address: usize, size: usize) -> Result<(usize, usize, &mut T)> {
        let base = track!(self.locate(address, size))?;
        let (reserved, value) = track_assert_some!(
            self.entries.get_mut(&base),
            ErrorKind::InconsistentState
        );
        Ok((base, *reserved, value))
    }

    fn locate(&self, address: usize, size: usize) -> Result<usize> {
        let end = track_assert_some!(
            address.checked_add(size),
            ErrorKind::InvalidInput,
            "Range overflow: address={:#x}, size={}",
            address,
            size
        );
        let (&base, &(reserved, _)) = track_assert_some!(
            self.entries.range(..=address).next_back(),
            ErrorKind::InvalidInput,
            "Not reserved: {:#x}",
            address
        );
        track_assert!(
            end <= base + reserved,
            ErrorKind::InvalidInput,
            "Out of reservation: address={:#x}, size={}, base={:#x}, reserved={}",
            address,
            size,
            base,
            reserved
        );
        Ok(base)
    }

    /// `size == 0`の場合の「予約全体」指定を解決した上で、対象範囲を返す.
    pub fn resolve_mut(
        &mut self,
        address: usize,
        size: usize,
    ) -> Result<(usize, usize, usize, &mut T)> {
        if size == 0 {
            let (reserved, value) = track_assert_some!(
                self.entries.get_mut(&address),
                ErrorKind::InvalidInput,
                "Not a reservation base: {:#x}",
                address
            );
            Ok((address, *reserved, address, value))
        } else {
            let (base, _, value) = track!(self.find_mut(address, size))?;
            Ok((address, size, base, value))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (usize, usize, T)> {
        std::mem::replace(&mut self.entries, BTreeMap::new())
            .into_iter()
            .map(|(base, (size, value))| (base, size, value))
    }
}

/// `[address, address + size)`をページ境界に広げた範囲を返す.
pub(crate) fn page_range(address: usize, size: usize, page_size: usize) -> (usize, usize) {
    let mask = page_size - 1;
    let start = address & !mask;
    let end = (address + size + mask) & !mask;
    (start, end - start)
}
