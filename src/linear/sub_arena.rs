use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::slice;

use crate::align::Alignment;
use crate::linear::{Allocate, Mark};
use crate::{ErrorKind, Result};

/// 固定長のバッファ上で線形割当を行うアリーナ.
///
/// 仮想メモリ操作は一切行わず、容量を超える要求は`ErrorKind::OutOfSpace`となる.
/// 通常は`LinearAllocator::sub_arena`を通して、親アロケータの領域の一部を切り出して使用する.
#[derive(Debug)]
pub struct SubArena<'a> {
    base: NonNull<u8>,
    capacity: usize,
    cursor: Cell<usize>,
    _buffer: PhantomData<&'a mut [u8]>,
}
impl<'a> SubArena<'a> {
    /// `LinearAllocator::sub_arena`が切り出す領域のアライメント.
    pub const ALIGN: Alignment = Alignment(16);

    /// `buffer`全体を割当領域とする`SubArena`インスタンスを生成する.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        let capacity = buffer.len();
        let base = NonNull::new(buffer.as_mut_ptr()).unwrap_or_else(NonNull::dangling);
        SubArena {
            base,
            capacity,
            cursor: Cell::new(0),
            _buffer: PhantomData,
        }
    }

    /// アリーナの容量を返す.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 使用済みのバイト数を返す.
    pub fn allocated_bytes(&self) -> usize {
        self.cursor.get()
    }

    /// 現在のカーソル位置を返す.
    pub fn mark(&self) -> Mark {
        Mark(self.cursor.get())
    }

    /// カーソルを`mark`の位置まで戻す.
    ///
    /// # Panics
    ///
    /// `mark`が現在のカーソルよりも後方を指している場合にはパニックする.
    pub fn reset_to(&mut self, mark: Mark) {
        assert!(
            mark.0 <= self.cursor.get(),
            "Invalid mark: mark={}, cursor={}",
            mark.0,
            self.cursor.get()
        );
        self.cursor.set(mark.0);
    }

    /// カーソルを先頭まで戻す.
    pub fn reset(&mut self) {
        self.cursor.set(0);
    }
}
impl<'a> Allocate for SubArena<'a> {
    fn allocate_aligned(&self, size: usize, align: Alignment) -> Result<&mut [u8]> {
        let base = self.base.as_ptr() as usize;
        let cursor = self.cursor.get();
        let range = align
            .ceil_align(base + cursor)
            .map(|address| address - base)
            .and_then(|start| start.checked_add(size).map(|end| (start, end)));
        let (start, end) = track_assert_some!(
            range.filter(|&(_, end)| end <= self.capacity),
            ErrorKind::OutOfSpace,
            "size={}, align={}, cursor={}, capacity={}",
            size,
            align.as_usize(),
            cursor,
            self.capacity
        );

        let ptr = unsafe { self.base.as_ptr().add(start) };
        unsafe { ptr::write_bytes(ptr, 0, size) };
        self.cursor.set(end);
        Ok(unsafe { slice::from_raw_parts_mut(ptr, size) })
    }
}
