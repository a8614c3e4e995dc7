use std::ops::Deref;

use crate::linear::{LinearAllocator, Mark};
use crate::vm::VirtualMemory;

/// 破棄時に、生成時点の位置までアロケータのカーソルを戻すガード.
///
/// `LinearAllocator::scope`によって生成される.
/// スコープ内で割り当てた領域の参照は、スコープ(ガード)より長く生存することはできない.
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
/// allocator.alloc(1u8).unwrap();
///
/// {
///     let scope = allocator.scope();
///     let temp = scope.alloc_slice_fill_with(100, |i| i).unwrap();
///     assert_eq!(temp[99], 99);
/// }
/// assert_eq!(allocator.allocated_bytes(), 1);
/// ```
#[derive(Debug)]
pub struct Scope<'a, V: VirtualMemory> {
    allocator: &'a mut LinearAllocator<V>,
    mark: Mark,
}
impl<'a, V: VirtualMemory> Scope<'a, V> {
    pub(crate) fn new(allocator: &'a mut LinearAllocator<V>) -> Self {
        let mark = allocator.mark();
        Scope { allocator, mark }
    }

    /// スコープ開始時点の位置を返す.
    pub fn start(&self) -> Mark {
        self.mark
    }

    /// 入れ子のスコープを開始する.
    pub fn scope(&mut self) -> Scope<V> {
        Scope::new(&mut *self.allocator)
    }
}
impl<'a, V: VirtualMemory> Deref for Scope<'a, V> {
    type Target = LinearAllocator<V>;
    fn deref(&self) -> &Self::Target {
        &*self.allocator
    }
}
impl<'a, V: VirtualMemory> Drop for Scope<'a, V> {
    fn drop(&mut self) {
        self.allocator.reset_to(self.mark);
    }
}
