//! アライメント(境界揃え)関連の構成要素.
use crate::{ErrorKind, Result};

/// 二の冪であることが保証されたアライメント値.
///
/// 割当要求のアライメントや、コミット単位(チャンクサイズ)の表現に使われる.
///
/// 指定された境界にアライメントを行うための補助メソッド群も提供している.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Alignment(pub(crate) usize);
impl Alignment {
    /// 最小のアライメント(`1`).
    pub const MIN: usize = 1;

    /// 指定された値のアライメントを表現する`Alignment`インスタンスを生成する.
    ///
    /// # Errors
    ///
    /// `align`が二の冪ではない場合(`0`を含む)には、種類が`ErrorKind::InvalidInput`のエラーが返される.
    ///
    /// # Examples
    ///
    /// ```
    /// use vmlinear::ErrorKind;
    /// use vmlinear::align::Alignment;
    ///
    /// assert_eq!(Alignment::new(8).ok().map(|a| a.as_usize()), Some(8));
    /// assert_eq!(Alignment::new(4096).ok().map(|a| a.as_usize()), Some(4096));
    ///
    /// assert_eq!(Alignment::new(0).err().map(|e| *e.kind()), Some(ErrorKind::InvalidInput));
    /// assert_eq!(Alignment::new(24).err().map(|e| *e.kind()), Some(ErrorKind::InvalidInput));
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new(align: usize) -> Result<Self> {
        track_assert!(
            align.is_power_of_two(),
            ErrorKind::InvalidInput,
            "Not a power of two: {}",
            align
        );
        Ok(Alignment(align))
    }

    /// 型`T`のアライメントを返す.
    pub fn of<T>() -> Self {
        Alignment(std::mem::align_of::<T>())
    }

    /// 指定位置以降で最初のアライメント境界を返す.
    ///
    /// 結果が`usize`に収まらない場合には`None`が返される.
    ///
    /// # Examples
    ///
    /// ```
    /// use vmlinear::align::Alignment;
    ///
    /// let align = Alignment::new(8).unwrap();
    /// assert_eq!(align.ceil_align(0), Some(0));
    /// assert_eq!(align.ceil_align(1), Some(8));
    /// assert_eq!(align.ceil_align(8), Some(8));
    /// assert_eq!(align.ceil_align(usize::max_value()), None);
    /// ```
    pub fn ceil_align(self, position: usize) -> Option<usize> {
        let mask = self.0 - 1;
        position.checked_add(mask).map(|p| p & !mask)
    }

    /// 指定位置以前で最初のアライメント境界を返す.
    ///
    /// # Examples
    ///
    /// ```
    /// use vmlinear::align::Alignment;
    ///
    /// let align = Alignment::new(8).unwrap();
    /// assert_eq!(align.floor_align(0), 0);
    /// assert_eq!(align.floor_align(7), 0);
    /// assert_eq!(align.floor_align(9), 8);
    /// ```
    pub fn floor_align(self, position: usize) -> usize {
        position & !(self.0 - 1)
    }

    /// 指定位置がアライメント境界に沿っているかどうかを判定する.
    pub fn is_aligned(self, position: usize) -> bool {
        position & (self.0 - 1) == 0
    }

    /// このアライメントが`other`を包含しているかを確認する.
    ///
    /// 二の冪同士なので"`self`が`other`以上"と等価.
    pub fn contains(self, other: Alignment) -> bool {
        self.0 >= other.0
    }

    /// アライメント値を`usize`に変換して返す.
    pub fn as_usize(self) -> usize {
        self.0
    }
}
impl Default for Alignment {
    fn default() -> Self {
        Alignment(Self::MIN)
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn ceil_align_works() -> TestResult {
        let align = track!(Alignment::new(4096))?;
        assert_eq!(align.ceil_align(1), Some(4096));
        assert_eq!(align.ceil_align(4096), Some(4096));
        assert_eq!(align.ceil_align(80024), Some(81920));

        let one = track!(Alignment::new(1))?;
        for i in 0..100 {
            assert_eq!(one.ceil_align(i), Some(i));
        }
        Ok(())
    }

    #[test]
    fn alignment_of_types() {
        assert_eq!(Alignment::of::<u8>().as_usize(), 1);
        assert_eq!(Alignment::of::<u64>().as_usize(), std::mem::align_of::<u64>());
        assert!(Alignment::of::<u64>().contains(Alignment::of::<u16>()));
        assert!(!Alignment::of::<u16>().contains(Alignment::of::<u64>()));
    }

    #[test]
    fn is_aligned_works() -> TestResult {
        let align = track!(Alignment::new(16))?;
        assert!(align.is_aligned(0));
        assert!(align.is_aligned(32));
        assert!(!align.is_aligned(8));
        Ok(())
    }
}
