use crate::align::Alignment;

/// デフォルトの予約サイズ(64bit環境では4GB).
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_RESERVATION_SIZE: usize = 4 << 30;

/// デフォルトの予約サイズ(32bit環境では256MB).
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_RESERVATION_SIZE: usize = 256 << 20;

/// デフォルトのコミット単位(4KB).
///
/// 仮想メモリのページサイズの方が大きい場合には、そちらが使用される.
pub const DEFAULT_COMMIT_CHUNK_SIZE: usize = 4 << 10;

/// `LinearAllocator`の挙動を調整するためのパラメータ群.
///
/// 各オプションの説明は`LinearAllocatorBuilder`のドキュメントを参照のこと.
/// アロケータの構築後に変更されることはない.
#[derive(Debug, Clone)]
pub struct LinearAllocatorOptions {
    /// 予約するアドレス空間のサイズ.
    ///
    /// `commit_chunk_size`の倍数.
    pub reservation_size: usize,

    /// コミット単位.
    ///
    /// 仮想メモリのページサイズの倍数.
    pub commit_chunk_size: Alignment,

    /// 仮想メモリ操作の失敗時の振る舞い.
    pub failure_policy: FailurePolicy,
}

/// 仮想メモリ操作(予約・コミット・デコミット・解放)の失敗時の振る舞い.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// 実行環境の異常とみなして、その場でパニックする.
    Panic,

    /// `ErrorKind::PlatformFailure`のエラーとして呼び出し元に返す.
    ///
    /// この場合、アロケータの状態は操作前のまま維持される.
    Propagate,
}
impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Panic
    }
}
