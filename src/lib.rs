//! Virtual-memory backed Linear allocator.
//!
//! `vmlinear`は、仮想アドレス空間を予約した上で、必要になった分だけを段階的にコミットしていく線形(バンプポインタ)アロケータ.
//!
//! # 特徴
//!
//! - 最初の割当時に大きなアドレス空間(デフォルトでは4GB)を一度だけ予約する
//!   - 予約しただけでは物理メモリは消費されない
//!   - 割当済みの領域のアドレスは、アロケータが存在する限り変わらない
//! - カーソルがコミット済み領域を超える度に、不足分をチャンク単位(デフォルトでは4KB)でコミットする
//! - 割当は「アライメント境界へのカーソルの切り上げ」と「要求サイズ分の前進」のみで完了する
//! - 返される領域は常にゼロで初期化されている
//! - 個々の領域の解放は行わず、[Mark]を用いた一括回収と、予約全体の解放のみをサポートする
//! - 同期は行わないので、スレッド間で共有することはできない
//!
//! # モジュールの依存関係
//!
//! ```text
//! linear => vm
//!        => align
//! ```
//!
//! - [linear]モジュール:
//!   - 主に[LinearAllocator]構造体を提供
//!   - 利用者が直接触るのはこの構造体と、割当用のメソッド群を提供する[Allocate]トレイト
//!   - 補助的な構成要素として、スコープ終了時に自動で回収を行う[Scope]と、固定長の[SubArena]も提供する
//! - [vm]モジュール:
//!   - 主に[VirtualMemory]トレイトとその実装である[OsVm]および[HeapVm]を提供
//!   - 予約・コミット・デコミット・解放の四操作を抽象化し、[linear]に対してアドレス空間を提供するのが目的
//! - [align]モジュール:
//!   - アライメント計算用の[Alignment]型を提供
//!
//! [Mark]: ./linear/struct.Mark.html
//! [linear]: ./linear/index.html
//! [LinearAllocator]: ./linear/struct.LinearAllocator.html
//! [Allocate]: ./linear/trait.Allocate.html
//! [Scope]: ./linear/struct.Scope.html
//! [SubArena]: ./linear/struct.SubArena.html
//! [vm]: ./vm/index.html
//! [VirtualMemory]: ./vm/trait.VirtualMemory.html
//! [OsVm]: ./vm/struct.OsVm.html
//! [HeapVm]: ./vm/struct.HeapVm.html
//! [align]: ./align/index.html
//! [Alignment]: ./align/struct.Alignment.html
#![warn(missing_docs)]
extern crate libc;
extern crate prometrics;
#[macro_use]
extern crate trackable;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};
pub use crate::linear::{Allocate, LinearAllocator, LinearAllocatorBuilder, Mark, Scope, SubArena};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod align;
pub mod linear;
pub mod metrics;
pub mod vm;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
