use std;
use trackable;
use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else if e.kind() == std::io::ErrorKind::InvalidInput {
            ErrorKind::InvalidInput.cause(e).into()
        } else if e.raw_os_error().is_some() {
            ErrorKind::PlatformFailure.cause(e).into()
        } else {
            ErrorKind::Other.cause(e).into()
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match *e.kind() {
            ErrorKind::InvalidInput => std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            ErrorKind::OutOfSpace => std::io::Error::new(std::io::ErrorKind::OutOfMemory, e),
            _ => std::io::Error::new(std::io::ErrorKind::Other, e),
        }
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 予約済みのアドレス空間に、要求されたサイズの領域が収まらない.
    ///
    /// この場合アロケータの状態(カーソル位置等)は一切変更されない.
    ///
    /// # 典型的な対応策
    ///
    /// - `reset_to`や`release_all`で領域を回収した上でリトライする
    /// - 別の割当戦略(e.g., 通常のヒープ)にフォールバックする
    /// - より大きな`reservation_size`を指定してアロケータを作り直す
    OutOfSpace,

    /// OSの仮想メモリ操作(予約・コミット・デコミット・解放)が失敗した.
    ///
    /// 利用者の誤用ではなく、実行環境の資源枯渇を示している.
    /// デフォルトの`FailurePolicy::Panic`の場合には、このエラーは呼び出し元には返されず、
    /// アロケータ内でパニックとなる.
    ///
    /// # 典型的な対応策
    ///
    /// - プロセスを終了する
    PlatformFailure,

    /// 入力が不正.
    ///
    /// E.g., 二の冪ではないアライメント、不正な設定値、予約範囲外へのコミット
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// E.g., `Allocate`の実装が、要求よりも短い、あるいはアライメントが揃っていない領域を返した
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InconsistentState,

    /// その他エラー.
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
