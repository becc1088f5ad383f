pub mod capture;

pub use capture::OpenCvCamera;

use anyhow::Result;
use opencv::core::Mat;

/// フレーム供給元。produceサイクルから毎フレームpullされる。
pub trait FrameSource {
    /// 次のフレームを取得（BGR形式）。一時的に取得できない場合は Ok(None)。
    fn capture(&mut self) -> Result<Option<Mat>>;
}
