use std::time::Instant;

use anyhow::Result;
use opencv::core::{Mat, Vector};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};

/// 映像タイムスタンプのクロックレート (90kHz)
pub const VIDEO_CLOCK_RATE: i64 = 90_000;

/// 注釈済みフレームとプレゼンテーションタイムスタンプ
pub struct VideoFrame {
    pub image: Mat,
    /// 90kHz 刻みの単調増加タイムスタンプ
    pub pts: i64,
}

/// 経過時間ベースのPTSクロック
///
/// セッション開始からの実経過時間を 90kHz 刻みに変換する。
/// 同一時刻で連続して呼ばれても厳密に単調増加する。
pub struct PtsClock {
    origin: Instant,
    last: i64,
}

impl PtsClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: -1,
        }
    }

    /// 次のPTSを払い出す
    pub fn next_pts(&mut self) -> i64 {
        let elapsed = self.origin.elapsed().as_secs_f64();
        let ticks = (elapsed * VIDEO_CLOCK_RATE as f64) as i64;
        self.last = ticks.max(self.last + 1);
        self.last
    }
}

impl Default for PtsClock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn jpeg_encode(frame: &Mat, quality: i32) -> Result<Vec<u8>> {
    let params = Vector::from_iter([imgcodecs::IMWRITE_JPEG_QUALITY, quality]);
    let mut buf: Vector<u8> = Vector::new();

    // imencode expects BGR 8UC3; convert BGRA if needed
    let mat = if frame.channels() == 4 {
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(frame, &mut bgr, imgproc::COLOR_BGRA2BGR)?;
        bgr
    } else {
        frame.clone()
    };

    imgcodecs::imencode(".jpg", &mat, &mut buf, &params)?;
    Ok(buf.to_vec())
}
