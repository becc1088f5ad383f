use anyhow::Result;
use opencv::{
    core::{self, Mat, Point, Scalar, Size},
    imgproc,
    prelude::*,
};

use crate::config::DetectConfig;

/// ライン二値化のパラメータ
#[derive(Debug, Clone, Copy)]
pub struct MaskParams {
    /// HSV下限 (H, S, V)
    pub hsv_lower: [u8; 3],
    /// HSV上限 (H, S, V)
    pub hsv_upper: [u8; 3],
    /// クロージング用カーネル辺長（ピクセル）
    pub close_kernel: i32,
}

impl MaskParams {
    pub fn from_config(config: &DetectConfig) -> Self {
        Self {
            hsv_lower: config.hsv_lower,
            hsv_upper: config.hsv_upper,
            close_kernel: config.close_kernel,
        }
    }
}

impl Default for MaskParams {
    fn default() -> Self {
        Self::from_config(&DetectConfig::default())
    }
}

/// BGRフレームから暗色ガイドラインの二値マスクを生成
///
/// - BGR -> HSV
/// - HSV範囲で二値化（暗い低彩度ピクセルが対象）
/// - 小カーネルのクロージングでノイズ除去と隙間埋め
pub fn extract_line_mask(frame: &Mat, params: &MaskParams) -> Result<Mat> {
    let mut hsv = Mat::default();
    imgproc::cvt_color_def(frame, &mut hsv, imgproc::COLOR_BGR2HSV)?;

    let lower = Scalar::new(
        params.hsv_lower[0] as f64,
        params.hsv_lower[1] as f64,
        params.hsv_lower[2] as f64,
        0.0,
    );
    let upper = Scalar::new(
        params.hsv_upper[0] as f64,
        params.hsv_upper[1] as f64,
        params.hsv_upper[2] as f64,
        0.0,
    );
    let mut mask = Mat::default();
    core::in_range(&hsv, &lower, &upper, &mut mask)?;

    let kernel = imgproc::get_structuring_element(
        imgproc::MORPH_RECT,
        Size::new(params.close_kernel, params.close_kernel),
        Point::new(-1, -1),
    )?;
    let mut closed = Mat::default();
    imgproc::morphology_ex_def(&mask, &mut closed, imgproc::MORPH_CLOSE, &kernel)?;

    Ok(closed)
}
