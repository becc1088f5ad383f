use anyhow::Result;
use opencv::{
    core::{self, Mat, Point, Rect, Vector},
    imgproc,
    prelude::*,
};

use super::{Band, TargetPoint};
use crate::config::DetectConfig;

/// ほぼ水平な点群とみなす垂直方向成分の下限
const MIN_VERTICAL_COMPONENT: f32 = 1e-6;

/// ROIバンド内のライン適合器
///
/// バンド内の有効ピクセル群に直線を当てはめ、バンド垂直中点での代表点を
/// フレーム座標系で返す。有効ピクセル数が min_support 以下なら検出なし。
pub struct LineFitter {
    min_support: usize,
}

impl LineFitter {
    pub fn new(min_support: usize) -> Self {
        Self { min_support }
    }

    pub fn from_config(config: &DetectConfig) -> Self {
        Self::new(config.min_support)
    }

    /// マスクのバンド範囲に直線を当てはめて目標点を求める
    ///
    /// バンドがマスクの行範囲に収まらない場合も検出なし。
    pub fn fit(&self, mask: &Mat, band: Band) -> Result<Option<TargetPoint>> {
        if band.bottom > mask.rows() || mask.cols() == 0 {
            return Ok(None);
        }
        let rect = Rect::new(0, band.top, mask.cols(), band.height());
        let slice = Mat::roi(mask, rect)?.try_clone()?;

        let mut points = Vector::<Point>::new();
        core::find_non_zero(&slice, &mut points)?;
        if points.len() <= self.min_support {
            return Ok(None);
        }

        // 最小二乗の直線当てはめ。出力は [vx, vy, x0, y0]。
        let mut line = Vector::<f32>::new();
        imgproc::fit_line(&points, &mut line, imgproc::DIST_L2, 0.0, 0.01, 0.01)?;
        let vx = line.get(0)?;
        let vy = line.get(1)?;
        let x0 = line.get(2)?;
        let y0 = line.get(3)?;

        // 水平な点群では中点投影が定義できない
        if vy.abs() < MIN_VERTICAL_COMPONENT {
            return Ok(None);
        }

        let t = (band.mid_offset() as f32 - y0) / vy;
        let x = (x0 + vx * t) as i32;
        let y = (y0 + vy * t) as i32 + band.top;
        Ok(Some(TargetPoint::new(x, y)))
    }
}
