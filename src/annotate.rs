use anyhow::Result;
use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;

use crate::detect::{Band, TargetPoint};
use crate::tracker::TrackUpdate;

/// マーカー円の半径（ピクセル）
const MARKER_RADIUS: i32 = 2;

/// 検出バンドと目標点をフレームへ描き込む
///
/// バンド境界は緑の矩形、確定目標点は二重円マーカー
/// （マゼンタのリングの上に黄の塗りつぶし）、先読み点は赤の塗りつぶし。
/// 保持中の目標点も確定点としてそのまま描く。
pub fn draw_overlay(
    canvas: &mut Mat,
    control: Band,
    lookahead: Band,
    update: &TrackUpdate,
) -> Result<()> {
    draw_band(canvas, control)?;
    draw_band(canvas, lookahead)?;

    if let Some(point) = update.target {
        draw_target_marker(canvas, point)?;
    }
    if let Some(point) = update.predicted {
        draw_predicted_marker(canvas, point)?;
    }
    Ok(())
}

fn draw_band(canvas: &mut Mat, band: Band) -> Result<()> {
    let rect = Rect::new(0, band.top, canvas.cols(), band.height());
    imgproc::rectangle(
        canvas,
        rect,
        Scalar::new(0.0, 255.0, 0.0, 0.0),
        1,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}

fn draw_target_marker(canvas: &mut Mat, point: TargetPoint) -> Result<()> {
    let center = Point::new(point.x, point.y);
    imgproc::circle(
        canvas,
        center,
        MARKER_RADIUS,
        Scalar::new(255.0, 0.0, 255.0, 0.0),
        1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::circle(
        canvas,
        center,
        MARKER_RADIUS,
        Scalar::new(0.0, 255.0, 255.0, 0.0),
        -1,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}

fn draw_predicted_marker(canvas: &mut Mat, point: TargetPoint) -> Result<()> {
    imgproc::circle(
        canvas,
        Point::new(point.x, point.y),
        MARKER_RADIUS,
        Scalar::new(0.0, 0.0, 255.0, 0.0),
        -1,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}
