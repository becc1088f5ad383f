pub mod fitter;
pub mod mask;

pub use fitter::LineFitter;
pub use mask::{extract_line_mask, MaskParams};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// 検出されたライン上の目標点（フレーム座標系、ピクセル単位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPoint {
    pub x: i32,
    pub y: i32,
}

impl TargetPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// 検出対象の水平バンド。行範囲 [top, bottom)、全幅にわたる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub top: i32,
    pub bottom: i32,
}

impl Band {
    pub fn new(top: i32, bottom: i32) -> Result<Self> {
        if top < 0 || bottom <= top {
            bail!("invalid band rows: {}..{}", top, bottom);
        }
        Ok(Self { top, bottom })
    }

    /// 設定ファイルの [top, bottom] 形式から構築
    pub fn from_rows(rows: [i32; 2]) -> Result<Self> {
        Self::new(rows[0], rows[1])
    }

    /// バンドの高さ（行数）
    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// バンド先頭からの垂直中点オフセット（整数除算）
    pub fn mid_offset(&self) -> i32 {
        self.height() / 2
    }

    /// フレーム座標系での中点行
    pub fn mid_row(&self) -> i32 {
        self.top + self.mid_offset()
    }
}
