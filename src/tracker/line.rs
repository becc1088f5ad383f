use crate::config::TrackerConfig;
use crate::detect::TargetPoint;

/// トラッキング状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// 今フレームの一次検出が成功
    Live,
    /// 一次検出は失敗、直前の有効点を保持中
    Held,
    /// 有効点なし
    Lost,
}

/// 1フレーム分のトラッキング結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackUpdate {
    /// 操舵に使う確定目標点
    pub target: Option<TargetPoint>,
    pub status: TrackStatus,
    /// 先読みバンドの参考点。状態遷移には関与しない。
    pub predicted: Option<TargetPoint>,
}

/// ライン重心のヒステリシストラッカー
///
/// 一次検出の一時的な欠落を、直前の有効点で max_hold フレーム未満まで補う。
/// 欠落が max_hold に達した時点で有効点を破棄して Lost になる。
pub struct LineTracker {
    max_hold: u32,
    last_valid: Option<TargetPoint>,
    misses: u32,
}

impl LineTracker {
    pub fn new(max_hold: u32) -> Self {
        Self {
            max_hold,
            last_valid: None,
            misses: 0,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.max_hold_frames)
    }

    /// 一次・先読みの検出結果から今フレームの確定目標点を決める
    ///
    /// 失敗しない。検出なしは正常な入力であってエラーではない。
    pub fn update(
        &mut self,
        primary: Option<TargetPoint>,
        lookahead: Option<TargetPoint>,
    ) -> TrackUpdate {
        match primary {
            Some(point) => {
                self.last_valid = Some(point);
                self.misses = 0;
                TrackUpdate {
                    target: Some(point),
                    status: TrackStatus::Live,
                    predicted: lookahead,
                }
            }
            None => {
                self.misses = self.misses.saturating_add(1);
                match self.last_valid {
                    Some(held) if self.misses < self.max_hold => TrackUpdate {
                        target: Some(held),
                        status: TrackStatus::Held,
                        predicted: lookahead,
                    },
                    _ => {
                        self.last_valid = None;
                        TrackUpdate {
                            target: None,
                            status: TrackStatus::Lost,
                            predicted: lookahead,
                        }
                    }
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_valid = None;
        self.misses = 0;
    }
}
