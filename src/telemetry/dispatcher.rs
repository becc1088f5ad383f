use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::detect::TargetPoint;
use crate::telemetry::control::ControlLink;

/// 目標点のデュアルシンク配信器
///
/// 有効な点は重複排除と最小送信間隔で絞ったうえで、制御シンク
/// （モーターコントローラ）と観測シンク（リモートビューア）の両方へ送る。
/// 検出なしフレームでは停止センチネルを制御シンクのみへ毎回送る。
/// シンク障害はログに残して握りつぶし、パイプラインへは伝播しない。
pub struct TelemetryDispatcher<T> {
    control: ControlLink<T>,
    viewer: mpsc::Sender<TargetPoint>,
    min_interval: Duration,
    last_sent: Option<TargetPoint>,
    last_sent_at: Instant,
}

impl<T: AsyncRead + AsyncWrite + Unpin> TelemetryDispatcher<T> {
    /// 配信器を作成。送信間隔の起点はセッション開始時刻。
    pub fn new(
        control: ControlLink<T>,
        viewer: mpsc::Sender<TargetPoint>,
        min_interval: Duration,
    ) -> Self {
        Self {
            control,
            viewer,
            min_interval,
            last_sent: None,
            last_sent_at: Instant::now(),
        }
    }

    /// 1フレーム分の配信判定と送信
    pub async fn dispatch(&mut self, target: Option<TargetPoint>, now: Instant) {
        match target {
            Some(point) => {
                if Some(point) == self.last_sent
                    || now.duration_since(self.last_sent_at) <= self.min_interval
                {
                    return;
                }
                // State commits before the sends; a failed write is not retried.
                self.last_sent = Some(point);
                self.last_sent_at = now;

                match self.control.send_target(point).await {
                    Ok(()) => {
                        if let Some(reply) = self.control.read_ack().await {
                            eprintln!("[control] reply: {}", reply);
                        }
                    }
                    Err(e) => eprintln!("[control] send failed: {e:#}"),
                }

                // The viewer send proceeds even when the control sink failed.
                let _ = self.viewer.send(point).await;
            }
            None => {
                // The halt sentinel goes out every lost frame, bypassing dedup
                // and the rate limit. No ack is read and the viewer is not told.
                if let Err(e) = self.control.send_halt().await {
                    eprintln!("[control] halt send failed: {e:#}");
                }
            }
        }
    }
}
