use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::annotate::draw_overlay;
use crate::camera::FrameSource;
use crate::config::{DetectConfig, PipelineConfig, TrackerConfig};
use crate::detect::{extract_line_mask, Band, LineFitter, MaskParams};
use crate::media::{PtsClock, VideoFrame};
use crate::telemetry::TelemetryDispatcher;
use crate::tracker::{LineTracker, TrackStatus, TrackUpdate};

/// フレーム取得と処理サイクルの再試行ポリシー
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 空フレームを諦めるまでの連続取得試行回数
    pub max_empty_captures: u32,
    /// 空フレーム後の待機時間
    pub empty_retry: Duration,
    /// produce を失敗させるまでの連続サイクル失敗回数
    pub max_faults: u32,
    /// サイクル失敗後の待機時間
    pub fault_retry: Duration,
    /// フレーム間ペーシング
    pub pace: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_empty_captures: config.max_empty_captures,
            empty_retry: Duration::from_millis(config.empty_retry_ms),
            max_faults: config.max_faults,
            fault_retry: Duration::from_millis(config.fault_retry_ms),
            pace: Duration::from_millis(config.pace_ms),
        }
    }
}

/// 1フレーム分の検出・追跡・配信・注釈を統括するパイプライン
///
/// メディア層が次フレームを要求するたびに produce() を1回呼ぶ。
/// サイクルは常に直列実行で、トラッカーと配信器の状態は
/// 同一タスクからのみ更新される。セッションごとに1インスタンス。
pub struct FramePipeline<S, T> {
    source: S,
    mask_params: MaskParams,
    fitter: LineFitter,
    control_band: Band,
    lookahead_band: Band,
    tracker: LineTracker,
    dispatcher: TelemetryDispatcher<T>,
    clock: PtsClock,
    retry: RetryPolicy,
    last_status: Option<TrackStatus>,
}

impl<S, T> FramePipeline<S, T>
where
    S: FrameSource,
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        source: S,
        detect: &DetectConfig,
        tracker: &TrackerConfig,
        dispatcher: TelemetryDispatcher<T>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        Ok(Self {
            source,
            mask_params: MaskParams::from_config(detect),
            fitter: LineFitter::from_config(detect),
            control_band: Band::from_rows(detect.control_band).context("control band")?,
            lookahead_band: Band::from_rows(detect.lookahead_band).context("lookahead band")?,
            tracker: LineTracker::from_config(tracker),
            dispatcher,
            clock: PtsClock::new(),
            retry,
            last_status: None,
        })
    }

    /// 次の注釈済みフレームを生成する
    ///
    /// サイクル内の失敗はログに残して次のフレームで再試行する。
    /// 連続 max_faults 回失敗したとき、または取得試行を使い切ったときのみ
    /// エラーを返す。その時点でセッションを終了するのは呼び出し側の責任。
    pub async fn produce(&mut self) -> Result<VideoFrame> {
        let mut faults = 0u32;
        loop {
            let frame = self.acquire().await?;
            match self.run_cycle(frame).await {
                Ok(video) => return Ok(video),
                Err(e) => {
                    faults += 1;
                    if faults >= self.retry.max_faults {
                        return Err(e.context(format!("cycle failed {} times in a row", faults)));
                    }
                    eprintln!("[pipeline] cycle error (attempt {}): {:#}", faults, e);
                    tokio::time::sleep(self.retry.fault_retry).await;
                }
            }
        }
    }

    async fn acquire(&mut self) -> Result<Mat> {
        for attempt in 1..=self.retry.max_empty_captures {
            match self.source.capture() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {
                    if attempt == 1 {
                        eprintln!("[camera] empty frame, retrying");
                    }
                }
                Err(e) => eprintln!("[camera] capture error: {:#}", e),
            }
            tokio::time::sleep(self.retry.empty_retry).await;
        }
        bail!(
            "no usable frame after {} capture attempts",
            self.retry.max_empty_captures
        )
    }

    async fn run_cycle(&mut self, frame: Mat) -> Result<VideoFrame> {
        let mask = extract_line_mask(&frame, &self.mask_params)?;
        let primary = self.fitter.fit(&mask, self.control_band)?;
        let lookahead = self.fitter.fit(&mask, self.lookahead_band)?;

        let update = self.tracker.update(primary, lookahead);
        self.log_transition(&update);

        self.dispatcher.dispatch(update.target, Instant::now()).await;

        let mut canvas = frame.try_clone()?;
        draw_overlay(&mut canvas, self.control_band, self.lookahead_band, &update)?;

        tokio::time::sleep(self.retry.pace).await;

        Ok(VideoFrame {
            image: canvas,
            pts: self.clock.next_pts(),
        })
    }

    /// 状態が変わったフレームだけログを出す
    fn log_transition(&mut self, update: &TrackUpdate) {
        if self.last_status == Some(update.status) {
            return;
        }
        match update.status {
            TrackStatus::Live => {
                if let Some(p) = update.target {
                    eprintln!("[tracker] line acquired at ({},{})", p.x, p.y);
                }
            }
            TrackStatus::Held => eprintln!("[tracker] primary lost, holding last point"),
            TrackStatus::Lost => eprintln!("[tracker] line lost"),
        }
        self.last_status = Some(update.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::TargetPoint;
    use crate::telemetry::ControlLink;
    use anyhow::anyhow;
    use opencv::core::{Rect, Scalar, Vec3b, CV_8UC1, CV_8UC3};
    use opencv::imgproc;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;

    struct ScriptedCamera {
        frames: VecDeque<Result<Option<Mat>>>,
    }

    impl ScriptedCamera {
        fn new(frames: Vec<Result<Option<Mat>>>) -> Self {
            Self {
                frames: frames.into(),
            }
        }
    }

    impl FrameSource for ScriptedCamera {
        fn capture(&mut self) -> Result<Option<Mat>> {
            self.frames.pop_front().unwrap_or(Ok(None))
        }
    }

    fn white_frame() -> Mat {
        Mat::new_rows_cols_with_default(
            480,
            640,
            CV_8UC3,
            Scalar::new(255.0, 255.0, 255.0, 0.0),
        )
        .unwrap()
    }

    /// 幅3pxの黒い縦線を全高に描いたフレーム
    fn frame_with_line(x: i32) -> Mat {
        let mut frame = white_frame();
        imgproc::rectangle(
            &mut frame,
            Rect::new(x - 1, 0, 3, 480),
            Scalar::new(0.0, 0.0, 0.0, 0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        frame
    }

    /// cvt_colorで失敗する1チャンネルフレーム
    fn broken_frame() -> Mat {
        Mat::new_rows_cols_with_default(480, 640, CV_8UC1, Scalar::all(255.0)).unwrap()
    }

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_empty_captures: 5,
            empty_retry: Duration::from_millis(1),
            max_faults: 3,
            fault_retry: Duration::from_millis(1),
            pace: Duration::ZERO,
        }
    }

    fn make_pipeline(
        frames: Vec<Result<Option<Mat>>>,
    ) -> (
        FramePipeline<ScriptedCamera, DuplexStream>,
        DuplexStream,
        mpsc::Receiver<TargetPoint>,
    ) {
        let (near, far) = tokio::io::duplex(4096);
        let link = ControlLink::new(near, Duration::from_millis(5));
        let (viewer_tx, viewer_rx) = mpsc::channel(32);
        // interval zero so the very first frame is eligible to send
        let dispatcher = TelemetryDispatcher::new(link, viewer_tx, Duration::ZERO);
        let pipeline = FramePipeline::new(
            ScriptedCamera::new(frames),
            &DetectConfig::default(),
            &TrackerConfig::default(),
            dispatcher,
            test_policy(),
        )
        .unwrap();
        (pipeline, far, viewer_rx)
    }

    async fn control_lines(
        pipeline: FramePipeline<ScriptedCamera, DuplexStream>,
        mut far: DuplexStream,
    ) -> Vec<String> {
        drop(pipeline);
        let mut out = String::new();
        far.read_to_string(&mut out).await.unwrap();
        out.lines().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_produce_detects_line_and_dispatches() {
        let (mut pipeline, far, mut viewer_rx) =
            make_pipeline(vec![Ok(Some(frame_with_line(50)))]);

        let video = pipeline.produce().await.unwrap();
        assert!(video.pts >= 0);

        // annotated copy carries the control band boundary
        let edge = video.image.at_2d::<Vec3b>(320, 10).unwrap();
        assert_eq!((edge[0], edge[1], edge[2]), (0, 255, 0));

        let point = viewer_rx.try_recv().unwrap();
        assert!((point.x - 50).abs() <= 1, "x={}", point.x);
        assert!((point.y - 360).abs() <= 1, "y={}", point.y);

        let lines = control_lines(pipeline, far).await;
        assert_eq!(lines, vec![format!("{},{}", point.x, point.y)]);
    }

    #[tokio::test]
    async fn test_empty_frames_retried_until_line_appears() {
        let (mut pipeline, _far, mut viewer_rx) = make_pipeline(vec![
            Ok(None),
            Ok(None),
            Ok(Some(frame_with_line(50))),
        ]);

        assert!(pipeline.produce().await.is_ok());
        assert!(viewer_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_captures_fail_produce() {
        let (mut pipeline, _far, _viewer_rx) = make_pipeline(vec![]);

        let err = pipeline.produce().await.unwrap_err();
        assert!(err.to_string().contains("capture attempts"), "{err:#}");
    }

    #[tokio::test]
    async fn test_capture_error_retried() {
        let (mut pipeline, _far, _viewer_rx) = make_pipeline(vec![
            Err(anyhow!("usb reset")),
            Ok(Some(frame_with_line(50))),
        ]);

        assert!(pipeline.produce().await.is_ok());
    }

    #[tokio::test]
    async fn test_lost_frames_emit_sentinel_every_cycle() {
        let (mut pipeline, far, mut viewer_rx) = make_pipeline(vec![
            Ok(Some(white_frame())),
            Ok(Some(white_frame())),
            Ok(Some(white_frame())),
        ]);

        for _ in 0..3 {
            pipeline.produce().await.unwrap();
        }

        assert!(viewer_rx.try_recv().is_err(), "sentinel never reaches the viewer");
        let lines = control_lines(pipeline, far).await;
        assert_eq!(lines, vec!["-1,-1", "-1,-1", "-1,-1"]);
    }

    #[tokio::test]
    async fn test_held_target_deduplicated_then_sentinel() {
        let mut frames: Vec<Result<Option<Mat>>> = vec![Ok(Some(frame_with_line(50)))];
        for _ in 0..10 {
            frames.push(Ok(Some(white_frame())));
        }
        let (mut pipeline, far, mut viewer_rx) = make_pipeline(frames);

        // 1 live frame, 9 held frames, then the hold window expires
        for _ in 0..11 {
            pipeline.produce().await.unwrap();
        }

        assert!(viewer_rx.try_recv().is_ok());
        assert!(viewer_rx.try_recv().is_err(), "held repeats must not republish");

        let lines = control_lines(pipeline, far).await;
        assert_eq!(lines.len(), 2, "one coordinate line then one sentinel: {lines:?}");
        assert!(lines[0].ends_with(",360") || lines[0].ends_with(",359") || lines[0].ends_with(",361"));
        assert_eq!(lines[1], "-1,-1");
    }

    #[tokio::test]
    async fn test_pts_monotonic_across_frames() {
        let (mut pipeline, _far, _viewer_rx) = make_pipeline(vec![
            Ok(Some(frame_with_line(50))),
            Ok(Some(frame_with_line(60))),
            Ok(Some(frame_with_line(70))),
        ]);

        let a = pipeline.produce().await.unwrap().pts;
        let b = pipeline.produce().await.unwrap().pts;
        let c = pipeline.produce().await.unwrap().pts;
        assert!(a < b && b < c, "pts not monotonic: {a} {b} {c}");
    }

    #[tokio::test]
    async fn test_cycle_fault_retries_with_next_frame() {
        let (mut pipeline, _far, _viewer_rx) = make_pipeline(vec![
            Ok(Some(broken_frame())),
            Ok(Some(frame_with_line(50))),
        ]);

        assert!(pipeline.produce().await.is_ok());
    }

    #[tokio::test]
    async fn test_persistent_faults_fail_produce() {
        let (mut pipeline, _far, _viewer_rx) = make_pipeline(vec![
            Ok(Some(broken_frame())),
            Ok(Some(broken_frame())),
            Ok(Some(broken_frame())),
        ]);

        let err = pipeline.produce().await.unwrap_err();
        assert!(err.to_string().contains("cycle failed"), "{err:#}");
    }

    #[test]
    fn test_invalid_band_rejected() {
        let (near, _far) = tokio::io::duplex(64);
        let link = ControlLink::new(near, Duration::from_millis(5));
        let (viewer_tx, _viewer_rx) = mpsc::channel(1);
        let dispatcher = TelemetryDispatcher::new(link, viewer_tx, Duration::ZERO);

        let mut detect = DetectConfig::default();
        detect.control_band = [400, 320];

        let result = FramePipeline::new(
            ScriptedCamera::new(vec![]),
            &detect,
            &TrackerConfig::default(),
            dispatcher,
            test_policy(),
        );
        assert!(result.is_err());
    }
}
