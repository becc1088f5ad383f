//! Stream server: tracks the guide line in the vehicle camera feed and streams
//! annotated JPEG frames to a browser over a WebRTC data channel. Target
//! coordinates go to the motor controller over serial and to the viewer over
//! the signaling WebSocket.
//!
//! Signaling is a single WebSocket route speaking JSON `{type, sdp}` records:
//! `offer` inbound, `answer` outbound. One camera session per viewer.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_serial::SerialStream;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use line_tracker::camera::OpenCvCamera;
use line_tracker::config::Config;
use line_tracker::detect::TargetPoint;
use line_tracker::media::jpeg_encode;
use line_tracker::pipeline::{FramePipeline, RetryPolicy};
use line_tracker::telemetry::{ControlLink, TelemetryDispatcher};

type LivePipeline = FramePipeline<OpenCvCamera, SerialStream>;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

type LogFile = Arc<Mutex<std::io::BufWriter<std::fs::File>>>;

fn open_log_file() -> Result<LogFile> {
    std::fs::create_dir_all("logs")?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = format!("logs/stream_{}.log", ts);
    let file = std::fs::File::create(&path)?;
    eprintln!("Log: {}", path);
    Ok(Arc::new(Mutex::new(std::io::BufWriter::new(file))))
}

macro_rules! log {
    ($logfile:expr, $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        eprintln!("{}", msg);
        if let Ok(mut f) = $logfile.lock() {
            let _ = writeln!(f, "{}", msg);
            let _ = f.flush();
        }
    }};
}

// ---------------------------------------------------------------------------
// Signaling messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum SignalMessage {
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
}

// ---------------------------------------------------------------------------
// Pipeline setup (camera + serial + dispatcher)
// ---------------------------------------------------------------------------

fn build_pipeline(config: &Config, viewer_tx: mpsc::Sender<TargetPoint>) -> Result<LivePipeline> {
    let camera = OpenCvCamera::open_with_config(
        config.camera.index,
        Some(config.camera.width),
        Some(config.camera.height),
        Some(config.camera.fps),
    )?;

    let link = ControlLink::open_serial(
        &config.telemetry.serial_port,
        config.telemetry.baud_rate,
        Duration::from_millis(config.telemetry.ack_timeout_ms),
    )
    .with_context(|| format!("failed to open serial port {}", config.telemetry.serial_port))?;

    let dispatcher = TelemetryDispatcher::new(
        link,
        viewer_tx,
        Duration::from_millis(config.telemetry.min_send_interval_ms),
    );

    FramePipeline::new(
        camera,
        &config.detect,
        &config.tracker,
        dispatcher,
        RetryPolicy::from_config(&config.pipeline),
    )
}

// ---------------------------------------------------------------------------
// Frame streaming over the data channel
// ---------------------------------------------------------------------------

async fn stream_frames(
    dc: Arc<RTCDataChannel>,
    mut pipeline: LivePipeline,
    jpeg_quality: i32,
    logfile: LogFile,
) {
    log!(logfile, "[webrtc] frames channel open, streaming");

    let mut fps_counter: u32 = 0;
    let mut fps_timer = Instant::now();
    let mut last_pts: i64 = 0;

    loop {
        let video = match pipeline.produce().await {
            Ok(v) => v,
            Err(e) => {
                log!(logfile, "[pipeline] stopped: {e:#}");
                break;
            }
        };
        last_pts = video.pts;

        let jpeg = match jpeg_encode(&video.image, jpeg_quality) {
            Ok(data) => data,
            Err(e) => {
                log!(logfile, "[webrtc] encode error: {e:#}");
                break;
            }
        };

        if let Err(e) = dc.send(&Bytes::from(jpeg)).await {
            log!(logfile, "[webrtc] frames channel closed: {e}");
            break;
        }

        fps_counter += 1;
        if fps_timer.elapsed() >= Duration::from_secs(1) {
            log!(logfile, "[fps] {} (pts {})", fps_counter, last_pts);
            fps_counter = 0;
            fps_timer = Instant::now();
        }
    }
    // Dropping the pipeline releases the camera and the serial port.
}

// ---------------------------------------------------------------------------
// Offer/answer exchange (non-trickle: answer carries all candidates)
// ---------------------------------------------------------------------------

async fn answer_offer(pc: &RTCPeerConnection, sdp: String) -> Result<String> {
    let offer = RTCSessionDescription::offer(sdp)?;
    pc.set_remote_description(offer).await?;

    let answer = pc.create_answer(None).await?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gathered.recv().await;

    let local = pc
        .local_description()
        .await
        .context("no local description after gathering")?;
    Ok(local.sdp)
}

// ---------------------------------------------------------------------------
// Viewer session: one WebSocket = one peer connection = one camera pipeline
// ---------------------------------------------------------------------------

async fn run_session(socket: WebSocket, config: Arc<Config>, logfile: LogFile) {
    let (viewer_tx, mut viewer_rx) = mpsc::channel::<TargetPoint>(32);

    let pipeline = match build_pipeline(&config, viewer_tx) {
        Ok(p) => p,
        Err(e) => {
            log!(logfile, "[session] setup failed: {e:#}");
            return;
        }
    };
    let pipeline_slot: Arc<Mutex<Option<LivePipeline>>> = Arc::new(Mutex::new(Some(pipeline)));

    let api = APIBuilder::new().build();
    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };
    let pc = match api.new_peer_connection(rtc_config).await {
        Ok(pc) => pc,
        Err(e) => {
            log!(logfile, "[webrtc] peer connection failed: {e}");
            return;
        }
    };

    let state_logfile = logfile.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let logfile = state_logfile.clone();
        Box::pin(async move {
            log!(logfile, "[webrtc] connection state: {state}");
        })
    }));

    // The browser creates a "frames" data channel; the first one to open takes
    // the pipeline out of the slot and drives it until the channel dies.
    let dc_slot = Arc::clone(&pipeline_slot);
    let dc_logfile = logfile.clone();
    let jpeg_quality = config.server.jpeg_quality;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let slot = Arc::clone(&dc_slot);
        let logfile = dc_logfile.clone();
        Box::pin(async move {
            if dc.label() != "frames" {
                log!(logfile, "[webrtc] ignoring channel {:?}", dc.label());
                return;
            }
            let taken = slot.lock().ok().and_then(|mut s| s.take());
            let Some(pipeline) = taken else {
                log!(logfile, "[webrtc] duplicate frames channel ignored");
                return;
            };
            let dc2 = Arc::clone(&dc);
            dc.on_open(Box::new(move || {
                Box::pin(async move {
                    stream_frames(dc2, pipeline, jpeg_quality, logfile).await;
                })
            }));
        })
    }));

    let (ws_tx, mut ws_rx) = socket.split();
    let ws_tx = Arc::new(tokio::sync::Mutex::new(ws_tx));

    // Forward accepted target points to the viewer as JSON
    let forward_tx = Arc::clone(&ws_tx);
    let viewer_task = tokio::spawn(async move {
        while let Some(point) = viewer_rx.recv().await {
            let json = match serde_json::to_string(&point) {
                Ok(j) => j,
                Err(_) => continue,
            };
            if forward_tx.lock().await.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Signaling loop: answer offers until the viewer disconnects
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => {
                let sig = match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(sig) => sig,
                    Err(e) => {
                        log!(logfile, "[signaling] bad message: {e}");
                        continue;
                    }
                };
                if let SignalMessage::Offer { sdp } = sig {
                    match answer_offer(&pc, sdp).await {
                        Ok(answer_sdp) => {
                            let reply = SignalMessage::Answer { sdp: answer_sdp };
                            let json = match serde_json::to_string(&reply) {
                                Ok(j) => j,
                                Err(e) => {
                                    log!(logfile, "[signaling] encode failed: {e}");
                                    break;
                                }
                            };
                            if ws_tx.lock().await.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                            log!(logfile, "[webrtc] answer sent");
                        }
                        Err(e) => {
                            log!(logfile, "[webrtc] offer handling failed: {e:#}");
                            break;
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    viewer_task.abort();
    let _ = pc.close().await;
    log!(logfile, "[session] closed");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load_or_default("stream_server.toml")?);
    let logfile = open_log_file()?;
    log!(logfile, "Stream Server ({})", env!("GIT_VERSION"));
    log!(
        logfile,
        "[config] listen={}, camera={}, serial={}@{}, bands={:?}/{:?}",
        config.server.listen_addr,
        config.camera.index,
        config.telemetry.serial_port,
        config.telemetry.baud_rate,
        config.detect.control_band,
        config.detect.lookahead_band,
    );

    let app_config = Arc::clone(&config);
    let app_logfile = logfile.clone();
    let app = Router::new().route(
        "/",
        get(move |ws: WebSocketUpgrade| {
            let config = Arc::clone(&app_config);
            let logfile = app_logfile.clone();
            async move {
                ws.on_upgrade(move |socket| async move {
                    log!(logfile, "[session] viewer connected");
                    run_session(socket, config, logfile).await;
                })
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    log!(logfile, "[signaling] listening on ws://{}", config.server.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
