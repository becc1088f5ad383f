use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detect: DetectConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// シグナリング待ち受けアドレス
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// 配信フレームのJPEG品質 (0-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    /// カメラデバイス番号
    #[serde(default = "default_camera_index")]
    pub index: i32,
    /// フレーム幅（ピクセル）
    #[serde(default = "default_camera_width")]
    pub width: u32,
    /// フレーム高さ（ピクセル）
    #[serde(default = "default_camera_height")]
    pub height: u32,
    /// キャプチャFPS
    #[serde(default = "default_camera_fps")]
    pub fps: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectConfig {
    /// ライン二値化のHSV下限 (H, S, V)
    #[serde(default = "default_hsv_lower")]
    pub hsv_lower: [u8; 3],
    /// ライン二値化のHSV上限 (H, S, V)
    #[serde(default = "default_hsv_upper")]
    pub hsv_upper: [u8; 3],
    /// クロージング用カーネル辺長（ピクセル）
    #[serde(default = "default_close_kernel")]
    pub close_kernel: i32,
    /// 検出に必要な最小有効ピクセル数（これ以下は検出なし）
    #[serde(default = "default_min_support")]
    pub min_support: usize,
    /// 操舵用バンドの行範囲 [top, bottom)
    #[serde(default = "default_control_band")]
    pub control_band: [i32; 2],
    /// 先読み用バンドの行範囲 [top, bottom)
    #[serde(default = "default_lookahead_band")]
    pub lookahead_band: [i32; 2],
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// 一次検出欠落時に直前の有効点を保持するフレーム数
    #[serde(default = "default_max_hold_frames")]
    pub max_hold_frames: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// モーターコントローラのシリアルデバイス
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    /// ボーレート
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// コントローラ応答の読み取りタイムアウト（ミリ秒）
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// 同一セッション内の最小送信間隔（ミリ秒）
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// 空フレーム連続許容回数（超過でセッション停止）
    #[serde(default = "default_max_empty_captures")]
    pub max_empty_captures: u32,
    /// 空フレーム再試行の待ち時間（ミリ秒）
    #[serde(default = "default_empty_retry_ms")]
    pub empty_retry_ms: u64,
    /// サイクル失敗の連続許容回数（超過でセッション停止）
    #[serde(default = "default_max_faults")]
    pub max_faults: u32,
    /// サイクル失敗後の待ち時間（ミリ秒）
    #[serde(default = "default_fault_retry_ms")]
    pub fault_retry_ms: u64,
    /// フレーム間ペーシング（ミリ秒）
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
}

fn default_listen_addr() -> String { "0.0.0.0:8765".to_string() }
fn default_jpeg_quality() -> i32 { 80 }
fn default_camera_index() -> i32 { 0 }
fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_camera_fps() -> u32 { 30 }
fn default_hsv_lower() -> [u8; 3] { [0, 0, 0] }
fn default_hsv_upper() -> [u8; 3] { [180, 90, 170] }
fn default_close_kernel() -> i32 { 3 }
fn default_min_support() -> usize { 100 }
fn default_control_band() -> [i32; 2] { [320, 400] }
fn default_lookahead_band() -> [i32; 2] { [180, 260] }
fn default_max_hold_frames() -> u32 { 10 }
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { 9600 }
fn default_ack_timeout_ms() -> u64 { 100 }
fn default_min_send_interval_ms() -> u64 { 100 }
fn default_max_empty_captures() -> u32 { 120 }
fn default_empty_retry_ms() -> u64 { 10 }
fn default_max_faults() -> u32 { 30 }
fn default_fault_retry_ms() -> u64 { 10 }
fn default_pace_ms() -> u64 { 5 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: default_camera_index(),
            width: default_camera_width(),
            height: default_camera_height(),
            fps: default_camera_fps(),
        }
    }
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            hsv_lower: default_hsv_lower(),
            hsv_upper: default_hsv_upper(),
            close_kernel: default_close_kernel(),
            min_support: default_min_support(),
            control_band: default_control_band(),
            lookahead_band: default_lookahead_band(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_hold_frames: default_max_hold_frames(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            ack_timeout_ms: default_ack_timeout_ms(),
            min_send_interval_ms: default_min_send_interval_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_empty_captures: default_max_empty_captures(),
            empty_retry_ms: default_empty_retry_ms(),
            max_faults: default_max_faults(),
            fault_retry_ms: default_fault_retry_ms(),
            pace_ms: default_pace_ms(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// 設定ファイルが存在しなければデフォルト値を使う
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8765");
        assert_eq!(config.detect.min_support, 100);
        assert_eq!(config.detect.control_band, [320, 400]);
        assert_eq!(config.detect.lookahead_band, [180, 260]);
        assert_eq!(config.tracker.max_hold_frames, 10);
        assert_eq!(config.telemetry.baud_rate, 9600);
        assert_eq!(config.telemetry.min_send_interval_ms, 100);
        assert_eq!(config.pipeline.pace_ms, 5);
    }

    #[test]
    fn test_partial_toml_keeps_field_defaults() {
        let config: Config = toml::from_str(
            r#"
            [detect]
            min_support = 150

            [telemetry]
            serial_port = "/dev/ttyACM0"
            "#,
        )
        .unwrap();
        assert_eq!(config.detect.min_support, 150);
        assert_eq!(config.detect.hsv_upper, [180, 90, 170]);
        assert_eq!(config.telemetry.serial_port, "/dev/ttyACM0");
        assert_eq!(config.telemetry.baud_rate, 9600);
        assert_eq!(config.camera.width, 640);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("definitely/not/here.toml").unwrap();
        assert_eq!(config.camera.index, 0);
    }
}
