//! In-process device state: the fields the game and sound classifier expose
//! to the telemetry snapshot, plus round timing metrics.

use crate::broker::SnapshotSource;
use crate::report::session::{one_decimal, three_decimals};
use crate::report::{AmbientSource, Identity, SoundSample};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;

/// Whether a game is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GameState {
    #[default]
    Idle = 0,
    Running = 1,
}

/// Per-boot round counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundMetrics {
    pub ok_total: u32,
    pub err_total: u32,
    pub last_ms: u32,
    pub sum_ok_ms: u64,
    round_started_at: Option<u64>,
}

impl RoundMetrics {
    pub fn begin_round(&mut self, now_ms: u64) {
        self.round_started_at = Some(now_ms);
    }

    fn finish(&mut self, now_ms: u64) -> u32 {
        let elapsed = self
            .round_started_at
            .take()
            .map_or(0, |start| now_ms.saturating_sub(start));
        self.last_ms = u32::try_from(elapsed).unwrap_or(u32::MAX);
        self.last_ms
    }

    pub fn finish_ok(&mut self, now_ms: u64) -> u32 {
        let last = self.finish(now_ms);
        self.ok_total = self.ok_total.saturating_add(1);
        self.sum_ok_ms = self.sum_ok_ms.saturating_add(u64::from(last));
        last
    }

    pub fn finish_err(&mut self, now_ms: u64) -> u32 {
        let last = self.finish(now_ms);
        self.err_total = self.err_total.saturating_add(1);
        last
    }

    /// Mean duration of successful rounds; zero before the first one.
    pub fn avg_ms(&self) -> u32 {
        if self.ok_total == 0 {
            return 0;
        }
        u32::try_from(self.sum_ok_ms / u64::from(self.ok_total)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub game: GameState,
    pub mode: String,
    pub target: String,
    pub face: String,
    pub info: String,
    pub sound: SoundSample,
    pub metrics: RoundMetrics,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            game: GameState::Idle,
            mode: "MENU".into(),
            target: "-".into(),
            face: "MOV".into(),
            info: "-".into(),
            sound: SoundSample::default(),
            metrics: RoundMetrics::default(),
        }
    }
}

/// Telemetry document published to the broker.
#[derive(Debug, Serialize)]
pub struct TelemetrySnapshot<'a> {
    pub estado: u8,
    pub user: String,
    pub modo: &'a str,
    pub alvo: &'a str,
    pub face: &'a str,
    pub info: &'a str,
    #[serde(serialize_with = "one_decimal")]
    pub mic_freq: f32,
    #[serde(serialize_with = "three_decimals")]
    pub mic_int: f32,
    pub mic_type: u8,
    pub ok_total: u32,
    pub err_total: u32,
    pub last_ms: u32,
    pub avg_ms: u32,
}

/// Shared device state read by the publisher and the session tracker.
pub struct DeviceBoard {
    state: RwLock<DeviceState>,
    identity: Identity,
}

impl DeviceBoard {
    pub fn new(identity: Identity) -> Self {
        Self {
            state: RwLock::new(DeviceState::default()),
            identity,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut DeviceState)) {
        f(&mut self.state.write());
    }

    pub fn set_sound(&self, sample: SoundSample) {
        self.state.write().sound = sample;
    }

    pub fn metrics(&self) -> RoundMetrics {
        self.state.read().metrics
    }

    pub fn snapshot_json(&self) -> serde_json::Result<Vec<u8>> {
        let user = self.identity.active_user();
        let state = self.state.read();
        serde_json::to_vec(&TelemetrySnapshot {
            estado: state.game as u8,
            user,
            modo: &state.mode,
            alvo: &state.target,
            face: &state.face,
            info: &state.info,
            mic_freq: state.sound.freq_hz,
            mic_int: state.sound.intensity,
            mic_type: state.sound.kind,
            ok_total: state.metrics.ok_total,
            err_total: state.metrics.err_total,
            last_ms: state.metrics.last_ms,
            avg_ms: state.metrics.avg_ms(),
        })
    }
}

impl SnapshotSource for DeviceBoard {
    fn produce(&self) -> Bytes {
        match self.snapshot_json() {
            Ok(json) => Bytes::from(json),
            Err(err) => {
                tracing::warn!("telemetry snapshot serialization failed: {err}");
                Bytes::new()
            }
        }
    }
}

impl AmbientSource for DeviceBoard {
    fn sample(&self) -> SoundSample {
        self.state.read().sound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_counts_only_successful_rounds() {
        let mut metrics = RoundMetrics::default();
        assert_eq!(metrics.avg_ms(), 0);
        metrics.begin_round(1_000);
        assert_eq!(metrics.finish_ok(2_200), 1_200);
        metrics.begin_round(3_000);
        assert_eq!(metrics.finish_err(3_400), 400);
        metrics.begin_round(4_000);
        metrics.finish_ok(4_800);
        assert_eq!(metrics.ok_total, 2);
        assert_eq!(metrics.err_total, 1);
        assert_eq!(metrics.last_ms, 800);
        assert_eq!(metrics.avg_ms(), 1_000);
    }

    #[test]
    fn finishing_without_start_records_zero() {
        let mut metrics = RoundMetrics::default();
        assert_eq!(metrics.finish_err(9_000), 0);
    }

    #[test]
    fn snapshot_has_telemetry_field_order() {
        let board = DeviceBoard::new(Identity::detached());
        board.update(|state| {
            state.game = GameState::Running;
            state.mode = "NIVEL 1".into();
            state.target = "TOPO".into();
            state.sound = SoundSample {
                freq_hz: 512.26,
                intensity: 0.5,
                kind: 1,
            };
        });
        let json = String::from_utf8(board.produce().to_vec()).unwrap();
        assert_eq!(
            json,
            r#"{"estado":1,"user":"","modo":"NIVEL 1","alvo":"TOPO","face":"MOV","info":"-","mic_freq":512.3,"mic_int":0.5,"mic_type":1,"ok_total":0,"err_total":0,"last_ms":0,"avg_ms":0}"#
        );
    }

    #[test]
    fn snapshot_uses_resolved_user() {
        let identity = Identity::detached();
        let board = DeviceBoard::new(identity.clone());
        identity.set_local("Ana");
        let value: serde_json::Value = serde_json::from_slice(&board.produce()).unwrap();
        assert_eq!(value["user"], "Ana");
    }
}
