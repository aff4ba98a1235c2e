//! Game-session lifecycle tracking and the records it emits.

use super::{truncate_payload, EventQueue, Identity, SessionGuardViolation, MAX_RECORD_BYTES};
use crate::time::{millis_since, Clock};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Ambient-sound classification at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SoundSample {
    pub freq_hz: f32,
    pub intensity: f32,
    pub kind: u8,
}

/// Read-only view of the sound classifier.
pub trait AmbientSource: Send + Sync {
    fn sample(&self) -> SoundSample;
}

/// Stand-in for devices without a microphone.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silence;

impl AmbientSource for Silence {
    fn sample(&self) -> SoundSample {
        SoundSample::default()
    }
}

/// Wire shape of a local collector record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum EventRecord {
    #[serde(rename = "start")]
    Start {
        user: String,
        session: u32,
        modo: String,
        ts: u64,
    },
    #[serde(rename = "ok")]
    RoundOk {
        user: String,
        session: u32,
        modo: String,
        #[serde(serialize_with = "one_decimal")]
        mic_freq: f32,
        #[serde(serialize_with = "three_decimals")]
        mic_int: f32,
        mic_type: u8,
        last_ms: u32,
        avg_ms: u32,
        ok_total: u32,
        err_total: u32,
        ts: u64,
    },
    #[serde(rename = "err")]
    RoundErr {
        user: String,
        session: u32,
        modo: String,
        #[serde(serialize_with = "one_decimal")]
        mic_freq: f32,
        #[serde(serialize_with = "three_decimals")]
        mic_int: f32,
        mic_type: u8,
        last_ms: u32,
        ok_total: u32,
        err_total: u32,
        ts: u64,
    },
    #[serde(rename = "stop")]
    Stop {
        user: String,
        session: u32,
        modo: String,
        #[serde(serialize_with = "one_decimal")]
        mic_freq: f32,
        #[serde(serialize_with = "three_decimals")]
        mic_int: f32,
        mic_type: u8,
        ok_total: u32,
        err_total: u32,
        total_ms: u64,
        ts: u64,
    },
}

impl EventRecord {
    pub fn session(&self) -> u32 {
        match self {
            Self::Start { session, .. }
            | Self::RoundOk { session, .. }
            | Self::RoundErr { session, .. }
            | Self::Stop { session, .. } => *session,
        }
    }

    /// Serialize and bound to the datagram size. The cut may leave invalid JSON behind.
    pub fn encode(&self) -> Bytes {
        let json = match serde_json::to_vec(self) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!("event record serialization failed: {err}");
                return Bytes::new();
            }
        };
        if json.len() > MAX_RECORD_BYTES {
            tracing::debug!(len = json.len(), "event record truncated");
            return Bytes::copy_from_slice(truncate_payload(&json, MAX_RECORD_BYTES));
        }
        Bytes::from(json)
    }
}

pub(crate) fn round_to(value: f32, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (f64::from(value) * scale).round() / scale
}

pub(crate) fn one_decimal<S: serde::Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round_to(*value, 1))
}

pub(crate) fn three_decimals<S: serde::Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round_to(*value, 3))
}

/// Open/closed state of the local game session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalSession {
    pub open: bool,
    pub id: u32,
    pub start_ts: u64,
}

/// Enforces the session guards and hands accepted records to the event queue.
///
/// Cloned handles share one session; any producer task may call in.
#[derive(Clone)]
pub struct SessionTracker<C: Clock> {
    state: Arc<Mutex<LocalSession>>,
    queue: Option<EventQueue>,
    identity: Identity,
    ambient: Arc<dyn AmbientSource>,
    clock: C,
    boot: Instant,
}

impl<C: Clock> SessionTracker<C> {
    pub fn new(
        queue: EventQueue,
        identity: Identity,
        ambient: Arc<dyn AmbientSource>,
        clock: C,
    ) -> Self {
        Self::build(Some(queue), identity, ambient, clock)
    }

    /// Tracker used when the reporter failed to start: guards still apply, records are discarded.
    pub fn disabled(identity: Identity, ambient: Arc<dyn AmbientSource>, clock: C) -> Self {
        Self::build(None, identity, ambient, clock)
    }

    fn build(
        queue: Option<EventQueue>,
        identity: Identity,
        ambient: Arc<dyn AmbientSource>,
        clock: C,
    ) -> Self {
        let boot = clock.now();
        Self {
            state: Arc::new(Mutex::new(LocalSession::default())),
            queue,
            identity,
            ambient,
            clock,
            boot,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    pub fn session(&self) -> LocalSession {
        *self.state.lock()
    }

    fn now_ms(&self) -> u64 {
        millis_since(self.boot, self.clock.now())
    }

    pub fn start(&self, mode: &str) -> Result<u32, SessionGuardViolation> {
        let ts = self.now_ms();
        let record = {
            let mut session = self.state.lock();
            if session.open {
                tracing::info!(session = session.id, "start ignored: session already open");
                return Err(SessionGuardViolation::AlreadyOpen {
                    session: session.id,
                });
            }
            session.open = true;
            session.id = session.id.wrapping_add(1);
            session.start_ts = ts;
            EventRecord::Start {
                user: self.identity.active_user(),
                session: session.id,
                modo: mode.to_string(),
                ts,
            }
        };
        let id = record.session();
        self.emit(&record);
        Ok(id)
    }

    pub fn ok(
        &self,
        last_ms: u32,
        avg_ms: u32,
        ok_total: u32,
        err_total: u32,
        mode: &str,
    ) -> Result<(), SessionGuardViolation> {
        let session = self.open_session()?;
        let sound = self.ambient.sample();
        self.emit(&EventRecord::RoundOk {
            user: self.identity.active_user(),
            session: session.id,
            modo: mode.to_string(),
            mic_freq: sound.freq_hz,
            mic_int: sound.intensity,
            mic_type: sound.kind,
            last_ms,
            avg_ms,
            ok_total,
            err_total,
            ts: self.now_ms(),
        });
        Ok(())
    }

    pub fn err(
        &self,
        last_ms: u32,
        ok_total: u32,
        err_total: u32,
        mode: &str,
    ) -> Result<(), SessionGuardViolation> {
        let session = self.open_session()?;
        let sound = self.ambient.sample();
        self.emit(&EventRecord::RoundErr {
            user: self.identity.active_user(),
            session: session.id,
            modo: mode.to_string(),
            mic_freq: sound.freq_hz,
            mic_int: sound.intensity,
            mic_type: sound.kind,
            last_ms,
            ok_total,
            err_total,
            ts: self.now_ms(),
        });
        Ok(())
    }

    pub fn stop(
        &self,
        ok_total: u32,
        err_total: u32,
        mode: &str,
    ) -> Result<(), SessionGuardViolation> {
        let ts = self.now_ms();
        let sound = self.ambient.sample();
        let record = {
            let mut session = self.state.lock();
            if !session.open {
                return Err(SessionGuardViolation::NotOpen);
            }
            let total_ms = ts.saturating_sub(session.start_ts);
            let record = EventRecord::Stop {
                user: self.identity.active_user(),
                session: session.id,
                modo: mode.to_string(),
                mic_freq: sound.freq_hz,
                mic_int: sound.intensity,
                mic_type: sound.kind,
                ok_total,
                err_total,
                total_ms,
                ts,
            };
            session.open = false;
            session.start_ts = 0;
            record
        };
        self.emit(&record);
        Ok(())
    }

    fn open_session(&self) -> Result<LocalSession, SessionGuardViolation> {
        let session = *self.state.lock();
        if session.open {
            Ok(session)
        } else {
            Err(SessionGuardViolation::NotOpen)
        }
    }

    fn emit(&self, record: &EventRecord) {
        if let Some(queue) = &self.queue {
            let encoded = record.encode();
            if !encoded.is_empty() {
                queue.enqueue(encoded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::time::Duration;

    struct FixedSound(SoundSample);

    impl AmbientSource for FixedSound {
        fn sample(&self) -> SoundSample {
            self.0
        }
    }

    fn tracker(clock: &ManualClock) -> (SessionTracker<ManualClock>, EventQueue, Identity) {
        let queue = EventQueue::new(24).unwrap();
        let identity = Identity::detached();
        let sound = FixedSound(SoundSample {
            freq_hz: 440.04,
            intensity: 0.12345,
            kind: 2,
        });
        let tracker = SessionTracker::new(
            queue.clone(),
            identity.clone(),
            Arc::new(sound),
            clock.clone(),
        );
        (tracker, queue, identity)
    }

    fn decode(record: &Bytes) -> serde_json::Value {
        serde_json::from_slice(record).unwrap()
    }

    #[test]
    fn start_while_open_is_rejected_without_queueing() {
        let clock = ManualClock::new();
        let (tracker, queue, _) = tracker(&clock);
        assert_eq!(tracker.start("NIVEL 1"), Ok(1));
        assert_eq!(
            tracker.start("NIVEL 1"),
            Err(SessionGuardViolation::AlreadyOpen { session: 1 })
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn round_events_ignored_while_closed() {
        let clock = ManualClock::new();
        let (tracker, queue, _) = tracker(&clock);
        assert_eq!(tracker.ok(10, 10, 1, 0, "NIVEL 1"), Err(SessionGuardViolation::NotOpen));
        assert_eq!(tracker.err(10, 0, 1, "NIVEL 1"), Err(SessionGuardViolation::NotOpen));
        assert_eq!(tracker.stop(0, 0, "NIVEL 1"), Err(SessionGuardViolation::NotOpen));
        assert!(queue.is_empty());
        assert!(!tracker.session().open);
    }

    #[test]
    fn stop_closes_after_any_history() {
        let clock = ManualClock::new();
        let (tracker, _, _) = tracker(&clock);
        tracker.start("MEMORIA").unwrap();
        tracker.err(300, 0, 1, "MEMORIA").unwrap();
        tracker.err(250, 0, 2, "MEMORIA").unwrap();
        tracker.stop(0, 2, "MEMORIA").unwrap();
        let session = tracker.session();
        assert!(!session.open);
        assert_eq!(session.start_ts, 0);
        assert_eq!(tracker.start("MEMORIA"), Ok(2));
    }

    #[test]
    fn total_ms_clamped_when_clock_runs_backwards() {
        let clock = ManualClock::new();
        let (tracker, queue, _) = tracker(&clock);
        clock.advance(Duration::from_millis(5_000));
        tracker.start("NIVEL 1").unwrap();
        clock.rewind(Duration::from_millis(3_000));
        tracker.stop(0, 0, "NIVEL 1").unwrap();
        let records = queue.snapshot();
        let stop = decode(records.last().unwrap());
        assert_eq!(stop["total_ms"], 0);
    }

    #[test]
    fn level_one_session_emits_four_records() {
        let clock = ManualClock::new();
        let (tracker, queue, identity) = tracker(&clock);
        identity.set_local("Davi");
        tracker.start("NIVEL 1").unwrap();
        clock.advance(Duration::from_millis(1_200));
        tracker.ok(1_200, 1_200, 1, 0, "NIVEL 1").unwrap();
        clock.advance(Duration::from_millis(800));
        tracker.ok(800, 1_000, 2, 0, "NIVEL 1").unwrap();
        clock.advance(Duration::from_millis(500));
        tracker.stop(5, 0, "NIVEL 1").unwrap();

        let records: Vec<_> = queue.snapshot().iter().map(decode).collect();
        assert_eq!(records.len(), 4);
        let events: Vec<_> = records.iter().map(|r| r["event"].clone()).collect();
        assert_eq!(events, ["start", "ok", "ok", "stop"]);
        assert!(records.iter().all(|r| r["session"] == 1));
        assert!(records.iter().all(|r| r["user"] == "Davi"));
        let stop = &records[3];
        assert_eq!(stop["total_ms"], 2_500);
        assert_eq!(stop["err_total"], 0);
        assert_eq!(stop["ok_total"], 5);
    }

    #[test]
    fn records_follow_wire_field_order() {
        let clock = ManualClock::new();
        let (tracker, queue, _) = tracker(&clock);
        tracker.start("NIVEL 1").unwrap();
        tracker.ok(120, 110, 3, 1, "NIVEL 1").unwrap();
        tracker.err(90, 3, 2, "NIVEL 1").unwrap();
        let records = queue.snapshot();
        assert_eq!(
            std::str::from_utf8(&records[0]).unwrap(),
            r#"{"event":"start","user":"","session":1,"modo":"NIVEL 1","ts":0}"#
        );
        assert_eq!(
            std::str::from_utf8(&records[1]).unwrap(),
            r#"{"event":"ok","user":"","session":1,"modo":"NIVEL 1","mic_freq":440.0,"mic_int":0.123,"mic_type":2,"last_ms":120,"avg_ms":110,"ok_total":3,"err_total":1,"ts":0}"#
        );
        let err = decode(&records[2]);
        assert_eq!(err["event"], "err");
        assert!(err.get("avg_ms").is_none());
    }

    #[test]
    fn oversized_record_is_truncated_to_bound() {
        let clock = ManualClock::new();
        let (tracker, queue, _) = tracker(&clock);
        let mode = "M".repeat(400);
        tracker.start(&mode).unwrap();
        let records = queue.snapshot();
        assert_eq!(records[0].len(), MAX_RECORD_BYTES);
        assert!(serde_json::from_slice::<serde_json::Value>(&records[0]).is_err());
    }

    #[test]
    fn disabled_tracker_keeps_guards_and_discards_records() {
        let clock = ManualClock::new();
        let tracker =
            SessionTracker::disabled(Identity::detached(), Arc::new(Silence), clock.clone());
        assert!(!tracker.is_enabled());
        assert_eq!(tracker.start("NIVEL 1"), Ok(1));
        assert!(tracker.start("NIVEL 1").is_err());
        assert!(tracker.stop(0, 0, "NIVEL 1").is_ok());
    }
}
