//! Simulate command - scripted game sessions through the real reporter.

use crate::cli::args::SimulateArgs;
use crate::config::Config;
use crate::device::{DeviceBoard, GameState};
use crate::report::{SessionGuardViolation, SessionTracker, SoundSample};
use crate::runtime::Runtime;
use crate::telemetry;
use crate::time::{millis_since, Clock, ManualClock};
use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shape of one scripted session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub mode: String,
    pub rounds: u32,
    pub round: Duration,
    pub fail_every: u32,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    sessions: Vec<u32>,
    reporting: bool,
    queued_left: usize,
    evicted: u64,
}

/// Play one session: start, one ok/err per round, stop. Round metrics
/// accumulate on `board` the way the game loop would update them.
pub fn play_session(
    tracker: &SessionTracker<ManualClock>,
    board: &DeviceBoard,
    clock: &ManualClock,
    boot: Instant,
    plan: &SessionPlan,
) -> Result<u32, SessionGuardViolation> {
    board.update(|state| {
        state.game = GameState::Running;
        state.mode = plan.mode.clone();
    });
    let id = tracker.start(&plan.mode)?;
    for round in 1..=plan.rounds {
        board.update(|state| state.metrics.begin_round(millis_since(boot, clock.now())));
        clock.advance(plan.round);
        board.set_sound(SoundSample {
            freq_hz: 60.0 + 20.0 * round as f32,
            intensity: 0.1 * (round % 5) as f32,
            kind: (round % 3) as u8,
        });
        let now_ms = millis_since(boot, clock.now());
        let failed = plan.fail_every > 0 && round % plan.fail_every == 0;
        let mut metrics = board.metrics();
        if failed {
            let last = metrics.finish_err(now_ms);
            tracker.err(last, metrics.ok_total, metrics.err_total, &plan.mode)?;
        } else {
            let last = metrics.finish_ok(now_ms);
            tracker.ok(last, metrics.avg_ms(), metrics.ok_total, metrics.err_total, &plan.mode)?;
        }
        board.update(|state| state.metrics = metrics);
    }
    let metrics = board.metrics();
    tracker.stop(metrics.ok_total, metrics.err_total, &plan.mode)?;
    board.update(|state| state.game = GameState::Idle);
    Ok(id)
}

pub async fn run_simulate(args: SimulateArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let mut cfg = Config::load(path)?;
            cfg.apply_env_overrides()?;
            cfg
        }
        None => Config::default(),
    };
    if args.offline {
        config.broker.enabled = false;
    }
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    let clock = ManualClock::new();
    let boot = clock.now();
    let mut runtime = Runtime::start(config, clock.clone(), Some(log_handle)).await?;
    if let Some(user) = &args.user {
        runtime.identity().set_local(user);
    }

    let plan = SessionPlan {
        mode: args.mode.clone(),
        rounds: args.rounds,
        round: Duration::from_millis(args.round_ms),
        fail_every: args.fail_every,
    };
    let tracker = runtime.tracker();
    let board = runtime.board();
    let mut sessions = Vec::new();
    for _ in 0..args.sessions {
        sessions.push(play_session(&tracker, &board, &clock, boot, &plan)?);
    }

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    if let Some(queue) = runtime.queue() {
        while !queue.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    let report = SimulationReport {
        sessions,
        reporting: tracker.is_enabled(),
        queued_left: runtime.queue().map_or(0, |q| q.len()),
        evicted: runtime.queue().map_or(0, |q| q.evicted()),
    };
    runtime.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
