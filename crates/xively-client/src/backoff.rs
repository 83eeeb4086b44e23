//! Reconnect backoff.
//!
//! Failures move an index up a table of penalties; a decay event moves it
//! back down one entry at a time once the client has behaved for the
//! matching decay period. Success never resets the index directly.

use log::{debug, trace};
use rand::RngCore;

use crate::config::BackoffConfig;
use crate::dispatcher::{Dispatch, TimeEventId};
use crate::state::State;

/// How a state affects the backoff index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffClass {
    #[default]
    None,
    Recoverable,
    Terminal,
}

/// Map a state to its backoff class.
pub fn classify_state(state: State) -> BackoffClass {
    match state {
        State::Ok | State::Written => BackoffClass::None,
        State::ConnectionResetByPeer
        | State::MqttUnacceptableProtocolVersion
        | State::MqttIdentifierRejected
        | State::MqttBadUsernameOrPassword
        | State::MqttNotAuthorized => BackoffClass::Terminal,
        _ => BackoffClass::Recoverable,
    }
}

/// Backoff index, tables and the pending decay event.
#[derive(Debug)]
pub struct BackoffStatus {
    lut: Vec<u32>,
    decay_lut: Vec<u32>,
    index: usize,
    class: BackoffClass,
    decay_event: Option<TimeEventId>,
}

impl BackoffStatus {
    pub fn new(config: &BackoffConfig) -> Self {
        let lut = if config.lut.is_empty() { vec![0] } else { config.lut.clone() };
        let mut decay_lut = config.decay_lut.clone();
        decay_lut.resize(lut.len(), decay_lut.last().copied().unwrap_or(0));
        Self {
            lut,
            decay_lut,
            index: 0,
            class: BackoffClass::None,
            decay_event: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn class(&self) -> BackoffClass {
        self.class
    }

    pub fn has_decay_event(&self) -> bool {
        self.decay_event.is_some()
    }

    /// Randomized penalty in steps: the table value at the current index,
    /// spread by up to half the previous table value either way, never
    /// below the first table value.
    pub fn penalty(&self, rng: &mut dyn RngCore) -> i64 {
        let value = i64::from(self.lut[self.index]);
        let half = if self.index == 0 {
            0
        } else {
            (i64::from(self.lut[self.index - 1]) / 2).max(1)
        };
        let jitter = i64::from(rng.next_u32()) % (2 * half + 1);
        (value + jitter - half).max(i64::from(self.lut[0]))
    }
}

/// Access to the backoff status embedded in a context.
pub trait Backoff: Dispatch {
    fn backoff_status(&mut self) -> &mut BackoffStatus;
}

/// Classify `state` and step the index up for failures.
pub fn update_backoff_penalty<C: Backoff>(cx: &mut C, state: State) -> State {
    let class = classify_state(state);
    cx.backoff_status().class = class;
    match class {
        BackoffClass::None => {
            cancel_backoff_event(cx);
            if cx.backoff_status().index > 0 {
                schedule_decay(cx)
            } else {
                State::Ok
            }
        }
        BackoffClass::Recoverable | BackoffClass::Terminal => inc_backoff_penalty(cx),
    }
}

/// Raise the index by one, saturating, and restart the decay countdown.
pub fn inc_backoff_penalty<C: Backoff>(cx: &mut C) -> State {
    let status = cx.backoff_status();
    status.index = (status.index + 1).min(status.lut.len() - 1);
    debug!("backoff index raised to {}", status.index);
    schedule_decay(cx)
}

/// Lower the index by one, saturating at zero.
pub fn dec_backoff_penalty<C: Backoff>(cx: &mut C) -> State {
    let status = cx.backoff_status();
    status.index = status.index.saturating_sub(1);
    debug!("backoff index lowered to {}", status.index);
    State::Ok
}

/// Drop the pending decay event, if any.
pub fn cancel_backoff_event<C: Backoff>(cx: &mut C) {
    if let Some(event) = cx.backoff_status().decay_event.take() {
        let _ = cx.dispatcher().cancel(event);
    }
}

/// Randomized penalty for the current index.
pub fn get_backoff_penalty(status: &BackoffStatus, rng: &mut dyn RngCore) -> i64 {
    status.penalty(rng)
}

fn schedule_decay<C: Backoff>(cx: &mut C) -> State {
    let status = cx.backoff_status();
    let delay = i64::from(status.decay_lut[status.index]);
    if let Some(event) = status.decay_event {
        if cx.dispatcher().restart(event, delay).is_ok() {
            return State::Ok;
        }
    }
    match cx
        .dispatcher()
        .execute_in(Box::new(|cx: &mut C| decay(cx)), delay)
    {
        Ok(event) => {
            cx.backoff_status().decay_event = Some(event);
            State::Ok
        }
        Err(state) => {
            cx.backoff_status().decay_event = None;
            state
        }
    }
}

fn decay<C: Backoff>(cx: &mut C) -> State {
    let status = cx.backoff_status();
    status.decay_event = None;
    if status.class != BackoffClass::None {
        trace!("backoff decay skipped while class is {:?}", status.class);
        return State::Ok;
    }
    dec_backoff_penalty(cx);
    if cx.backoff_status().index > 0 {
        return schedule_decay(cx);
    }
    State::Ok
}
