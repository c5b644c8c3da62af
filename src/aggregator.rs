//! DebounceAggregator - turns semantic dial events into outbound messages
//!
//! Button edges are debounced and forwarded immediately. Rotation steps are
//! summed over a short window and flushed as a single degree delta, so
//! consumers see intentional motion instead of a flood of detent ticks.
//!
//! The state machine itself is synchronous and takes the current instant as
//! input; [`DebounceAggregator::run`] drives it from the event channel and
//! its own flush deadline.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::hub::{DialMessage, SharedHub};
use crate::protocol::{ButtonState, SemanticEvent};

/// Aggregation and debounce policy
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Rotation accumulation window. Zero flushes on the next scheduler turn.
    pub aggregation_interval: Duration,
    /// Flushes below this magnitude are dropped as noise
    pub min_reportable_degrees: f64,
    /// Dial resolution used to convert steps into degrees
    pub steps_per_revolution: u16,
    /// Rotation is ignored for this long after any button edge
    pub button_suppression: Duration,
    /// Also ignore rotation for as long as the button is held
    pub suppress_while_held: bool,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            aggregation_interval: Duration::from_millis(50),
            min_reportable_degrees: 0.5,
            steps_per_revolution: 3600,
            button_suppression: Duration::from_millis(100),
            suppress_while_held: false,
        }
    }
}

/// Running rotation sum plus its (at most one) pending flush deadline
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregationWindow {
    pub accumulated: i64,
    pub flush_at: Option<Instant>,
}

pub struct DebounceAggregator {
    settings: AggregatorSettings,
    button: Option<ButtonState>,
    window: AggregationWindow,
    suppressed_until: Option<Instant>,
}

impl DebounceAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            button: None,
            window: AggregationWindow::default(),
            suppressed_until: None,
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Last emitted button state (`None` until the first edge)
    pub fn button_state(&self) -> Option<ButtonState> {
        self.button
    }

    pub fn window(&self) -> &AggregationWindow {
        &self.window
    }

    /// Deadline of the pending flush, if one is armed
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.window.flush_at
    }

    /// Degrees represented by one device step
    pub fn degrees_per_step(&self) -> f64 {
        360.0 / f64::from(self.settings.steps_per_revolution.max(1))
    }

    /// Whether rotation arriving at `now` is discarded
    pub fn is_suppressed(&self, now: Instant) -> bool {
        let held = self.settings.suppress_while_held && self.button == Some(ButtonState::Down);
        let cooling = self.suppressed_until.is_some_and(|until| now < until);
        held || cooling
    }

    /// Feed one event. Button edges may produce an immediate message; rotation
    /// only arms the flush deadline.
    pub fn on_event(&mut self, event: SemanticEvent, now: Instant) -> Option<DialMessage> {
        match event {
            SemanticEvent::ButtonEdge { state } => self.on_button(state, now),
            SemanticEvent::Rotation { delta } => {
                self.on_rotation(delta, now);
                None
            }
        }
    }

    fn on_button(&mut self, state: ButtonState, now: Instant) -> Option<DialMessage> {
        // The dial repeats button-down reports while held and occasionally
        // doubles button-up; only transitions go downstream.
        match (self.button, state) {
            (Some(ButtonState::Down), ButtonState::Down) => return None,
            (Some(ButtonState::Up) | None, ButtonState::Up) => return None,
            _ => {}
        }

        self.button = Some(state);
        if !self.settings.button_suppression.is_zero() {
            self.suppressed_until = Some(now + self.settings.button_suppression);
        }

        debug!("BUTTON: {:?}", state);
        Some(DialMessage::Button { button: state })
    }

    fn on_rotation(&mut self, delta: i32, now: Instant) {
        if self.is_suppressed(now) {
            trace!("ROTATE: {} suppressed", delta);
            return;
        }

        trace!("ROTATE: {}", delta);
        self.window.accumulated += i64::from(delta);
        if self.window.flush_at.is_none() {
            self.window.flush_at = Some(now + self.settings.aggregation_interval);
        }
    }

    /// Close the current window. Returns a message when the accumulated
    /// motion reaches the reporting threshold.
    pub fn flush(&mut self) -> Option<DialMessage> {
        let steps = std::mem::take(&mut self.window.accumulated);
        self.window.flush_at = None;
        if steps == 0 {
            return None;
        }

        let degrees = steps as f64 * self.degrees_per_step();
        if degrees.abs() >= self.settings.min_reportable_degrees {
            Some(DialMessage::Rotation { degrees })
        } else {
            trace!("dropping sub-threshold rotation: {} degrees", degrees);
            None
        }
    }

    /// Flush if the pending deadline has passed at `now`
    pub fn poll_flush(&mut self, now: Instant) -> Option<DialMessage> {
        match self.window.flush_at {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// Consume events until the channel closes or `shutdown` fires,
    /// publishing every resulting message to `hub`.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SemanticEvent>,
        hub: SharedHub,
        shutdown: CancellationToken,
    ) {
        info!(
            "Aggregator started ({:?} window, {} steps/rev, {}° minimum)",
            self.settings.aggregation_interval,
            self.settings.steps_per_revolution,
            self.settings.min_reportable_degrees
        );

        loop {
            let deadline = self.window.flush_at;
            tokio::select! {
                // A due flush always closes the window before the next event can extend it
                biased;

                _ = shutdown.cancelled() => break,

                _ = sleep_until_deadline(deadline) => {
                    if let Some(message) = self.flush() {
                        publish(&hub, &message);
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(message) = self.on_event(event, Instant::now()) {
                        publish(&hub, &message);
                    }
                }
            }
        }

        // Deliver motion that was still pending when the source went away
        if let Some(message) = self.flush() {
            publish(&hub, &message);
        }
        info!("Aggregator stopped");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn publish(hub: &SharedHub, message: &DialMessage) {
    let delivered = hub.send(message);
    trace!("{:?} delivered to {} client(s)", message, delivered);
}
