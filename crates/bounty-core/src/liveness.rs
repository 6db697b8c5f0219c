//! Active liveness challenge: two blinks, then a head turn left and right.
//!
//! The detector is a pure reducer. [`reduce`] takes the current
//! [`GestureState`] and one [`Observation`] and returns the next state plus
//! the one-time [`GestureEvent`]s raised by that frame. [`GestureDetector`]
//! is a thin owner around it for callers that prefer `&mut self`.
//!
//! Stage order is fixed:
//!
//! ```text
//! AwaitingBlinks(0) -> AwaitingBlinks(1) -> BlinksComplete
//!     -> AwaitingHeadLeft -> AwaitingHeadRight -> VerificationComplete
//! ```
//!
//! `BlinksComplete` lasts exactly one frame: the next frame arms head pose
//! tracking without evaluating its tilt. A right turn can only be observed
//! from `AwaitingHeadRight`, which is only reachable through a left turn.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and still images (no blinks, no turn).
//! - **Does not block:** Video replay of a person performing the gestures.

use std::time::Duration;

use crate::geometry::{eye_aspect_ratio, head_tilt};
use crate::types::{LandmarkError, LandmarkFrame};

/// Average EAR below which the eyes count as closed.
pub const BLINK_EAR_THRESHOLD: f32 = 0.280;
/// Minimum spacing between two registered blinks.
pub const BLINK_COOLDOWN: Duration = Duration::from_millis(1000);
/// Absolute head tilt needed to register a turn.
pub const HEAD_TILT_THRESHOLD: f32 = 0.10;
/// Blinks needed before head pose tracking starts.
pub const REQUIRED_BLINKS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `count` is 0 or 1.
    AwaitingBlinks { count: u8 },
    BlinksComplete,
    AwaitingHeadLeft,
    AwaitingHeadRight,
    VerificationComplete,
}

/// Announcements already made this session. Each is raised at most once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Announcements {
    pub blink_complete: bool,
    pub head_pose_started: bool,
    pub head_left_verified: bool,
    pub head_right_verified: bool,
    pub verification_complete: bool,
}

impl Announcements {
    fn slot(&mut self, event: GestureEvent) -> Option<&mut bool> {
        match event {
            GestureEvent::BlinkDetected { .. } => None,
            GestureEvent::BlinksComplete => Some(&mut self.blink_complete),
            GestureEvent::HeadPoseStarted => Some(&mut self.head_pose_started),
            GestureEvent::HeadLeftVerified => Some(&mut self.head_left_verified),
            GestureEvent::HeadRightVerified => Some(&mut self.head_right_verified),
            GestureEvent::VerificationComplete => Some(&mut self.verification_complete),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureEvent {
    /// A blink below the required count (1 of 2).
    BlinkDetected { count: u8 },
    BlinksComplete,
    HeadPoseStarted,
    HeadLeftVerified,
    HeadRightVerified,
    /// Terminal. Raised exactly once per session.
    VerificationComplete,
}

/// Session-scoped gesture state. Only [`reduce`] moves it forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GestureState {
    stage: Stage,
    eyes_closed: bool,
    last_blink: Option<Duration>,
    announced: Announcements,
}

impl Default for GestureState {
    fn default() -> Self {
        Self {
            stage: Stage::AwaitingBlinks { count: 0 },
            eyes_closed: false,
            last_blink: None,
            announced: Announcements::default(),
        }
    }
}

impl GestureState {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn blink_count(&self) -> u8 {
        match self.stage {
            Stage::AwaitingBlinks { count } => count,
            _ => REQUIRED_BLINKS,
        }
    }

    pub fn eyes_closed(&self) -> bool {
        self.eyes_closed
    }

    /// Session time of the last registered blink.
    pub fn last_blink(&self) -> Option<Duration> {
        self.last_blink
    }

    pub fn head_turned_left(&self) -> bool {
        matches!(
            self.stage,
            Stage::AwaitingHeadRight | Stage::VerificationComplete
        )
    }

    pub fn head_turned_right(&self) -> bool {
        self.stage == Stage::VerificationComplete
    }

    pub fn verification_complete(&self) -> bool {
        self.stage == Stage::VerificationComplete
    }

    pub fn announced(&self) -> Announcements {
        self.announced
    }

    /// Progress percentage, a pure function of the stage.
    pub fn progress(&self) -> u8 {
        match self.stage {
            Stage::AwaitingBlinks { count } => (count.saturating_mul(25)).min(50),
            Stage::BlinksComplete | Stage::AwaitingHeadLeft => 50,
            Stage::AwaitingHeadRight => 75,
            Stage::VerificationComplete => 100,
        }
    }
}

/// Per-frame measurements the reducer needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Monotonic time since the session started.
    pub at: Duration,
    /// Mean of left and right eye aspect ratios.
    pub avg_ear: f32,
    pub head_tilt: f32,
}

impl Observation {
    pub fn from_frame(frame: &LandmarkFrame, at: Duration) -> Result<Self, LandmarkError> {
        let (left, right) = frame.eyes()?;
        Ok(Self {
            at,
            avg_ear: (eye_aspect_ratio(&left) + eye_aspect_ratio(&right)) / 2.0,
            head_tilt: head_tilt(&left, &right),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: GestureState,
    pub events: Vec<GestureEvent>,
}

/// Advance the gesture state by one observation.
pub fn reduce(state: &GestureState, obs: &Observation) -> Transition {
    let mut next = state.clone();
    let mut events = Vec::new();

    if state.stage == Stage::VerificationComplete {
        return Transition {
            state: next,
            events,
        };
    }

    // Blink edge: open -> closed, outside the cooldown window
    let closed = obs.avg_ear < BLINK_EAR_THRESHOLD;
    if closed && !state.eyes_closed {
        let cooled = state
            .last_blink
            .map_or(true, |last| obs.at.saturating_sub(last) >= BLINK_COOLDOWN);
        if let (true, Stage::AwaitingBlinks { count }) = (cooled, state.stage) {
            let count = (count + 1).min(REQUIRED_BLINKS);
            next.last_blink = Some(obs.at);
            if count >= REQUIRED_BLINKS {
                next.stage = Stage::BlinksComplete;
                announce(&mut next.announced, GestureEvent::BlinksComplete, &mut events);
            } else {
                next.stage = Stage::AwaitingBlinks { count };
                events.push(GestureEvent::BlinkDetected { count });
            }
        }
    }
    next.eyes_closed = closed;

    // Head pose, evaluated against the stage this frame started in
    match state.stage {
        Stage::BlinksComplete => {
            next.stage = Stage::AwaitingHeadLeft;
            announce(&mut next.announced, GestureEvent::HeadPoseStarted, &mut events);
        }
        Stage::AwaitingHeadLeft if obs.head_tilt < -HEAD_TILT_THRESHOLD => {
            next.stage = Stage::AwaitingHeadRight;
            announce(&mut next.announced, GestureEvent::HeadLeftVerified, &mut events);
        }
        Stage::AwaitingHeadRight if obs.head_tilt > HEAD_TILT_THRESHOLD => {
            next.stage = Stage::VerificationComplete;
            announce(&mut next.announced, GestureEvent::HeadRightVerified, &mut events);
            announce(
                &mut next.announced,
                GestureEvent::VerificationComplete,
                &mut events,
            );
        }
        _ => {}
    }

    Transition {
        state: next,
        events,
    }
}

fn announce(announced: &mut Announcements, event: GestureEvent, events: &mut Vec<GestureEvent>) {
    match announced.slot(event) {
        Some(shown) if *shown => {}
        Some(shown) => {
            *shown = true;
            events.push(event);
        }
        None => events.push(event),
    }
}

/// Owns one session's [`GestureState`].
#[derive(Debug, Default)]
pub struct GestureDetector {
    state: GestureState,
}

impl GestureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GestureState {
        &self.state
    }

    pub fn progress(&self) -> u8 {
        self.state.progress()
    }

    /// Feed one detection. Once verification is complete, frames are ignored
    /// without being validated.
    pub fn process(
        &mut self,
        frame: &LandmarkFrame,
        at: Duration,
    ) -> Result<Vec<GestureEvent>, LandmarkError> {
        if self.state.verification_complete() {
            return Ok(Vec::new());
        }
        let obs = Observation::from_frame(frame, at)?;
        Ok(self.observe(&obs))
    }

    pub fn observe(&mut self, obs: &Observation) -> Vec<GestureEvent> {
        let Transition { state, events } = reduce(&self.state, obs);
        self.state = state;
        events
    }

    pub fn reset(&mut self) {
        self.state = GestureState::default();
    }
}
