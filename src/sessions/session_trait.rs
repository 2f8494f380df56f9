use crate::bridge::{FrameInputs, OutputSink, SimulationBridge};
use crate::sessions::event_drain::EventDrain;
use crate::{Frame, NetplayError, SessionState, StepStatus};

/// The interface every session type offers to a frame loop.
///
/// [`P2PSession`], [`SpectatorSession`] and [`BroadcastSession`] all implement it, so
/// [`create_session`] can hand back whichever one the arguments call for as a trait object.
///
/// | Method | [`P2PSession`] | [`SpectatorSession`] | [`BroadcastSession`] |
/// |--------|:-:|:-:|:-:|
/// | [`pre_step`](NetplaySession::pre_step) | handshake, stall, pause | waits for recorded input | polls both ports |
/// | [`post_step`](NetplaySession::post_step) | reconcile and replay | advances playback | streams the frame |
/// | [`run_frame`](NetplaySession::run_frame) | provided | provided | provided |
///
/// # Example
///
/// ```no_run
/// use netplay_rollback::prelude::*;
///
/// fn frame<B: SimulationBridge>(
///     session: &mut dyn NetplaySession<B>,
///     sink: &mut dyn OutputSink,
/// ) -> Result<(), NetplayError> {
///     match session.run_frame(sink)? {
///         StepStatus::Ready => {},
///         _ => { /* present the previous frame again */ },
///     }
///     for event in session.events() {
///         if let NetplayEvent::Disconnected { reason } = event {
///             eprintln!("netplay ended: {reason}");
///         }
///     }
///     Ok(())
/// }
/// ```
///
/// [`P2PSession`]: crate::P2PSession
/// [`SpectatorSession`]: crate::SpectatorSession
/// [`BroadcastSession`]: crate::BroadcastSession
/// [`create_session`]: crate::create_session
pub trait NetplaySession<B: SimulationBridge> {
    /// Prepares the next frame. Only on [`StepStatus::Ready`] may the simulation step.
    fn pre_step(&mut self) -> Result<StepStatus, NetplayError>;

    /// The inputs the simulation must run the prepared frame with.
    fn current_inputs(&self) -> FrameInputs;

    /// Completes the frame the simulation just stepped.
    fn post_step(&mut self) -> Result<(), NetplayError>;

    /// The simulation.
    fn bridge(&self) -> &B;

    /// The simulation, for stepping it and for presentation-side queries.
    fn bridge_mut(&mut self) -> &mut B;

    /// Drains pending events.
    fn events(&mut self) -> EventDrain<'_>;

    /// Frames produced so far.
    fn frame_count(&self) -> Frame;

    /// Lifecycle state.
    fn state(&self) -> SessionState;

    /// Runs `pre_step`, steps the bridge into `sink` when ready, then runs `post_step`.
    fn run_frame(&mut self, sink: &mut dyn OutputSink) -> Result<StepStatus, NetplayError> {
        let status = self.pre_step()?;
        if status == StepStatus::Ready {
            let inputs = self.current_inputs();
            self.bridge_mut().step(&inputs, sink);
            self.post_step()?;
        }
        Ok(status)
    }
}
