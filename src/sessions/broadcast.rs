use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::bridge::{FrameInputs, InputState, SimulationBridge};
use crate::report_violation_to;
use crate::sessions::event_drain::EventDrain;
use crate::sessions::session_trait::NetplaySession;
use crate::sessions::spectator::SpectatorHost;
use crate::sessions::state::SessionState;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, NetplayError, NetplayEvent, StepStatus};

const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// Local play on both ports, streamed to spectators.
///
/// There is no remote peer, so nothing is ever predicted: every frame is final as soon
/// as it runs. Spectators that connect mid-session receive the live state as their header.
pub struct BroadcastSession<B: SimulationBridge> {
    bridge: B,
    host: SpectatorHost,
    frame_count: Frame,
    inputs: FrameInputs,
    ready: bool,
    state_buf: Vec<u8>,
    events: VecDeque<NetplayEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<B: SimulationBridge> std::fmt::Debug for BroadcastSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSession")
            .field("frame_count", &self.frame_count)
            .field("spectators", &self.host.len())
            .finish_non_exhaustive()
    }
}

impl<B: SimulationBridge> BroadcastSession<B> {
    pub(crate) fn new(
        bridge: B,
        mut host: SpectatorHost,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Result<Self, NetplayError> {
        host.set_violation_observer(violation_observer.clone());
        let state_size = match bridge.state_size() {
            Some(size) if size > 0 => size,
            other => {
                return Err(NetplayError::UnsupportedBridge {
                    info: format!("bridge reported state size {other:?}"),
                })
            },
        };
        Ok(Self {
            bridge,
            host,
            frame_count: Frame::ZERO,
            inputs: FrameInputs::idle(Frame::ZERO),
            ready: false,
            state_buf: vec![0; state_size],
            events: VecDeque::new(),
            violation_observer,
        })
    }

    /// Connected spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.host.len()
    }

    /// Where spectators connect.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, NetplayError> {
        self.host.local_addr()
    }

    /// Gives the bridge back, closing every spectator connection.
    #[must_use]
    pub fn into_bridge(self) -> B {
        self.bridge
    }

    fn welcome_spectators(&mut self) {
        if !self.host.poll_accept(&mut self.events) {
            return;
        }
        if self.bridge.serialize(&mut self.state_buf) == Some(self.state_buf.len()) {
            self.host
                .send_headers(self.frame_count, &self.state_buf, &mut self.events);
        } else {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Spectator,
                "could not serialize frame {} for new spectators",
                self.frame_count
            );
        }
    }
}

impl<B: SimulationBridge> NetplaySession<B> for BroadcastSession<B> {
    fn pre_step(&mut self) -> Result<StepStatus, NetplayError> {
        if self.ready {
            return Err(NetplayError::InvalidRequest {
                info: "pre_step called twice without post_step".to_owned(),
            });
        }
        self.welcome_spectators();
        let mut inputs = FrameInputs::idle(self.frame_count);
        for (port, input) in inputs.ports.iter_mut().enumerate() {
            let bridge = &self.bridge;
            *input = InputState::capture(|device, index, id| {
                bridge.poll_input(port as u32, device, index, id)
            });
        }
        self.inputs = inputs;
        self.ready = true;
        Ok(StepStatus::Ready)
    }

    fn current_inputs(&self) -> FrameInputs {
        self.inputs
    }

    fn post_step(&mut self) -> Result<(), NetplayError> {
        if !self.ready {
            return Err(NetplayError::InvalidRequest {
                info: "post_step called without a ready frame".to_owned(),
            });
        }
        self.ready = false;
        self.host
            .broadcast(std::slice::from_ref(&self.inputs), &mut self.events);
        trace!(frame = %self.frame_count, spectators = self.host.len(), "frame broadcast");
        self.frame_count += 1;
        while self.events.len() > MAX_EVENT_QUEUE_SIZE {
            if let Some(dropped) = self.events.pop_front() {
                debug!(?dropped, "event queue full");
            }
        }
        Ok(())
    }

    fn bridge(&self) -> &B {
        &self.bridge
    }

    fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.events.drain(..))
    }

    fn frame_count(&self) -> Frame {
        self.frame_count
    }

    fn state(&self) -> SessionState {
        SessionState::Synchronized
    }
}
