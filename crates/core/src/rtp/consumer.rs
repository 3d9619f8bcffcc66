//! Consumer (outbound RTP mirror, spec §3, §4.11).

use crate::rtp::parameters::RtpParameters;
use crate::rtp::producer::ProducerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Active,
    Paused,
}

pub struct Consumer {
    pub id: String,
    pub producer_id: String,
    pub rtp_parameters: RtpParameters,
    pub mid: String,
    pub state: ConsumerState,
    pub closed: bool,
    pub kind: ProducerKind,
}

impl Consumer {
    pub fn new(id: impl Into<String>, producer_id: impl Into<String>, mid: impl Into<String>, rtp_parameters: RtpParameters, kind: ProducerKind) -> Self {
        Self {
            id: id.into(),
            producer_id: producer_id.into(),
            rtp_parameters,
            mid: mid.into(),
            state: ConsumerState::Active,
            closed: false,
            kind,
        }
    }

    pub fn pause(&mut self) {
        self.state = ConsumerState::Paused;
    }

    pub fn resume(&mut self) {
        self.state = ConsumerState::Active;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// Synthesizes the probator `MediaStreamConfig`/mid for the first video
/// consumer on a connection (spec §4.11 "Probation consumer").
pub const PROBATOR_MID: &str = "probator";
pub const PROBATOR_PAYLOAD_TYPE: u8 = 127;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_resume_toggles_state() {
        let mut c = Consumer::new("c1", "p1", "0", RtpParameters::default(), ProducerKind::Simple);
        assert_eq!(c.state, ConsumerState::Active);
        c.pause();
        assert_eq!(c.state, ConsumerState::Paused);
        c.resume();
        assert_eq!(c.state, ConsumerState::Active);
    }
}
