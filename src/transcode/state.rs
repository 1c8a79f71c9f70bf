//! Transcode state machine

/// Where a transcode is in its single, linear run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscodeState {
    /// Created, not started
    Idle,

    /// Loading source metadata and validating the crop
    Probing,

    /// Reading, cropping and writing every video frame
    DrainingVideo,

    /// Passing every audio sample through
    DrainingAudio,

    /// Closing the destination container
    Finalizing,

    /// Destination written
    Done,

    /// Stopped with an error or by cancellation
    Failed,
}

impl TranscodeState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &TranscodeState) -> bool {
        use TranscodeState::*;

        match (self, target) {
            (Idle, Probing) => true,
            // Invalid configuration fails before probing starts
            (Idle, Failed) => true,

            (Probing, DrainingVideo) => true,
            (Probing, Failed) => true,

            (DrainingVideo, DrainingAudio) => true,
            // No audio track, or reading failed
            (DrainingVideo, Finalizing) => true,
            (DrainingVideo, Failed) => true,

            (DrainingAudio, Finalizing) => true,
            (DrainingAudio, Failed) => true,

            (Finalizing, Done) => true,
            (Finalizing, Failed) => true,

            // Terminal
            (Done, _) | (Failed, _) => false,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            TranscodeState::Idle => "Idle",
            TranscodeState::Probing => "Probing",
            TranscodeState::DrainingVideo => "Draining video",
            TranscodeState::DrainingAudio => "Draining audio",
            TranscodeState::Finalizing => "Finalizing",
            TranscodeState::Done => "Done",
            TranscodeState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TranscodeState::Done | TranscodeState::Failed)
    }

    /// Whether samples are currently flowing
    pub fn is_draining(&self) -> bool {
        matches!(
            self,
            TranscodeState::DrainingVideo | TranscodeState::DrainingAudio
        )
    }
}

impl Default for TranscodeState {
    fn default() -> Self {
        TranscodeState::Idle
    }
}

impl std::fmt::Display for TranscodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
