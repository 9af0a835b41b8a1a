//! Conversation state for the face swap task dialogue.
//!
//! Each user has at most one active [`TaskState`]. The stage enum carries the
//! inputs collected so far, so a filled slot can neither be overwritten nor
//! missing once the task reaches submission.

use serde::{Deserialize, Serialize};

use crate::media::MediaHandle;

/// Telegram user id, also the conversation key.
pub type UserId = i64;

/// The longest clip the remote service will process, in seconds.
pub const MAX_CLIP_SECS: u32 = 60;

/// Clip length submitted when the inbound video carried no duration.
pub const DEFAULT_CLIP_SECS: u32 = 7;

/// The closed set of operations the bot supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    VideoSwap,
    PhotoSwap,
    ImageEnhance,
}

impl TaskKind {
    /// Media class expected for the first (target) input.
    pub fn target_class(&self) -> MediaClass {
        match self {
            TaskKind::VideoSwap => MediaClass::Video,
            TaskKind::PhotoSwap | TaskKind::ImageEnhance => MediaClass::Photo,
        }
    }

    /// Whether this kind needs a second (source face) input.
    pub fn needs_source(&self) -> bool {
        match self {
            TaskKind::VideoSwap | TaskKind::PhotoSwap => true,
            TaskKind::ImageEnhance => false,
        }
    }

    /// Media class of the finished output.
    pub fn output_class(&self) -> MediaClass {
        match self {
            TaskKind::VideoSwap => MediaClass::Video,
            TaskKind::PhotoSwap | TaskKind::ImageEnhance => MediaClass::Photo,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::VideoSwap => "video_swap",
            TaskKind::PhotoSwap => "photo_swap",
            TaskKind::ImageEnhance => "image_enhance",
        }
    }
}

/// Classification of an inbound or outbound piece of media.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaClass {
    Photo,
    Video,
}

/// Everything the job client needs to run one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobInputs {
    pub kind: TaskKind,
    pub target: MediaHandle,
    pub source: Option<MediaHandle>,
    pub duration_secs: Option<u32>,
}

/// Position within the task's input-gathering/execution sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TaskStage {
    /// Waiting for the target video/photo.
    AwaitingTarget,
    /// Target captured; waiting for the source face photo.
    AwaitingSource {
        target: MediaHandle,
        duration_secs: Option<u32>,
    },
    /// All inputs captured; a background unit owns the task from here.
    Submitted {
        inputs: JobInputs,
        processing_msg: Option<i32>,
    },
}

/// Per-user conversation state. One instance per user, ephemeral, removed on
/// completion, cancel, fatal error or TTL expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub kind: TaskKind,
    pub stage: TaskStage,
}

impl TaskState {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            stage: TaskStage::AwaitingTarget,
        }
    }

    /// Blob handles currently owned by this conversation instance.
    pub fn held_handles(&self) -> Vec<&MediaHandle> {
        match &self.stage {
            TaskStage::AwaitingTarget => Vec::new(),
            TaskStage::AwaitingSource { target, .. } => vec![target],
            TaskStage::Submitted { inputs, .. } => {
                let mut handles = vec![&inputs.target];
                if let Some(source) = &inputs.source {
                    handles.push(source);
                }
                handles
            }
        }
    }
}

/// Clamp a video clip duration to the service maximum.
pub fn clamp_clip_duration(secs: u32) -> u32 {
    secs.min(MAX_CLIP_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn clip_duration_is_clamped() {
        assert_eq!(clamp_clip_duration(12), 12);
        assert_eq!(clamp_clip_duration(60), 60);
        assert_eq!(clamp_clip_duration(3600), 60);
    }

    #[test]
    fn kind_input_shapes() {
        assert_eq!(TaskKind::VideoSwap.target_class(), MediaClass::Video);
        assert_eq!(TaskKind::PhotoSwap.target_class(), MediaClass::Photo);
        assert_eq!(TaskKind::ImageEnhance.target_class(), MediaClass::Photo);

        assert!(TaskKind::VideoSwap.needs_source());
        assert!(TaskKind::PhotoSwap.needs_source());
        assert!(!TaskKind::ImageEnhance.needs_source());
    }

    #[test]
    fn held_handles_follow_stage() {
        let state = TaskState::new(TaskKind::PhotoSwap);
        assert!(state.held_handles().is_empty());

        let target = MediaHandle::from(PathBuf::from("/tmp/t.png"));
        let state = TaskState {
            kind: TaskKind::PhotoSwap,
            stage: TaskStage::AwaitingSource {
                target: target.clone(),
                duration_secs: None,
            },
        };
        assert_eq!(state.held_handles(), vec![&target]);

        let source = MediaHandle::from(PathBuf::from("/tmp/s.png"));
        let state = TaskState {
            kind: TaskKind::PhotoSwap,
            stage: TaskStage::Submitted {
                inputs: JobInputs {
                    kind: TaskKind::PhotoSwap,
                    target: target.clone(),
                    source: Some(source.clone()),
                    duration_secs: None,
                },
                processing_msg: Some(42),
            },
        };
        assert_eq!(state.held_handles(), vec![&target, &source]);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let state = TaskState {
            kind: TaskKind::VideoSwap,
            stage: TaskStage::AwaitingSource {
                target: MediaHandle::from(PathBuf::from("/tmp/clip.mp4")),
                duration_secs: Some(31),
            },
        };

        let json = serde_json::to_string(&state).expect("serialize");
        let back: TaskState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }
}
