//! The per-user conversation state machine.
//!
//! [`TaskFlow`] interprets one inbound event against the stored conversation
//! state, decides the next visible action, and hands completed intakes to the
//! job client on a detached background task so a minutes-long job never
//! blocks event handling. All collaborators sit behind traits; the Telegram
//! glue in `bot/` provides the production implementations.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::dialogue::{
    clamp_clip_duration, JobInputs, MediaClass, TaskKind, TaskStage, TaskState, UserId,
    DEFAULT_CLIP_SECS,
};
use crate::error::SwapError;
use crate::localization::t;
use crate::media::{extension_for, MediaHandle, MediaStore};
use crate::state_store::StateStore;
use crate::swap_api::{CancelProbe, JobClient};

/// Transport-level reference to a previously sent message.
pub type MessageRef = i32;

/// One inbound event, already stripped of transport specifics.
#[derive(Clone, Debug)]
pub enum InboundEvent {
    TaskStart {
        kind: TaskKind,
    },
    MediaReceived {
        class: MediaClass,
        file_ref: String,
        mime_type: Option<String>,
        duration_secs: Option<u32>,
    },
    TextReceived {
        text: String,
    },
    Cancel,
    MembershipRecheck,
}

/// Deliverable produced for a finished task.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputPayload {
    /// Local file pulled into the media store first.
    File(MediaHandle),
    /// Remote url the transport re-hosts itself.
    Url(String),
}

/// How a finished job's output reference is turned into a deliverable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    DownloadFirst,
    RemoteUrl,
}

/// Outbound operations the flow needs from the chat transport.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, user: UserId, text: &str) -> Result<MessageRef>;
    async fn send_media(
        &self,
        user: UserId,
        class: MediaClass,
        payload: &OutputPayload,
        caption: &str,
    ) -> Result<MessageRef>;
    async fn edit_text(&self, user: UserId, message: MessageRef, text: &str) -> Result<()>;
    async fn delete_message(&self, user: UserId, message: MessageRef) -> Result<()>;
    /// Fetch inbound media content addressed by an opaque transport reference.
    async fn download(&self, file_ref: &str) -> Result<Vec<u8>>;
}

/// Gate consulted before a task may start.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn is_member(&self, user: UserId) -> bool;
}

/// Usage-counter collaborator. Called exactly once per successful task.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_usage(&self, user: UserId, kind: TaskKind) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct FlowOptions {
    pub delivery: DeliveryMode,
    /// Invite link appended to the membership prompt, if the deployment has one.
    pub invite_link: Option<String>,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::DownloadFirst,
            invite_link: None,
        }
    }
}

/// Cheap to clone; the background unit holds its own handle.
#[derive(Clone)]
pub struct TaskFlow {
    inner: Arc<FlowInner>,
}

struct FlowInner {
    store: Arc<dyn StateStore>,
    media: Arc<MediaStore>,
    jobs: Arc<dyn JobClient>,
    outbound: Arc<dyn Outbound>,
    usage: Arc<dyn UsageRecorder>,
    gate: Arc<dyn AccessGate>,
    options: FlowOptions,
    /// Serializes event handling per user; the transport may deliver a
    /// user's updates concurrently, but their state transitions must apply
    /// strictly in order. Background units run outside this lock.
    user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

/// The background unit treats a vanished state entry as cancellation.
struct ActiveStateProbe {
    store: Arc<dyn StateStore>,
    user: UserId,
}

#[async_trait]
impl CancelProbe for ActiveStateProbe {
    async fn is_cancelled(&self) -> bool {
        self.store.get(self.user).await.is_none()
    }
}

impl TaskFlow {
    pub fn new(
        store: Arc<dyn StateStore>,
        media: Arc<MediaStore>,
        jobs: Arc<dyn JobClient>,
        outbound: Arc<dyn Outbound>,
        usage: Arc<dyn UsageRecorder>,
        gate: Arc<dyn AccessGate>,
        options: FlowOptions,
    ) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                store,
                media,
                jobs,
                outbound,
                usage,
                gate,
                options,
                user_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Interpret one inbound event against the user's current state. Events
    /// for the same user apply strictly in order; different users run fully
    /// concurrently.
    pub async fn handle_event(&self, user: UserId, event: InboundEvent) -> Result<()> {
        let lock = {
            let mut locks = self.inner.user_locks.lock().await;
            Arc::clone(locks.entry(user).or_default())
        };
        let guard = lock.lock().await;
        let result = self.dispatch_event(user, event).await;
        drop(guard);

        let mut locks = self.inner.user_locks.lock().await;
        if let Some(existing) = locks.get(&user) {
            // Ours plus the map's reference: nobody else is queued on it.
            if Arc::strong_count(existing) == 2 {
                locks.remove(&user);
            }
        }
        result
    }

    async fn dispatch_event(&self, user: UserId, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::TaskStart { kind } => self.handle_task_start(user, kind).await,
            InboundEvent::MediaReceived {
                class,
                file_ref,
                mime_type,
                duration_secs,
            } => {
                self.handle_media(user, class, &file_ref, mime_type.as_deref(), duration_secs)
                    .await
            }
            InboundEvent::TextReceived { text } => self.handle_text(user, &text).await,
            InboundEvent::Cancel => self.handle_cancel(user).await,
            InboundEvent::MembershipRecheck => self.handle_membership_recheck(user).await,
        }
    }

    /// Discard any in-progress conversation without notifying the user.
    pub async fn reset(&self, user: UserId) {
        if let Some(state) = self.inner.store.take(user).await {
            debug!(user_id = user, "discarding stale conversation state");
            self.release_handles(&state);
        }
    }

    async fn handle_task_start(&self, user: UserId, kind: TaskKind) -> Result<()> {
        if !self.inner.gate.is_member(user).await {
            return self.send_membership_prompt(user).await;
        }

        // A new task always supersedes an unfinished one; release its blobs
        // rather than leaking them.
        if let Some(previous) = self.inner.store.take(user).await {
            info!(
                user_id = user,
                kind = previous.kind.as_str(),
                "superseding unfinished task"
            );
            self.release_handles(&previous);
        }

        self.inner.store.set(user, TaskState::new(kind)).await;

        let prompt = match kind {
            TaskKind::VideoSwap => t("send-target-video"),
            TaskKind::PhotoSwap => t("send-target-photo"),
            TaskKind::ImageEnhance => t("send-enhance-image"),
        };
        self.inner.outbound.send_text(user, &prompt).await?;
        Ok(())
    }

    async fn handle_media(
        &self,
        user: UserId,
        class: MediaClass,
        file_ref: &str,
        mime_type: Option<&str>,
        duration_secs: Option<u32>,
    ) -> Result<()> {
        let state = match self.inner.store.get(user).await {
            Some(state) => state,
            None => {
                if !self.inner.gate.is_member(user).await {
                    return self.send_membership_prompt(user).await;
                }
                self.inner
                    .outbound
                    .send_text(user, &t("invalid-state"))
                    .await?;
                return Ok(());
            }
        };

        match state.stage {
            TaskStage::AwaitingTarget => {
                self.intake_target(user, state.kind, class, file_ref, mime_type, duration_secs)
                    .await
            }
            TaskStage::AwaitingSource {
                target,
                duration_secs: clip_secs,
            } => {
                self.intake_source(user, state.kind, target, clip_secs, class, file_ref, mime_type)
                    .await
            }
            TaskStage::Submitted { .. } => {
                debug!(user_id = user, "media ignored while a task is running");
                Ok(())
            }
        }
    }

    async fn intake_target(
        &self,
        user: UserId,
        kind: TaskKind,
        class: MediaClass,
        file_ref: &str,
        mime_type: Option<&str>,
        duration_secs: Option<u32>,
    ) -> Result<()> {
        if class != kind.target_class() {
            self.inner
                .outbound
                .send_text(user, &t("invalid-file-type"))
                .await?;
            return Ok(());
        }

        if kind.needs_source() {
            let ack = self
                .inner
                .outbound
                .send_text(user, &t("file-received"))
                .await?;

            let target = match self.fetch_into_store(user, file_ref, class, mime_type).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(user_id = user, error = %e, "failed to fetch target media");
                    let _ = self
                        .inner
                        .outbound
                        .edit_text(user, ack, &t("error-download"))
                        .await;
                    self.reset(user).await;
                    return Err(e);
                }
            };

            let clip_secs = match kind {
                TaskKind::VideoSwap => Some(clamp_clip_duration(
                    duration_secs.unwrap_or(DEFAULT_CLIP_SECS),
                )),
                _ => None,
            };

            self.inner
                .store
                .set(
                    user,
                    TaskState {
                        kind,
                        stage: TaskStage::AwaitingSource {
                            target,
                            duration_secs: clip_secs,
                        },
                    },
                )
                .await;

            let _ = self.inner.outbound.delete_message(user, ack).await;
            self.inner
                .outbound
                .send_text(user, &t("send-source-face"))
                .await?;
            Ok(())
        } else {
            let target = match self.fetch_into_store(user, file_ref, class, mime_type).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(user_id = user, error = %e, "failed to fetch media");
                    let _ = self
                        .inner
                        .outbound
                        .send_text(user, &t("error-generic"))
                        .await;
                    self.reset(user).await;
                    return Err(e);
                }
            };

            let inputs = JobInputs {
                kind,
                target,
                source: None,
                duration_secs: None,
            };
            self.submit(user, kind, inputs).await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn intake_source(
        &self,
        user: UserId,
        kind: TaskKind,
        target: MediaHandle,
        clip_secs: Option<u32>,
        class: MediaClass,
        file_ref: &str,
        mime_type: Option<&str>,
    ) -> Result<()> {
        if class != MediaClass::Photo {
            self.inner
                .outbound
                .send_text(user, &t("invalid-source-type"))
                .await?;
            return Ok(());
        }

        let source = match self.fetch_into_store(user, file_ref, class, mime_type).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(user_id = user, error = %e, "failed to fetch source media");
                let _ = self
                    .inner
                    .outbound
                    .send_text(user, &t("error-generic"))
                    .await;
                self.reset(user).await;
                return Err(e);
            }
        };

        let inputs = JobInputs {
            kind,
            target,
            source: Some(source),
            duration_secs: clip_secs,
        };
        self.submit(user, kind, inputs).await
    }

    /// Record the fully gathered inputs, acknowledge, and detach the
    /// submit/poll/deliver unit.
    async fn submit(&self, user: UserId, kind: TaskKind, inputs: JobInputs) -> Result<()> {
        let processing_msg = match self.inner.outbound.send_text(user, &t("processing")).await {
            Ok(message) => message,
            Err(e) => {
                // Could not even acknowledge; drop the task rather than run
                // it with no way to report back.
                self.inner.media.remove(&inputs.target);
                if let Some(source) = &inputs.source {
                    self.inner.media.remove(source);
                }
                self.reset(user).await;
                return Err(e);
            }
        };

        self.inner
            .store
            .set(
                user,
                TaskState {
                    kind,
                    stage: TaskStage::Submitted {
                        inputs,
                        processing_msg: Some(processing_msg),
                    },
                },
            )
            .await;

        let flow = self.clone();
        tokio::spawn(async move {
            flow.run_job(user).await;
        });
        Ok(())
    }

    /// The detached background unit: drive the job client, deliver the
    /// output, and release every resource the conversation holds. State is
    /// re-read here so a cancel that landed after the handler returned is
    /// honored.
    async fn run_job(&self, user: UserId) {
        let state = match self.inner.store.get(user).await {
            Some(state) => state,
            None => {
                debug!(user_id = user, "task cancelled before background unit started");
                return;
            }
        };
        let (inputs, processing_msg) = match state.stage {
            TaskStage::Submitted {
                inputs,
                processing_msg,
            } => (inputs, processing_msg),
            _ => {
                warn!(user_id = user, "background unit found conversation mid-intake");
                return;
            }
        };

        let probe = ActiveStateProbe {
            store: Arc::clone(&self.inner.store),
            user,
        };

        let mut local_output: Option<MediaHandle> = None;
        let delivered = match self.inner.jobs.process(&inputs, &probe).await {
            Ok(output_url) => {
                match self
                    .deliver(user, &inputs, &output_url, &mut local_output)
                    .await
                {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        error!(user_id = user, error = %e, "result delivery failed");
                        self.notify_failure(user, processing_msg).await;
                        false
                    }
                }
            }
            Err(SwapError::Cancelled) => {
                info!(user_id = user, "task cancelled while in flight");
                false
            }
            Err(e) => {
                error!(user_id = user, kind = inputs.kind.as_str(), error = %e, "task failed");
                self.notify_failure(user, processing_msg).await;
                false
            }
        };

        if delivered {
            if let Some(message) = processing_msg {
                let _ = self.inner.outbound.delete_message(user, message).await;
            }
            if let Err(e) = self.inner.usage.record_usage(user, inputs.kind).await {
                error!(user_id = user, error = %e, "failed to record usage");
            }
        }

        // Unconditional cleanup: inputs, any locally fetched output, state.
        self.inner.media.remove(&inputs.target);
        if let Some(source) = &inputs.source {
            self.inner.media.remove(source);
        }
        if let Some(output) = &local_output {
            self.inner.media.remove(output);
        }
        self.inner.store.take(user).await;
    }

    /// Returns Ok(false) when the conversation disappeared before delivery;
    /// the accepted race with an explicit cancel.
    async fn deliver(
        &self,
        user: UserId,
        inputs: &JobInputs,
        output_url: &str,
        local_output: &mut Option<MediaHandle>,
    ) -> Result<bool, SwapError> {
        if self.inner.store.get(user).await.is_none() {
            info!(user_id = user, "skipping delivery, conversation is gone");
            return Ok(false);
        }

        let class = inputs.kind.output_class();
        let payload = match self.inner.options.delivery {
            DeliveryMode::DownloadFirst => {
                let fallback_ext = match class {
                    MediaClass::Video => "mp4",
                    MediaClass::Photo => "png",
                };
                let handle = self
                    .inner
                    .media
                    .fetch_remote(user, output_url, fallback_ext)
                    .await
                    .map_err(|e| SwapError::Delivery(e.to_string()))?;
                *local_output = Some(handle.clone());
                OutputPayload::File(handle)
            }
            DeliveryMode::RemoteUrl => OutputPayload::Url(output_url.to_string()),
        };

        let caption = match inputs.kind {
            TaskKind::VideoSwap | TaskKind::PhotoSwap => t("success-swap"),
            TaskKind::ImageEnhance => t("success-enhance"),
        };

        self.inner
            .outbound
            .send_media(user, class, &payload, &caption)
            .await
            .map_err(|e| SwapError::Delivery(e.to_string()))?;
        Ok(true)
    }

    /// Replace the processing acknowledgement with the generic failure text.
    /// Notification failures are swallowed; they must not break cleanup.
    async fn notify_failure(&self, user: UserId, processing_msg: Option<MessageRef>) {
        let text = t("error-generic");
        let notified = match processing_msg {
            Some(message) => self
                .inner
                .outbound
                .edit_text(user, message, &text)
                .await
                .is_ok(),
            None => false,
        };
        if !notified {
            if let Err(e) = self.inner.outbound.send_text(user, &text).await {
                warn!(user_id = user, error = %e, "failed to notify user of task failure");
            }
        }
    }

    async fn handle_text(&self, user: UserId, text: &str) -> Result<()> {
        if self.inner.store.get(user).await.is_some() {
            debug!(user_id = user, text_len = text.len(), "text during active task");
            self.inner
                .outbound
                .send_text(user, &t("text-during-task"))
                .await?;
            return Ok(());
        }
        if !self.inner.gate.is_member(user).await {
            return self.send_membership_prompt(user).await;
        }
        Ok(())
    }

    async fn handle_cancel(&self, user: UserId) -> Result<()> {
        if let Some(state) = self.inner.store.take(user).await {
            info!(user_id = user, kind = state.kind.as_str(), "task cancelled");
            self.release_handles(&state);
        }
        self.inner.outbound.send_text(user, &t("cancel-done")).await?;
        Ok(())
    }

    async fn handle_membership_recheck(&self, user: UserId) -> Result<()> {
        let key = if self.inner.gate.is_member(user).await {
            "membership-verified"
        } else {
            "membership-failed"
        };
        self.inner.outbound.send_text(user, &t(key)).await?;
        Ok(())
    }

    async fn send_membership_prompt(&self, user: UserId) -> Result<()> {
        let mut prompt = t("membership-required");
        if let Some(link) = &self.inner.options.invite_link {
            prompt.push_str("\n\n");
            prompt.push_str(link);
        }
        self.inner.outbound.send_text(user, &prompt).await?;
        Ok(())
    }

    async fn fetch_into_store(
        &self,
        user: UserId,
        file_ref: &str,
        class: MediaClass,
        mime_type: Option<&str>,
    ) -> Result<MediaHandle> {
        let bytes = self.inner.outbound.download(file_ref).await?;
        let extension = extension_for(class, mime_type);
        self.inner.media.store(user, &extension, &bytes).await
    }

    fn release_handles(&self, state: &TaskState) {
        for handle in state.held_handles() {
            self.inner.media.remove(handle);
        }
    }
}
