//! End-to-end tests of the conversation state machine against mock
//! collaborators: a recording transport, a scripted job client, and an
//! in-memory usage sink.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use faceswap_bot::dialogue::{JobInputs, MediaClass, TaskKind, TaskStage, UserId};
use faceswap_bot::error::SwapError;
use faceswap_bot::flow::{
    AccessGate, DeliveryMode, FlowOptions, InboundEvent, MessageRef, Outbound, OutputPayload,
    TaskFlow, UsageRecorder,
};
use faceswap_bot::media::MediaStore;
use faceswap_bot::state_store::{InMemoryStateStore, StateStore};
use faceswap_bot::swap_api::{CancelProbe, JobClient};

const USER: UserId = 7;

#[derive(Clone, Debug, PartialEq)]
enum OutCall {
    Text(UserId, String),
    Media(UserId, MediaClass, OutputPayload, String),
    Edit(UserId, MessageRef, String),
    Delete(UserId, MessageRef),
}

#[derive(Default)]
struct RecordingOutbound {
    calls: Mutex<Vec<OutCall>>,
    next_id: AtomicI32,
    fail_media: AtomicBool,
}

impl RecordingOutbound {
    async fn calls(&self) -> Vec<OutCall> {
        self.calls.lock().await.clone()
    }

    async fn media_calls(&self) -> Vec<OutCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, OutCall::Media(..)))
            .collect()
    }

    async fn edit_count(&self) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| matches!(c, OutCall::Edit(..)))
            .count()
    }

    async fn text_count(&self) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| matches!(c, OutCall::Text(..)))
            .count()
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send_text(&self, user: UserId, text: &str) -> Result<MessageRef> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .lock()
            .await
            .push(OutCall::Text(user, text.to_string()));
        Ok(id)
    }

    async fn send_media(
        &self,
        user: UserId,
        class: MediaClass,
        payload: &OutputPayload,
        caption: &str,
    ) -> Result<MessageRef> {
        if self.fail_media.load(Ordering::SeqCst) {
            anyhow::bail!("transport rejected the media");
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().await.push(OutCall::Media(
            user,
            class,
            payload.clone(),
            caption.to_string(),
        ));
        Ok(id)
    }

    async fn edit_text(&self, user: UserId, message: MessageRef, text: &str) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(OutCall::Edit(user, message, text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, user: UserId, message: MessageRef) -> Result<()> {
        self.calls.lock().await.push(OutCall::Delete(user, message));
        Ok(())
    }

    async fn download(&self, _file_ref: &str) -> Result<Vec<u8>> {
        Ok(b"inbound-media-bytes".to_vec())
    }
}

struct MockJobs {
    result: Result<String, SwapError>,
    calls: AtomicU32,
    inputs_seen: Mutex<Vec<JobInputs>>,
}

impl MockJobs {
    fn new(result: Result<String, SwapError>) -> Self {
        Self {
            result,
            calls: AtomicU32::new(0),
            inputs_seen: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobClient for MockJobs {
    async fn process(
        &self,
        inputs: &JobInputs,
        _cancel: &dyn CancelProbe,
    ) -> Result<String, SwapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs_seen.lock().await.push(inputs.clone());
        self.result.clone()
    }
}

struct MockGate {
    member: AtomicBool,
}

#[async_trait]
impl AccessGate for MockGate {
    async fn is_member(&self, _user: UserId) -> bool {
        self.member.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockUsage {
    records: Mutex<Vec<(UserId, TaskKind)>>,
}

#[async_trait]
impl UsageRecorder for MockUsage {
    async fn record_usage(&self, user: UserId, kind: TaskKind) -> Result<()> {
        self.records.lock().await.push((user, kind));
        Ok(())
    }
}

struct Harness {
    flow: TaskFlow,
    outbound: Arc<RecordingOutbound>,
    jobs: Arc<MockJobs>,
    usage: Arc<MockUsage>,
    store: Arc<InMemoryStateStore>,
    media_dir: tempfile::TempDir,
}

impl Harness {
    fn new(job_result: Result<String, SwapError>) -> Self {
        Self::with_member(job_result, true)
    }

    fn with_member(job_result: Result<String, SwapError>, member: bool) -> Self {
        let media_dir = tempfile::tempdir().expect("tempdir");
        let media = Arc::new(MediaStore::new(media_dir.path()).expect("media store"));
        let store = Arc::new(InMemoryStateStore::new(Duration::from_secs(3600)));
        let outbound = Arc::new(RecordingOutbound::default());
        let jobs = Arc::new(MockJobs::new(job_result));
        let usage = Arc::new(MockUsage::default());
        let gate = Arc::new(MockGate {
            member: AtomicBool::new(member),
        });

        let flow = TaskFlow::new(
            store.clone(),
            media,
            jobs.clone(),
            outbound.clone(),
            usage.clone(),
            gate,
            FlowOptions {
                delivery: DeliveryMode::RemoteUrl,
                invite_link: None,
            },
        );

        Self {
            flow,
            outbound,
            jobs,
            usage,
            store,
            media_dir,
        }
    }

    fn blob_count(&self) -> usize {
        std::fs::read_dir(self.media_dir.path())
            .expect("read media dir")
            .count()
    }

    /// The background unit's last action is clearing the state entry.
    async fn wait_for_task_end(&self) {
        for _ in 0..400 {
            if self.store.get(USER).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("background task did not finish in time");
    }

    async fn usage_records(&self) -> Vec<(UserId, TaskKind)> {
        self.usage.records.lock().await.clone()
    }
}

fn video_event(duration_secs: u32) -> InboundEvent {
    InboundEvent::MediaReceived {
        class: MediaClass::Video,
        file_ref: "file-video".to_string(),
        mime_type: Some("video/mp4".to_string()),
        duration_secs: Some(duration_secs),
    }
}

fn photo_event() -> InboundEvent {
    InboundEvent::MediaReceived {
        class: MediaClass::Photo,
        file_ref: "file-photo".to_string(),
        mime_type: Some("image/png".to_string()),
        duration_secs: None,
    }
}

#[tokio::test]
async fn video_swap_success_delivers_output_and_records_usage_once() {
    let harness = Harness::new(Ok("https://cdn.example/R.mp4".to_string()));

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::VideoSwap })
        .await
        .expect("task start");
    harness
        .flow
        .handle_event(USER, video_event(95))
        .await
        .expect("target video");
    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("source photo");

    harness.wait_for_task_end().await;

    let media = harness.outbound.media_calls().await;
    assert_eq!(media.len(), 1, "exactly one delivery per attempt");
    match &media[0] {
        OutCall::Media(user, class, payload, _) => {
            assert_eq!(*user, USER);
            assert_eq!(*class, MediaClass::Video);
            assert_eq!(
                *payload,
                OutputPayload::Url("https://cdn.example/R.mp4".to_string())
            );
        }
        other => panic!("unexpected call {other:?}"),
    }

    assert_eq!(harness.jobs.call_count(), 1);
    assert_eq!(
        harness.usage_records().await,
        vec![(USER, TaskKind::VideoSwap)]
    );
    assert_eq!(harness.blob_count(), 0, "input blobs released");
    assert!(harness.store.get(USER).await.is_none(), "state cleared");

    // The intake clamps the clip length before submission.
    let inputs = harness.jobs.inputs_seen.lock().await;
    assert_eq!(inputs[0].duration_secs, Some(60));
    assert!(inputs[0].source.is_some());
}

#[tokio::test]
async fn failed_job_notifies_once_and_never_records_usage() {
    let harness = Harness::new(Err(SwapError::JobFailed {
        status: "failed".to_string(),
    }));

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::PhotoSwap })
        .await
        .expect("task start");
    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("target photo");
    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("source photo");

    harness.wait_for_task_end().await;

    assert!(harness.outbound.media_calls().await.is_empty(), "no delivery");
    assert_eq!(
        harness.outbound.edit_count().await,
        1,
        "processing message replaced by the failure notice"
    );
    assert!(harness.usage_records().await.is_empty());
    assert_eq!(harness.blob_count(), 0, "both input handles released");
    assert!(harness.store.get(USER).await.is_none());
}

#[tokio::test]
async fn every_fatal_error_kind_leaves_usage_untouched() {
    let errors = vec![
        SwapError::SignedUrl {
            extension: "png".to_string(),
            reason: "remote said no".to_string(),
        },
        SwapError::Upload("connection reset".to_string()),
        SwapError::Submission("rejected".to_string()),
        SwapError::JobFailed {
            status: "error".to_string(),
        },
        SwapError::PollTimeout { attempts: 60 },
    ];

    for error in errors {
        let harness = Harness::new(Err(error.clone()));

        harness
            .flow
            .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::ImageEnhance })
            .await
            .expect("task start");
        harness
            .flow
            .handle_event(USER, photo_event())
            .await
            .expect("image");

        harness.wait_for_task_end().await;

        assert!(
            harness.usage_records().await.is_empty(),
            "usage must stay zero for {error:?}"
        );
        assert!(harness.outbound.media_calls().await.is_empty());
        assert_eq!(
            harness.outbound.edit_count().await,
            1,
            "one failure notice for {error:?}"
        );
        assert_eq!(harness.blob_count(), 0);
    }
}

#[tokio::test]
async fn delivery_failure_after_successful_job_counts_as_failure() {
    let harness = Harness::new(Ok("https://cdn.example/R.png".to_string()));
    harness.outbound.fail_media.store(true, Ordering::SeqCst);

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::ImageEnhance })
        .await
        .expect("task start");
    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("image");

    harness.wait_for_task_end().await;

    assert!(harness.usage_records().await.is_empty());
    assert_eq!(harness.outbound.edit_count().await, 1);
    assert_eq!(harness.blob_count(), 0);
}

#[tokio::test]
async fn incomplete_conversation_never_reaches_the_job_client() {
    let harness = Harness::new(Ok("unused".to_string()));

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::VideoSwap })
        .await
        .expect("task start");
    harness
        .flow
        .handle_event(USER, video_event(10))
        .await
        .expect("target video");

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.jobs.call_count(), 0);
    let state = harness.store.get(USER).await.expect("state kept");
    assert!(matches!(state.stage, TaskStage::AwaitingSource { .. }));
}

#[tokio::test]
async fn wrong_media_class_is_rejected_without_state_change() {
    let harness = Harness::new(Ok("unused".to_string()));

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::VideoSwap })
        .await
        .expect("task start");
    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("mismatched media");

    let state = harness.store.get(USER).await.expect("state kept");
    assert!(matches!(state.stage, TaskStage::AwaitingTarget));
    assert_eq!(harness.jobs.call_count(), 0);
    assert_eq!(harness.blob_count(), 0, "rejected media is never stored");
}

#[tokio::test]
async fn media_without_state_prompts_to_start() {
    let harness = Harness::new(Ok("unused".to_string()));

    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("stray photo");

    assert!(harness.store.get(USER).await.is_none(), "no state created");
    assert_eq!(harness.outbound.text_count().await, 1);
    assert_eq!(harness.jobs.call_count(), 0);
}

#[tokio::test]
async fn media_without_state_prompts_membership_for_non_members() {
    let harness = Harness::with_member(Ok("unused".to_string()), false);

    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("stray photo");

    assert!(harness.store.get(USER).await.is_none());
    assert_eq!(harness.outbound.text_count().await, 1);
}

#[tokio::test]
async fn non_member_cannot_start_a_task() {
    let harness = Harness::with_member(Ok("unused".to_string()), false);

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::PhotoSwap })
        .await
        .expect("gated start");

    assert!(harness.store.get(USER).await.is_none(), "gate blocks state creation");
    assert_eq!(harness.outbound.text_count().await, 1);
}

#[tokio::test]
async fn cancel_mid_source_releases_primary_and_skips_the_job() {
    let harness = Harness::new(Ok("unused".to_string()));

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::PhotoSwap })
        .await
        .expect("task start");
    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("target photo");
    assert_eq!(harness.blob_count(), 1, "primary input held");

    harness
        .flow
        .handle_event(USER, InboundEvent::Cancel)
        .await
        .expect("cancel");

    assert_eq!(harness.blob_count(), 0, "primary input released");
    assert!(harness.store.get(USER).await.is_none());
    assert_eq!(harness.jobs.call_count(), 0);

    // A second cancel is harmless.
    harness
        .flow
        .handle_event(USER, InboundEvent::Cancel)
        .await
        .expect("repeat cancel");
}

#[tokio::test]
async fn new_task_start_supersedes_and_cleans_up_the_previous_one() {
    let harness = Harness::new(Ok("unused".to_string()));

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::PhotoSwap })
        .await
        .expect("first start");
    harness
        .flow
        .handle_event(USER, photo_event())
        .await
        .expect("target photo");
    assert_eq!(harness.blob_count(), 1);

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::VideoSwap })
        .await
        .expect("second start");

    let state = harness.store.get(USER).await.expect("one state");
    assert_eq!(state.kind, TaskKind::VideoSwap);
    assert!(matches!(state.stage, TaskStage::AwaitingTarget));
    assert_eq!(harness.blob_count(), 0, "superseded task's blobs released");
    assert_eq!(harness.jobs.call_count(), 0);
}

#[tokio::test]
async fn text_during_active_task_gets_a_reminder() {
    let harness = Harness::new(Ok("unused".to_string()));

    harness
        .flow
        .handle_event(USER, InboundEvent::TaskStart { kind: TaskKind::PhotoSwap })
        .await
        .expect("task start");
    let before = harness.outbound.text_count().await;

    harness
        .flow
        .handle_event(
            USER,
            InboundEvent::TextReceived {
                text: "hello?".to_string(),
            },
        )
        .await
        .expect("text");

    assert_eq!(harness.outbound.text_count().await, before + 1);
    assert!(harness.store.get(USER).await.is_some(), "state untouched");
}

#[tokio::test]
async fn membership_recheck_reports_status() {
    let harness = Harness::new(Ok("unused".to_string()));

    harness
        .flow
        .handle_event(USER, InboundEvent::MembershipRecheck)
        .await
        .expect("recheck");

    assert_eq!(harness.outbound.text_count().await, 1);
}
