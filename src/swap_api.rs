//! Client for the remote face swap service.
//!
//! The service is asynchronous: every task uploads its inputs to signed OSS
//! urls, submits a job, then polls a status endpoint until the job reaches a
//! terminal state. One [`SwapClient`] serves any number of concurrent tasks;
//! each call is parameterized entirely by its arguments.

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dialogue::{JobInputs, TaskKind, DEFAULT_CLIP_SECS};
use crate::error::SwapError;

/// Success sentinel shared by every endpoint of the service.
pub const SUCCESS_CODE: i64 = 100_000;

const ORIGIN: &str = "https://arting.ai";
const REFERER: &str = "https://arting.ai/";

/// The source face is always uploaded as PNG, whatever Telegram handed us.
const SOURCE_FACE_EXT: &str = "png";
const SOURCE_FACE_CONTENT_TYPE: &str = "image/png";

/// Budget for one poll loop.
#[derive(Clone, Debug)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Delay before the first probe. The photo result endpoint 404s if probed
    /// immediately after submission, so its policy waits one interval first.
    pub initial_delay: Option<Duration>,
    /// Upper bound for the random extra delay added to each interval.
    pub max_jitter_ms: u64,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            initial_delay: None,
            max_jitter_ms: 250,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }
}

/// Result of one status probe.
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// Terminal success, output in hand.
    Ready(T),
    /// Not terminal yet (still running, or a transient transport error).
    Pending,
    /// Terminal failure; polling stops immediately.
    Fatal(SwapError),
}

/// Hook consulted at the top of every poll cycle so a cancelled conversation
/// stops burning its poll budget.
#[async_trait]
pub trait CancelProbe: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Probe for callers with no cancellation source.
pub struct NeverCancelled;

#[async_trait]
impl CancelProbe for NeverCancelled {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Drive `probe` until it yields a terminal outcome or the policy's attempt
/// budget runs out. Transient errors count toward the budget but never
/// terminate the loop on their own.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    cancel: &dyn CancelProbe,
    mut probe: F,
) -> Result<T, SwapError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome<T>>,
{
    if let Some(delay) = policy.initial_delay {
        tokio::time::sleep(delay).await;
    }

    let mut attempts = 0;
    while attempts < policy.max_attempts {
        if cancel.is_cancelled().await {
            return Err(SwapError::Cancelled);
        }
        attempts += 1;
        debug!(attempt = attempts, "polling job status");

        match probe().await {
            PollOutcome::Ready(output) => return Ok(output),
            PollOutcome::Fatal(error) => return Err(error),
            PollOutcome::Pending => {}
        }

        if attempts < policy.max_attempts {
            tokio::time::sleep(policy.interval + jitter(policy.max_jitter_ms)).await;
        }
    }

    Err(SwapError::PollTimeout { attempts })
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Abstraction over the remote job pipeline so the conversation flow can be
/// driven by mocks in tests.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Run one task end to end and return the output reference (a url).
    async fn process(
        &self,
        inputs: &JobInputs,
        cancel: &dyn CancelProbe,
    ) -> Result<String, SwapError>;
}

#[derive(Clone, Debug)]
pub struct SwapApiConfig {
    pub base_url: String,
    /// Applied before video submission; the upload acknowledgement path on
    /// the remote side is eventually consistent.
    pub pre_submit_delay: Duration,
    pub video_poll: PollPolicy,
    pub photo_poll: PollPolicy,
    pub enhance_poll: PollPolicy,
}

impl Default for SwapApiConfig {
    fn default() -> Self {
        let interval = Duration::from_secs(5);
        Self {
            base_url: "https://api.arting.ai".to_string(),
            pre_submit_delay: Duration::from_millis(100),
            video_poll: PollPolicy::new(interval, 120),
            photo_poll: PollPolicy::new(interval, 60).with_initial_delay(interval),
            enhance_poll: PollPolicy::new(interval, 60).with_initial_delay(interval),
        }
    }
}

// --- Wire types ---

#[derive(Serialize)]
struct SignedUrlRequest {
    f_suffixs: Vec<String>,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Clone, Deserialize)]
pub struct SignedUrlPair {
    /// Pre-authorized upload destination.
    pub put: String,
    /// Readable reference handed to the submission endpoint.
    pub get: String,
}

#[derive(Deserialize)]
struct SignedUrlData {
    oss_signed_urls: Vec<SignedUrlPair>,
}

#[derive(Serialize)]
struct VideoSubmitRequest {
    task_type: u8,
    file_type: &'static str,
    target_medio_url: String,
    target_source_face_url: String,
    duration: u32,
    start_clip_sec: u32,
    end_clip_sec: u32,
    face_enhance: bool,
}

#[derive(Deserialize)]
struct VideoSubmitData {
    prediction_id: String,
}

#[derive(Serialize)]
struct PhotoSubmitRequest {
    target_image_file: String,
    target_face_file: String,
}

#[derive(Deserialize)]
struct RequestIdData {
    request_id: String,
}

#[derive(Serialize)]
struct EnhanceSubmitRequest {
    image_url: String,
}

#[derive(Deserialize)]
struct StatusData {
    status: Option<String>,
    output: Option<String>,
    result_img_url: Option<String>,
}

fn classify_status(
    envelope: ApiEnvelope<StatusData>,
    pick: impl FnOnce(&StatusData) -> Option<String>,
) -> PollOutcome<String> {
    if envelope.code != SUCCESS_CODE {
        return PollOutcome::Pending;
    }
    let data = match envelope.data {
        Some(data) => data,
        None => return PollOutcome::Pending,
    };
    match data.status.as_deref() {
        Some("success") => match pick(&data) {
            Some(output) => PollOutcome::Ready(output),
            None => PollOutcome::Pending,
        },
        Some(status @ ("failed" | "error")) => PollOutcome::Fatal(SwapError::JobFailed {
            status: status.to_string(),
        }),
        _ => PollOutcome::Pending,
    }
}

// --- Client ---

pub struct SwapClient {
    http: reqwest::Client,
    config: SwapApiConfig,
}

impl SwapClient {
    pub fn new(config: SwapApiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Request a signed `{put, get}` url pair for one upload.
    async fn get_signed_urls(&self, extension: &str) -> Result<SignedUrlPair, SwapError> {
        let signed_url_error = |reason: String| SwapError::SignedUrl {
            extension: extension.to_string(),
            reason,
        };

        let url = format!("{}/api/cg/get_oss_signed_urls", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .header("Origin", ORIGIN)
            .header("Referer", REFERER)
            .json(&SignedUrlRequest {
                f_suffixs: vec![extension.to_string()],
            })
            .send()
            .await
            .map_err(|e| signed_url_error(e.to_string()))?;

        let envelope: ApiEnvelope<SignedUrlData> = response
            .json()
            .await
            .map_err(|e| signed_url_error(e.to_string()))?;

        if envelope.code != SUCCESS_CODE {
            return Err(signed_url_error(
                envelope.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        envelope
            .data
            .and_then(|data| data.oss_signed_urls.into_iter().next())
            .ok_or_else(|| signed_url_error("response missing signed urls".to_string()))
    }

    /// Stream one blob to its signed upload destination.
    async fn upload(
        &self,
        put_url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), SwapError> {
        let length = bytes.len() as u64;
        let response = self
            .http
            .put(put_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(bytes)
            .send()
            .await
            .map_err(|e| SwapError::Upload(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SwapError::Upload(format!(
                "upload returned {}",
                response.status()
            )));
        }
        debug!(bytes = length, "upload complete");
        Ok(())
    }

    async fn post_submit<Req, Data>(
        &self,
        url: &str,
        payload: &Req,
        auth_token: &str,
    ) -> Result<ApiEnvelope<Data>, SwapError>
    where
        Req: Serialize + Sync,
        Data: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .header("authorization", auth_token)
            .header("Origin", ORIGIN)
            .header("Referer", REFERER)
            .json(payload)
            .send()
            .await
            .map_err(|e| SwapError::Submission(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| SwapError::Submission(e.to_string()))
    }

    fn extract_job_id<Data>(
        envelope: ApiEnvelope<Data>,
        pick: impl FnOnce(Data) -> String,
    ) -> Result<String, SwapError> {
        if envelope.code != SUCCESS_CODE {
            return Err(SwapError::Submission(
                envelope.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        envelope
            .data
            .map(pick)
            .ok_or_else(|| SwapError::Submission("response missing job id".to_string()))
    }

    async fn submit_video(
        &self,
        video_url: &str,
        face_url: &str,
        duration: u32,
        auth_token: &str,
    ) -> Result<String, SwapError> {
        let url = format!("{}/api/fs/gifvideo/mutilface", self.config.base_url);
        let payload = VideoSubmitRequest {
            task_type: 2,
            file_type: "video",
            target_medio_url: video_url.to_string(),
            target_source_face_url: face_url.to_string(),
            duration,
            start_clip_sec: 0,
            end_clip_sec: duration,
            face_enhance: true,
        };
        let envelope: ApiEnvelope<VideoSubmitData> =
            self.post_submit(&url, &payload, auth_token).await?;
        Self::extract_job_id(envelope, |data| data.prediction_id)
    }

    async fn submit_photo(
        &self,
        base_image_url: &str,
        face_url: &str,
        auth_token: &str,
    ) -> Result<String, SwapError> {
        let url = format!("{}/api/fs/singleface", self.config.base_url);
        let payload = PhotoSubmitRequest {
            target_image_file: base_image_url.to_string(),
            target_face_file: face_url.to_string(),
        };
        let envelope: ApiEnvelope<RequestIdData> =
            self.post_submit(&url, &payload, auth_token).await?;
        Self::extract_job_id(envelope, |data| data.request_id)
    }

    async fn submit_enhance(
        &self,
        image_url: &str,
        auth_token: &str,
    ) -> Result<String, SwapError> {
        let url = format!("{}/api/ie/image/enhance", self.config.base_url);
        let payload = EnhanceSubmitRequest {
            image_url: image_url.to_string(),
        };
        let envelope: ApiEnvelope<RequestIdData> =
            self.post_submit(&url, &payload, auth_token).await?;
        Self::extract_job_id(envelope, |data| data.request_id)
    }

    async fn video_status(&self, prediction_id: &str, auth_token: &str) -> PollOutcome<String> {
        let url = format!("{}/api/mfs/gifvideo/task/status", self.config.base_url);
        let form = reqwest::multipart::Form::new()
            .text("prediction_id", prediction_id.to_string())
            .text("task_type", "2")
            .text("rank", "");

        let response = match self
            .http
            .post(&url)
            .header("authorization", auth_token)
            .header("Origin", ORIGIN)
            .header("Referer", REFERER)
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "video status request failed");
                return PollOutcome::Pending;
            }
        };

        match response.json::<ApiEnvelope<StatusData>>().await {
            Ok(envelope) => classify_status(envelope, |data| data.output.clone()),
            Err(e) => {
                warn!(error = %e, "video status response unreadable");
                PollOutcome::Pending
            }
        }
    }

    async fn result_status(
        &self,
        endpoint: &str,
        request_id: &str,
        auth_token: &str,
        pick: impl FnOnce(&StatusData) -> Option<String>,
    ) -> PollOutcome<String> {
        let url = format!(
            "{}{}?request_id={}",
            self.config.base_url, endpoint, request_id
        );
        let response = match self
            .http
            .get(&url)
            .header("authorization", auth_token)
            .header("Origin", ORIGIN)
            .header("Referer", REFERER)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "status request failed");
                return PollOutcome::Pending;
            }
        };

        match response.json::<ApiEnvelope<StatusData>>().await {
            Ok(envelope) => classify_status(envelope, pick),
            Err(e) => {
                warn!(error = %e, "status response unreadable");
                PollOutcome::Pending
            }
        }
    }
}

#[async_trait]
impl JobClient for SwapClient {
    async fn process(
        &self,
        inputs: &JobInputs,
        cancel: &dyn CancelProbe,
    ) -> Result<String, SwapError> {
        // The service accepts any client-generated token; one per task keeps
        // log correlation simple.
        let auth_token = Uuid::new_v4().to_string();
        info!(kind = inputs.kind.as_str(), "starting remote task");

        let (target_ext, target_content_type) = target_upload_meta(inputs);
        let target_bytes = read_blob(inputs.target.path()).await?;
        let target_urls = self.get_signed_urls(&target_ext).await?;

        let output = match inputs.kind {
            TaskKind::VideoSwap | TaskKind::PhotoSwap => {
                let source = inputs.source.as_ref().ok_or_else(|| {
                    SwapError::Submission("paired task submitted without source input".to_string())
                })?;
                let source_bytes = read_blob(source.path()).await?;
                let source_urls = self.get_signed_urls(SOURCE_FACE_EXT).await?;

                tokio::try_join!(
                    self.upload(&target_urls.put, target_bytes, &target_content_type),
                    self.upload(&source_urls.put, source_bytes, SOURCE_FACE_CONTENT_TYPE),
                )?;

                if inputs.kind == TaskKind::VideoSwap {
                    let duration = inputs.duration_secs.unwrap_or(DEFAULT_CLIP_SECS);
                    tokio::time::sleep(self.config.pre_submit_delay).await;
                    let prediction_id = self
                        .submit_video(&target_urls.get, &source_urls.get, duration, &auth_token)
                        .await?;
                    info!(job_id = %prediction_id, "video task submitted");
                    poll_until(&self.config.video_poll, cancel, || {
                        self.video_status(&prediction_id, &auth_token)
                    })
                    .await?
                } else {
                    let request_id = self
                        .submit_photo(&target_urls.get, &source_urls.get, &auth_token)
                        .await?;
                    info!(job_id = %request_id, "photo task submitted");
                    poll_until(&self.config.photo_poll, cancel, || {
                        self.result_status("/api/fs/result", &request_id, &auth_token, |data| {
                            data.result_img_url.clone()
                        })
                    })
                    .await?
                }
            }
            TaskKind::ImageEnhance => {
                self.upload(&target_urls.put, target_bytes, &target_content_type)
                    .await?;
                let request_id = self
                    .submit_enhance(&target_urls.get, &auth_token)
                    .await?;
                info!(job_id = %request_id, "enhance task submitted");
                poll_until(&self.config.enhance_poll, cancel, || {
                    self.result_status("/api/ie/result", &request_id, &auth_token, |data| {
                        data.output.clone()
                    })
                })
                .await?
            }
        };

        info!(kind = inputs.kind.as_str(), "remote task complete");
        Ok(output)
    }
}

fn target_upload_meta(inputs: &JobInputs) -> (String, String) {
    match inputs.kind {
        TaskKind::VideoSwap => ("mp4".to_string(), "video/mp4".to_string()),
        TaskKind::PhotoSwap | TaskKind::ImageEnhance => {
            let ext = inputs
                .target
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png")
                .to_string();
            let content_type = format!("image/{ext}");
            (ext, content_type)
        }
    }
}

async fn read_blob(path: &std::path::Path) -> Result<Vec<u8>, SwapError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| SwapError::Upload(format!("failed to read input blob: {e}")))
}
