use log::{info, warn};
use serde::Deserialize;

use crate::conversation::ConversationChannel;
use crate::error::ChatError;
use crate::models::Message;

/// Finalized, immutable voice clip ready for upload.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub duration_ms: u64,
}

/// Seam over the platform capture device. `start` acquires the device
/// exclusively and fails with `PermissionDenied` if the user or OS refuses;
/// `stop` releases it and finalizes whatever was buffered, including after a
/// mid-capture device error (a truncated clip is still a clip).
pub trait AudioCapture {
    fn start(&mut self) -> impl std::future::Future<Output = Result<(), ChatError>> + Send;
    fn stop(&mut self) -> impl std::future::Future<Output = AudioClip> + Send;
}

/// Seam over the media upload endpoint: one clip in, one stable URL out.
pub trait ClipUploader {
    fn upload(
        &self,
        clip: &AudioClip,
    ) -> impl std::future::Future<Output = Result<String, ChatError>> + Send;
}

/// Production uploader: multipart POST, the endpoint answers `{"url": …}`.
#[derive(Clone)]
pub struct HttpClipUploader {
    http: reqwest::Client,
    upload_url: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

impl HttpClipUploader {
    pub fn new(upload_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            upload_url: upload_url.to_string(),
        }
    }
}

impl ClipUploader for HttpClipUploader {
    async fn upload(&self, clip: &AudioClip) -> Result<String, ChatError> {
        let part = reqwest::multipart::Part::bytes(clip.data.clone())
            .file_name("voice-message")
            .mime_str(&clip.mime_type)
            .map_err(|e| ChatError::Upload(format!("bad clip mime type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let response = self
            .http
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::Upload(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChatError::Upload(format!(
                "server returned {}",
                response.status()
            )));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Upload(format!("bad upload response: {}", e)))?;
        Ok(body.url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Capturing,
    /// Holds a finalized clip awaiting send or discard.
    Stopped,
    Uploading,
    Sent,
    /// Upload (or handoff) failed; the clip is retained for a manual resend.
    Failed,
}

/// Local voice-message workflow: capture, finalize, upload, hand the URL to
/// the conversation channel. One session at a time; a start while capturing
/// is rejected, never queued. Upload is a single attempt.
pub struct RecordingPipeline<C, U> {
    capture: C,
    uploader: U,
    state: RecordingState,
    clip: Option<AudioClip>,
}

impl<C: AudioCapture, U: ClipUploader> RecordingPipeline<C, U> {
    pub fn new(capture: C, uploader: U) -> Self {
        Self {
            capture,
            uploader,
            state: RecordingState::Idle,
            clip: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Begin capturing. Legal from any settled state; rejected while a
    /// capture or upload is in flight. Permission denial returns the
    /// pipeline to idle.
    pub async fn start(&mut self) -> Result<(), ChatError> {
        match self.state {
            RecordingState::Capturing => {
                return Err(ChatError::InvalidState(
                    "a recording is already capturing".to_string(),
                ));
            }
            RecordingState::Uploading => {
                return Err(ChatError::InvalidState(
                    "an upload is in flight".to_string(),
                ));
            }
            _ => {}
        }
        self.clip = None;
        match self.capture.start().await {
            Ok(()) => {
                info!("[REC] Capture started");
                self.state = RecordingState::Capturing;
                Ok(())
            }
            Err(e) => {
                warn!("[REC] Capture device refused: {}", e);
                self.state = RecordingState::Idle;
                Err(e)
            }
        }
    }

    /// Finalize the buffered audio into an immutable clip and release the
    /// device.
    pub async fn stop(&mut self) -> Result<(), ChatError> {
        if self.state != RecordingState::Capturing {
            return Err(ChatError::InvalidState("not capturing".to_string()));
        }
        let clip = self.capture.stop().await;
        info!(
            "[REC] Capture stopped: {} bytes, {} ms",
            clip.data.len(),
            clip.duration_ms
        );
        self.clip = Some(clip);
        self.state = RecordingState::Stopped;
        Ok(())
    }

    /// Drop the clip and return to idle.
    pub fn discard(&mut self) -> Result<(), ChatError> {
        match self.state {
            RecordingState::Idle => Ok(()),
            RecordingState::Stopped | RecordingState::Failed | RecordingState::Sent => {
                self.clip = None;
                self.state = RecordingState::Idle;
                info!("[REC] Clip discarded");
                Ok(())
            }
            _ => Err(ChatError::InvalidState(
                "nothing to discard while busy".to_string(),
            )),
        }
    }

    /// Upload the clip (single attempt) and hand the resulting reference to
    /// the conversation as an audio message. On failure the clip stays
    /// resendable; the caller decides whether to retry.
    pub async fn send(
        &mut self,
        conversation: &ConversationChannel,
    ) -> Result<Message, ChatError> {
        match self.state {
            RecordingState::Stopped | RecordingState::Failed => {}
            _ => {
                return Err(ChatError::InvalidState(
                    "no clip ready to send".to_string(),
                ));
            }
        }
        let clip = self
            .clip
            .clone()
            .ok_or_else(|| ChatError::InvalidState("no clip ready to send".to_string()))?;

        self.state = RecordingState::Uploading;
        let url = match self.uploader.upload(&clip).await {
            Ok(url) => url,
            Err(e) => {
                warn!("[REC] Upload failed: {}", e);
                self.state = RecordingState::Failed;
                return Err(e);
            }
        };

        match conversation.send_audio(&url) {
            Ok(message) => {
                info!("[REC] Voice message sent: {}", url);
                self.clip = None;
                self.state = RecordingState::Sent;
                Ok(message)
            }
            Err(e) => {
                // Upload succeeded but the transport refused; keep the clip so
                // the user can resend once reconnected.
                warn!("[REC] Handoff to conversation failed: {}", e);
                self.state = RecordingState::Failed;
                Err(e)
            }
        }
    }
}
