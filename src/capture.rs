use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::TransportError;

/// One already-encoded frame handed over by the external encoder.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Produces a live local stream.  Each peer connection opens its own.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MediaStream>, TransportError>;
}

pub trait MediaStream: Send + Sync {
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>>;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

// ─── SampleCapture ──────────────────────────────────────────────────────────

/// Capture source fed by a broadcast of encoded frames.
///
/// Every `open()` creates a fresh sample track and a pump task that writes
/// frames into it until the stream is stopped.
pub struct SampleCapture {
    frames: broadcast::Sender<EncodedFrame>,
    codec: RTCRtpCodecCapability,
    kind: &'static str,
}

impl SampleCapture {
    pub fn vp8() -> Self {
        let (frames, _) = broadcast::channel(256);
        Self {
            frames,
            codec: RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            kind: "video",
        }
    }

    /// Feed one frame to every open stream.  Returns how many received it.
    pub fn push(&self, frame: EncodedFrame) -> usize {
        self.frames.send(frame).unwrap_or(0)
    }

    pub fn open_streams(&self) -> usize {
        self.frames.receiver_count()
    }
}

#[async_trait]
impl CaptureSource for SampleCapture {
    async fn open(&self) -> Result<Box<dyn MediaStream>, TransportError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            self.codec.clone(),
            self.kind.to_string(),
            "peerwatch".to_string(),
        ));
        let cancel = CancellationToken::new();
        spawn_sample_pump(self.frames.subscribe(), track.clone(), cancel.clone());
        info!(kind = self.kind, mime = %self.codec.mime_type, "capture stream opened");
        Ok(Box::new(SampleStream { track, cancel }))
    }
}

struct SampleStream {
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
}

impl MediaStream for SampleStream {
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        vec![self.track.clone()]
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_sample_pump(
    mut rx: broadcast::Receiver<EncodedFrame>,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("capture pump stopped");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(frame) => {
                        let sample = Sample {
                            data: frame.data,
                            duration: frame.duration,
                            ..Default::default()
                        };
                        if let Err(e) = track.write_sample(&sample).await {
                            warn!("write_sample error: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("capture pump lagged, skipped {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn each_open_gets_its_own_video_track() {
        let capture = SampleCapture::vp8();
        let a = capture.open().await.unwrap();
        let b = capture.open().await.unwrap();

        assert_eq!(capture.open_streams(), 2);
        assert_eq!(a.tracks().len(), 1);
        assert_eq!(a.tracks()[0].kind(), RTPCodecType::Video);
        assert_ne!(a.tracks()[0].id(), "");

        let delivered = capture.push(EncodedFrame {
            data: Bytes::from_static(&[0x10, 0x02, 0x00]),
            duration: Duration::from_millis(33),
        });
        assert_eq!(delivered, 2);
        drop(b);
    }

    #[tokio::test]
    async fn stop_ends_the_pump() {
        let capture = SampleCapture::vp8();
        let stream = capture.open().await.unwrap();
        assert!(!stream.is_stopped());

        stream.stop();
        assert!(stream.is_stopped());
        settle().await;
        assert_eq!(capture.open_streams(), 0);
    }
}
