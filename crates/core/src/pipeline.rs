//! Per-device fan-out broker (§4.4): bounded, non-blocking pub/sub for video
//! and audio samples plus the SPS/PPS parameter-set cache. A single
//! `RwLock` guards the subscriber maps — publish takes the read side,
//! subscribe/unsubscribe take the write side, matching the lock-ordering
//! discipline in §5/§9 (Registry → Source → Pipeline).

use scrcpy_protocol::{AudioSample, VideoSample};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

pub type VideoReceiver = mpsc::Receiver<VideoSample>;
pub type AudioReceiver = mpsc::Receiver<AudioSample>;

struct VideoSubscriber {
    tx: mpsc::Sender<VideoSample>,
    dropped: Arc<AtomicU64>,
}

struct AudioSubscriber {
    tx: mpsc::Sender<AudioSample>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct SpsPpsCache {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

/// Per-device pub/sub broker. One instance per running `Source`.
pub struct Pipeline {
    video_subs: RwLock<HashMap<u64, VideoSubscriber>>,
    audio_subs: RwLock<HashMap<u64, AudioSubscriber>>,
    sps_pps: RwLock<SpsPpsCache>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            video_subs: RwLock::new(HashMap::new()),
            audio_subs: RwLock::new(HashMap::new()),
            sps_pps: RwLock::new(SpsPpsCache::default()),
        }
    }

    pub async fn subscribe_video(&self, id: u64, buffer_size: usize) -> VideoReceiver {
        let (tx, rx) = mpsc::channel(buffer_size);
        let mut subs = self.video_subs.write().await;
        subs.insert(
            id,
            VideoSubscriber {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        );
        debug!(subscriber_id = id, "video subscriber added");
        rx
    }

    pub async fn unsubscribe_video(&self, id: u64) {
        let mut subs = self.video_subs.write().await;
        // Dropping the sender closes the channel exactly once; only the
        // Pipeline ever does this (§3 invariant, §9 design note).
        subs.remove(&id);
        debug!(subscriber_id = id, "video subscriber removed");
    }

    pub async fn subscribe_audio(&self, id: u64, buffer_size: usize) -> AudioReceiver {
        let (tx, rx) = mpsc::channel(buffer_size);
        let mut subs = self.audio_subs.write().await;
        subs.insert(
            id,
            AudioSubscriber {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        );
        debug!(subscriber_id = id, "audio subscriber added");
        rx
    }

    pub async fn unsubscribe_audio(&self, id: u64) {
        let mut subs = self.audio_subs.write().await;
        subs.remove(&id);
        debug!(subscriber_id = id, "audio subscriber removed");
    }

    /// Non-blocking: a full subscriber channel drops this sample for that
    /// subscriber only and bumps its drop counter (§4.4, §8 property 2).
    pub async fn publish_video(&self, sample: VideoSample) {
        let subs = self.video_subs.read().await;
        for (id, sub) in subs.iter() {
            match sub.tx.try_send(sample.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(subscriber_id = id, total_dropped = total, "video subscriber lagging, dropping sample");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Subscriber is mid-unsubscribe; publish must not block or retry.
                }
            }
        }
    }

    pub async fn publish_audio(&self, sample: AudioSample) {
        let subs = self.audio_subs.read().await;
        for (id, sub) in subs.iter() {
            match sub.tx.try_send(sample.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(subscriber_id = id, total_dropped = total, "audio subscriber lagging, dropping sample");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Dropped-sample counter for one video subscriber, exposed for testing (§9).
    pub async fn video_drop_count(&self, id: u64) -> Option<u64> {
        let subs = self.video_subs.read().await;
        subs.get(&id).map(|s| s.dropped.load(Ordering::Relaxed))
    }

    pub async fn cache_sps_pps(&self, sps: Vec<u8>, pps: Vec<u8>) {
        let mut cache = self.sps_pps.write().await;
        cache.sps = Some(sps);
        cache.pps = Some(pps);
    }

    /// Returns the cached `(sps, pps)` pair if one has been published yet.
    pub async fn get_sps_pps(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let cache = self.sps_pps.read().await;
        match (&cache.sps, &cache.pps) {
            (Some(sps), Some(pps)) => Some((sps.clone(), pps.clone())),
            _ => None,
        }
    }

    pub async fn video_subscriber_count(&self) -> usize {
        self.video_subs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pts: u64) -> VideoSample {
        VideoSample {
            data: vec![pts as u8],
            pts,
            keyframe: false,
            config: false,
        }
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers_in_order() {
        let pipeline = Pipeline::new();
        let mut rx = pipeline.subscribe_video(1, 8).await;

        pipeline.publish_video(sample(1)).await;
        pipeline.publish_video(sample(2)).await;
        pipeline.publish_video(sample(3)).await;

        assert_eq!(rx.recv().await.unwrap().pts, 1);
        assert_eq!(rx.recv().await.unwrap().pts, 2);
        assert_eq!(rx.recv().await.unwrap().pts, 3);
    }

    #[tokio::test]
    async fn publish_before_subscribe_is_not_observed() {
        let pipeline = Pipeline::new();
        pipeline.publish_video(sample(1)).await; // no subscribers yet
        let mut rx = pipeline.subscribe_video(1, 8).await;
        pipeline.publish_video(sample(2)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.pts, 2, "must not see sample published before subscribe");
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel_exactly_once() {
        let pipeline = Pipeline::new();
        let mut rx = pipeline.subscribe_video(1, 8).await;
        pipeline.unsubscribe_video(1).await;
        pipeline.unsubscribe_video(1).await; // no-op, must not panic

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_channel_drops_for_that_subscriber_only() {
        let pipeline = Pipeline::new();
        let mut slow_rx = pipeline.subscribe_video(1, 2).await;
        let mut fast_rx = pipeline.subscribe_video(2, 2).await;

        for i in 0..5 {
            pipeline.publish_video(sample(i)).await;
            // Drain the fast subscriber immediately so it never fills up.
            let _ = fast_rx.try_recv();
        }

        assert!(pipeline.video_drop_count(1).await.unwrap() > 0);
        assert_eq!(pipeline.video_drop_count(2).await.unwrap(), 0);

        // The slow subscriber's first two samples are still delivered in order.
        assert_eq!(slow_rx.recv().await.unwrap().pts, 0);
        assert_eq!(slow_rx.recv().await.unwrap().pts, 1);
    }

    #[tokio::test]
    async fn sps_pps_cache_primes_late_joiners() {
        let pipeline = Pipeline::new();
        assert!(pipeline.get_sps_pps().await.is_none());

        pipeline.cache_sps_pps(vec![0x67, 0x42], vec![0x68, 0xCE]).await;
        let (sps, pps) = pipeline.get_sps_pps().await.unwrap();
        assert_eq!(sps, vec![0x67, 0x42]);
        assert_eq!(pps, vec![0x68, 0xCE]);
    }
}
