//! Explicitly-owned audio playback resource.
//!
//! Synthesized agent speech reaches the playback thread only through a
//! bounded queue — never shared mutable state. The session owns the
//! `AudioSession` and releases it on close; playback of in-flight audio is
//! cancelled by bumping the generation, which marks queued chunks stale.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;

/// One queued playback chunk. Stale chunks (from before a `stop_playback`)
/// are dropped by the consumer.
#[derive(Debug)]
pub struct PlaybackChunk {
    pub pcm: Vec<u8>,
    pub generation: u64,
}

/// Scoped playback resource injected into the bridge.
pub struct AudioSession {
    tx: Mutex<Option<mpsc::Sender<PlaybackChunk>>>,
    generation: AtomicU64,
    speaking: AtomicBool,
}

impl AudioSession {
    /// Create the session and hand the receiver to the playback consumer.
    pub fn new(buffer: usize) -> (std::sync::Arc<Self>, mpsc::Receiver<PlaybackChunk>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            std::sync::Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                generation: AtomicU64::new(0),
                speaking: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Queue a chunk for playback. Returns false if the session is released
    /// or the queue is full (the chunk is dropped, not awaited on).
    pub fn enqueue(&self, pcm: Vec<u8>) -> bool {
        let guard = self.tx.lock().expect("audio sender lock");
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        let chunk = PlaybackChunk {
            pcm,
            generation: self.generation.load(Ordering::SeqCst),
        };
        match tx.try_send(chunk) {
            Ok(()) => {
                self.speaking.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => {
                tracing::warn!("Playback queue full; dropping audio chunk");
                false
            }
        }
    }

    /// Whether a chunk is still current. The playback consumer drops stale
    /// chunks instead of playing them.
    pub fn is_current(&self, chunk: &PlaybackChunk) -> bool {
        chunk.generation == self.generation.load(Ordering::SeqCst)
    }

    /// Whether the agent-speaking indicator is on.
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Called by the consumer when the queue drains.
    pub fn mark_idle(&self) {
        self.speaking.store(false, Ordering::SeqCst);
    }

    /// Cancel in-flight playback and clear the speaking indicator. Chunks
    /// already queued become stale and are skipped by the consumer.
    pub fn stop_playback(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.speaking.store(false, Ordering::SeqCst);
    }

    /// Release the playback queue. Idempotent; the consumer sees the channel
    /// close once any remaining (stale) chunks are drained.
    pub fn release(&self) {
        self.stop_playback();
        self.tx.lock().expect("audio sender lock").take();
    }

    pub fn is_released(&self) -> bool {
        self.tx.lock().expect("audio sender lock").is_none()
    }
}
