//! Lock-free SPSC ring buffer between the hardware callback and the drain
//! thread.
//!
//! Uses `ringbuf::HeapRb<f32>` whose wait-free `push_slice` is safe to call
//! from the real-time audio callback. The drain thread is the only consumer.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half — held by the audio callback thread.
pub type CaptureProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by the drain thread.
pub type CaptureConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^21 = 2 097 152 f32 samples ≈ 43.7 s at 48 kHz.
/// Enough to ride out a stalled consumer without the callback dropping audio.
pub const RING_CAPACITY: usize = 1 << 21;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_capture_ring() -> (CaptureProducer, CaptureConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
