//! Accelerometer sample slot.
//!
//! The sensor side only ever replaces the latest sample and the control
//! loop only ever reads the latest one, so a `watch` channel is all the
//! synchronisation needed.

use crate::domain::control::STANDARD_GRAVITY;
use crate::domain::models::AccelSample;
use tokio::sync::watch;

/// Writer half, owned by whatever produces samples.
#[derive(Debug)]
pub struct SampleFeed {
    sender: watch::Sender<Option<AccelSample>>,
}

impl SampleFeed {
    pub fn publish(&self, sample: AccelSample) {
        self.sender.send_replace(Some(sample));
    }

    /// Publish a phone held level except for the given tilt, in G.
    pub fn publish_tilt(&self, forward_back_g: f32, steer_g: f32) {
        self.publish(AccelSample {
            x: forward_back_g * STANDARD_GRAVITY,
            y: steer_g * STANDARD_GRAVITY,
            z: STANDARD_GRAVITY,
        });
    }
}

/// Reader half: latest sample wins, `None` until the first sample arrives.
#[derive(Debug, Clone)]
pub struct SampleSlot {
    receiver: watch::Receiver<Option<AccelSample>>,
}

impl SampleSlot {
    pub fn latest(&self) -> Option<AccelSample> {
        *self.receiver.borrow()
    }
}

pub fn sample_channel() -> (SampleFeed, SampleSlot) {
    let (sender, receiver) = watch::channel(None);
    (SampleFeed { sender }, SampleSlot { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_sample_wins() {
        let (feed, slot) = sample_channel();
        assert_eq!(slot.latest(), None);

        feed.publish(AccelSample {
            x: 1.0,
            y: 2.0,
            z: 3.0,
        });
        feed.publish_tilt(0.5, -0.25);

        let sample = slot.latest().unwrap();
        assert!((sample.x - 4.9).abs() < 1e-5);
        assert!((sample.y + 2.45).abs() < 1e-5);
        assert_eq!(sample.z, STANDARD_GRAVITY);
    }
}
