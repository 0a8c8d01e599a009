//! External heart-rate belt.
//!
//! A belt is bridged by an ordinary session on [`HEART_RATE_BELT`]; its heart rate is then
//! forwarded into the equipment session as [`HeartRateSource::Belt`] samples.

use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    device::{SessionBuilder, SessionHandle},
    profile::HEART_RATE_BELT,
    transport::Transport,
    types::{BridgeSettings, HeartRateSample, HeartRateSource, MetricSet},
};

/// Session builder for the belt named in `settings`
///
/// `transport` must be dedicated to the belt: a transport carries a single link, and
/// sharing the equipment's transport would disconnect the equipment.
///
/// Returns `None` while no belt is configured.
#[must_use]
pub fn belt_session(transport: Arc<dyn Transport>, settings: &BridgeSettings) -> Option<SessionBuilder> {
    if !settings.heart_rate_belt_configured() {
        return None;
    }
    info!("Heart rate belt configured: {}", settings.heart_rate_belt_name);
    Some(
        SessionBuilder::new(&HEART_RATE_BELT, transport)
            .settings(settings.clone())
            .name_filter([settings.heart_rate_belt_name.clone()]),
    )
}

/// Forward every new belt reading into `equipment`
///
/// The task ends when either session goes away.
#[must_use]
pub fn forward_heart_rate(belt: &SessionHandle, equipment: &SessionHandle) -> JoinHandle<()> {
    spawn_feed(belt.subscribe_metrics(), equipment.heart_rate_input())
}

fn spawn_feed(
    mut readings: tokio::sync::watch::Receiver<MetricSet>,
    samples: mpsc::UnboundedSender<HeartRateSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = 0;
        while readings.changed().await.is_ok() {
            let bpm = readings.borrow_and_update().heart_rate_bpm;
            if bpm == 0 || bpm == last {
                continue;
            }
            last = bpm;
            debug!("Belt heart rate {} bpm", bpm);
            let sample = HeartRateSample {
                source: HeartRateSource::Belt,
                bpm,
            };
            if samples.send(sample).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{profile::SPORTSTECH_BIKE, transport::mock::MockTransport, types::SessionState};
    use std::time::Duration;
    use tokio::{sync::watch, time::sleep};

    #[test]
    fn test_no_belt_without_configuration() {
        let mock = Arc::new(MockTransport::for_profile(&HEART_RATE_BELT, "Polar H10"));
        assert!(belt_session(mock, &BridgeSettings::default()).is_none());
    }

    #[tokio::test]
    async fn test_feed_forwards_changes_only() {
        let (tx, rx) = watch::channel(MetricSet::default());
        let (samples_tx, mut samples_rx) = mpsc::unbounded_channel();
        let feed = spawn_feed(rx, samples_tx);

        for bpm in [0, 120, 120, 125] {
            tx.send_replace(MetricSet {
                heart_rate_bpm: bpm,
                ..MetricSet::default()
            });
            tokio::task::yield_now().await;
            sleep(Duration::from_millis(5)).await;
        }
        drop(tx);
        feed.await.unwrap();

        let mut received = Vec::new();
        while let Ok(sample) = samples_rx.try_recv() {
            assert_eq!(sample.source, HeartRateSource::Belt);
            received.push(sample.bpm);
        }
        assert_eq!(received, vec![120, 125]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_belt_session_feeds_equipment() {
        let settings = BridgeSettings {
            heart_rate_belt_name: "Polar".to_string(),
            ..BridgeSettings::default()
        };
        let belt_mock = Arc::new(MockTransport::for_profile(&HEART_RATE_BELT, "Polar H10 1A2B"));
        let bike_mock = Arc::new(MockTransport::for_profile(&SPORTSTECH_BIKE, "EW-BK 7"));

        let (belt, belt_handle) = belt_session(belt_mock.clone(), &settings).unwrap().build();
        let (bike, bike_handle) = SessionBuilder::new(&SPORTSTECH_BIKE, bike_mock.clone())
            .settings(settings)
            .build();
        let belt_task = tokio::spawn(belt.run());
        let bike_task = tokio::spawn(bike.run());
        let feed = forward_heart_rate(&belt_handle, &bike_handle);

        belt_handle
            .wait_for_state(SessionState::Ready)
            .await
            .unwrap();
        bike_handle
            .wait_for_state(SessionState::Ready)
            .await
            .unwrap();

        belt_mock.notify(HEART_RATE_BELT.telemetry, &[0x00, 0x8A]);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(belt_handle.metrics().heart_rate_bpm, 138);
        assert_eq!(bike_handle.metrics().heart_rate_bpm, 138);

        // the bike link survives the belt connecting next to it
        let mut frame = [0u8; 20];
        frame[13] = 0xC8;
        assert!(bike_mock.notify(SPORTSTECH_BIKE.telemetry, &frame));
        sleep(Duration::from_millis(500)).await;
        assert!((bike_handle.metrics().speed_kmh - 20.0).abs() < f64::EPSILON);
        assert!(bike_mock.is_connected());
        assert!(belt_mock.is_connected());
        assert_eq!(bike_handle.state(), SessionState::Ready);

        belt_handle.shutdown();
        bike_handle.shutdown();
        belt_task.await.unwrap().unwrap();
        bike_task.await.unwrap().unwrap();
        feed.abort();
    }
}
